//! Message definition parsing
//!
//! ROS 2 bags store, per topic type, the `.msg` text of the root type followed by
//! every type it depends on, separated by `===` lines and introduced by a
//! `MSG: package/Type` header. This module turns that text into a [`Datatypes`]
//! dictionary used by the CDR reader and by conflict detection in combined
//! providers.

use crate::error::{PlaybackError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema name → datatype
pub type Datatypes = BTreeMap<String, RosDatatype>;

/// Primitive field types understood by the decoder
pub const PRIMITIVE_TYPES: &[&str] = &[
    "bool", "byte", "char", "int8", "uint8", "int16", "uint16", "int32", "uint32", "int64",
    "uint64", "float32", "float64", "string", "wstring", "time", "duration",
];

/// One field (or constant) of a message definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub is_array: bool,
    /// Fixed array length; `None` for sequences
    #[serde(default)]
    pub array_length: Option<usize>,
    #[serde(default)]
    pub is_complex: bool,
    #[serde(default)]
    pub is_constant: bool,
    /// Constant value as written in the definition
    #[serde(default)]
    pub value: Option<String>,
}

/// A named, field-typed structure
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RosDatatype {
    pub fields: Vec<RosField>,
}

impl RosDatatype {
    /// Fields that occupy space in a serialized message
    pub fn data_fields(&self) -> impl Iterator<Item = &RosField> {
        self.fields.iter().filter(|field| !field.is_constant)
    }
}

/// Whether a type name is a primitive
pub fn is_primitive(type_name: &str) -> bool {
    PRIMITIVE_TYPES.contains(&type_name)
}

/// Normalize a complex type name to `package/msg/Type`
///
/// `context_package` resolves bare names (`Point` inside `geometry_msgs`).
pub fn normalize_type_name(type_name: &str, context_package: Option<&str>) -> String {
    if type_name == "Header" {
        return "std_msgs/msg/Header".to_string();
    }
    let parts: Vec<&str> = type_name.split('/').collect();
    match parts.as_slice() {
        [package, name] => format!("{package}/msg/{name}"),
        [name] => match context_package {
            Some(package) => format!("{package}/msg/{name}"),
            None => (*name).to_string(),
        },
        _ => type_name.to_string(),
    }
}

fn package_of(type_name: &str) -> Option<&str> {
    type_name.split('/').next().filter(|_| type_name.contains('/'))
}

fn is_separator(line: &str) -> bool {
    line.len() >= 3 && line.chars().all(|c| c == '=')
}

/// Parse a full definition (root type plus dependencies)
pub fn parse_message_definition(root_type: &str, text: &str) -> Result<Datatypes> {
    let mut datatypes = Datatypes::new();
    let mut current_name = normalize_type_name(root_type, None);
    let mut current_lines: Vec<&str> = Vec::new();
    let mut expect_header = false;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if is_separator(line) {
            let datatype = parse_section(&current_name, &current_lines)?;
            datatypes.insert(current_name.clone(), datatype);
            current_lines.clear();
            expect_header = true;
            continue;
        }
        if expect_header {
            if let Some(name) = line.strip_prefix("MSG:") {
                current_name = normalize_type_name(name.trim(), None);
                expect_header = false;
            }
            continue;
        }
        current_lines.push(line);
    }
    if !expect_header {
        let datatype = parse_section(&current_name, &current_lines)?;
        datatypes.insert(current_name, datatype);
    }

    add_builtin_datatypes(&mut datatypes);
    Ok(datatypes)
}

fn parse_section(type_name: &str, lines: &[&str]) -> Result<RosDatatype> {
    let package = package_of(type_name);
    let mut fields = Vec::new();

    for line in lines {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        fields.push(parse_field_line(type_name, package, line)?);
    }

    Ok(RosDatatype { fields })
}

fn parse_field_line(type_name: &str, package: Option<&str>, line: &str) -> Result<RosField> {
    let mut split = line.splitn(2, char::is_whitespace);
    let raw_type = split.next().unwrap_or_default();
    let rest = split.next().unwrap_or_default().trim();
    if rest.is_empty() {
        return Err(PlaybackError::invalid_definition(
            type_name,
            format!("malformed line: {line}"),
        ));
    }

    let (base_type, is_array, array_length) = parse_array_suffix(type_name, raw_type)?;
    let base_type = strip_string_bound(base_type);
    let is_complex = !is_primitive(base_type);
    let field_type = if is_complex {
        normalize_type_name(base_type, package)
    } else {
        base_type.to_string()
    };

    // `TYPE NAME=value` declares a constant; constants may contain '#'
    if let Some((name, value)) = rest.split_once('=') {
        let name = name.trim();
        if !name.contains(char::is_whitespace) {
            return Ok(RosField {
                name: name.to_string(),
                field_type,
                is_array,
                array_length,
                is_complex,
                is_constant: true,
                value: Some(strip_comment(value).trim().to_string()),
            });
        }
    }

    let rest = strip_comment(rest);
    let name = rest.split_whitespace().next().unwrap_or_default();
    Ok(RosField {
        name: name.to_string(),
        field_type,
        is_array,
        array_length,
        is_complex,
        is_constant: false,
        value: None,
    })
}

fn strip_comment(text: &str) -> &str {
    text.split('#').next().unwrap_or_default()
}

fn strip_string_bound(base_type: &str) -> &str {
    match base_type.split_once("<=") {
        Some((base, _)) => base,
        None => base_type,
    }
}

fn parse_array_suffix<'a>(type_name: &str, raw: &'a str) -> Result<(&'a str, bool, Option<usize>)> {
    let Some(open) = raw.find('[') else {
        return Ok((raw, false, None));
    };
    let base = &raw[..open];
    let inner = raw[open + 1..].trim_end_matches(']');
    if inner.is_empty() || inner.starts_with("<=") {
        return Ok((base, true, None));
    }
    let length = inner.parse::<usize>().map_err(|_| {
        PlaybackError::invalid_definition(type_name, format!("bad array length in {raw}"))
    })?;
    Ok((base, true, Some(length)))
}

/// Add `builtin_interfaces` types that definitions reference without embedding
pub fn add_builtin_datatypes(datatypes: &mut Datatypes) {
    for name in ["builtin_interfaces/msg/Time", "builtin_interfaces/msg/Duration"] {
        datatypes.entry(name.to_string()).or_insert_with(|| RosDatatype {
            fields: vec![
                primitive_field("sec", "int32"),
                primitive_field("nanosec", "uint32"),
            ],
        });
    }
}

fn primitive_field(name: &str, field_type: &str) -> RosField {
    RosField {
        name: name.to_string(),
        field_type: field_type.to_string(),
        is_array: false,
        array_length: None,
        is_complex: false,
        is_constant: false,
        value: None,
    }
}
