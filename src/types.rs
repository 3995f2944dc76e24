//! Core data types shared by storage, providers and the pipeline

use crate::cdr::MessageReader;
use crate::definitions::Datatypes;
use crate::error::Result;
use crate::time::Time;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A topic offered by a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic {
    /// Topic name as seen by consumers (e.g. "/webviz_bag_2/camera/image_raw")
    pub name: String,
    /// Schema name (e.g. "sensor_msgs/msg/Image")
    pub datatype: String,
    /// Name in the source before a prefix was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_topic: Option<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype: datatype.into(),
            original_topic: None,
        }
    }
}

/// A structured message value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Time(Time),
    /// `uint8[]` / `byte[]` payloads stay as bytes
    Bytes(Vec<u8>),
    Array(Vec<MessageValue>),
    /// Fields in definition order
    Struct(Vec<(String, MessageValue)>),
}

impl MessageValue {
    /// Look up a field of a struct value
    pub fn field(&self, name: &str) -> Option<&MessageValue> {
        match self {
            MessageValue::Struct(fields) => fields
                .iter()
                .find(|(field_name, _)| field_name == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// Approximate in-memory size, used to account for wrapped objects
    pub fn estimated_size(&self) -> usize {
        match self {
            MessageValue::Bool(_) => 1,
            MessageValue::Int(_) | MessageValue::UInt(_) | MessageValue::Float(_) => 8,
            MessageValue::Time(_) => 8,
            MessageValue::String(value) => 4 + value.len(),
            MessageValue::Bytes(bytes) => 4 + bytes.len(),
            MessageValue::Array(items) => 4 + items.iter().map(Self::estimated_size).sum::<usize>(),
            MessageValue::Struct(fields) => fields.iter().map(|(_, v)| v.estimated_size()).sum(),
        }
    }
}

/// A zero-copy view over a serialized message
///
/// Fields are only decoded when the object is deep-parsed.
#[derive(Debug, Clone)]
pub struct BinaryObject {
    datatype: String,
    buffer: Arc<[u8]>,
    datatypes: Arc<Datatypes>,
}

impl BinaryObject {
    pub fn new(datatype: impl Into<String>, buffer: Arc<[u8]>, datatypes: Arc<Datatypes>) -> Self {
        Self {
            datatype: datatype.into(),
            buffer,
            datatypes,
        }
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn buffer(&self) -> &Arc<[u8]> {
        &self.buffer
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Decode every field into a structured value
    pub fn deep_parse(&self) -> Result<MessageValue> {
        MessageReader::new(&self.datatype, &self.datatypes)?.read(&self.buffer)
    }
}

/// A structured value presented through the binary-object interface
#[derive(Debug, Clone)]
pub struct WrappedObject {
    datatype: String,
    value: Arc<MessageValue>,
}

impl WrappedObject {
    pub fn new(datatype: impl Into<String>, value: MessageValue) -> Self {
        Self {
            datatype: datatype.into(),
            value: Arc::new(value),
        }
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn size_in_bytes(&self) -> usize {
        self.value.estimated_size()
    }

    /// The wrapped value; unwrapping never copies
    pub fn deep_parse(&self) -> Arc<MessageValue> {
        Arc::clone(&self.value)
    }
}

/// The body of a message in one of its representations
#[derive(Debug, Clone)]
pub enum Payload {
    /// Serialized bytes as stored in the bag
    Raw(Arc<[u8]>),
    /// Already decoded
    Parsed(Arc<MessageValue>),
    /// Serialized bytes with lazy field access
    Binary(BinaryObject),
    /// Decoded value behind a binary-object facade
    Wrapped(WrappedObject),
}

impl Payload {
    /// Raw payload from owned bytes
    pub fn raw(bytes: Vec<u8>) -> Self {
        Payload::Raw(Arc::from(bytes))
    }

    /// Size used for cache accounting
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Payload::Raw(bytes) => bytes.len(),
            Payload::Parsed(value) => value.estimated_size(),
            Payload::Binary(object) => object.size_in_bytes(),
            Payload::Wrapped(object) => object.size_in_bytes(),
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Payload::Raw(_))
    }
}

/// A message delivered by a provider
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub datatype: String,
    pub receive_time: Time,
    pub payload: Payload,
}

impl Message {
    /// Message with a raw payload
    pub fn raw(
        topic: impl Into<String>,
        datatype: impl Into<String>,
        receive_time: Time,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            topic: topic.into(),
            datatype: datatype.into(),
            receive_time,
            payload: Payload::raw(bytes),
        }
    }

    /// Message with an already structured payload
    pub fn parsed(
        topic: impl Into<String>,
        datatype: impl Into<String>,
        receive_time: Time,
        value: MessageValue,
    ) -> Self {
        Self {
            topic: topic.into(),
            datatype: datatype.into(),
            receive_time,
            payload: Payload::Parsed(Arc::new(value)),
        }
    }
}

/// Represents a connection to a topic in the bag file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Unique connection ID
    pub id: u32,
    /// Topic name (e.g., "/camera/image_raw")
    pub topic: String,
    /// Message type (e.g., "sensor_msgs/msg/Image")
    pub message_type: String,
    /// Message definition (for type information)
    pub message_definition: MessageDefinition,
    /// Serialization format (typically "cdr")
    pub serialization_format: String,
}

impl Connection {
    /// A connection without a topic or type cannot be played
    pub fn is_malformed(&self) -> bool {
        self.topic.is_empty() || self.message_type.is_empty()
    }
}

/// Message definition format and content
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageDefinition {
    /// Format of the definition (MSG, IDL, or None)
    pub format: MessageDefinitionFormat,
    /// The actual definition content
    pub data: String,
}

/// Format of message definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageDefinitionFormat {
    /// No definition available
    #[default]
    None,
    /// ROS message format (.msg files)
    Msg,
    /// Interface Definition Language format
    Idl,
}

impl MessageDefinitionFormat {
    /// Map a storage encoding name ("ros2msg", "ros2idl") to a format
    pub fn from_encoding(encoding: &str) -> Self {
        match encoding {
            "ros2msg" => MessageDefinitionFormat::Msg,
            "ros2idl" => MessageDefinitionFormat::Idl,
            _ => MessageDefinitionFormat::None,
        }
    }
}

/// Compression mode for bag files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// No compression
    None,
    /// Compress individual messages
    Message,
    /// Compress entire file
    File,
}

impl CompressionMode {
    /// Parse the `compression_mode` metadata field (case-insensitive)
    pub fn from_metadata(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "" | "none" => Some(CompressionMode::None),
            "message" => Some(CompressionMode::Message),
            "file" => Some(CompressionMode::File),
            _ => None,
        }
    }
}

/// Storage plugin type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePlugin {
    /// SQLite3 storage
    Sqlite3,
    /// MCAP storage
    Mcap,
}

impl StoragePlugin {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StoragePlugin::Sqlite3 => "sqlite3",
            StoragePlugin::Mcap => "mcap",
        }
    }
}
