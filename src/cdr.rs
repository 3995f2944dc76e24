//! CDR (Common Data Representation) deserialization for ROS2 messages
//!
//! [`CdrDeserializer`] reads primitives with CDR alignment and endianness.
//! [`MessageReader`] walks a [`Datatypes`] dictionary to decode a whole
//! message into a [`MessageValue`].

use crate::definitions::{Datatypes, RosField};
use crate::error::{PlaybackError, Result};
use crate::time::Time;
use crate::types::MessageValue;
use std::convert::TryInto;
use std::sync::Arc;

/// Size of the encapsulation header; alignment is relative to its end
const HEADER_LEN: usize = 4;

/// CDR header information
#[derive(Debug, Clone, Copy)]
pub struct CdrHeader {
    pub endianness: Endianness,
    pub encapsulation_kind: u8,
}

/// Byte order endianness
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Endianness {
    LittleEndian,
    BigEndian,
}

impl CdrHeader {
    /// Parse CDR header from the first 4 bytes
    pub fn parse(header_bytes: &[u8]) -> Result<Self> {
        if header_bytes.len() != HEADER_LEN {
            return Err(PlaybackError::cdr_deserialization(
                "CDR header must be exactly 4 bytes",
                0,
                header_bytes.len(),
            ));
        }

        // Byte 1 is the endianness flag, byte 2 the encapsulation kind
        let endianness = match header_bytes[1] {
            0 => Endianness::BigEndian,
            1 => Endianness::LittleEndian,
            _ => {
                return Err(PlaybackError::cdr_deserialization(
                    "Invalid CDR endianness flag",
                    1,
                    header_bytes.len(),
                ))
            }
        };

        Ok(Self {
            endianness,
            encapsulation_kind: header_bytes[2],
        })
    }
}

/// CDR deserializer for reading binary message data
pub struct CdrDeserializer<'a> {
    data: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> CdrDeserializer<'a> {
    /// Create a new CDR deserializer from raw message data
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(PlaybackError::cdr_deserialization(
                "CDR data too short for header",
                0,
                data.len(),
            ));
        }
        let header = CdrHeader::parse(&data[..HEADER_LEN])?;

        Ok(Self {
            data,
            pos: HEADER_LEN,
            endianness: header.endianness,
        })
    }

    /// Get current position in the data
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the current position
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn align(&mut self, alignment: usize) {
        let offset = (self.pos - HEADER_LEN) % alignment;
        if offset != 0 {
            self.pos += alignment - offset;
        }
    }

    fn error(&self, message: impl Into<String>) -> PlaybackError {
        PlaybackError::cdr_deserialization(message, self.pos, self.data.len())
    }

    fn take(&mut self, size: usize) -> Result<&'a [u8]> {
        if self.pos + size > self.data.len() {
            return Err(self.error(format!("CDR data truncated: need {size} bytes")));
        }
        let bytes = &self.data[self.pos..self.pos + size];
        self.pos += size;
        Ok(bytes)
    }

    fn read_primitive<T, const N: usize>(&mut self) -> Result<T>
    where
        T: FromBytes<Bytes = [u8; N]>,
    {
        self.align(N);
        let bytes: [u8; N] = self
            .take(N)?
            .try_into()
            .map_err(|_| self.error("Invalid primitive width"))?;
        Ok(T::from_bytes(bytes, self.endianness))
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.read_primitive::<u16, 2>()
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.read_primitive::<i16, 2>()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_primitive::<u32, 4>()
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_primitive::<i32, 4>()
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_primitive::<u64, 8>()
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_primitive::<i64, 8>()
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_primitive::<f32, 4>()
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_primitive::<f64, 8>()
    }

    /// Read a string value (u32 length including the null terminator)
    pub fn read_string(&mut self) -> Result<String> {
        let length = self.read_u32()? as usize;
        if length == 0 {
            return Ok(String::new());
        }
        let bytes = self.take(length)?;
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);

        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("Invalid UTF-8 in CDR string"))
    }

    /// Read a wide string (u32 length in UTF-16 code units)
    pub fn read_wstring(&mut self) -> Result<String> {
        let length = self.read_u32()? as usize;
        if length.saturating_mul(2) > self.remaining() {
            return Err(self.error(format!("Wide string length {length} exceeds remaining data")));
        }
        let mut units = Vec::with_capacity(length);
        for _ in 0..length {
            units.push(self.read_u16()?);
        }
        Ok(String::from_utf16_lossy(&units))
    }

    /// Read `length` raw bytes
    pub fn read_bytes(&mut self, length: usize) -> Result<Vec<u8>> {
        Ok(self.take(length)?.to_vec())
    }

    /// Read a sequence (variable-length array) of elements
    pub fn read_sequence<T, F>(&mut self, mut read_element: F) -> Result<Vec<T>>
    where
        F: FnMut(&mut Self) -> Result<T>,
    {
        let length = self.read_u32()? as usize;
        // Every element takes at least one byte
        if length > self.remaining() {
            return Err(self.error(format!("Sequence length {length} exceeds remaining data")));
        }
        let mut vec = Vec::with_capacity(length);
        for _ in 0..length {
            vec.push(read_element(self)?);
        }
        Ok(vec)
    }
}

/// Converting fixed-width bytes to primitives with endianness handling
trait FromBytes: Sized {
    type Bytes;
    fn from_bytes(bytes: Self::Bytes, endianness: Endianness) -> Self;
}

macro_rules! impl_from_bytes {
    ($($ty:ty => $n:literal),* $(,)?) => {
        $(
            impl FromBytes for $ty {
                type Bytes = [u8; $n];
                fn from_bytes(bytes: [u8; $n], endianness: Endianness) -> Self {
                    match endianness {
                        Endianness::LittleEndian => <$ty>::from_le_bytes(bytes),
                        Endianness::BigEndian => <$ty>::from_be_bytes(bytes),
                    }
                }
            }
        )*
    };
}

impl_from_bytes!(
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4, f32 => 4,
    u64 => 8, i64 => 8, f64 => 8,
);

/// Decodes serialized messages of one datatype into structured values
#[derive(Debug, Clone)]
pub struct MessageReader {
    datatype: String,
    datatypes: Arc<Datatypes>,
}

impl MessageReader {
    /// Create a reader for `datatype`, which must be present in `datatypes`
    pub fn new(datatype: &str, datatypes: &Arc<Datatypes>) -> Result<Self> {
        if !datatypes.contains_key(datatype) {
            return Err(PlaybackError::message_type_not_found(datatype));
        }
        Ok(Self {
            datatype: datatype.to_string(),
            datatypes: Arc::clone(datatypes),
        })
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    /// Decode one CDR-encoded message
    pub fn read(&self, data: &[u8]) -> Result<MessageValue> {
        let mut cdr = CdrDeserializer::new(data)?;
        self.read_complex(&mut cdr, &self.datatype)
    }

    fn read_complex(&self, cdr: &mut CdrDeserializer<'_>, type_name: &str) -> Result<MessageValue> {
        if is_time_type(type_name) {
            let sec = cdr.read_i32()?;
            let nsec = cdr.read_u32()?;
            return Ok(MessageValue::Time(Time::new(sec as i64, nsec as i64)));
        }

        let datatype = self
            .datatypes
            .get(type_name)
            .ok_or_else(|| PlaybackError::message_type_not_found(type_name))?;

        let mut fields = Vec::with_capacity(datatype.fields.len());
        for field in datatype.data_fields() {
            let value = self.read_field(cdr, field)?;
            fields.push((field.name.clone(), value));
        }
        Ok(MessageValue::Struct(fields))
    }

    fn read_field(&self, cdr: &mut CdrDeserializer<'_>, field: &RosField) -> Result<MessageValue> {
        if !field.is_array {
            return self.read_element(cdr, field);
        }

        let length = match field.array_length {
            Some(length) => length,
            None => cdr.read_u32()? as usize,
        };
        if length > cdr.remaining() {
            return Err(cdr.error(format!("Array {} length {length} exceeds data", field.name)));
        }
        if matches!(field.field_type.as_str(), "uint8" | "byte") {
            return Ok(MessageValue::Bytes(cdr.read_bytes(length)?));
        }

        let mut items = Vec::with_capacity(length);
        for _ in 0..length {
            items.push(self.read_element(cdr, field)?);
        }
        Ok(MessageValue::Array(items))
    }

    fn read_element(&self, cdr: &mut CdrDeserializer<'_>, field: &RosField) -> Result<MessageValue> {
        if field.is_complex {
            return self.read_complex(cdr, &field.field_type);
        }

        let value = match field.field_type.as_str() {
            "bool" => MessageValue::Bool(cdr.read_bool()?),
            "byte" | "char" | "uint8" => MessageValue::UInt(cdr.read_u8()? as u64),
            "int8" => MessageValue::Int(cdr.read_i8()? as i64),
            "uint16" => MessageValue::UInt(cdr.read_u16()? as u64),
            "int16" => MessageValue::Int(cdr.read_i16()? as i64),
            "uint32" => MessageValue::UInt(cdr.read_u32()? as u64),
            "int32" => MessageValue::Int(cdr.read_i32()? as i64),
            "uint64" => MessageValue::UInt(cdr.read_u64()?),
            "int64" => MessageValue::Int(cdr.read_i64()?),
            "float32" => MessageValue::Float(cdr.read_f32()? as f64),
            "float64" => MessageValue::Float(cdr.read_f64()?),
            "string" => MessageValue::String(cdr.read_string()?),
            "wstring" => MessageValue::String(cdr.read_wstring()?),
            "time" | "duration" => return self.read_complex(cdr, "builtin_interfaces/msg/Time"),
            other => {
                return Err(PlaybackError::invalid_definition(
                    &self.datatype,
                    format!("unknown primitive type {other}"),
                ))
            }
        };
        Ok(value)
    }
}

fn is_time_type(type_name: &str) -> bool {
    matches!(
        type_name,
        "builtin_interfaces/msg/Time" | "builtin_interfaces/msg/Duration"
    )
}
