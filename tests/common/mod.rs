//! Bag fixtures written on the fly
//!
//! Bags are ROS2 sqlite3 directories at schema version 4, so message
//! definitions travel with the bag and payloads can be decoded.

#![allow(dead_code)]

use rosbags_playback::{Payload, Message};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const STRING_TYPE: &str = "std_msgs/msg/String";
pub const INT32_TYPE: &str = "std_msgs/msg/Int32";

pub const SEC: u64 = 1_000_000_000;

/// CDR little-endian `std_msgs/String`
pub fn cdr_string(text: &str) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x01, 0x00, 0x00];
    bytes.extend_from_slice(&(text.len() as u32 + 1).to_le_bytes());
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

/// CDR little-endian `std_msgs/Int32`
pub fn cdr_int32(value: i32) -> Vec<u8> {
    let mut bytes = vec![0x00, 0x01, 0x00, 0x00];
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes
}

pub fn raw_bytes(message: &Message) -> &[u8] {
    match &message.payload {
        Payload::Raw(bytes) => bytes,
        other => panic!("expected a raw payload, got {other:?}"),
    }
}

struct FixtureTopic {
    name: String,
    datatype: String,
    definition: String,
}

/// Builder for a sqlite3 bag directory
pub struct BagFixture {
    topics: Vec<FixtureTopic>,
    messages: Vec<(usize, u64, Vec<u8>)>,
    zstd: bool,
}

impl Default for BagFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl BagFixture {
    pub fn new() -> Self {
        Self {
            topics: Vec::new(),
            messages: Vec::new(),
            zstd: false,
        }
    }

    pub fn topic(mut self, name: &str, datatype: &str, definition: &str) -> Self {
        self.topics.push(FixtureTopic {
            name: name.to_string(),
            datatype: datatype.to_string(),
            definition: definition.to_string(),
        });
        self
    }

    pub fn string_topic(self, name: &str) -> Self {
        self.topic(name, STRING_TYPE, "string data")
    }

    pub fn int32_topic(self, name: &str) -> Self {
        self.topic(name, INT32_TYPE, "int32 data")
    }

    /// Add a message on a topic added earlier
    pub fn message(mut self, topic: &str, timestamp: u64, data: Vec<u8>) -> Self {
        let index = self
            .topics
            .iter()
            .position(|t| t.name == topic)
            .unwrap_or_else(|| panic!("unknown fixture topic {topic}"));
        self.messages.push((index, timestamp, data));
        self
    }

    /// Store each payload zstd-compressed (`compression_mode: MESSAGE`)
    pub fn zstd_messages(mut self) -> Self {
        self.zstd = true;
        self
    }

    /// Write the bag into `dir/name`
    pub fn write_into(&self, dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        self.write_database(&path.join("bag_0.db3"));
        std::fs::write(path.join("metadata.yaml"), self.metadata_yaml()).unwrap();
        path
    }

    fn write_database(&self, path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE schema (schema_version INTEGER PRIMARY KEY, ros_distro TEXT NOT NULL);
             CREATE TABLE metadata (id INTEGER PRIMARY KEY, metadata_version INTEGER NOT NULL,
                 metadata TEXT NOT NULL);
             CREATE TABLE topics (id INTEGER PRIMARY KEY, name TEXT NOT NULL, type TEXT NOT NULL,
                 serialization_format TEXT NOT NULL, offered_qos_profiles TEXT NOT NULL,
                 type_description_hash TEXT NOT NULL);
             CREATE TABLE message_definitions (id INTEGER PRIMARY KEY, topic_type TEXT NOT NULL,
                 encoding TEXT NOT NULL, encoded_message_definition TEXT NOT NULL,
                 type_description_hash TEXT NOT NULL);
             CREATE TABLE messages (id INTEGER PRIMARY KEY, topic_id INTEGER NOT NULL,
                 timestamp INTEGER NOT NULL, data BLOB NOT NULL);
             INSERT INTO schema VALUES (4, 'humble');",
        )
        .unwrap();

        for (index, topic) in self.topics.iter().enumerate() {
            conn.execute(
                "INSERT INTO topics VALUES (?1, ?2, ?3, 'cdr', '', '')",
                rusqlite::params![index as i64 + 1, topic.name, topic.datatype],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO message_definitions VALUES (?1, ?2, 'ros2msg', ?3, '')",
                rusqlite::params![index as i64 + 1, topic.datatype, topic.definition],
            )
            .unwrap();
        }

        for (index, timestamp, data) in &self.messages {
            let data = if self.zstd {
                zstd::encode_all(data.as_slice(), 3).unwrap()
            } else {
                data.clone()
            };
            conn.execute(
                "INSERT INTO messages (topic_id, timestamp, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![*index as i64 + 1, *timestamp as i64, data],
            )
            .unwrap();
        }
    }

    fn metadata_yaml(&self) -> String {
        let start = self.messages.iter().map(|(_, t, _)| *t).min().unwrap_or(0);
        let end = self.messages.iter().map(|(_, t, _)| *t).max().unwrap_or(0);
        let (format, mode) = if self.zstd { ("zstd", "MESSAGE") } else { ("", "") };

        let mut yaml = format!(
            r#"rosbag2_bagfile_information:
  version: 5
  storage_identifier: sqlite3
  relative_file_paths:
    - bag_0.db3
  duration:
    nanoseconds: {duration}
  starting_time:
    nanoseconds_since_epoch: {start}
  message_count: {count}
  compression_format: "{format}"
  compression_mode: "{mode}"
  topics_with_message_count:
"#,
            duration = end - start,
            count = self.messages.len(),
        );
        if self.topics.is_empty() {
            yaml.push_str("    []\n");
        }
        for (index, topic) in self.topics.iter().enumerate() {
            let count = self.messages.iter().filter(|(i, _, _)| *i == index).count();
            yaml.push_str(&format!(
                "    - message_count: {count}\n      topic_metadata:\n        name: {}\n        type: {}\n        serialization_format: cdr\n        offered_qos_profiles: \"\"\n",
                topic.name, topic.datatype
            ));
        }
        yaml
    }
}
