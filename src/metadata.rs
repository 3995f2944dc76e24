//! Metadata parsing for ROS2 bag directories

use crate::error::{PlaybackError, Result};
use crate::types::{CompressionMode, StoragePlugin};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Newest `rosbag2_bagfile_information.version` understood
pub const MAX_SUPPORTED_VERSION: u32 = 9;

/// Complete bag metadata structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagMetadata {
    pub rosbag2_bagfile_information: BagFileInformation,
}

/// Main bag file information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagFileInformation {
    /// Bag format version
    pub version: u32,
    /// Storage plugin identifier ("sqlite3", "mcap", or empty)
    #[serde(default)]
    pub storage_identifier: String,
    /// Relative paths to storage files
    pub relative_file_paths: Vec<String>,
    pub duration: Nanoseconds,
    pub starting_time: NanosecondsSinceEpoch,
    /// Total message count
    pub message_count: u64,
    /// Compression format (e.g., "zstd", empty string for none)
    #[serde(default)]
    pub compression_format: String,
    /// Compression mode ("FILE", "MESSAGE", empty string for none)
    #[serde(default)]
    pub compression_mode: String,
    pub topics_with_message_count: Vec<TopicWithMessageCount>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Nanoseconds {
    pub nanoseconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NanosecondsSinceEpoch {
    pub nanoseconds_since_epoch: u64,
}

/// Topic information with message count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicWithMessageCount {
    pub message_count: u64,
    pub topic_metadata: TopicMetadata,
}

/// Metadata for a single topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMetadata {
    /// Topic name (e.g., "/camera/image_raw")
    pub name: String,
    /// Message type (e.g., "sensor_msgs/msg/Image")
    #[serde(rename = "type")]
    pub message_type: String,
    /// Serialization format (typically "cdr")
    pub serialization_format: String,
    /// QoS profiles; a YAML string in older versions, a list in newer ones
    #[serde(default)]
    pub offered_qos_profiles: Option<serde_yml::Value>,
    /// Type description hash (version 7+)
    #[serde(default)]
    pub type_description_hash: String,
}

impl BagMetadata {
    /// Load metadata from a metadata.yaml file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|_| PlaybackError::MetadataNotFound {
                path: path.to_path_buf(),
            })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate metadata text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let metadata: BagMetadata = serde_yml::from_str(content)?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Validate the metadata structure
    pub fn validate(&self) -> Result<()> {
        let info = &self.rosbag2_bagfile_information;

        if info.version > MAX_SUPPORTED_VERSION {
            return Err(PlaybackError::UnsupportedVersion {
                version: info.version,
            });
        }

        self.storage_plugin()?;

        if self.compression_mode().is_none() {
            return Err(PlaybackError::UnsupportedCompressionFormat {
                format: format!("mode {}", info.compression_mode),
            });
        }

        for topic in &info.topics_with_message_count {
            let format = &topic.topic_metadata.serialization_format;
            if format != "cdr" {
                return Err(PlaybackError::UnsupportedSerializationFormat {
                    format: format.clone(),
                });
            }
        }

        Ok(())
    }

    /// Get the bag file information
    pub fn info(&self) -> &BagFileInformation {
        &self.rosbag2_bagfile_information
    }

    /// Storage plugin, detected from file extensions when the identifier is empty
    pub fn storage_plugin(&self) -> Result<StoragePlugin> {
        let info = self.info();
        match info.storage_identifier.as_str() {
            "sqlite3" => Ok(StoragePlugin::Sqlite3),
            "mcap" => Ok(StoragePlugin::Mcap),
            "" => {
                let paths = &info.relative_file_paths;
                if paths.iter().any(|path| path.ends_with(".db3")) {
                    Ok(StoragePlugin::Sqlite3)
                } else if paths.iter().any(|path| path.ends_with(".mcap")) {
                    Ok(StoragePlugin::Mcap)
                } else {
                    Err(PlaybackError::UnsupportedStorageFormat {
                        format: "unknown (no .db3 or .mcap files found)".to_string(),
                    })
                }
            }
            other => Err(PlaybackError::UnsupportedStorageFormat {
                format: other.to_string(),
            }),
        }
    }

    /// Compression mode, `None` if the field holds an unknown value
    pub fn compression_mode(&self) -> Option<CompressionMode> {
        let info = self.info();
        if info.compression_format.is_empty() {
            return Some(CompressionMode::None);
        }
        CompressionMode::from_metadata(&info.compression_mode)
    }

    /// Compression format name, `None` when uncompressed
    pub fn compression_format(&self) -> Option<&str> {
        let format = self.info().compression_format.as_str();
        (!format.is_empty()).then_some(format)
    }

    /// Get the start time in nanoseconds since epoch
    pub fn start_time(&self) -> u64 {
        self.info().starting_time.nanoseconds_since_epoch
    }

    /// Get the end time in nanoseconds since epoch
    pub fn end_time(&self) -> u64 {
        self.start_time() + self.info().duration.nanoseconds
    }

    /// Get the total message count
    pub fn message_count(&self) -> u64 {
        self.info().message_count
    }
}
