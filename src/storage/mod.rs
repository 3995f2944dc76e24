//! Storage backend implementations for ROS2 bag files

use crate::error::Result;
use crate::types::{Connection, StoragePlugin};
use async_trait::async_trait;
use std::path::Path;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "mcap")]
pub mod mcap;

/// One serialized message as stored in the bag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// ID of the connection it was recorded on
    pub connection_id: u32,
    /// Receive time in nanoseconds since epoch
    pub timestamp: u64,
    /// Serialized (possibly compressed) payload
    pub data: Vec<u8>,
}

/// How many storage chunks start before an earlier chunk ends
///
/// A time-window read has to decode every chunk overlapping the window, so
/// overlapping chunks make reads slower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkOverlap {
    pub overlapping: usize,
    pub total: usize,
}

impl ChunkOverlap {
    /// More than a quarter of the chunks overlap
    pub fn is_unsorted(&self) -> bool {
        self.overlapping * 4 > self.total
    }

    pub fn combine(self, other: ChunkOverlap) -> ChunkOverlap {
        ChunkOverlap {
            overlapping: self.overlapping + other.overlapping,
            total: self.total + other.total,
        }
    }
}

/// Trait for storage backend implementations
///
/// Readers are opened on construction. Connections are read once and never
/// change afterwards.
pub trait StorageReader: Send {
    /// Connections found in the storage
    fn connections(&self) -> &[Connection];

    /// Earliest and latest message timestamps, `None` if there are no messages
    fn time_range(&self) -> Result<Option<(u64, u64)>>;

    /// Records on `connection_ids` with `start <= timestamp <= end`, sorted by timestamp
    fn messages(&self, connection_ids: &[u32], start: u64, end: u64) -> Result<Vec<RawRecord>>;

    /// Chunk layout of the storage; unchunked storage never overlaps
    fn chunk_overlap(&self) -> ChunkOverlap {
        ChunkOverlap::default()
    }

    /// Release file handles
    fn close(&mut self) -> Result<()>;
}

/// A storage reader whose reads wait on I/O, such as a file behind a range cache
#[async_trait]
pub trait AsyncStorageReader: Send + Sync {
    fn connections(&self) -> &[Connection];

    fn time_range(&self) -> Option<(u64, u64)>;

    fn chunk_overlap(&self) -> ChunkOverlap {
        ChunkOverlap::default()
    }

    /// Same contract as [`StorageReader::messages`]
    async fn messages(&self, connection_ids: &[u32], start: u64, end: u64) -> Result<Vec<RawRecord>>;
}

/// Open a storage reader for the given storage plugin
pub fn open_storage_reader(plugin: StoragePlugin, paths: &[&Path]) -> Result<Box<dyn StorageReader>> {
    match plugin {
        #[cfg(feature = "sqlite")]
        StoragePlugin::Sqlite3 => Ok(Box::new(sqlite::SqliteReader::open(paths)?)),
        #[cfg(not(feature = "sqlite"))]
        StoragePlugin::Sqlite3 => Err(crate::error::PlaybackError::UnsupportedStorageFormat {
            format: "sqlite3 (feature not enabled)".to_string(),
        }),
        #[cfg(feature = "mcap")]
        StoragePlugin::Mcap => Ok(Box::new(mcap::McapStorageReader::open(paths)?)),
        #[cfg(not(feature = "mcap"))]
        StoragePlugin::Mcap => Err(crate::error::PlaybackError::UnsupportedStorageFormat {
            format: "mcap (feature not enabled)".to_string(),
        }),
    }
}

/// Merge per-file record lists into one list ordered by timestamp
///
/// The sort is stable so records from earlier files win ties.
pub(crate) fn merge_sorted(mut per_file: Vec<Vec<RawRecord>>) -> Vec<RawRecord> {
    if per_file.len() == 1 {
        return per_file.pop().unwrap_or_default();
    }
    let mut all: Vec<RawRecord> = per_file.into_iter().flatten().collect();
    all.sort_by_key(|record| record.timestamp);
    all
}
