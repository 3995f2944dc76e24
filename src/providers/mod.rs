//! Data providers: random-access, time-ranged message sources
//!
//! A provider is initialized once, then answers `get_messages` for inclusive
//! time ranges and topic sets. Fetching the same range twice returns the same
//! messages, and a range split in two returns the same messages as the whole.
//! These properties let providers be stacked: a [`BagDataProvider`] at the
//! leaves, a [`CombinedDataProvider`] merging sources, a
//! [`ReadAheadDataProvider`] hiding latency, a [`MemoryCacheDataProvider`]
//! keeping blocks of messages resident and an [`RpcDataProvider`] moving the
//! whole subtree onto a worker thread.

pub mod bag;
pub mod combined;
pub mod memory;
pub mod memory_cache;
pub mod read_ahead;
pub mod rpc;

pub use bag::BagDataProvider;
pub use combined::{CombinedDataProvider, PrefixedChild};
pub use memory::MemoryDataProvider;
pub use memory_cache::{BlockCache, MemoryCacheBlock, MemoryCacheDataProvider};
pub use read_ahead::ReadAheadDataProvider;
pub use rpc::{spawn_worker, RpcDataProvider};

use crate::definitions::Datatypes;
use crate::error::Result;
use crate::time::Time;
use crate::types::{Message, Topic};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// What a provider knows after `initialize`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitializationResult {
    /// Time of the first message (inclusive)
    pub start: Time,
    /// Time of the last message (inclusive)
    pub end: Time,
    pub topics: Vec<Topic>,
    pub datatypes: Datatypes,
    /// Whether `get_messages` returns structured payloads instead of raw bytes
    pub provides_parsed_messages: bool,
    /// Message definition text per topic, for topics delivered as raw bytes
    pub message_definitions_by_topic: BTreeMap<String, String>,
}

/// Loading progress as fractions of the provider's time range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Vec<Range<f64>>,
    /// Resident blocks of a memory cache, when there is one below
    #[serde(skip)]
    pub message_cache: Option<BlockCache>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warn,
    Info,
}

/// Out-of-band information from a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderMetadata {
    /// The provider is (or stopped) reconnecting to its source
    UpdateReconnecting { reconnecting: bool },
    /// A user-facing error or warning
    Notification {
        severity: Severity,
        message: String,
        details: String,
    },
}

impl ProviderMetadata {
    pub fn error(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Notification {
            severity: Severity::Error,
            message: message.into(),
            details: details.into(),
        }
    }

    pub fn warn(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Notification {
            severity: Severity::Warn,
            message: message.into(),
            details: details.into(),
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;
pub type MetadataCallback = Arc<dyn Fn(ProviderMetadata) + Send + Sync>;
pub type AddTopicsCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Callbacks a provider may use to report back to its caller
#[derive(Clone)]
pub struct ExtensionPoint {
    pub progress_callback: ProgressCallback,
    pub report_metadata_callback: MetadataCallback,
    /// Topics the consumer will request in addition to the subscribed ones
    pub add_topics_callback: AddTopicsCallback,
}

impl ExtensionPoint {
    /// Extension point that drops everything
    pub fn noop() -> Self {
        Self {
            progress_callback: Arc::new(|_| {}),
            report_metadata_callback: Arc::new(|_| {}),
            add_topics_callback: Arc::new(|_| {}),
        }
    }
}

impl fmt::Debug for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPoint").finish_non_exhaustive()
    }
}

/// A source of time-ordered messages with random access by time range
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Prepare the provider; may only be called once
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult>;

    /// Messages with `start <= receive_time <= end` on any of `topics`,
    /// ordered by receive time
    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>>;

    /// Release resources; in-flight reads are not aborted
    async fn close(&self) -> Result<()>;
}
