//! # rosbags-playback
//!
//! Time-synchronized playback of ROS2 bag files.
//!
//! The crate is a chain of composable data providers feeding a frame pipeline:
//! bags are read at the leaves, several sources are merged by timestamp, reads
//! are prefetched ahead of the playback cursor, optionally moved onto a worker
//! thread, decoded through a bounded cache and finally batched into frames
//! delivered to a store once per display tick.
//!
//! ## Features
//!
//! - **ROS2 bags** in SQLite3 and MCAP storage, with per-message zstd decompression
//! - **Streamed MCAP** through a range-caching reader with reconnect and progress reporting
//! - **Combined sources** with topic prefixes and a stable timestamp merge
//! - **Read-ahead** of the next time window while the current one is served
//! - **Memory cache** of fixed-width time blocks under a byte budget, with background prefetch
//! - **Worker boundary** with request/response correlation and remote error forwarding
//! - **Parsed message cache** memoizing CDR decoding by payload identity
//! - **Frame dispatch** debounced to display refresh, with derived topics computed by nodes
//! - **YAML provider trees** built by a single factory
//!
//! ## Quick Start
//!
//! ### Reading a time window from a bag
//! ```no_run
//! use rosbags_playback::providers::{BagDataProvider, DataProvider, ExtensionPoint};
//! use rosbags_playback::Time;
//!
//! # async fn run() -> rosbags_playback::Result<()> {
//! let provider = BagDataProvider::open_dir("path/to/bag");
//! let info = provider.initialize(ExtensionPoint::noop()).await?;
//!
//! let topics: Vec<String> = info.topics.iter().map(|t| t.name.clone()).collect();
//! let end = info.start.add(Time::from_sec(1)).clamp_to(info.start, info.end);
//! for message in provider.get_messages(info.start, end, &topics).await? {
//!     println!("{} {}", message.receive_time, message.topic);
//! }
//! provider.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Building a provider tree from YAML
//! ```no_run
//! use rosbags_playback::ProviderConfig;
//!
//! # fn main() -> rosbags_playback::Result<()> {
//! let config = ProviderConfig::from_yaml(
//!     r#"
//! type: read_ahead
//! children:
//!   - type: combined
//!     children:
//!       - provider: { type: bag, path: /data/run_1 }
//!       - prefix: /webviz_bag_2
//!         provider: { type: bag, path: /data/run_2 }
//! "#,
//! )?;
//! let provider = config.build()?;
//! # let _ = provider;
//! # Ok(())
//! # }
//! ```
//!
//! ### Decoding payloads
//! ```no_run
//! use rosbags_playback::parsed_cache::{readers_for_topics, ParsedMessageCache};
//! use rosbags_playback::providers::{BagDataProvider, DataProvider, ExtensionPoint};
//! use std::sync::Arc;
//!
//! # async fn run() -> rosbags_playback::Result<()> {
//! let provider = BagDataProvider::open_dir("path/to/bag");
//! let info = provider.initialize(ExtensionPoint::noop()).await?;
//! let readers = readers_for_topics(&info.topics, &Arc::new(info.datatypes.clone()));
//!
//! let topics: Vec<String> = readers.keys().cloned().collect();
//! let messages = provider.get_messages(info.start, info.end, &topics).await?;
//! let mut cache = ParsedMessageCache::new();
//! for parsed in cache.parse_messages(&messages, &readers)? {
//!     println!("{}: {:?}", parsed.topic, parsed.message);
//! }
//! # Ok(())
//! # }
//! ```

/// CDR deserialization into [`types::MessageValue`]s.
pub mod cdr;

/// Per-message payload decompression.
pub mod compression;

/// Provider trees described in YAML.
pub mod config;

/// ROS2 `.msg` definition parsing.
pub mod definitions;

/// Error types shared by every module.
pub mod error;

/// Range-caching reads over streamed files.
pub mod filelike;

/// Parsing and validation of `metadata.yaml`.
pub mod metadata;

/// Memoized payload decoding.
pub mod parsed_cache;

/// Frame batching, subscriptions and derived topics.
pub mod pipeline;

/// Composable message sources.
pub mod providers;

/// Storage backends for bag files.
pub mod storage;

/// Timestamps.
pub mod time;

/// Core data types.
pub mod types;

pub use config::ProviderConfig;
pub use error::{PlaybackError, Result};
pub use metadata::BagMetadata;
pub use parsed_cache::{ParsedMessage, ParsedMessageCache};
pub use pipeline::{Pipeline, PlayerDispatcher, PlayerEvent};
pub use providers::{
    BagDataProvider, CombinedDataProvider, DataProvider, ExtensionPoint, InitializationResult,
    MemoryCacheDataProvider, ReadAheadDataProvider, RpcDataProvider,
};
pub use time::Time;
pub use types::{Message, MessageValue, Payload, Topic};
