//! Leaf provider reading a ROS2 bag
//!
//! Two sources are supported: a bag directory on disk (metadata.yaml plus
//! sqlite3 or MCAP storage files) and a single MCAP file streamed through a
//! [`CachedFilelike`]. Payloads are returned raw; decoding happens later in
//! the parsed message cache.

use super::{DataProvider, ExtensionPoint, InitializationResult, Progress, ProviderMetadata};
use crate::compression::{Decompressor, DecompressorRegistry};
use crate::definitions::{parse_message_definition, Datatypes};
use crate::error::{PlaybackError, Result};
use crate::filelike::{CachedFilelike, FileReader};
use crate::metadata::BagMetadata;
use crate::storage::{open_storage_reader, AsyncStorageReader, ChunkOverlap, RawRecord, StorageReader};
use crate::time::Time;
use crate::types::{Connection, Message, MessageDefinitionFormat, Topic};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// 200 MiB
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 200 * 1024 * 1024;

/// Where the bag comes from
#[derive(Clone)]
pub enum BagSource {
    /// A bag directory containing metadata.yaml
    Directory(PathBuf),
    /// A single MCAP file read through a range cache
    Streamed {
        reader: Arc<dyn FileReader>,
        cache_size: u64,
    },
}

impl std::fmt::Debug for BagSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BagSource::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            BagSource::Streamed { cache_size, .. } => f
                .debug_struct("Streamed")
                .field("cache_size", cache_size)
                .finish_non_exhaustive(),
        }
    }
}

enum BagStorage {
    /// Read on the blocking thread pool
    Blocking(Box<dyn StorageReader>),
    /// Read through the range cache
    Streamed(Arc<dyn AsyncStorageReader>),
}

impl BagStorage {
    fn connections(&self) -> &[Connection] {
        match self {
            BagStorage::Blocking(storage) => storage.connections(),
            BagStorage::Streamed(storage) => storage.connections(),
        }
    }

    fn time_range(&self) -> Result<Option<(u64, u64)>> {
        match self {
            BagStorage::Blocking(storage) => storage.time_range(),
            BagStorage::Streamed(storage) => Ok(storage.time_range()),
        }
    }

    fn chunk_overlap(&self) -> ChunkOverlap {
        match self {
            BagStorage::Blocking(storage) => storage.chunk_overlap(),
            BagStorage::Streamed(storage) => storage.chunk_overlap(),
        }
    }
}

struct OpenBag {
    storage: BagStorage,
    connections_by_id: Arc<HashMap<u32, Connection>>,
    decompressor: Option<Arc<dyn Decompressor>>,
}

/// Connection ids carrying any of `topics`
fn connection_ids(connections_by_id: &HashMap<u32, Connection>, topics: &[String]) -> Vec<u32> {
    connections_by_id
        .values()
        .filter(|c| topics.contains(&c.topic))
        .map(|c| c.id)
        .collect()
}

/// Turn storage records into raw messages, decompressing payloads if needed
fn records_to_messages(
    records: Vec<RawRecord>,
    connections_by_id: &HashMap<u32, Connection>,
    decompressor: Option<&dyn Decompressor>,
) -> Result<Vec<Message>> {
    let mut messages = Vec::with_capacity(records.len());
    for record in records {
        let Some(connection) = connections_by_id.get(&record.connection_id) else {
            continue;
        };
        let data = match decompressor {
            Some(decompressor) => decompressor.decompress(&record.data)?,
            None => record.data,
        };
        messages.push(Message::raw(
            connection.topic.clone(),
            connection.message_type.clone(),
            Time::from_nanos(record.timestamp),
            data,
        ));
    }
    Ok(messages)
}

/// Reads raw messages from a ROS2 bag
pub struct BagDataProvider {
    source: BagSource,
    decompressors: DecompressorRegistry,
    bag: Arc<Mutex<Option<OpenBag>>>,
}

impl BagDataProvider {
    /// Create a provider; bags are leaves, so `children` must be empty
    pub fn new(source: BagSource, children: Vec<Arc<dyn DataProvider>>) -> Result<Self> {
        if !children.is_empty() {
            return Err(PlaybackError::configuration("BagDataProvider cannot have children"));
        }
        Ok(Self {
            source,
            decompressors: DecompressorRegistry::with_defaults(),
            bag: Arc::new(Mutex::new(None)),
        })
    }

    /// Provider for a bag directory
    pub fn open_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            source: BagSource::Directory(path.into()),
            decompressors: DecompressorRegistry::with_defaults(),
            bag: Arc::new(Mutex::new(None)),
        }
    }

    /// Provider for an MCAP file streamed through a cache of `cache_size` bytes
    pub fn streamed(reader: Arc<dyn FileReader>, cache_size: u64) -> Self {
        Self {
            source: BagSource::Streamed { reader, cache_size },
            decompressors: DecompressorRegistry::with_defaults(),
            bag: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a custom set of decompressors
    pub fn with_decompressors(mut self, decompressors: DecompressorRegistry) -> Self {
        self.decompressors = decompressors;
        self
    }

    async fn open_directory(&self, path: &Path) -> Result<(Box<dyn StorageReader>, Option<Arc<dyn Decompressor>>)> {
        let path = path.to_path_buf();
        let decompressors = self.decompressors.clone();
        tokio::task::spawn_blocking(move || {
            if !path.is_dir() {
                return Err(PlaybackError::BagNotFound { path });
            }
            let metadata = BagMetadata::from_file(path.join("metadata.yaml"))?;
            let decompressor = decompressors.for_bag(
                metadata.compression_mode().unwrap_or(crate::types::CompressionMode::None),
                metadata.compression_format(),
            )?;

            let mut storage_paths = Vec::new();
            for relative in &metadata.info().relative_file_paths {
                let storage_path = path.join(relative);
                if !storage_path.exists() {
                    return Err(PlaybackError::StorageFileNotFound { path: storage_path });
                }
                storage_paths.push(storage_path);
            }
            let paths: Vec<&Path> = storage_paths.iter().map(PathBuf::as_path).collect();
            let storage = open_storage_reader(metadata.storage_plugin()?, &paths)?;
            Ok((storage, decompressor))
        })
        .await
        .map_err(|e| PlaybackError::generic(format!("bag open task failed: {e}")))?
    }

    async fn open_streamed(
        &self,
        reader: Arc<dyn FileReader>,
        cache_size: u64,
        extension_point: &ExtensionPoint,
    ) -> Result<BagStorage> {
        (extension_point.progress_callback)(Progress::default());

        let approximate_size = Arc::new(AtomicU64::new(0));
        let size_for_progress = approximate_size.clone();
        let progress = extension_point.progress_callback.clone();
        let metadata = extension_point.report_metadata_callback.clone();
        let filelike = CachedFilelike::new(reader, cache_size)
            .with_keep_reconnecting(Arc::new(move |reconnecting: bool| {
                metadata(ProviderMetadata::UpdateReconnecting { reconnecting })
            }))
            .with_ranges_callback(Arc::new(move |ranges: &[Range<u64>]| {
                let size = size_for_progress.load(Ordering::Relaxed);
                if size == 0 {
                    return;
                }
                progress(Progress {
                    fully_loaded_fraction_ranges: ranges
                        .iter()
                        .map(|r| (r.start as f64 / size as f64).max(0.0)..(r.end as f64 / size as f64).min(1.0))
                        .collect(),
                    ..Default::default()
                })
            }));

        let size = filelike.open().await?;
        // The summary at the end of the file is not message data
        approximate_size.store(size - size / 100, Ordering::Relaxed);
        open_streamed_mcap(Arc::new(filelike), size).await
    }
}

#[cfg(feature = "mcap")]
async fn open_streamed_mcap(filelike: Arc<CachedFilelike>, size: u64) -> Result<BagStorage> {
    use crate::storage::mcap::{McapStorageReader, StreamedMcapReader};

    if let Some(reader) = StreamedMcapReader::open(filelike.clone()).await? {
        return Ok(BagStorage::Streamed(Arc::new(reader)));
    }
    // Without chunk indexes the file can only be scanned as a whole
    if size > filelike.cache_size() {
        return Err(PlaybackError::invalid_bag(format!(
            "MCAP file of {size} bytes has no chunk index and does not fit in a cache of {} bytes",
            filelike.cache_size()
        )));
    }
    warn!(size, "streamed MCAP file has no chunk index, reading it whole");
    let bytes = filelike.read(0, size).await?;
    let storage = tokio::task::spawn_blocking(move || McapStorageReader::from_bytes(bytes))
        .await
        .map_err(|e| PlaybackError::generic(format!("bag open task failed: {e}")))??;
    Ok(BagStorage::Blocking(Box::new(storage)))
}

#[cfg(not(feature = "mcap"))]
async fn open_streamed_mcap(_filelike: Arc<CachedFilelike>, _size: u64) -> Result<BagStorage> {
    Err(PlaybackError::UnsupportedStorageFormat {
        format: "mcap (feature not enabled)".to_string(),
    })
}

fn lock_error<T>(_: T) -> PlaybackError {
    PlaybackError::generic("bag state lock poisoned")
}

/// Parse every connection's definition into one dictionary
fn connections_to_datatypes(connections: &[Connection]) -> Result<Datatypes> {
    let mut datatypes = Datatypes::new();
    for connection in connections {
        if datatypes.contains_key(&connection.message_type) {
            continue;
        }
        let definition = &connection.message_definition;
        match definition.format {
            MessageDefinitionFormat::Msg if !definition.data.is_empty() => {
                let parsed = parse_message_definition(&connection.message_type, &definition.data)?;
                for (name, datatype) in parsed {
                    datatypes.entry(name).or_insert(datatype);
                }
            }
            _ => debug!(
                topic = %connection.topic,
                message_type = %connection.message_type,
                "no .msg definition; payloads on this topic cannot be decoded"
            ),
        }
    }
    Ok(datatypes)
}

#[async_trait]
impl DataProvider for BagDataProvider {
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult> {
        if self.bag.lock().map_err(lock_error)?.is_some() {
            return Err(PlaybackError::AlreadyInitialized);
        }

        let (storage, decompressor) = match &self.source {
            BagSource::Directory(path) => {
                let (storage, decompressor) = self.open_directory(path).await?;
                (extension_point.progress_callback)(Progress {
                    fully_loaded_fraction_ranges: vec![0.0..1.0],
                    ..Default::default()
                });
                (BagStorage::Blocking(storage), decompressor)
            }
            BagSource::Streamed { reader, cache_size } => {
                let storage = self
                    .open_streamed(reader.clone(), *cache_size, &extension_point)
                    .await?;
                (storage, None)
            }
        };

        let (connections, malformed): (Vec<Connection>, Vec<Connection>) = storage
            .connections()
            .iter()
            .cloned()
            .partition(|connection| !connection.is_malformed());
        if !malformed.is_empty() {
            warn!(count = malformed.len(), "skipping malformed connections");
            (extension_point.report_metadata_callback)(ProviderMetadata::warn(
                "Warning: Malformed connections found",
                format!(
                    "This bag has some malformed connections. We'll try to play the remaining topics. Details:\n\n{malformed:?}"
                ),
            ));
        }

        let time_range = storage.time_range()?;
        let Some((start, end)) = time_range.filter(|_| !connections.is_empty()) else {
            (extension_point.report_metadata_callback)(ProviderMetadata::error(
                "Cannot play invalid bag",
                "Bag is empty or corrupt.",
            ));
            return Err(PlaybackError::invalid_bag("bag is empty or corrupt"));
        };

        let overlap = storage.chunk_overlap();
        if overlap.is_unsorted() {
            warn!(overlapping = overlap.overlapping, chunks = overlap.total, "bag chunks overlap in time");
            (extension_point.report_metadata_callback)(ProviderMetadata::warn(
                "Warning: Bag is unsorted, which is slow",
                format!(
                    "This bag has many overlapping chunks ({} out of {}), which means that we have to decompress many chunks in order to load a particular time range. This is slow. Ideally, fix this where you're generating your bags, by sorting the messages by receive time.",
                    overlap.overlapping, overlap.total
                ),
            ));
        }

        let datatypes = connections_to_datatypes(&connections)?;
        let topics = connections
            .iter()
            .map(|c| Topic::new(c.topic.clone(), c.message_type.clone()))
            .collect();
        let message_definitions_by_topic: BTreeMap<String, String> = connections
            .iter()
            .map(|c| (c.topic.clone(), c.message_definition.data.clone()))
            .collect();

        info!(
            source = ?self.source,
            topics = connections.len(),
            start = %Time::from_nanos(start),
            end = %Time::from_nanos(end),
            "initialized bag"
        );

        let connections_by_id = Arc::new(connections.into_iter().map(|c| (c.id, c)).collect());
        *self.bag.lock().map_err(lock_error)? = Some(OpenBag {
            storage,
            connections_by_id,
            decompressor,
        });

        Ok(InitializationResult {
            start: Time::from_nanos(start),
            end: Time::from_nanos(end),
            topics,
            datatypes,
            provides_parsed_messages: false,
            message_definitions_by_topic,
        })
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        let streamed = {
            let guard = self.bag.lock().map_err(lock_error)?;
            let open = guard.as_ref().ok_or(PlaybackError::NotInitialized)?;
            match &open.storage {
                BagStorage::Streamed(storage) => Some((storage.clone(), open.connections_by_id.clone())),
                BagStorage::Blocking(_) => None,
            }
        };

        if let Some((storage, connections_by_id)) = streamed {
            let ids = connection_ids(&connections_by_id, topics);
            let records = storage.messages(&ids, start.to_nanos(), end.to_nanos()).await?;
            let messages = records_to_messages(records, &connections_by_id, None)?;
            debug!(count = messages.len(), %start, %end, "read streamed bag messages");
            return Ok(messages);
        }

        let bag = self.bag.clone();
        let topics = topics.to_vec();
        tokio::task::spawn_blocking(move || {
            let guard = bag.lock().map_err(lock_error)?;
            let open = guard.as_ref().ok_or(PlaybackError::NotInitialized)?;
            let BagStorage::Blocking(storage) = &open.storage else {
                return Err(PlaybackError::generic("bag storage changed while reading"));
            };

            let ids = connection_ids(&open.connections_by_id, &topics);
            let records = storage.messages(&ids, start.to_nanos(), end.to_nanos())?;
            let messages = records_to_messages(records, &open.connections_by_id, open.decompressor.as_deref())?;
            debug!(count = messages.len(), %start, %end, "read bag messages");
            Ok(messages)
        })
        .await
        .map_err(|e| PlaybackError::generic(format!("bag read task failed: {e}")))?
    }

    async fn close(&self) -> Result<()> {
        let bag = self.bag.clone();
        tokio::task::spawn_blocking(move || {
            let taken = bag.lock().map_err(lock_error)?.take();
            match taken {
                Some(OpenBag {
                    storage: BagStorage::Blocking(mut storage),
                    ..
                }) => storage.close(),
                // Dropping the reader releases the range cache
                Some(_) | None => Ok(()),
            }
        })
        .await
        .map_err(|e| PlaybackError::generic(format!("bag close task failed: {e}")))?
    }
}
