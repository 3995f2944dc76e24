//! MCAP storage backend for reading ROS2 bag files
//!
//! Indexed files are read through their summary section: channels, schemas and
//! chunk indexes come from the summary, and a time-window read only decodes the
//! chunks whose time range overlaps the window. Files without chunk indexes
//! fall back to scanning every record.
//!
//! [`McapStorageReader`] works on memory-mapped files or an in-memory buffer.
//! [`StreamedMcapReader`] reads the same structures lazily through a
//! [`CachedFilelike`], so a file larger than the cache can be played.

use crate::error::{PlaybackError, Result};
use crate::filelike::CachedFilelike;
use crate::storage::{merge_sorted, AsyncStorageReader, ChunkOverlap, RawRecord, StorageReader};
use crate::types::{Connection, MessageDefinition, MessageDefinitionFormat};
use async_trait::async_trait;
use mcap::read::{ChunkReader, LinearReader};
use mcap::records::{ChunkIndex, Footer, Record};
use mcap::{MessageStream, Schema, MAGIC};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Opcode, record length and the 20-byte footer body
const FOOTER_RECORD_LEN: u64 = 1 + 8 + 20;

/// Footer record plus the trailing magic
pub const FOOTER_TAIL_LEN: u64 = FOOTER_RECORD_LEN + MAGIC.len() as u64;

/// Leading magic, footer and trailing magic
const MIN_FILE_LEN: u64 = MAGIC.len() as u64 + FOOTER_TAIL_LEN;

fn mcap_error(err: mcap::McapError) -> PlaybackError {
    PlaybackError::invalid_bag(format!("failed to read MCAP data: {err}"))
}

/// Connections shared by every file of a bag, one per topic
#[derive(Debug, Default)]
struct TopicTable {
    connections: Vec<Connection>,
    topic_ids: HashMap<String, u32>,
}

impl TopicTable {
    /// Connection id for `topic`, registering it on first sight
    fn register(&mut self, topic: &str, message_encoding: &str, schema: Option<&Schema<'_>>) -> u32 {
        if let Some(&id) = self.topic_ids.get(topic) {
            return id;
        }
        let (message_type, message_definition) = match schema {
            Some(schema) => (
                schema.name.clone(),
                MessageDefinition {
                    format: MessageDefinitionFormat::from_encoding(&schema.encoding),
                    data: String::from_utf8_lossy(&schema.data).into_owned(),
                },
            ),
            None => {
                warn!(topic, "MCAP channel has no schema");
                (String::new(), MessageDefinition::default())
            }
        };
        let id = self.connections.len() as u32 + 1;
        self.topic_ids.insert(topic.to_string(), id);
        self.connections.push(Connection {
            id,
            topic: topic.to_string(),
            message_type,
            message_definition,
            serialization_format: message_encoding.to_string(),
        });
        id
    }
}

/// Parse the footer out of the last [`FOOTER_TAIL_LEN`] bytes of a file
fn parse_footer(tail: &[u8]) -> Result<Footer> {
    let record = tail
        .strip_suffix(MAGIC)
        .ok_or_else(|| PlaybackError::invalid_bag("MCAP file does not end with the magic bytes"))?;
    match LinearReader::sans_magic(record).next() {
        Some(Ok(Record::Footer(footer))) => Ok(footer),
        Some(Err(err)) => Err(mcap_error(err)),
        _ => Err(PlaybackError::invalid_bag("MCAP footer not found")),
    }
}

/// Byte range of the summary section, `None` when the file has none
fn summary_range(footer: &Footer, file_size: u64) -> Result<Option<Range<u64>>> {
    if footer.summary_start == 0 {
        return Ok(None);
    }
    let footer_start = file_size - FOOTER_TAIL_LEN;
    let end = match footer.summary_offset_start {
        0 => footer_start,
        offset => offset,
    };
    if footer.summary_start > end || end > footer_start {
        return Err(PlaybackError::invalid_bag(format!(
            "MCAP summary range {}..{end} is outside the file",
            footer.summary_start
        )));
    }
    Ok(Some(footer.summary_start..end))
}

/// Chunk layout of one indexed MCAP file
#[derive(Debug, Default)]
struct McapIndex {
    /// MCAP channel id -> connection id
    channel_ids: HashMap<u16, u32>,
    /// Sorted by message start time
    chunks: Vec<ChunkIndex>,
    time_range: Option<(u64, u64)>,
}

impl McapIndex {
    /// Read channels, schemas and chunk indexes from a summary section
    fn from_summary(summary: &[u8], topics: &mut TopicTable) -> Result<Self> {
        let mut schemas: HashMap<u16, Schema<'static>> = HashMap::new();
        let mut channels = Vec::new();
        let mut chunks = Vec::new();
        let mut statistics = None;

        for record in LinearReader::sans_magic(summary) {
            match record.map_err(mcap_error)? {
                Record::Schema { header, data } => {
                    schemas.insert(
                        header.id,
                        Schema {
                            name: header.name,
                            encoding: header.encoding,
                            data: Cow::Owned(data.into_owned()),
                        },
                    );
                }
                Record::Channel(channel) => channels.push(channel),
                Record::ChunkIndex(chunk) => chunks.push(chunk),
                Record::Statistics(stats) => statistics = Some(stats),
                _ => {}
            }
        }

        // Schema id 0 means the channel has no schema
        let channel_ids = channels
            .iter()
            .map(|channel| {
                let schema = schemas.get(&channel.schema_id);
                let id = topics.register(&channel.topic, &channel.message_encoding, schema);
                (channel.id, id)
            })
            .collect();

        chunks.sort_by_key(|chunk| (chunk.message_start_time, chunk.chunk_start_offset));
        let time_range = match statistics {
            Some(stats) if stats.message_count > 0 => Some((stats.message_start_time, stats.message_end_time)),
            _ => chunks
                .iter()
                .map(|chunk| (chunk.message_start_time, chunk.message_end_time))
                .reduce(|(start, end), (chunk_start, chunk_end)| (start.min(chunk_start), end.max(chunk_end))),
        };

        Ok(Self {
            channel_ids,
            chunks,
            time_range,
        })
    }

    /// Chunks whose message time range overlaps `[start, end]`
    fn chunks_overlapping(&self, start: u64, end: u64) -> impl Iterator<Item = &ChunkIndex> {
        self.chunks
            .iter()
            .filter(move |chunk| chunk.message_start_time <= end && start <= chunk.message_end_time)
    }

    /// Count chunks starting before an earlier chunk ended
    fn chunk_overlap(&self) -> ChunkOverlap {
        let mut overlapping = 0;
        let mut latest_end: Option<u64> = None;
        for chunk in &self.chunks {
            if latest_end.is_some_and(|end| chunk.message_start_time < end) {
                overlapping += 1;
            }
            latest_end = Some(latest_end.map_or(chunk.message_end_time, |end| end.max(chunk.message_end_time)));
        }
        ChunkOverlap {
            overlapping,
            total: self.chunks.len(),
        }
    }

    /// Decode one chunk record, keeping messages on `connection_ids` within `[start, end]`
    fn read_chunk(
        &self,
        chunk_record: &[u8],
        connection_ids: &[u32],
        start: u64,
        end: u64,
        out: &mut Vec<RawRecord>,
    ) -> Result<()> {
        let (header, data) = match LinearReader::sans_magic(chunk_record).next() {
            Some(Ok(Record::Chunk { header, data })) => (header, data),
            Some(Err(err)) => return Err(mcap_error(err)),
            _ => return Err(PlaybackError::invalid_bag("MCAP chunk index does not point at a chunk")),
        };
        for record in ChunkReader::new(header, &data).map_err(mcap_error)? {
            let Record::Message { header, data } = record.map_err(mcap_error)? else {
                continue;
            };
            if header.log_time < start || header.log_time > end {
                continue;
            }
            let Some(&connection_id) = self.channel_ids.get(&header.channel_id) else {
                continue;
            };
            if connection_ids.contains(&connection_id) {
                out.push(RawRecord {
                    connection_id,
                    timestamp: header.log_time,
                    data: data.into_owned(),
                });
            }
        }
        Ok(())
    }
}

fn chunk_byte_range(chunk: &ChunkIndex) -> Result<Range<usize>> {
    let start = usize::try_from(chunk.chunk_start_offset)
        .map_err(|_| PlaybackError::invalid_bag("MCAP chunk offset out of range"))?;
    let length = usize::try_from(chunk.chunk_length)
        .map_err(|_| PlaybackError::invalid_bag("MCAP chunk length out of range"))?;
    Ok(start..start.saturating_add(length))
}

enum McapData {
    Mapped(memmap2::Mmap),
    Memory(Vec<u8>),
}

impl Deref for McapData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            McapData::Mapped(map) => map,
            McapData::Memory(bytes) => bytes,
        }
    }
}

enum McapLayout {
    Indexed(McapIndex),
    /// No chunk index; every read scans the whole file
    Linear { time_range: Option<(u64, u64)> },
}

struct McapFile {
    data: McapData,
    layout: McapLayout,
}

impl McapFile {
    fn open(data: McapData, topics: &mut TopicTable) -> Result<Self> {
        let layout = match Self::read_index(&data, topics)? {
            Some(index) => McapLayout::Indexed(index),
            None => {
                debug!("MCAP file has no chunk index, scanning all records");
                Self::scan(&data, topics)?
            }
        };
        Ok(Self { data, layout })
    }

    fn read_index(data: &[u8], topics: &mut TopicTable) -> Result<Option<McapIndex>> {
        let size = data.len() as u64;
        if size < MIN_FILE_LEN || !data.starts_with(MAGIC) {
            return Err(PlaybackError::invalid_bag("not an MCAP file"));
        }
        let footer = parse_footer(&data[(size - FOOTER_TAIL_LEN) as usize..])?;
        let Some(range) = summary_range(&footer, size)? else {
            return Ok(None);
        };
        let index = McapIndex::from_summary(&data[range.start as usize..range.end as usize], topics)?;
        Ok(Some(index).filter(|index| !index.chunks.is_empty()))
    }

    fn scan(data: &[u8], topics: &mut TopicTable) -> Result<McapLayout> {
        let mut time_range: Option<(u64, u64)> = None;
        for message in MessageStream::new(data).map_err(mcap_error)? {
            let message = message.map_err(mcap_error)?;
            let timestamp = message.log_time;
            time_range = Some(match time_range {
                Some((start, end)) => (start.min(timestamp), end.max(timestamp)),
                None => (timestamp, timestamp),
            });
            let channel = &message.channel;
            topics.register(&channel.topic, &channel.message_encoding, channel.schema.as_deref());
        }
        Ok(McapLayout::Linear { time_range })
    }

    fn time_range(&self) -> Option<(u64, u64)> {
        match &self.layout {
            McapLayout::Indexed(index) => index.time_range,
            McapLayout::Linear { time_range } => *time_range,
        }
    }

    fn messages(
        &self,
        topics: &TopicTable,
        connection_ids: &[u32],
        start: u64,
        end: u64,
    ) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        match &self.layout {
            McapLayout::Indexed(index) => {
                for chunk in index.chunks_overlapping(start, end) {
                    let bytes = self.data.get(chunk_byte_range(chunk)?).ok_or_else(|| {
                        PlaybackError::invalid_bag("MCAP chunk index points past the end of the file")
                    })?;
                    index.read_chunk(bytes, connection_ids, start, end, &mut records)?;
                }
            }
            McapLayout::Linear { .. } => {
                for message in MessageStream::new(&self.data).map_err(mcap_error)? {
                    let message = message.map_err(mcap_error)?;
                    if message.log_time < start || message.log_time > end {
                        continue;
                    }
                    let Some(&connection_id) = topics.topic_ids.get(&message.channel.topic) else {
                        continue;
                    };
                    if connection_ids.contains(&connection_id) {
                        records.push(RawRecord {
                            connection_id,
                            timestamp: message.log_time,
                            data: message.data.into_owned(),
                        });
                    }
                }
            }
        }
        // Neither chunks nor records within a chunk are required to be in log-time order
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

/// MCAP storage reader over memory-mapped files or an in-memory buffer
pub struct McapStorageReader {
    files: Vec<McapFile>,
    topics: TopicTable,
}

impl McapStorageReader {
    /// Memory-map every file and read its index
    pub fn open(paths: &[&Path]) -> Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file = File::open(path).map_err(|_| PlaybackError::StorageFileNotFound {
                path: path.to_path_buf(),
            })?;
            // SAFETY: the map is read-only and bag files are not modified while played
            let map = unsafe { memmap2::Mmap::map(&file) }?;
            files.push(McapData::Mapped(map));
        }
        Self::from_files(files)
    }

    /// Read a single MCAP file held in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_files(vec![McapData::Memory(bytes)])
    }

    fn from_files(data: Vec<McapData>) -> Result<Self> {
        let mut topics = TopicTable::default();
        let files = data
            .into_iter()
            .map(|data| McapFile::open(data, &mut topics))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            files = files.len(),
            connections = topics.connections.len(),
            "opened mcap storage"
        );
        Ok(Self { files, topics })
    }
}

impl StorageReader for McapStorageReader {
    fn connections(&self) -> &[Connection] {
        &self.topics.connections
    }

    fn time_range(&self) -> Result<Option<(u64, u64)>> {
        Ok(self
            .files
            .iter()
            .filter_map(McapFile::time_range)
            .reduce(|(start, end), (file_start, file_end)| (start.min(file_start), end.max(file_end))))
    }

    fn messages(&self, connection_ids: &[u32], start: u64, end: u64) -> Result<Vec<RawRecord>> {
        let per_file = self
            .files
            .iter()
            .map(|file| file.messages(&self.topics, connection_ids, start, end))
            .collect::<Result<Vec<_>>>()?;
        Ok(merge_sorted(per_file))
    }

    fn chunk_overlap(&self) -> ChunkOverlap {
        self.files
            .iter()
            .filter_map(|file| match &file.layout {
                McapLayout::Indexed(index) => Some(index.chunk_overlap()),
                McapLayout::Linear { .. } => None,
            })
            .fold(ChunkOverlap::default(), ChunkOverlap::combine)
    }

    fn close(&mut self) -> Result<()> {
        self.files.clear();
        Ok(())
    }
}

/// Indexed MCAP file read on demand through a [`CachedFilelike`]
///
/// Only the footer and the summary are read at open. Each read fetches the
/// chunks overlapping its window; what stays resident is up to the cache.
pub struct StreamedMcapReader {
    filelike: Arc<CachedFilelike>,
    topics: TopicTable,
    index: McapIndex,
}

impl StreamedMcapReader {
    /// Read the summary, or `None` when the file has no chunk index
    pub async fn open(filelike: Arc<CachedFilelike>) -> Result<Option<Self>> {
        let size = filelike.open().await?;
        if size < MIN_FILE_LEN || filelike.read(0, MAGIC.len() as u64).await? != MAGIC {
            return Err(PlaybackError::invalid_bag("not an MCAP file"));
        }
        let tail = filelike.read(size - FOOTER_TAIL_LEN, FOOTER_TAIL_LEN).await?;
        let footer = parse_footer(&tail)?;
        let Some(range) = summary_range(&footer, size)? else {
            return Ok(None);
        };
        let summary = filelike.read(range.start, range.end - range.start).await?;

        let mut topics = TopicTable::default();
        let index = McapIndex::from_summary(&summary, &mut topics)?;
        if index.chunks.is_empty() {
            return Ok(None);
        }
        debug!(
            size,
            chunks = index.chunks.len(),
            connections = topics.connections.len(),
            "opened streamed mcap"
        );
        Ok(Some(Self {
            filelike,
            topics,
            index,
        }))
    }
}

#[async_trait]
impl AsyncStorageReader for StreamedMcapReader {
    fn connections(&self) -> &[Connection] {
        &self.topics.connections
    }

    fn time_range(&self) -> Option<(u64, u64)> {
        self.index.time_range
    }

    fn chunk_overlap(&self) -> ChunkOverlap {
        self.index.chunk_overlap()
    }

    async fn messages(&self, connection_ids: &[u32], start: u64, end: u64) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        for chunk in self.index.chunks_overlapping(start, end) {
            let bytes = self
                .filelike
                .read(chunk.chunk_start_offset, chunk.chunk_length)
                .await?;
            self.index
                .read_chunk(&bytes, connection_ids, start, end, &mut records)?;
        }
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}
