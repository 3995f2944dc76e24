//! Block cache holding a child's messages in memory
//!
//! The child's time range is cut into fixed-width blocks. A block stores, per
//! topic, every message of that topic inside its span, so requests are
//! answered from whole blocks and only missing `(block, topic)` pairs reach
//! the child. After a request is served the provider reads ahead of the
//! cursor, then keeps filling free budget one block at a time. Eviction keeps
//! the most recently requested block ranges until the byte budget is spent.

use super::{DataProvider, ExtensionPoint, InitializationResult, Progress, ProviderMetadata};
use crate::error::{PlaybackError, Result};
use crate::filelike::ranges;
use crate::time::Time;
use crate::types::Message;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Narrowest block, in nanoseconds
pub const MIN_BLOCK_SIZE_NS: u64 = 100_000_000;
/// Long recordings get wider blocks instead of more of them
pub const MAX_BLOCKS: u64 = 400;
/// How far past the last served block to keep loading
const READ_AHEAD_NS: u64 = 3_000_000_000;
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 2_500_000_000;
/// Blocks above this size are reported once as a warning
pub const MAX_BLOCK_SIZE_BYTES: u64 = 50_000_000;

/// Messages of one block, grouped by topic
///
/// A topic key is present only once all of that topic's messages in the
/// block's span are loaded; its list may be empty.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheBlock {
    pub messages_by_topic: BTreeMap<String, Vec<Message>>,
    pub size_in_bytes: u64,
}

impl MemoryCacheBlock {
    fn has_topics(&self, topics: &[String]) -> bool {
        topics.iter().all(|topic| self.messages_by_topic.contains_key(topic))
    }

    fn merged(&self, other: &MemoryCacheBlock) -> MemoryCacheBlock {
        let mut messages_by_topic = self.messages_by_topic.clone();
        for (topic, messages) in &other.messages_by_topic {
            let list = messages_by_topic.entry(topic.clone()).or_default();
            list.extend(messages.iter().cloned());
            list.sort_by_key(|message| message.receive_time);
        }
        MemoryCacheBlock {
            messages_by_topic,
            size_in_bytes: self.size_in_bytes + other.size_in_bytes,
        }
    }

    fn with_topic_prefix(&self, prefix: &str) -> MemoryCacheBlock {
        let messages_by_topic = self
            .messages_by_topic
            .iter()
            .map(|(topic, messages)| {
                let renamed = format!("{prefix}{topic}");
                let messages = messages
                    .iter()
                    .map(|message| Message {
                        topic: renamed.clone(),
                        ..message.clone()
                    })
                    .collect();
                (renamed, messages)
            })
            .collect();
        MemoryCacheBlock {
            messages_by_topic,
            size_in_bytes: self.size_in_bytes,
        }
    }
}

/// Snapshot of the resident blocks, published with every progress report
#[derive(Clone)]
pub struct BlockCache {
    pub blocks: Vec<Option<Arc<MemoryCacheBlock>>>,
    pub start_time: Time,
}

impl BlockCache {
    /// Blockwise union; caches with different start times are not merged
    pub fn merged(self, other: &BlockCache) -> BlockCache {
        if self.start_time != other.start_time {
            return self;
        }
        let len = self.blocks.len().max(other.blocks.len());
        let blocks = (0..len)
            .map(|index| {
                let ours = self.blocks.get(index).cloned().flatten();
                let theirs = other.blocks.get(index).cloned().flatten();
                match (ours, theirs) {
                    (Some(ours), Some(theirs)) => Some(Arc::new(ours.merged(&theirs))),
                    (ours, theirs) => ours.or(theirs),
                }
            })
            .collect();
        BlockCache {
            blocks,
            start_time: self.start_time,
        }
    }

    /// Same blocks with `prefix` prepended to every topic
    pub fn with_topic_prefix(&self, prefix: &str) -> BlockCache {
        BlockCache {
            blocks: self
                .blocks
                .iter()
                .map(|block| block.as_ref().map(|block| Arc::new(block.with_topic_prefix(prefix))))
                .collect(),
            start_time: self.start_time,
        }
    }

    pub fn resident_blocks(&self) -> Vec<usize> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(index, block)| block.as_ref().map(|_| index))
            .collect()
    }
}

/// Blocks are never mutated once shared, so identity is equality
impl PartialEq for BlockCache {
    fn eq(&self, other: &Self) -> bool {
        self.start_time == other.start_time
            && self.blocks.len() == other.blocks.len()
            && self.blocks.iter().zip(&other.blocks).all(|pair| match pair {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            })
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("start_time", &self.start_time)
            .field("blocks", &self.blocks.len())
            .field("resident", &self.resident_blocks().len())
            .finish()
    }
}

/// Block geometry, fixed at initialize
#[derive(Debug, Clone, Copy)]
struct BlockLayout {
    start: Time,
    end: Time,
    /// Inclusive span length, so at least 1
    total_ns: u64,
    block_size_ns: u64,
    block_count: usize,
    read_ahead_blocks: usize,
}

impl BlockLayout {
    fn new(start: Time, end: Time) -> Self {
        let total_ns = end.to_nanos().saturating_sub(start.to_nanos()) + 1;
        let block_size_ns = MIN_BLOCK_SIZE_NS.max(total_ns.div_ceil(MAX_BLOCKS));
        Self {
            start,
            end,
            total_ns,
            block_size_ns,
            block_count: total_ns.div_ceil(block_size_ns) as usize,
            read_ahead_blocks: READ_AHEAD_NS.div_ceil(block_size_ns) as usize,
        }
    }

    fn block_of(&self, time: Time) -> usize {
        let offset = time.to_nanos().saturating_sub(self.start.to_nanos());
        ((offset / self.block_size_ns) as usize).min(self.block_count - 1)
    }

    /// Blocks covering the inclusive window `[start, end]`
    fn block_range(&self, start: Time, end: Time) -> Range<usize> {
        self.block_of(start)..self.block_of(end) + 1
    }

    /// Inclusive time span of block `index`
    fn block_bounds(&self, index: usize) -> (Time, Time) {
        let from = index as u64 * self.block_size_ns;
        let to = self.total_ns.min(from + self.block_size_ns) - 1;
        (
            self.start.add(Time::from_nanos(from)),
            self.start.add(Time::from_nanos(to)),
        )
    }

    fn read_ahead_range(&self, from: usize) -> Range<usize> {
        from..(from + self.read_ahead_blocks).min(self.block_count)
    }
}

/// Pick the blocks that survive a purge
///
/// `recent_block_ranges` is ordered most recent first. Blocks in
/// `bad_eviction_range` are always kept; then each recent range is walked
/// from its most useful end until `max_cache_size` is exceeded. Returns the
/// kept block indexes and the recent ranges trimmed to what was kept.
pub fn blocks_to_keep(
    recent_block_ranges: &[Range<usize>],
    block_sizes: &[Option<u64>],
    max_cache_size: u64,
    bad_eviction_range: Option<&Range<usize>>,
) -> (BTreeSet<usize>, Vec<Range<usize>>) {
    let mut cache_size = 0;
    let mut keep = BTreeSet::new();
    let size_of = |index: usize| block_sizes.get(index).copied().flatten();

    if let Some(bad) = bad_eviction_range {
        for index in bad.clone() {
            if let Some(size) = size_of(index) {
                if keep.insert(index) {
                    cache_size += size;
                }
            }
        }
    }

    for (position, range) in recent_block_ranges.iter().enumerate() {
        // Near an open read, keep the end of the range closest to it
        let from_start = bad_eviction_range
            .is_some_and(|bad| bad.start.abs_diff(range.start) < bad.start.abs_diff(range.end));
        let indexes: Box<dyn Iterator<Item = usize>> = if from_start {
            Box::new(range.clone())
        } else {
            Box::new(range.clone().rev())
        };

        for index in indexes {
            let Some(size) = size_of(index) else {
                continue;
            };
            if keep.insert(index) {
                cache_size += size;
            }
            if cache_size > max_cache_size {
                let mut recent = recent_block_ranges[..position].to_vec();
                recent.push(if from_start {
                    range.start..index + 1
                } else {
                    index..range.end
                });
                if let Some(bad) = bad_eviction_range {
                    recent = ranges::merge_into_unsorted(bad.clone(), &recent);
                }
                return (keep, recent);
            }
        }
    }
    (keep, recent_block_ranges.to_vec())
}

/// Where to prefetch next: the leftmost gap at or right of the cursor,
/// else the leftmost gap before it
pub fn prefetch_start_point(uncached: &[Range<usize>], cursor: usize) -> Option<usize> {
    uncached
        .iter()
        .min_by_key(|range| (range.start < cursor, range.start))
        .map(|range| range.start)
}

fn normalized_topics(topics: &[String]) -> Vec<String> {
    let mut topics = topics.to_vec();
    topics.sort();
    topics.dedup();
    topics
}

#[derive(Default)]
struct CacheState {
    blocks: Vec<Option<Arc<MemoryCacheBlock>>>,
    /// Most recent first, never overlapping; may cover blocks not loaded yet
    recent_block_ranges: Vec<Range<usize>>,
    /// Topics of the last request, used for prefetching and progress
    topics: Vec<String>,
    /// End of the block range of the last served request
    last_resolved_end: Option<usize>,
    logged_too_large: bool,
}

impl CacheState {
    fn has_block(&self, index: usize) -> bool {
        self.blocks
            .get(index)
            .and_then(Option::as_ref)
            .is_some_and(|block| block.has_topics(&self.topics))
    }

    /// Loaded ranges of blocks for the current topics
    fn downloaded_block_ranges(&self) -> Vec<Range<usize>> {
        ranges::simplify(
            (0..self.blocks.len())
                .filter(|&index| self.has_block(index))
                .map(|index| index..index + 1)
                .collect(),
        )
    }

    fn bytes_used(&self) -> u64 {
        self.blocks.iter().flatten().map(|block| block.size_in_bytes).sum()
    }
}

struct Inner {
    child: Arc<dyn DataProvider>,
    /// `None` keeps everything
    cache_size_bytes: Option<u64>,
    prefetch: bool,
    layout: OnceLock<BlockLayout>,
    extension_point: OnceLock<ExtensionPoint>,
    state: Mutex<CacheState>,
    /// Bumped by every request; a prefetch loop stops once it is stale
    generation: AtomicU64,
}

impl Inner {
    fn layout(&self) -> Result<BlockLayout> {
        self.layout.get().copied().ok_or(PlaybackError::NotInitialized)
    }

    /// Make block `index` hold `topics`, fetching only the missing ones
    async fn load_block(
        &self,
        state: &mut CacheState,
        layout: &BlockLayout,
        index: usize,
        topics: &[String],
    ) -> Result<()> {
        let existing = state.blocks.get(index).cloned().flatten();
        let missing: Vec<String> = topics
            .iter()
            .filter(|topic| {
                !existing
                    .as_ref()
                    .is_some_and(|block| block.messages_by_topic.contains_key(*topic))
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let (start, end) = layout.block_bounds(index);
        let messages = self.child.get_messages(start, end, &missing).await?;

        let mut block = existing.map(|block| (*block).clone()).unwrap_or_default();
        for topic in &missing {
            block.messages_by_topic.insert(topic.clone(), Vec::new());
        }
        for message in messages {
            match block.messages_by_topic.get_mut(&message.topic) {
                Some(list) if missing.contains(&message.topic) => {
                    block.size_in_bytes += message.payload.size_in_bytes() as u64;
                    list.push(message);
                }
                _ => warn!(topic = %message.topic, block = index, "child returned an unrequested topic"),
            }
        }

        if block.size_in_bytes > MAX_BLOCK_SIZE_BYTES && !state.logged_too_large {
            state.logged_too_large = true;
            self.report_large_block(layout, &block);
        }
        if let Some(slot) = state.blocks.get_mut(index) {
            *slot = Some(Arc::new(block));
        }
        Ok(())
    }

    fn report_large_block(&self, layout: &BlockLayout, block: &MemoryCacheBlock) {
        let megabytes = |bytes: u64| (bytes as f64 / 1e6).round() as u64;
        let mut sizes: Vec<String> = block
            .messages_by_topic
            .iter()
            .filter_map(|(topic, messages)| {
                let size = messages.iter().map(|m| m.payload.size_in_bytes() as u64).sum();
                let size = megabytes(size);
                (size > 0).then(|| format!("- {topic}: {size}MB"))
            })
            .collect();
        sizes.sort();
        warn!(size_in_bytes = block.size_in_bytes, "very large block");
        if let Some(extension_point) = self.extension_point.get() {
            (extension_point.report_metadata_callback)(ProviderMetadata::warn(
                "Very large block found",
                format!(
                    "A very large block ({}ms) was found: {}MB. Too much data can cause performance problems and even crashes. Please fix this where the data is being generated.\n\nBreakdown of large topics:\n{}",
                    layout.block_size_ns / 1_000_000,
                    megabytes(block.size_in_bytes),
                    sizes.join("\n")
                ),
            ));
        }
    }

    /// Drop blocks outside the budget, never those in `bad_eviction_range`
    fn purge(&self, state: &mut CacheState, bad_eviction_range: Option<&Range<usize>>) {
        let Some(max_cache_size) = self.cache_size_bytes else {
            return;
        };
        let sizes: Vec<Option<u64>> = state
            .blocks
            .iter()
            .map(|block| block.as_ref().map(|block| block.size_in_bytes))
            .collect();
        let (keep, recent) = blocks_to_keep(
            &state.recent_block_ranges,
            &sizes,
            max_cache_size,
            bad_eviction_range,
        );
        state.recent_block_ranges = recent;
        let mut evicted = 0;
        for (index, block) in state.blocks.iter_mut().enumerate() {
            if block.is_some() && !keep.contains(&index) {
                *block = None;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, kept = keep.len(), "purged memory cache blocks");
        }
    }

    fn report_progress(&self, state: &CacheState, layout: &BlockLayout) {
        let Some(extension_point) = self.extension_point.get() else {
            return;
        };
        let count = layout.block_count as f64;
        (extension_point.progress_callback)(Progress {
            fully_loaded_fraction_ranges: state
                .downloaded_block_ranges()
                .into_iter()
                .map(|range| range.start as f64 / count..range.end as f64 / count)
                .collect(),
            message_cache: Some(BlockCache {
                blocks: state.blocks.clone(),
                start_time: layout.start,
            }),
        });
    }

    /// Next block worth loading in the background, if any
    fn next_prefetch_block(&self, state: &CacheState, layout: &BlockLayout) -> Option<usize> {
        if state.topics.is_empty() {
            return None;
        }
        let cursor = state.last_resolved_end?;
        if let Some(index) = layout
            .read_ahead_range(cursor)
            .find(|&index| !state.has_block(index))
        {
            return Some(index);
        }
        if self
            .cache_size_bytes
            .is_some_and(|max| state.bytes_used() >= max)
        {
            return None;
        }
        let uncached = ranges::missing(&(0..layout.block_count), &state.downloaded_block_ranges());
        prefetch_start_point(&uncached, cursor)
    }

    async fn prefetch(&self, generation: u64) -> Result<()> {
        let layout = self.layout()?;
        loop {
            let mut state = self.state.lock().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let Some(index) = self.next_prefetch_block(&state, &layout) else {
                debug!("memory cache prefetch idle");
                return Ok(());
            };
            let topics = state.topics.clone();
            state.recent_block_ranges =
                ranges::merge_into_unsorted(index..index + 1, &state.recent_block_ranges);
            self.load_block(&mut state, &layout, index, &topics).await?;
            let read_ahead = state
                .last_resolved_end
                .map(|end| layout.read_ahead_range(end));
            self.purge(&mut state, read_ahead.as_ref());
            self.report_progress(&state, &layout);
        }
    }

    fn spawn_prefetch(self: &Arc<Self>, generation: u64) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.prefetch(generation).await {
                warn!(error = %err, "memory cache prefetch failed");
                if let Some(extension_point) = inner.extension_point.get() {
                    (extension_point.report_metadata_callback)(ProviderMetadata::error(
                        "MemoryCacheDataProvider connection",
                        err.to_string(),
                    ));
                }
            }
        });
    }
}

/// Caches a single child's messages in memory, block by block
pub struct MemoryCacheDataProvider {
    inner: Arc<Inner>,
}

impl MemoryCacheDataProvider {
    /// Wrap exactly one child with the default byte budget
    pub fn new(mut children: Vec<Arc<dyn DataProvider>>) -> Result<Self> {
        if children.len() != 1 {
            return Err(PlaybackError::configuration(format!(
                "Incorrect number of children to MemoryCacheDataProvider: {}",
                children.len()
            )));
        }
        Ok(Self::build(children.remove(0), Some(DEFAULT_CACHE_SIZE_BYTES), true))
    }

    fn build(child: Arc<dyn DataProvider>, cache_size_bytes: Option<u64>, prefetch: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                child,
                cache_size_bytes,
                prefetch,
                layout: OnceLock::new(),
                extension_point: OnceLock::new(),
                state: Mutex::new(CacheState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Byte budget for resident blocks; `None` never evicts
    pub fn with_cache_size_bytes(self, cache_size_bytes: Option<u64>) -> Self {
        Self::build(self.inner.child.clone(), cache_size_bytes, self.inner.prefetch)
    }

    /// Whether to keep loading blocks after a request is served
    pub fn with_prefetch(self, prefetch: bool) -> Self {
        Self::build(self.inner.child.clone(), self.inner.cache_size_bytes, prefetch)
    }
}

#[async_trait]
impl DataProvider for MemoryCacheDataProvider {
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult> {
        if self.inner.layout.get().is_some() {
            return Err(PlaybackError::AlreadyInitialized);
        }
        // Progress is reported per block from here, not by the child
        let result = self
            .inner
            .child
            .initialize(ExtensionPoint {
                progress_callback: Arc::new(|_: Progress| {}),
                ..extension_point.clone()
            })
            .await?;

        let layout = BlockLayout::new(result.start, result.end);
        self.inner
            .layout
            .set(layout)
            .map_err(|_| PlaybackError::AlreadyInitialized)?;
        let _ = self.inner.extension_point.set(extension_point);

        let mut state = self.inner.state.lock().await;
        state.blocks = vec![None; layout.block_count];
        self.inner.report_progress(&state, &layout);
        info!(
            blocks = layout.block_count,
            block_size_ms = layout.block_size_ns / 1_000_000,
            cache_size_bytes = ?self.inner.cache_size_bytes,
            "memory cache initialized"
        );
        Ok(result)
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        let inner = &self.inner;
        let layout = inner.layout()?;
        let topics = normalized_topics(topics);
        if topics.is_empty() || end < layout.start || layout.end < start {
            return Ok(Vec::new());
        }
        let start = start.clamp_to(layout.start, layout.end);
        let end = end.clamp_to(layout.start, layout.end);
        let block_range = layout.block_range(start, end);

        // A running prefetch yields at its next block
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = inner.state.lock().await;
        state.topics = topics.clone();
        state.recent_block_ranges =
            ranges::merge_into_unsorted(block_range.clone(), &state.recent_block_ranges);

        for index in block_range.clone() {
            inner.load_block(&mut state, &layout, index, &topics).await?;
            inner.purge(&mut state, Some(&block_range));
            inner.report_progress(&state, &layout);
        }

        let mut messages = Vec::new();
        for index in block_range.clone() {
            let Some(block) = state.blocks.get(index).and_then(Option::as_ref) else {
                return Err(PlaybackError::generic(format!("memory cache block {index} missing after load")));
            };
            for messages_on_topic in topics.iter().filter_map(|topic| block.messages_by_topic.get(topic)) {
                messages.extend(
                    messages_on_topic
                        .iter()
                        .filter(|message| message.receive_time.is_within(start, end))
                        .cloned(),
                );
            }
        }
        messages.sort_by_key(|message| message.receive_time);
        state.last_resolved_end = Some(block_range.end);
        drop(state);

        debug!(%start, %end, blocks = ?block_range, count = messages.len(), "memory cache get_messages");
        if inner.prefetch {
            inner.spawn_prefetch(generation);
        }
        Ok(messages)
    }

    async fn close(&self) -> Result<()> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.child.close().await
    }
}
