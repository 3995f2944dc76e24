//! Range-caching reads over a streaming byte source
//!
//! [`CachedFilelike`] serves byte ranges out of a [`VirtualLruBuffer`] and
//! fetches what is missing from a [`FileReader`]. Fetch failures are retried:
//! with a keep-reconnecting callback the reader retries forever with backoff
//! and reports the reconnecting state; without one, a second failure within
//! 100ms fails the read and closes the reader.

pub mod buffer;
pub mod ranges;

pub use buffer::VirtualLruBuffer;

use crate::error::{PlaybackError, Result};
use async_trait::async_trait;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 10 MiB blocks
pub const CACHE_BLOCK_SIZE: u64 = 10 * 1024 * 1024;

/// Two errors closer together than this fail the read
const ERROR_WINDOW: Duration = Duration::from_millis(100);

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// A source of file bytes (local file, HTTP range requests, ...)
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Open the source and return its size in bytes
    async fn open(&self) -> Result<u64>;

    /// Fetch `length` bytes starting at `offset`
    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
}

/// Reads a file on the local filesystem
pub struct LocalFileReader {
    path: PathBuf,
}

impl LocalFileReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FileReader for LocalFileReader {
    async fn open(&self) -> Result<u64> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|_| {
            PlaybackError::StorageFileNotFound {
                path: self.path.clone(),
            }
        })?;
        Ok(metadata.len())
    }

    async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0; length as usize];
        file.read_exact(&mut data).await?;
        Ok(data)
    }
}

pub type ReconnectingCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type RangesCallback = Arc<dyn Fn(&[Range<u64>]) + Send + Sync>;

struct State {
    buffer: Option<VirtualLruBuffer>,
    last_error: Option<Instant>,
    consecutive_errors: u32,
    closed: bool,
}

/// Caching byte reader over a [`FileReader`]
pub struct CachedFilelike {
    reader: Arc<dyn FileReader>,
    cache_size: u64,
    keep_reconnecting: Option<ReconnectingCallback>,
    on_ranges: Option<RangesCallback>,
    state: Mutex<State>,
}

impl CachedFilelike {
    pub fn new(reader: Arc<dyn FileReader>, cache_size: u64) -> Self {
        Self {
            reader,
            cache_size: cache_size.max(1),
            keep_reconnecting: None,
            on_ranges: None,
            state: Mutex::new(State {
                buffer: None,
                last_error: None,
                consecutive_errors: 0,
                closed: false,
            }),
        }
    }

    /// Keep retrying failed fetches, reporting whether we are reconnecting
    pub fn with_keep_reconnecting(mut self, callback: ReconnectingCallback) -> Self {
        self.keep_reconnecting = Some(callback);
        self
    }

    /// Called with the resident byte ranges after every fetch
    pub fn with_ranges_callback(mut self, callback: RangesCallback) -> Self {
        self.on_ranges = Some(callback);
        self
    }

    pub fn cache_size(&self) -> u64 {
        self.cache_size
    }

    /// Open the source (once) and return the file size
    pub async fn open(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state).await
    }

    async fn open_locked(&self, state: &mut State) -> Result<u64> {
        if let Some(buffer) = &state.buffer {
            return Ok(buffer.byte_length());
        }
        let size = self.reader.open().await?;
        let buffer = if self.cache_size >= size {
            VirtualLruBuffer::unbounded(size)
        } else {
            // One extra block on each side for reads not aligned to block boundaries
            let blocks = self.cache_size.div_ceil(CACHE_BLOCK_SIZE) as usize + 2;
            VirtualLruBuffer::new(size, CACHE_BLOCK_SIZE, blocks)
        };
        info!(size_mib = size as f64 / 1024.0 / 1024.0, "opened file");
        state.buffer = Some(buffer);
        Ok(size)
    }

    /// File size; requires a prior `open` or `read`
    pub async fn size(&self) -> Result<u64> {
        let state = self.state.lock().await;
        state
            .buffer
            .as_ref()
            .map(VirtualLruBuffer::byte_length)
            .ok_or_else(|| PlaybackError::generic("CachedFilelike has not been opened"))
    }

    /// Read `length` bytes at `offset`
    pub async fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if length > self.cache_size {
            return Err(PlaybackError::configuration(format!(
                "requested more data than cache size: {length} > {}",
                self.cache_size
            )));
        }

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PlaybackError::generic("CachedFilelike was closed after repeated errors"));
        }
        let size = self.open_locked(&mut state).await?;
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= size)
            .ok_or_else(|| PlaybackError::generic(format!("invalid read {offset}+{length} of {size}")))?;
        debug!(offset, length, "requested range");

        loop {
            let missing = match &state.buffer {
                Some(buffer) => ranges::missing(&(offset..end), buffer.ranges_with_data()),
                None => return Err(PlaybackError::generic("CachedFilelike has not been opened")),
            };
            let Some(next) = missing.first() else {
                break;
            };
            let chunk_end = next.end.min(next.start + CACHE_BLOCK_SIZE);
            self.fetch_chunk(&mut state, next.start, chunk_end).await?;
        }

        match state.buffer.as_mut() {
            Some(buffer) => buffer.slice(offset, end),
            None => Err(PlaybackError::generic("CachedFilelike has not been opened")),
        }
    }

    async fn fetch_chunk(&self, state: &mut State, start: u64, end: u64) -> Result<()> {
        match self.reader.fetch(start, end - start).await {
            Ok(data) => {
                if state.last_error.take().is_some() {
                    state.consecutive_errors = 0;
                    if let Some(callback) = &self.keep_reconnecting {
                        callback(false);
                    }
                }
                if let Some(buffer) = state.buffer.as_mut() {
                    buffer.copy_from(&data, start)?;
                    if let Some(callback) = &self.on_ranges {
                        callback(buffer.ranges_with_data());
                    }
                }
                Ok(())
            }
            Err(err) => self.handle_fetch_error(state, start..end, err).await,
        }
    }

    async fn handle_fetch_error(
        &self,
        state: &mut State,
        range: Range<u64>,
        err: PlaybackError,
    ) -> Result<()> {
        let now = Instant::now();
        match &self.keep_reconnecting {
            Some(callback) => {
                if state.last_error.is_none() {
                    callback(true);
                }
                state.consecutive_errors += 1;
                let backoff = INITIAL_BACKOFF
                    .saturating_mul(1 << state.consecutive_errors.min(6))
                    .min(MAX_BACKOFF);
                warn!(?range, error = %err, ?backoff, "fetch failed; reconnecting");
                state.last_error = Some(now);
                tokio::time::sleep(backoff).await;
            }
            None => {
                if let Some(last) = state.last_error {
                    if now.duration_since(last) < ERROR_WINDOW {
                        warn!(?range, error = %err, "fetch failed again; closing");
                        state.closed = true;
                        return Err(err);
                    }
                }
                warn!(?range, error = %err, "fetch failed; trying to continue");
                state.last_error = Some(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MemoryReader {
        data: Vec<u8>,
        fetches: StdMutex<Vec<(u64, u64)>>,
        failures_left: AtomicUsize,
    }

    impl MemoryReader {
        fn new(data: Vec<u8>, failures: usize) -> Arc<Self> {
            Arc::new(Self {
                data,
                fetches: StdMutex::new(Vec::new()),
                failures_left: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait]
    impl FileReader for MemoryReader {
        async fn open(&self) -> Result<u64> {
            Ok(self.data.len() as u64)
        }

        async fn fetch(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
            self.fetches.lock().unwrap().push((offset, length));
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(PlaybackError::Io(std::io::Error::other("connection reset")));
            }
            let start = offset as usize;
            Ok(self.data[start..start + length as usize].to_vec())
        }
    }

    #[tokio::test]
    async fn serves_repeated_reads_from_cache() {
        let reader = MemoryReader::new((0..100).collect(), 0);
        let filelike = CachedFilelike::new(reader.clone(), 1000);

        assert_eq!(filelike.read(10, 5).await.unwrap(), vec![10, 11, 12, 13, 14]);
        assert_eq!(filelike.read(11, 3).await.unwrap(), vec![11, 12, 13]);
        assert_eq!(filelike.size().await.unwrap(), 100);
        assert_eq!(reader.fetches.lock().unwrap().as_slice(), &[(10, 5)]);
    }

    #[tokio::test]
    async fn fetches_only_missing_ranges() {
        let reader = MemoryReader::new((0..100).collect(), 0);
        let filelike = CachedFilelike::new(reader.clone(), 1000);

        filelike.read(10, 10).await.unwrap();
        filelike.read(5, 20).await.unwrap();
        assert_eq!(
            reader.fetches.lock().unwrap().as_slice(),
            &[(10, 10), (5, 5), (20, 5)]
        );
    }

    #[tokio::test]
    async fn reports_resident_ranges() {
        let reader = MemoryReader::new(vec![0; 50], 0);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let filelike = CachedFilelike::new(reader, 1000)
            .with_ranges_callback(Arc::new(move |ranges: &[Range<u64>]| *sink.lock().unwrap() = ranges.to_vec()));

        filelike.read(0, 10).await.unwrap();
        filelike.read(20, 10).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[0..10, 20..30]);
    }

    #[tokio::test]
    async fn rejects_reads_larger_than_cache() {
        let reader = MemoryReader::new(vec![0; 50], 0);
        let filelike = CachedFilelike::new(reader, 10);
        assert!(matches!(
            filelike.read(0, 20).await,
            Err(PlaybackError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn fails_after_two_quick_errors_without_reconnect_callback() {
        let reader = MemoryReader::new(vec![0; 50], 2);
        let filelike = CachedFilelike::new(reader, 1000);

        assert!(filelike.read(0, 10).await.is_err());
        // Closed for good
        assert!(filelike.read(0, 10).await.is_err());
    }

    #[tokio::test]
    async fn single_error_is_retried() {
        let reader = MemoryReader::new((0..50).collect(), 1);
        let filelike = CachedFilelike::new(reader, 1000);
        assert_eq!(filelike.read(0, 3).await.unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_reconnecting_and_reports_state() {
        let reader = MemoryReader::new((0..50).collect(), 3);
        let events = Arc::new(AtomicUsize::new(0));
        let states = Arc::new(StdMutex::new(Vec::new()));
        let (count, log) = (events.clone(), states.clone());
        let filelike = CachedFilelike::new(reader, 1000).with_keep_reconnecting(Arc::new(move |reconnecting: bool| {
            count.fetch_add(1, Ordering::SeqCst);
            log.lock().unwrap().push(reconnecting);
        }));

        assert_eq!(filelike.read(0, 2).await.unwrap(), vec![0, 1]);
        assert_eq!(states.lock().unwrap().as_slice(), &[true, false]);
        assert_eq!(events.load(Ordering::SeqCst), 2);
    }
}
