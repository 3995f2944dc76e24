//! Prefetching decorator around a single child provider
//!
//! Keeps two windows: `current`, the one being served, and `next`, fetched in
//! the background right after `current` ends. Sequential playback then almost
//! always finds its data already loaded. Calls are serialized through a fair
//! async mutex, so the child never sees overlapping reads from this provider.

use super::{DataProvider, ExtensionPoint, InitializationResult};
use crate::error::{PlaybackError, Result};
use crate::time::Time;
use crate::types::Message;
use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How far past the requested range the next window reaches
pub const DEFAULT_READ_AHEAD_RANGE: Time = Time {
    sec: 0,
    nsec: 100_000_000,
};

enum Fetch {
    Pending(JoinHandle<Result<Vec<Message>>>),
    Ready(Arc<Vec<Message>>),
}

/// A contiguous time window and the messages fetched for it
struct ReadResult {
    start: Time,
    end: Time,
    fetch: Fetch,
}

impl ReadResult {
    fn overlaps(&self, start: Time, end: Time) -> bool {
        !(end < self.start || self.end < start)
    }

    async fn resolve(&mut self) -> Result<Arc<Vec<Message>>> {
        match &mut self.fetch {
            Fetch::Ready(messages) => Ok(messages.clone()),
            Fetch::Pending(handle) => {
                debug!(start = %self.start, end = %self.end, "waiting on read-ahead window");
                let messages = Arc::new(
                    handle
                        .await
                        .map_err(|err| PlaybackError::generic(format!("read-ahead task failed: {err}")))??,
                );
                self.fetch = Fetch::Ready(messages.clone());
                Ok(messages)
            }
        }
    }

    async fn messages_in(&mut self, start: Time, end: Time) -> Result<Vec<Message>> {
        let all = self.resolve().await?;
        Ok(all
            .iter()
            .filter(|message| message.receive_time.is_within(start, end))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct ReadAheadState {
    topics: Vec<String>,
    current: Option<ReadResult>,
    next: Option<ReadResult>,
}

impl ReadAheadState {
    fn reset(&mut self, topics: &[String]) {
        self.topics = topics.to_vec();
        self.current = None;
        self.next = None;
    }
}

pub struct ReadAheadDataProvider {
    child: Arc<dyn DataProvider>,
    read_ahead_range: Time,
    range: OnceLock<(Time, Time)>,
    state: Mutex<ReadAheadState>,
}

impl ReadAheadDataProvider {
    /// Wrap exactly one child
    pub fn new(mut children: Vec<Arc<dyn DataProvider>>) -> Result<Self> {
        if children.len() != 1 {
            return Err(PlaybackError::configuration(format!(
                "Incorrect number of children to ReadAheadDataProvider: {}",
                children.len()
            )));
        }
        let child = children.remove(0);
        Ok(Self {
            child,
            read_ahead_range: DEFAULT_READ_AHEAD_RANGE,
            range: OnceLock::new(),
            state: Mutex::new(ReadAheadState::default()),
        })
    }

    pub fn with_read_ahead_range(mut self, read_ahead_range: Time) -> Self {
        self.read_ahead_range = read_ahead_range;
        self
    }

    /// Start fetching `[start, end]` from the child in the background
    fn spawn_read(&self, start: Time, end: Time, topics: &[String]) -> ReadResult {
        let child = self.child.clone();
        let topics = topics.to_vec();
        let handle = tokio::spawn(async move { child.get_messages(start, end, &topics).await });
        ReadResult {
            start,
            end,
            fetch: Fetch::Pending(handle),
        }
    }

    /// Window following `after`, or `None` past the end of the child's range
    fn spawn_next(&self, after: Time, child_end: Time, topics: &[String]) -> Option<ReadResult> {
        let next_start = after.add(Time::ONE_NANOSECOND);
        if next_start > child_end {
            return None;
        }
        let next_end = next_start.add(self.read_ahead_range).min(child_end);
        Some(self.spawn_read(next_start, next_end, topics))
    }

    async fn read(
        &self,
        state: &mut ReadAheadState,
        start: Time,
        end: Time,
        topics: &[String],
        child_end: Time,
    ) -> Result<Vec<Message>> {
        let topics_cached = topics.iter().all(|topic| state.topics.contains(topic));
        let seek_backward = state.current.as_ref().map_or(true, |current| start < current.start);
        if !topics_cached || seek_backward {
            debug!(%start, ?topics, "resetting read-ahead windows");
            state.reset(topics);
        }

        let mut messages = Vec::new();
        // Last time served from cached windows; coverage is contiguous from `start`
        let mut served_until = None;
        if let Some(current) = state.current.as_mut().filter(|c| c.overlaps(start, end)) {
            messages.extend(current.messages_in(start, end).await?);
            served_until = Some(current.end);
        }
        let next_matches = state.next.as_ref().is_some_and(|n| n.overlaps(start, end));
        if let Some(next) = state.next.as_mut().filter(|_| next_matches) {
            messages.extend(next.messages_in(start, end).await?);
            served_until = Some(next.end);
        }

        match served_until {
            Some(until) if until >= end => {
                if next_matches {
                    state.current = state.next.take();
                    if let Some(current_end) = state.current.as_ref().map(|c| c.end) {
                        state.next = self.spawn_next(current_end, child_end, &state.topics);
                    }
                }
            }
            served => {
                let fetch_start = match served {
                    Some(until) => {
                        warn!(
                            requested_end = %end,
                            cached_until = %until,
                            "read-ahead cache overrun, consider expanding the read-ahead range"
                        );
                        until.add(Time::ONE_NANOSECOND)
                    }
                    None => start,
                };
                let mut current = self.spawn_read(fetch_start, end, &state.topics);
                messages.extend(current.messages_in(fetch_start, end).await?);
                state.current = Some(current);
                state.next = self.spawn_next(end, child_end, &state.topics);
            }
        }

        messages.retain(|message| topics.contains(&message.topic));
        Ok(messages)
    }
}

#[async_trait]
impl DataProvider for ReadAheadDataProvider {
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult> {
        let result = self.child.initialize(extension_point).await?;
        self.range
            .set((result.start, result.end))
            .map_err(|_| PlaybackError::AlreadyInitialized)?;
        Ok(result)
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        let (child_start, child_end) = *self.range.get().ok_or(PlaybackError::NotInitialized)?;
        if end < child_start || child_end < start {
            return Ok(Vec::new());
        }
        let start = start.clamp_to(child_start, child_end);
        let end = end.clamp_to(child_start, child_end);

        let mut state = self.state.lock().await;
        let result = self.read(&mut state, start, end, topics, child_end).await;
        if result.is_err() {
            // A failed window must not be served again
            state.reset(&[]);
        }
        result
    }

    async fn close(&self) -> Result<()> {
        self.child.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::{GetMessagesCall, MemoryDataProvider};

    fn message(topic: &str, millis: i64) -> Message {
        Message::raw(topic, "std_msgs/msg/String", Time::from_millis(millis), Vec::new())
    }

    fn millis(messages: &[Message]) -> Vec<i64> {
        messages
            .iter()
            .map(|m| m.receive_time.sec * 1000 + m.receive_time.nsec as i64 / 1_000_000)
            .collect()
    }

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    async fn setup() -> (Arc<MemoryDataProvider>, ReadAheadDataProvider) {
        let child = Arc::new(MemoryDataProvider::new(
            (0..=20).flat_map(|i| [message("/a", i * 50), message("/b", i * 50)]).collect(),
        ));
        let provider = ReadAheadDataProvider::new(vec![child.clone() as Arc<dyn DataProvider>]).unwrap();
        provider.initialize(ExtensionPoint::noop()).await.unwrap();
        (child, provider)
    }

    fn calls_for(calls: &[GetMessagesCall], start: i64, end: i64) -> usize {
        calls
            .iter()
            .filter(|call| call.start == Time::from_millis(start) && call.end == Time::from_millis(end))
            .count()
    }

    #[test]
    fn requires_exactly_one_child() {
        assert!(ReadAheadDataProvider::new(Vec::new()).is_err());
        let child = || Arc::new(MemoryDataProvider::new(Vec::new())) as Arc<dyn DataProvider>;
        assert!(ReadAheadDataProvider::new(vec![child(), child()]).is_err());
    }

    #[tokio::test]
    async fn repeated_request_is_served_from_cache() {
        let (child, provider) = setup().await;
        let a = topics(&["/a"]);

        let first = provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &a)
            .await
            .unwrap();
        let second = provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &a)
            .await
            .unwrap();

        assert_eq!(millis(&first), vec![0, 50, 100]);
        assert_eq!(millis(&second), vec![0, 50, 100]);
        assert_eq!(calls_for(&child.calls(), 0, 100), 1);
    }

    #[tokio::test]
    async fn sequential_reads_come_from_the_next_window() {
        let (child, provider) = setup().await;
        let a = topics(&["/a"]);

        provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &a)
            .await
            .unwrap();
        let next_start = Time::from_millis(100).add(Time::ONE_NANOSECOND);
        let messages = provider
            .get_messages(next_start, Time::from_millis(200), &a)
            .await
            .unwrap();

        assert_eq!(millis(&messages), vec![150, 200]);
        // No fetch was issued for exactly the requested range
        assert!(child.calls().iter().all(|call| call.start != next_start
            || call.end != Time::from_millis(200)));
    }

    #[tokio::test]
    async fn backward_seek_refetches() {
        let (child, provider) = setup().await;
        let a = topics(&["/a"]);

        provider
            .get_messages(Time::from_millis(500), Time::from_millis(600), &a)
            .await
            .unwrap();
        let messages = provider
            .get_messages(Time::from_millis(100), Time::from_millis(200), &a)
            .await
            .unwrap();

        assert_eq!(millis(&messages), vec![100, 150, 200]);
        assert_eq!(calls_for(&child.calls(), 100, 200), 1);
    }

    #[tokio::test]
    async fn new_topics_reset_the_cache() {
        let (child, provider) = setup().await;

        provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &topics(&["/a"]))
            .await
            .unwrap();
        let messages = provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &topics(&["/a", "/b"]))
            .await
            .unwrap();

        assert_eq!(messages.len(), 6);
        assert_eq!(calls_for(&child.calls(), 0, 100), 2);

        // A subset of the cached topics is filtered, not refetched
        let only_b = provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &topics(&["/b"]))
            .await
            .unwrap();
        assert!(only_b.iter().all(|m| m.topic == "/b"));
        assert_eq!(calls_for(&child.calls(), 0, 100), 2);
    }

    #[tokio::test]
    async fn overrun_fetches_only_the_missing_part() {
        let (child, provider) = setup().await;
        let a = topics(&["/a"]);

        provider
            .get_messages(Time::from_millis(0), Time::from_millis(100), &a)
            .await
            .unwrap();
        let messages = provider
            .get_messages(Time::from_millis(0), Time::from_millis(400), &a)
            .await
            .unwrap();

        assert_eq!(millis(&messages), vec![0, 50, 100, 150, 200, 250, 300, 350, 400]);
        let next_end = Time::from_millis(200).add(Time::ONE_NANOSECOND);
        assert!(child
            .calls()
            .iter()
            .any(|call| call.start == next_end.add(Time::ONE_NANOSECOND)
                && call.end == Time::from_millis(400)));
    }

    #[tokio::test]
    async fn clamps_to_the_child_range() {
        let (child, provider) = setup().await;
        let a = topics(&["/a"]);

        let outside = provider
            .get_messages(Time::from_sec(5), Time::from_sec(6), &a)
            .await
            .unwrap();
        assert!(outside.is_empty());
        assert!(child.calls().is_empty());

        let tail = provider
            .get_messages(Time::from_millis(950), Time::from_sec(3), &a)
            .await
            .unwrap();
        assert_eq!(millis(&tail), vec![950, 1000]);
        assert_eq!(calls_for(&child.calls(), 950, 1000), 1);
    }
}
