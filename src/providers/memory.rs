//! A provider over an in-memory message list
//!
//! Used as a fixture in tests and as the leaf of provider trees built in code.
//! Every `get_messages` call is recorded so callers can assert how often a
//! decorator actually reached its child.

use super::{DataProvider, ExtensionPoint, InitializationResult};
use crate::definitions::Datatypes;
use crate::error::{PlaybackError, Result};
use crate::time::Time;
use crate::types::{Message, Topic};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Arguments of one `get_messages` call
#[derive(Debug, Clone, PartialEq)]
pub struct GetMessagesCall {
    pub start: Time,
    pub end: Time,
    pub topics: Vec<String>,
}

#[derive(Debug)]
pub struct MemoryDataProvider {
    messages: Vec<Message>,
    topics: Vec<Topic>,
    datatypes: Datatypes,
    range: Option<(Time, Time)>,
    provides_parsed_messages: bool,
    close_error: Option<String>,
    calls: Mutex<Vec<GetMessagesCall>>,
    closed: AtomicBool,
}

impl MemoryDataProvider {
    /// Provider serving `messages`; topics and time range are derived from them
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|message| message.receive_time);

        let mut seen = HashSet::new();
        let topics = messages
            .iter()
            .filter(|message| seen.insert(message.topic.clone()))
            .map(|message| Topic::new(&message.topic, &message.datatype))
            .collect();

        let provides_parsed_messages = messages.first().is_some_and(|m| !m.payload.is_raw());

        Self {
            messages,
            topics,
            datatypes: Datatypes::new(),
            range: None,
            provides_parsed_messages,
            close_error: None,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_datatypes(mut self, datatypes: Datatypes) -> Self {
        self.datatypes = datatypes;
        self
    }

    /// Override the reported time range
    pub fn with_range(mut self, start: Time, end: Time) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn with_parsed_messages(mut self, provides_parsed_messages: bool) -> Self {
        self.provides_parsed_messages = provides_parsed_messages;
        self
    }

    /// Make `close` fail with a generic error
    pub fn with_close_error(mut self, message: impl Into<String>) -> Self {
        self.close_error = Some(message.into());
        self
    }

    /// Every `get_messages` call so far, oldest first
    pub fn calls(&self) -> Vec<GetMessagesCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn time_range(&self) -> (Time, Time) {
        self.range.unwrap_or_else(|| {
            let start = self.messages.first().map(|m| m.receive_time).unwrap_or_default();
            let end = self.messages.last().map(|m| m.receive_time).unwrap_or_default();
            (start, end)
        })
    }
}

#[async_trait]
impl DataProvider for MemoryDataProvider {
    async fn initialize(&self, _extension_point: ExtensionPoint) -> Result<InitializationResult> {
        let (start, end) = self.time_range();
        Ok(InitializationResult {
            start,
            end,
            topics: self.topics.clone(),
            datatypes: self.datatypes.clone(),
            provides_parsed_messages: self.provides_parsed_messages,
            ..Default::default()
        })
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        debug!(%start, %end, ?topics, "memory get_messages");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(GetMessagesCall {
                start,
                end,
                topics: topics.to_vec(),
            });
        }

        Ok(self
            .messages
            .iter()
            .filter(|message| message.receive_time.is_within(start, end))
            .filter(|message| topics.contains(&message.topic))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match &self.close_error {
            Some(message) => Err(PlaybackError::generic(message.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, sec: i64) -> Message {
        Message::raw(topic, "std_msgs/msg/String", Time::from_sec(sec), vec![sec as u8])
    }

    #[tokio::test]
    async fn derives_topics_and_range_from_messages() {
        let provider = MemoryDataProvider::new(vec![message("/b", 3), message("/a", 1)]);
        let result = provider.initialize(ExtensionPoint::noop()).await.unwrap();

        assert_eq!(result.start, Time::from_sec(1));
        assert_eq!(result.end, Time::from_sec(3));
        let names: Vec<_> = result.topics.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["/a", "/b"]);
        assert!(!result.provides_parsed_messages);
    }

    #[tokio::test]
    async fn filters_by_inclusive_range_and_topics() {
        let provider =
            MemoryDataProvider::new(vec![message("/a", 1), message("/b", 2), message("/a", 3)]);

        let messages = provider
            .get_messages(Time::from_sec(1), Time::from_sec(3), &["/a".to_string()])
            .await
            .unwrap();
        let times: Vec<_> = messages.iter().map(|m| m.receive_time.sec).collect();
        assert_eq!(times, vec![1, 3]);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn close_error_still_marks_closed() {
        let provider = MemoryDataProvider::new(Vec::new()).with_close_error("boom");
        assert!(provider.close().await.is_err());
        assert!(provider.is_closed());
    }
}
