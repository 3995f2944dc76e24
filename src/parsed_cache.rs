//! Memoized decoding of message payloads
//!
//! [`ParsedMessageCache`] keys entries by the identity of the payload buffer,
//! not its contents: the same `Arc` handed in twice yields the same parsed
//! `Arc` back. Entries are evicted oldest-inserted first once the summed size
//! of the source buffers passes the budget. A hit does not refresh an entry.

use crate::cdr::MessageReader;
use crate::definitions::Datatypes;
use crate::error::{PlaybackError, Result};
use crate::time::Time;
use crate::types::{Message, MessageValue, Payload, Topic};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// Budget for the summed size of cached source buffers
pub const CACHE_SIZE_BYTES: usize = 200_000_000;

/// A message with a decoded payload
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub topic: String,
    pub datatype: String,
    pub receive_time: Time,
    pub message: Arc<MessageValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Raw(usize),
    Binary(usize),
}

struct CacheEntry {
    /// Held so the buffer address stays unique while the entry lives
    _source: Arc<[u8]>,
    parsed: Arc<MessageValue>,
    size_in_bytes: usize,
}

pub struct ParsedMessageCache {
    budget: usize,
    entries: HashMap<CacheKey, CacheEntry>,
    insertion_order: VecDeque<CacheKey>,
    total_bytes: usize,
}

impl Default for ParsedMessageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ParsedMessageCache {
    pub fn new() -> Self {
        Self::with_budget(CACHE_SIZE_BYTES)
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            total_bytes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summed size of the source buffers currently cached
    pub fn size_in_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Decode `messages` in order, reusing earlier results for the same buffers
    pub fn parse_messages(
        &mut self,
        messages: &[Message],
        readers_by_topic: &HashMap<String, MessageReader>,
    ) -> Result<Vec<ParsedMessage>> {
        let parsed = messages
            .iter()
            .map(|message| {
                let value = self.parse_payload(message, readers_by_topic)?;
                Ok(ParsedMessage {
                    topic: message.topic.clone(),
                    datatype: message.datatype.clone(),
                    receive_time: message.receive_time,
                    message: value,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.evict();
        Ok(parsed)
    }

    fn parse_payload(
        &mut self,
        message: &Message,
        readers_by_topic: &HashMap<String, MessageReader>,
    ) -> Result<Arc<MessageValue>> {
        let (key, source) = match &message.payload {
            Payload::Parsed(value) => return Ok(value.clone()),
            Payload::Wrapped(object) => return Ok(object.deep_parse()),
            Payload::Raw(bytes) => (CacheKey::Raw(buffer_address(bytes)), bytes),
            Payload::Binary(object) => (CacheKey::Binary(buffer_address(object.buffer())), object.buffer()),
        };

        if let Some(entry) = self.entries.get(&key) {
            return Ok(entry.parsed.clone());
        }

        let parsed = Arc::new(match &message.payload {
            Payload::Binary(object) => object.deep_parse()?,
            _ => readers_by_topic
                .get(&message.topic)
                .ok_or_else(|| PlaybackError::ReaderNotFound {
                    topic: message.topic.clone(),
                })?
                .read(source)?,
        });

        trace!(topic = %message.topic, bytes = source.len(), "cached parsed message");
        self.total_bytes += source.len();
        self.insertion_order.push_back(key);
        self.entries.insert(
            key,
            CacheEntry {
                _source: source.clone(),
                parsed: parsed.clone(),
                size_in_bytes: source.len(),
            },
        );
        Ok(parsed)
    }

    fn evict(&mut self) {
        while self.total_bytes > self.budget {
            let Some(key) = self.insertion_order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_bytes -= entry.size_in_bytes;
            }
        }
    }
}

fn buffer_address(buffer: &Arc<[u8]>) -> usize {
    Arc::as_ptr(buffer) as *const u8 as usize
}

/// One reader per topic whose datatype is known
///
/// Topics with unknown datatypes are skipped; parsing their raw messages then
/// fails with [`PlaybackError::ReaderNotFound`].
pub fn readers_for_topics(topics: &[Topic], datatypes: &Arc<Datatypes>) -> HashMap<String, MessageReader> {
    topics
        .iter()
        .filter_map(|topic| {
            MessageReader::new(&topic.datatype, datatypes)
                .ok()
                .map(|reader| (topic.name.clone(), reader))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::parse_message_definition;
    use crate::types::{BinaryObject, WrappedObject};

    const STRING_TYPE: &str = "std_msgs/msg/String";

    fn datatypes() -> Arc<Datatypes> {
        Arc::new(parse_message_definition(STRING_TYPE, "string data").unwrap())
    }

    fn readers() -> HashMap<String, MessageReader> {
        readers_for_topics(&[Topic::new("/chatter", STRING_TYPE)], &datatypes())
    }

    /// CDR little-endian `std_msgs/String`
    fn cdr_string(text: &str) -> Vec<u8> {
        let mut bytes = vec![0x00, 0x01, 0x00, 0x00];
        bytes.extend_from_slice(&(text.len() as u32 + 1).to_le_bytes());
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        bytes
    }

    fn raw(text: &str, sec: i64) -> Message {
        Message::raw("/chatter", STRING_TYPE, Time::from_sec(sec), cdr_string(text))
    }

    #[test]
    fn memoizes_by_buffer_identity() {
        let mut cache = ParsedMessageCache::new();
        let messages = vec![raw("hello", 1), raw("world", 2)];

        let first = cache.parse_messages(&messages, &readers()).unwrap();
        let second = cache.parse_messages(&messages, &readers()).unwrap();

        assert!(Arc::ptr_eq(&first[0].message, &second[0].message));
        assert!(Arc::ptr_eq(&first[1].message, &second[1].message));
        assert_eq!(
            first[0].message.field("data"),
            Some(&MessageValue::String("hello".to_string()))
        );
        assert_eq!(first[1].receive_time, Time::from_sec(2));

        // Equal bytes in a different buffer are a different message
        let copy = vec![raw("hello", 1)];
        let third = cache.parse_messages(&copy, &readers()).unwrap();
        assert!(!Arc::ptr_eq(&first[0].message, &third[0].message));
        assert_eq!(first[0].message, third[0].message);
    }

    #[test]
    fn evicts_oldest_entries_past_the_budget() {
        let small = vec![raw("a", 1)];
        let big = vec![raw(&"x".repeat(64), 2)];
        let mut cache = ParsedMessageCache::with_budget(32);

        let first = cache.parse_messages(&small, &readers()).unwrap();
        let second = cache.parse_messages(&small, &readers()).unwrap();
        assert!(Arc::ptr_eq(&first[0].message, &second[0].message));

        cache.parse_messages(&big, &readers()).unwrap();
        assert!(cache.size_in_bytes() <= 32);

        let third = cache.parse_messages(&small, &readers()).unwrap();
        assert!(!Arc::ptr_eq(&first[0].message, &third[0].message));
    }

    #[test]
    fn eviction_is_by_insertion_not_use() {
        let a = vec![raw("aaaa", 1)];
        let b = vec![raw("bbbb", 2)];
        let c = vec![raw("cccc", 3)];
        let entry_size = cdr_string("aaaa").len();
        let mut cache = ParsedMessageCache::with_budget(entry_size * 2);

        let first_a = cache.parse_messages(&a, &readers()).unwrap();
        cache.parse_messages(&b, &readers()).unwrap();
        // Touching `a` again does not make it newer
        cache.parse_messages(&a, &readers()).unwrap();
        cache.parse_messages(&c, &readers()).unwrap();

        assert_eq!(cache.len(), 2);
        let again = cache.parse_messages(&a, &readers()).unwrap();
        assert!(!Arc::ptr_eq(&first_a[0].message, &again[0].message));
    }

    #[test]
    fn structured_payloads_pass_through() {
        let value = MessageValue::Struct(vec![("data".to_string(), MessageValue::String("hi".into()))]);
        let parsed = Message::parsed("/chatter", STRING_TYPE, Time::from_sec(1), value.clone());
        let wrapped = Message {
            topic: "/chatter".to_string(),
            datatype: STRING_TYPE.to_string(),
            receive_time: Time::from_sec(2),
            payload: Payload::Wrapped(WrappedObject::new(STRING_TYPE, value.clone())),
        };
        let mut cache = ParsedMessageCache::new();

        let result = cache
            .parse_messages(&[parsed.clone(), wrapped], &HashMap::new())
            .unwrap();
        assert_eq!(*result[0].message, value);
        assert_eq!(*result[1].message, value);
        assert!(cache.is_empty());
        match &parsed.payload {
            Payload::Parsed(original) => assert!(Arc::ptr_eq(original, &result[0].message)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn binary_objects_are_deep_parsed_and_cached() {
        let object = BinaryObject::new(STRING_TYPE, Arc::from(cdr_string("bin")), datatypes());
        let message = Message {
            topic: "/other".to_string(),
            datatype: STRING_TYPE.to_string(),
            receive_time: Time::from_sec(1),
            payload: Payload::Binary(object),
        };
        let mut cache = ParsedMessageCache::new();

        // No reader needed: binary objects carry their datatypes
        let first = cache.parse_messages(&[message.clone()], &HashMap::new()).unwrap();
        let second = cache.parse_messages(&[message], &HashMap::new()).unwrap();
        assert_eq!(
            first[0].message.field("data"),
            Some(&MessageValue::String("bin".to_string()))
        );
        assert!(Arc::ptr_eq(&first[0].message, &second[0].message));
    }

    #[test]
    fn raw_message_without_reader_fails() {
        let mut cache = ParsedMessageCache::new();
        let err = cache.parse_messages(&[raw("a", 1)], &HashMap::new()).unwrap_err();
        assert!(matches!(err, PlaybackError::ReaderNotFound { topic } if topic == "/chatter"));
    }
}
