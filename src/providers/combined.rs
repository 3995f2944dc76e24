//! Merging several providers into one timeline
//!
//! Each child may carry a topic prefix (e.g. `/webviz_bag_2`) so that two bags
//! recorded with the same topic names can be played side by side. Topics are
//! renamed on the way out and routed back to the owning child on the way in.

use super::{DataProvider, ExtensionPoint, InitializationResult, Progress, ProviderMetadata};
use crate::definitions::Datatypes;
use crate::error::{PlaybackError, Result};
use crate::filelike::ranges;
use crate::time::Time;
use crate::types::{Message, Topic};
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

/// A child provider and the prefix applied to its topics
#[derive(Clone)]
pub struct PrefixedChild {
    pub prefix: Option<String>,
    pub provider: Arc<dyn DataProvider>,
}

impl PrefixedChild {
    pub fn new(provider: Arc<dyn DataProvider>) -> Self {
        Self {
            prefix: None,
            provider,
        }
    }

    pub fn with_prefix(prefix: impl Into<String>, provider: Arc<dyn DataProvider>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            provider,
        }
    }

    fn apply_prefix(&self, topic: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{topic}"),
            None => topic.to_string(),
        }
    }
}

/// What the combined provider remembers about one initialized child
#[derive(Debug)]
struct ChildState {
    start: Time,
    end: Time,
    /// Combined topic name -> name in the child
    to_child: HashMap<String, String>,
    /// Name in the child -> combined topic name
    from_child: HashMap<String, String>,
}

/// Latest progress per child, intersected into one report
struct ProgressTracker {
    per_child: Mutex<Vec<Option<Progress>>>,
    /// Topic prefix per child, applied to reported message caches
    prefixes: Vec<Option<String>>,
    callback: super::ProgressCallback,
}

impl ProgressTracker {
    fn update(&self, index: usize, mut progress: Progress) {
        if let Some(Some(prefix)) = self.prefixes.get(index) {
            progress.message_cache = progress
                .message_cache
                .map(|cache| cache.with_topic_prefix(prefix));
        }
        let combined = {
            let Ok(mut per_child) = self.per_child.lock() else {
                return;
            };
            if let Some(slot) = per_child.get_mut(index) {
                *slot = Some(progress);
            }
            // Children that never reported count as not loaded
            let lists: Vec<_> = per_child
                .iter()
                .map(|p| match p {
                    Some(p) => p.fully_loaded_fraction_ranges.clone(),
                    None => vec![0.0..0.0],
                })
                .collect();
            let message_cache = per_child
                .iter()
                .flatten()
                .filter_map(|p| p.message_cache.clone())
                .reduce(|merged, cache| merged.merged(&cache));
            Progress {
                fully_loaded_fraction_ranges: ranges::deep_intersect(&lists),
                message_cache,
            }
        };
        (self.callback)(combined);
    }

    /// Children that did not report progress while initializing are fully loaded
    fn fill_unreported(&self) {
        if let Ok(mut per_child) = self.per_child.lock() {
            for slot in per_child.iter_mut().filter(|slot| slot.is_none()) {
                *slot = Some(fully_loaded());
            }
        }
    }
}

fn fully_loaded() -> Progress {
    Progress {
        fully_loaded_fraction_ranges: vec![0.0..1.0],
        message_cache: None,
    }
}

struct Initialized {
    /// `None` for children that failed to initialize
    children: Vec<Option<ChildState>>,
    progress: Arc<ProgressTracker>,
}

pub struct CombinedDataProvider {
    children: Vec<PrefixedChild>,
    state: OnceLock<Initialized>,
}

impl CombinedDataProvider {
    /// Validate prefixes and build the provider
    pub fn new(children: Vec<PrefixedChild>) -> Result<Self> {
        if children.is_empty() {
            return Err(PlaybackError::configuration(
                "combined provider needs at least one child",
            ));
        }

        let mut prefixes = HashSet::new();
        for prefix in children.iter().filter_map(|child| child.prefix.as_deref()) {
            if !prefix.starts_with('/') {
                return Err(PlaybackError::InvalidPrefix {
                    prefix: prefix.to_string(),
                });
            }
            if !prefixes.insert(prefix) {
                return Err(PlaybackError::DuplicatePrefix {
                    prefix: prefix.to_string(),
                });
            }
        }

        Ok(Self {
            children,
            state: OnceLock::new(),
        })
    }

    fn state(&self) -> Result<&Initialized> {
        self.state.get().ok_or(PlaybackError::NotInitialized)
    }
}

#[async_trait]
impl DataProvider for CombinedDataProvider {
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult> {
        if self.state.get().is_some() {
            return Err(PlaybackError::AlreadyInitialized);
        }

        let tracker = Arc::new(ProgressTracker {
            per_child: Mutex::new(vec![None; self.children.len()]),
            prefixes: self.children.iter().map(|child| child.prefix.clone()).collect(),
            callback: extension_point.progress_callback.clone(),
        });

        let outcomes = join_all(self.children.iter().enumerate().map(|(index, child)| {
            let tracker = tracker.clone();
            let child_extension_point = ExtensionPoint {
                progress_callback: Arc::new(move |progress| tracker.update(index, progress)),
                ..extension_point.clone()
            };
            child.provider.initialize(child_extension_point)
        }))
        .await;

        // A failed child is reported and left out; the others still play
        let mut succeeded = Vec::new();
        let mut first_error = None;
        for (index, (child, outcome)) in self.children.iter().zip(outcomes).enumerate() {
            match outcome {
                Ok(result) => succeeded.push((index, child, result)),
                Err(err) => {
                    warn!(child = index, error = %err, "child provider failed to initialize");
                    (extension_point.report_metadata_callback)(ProviderMetadata::warn(
                        "Data unavailable",
                        err.to_string(),
                    ));
                    first_error.get_or_insert(err);
                }
            }
        }
        if succeeded.is_empty() {
            return Err(first_error.unwrap_or(PlaybackError::NotInitialized));
        }

        tracker.fill_unreported();

        let combined = combine_results(succeeded.iter().map(|(_, child, result)| (*child, result)))?;
        let mut children: Vec<Option<ChildState>> = self.children.iter().map(|_| None).collect();
        for (index, child, result) in &succeeded {
            let to_child: HashMap<String, String> = result
                .topics
                .iter()
                .map(|topic| (child.apply_prefix(&topic.name), topic.name.clone()))
                .collect();
            let from_child = to_child
                .iter()
                .map(|(combined, original)| (original.clone(), combined.clone()))
                .collect();
            children[*index] = Some(ChildState {
                start: result.start,
                end: result.end,
                to_child,
                from_child,
            });
        }

        self.state
            .set(Initialized {
                children,
                progress: tracker,
            })
            .map_err(|_| PlaybackError::AlreadyInitialized)?;

        info!(
            children = self.children.len(),
            failed = self.children.len() - succeeded.len(),
            topics = combined.topics.len(),
            start = %combined.start,
            end = %combined.end,
            "combined provider initialized"
        );
        Ok(combined)
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        let state = self.state()?;

        let fetches = self
            .children
            .iter()
            .zip(&state.children)
            .enumerate()
            .map(|(index, (child, child_state))| {
                let child_topics: Vec<String> = match child_state {
                    Some(child_state) => topics
                        .iter()
                        .filter_map(|topic| child_state.to_child.get(topic).cloned())
                        .collect(),
                    None => Vec::new(),
                };
                let progress = state.progress.clone();
                async move {
                    let Some(child_state) = child_state else {
                        return Ok(Vec::new());
                    };
                    if child_topics.is_empty() {
                        // Never asked, so the child can't know it is done
                        progress.update(index, fully_loaded());
                        return Ok(Vec::new());
                    }
                    if end < child_state.start || child_state.end < start {
                        return Ok(Vec::new());
                    }
                    let clamped_start = start.clamp_to(child_state.start, child_state.end);
                    let clamped_end = end.clamp_to(child_state.start, child_state.end);

                    let messages = child
                        .provider
                        .get_messages(clamped_start, clamped_end, &child_topics)
                        .await?;
                    messages
                        .into_iter()
                        .map(|mut message| match child_state.from_child.get(&message.topic) {
                            Some(name) => {
                                message.topic = name.clone();
                                Ok(message)
                            }
                            None => Err(PlaybackError::UnexpectedTopic {
                                provider: index,
                                topic: message.topic,
                            }),
                        })
                        .collect::<Result<Vec<_>>>()
                }
            });

        let per_child = try_join_all(fetches).await?;
        debug!(
            %start,
            %end,
            counts = ?per_child.iter().map(Vec::len).collect::<Vec<_>>(),
            "combined get_messages"
        );
        Ok(merge_sorted(per_child))
    }

    async fn close(&self) -> Result<()> {
        let outcomes = join_all(self.children.iter().map(|child| child.provider.close())).await;
        let mut first_error = None;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            if let Err(err) = outcome {
                warn!(child = index, error = %err, "failed to close child provider");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Merge the initialization results of the children that initialized
fn combine_results<'a>(
    initialized: impl Iterator<Item = (&'a PrefixedChild, &'a InitializationResult)> + Clone,
) -> Result<InitializationResult> {
    let results = initialized.clone().map(|(_, result)| result);
    let parsed: HashSet<bool> = results.clone().map(|r| r.provides_parsed_messages).collect();
    if parsed.len() > 1 {
        return Err(PlaybackError::configuration(
            "Data providers provide different message formats",
        ));
    }

    let start = results.clone().map(|r| r.start).min().unwrap_or_default();
    let end = results.map(|r| r.end).max().unwrap_or_default();

    let mut topics = Vec::new();
    let mut seen = HashSet::new();
    let mut message_definitions_by_topic = BTreeMap::new();
    let mut datatypes = Datatypes::new();

    for (child, result) in initialized {
        for topic in &result.topics {
            let name = child.apply_prefix(&topic.name);
            if !seen.insert(name.clone()) {
                return Err(PlaybackError::DuplicateTopic { topic: name });
            }
            let original_topic = match child.prefix {
                Some(_) => Some(topic.original_topic.clone().unwrap_or_else(|| topic.name.clone())),
                None => topic.original_topic.clone(),
            };
            topics.push(Topic {
                name,
                datatype: topic.datatype.clone(),
                original_topic,
            });
        }

        for (topic, definition) in &result.message_definitions_by_topic {
            message_definitions_by_topic.insert(child.apply_prefix(topic), definition.clone());
        }

        for (name, datatype) in &result.datatypes {
            match datatypes.get(name) {
                Some(existing) if existing != datatype => {
                    return Err(PlaybackError::ConflictingDatatype {
                        datatype: name.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    datatypes.insert(name.clone(), datatype.clone());
                }
            }
        }
    }

    Ok(InitializationResult {
        start,
        end,
        topics,
        datatypes,
        provides_parsed_messages: parsed.contains(&true),
        message_definitions_by_topic,
    })
}

/// Stable k-way merge of time-sorted lists
///
/// Messages with equal receive times keep their order within a list, and lists
/// earlier in `lists` win ties against later ones.
pub fn merge_sorted(lists: Vec<Vec<Message>>) -> Vec<Message> {
    let total = lists.iter().map(Vec::len).sum();
    let mut merged = Vec::with_capacity(total);
    let mut iterators: Vec<_> = lists.into_iter().map(Vec::into_iter).collect();

    let mut heads: Vec<Option<Message>> = Vec::with_capacity(iterators.len());
    let mut heap = BinaryHeap::new();
    for (index, iterator) in iterators.iter_mut().enumerate() {
        let head = iterator.next();
        if let Some(message) = &head {
            heap.push(Reverse((message.receive_time, index)));
        }
        heads.push(head);
    }

    while let Some(Reverse((_, index))) = heap.pop() {
        if let Some(message) = heads[index].take() {
            merged.push(message);
        }
        if let Some(next) = iterators[index].next() {
            heap.push(Reverse((next.receive_time, index)));
            heads[index] = Some(next);
        }
    }
    merged
}
