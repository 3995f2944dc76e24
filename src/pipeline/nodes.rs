//! Derived topics computed inside the pipeline
//!
//! A node consumes messages on its input topics and emits messages on its own
//! output topics, which must live under [`INTERNAL_TOPIC_PREFIX`]. Nodes are an
//! ordered list fixed at construction; state is reset on every seek or
//! reconnect so nothing leaks across discontinuous playback.

use super::{PlayerEvent, Requester, SubscribePayload};
use crate::definitions::Datatypes;
use crate::error::{PlaybackError, Result};
use crate::types::{Message, Topic};
use std::collections::HashSet;
use tracing::debug;

/// Prefix shared by every node output topic
pub const INTERNAL_TOPIC_PREFIX: &str = "/webviz";

/// Whether a topic is produced inside the pipeline
pub fn is_internal_topic(topic: &str) -> bool {
    topic.starts_with(INTERNAL_TOPIC_PREFIX)
}

/// A stateful transform from input messages to output messages
pub trait Node: Send {
    fn name(&self) -> &str;
    fn inputs(&self) -> &[String];
    fn outputs(&self) -> &[Topic];
    /// Datatypes of the output topics
    fn datatypes(&self) -> &Datatypes;
    fn consume(&mut self, message: &Message) -> Vec<Message>;
    fn reset(&mut self);
}

/// `(state, message) -> (state, outputs)`
pub type NodeCallback<S> = fn(S, &Message) -> (S, Vec<Message>);

/// A [`Node`] built from a pure function and a default state
pub struct FnNode<S> {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<Topic>,
    datatypes: Datatypes,
    default_state: S,
    state: Option<S>,
    callback: NodeCallback<S>,
}

impl<S: Clone> FnNode<S> {
    pub fn new(
        name: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<Topic>,
        default_state: S,
        callback: NodeCallback<S>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs,
            datatypes: Datatypes::new(),
            state: Some(default_state.clone()),
            default_state,
            callback,
        }
    }

    pub fn with_datatypes(mut self, datatypes: Datatypes) -> Self {
        self.datatypes = datatypes;
        self
    }
}

impl<S: Clone + Send> Node for FnNode<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn outputs(&self) -> &[Topic] {
        &self.outputs
    }

    fn datatypes(&self) -> &Datatypes {
        &self.datatypes
    }

    fn consume(&mut self, message: &Message) -> Vec<Message> {
        let state = self
            .state
            .take()
            .unwrap_or_else(|| self.default_state.clone());
        let (state, mut outputs) = (self.callback)(state, message);
        self.state = Some(state);
        // Outputs happen at the time of the message that caused them
        for output in &mut outputs {
            output.receive_time = message.receive_time;
        }
        outputs
    }

    fn reset(&mut self) {
        self.state = Some(self.default_state.clone());
    }
}

/// Validates, subscribes and drives the registered nodes
pub struct NodeManager {
    nodes: Vec<Box<dyn Node>>,
    /// Indices into `nodes`
    subscribed: Vec<usize>,
    datatypes: Datatypes,
}

impl Default for NodeManager {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            subscribed: Vec::new(),
            datatypes: Datatypes::new(),
        }
    }
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("nodes", &self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>())
            .field("subscribed", &self.subscribed)
            .finish()
    }
}

impl NodeManager {
    /// Register `nodes` in order, rejecting bad outputs and dependency cycles
    pub fn new(nodes: Vec<Box<dyn Node>>) -> Result<Self> {
        let mut manager = Self::default();
        for node in nodes {
            manager.register(node)?;
        }
        Ok(manager)
    }

    fn register(&mut self, node: Box<dyn Node>) -> Result<()> {
        if let Some(output) = node.outputs().iter().find(|o| !is_internal_topic(&o.name)) {
            return Err(PlaybackError::configuration(format!(
                "Webviz node: {} must output topics prefixed with {INTERNAL_TOPIC_PREFIX}, got {}",
                node.name(),
                output.name
            )));
        }
        for (name, datatype) in node.datatypes() {
            self.datatypes.insert(name.clone(), datatype.clone());
        }
        self.nodes.push(node);
        for index in 0..self.nodes.len() {
            self.validate_dependencies(index, index, &mut HashSet::new())?;
        }
        Ok(())
    }

    fn validate_dependencies(&self, target: usize, root: usize, visited: &mut HashSet<usize>) -> Result<()> {
        for input in self.nodes[target].inputs() {
            for (index, node) in self.nodes.iter().enumerate() {
                if !node.outputs().iter().any(|output| &output.name == input) {
                    continue;
                }
                if index == target {
                    return Err(PlaybackError::configuration(format!(
                        "Node: {} depends on itself",
                        node.name()
                    )));
                }
                if index == root {
                    return Err(PlaybackError::configuration(format!(
                        "{} has circular dependency",
                        node.name()
                    )));
                }
                if visited.insert(index) {
                    self.validate_dependencies(index, root, visited)?;
                }
            }
        }
        Ok(())
    }

    /// Datatypes of every node output
    pub fn datatypes(&self) -> &Datatypes {
        &self.datatypes
    }

    pub fn is_internal_topic(&self, topic: &str) -> bool {
        is_internal_topic(topic)
    }

    /// External topics a node output ultimately depends on
    pub fn external_subscriptions_for(&self, topic: &str) -> Vec<SubscribePayload> {
        let mut results = Vec::new();
        self.subscriptions_for(topic, true, &mut results, &mut HashSet::new());
        results
    }

    /// Internal topics a node output depends on
    pub fn internal_subscriptions_for(&self, topic: &str) -> Vec<SubscribePayload> {
        let mut results = Vec::new();
        self.subscriptions_for(topic, false, &mut results, &mut HashSet::new());
        results
    }

    fn subscriptions_for(
        &self,
        topic: &str,
        only_external: bool,
        results: &mut Vec<SubscribePayload>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(topic.to_string()) {
            return;
        }
        for node in &self.nodes {
            if !node.outputs().iter().any(|output| output.name == topic) {
                continue;
            }
            for input in node.inputs() {
                let request = SubscribePayload::new(input).with_requester(Requester::node(node.name()));
                if is_internal_topic(input) {
                    if !only_external {
                        results.push(request);
                    }
                    self.subscriptions_for(input, only_external, results, visited);
                } else if only_external {
                    results.push(request);
                }
            }
        }
    }

    /// Every topic any node can output
    pub fn all_outputs(&self) -> Vec<Topic> {
        let mut outputs: Vec<Topic> = Vec::new();
        for output in self.nodes.iter().flat_map(|node| node.outputs()) {
            if !outputs.contains(output) {
                outputs.push(output.clone());
            }
        }
        outputs
    }

    pub fn subscribed_node_names(&self) -> Vec<&str> {
        self.subscribed.iter().map(|&index| self.nodes[index].name()).collect()
    }

    /// Recompute which nodes run for `subscriptions`
    ///
    /// Returns the internal subscriptions nodes make on behalf of other nodes.
    pub fn update_internal_subscriptions(&mut self, subscriptions: &[SubscribePayload]) -> Vec<SubscribePayload> {
        let mut subscribed = Vec::new();
        let mut new_topics = Vec::new();
        let topics: Vec<&str> = subscriptions.iter().map(|s| s.topic.as_str()).collect();
        self.collect_subscribed(&topics, None, &mut subscribed, &mut new_topics);
        self.subscribed = subscribed;
        new_topics
    }

    fn collect_subscribed(
        &self,
        topics: &[&str],
        parent: Option<usize>,
        subscribed: &mut Vec<usize>,
        new_topics: &mut Vec<SubscribePayload>,
    ) {
        for (index, node) in self.nodes.iter().enumerate() {
            let is_requested = node
                .outputs()
                .iter()
                .any(|output| topics.contains(&output.name.as_str()));
            if !is_requested || subscribed.contains(&index) {
                continue;
            }
            subscribed.push(index);
            if let (Some(parent), Some(output)) = (parent, node.outputs().first()) {
                new_topics.push(
                    SubscribePayload::new(&output.name)
                        .with_requester(Requester::node(self.nodes[parent].name())),
                );
            }
            for input in node.inputs().iter().filter(|input| is_internal_topic(input)) {
                self.collect_subscribed(&[input.as_str()], Some(index), subscribed, new_topics);
            }
        }
    }

    /// Feed a player event to the subscribed nodes
    ///
    /// Returns every message the nodes produced, including messages produced
    /// by nodes consuming other nodes' outputs.
    pub fn consume(&mut self, event: &PlayerEvent) -> Vec<Message> {
        match event {
            PlayerEvent::Seek | PlayerEvent::Connected => {
                self.reset_node_states();
                Vec::new()
            }
            PlayerEvent::Message(message) => {
                let mut produced = Vec::new();
                self.feed(message, &mut produced);
                produced
            }
            _ => Vec::new(),
        }
    }

    fn feed(&mut self, message: &Message, produced: &mut Vec<Message>) {
        let consumers: Vec<usize> = self
            .subscribed
            .iter()
            .copied()
            .filter(|&index| self.nodes[index].inputs().contains(&message.topic))
            .collect();
        for index in consumers {
            for output in self.nodes[index].consume(message) {
                produced.push(output.clone());
                self.feed(&output, produced);
            }
        }
    }

    pub fn reset_node_states(&mut self) {
        debug!(nodes = self.nodes.len(), "resetting node states");
        for node in &mut self.nodes {
            node.reset();
        }
    }
}
