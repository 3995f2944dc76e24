//! From player events to frames in a store
//!
//! [`Pipeline`] sits between a player (anything that emits [`PlayerEvent`]s and
//! accepts subscriptions through [`PlayerConnection`]) and a [`Store`]. It
//! counts subscriptions so the player sees one subscribe per topic, runs the
//! registered [`Node`]s over incoming messages, and hands everything to a
//! [`PlayerDispatcher`] which batches messages into frames.

pub mod dispatcher;
pub mod multiset;
pub mod nodes;

pub use dispatcher::{
    Action, Frame, FrameScheduler, FrameTicket, PlayerDispatcher, Store, TokioFrameScheduler,
    FRAME_DEBOUNCE,
};
pub use multiset::Multiset;
pub use nodes::{is_internal_topic, FnNode, Node, NodeManager, INTERNAL_TOPIC_PREFIX};

use crate::definitions::Datatypes;
use crate::error::{PlaybackError, Result};
use crate::providers::Progress;
use crate::time::Time;
use crate::types::{Message, MessageValue, Topic};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Playback position and speed reported by the player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub start_time: Time,
    pub end_time: Time,
    pub is_playing: bool,
    pub speed: f64,
}

/// A topic as announced by a player; the datatype may be unknown
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerTopic {
    pub topic: String,
    pub datatype: Option<String>,
    pub original_topic: Option<String>,
}

impl PlayerTopic {
    pub fn new(topic: impl Into<String>, datatype: Option<&str>) -> Self {
        Self {
            topic: topic.into(),
            datatype: datatype.map(str::to_string),
            original_topic: None,
        }
    }

    /// The store only learns about topics with a known datatype
    pub fn into_topic(self) -> Option<Topic> {
        let datatype = self.datatype?;
        let mut topic = Topic::new(self.topic, datatype);
        topic.original_topic = self.original_topic;
        Some(topic)
    }
}

impl From<&Topic> for PlayerTopic {
    fn from(topic: &Topic) -> Self {
        Self {
            topic: topic.name.clone(),
            datatype: Some(topic.datatype.clone()),
            original_topic: topic.original_topic.clone(),
        }
    }
}

/// Everything a player can tell the pipeline
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Message(Message),
    /// Current time moved without a message
    UpdateTime(Time),
    Topics(Vec<PlayerTopic>),
    Datatypes(Datatypes),
    PlayerState(PlayerState),
    Capabilities(Vec<String>),
    Seek,
    Progress(Progress),
    Connecting(String),
    Connected,
}

/// Who asked for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub kind: String,
    pub name: String,
}

impl Requester {
    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: "node".to_string(),
            name: name.into(),
        }
    }

    pub fn panel(name: impl Into<String>) -> Self {
        Self {
            kind: "panel".to_string(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribePayload {
    pub topic: String,
    pub encoding: Option<String>,
    pub scale: Option<f64>,
    /// Never forwarded to the player
    pub requester: Option<Requester>,
}

impl SubscribePayload {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            encoding: None,
            scale: None,
            requester: None,
        }
    }

    pub fn with_requester(mut self, requester: Requester) -> Self {
        self.requester = Some(requester);
        self
    }

    fn sanitized(&self) -> Self {
        Self {
            requester: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvertisePayload {
    pub topic: String,
    pub datatype: String,
    /// Never forwarded to the player
    pub advertiser: Option<Requester>,
}

impl AdvertisePayload {
    pub fn new(topic: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            datatype: datatype.into(),
            advertiser: None,
        }
    }

    fn sanitized(&self) -> Self {
        Self {
            advertiser: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishPayload {
    pub topic: String,
    pub message: MessageValue,
}

/// The player side of the pipeline
pub trait PlayerConnection: Send + Sync {
    fn subscribe(&self, request: SubscribePayload);
    fn unsubscribe(&self, request: SubscribePayload);
    fn advertise(&self, request: AdvertisePayload);
    fn unadvertise(&self, request: AdvertisePayload);
    fn publish(&self, request: PublishPayload);
    /// The store is ready for the next batch
    fn request_messages(&self);
}

fn subscriptions_equal(a: &SubscribePayload, b: &SubscribePayload) -> bool {
    a.topic == b.topic && a.encoding == b.encoding && a.scale == b.scale
}

fn publishers_equal(a: &AdvertisePayload, b: &AdvertisePayload) -> bool {
    a.topic == b.topic && a.datatype == b.datatype
}

/// Subscription bookkeeping, node execution and frame dispatch
pub struct Pipeline {
    node_manager: NodeManager,
    dispatcher: Option<PlayerDispatcher>,
    connection: Option<Arc<dyn PlayerConnection>>,
    external_topics: Vec<PlayerTopic>,
    internal_subscriptions: Multiset<SubscribePayload>,
    external_subscriptions: Multiset<SubscribePayload>,
    publishers: Multiset<AdvertisePayload>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(NodeManager::default())
    }
}

impl Pipeline {
    pub fn new(node_manager: NodeManager) -> Self {
        Self {
            node_manager,
            dispatcher: None,
            connection: None,
            external_topics: Vec::new(),
            internal_subscriptions: Multiset::new(subscriptions_equal),
            external_subscriptions: Multiset::new(subscriptions_equal),
            publishers: Multiset::new(publishers_equal),
        }
    }

    pub fn all_subscriptions(&self) -> Vec<SubscribePayload> {
        self.external_subscriptions
            .all_items()
            .iter()
            .chain(self.internal_subscriptions.all_items())
            .cloned()
            .collect()
    }

    pub fn unique_external_subscriptions(&self) -> Vec<SubscribePayload> {
        self.external_subscriptions.unique_items()
    }

    pub fn unique_internal_subscriptions(&self) -> Vec<SubscribePayload> {
        self.internal_subscriptions.unique_items()
    }

    pub fn all_external_publishers(&self) -> &[AdvertisePayload] {
        self.publishers.all_items()
    }

    pub fn unique_external_publishers(&self) -> Vec<AdvertisePayload> {
        self.publishers.unique_items()
    }

    pub fn node_manager(&self) -> &NodeManager {
        &self.node_manager
    }

    /// Attach a store and a player
    ///
    /// Call again whenever the player changes. Subscriptions and advertisements
    /// made before a player was attached are sent to it now.
    pub fn initialize(
        &mut self,
        store: Arc<dyn Store>,
        scheduler: Arc<dyn FrameScheduler>,
        connection: Arc<dyn PlayerConnection>,
    ) {
        let dispatcher = PlayerDispatcher::new(store, scheduler);
        let requester = connection.clone();
        dispatcher.set_ready_for_more(Arc::new(move || requester.request_messages()));
        self.dispatcher = Some(dispatcher);
        self.node_manager.reset_node_states();

        for request in self.external_subscriptions.unique_items() {
            debug!(topic = %request.topic, "subscribe");
            connection.subscribe(request.sanitized());
        }
        for request in self.publishers.unique_items() {
            debug!(topic = %request.topic, "advertise");
            connection.advertise(request.sanitized());
        }
        self.connection = Some(connection);
    }

    /// Handle one event from the player; must be called inside a tokio runtime
    ///
    /// Messages produced by nodes land in the same frame as their input.
    pub fn consume(&mut self, event: PlayerEvent) -> Result<FrameTicket> {
        let dispatcher = self.dispatcher.clone().ok_or(PlaybackError::NotInitialized)?;
        let produced = self.node_manager.consume(&event);

        let ticket = match event {
            PlayerEvent::Topics(topics) => {
                self.external_topics = topics;
                let topics = self
                    .external_topics
                    .iter()
                    .cloned()
                    .chain(self.node_manager.all_outputs().iter().map(PlayerTopic::from))
                    .collect();
                dispatcher.consume(PlayerEvent::Topics(topics))
            }
            PlayerEvent::Datatypes(datatypes) => {
                let mut merged = self.node_manager.datatypes().clone();
                merged.extend(datatypes);
                dispatcher.consume(PlayerEvent::Datatypes(merged))
            }
            event => dispatcher.consume(event),
        };

        for message in produced {
            dispatcher.consume(PlayerEvent::Message(message));
        }
        Ok(ticket)
    }

    /// Subscribe to a player topic or a node output
    pub fn subscribe(&mut self, request: SubscribePayload) {
        if is_internal_topic(&request.topic) {
            self.subscribe_to_node(request);
        } else {
            self.subscribe_to_external_topic(request);
        }
    }

    pub fn unsubscribe(&mut self, request: SubscribePayload) {
        if is_internal_topic(&request.topic) {
            self.unsubscribe_from_node(request);
        } else {
            self.unsubscribe_from_external_topic(&request);
        }
    }

    pub fn advertise(&mut self, request: AdvertisePayload) {
        let is_new = self.publishers.add(request.clone());
        if let (true, Some(connection)) = (is_new, &self.connection) {
            info!(topic = %request.topic, datatype = %request.datatype, "advertise");
            connection.advertise(request.sanitized());
        }
    }

    pub fn unadvertise(&mut self, request: AdvertisePayload) {
        let is_last = self.publishers.remove(&request);
        if let (true, Some(connection)) = (is_last, &self.connection) {
            info!(topic = %request.topic, datatype = %request.datatype, "unadvertise");
            connection.unadvertise(request.sanitized());
        }
    }

    pub fn publish(&self, request: PublishPayload) -> Result<()> {
        if is_internal_topic(&request.topic) {
            return Err(PlaybackError::configuration(format!(
                "Publishing internal topics is not supported: {}",
                request.topic
            )));
        }
        match &self.connection {
            Some(connection) => connection.publish(request),
            None => warn!(topic = %request.topic, "published with no player attached"),
        }
        Ok(())
    }

    fn subscribe_to_node(&mut self, request: SubscribePayload) {
        let external = self.node_manager.external_subscriptions_for(&request.topic);
        self.internal_subscriptions.add(request);
        let nested = self
            .node_manager
            .update_internal_subscriptions(&self.internal_subscriptions.unique_items());
        for payload in nested {
            self.internal_subscriptions.add(payload);
        }
        for sub in external {
            self.subscribe_to_external_topic(sub);
        }
    }

    fn unsubscribe_from_node(&mut self, request: SubscribePayload) {
        let external = self.node_manager.external_subscriptions_for(&request.topic);
        let internal = self.node_manager.internal_subscriptions_for(&request.topic);
        self.internal_subscriptions.remove(&request);
        for item in &internal {
            self.internal_subscriptions.remove(item);
        }
        self.node_manager
            .update_internal_subscriptions(&self.internal_subscriptions.unique_items());
        for sub in &external {
            self.unsubscribe_from_external_topic(sub);
        }
    }

    fn subscribe_to_external_topic(&mut self, request: SubscribePayload) {
        let is_new = self.external_subscriptions.add(request.clone());
        if let (true, Some(connection)) = (is_new, &self.connection) {
            debug!(topic = %request.topic, "subscribe");
            connection.subscribe(request.sanitized());
        }
    }

    fn unsubscribe_from_external_topic(&mut self, request: &SubscribePayload) {
        let is_last = self.external_subscriptions.remove(request);
        if let (true, Some(connection)) = (is_last, &self.connection) {
            debug!(topic = %request.topic, "unsubscribe");
            connection.unsubscribe(request.sanitized());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dispatcher::FrameCallback;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Subscribe(SubscribePayload),
        Unsubscribe(SubscribePayload),
        Advertise(AdvertisePayload),
        Unadvertise(AdvertisePayload),
        Publish(PublishPayload),
        RequestMessages,
    }

    #[derive(Default)]
    struct RecordingConnection {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingConnection {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl PlayerConnection for RecordingConnection {
        fn subscribe(&self, request: SubscribePayload) {
            self.record(Call::Subscribe(request));
        }
        fn unsubscribe(&self, request: SubscribePayload) {
            self.record(Call::Unsubscribe(request));
        }
        fn advertise(&self, request: AdvertisePayload) {
            self.record(Call::Advertise(request));
        }
        fn unadvertise(&self, request: AdvertisePayload) {
            self.record(Call::Unadvertise(request));
        }
        fn publish(&self, request: PublishPayload) {
            self.record(Call::Publish(request));
        }
        fn request_messages(&self) {
            self.record(Call::RequestMessages);
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        actions: Mutex<Vec<Action>>,
    }

    impl Store for RecordingStore {
        fn dispatch(&self, action: Action) {
            self.actions.lock().unwrap().push(action);
        }
    }

    struct ImmediateScheduler;

    impl FrameScheduler for ImmediateScheduler {
        fn request_frame(&self, callback: FrameCallback) {
            callback();
        }
    }

    fn panel(topic: &str, name: &str) -> SubscribePayload {
        SubscribePayload::new(topic).with_requester(Requester::panel(name))
    }

    fn double_node() -> Box<dyn Node> {
        fn double(state: (), message: &Message) -> ((), Vec<Message>) {
            let value = match &message.payload {
                crate::types::Payload::Parsed(value) => match value.as_ref() {
                    MessageValue::Int(v) => *v * 2,
                    _ => 0,
                },
                _ => 0,
            };
            (
                state,
                vec![Message::parsed(
                    "/webviz/doubled",
                    "std_msgs/msg/Int64",
                    Time::ZERO,
                    MessageValue::Int(value),
                )],
            )
        }
        Box::new(FnNode::new(
            "double",
            vec!["/numbers".to_string()],
            vec![Topic::new("/webviz/doubled", "std_msgs/msg/Int64")],
            (),
            double,
        ))
    }

    fn attach(pipeline: &mut Pipeline) -> (Arc<RecordingStore>, Arc<RecordingConnection>) {
        let store = Arc::new(RecordingStore::default());
        let connection = Arc::new(RecordingConnection::default());
        pipeline.initialize(store.clone(), Arc::new(ImmediateScheduler), connection.clone());
        (store, connection)
    }

    #[test]
    fn one_player_subscription_per_topic() {
        let mut pipeline = Pipeline::default();
        let (_, connection) = attach(&mut pipeline);

        pipeline.subscribe(panel("/foo", "first"));
        pipeline.subscribe(panel("/foo", "second"));
        assert_eq!(connection.calls(), vec![Call::Subscribe(SubscribePayload::new("/foo"))]);

        pipeline.unsubscribe(panel("/foo", "first"));
        assert_eq!(connection.calls().len(), 1);
        pipeline.unsubscribe(panel("/foo", "second"));
        assert_eq!(
            connection.calls().last(),
            Some(&Call::Unsubscribe(SubscribePayload::new("/foo")))
        );
        assert!(pipeline.all_subscriptions().is_empty());
    }

    #[test]
    fn replays_pending_requests_on_initialize() {
        let mut pipeline = Pipeline::default();
        pipeline.subscribe(panel("/foo", "first"));
        pipeline.subscribe(panel("/foo", "second"));
        pipeline.advertise(AdvertisePayload {
            advertiser: Some(Requester::panel("publisher")),
            ..AdvertisePayload::new("/cmd", "std_msgs/msg/String")
        });

        let (_, connection) = attach(&mut pipeline);
        assert_eq!(
            connection.calls(),
            vec![
                Call::Subscribe(SubscribePayload::new("/foo")),
                Call::Advertise(AdvertisePayload::new("/cmd", "std_msgs/msg/String")),
            ]
        );
    }

    #[test]
    fn advertise_is_counted() {
        let mut pipeline = Pipeline::default();
        let (_, connection) = attach(&mut pipeline);
        let request = AdvertisePayload::new("/cmd", "std_msgs/msg/String");

        pipeline.advertise(request.clone());
        pipeline.advertise(request.clone());
        pipeline.unadvertise(request.clone());
        pipeline.unadvertise(request.clone());
        assert_eq!(
            connection.calls(),
            vec![Call::Advertise(request.clone()), Call::Unadvertise(request)]
        );
    }

    #[test]
    fn publishing_internal_topics_fails() {
        let mut pipeline = Pipeline::default();
        let (_, connection) = attach(&mut pipeline);
        let message = MessageValue::String("go".to_string());

        let err = pipeline
            .publish(PublishPayload {
                topic: "/webviz/anything".to_string(),
                message: message.clone(),
            })
            .unwrap_err();
        assert!(matches!(err, PlaybackError::Configuration { .. }));

        pipeline
            .publish(PublishPayload {
                topic: "/cmd".to_string(),
                message,
            })
            .unwrap();
        assert_eq!(connection.calls().len(), 1);
    }

    #[test]
    fn node_subscription_subscribes_to_inputs() {
        let mut pipeline = Pipeline::new(NodeManager::new(vec![double_node()]).unwrap());
        let (_, connection) = attach(&mut pipeline);

        pipeline.subscribe(panel("/webviz/doubled", "plot"));
        assert_eq!(
            connection.calls(),
            vec![Call::Subscribe(SubscribePayload::new("/numbers"))]
        );
        assert_eq!(pipeline.unique_internal_subscriptions().len(), 1);

        pipeline.unsubscribe(panel("/webviz/doubled", "plot"));
        assert_eq!(
            connection.calls().last(),
            Some(&Call::Unsubscribe(SubscribePayload::new("/numbers")))
        );
        assert!(pipeline.all_subscriptions().is_empty());
    }

    #[test]
    fn consume_requires_initialize() {
        let mut pipeline = Pipeline::default();
        assert!(matches!(
            pipeline.consume(PlayerEvent::Seek),
            Err(PlaybackError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn node_outputs_join_the_frame() {
        let mut pipeline = Pipeline::new(NodeManager::new(vec![double_node()]).unwrap());
        let (store, connection) = attach(&mut pipeline);
        pipeline.subscribe(panel("/webviz/doubled", "plot"));

        let ticket = pipeline
            .consume(PlayerEvent::Message(Message::parsed(
                "/numbers",
                "std_msgs/msg/Int64",
                Time::from_sec(5),
                MessageValue::Int(21),
            )))
            .unwrap();
        ticket.wait().await;

        let actions = store.actions.lock().unwrap();
        let Some(Action::FrameReceived { frame, .. }) = actions.last() else {
            panic!("expected a frame, got {actions:?}");
        };
        assert_eq!(frame["/numbers"].len(), 1);
        let doubled = &frame["/webviz/doubled"][0];
        assert_eq!(doubled.receive_time, Time::from_sec(5));
        assert!(matches!(
            &doubled.payload,
            crate::types::Payload::Parsed(value) if **value == MessageValue::Int(42)
        ));
        assert_eq!(connection.calls().last(), Some(&Call::RequestMessages));
    }

    #[test]
    fn topics_include_node_outputs() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let mut pipeline = Pipeline::new(NodeManager::new(vec![double_node()]).unwrap());
        let (store, _) = attach(&mut pipeline);

        pipeline
            .consume(PlayerEvent::Topics(vec![
                PlayerTopic::new("/numbers", Some("std_msgs/msg/Int64")),
                PlayerTopic::new("/untyped", None),
            ]))
            .unwrap();

        let actions = store.actions.lock().unwrap();
        let Some(Action::TopicsReceived(topics)) = actions.last() else {
            panic!("expected topics, got {actions:?}");
        };
        assert_eq!(
            topics,
            &vec![
                Topic::new("/numbers", "std_msgs/msg/Int64"),
                Topic::new("/webviz/doubled", "std_msgs/msg/Int64"),
            ]
        );
    }
}
