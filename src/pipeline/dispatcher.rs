//! Batching player output into frames
//!
//! Messages are buffered per topic. The first message after a flush arms a
//! debounce timer; when it fires, the whole buffer goes to the [`Store`] as a
//! single [`Action::FrameReceived`], and only after the next display frame
//! (via [`FrameScheduler`]) does the dispatcher ask the player for more data.

use super::{PlayerEvent, PlayerState, PlayerTopic};
use crate::definitions::Datatypes;
use crate::providers::Progress;
use crate::time::Time;
use crate::types::{Message, Topic};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Delay between the first buffered message and the frame flush
pub const FRAME_DEBOUNCE: Duration = Duration::from_millis(30);

/// Messages of one frame, by topic
pub type Frame = BTreeMap<String, Vec<Message>>;

/// What the dispatcher hands to the store
#[derive(Debug, Clone)]
pub enum Action {
    FrameReceived {
        frame: Frame,
        last_receive_time: Option<Time>,
    },
    TimeUpdated(Time),
    TopicsReceived(Vec<Topic>),
    DatatypesReceived(Datatypes),
    PlayerStateChanged(PlayerState),
    CapabilitiesReceived(Vec<String>),
    PlaybackReset,
    PlayerProgress(Progress),
    PlayerConnecting(String),
    PlayerConnected,
}

/// Receives dispatched actions
pub trait Store: Send + Sync {
    fn dispatch(&self, action: Action);
}

pub type FrameCallback = Box<dyn FnOnce() + Send>;

/// Runs a callback at the next display refresh
pub trait FrameScheduler: Send + Sync {
    fn request_frame(&self, callback: FrameCallback);
}

/// Approximates display refresh with a timer
#[derive(Debug, Clone)]
pub struct TokioFrameScheduler {
    frame_interval: Duration,
}

impl Default for TokioFrameScheduler {
    fn default() -> Self {
        // ~60 Hz
        Self {
            frame_interval: Duration::from_millis(16),
        }
    }
}

impl TokioFrameScheduler {
    pub fn new(frame_interval: Duration) -> Self {
        Self { frame_interval }
    }
}

impl FrameScheduler for TokioFrameScheduler {
    fn request_frame(&self, callback: FrameCallback) {
        let interval = self.frame_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            callback();
        });
    }
}

pub type ReadyForMore = Arc<dyn Fn() + Send + Sync>;

/// Resolves once the frame holding a consumed message has been dispatched
#[derive(Debug)]
pub struct FrameTicket {
    dispatched: watch::Receiver<u64>,
    frame: u64,
}

impl FrameTicket {
    pub async fn wait(mut self) {
        let frame = self.frame;
        // A closed channel means the dispatcher is gone, nothing left to wait for
        let _ = self.dispatched.wait_for(|dispatched| *dispatched >= frame).await;
    }

    pub fn is_dispatched(&self) -> bool {
        *self.dispatched.borrow() >= self.frame
    }
}

struct FrameBuffer {
    frame: Frame,
    /// Number of the frame being buffered; frames are numbered from 1
    frame_id: u64,
    last_receive_time: Option<Time>,
    timer_armed: bool,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self {
            frame: Frame::new(),
            frame_id: 1,
            last_receive_time: None,
            timer_armed: false,
        }
    }
}

struct Shared {
    store: Arc<dyn Store>,
    scheduler: Arc<dyn FrameScheduler>,
    ready_for_more: Mutex<ReadyForMore>,
    buffer: Mutex<FrameBuffer>,
    /// Number of the last dispatched frame
    dispatched: watch::Sender<u64>,
    debounce: Duration,
}

impl Shared {
    fn request_more_after_frame(&self) {
        let ready_for_more = match self.ready_for_more.lock() {
            Ok(callback) => callback.clone(),
            Err(_) => return,
        };
        self.scheduler.request_frame(Box::new(move || ready_for_more()));
    }

    fn flush(&self) {
        // The frame is numbered while the lock is held so that messages arriving
        // during the dispatch below are ticketed for the following frame
        let (frame, frame_id, last_receive_time) = match self.buffer.lock() {
            Ok(mut buffer) => {
                buffer.timer_armed = false;
                let frame_id = buffer.frame_id;
                buffer.frame_id += 1;
                (std::mem::take(&mut buffer.frame), frame_id, buffer.last_receive_time)
            }
            Err(_) => return,
        };
        debug!(frame_id, topics = frame.len(), "dispatching frame");
        self.store.dispatch(Action::FrameReceived {
            frame,
            last_receive_time,
        });
        self.dispatched
            .send_modify(|dispatched| *dispatched = (*dispatched).max(frame_id));
        self.request_more_after_frame();
    }
}

/// Turns player events into store actions, batching messages into frames
#[derive(Clone)]
pub struct PlayerDispatcher {
    shared: Arc<Shared>,
}

impl PlayerDispatcher {
    pub fn new(store: Arc<dyn Store>, scheduler: Arc<dyn FrameScheduler>) -> Self {
        Self::with_debounce(store, scheduler, FRAME_DEBOUNCE)
    }

    pub fn with_debounce(
        store: Arc<dyn Store>,
        scheduler: Arc<dyn FrameScheduler>,
        debounce: Duration,
    ) -> Self {
        let (dispatched, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                store,
                scheduler,
                ready_for_more: Mutex::new(Arc::new(|| {})),
                buffer: Mutex::new(FrameBuffer::default()),
                dispatched,
                debounce,
            }),
        }
    }

    /// Called, one display frame after each flush, to request the next batch
    pub fn set_ready_for_more(&self, callback: ReadyForMore) {
        if let Ok(mut slot) = self.shared.ready_for_more.lock() {
            *slot = callback;
        }
    }

    fn ticket(&self, frame: u64) -> FrameTicket {
        FrameTicket {
            dispatched: self.shared.dispatched.subscribe(),
            frame,
        }
    }

    fn already_dispatched(&self) -> FrameTicket {
        self.ticket(*self.shared.dispatched.borrow())
    }

    /// Handle one player event; must be called inside a tokio runtime
    pub fn consume(&self, event: PlayerEvent) -> FrameTicket {
        match event {
            PlayerEvent::Message(message) => return self.add_message(message),
            PlayerEvent::UpdateTime(time) => {
                let frame_pending = match self.shared.buffer.lock() {
                    Ok(mut buffer) => {
                        buffer.last_receive_time = Some(time);
                        buffer.timer_armed
                    }
                    Err(_) => false,
                };
                // A pending frame carries the time with it
                if !frame_pending {
                    self.shared.store.dispatch(Action::TimeUpdated(time));
                    self.shared.request_more_after_frame();
                }
            }
            PlayerEvent::Topics(topics) => {
                let topics = topics.into_iter().filter_map(PlayerTopic::into_topic).collect();
                self.shared.store.dispatch(Action::TopicsReceived(topics));
            }
            PlayerEvent::Datatypes(datatypes) => {
                self.shared.store.dispatch(Action::DatatypesReceived(datatypes));
            }
            PlayerEvent::PlayerState(state) => {
                self.shared.store.dispatch(Action::PlayerStateChanged(state));
            }
            PlayerEvent::Capabilities(capabilities) => {
                self.shared
                    .store
                    .dispatch(Action::CapabilitiesReceived(capabilities));
            }
            PlayerEvent::Seek => {
                if let Ok(mut buffer) = self.shared.buffer.lock() {
                    buffer.frame.clear();
                }
                self.shared.store.dispatch(Action::PlaybackReset);
            }
            PlayerEvent::Progress(progress) => {
                self.shared.store.dispatch(Action::PlayerProgress(progress));
            }
            PlayerEvent::Connecting(player) => {
                self.shared.store.dispatch(Action::PlayerConnecting(player));
            }
            PlayerEvent::Connected => self.shared.store.dispatch(Action::PlayerConnected),
        }
        self.already_dispatched()
    }

    fn add_message(&self, message: Message) -> FrameTicket {
        let (frame_id, arm_timer) = {
            let Ok(mut buffer) = self.shared.buffer.lock() else {
                warn!("frame buffer lock poisoned, dropping message");
                return self.already_dispatched();
            };
            buffer.last_receive_time = Some(message.receive_time);
            trace!(topic = %message.topic, "buffering message");
            buffer
                .frame
                .entry(message.topic.clone())
                .or_default()
                .push(message);
            (buffer.frame_id, !std::mem::replace(&mut buffer.timer_armed, true))
        };

        if arm_timer {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(shared.debounce).await;
                shared.flush();
            });
        }
        self.ticket(frame_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    #[derive(Default)]
    struct RecordingStore {
        actions: Mutex<Vec<Action>>,
    }

    impl Store for RecordingStore {
        fn dispatch(&self, action: Action) {
            self.actions.lock().unwrap().push(action);
        }
    }

    impl RecordingStore {
        fn frames(&self) -> Vec<Frame> {
            self.actions
                .lock()
                .unwrap()
                .iter()
                .filter_map(|action| match action {
                    Action::FrameReceived { frame, .. } => Some(frame.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    /// Runs frame callbacks right away
    struct ImmediateScheduler;

    impl FrameScheduler for ImmediateScheduler {
        fn request_frame(&self, callback: FrameCallback) {
            callback();
        }
    }

    fn message(topic: &str, sec: i64) -> Message {
        Message::raw(topic, "std_msgs/msg/String", Time::from_sec(sec), Vec::new())
    }

    fn setup() -> (Arc<RecordingStore>, PlayerDispatcher, Arc<AtomicUsize>) {
        let store = Arc::new(RecordingStore::default());
        let dispatcher = PlayerDispatcher::new(store.clone(), Arc::new(ImmediateScheduler));
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        dispatcher.set_ready_for_more(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (store, dispatcher, requests)
    }

    #[tokio::test(start_paused = true)]
    async fn batches_messages_into_one_frame() {
        let (store, dispatcher, requests) = setup();
        let started = tokio::time::Instant::now();

        dispatcher.consume(PlayerEvent::Message(message("/foo", 1)));
        dispatcher.consume(PlayerEvent::Message(message("/foo", 2)));
        let ticket = dispatcher.consume(PlayerEvent::Message(message("/bar", 3)));
        assert!(!ticket.is_dispatched());
        assert!(store.frames().is_empty());

        ticket.wait().await;
        assert!(started.elapsed() >= FRAME_DEBOUNCE);

        let frames = store.frames();
        assert_eq!(frames.len(), 1);
        let times = |topic: &str| -> Vec<i64> {
            frames[0][topic].iter().map(|m| m.receive_time.sec).collect()
        };
        assert_eq!(times("/foo"), vec![1, 2]);
        assert_eq!(times("/bar"), vec![3]);
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        match store.actions.lock().unwrap().last() {
            Some(Action::FrameReceived {
                last_receive_time, ..
            }) => assert_eq!(*last_receive_time, Some(Time::from_sec(3))),
            other => panic!("unexpected action {other:?}"),
        };
    }

    #[tokio::test(start_paused = true)]
    async fn later_messages_start_a_new_frame() {
        let (store, dispatcher, _) = setup();

        dispatcher
            .consume(PlayerEvent::Message(message("/foo", 1)))
            .wait()
            .await;
        dispatcher
            .consume(PlayerEvent::Message(message("/foo", 2)))
            .wait()
            .await;

        assert_eq!(store.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn update_time_waits_for_pending_frame() {
        let (store, dispatcher, requests) = setup();

        dispatcher.consume(PlayerEvent::UpdateTime(Time::from_sec(5)));
        assert!(matches!(
            store.actions.lock().unwrap().last(),
            Some(Action::TimeUpdated(time)) if *time == Time::from_sec(5)
        ));
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        let ticket = dispatcher.consume(PlayerEvent::Message(message("/foo", 6)));
        dispatcher.consume(PlayerEvent::UpdateTime(Time::from_sec(7)));
        assert_eq!(store.actions.lock().unwrap().len(), 1);

        ticket.wait().await;
        match store.actions.lock().unwrap().last() {
            Some(Action::FrameReceived {
                last_receive_time, ..
            }) => assert_eq!(*last_receive_time, Some(Time::from_sec(7))),
            other => panic!("unexpected action {other:?}"),
        };
    }

    /// Consumes one more message from inside the first frame dispatch
    #[derive(Default)]
    struct ReentrantStore {
        dispatcher: OnceLock<PlayerDispatcher>,
        late_ticket: Mutex<Option<FrameTicket>>,
        frames: AtomicUsize,
    }

    impl Store for ReentrantStore {
        fn dispatch(&self, action: Action) {
            if !matches!(action, Action::FrameReceived { .. }) {
                return;
            }
            if self.frames.fetch_add(1, Ordering::SeqCst) == 0 {
                if let Some(dispatcher) = self.dispatcher.get() {
                    let ticket = dispatcher.consume(PlayerEvent::Message(message("/late", 2)));
                    *self.late_ticket.lock().unwrap() = Some(ticket);
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn message_arriving_during_flush_waits_for_next_frame() {
        let store = Arc::new(ReentrantStore::default());
        let dispatcher = PlayerDispatcher::new(store.clone(), Arc::new(ImmediateScheduler));
        assert!(store.dispatcher.set(dispatcher.clone()).is_ok());

        dispatcher
            .consume(PlayerEvent::Message(message("/foo", 1)))
            .wait()
            .await;
        let late = store.late_ticket.lock().unwrap().take().unwrap();
        assert_eq!(store.frames.load(Ordering::SeqCst), 1);
        assert!(!late.is_dispatched());

        late.wait().await;
        assert_eq!(store.frames.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn seek_drops_buffered_messages() {
        let (store, dispatcher, _) = setup();

        let ticket = dispatcher.consume(PlayerEvent::Message(message("/foo", 1)));
        dispatcher.consume(PlayerEvent::Seek);
        ticket.wait().await;

        let actions = store.actions.lock().unwrap();
        assert!(matches!(actions[0], Action::PlaybackReset));
        assert!(matches!(&actions[1], Action::FrameReceived { frame, .. } if frame.is_empty()));
    }

    #[tokio::test]
    async fn non_message_events_are_dispatched_immediately() {
        let (store, dispatcher, _) = setup();

        let ticket = dispatcher.consume(PlayerEvent::Topics(vec![
            PlayerTopic::new("/a", Some("std_msgs/msg/String")),
            PlayerTopic::new("/no_type", None),
        ]));
        assert!(ticket.is_dispatched());
        dispatcher.consume(PlayerEvent::Connected);

        let actions = store.actions.lock().unwrap();
        match &actions[0] {
            Action::TopicsReceived(topics) => {
                assert_eq!(topics, &vec![Topic::new("/a", "std_msgs/msg/String")])
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert!(matches!(actions[1], Action::PlayerConnected));
    }
}
