//! Running a provider tree on a worker thread
//!
//! [`spawn_worker`] moves a provider onto a dedicated OS thread with its own
//! single-threaded runtime and returns the channel pair to talk to it.
//! [`RpcDataProvider`] sits on the calling side and turns that channel back
//! into a [`DataProvider`]: every request carries an id, and the response with
//! the same id completes the call. Progress and metadata travel on the same
//! event channel, so they are delivered in the order the worker produced them.
//! Messages are moved across the channel, never copied.

use super::{DataProvider, ExtensionPoint, InitializationResult, Progress, ProviderMetadata};
use crate::error::{PlaybackError, Result};
use crate::time::Time;
use crate::types::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// A request sent to the worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Initialize,
    GetMessages {
        start: Time,
        end: Time,
        topics: Vec<String>,
    },
    Close,
}

/// A successful answer from the worker
#[derive(Debug)]
pub enum WorkerResponse {
    Initialized(InitializationResult),
    Messages(Vec<Message>),
    Closed,
}

/// An error raised inside the worker, reduced to what survives the channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl From<&PlaybackError> for RemoteError {
    fn from(err: &PlaybackError) -> Self {
        Self {
            name: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<RemoteError> for PlaybackError {
    fn from(err: RemoteError) -> Self {
        PlaybackError::Remote {
            name: err.name,
            message: err.message,
        }
    }
}

/// A request tagged with its correlation id
#[derive(Debug)]
pub struct Envelope {
    pub id: u64,
    pub request: WorkerRequest,
}

/// Everything the worker sends back
#[derive(Debug)]
pub enum WorkerEvent {
    Response {
        id: u64,
        result: std::result::Result<WorkerResponse, RemoteError>,
    },
    Progress(Progress),
    Metadata(ProviderMetadata),
}

/// Calling side of a worker
pub struct WorkerChannel {
    pub requests: mpsc::UnboundedSender<Envelope>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
}

/// Run `provider` on a new thread and return the channel to drive it
///
/// The thread exits once the request sender is dropped.
pub fn spawn_worker(provider: Arc<dyn DataProvider>) -> Result<WorkerChannel> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name("provider-worker".to_string())
        .spawn(move || {
            runtime.block_on(serve(provider, request_rx, event_tx));
            debug!("provider worker stopped");
        })?;

    Ok(WorkerChannel {
        requests: request_tx,
        events: event_rx,
    })
}

async fn serve(
    provider: Arc<dyn DataProvider>,
    mut requests: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(Envelope { id, request }) = requests.recv().await {
        let provider = provider.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let result = handle(provider.as_ref(), request, &events)
                .await
                .map_err(|err| RemoteError::from(&err));
            // The caller going away is not an error on this side
            let _ = events.send(WorkerEvent::Response { id, result });
        });
    }
}

async fn handle(
    provider: &dyn DataProvider,
    request: WorkerRequest,
    events: &mpsc::UnboundedSender<WorkerEvent>,
) -> Result<WorkerResponse> {
    match request {
        WorkerRequest::Initialize => {
            let progress_events = events.clone();
            let metadata_events = events.clone();
            let extension_point = ExtensionPoint {
                progress_callback: Arc::new(move |progress| {
                    let _ = progress_events.send(WorkerEvent::Progress(progress));
                }),
                report_metadata_callback: Arc::new(move |metadata| {
                    let _ = metadata_events.send(WorkerEvent::Metadata(metadata));
                }),
                add_topics_callback: Arc::new(|_| {}),
            };
            Ok(WorkerResponse::Initialized(provider.initialize(extension_point).await?))
        }
        WorkerRequest::GetMessages { start, end, topics } => Ok(WorkerResponse::Messages(
            provider.get_messages(start, end, &topics).await?,
        )),
        WorkerRequest::Close => {
            provider.close().await?;
            Ok(WorkerResponse::Closed)
        }
    }
}

type ResponseSender = oneshot::Sender<std::result::Result<WorkerResponse, RemoteError>>;

/// Pending calls by id; `None` once the worker is gone
type PendingCalls = Arc<Mutex<Option<HashMap<u64, ResponseSender>>>>;

/// A provider whose calls are answered by a worker
pub struct RpcDataProvider {
    requests: mpsc::UnboundedSender<Envelope>,
    events: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    pending: PendingCalls,
    extension_point: Arc<Mutex<Option<ExtensionPoint>>>,
    initialized: AtomicBool,
    next_id: AtomicU64,
}

impl RpcDataProvider {
    pub fn new(channel: WorkerChannel) -> Self {
        Self {
            requests: channel.requests,
            events: Mutex::new(Some(channel.events)),
            pending: Arc::new(Mutex::new(Some(HashMap::new()))),
            extension_point: Arc::new(Mutex::new(None)),
            initialized: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    /// Move `provider` onto a worker and wrap it
    pub fn spawn(provider: Arc<dyn DataProvider>) -> Result<Self> {
        Ok(Self::new(spawn_worker(provider)?))
    }

    /// Forward worker events until the worker hangs up; started by the first call
    fn ensure_event_pump(&self) -> Result<()> {
        let Some(mut events) = self
            .events
            .lock()
            .map_err(|_| PlaybackError::generic("worker event lock poisoned"))?
            .take()
        else {
            return Ok(());
        };
        let pending = self.pending.clone();
        let extension_point = self.extension_point.clone();
        let current_extension_point =
            move || extension_point.lock().ok().and_then(|guard| guard.clone());

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    WorkerEvent::Response { id, result } => {
                        let sender = pending
                            .lock()
                            .ok()
                            .and_then(|mut calls| calls.as_mut().and_then(|calls| calls.remove(&id)));
                        match sender {
                            Some(sender) => {
                                let _ = sender.send(result);
                            }
                            None => warn!(id, "response for unknown call"),
                        }
                    }
                    WorkerEvent::Progress(progress) => {
                        if let Some(extension_point) = current_extension_point() {
                            (extension_point.progress_callback)(progress);
                        }
                    }
                    WorkerEvent::Metadata(metadata) => {
                        if let Some(extension_point) = current_extension_point() {
                            (extension_point.report_metadata_callback)(metadata);
                        }
                    }
                }
            }
            // Dropping the senders fails every pending call
            if let Ok(mut calls) = pending.lock() {
                calls.take();
            }
            info!("provider worker disconnected");
        });
        Ok(())
    }

    async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        self.ensure_event_pump()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut calls = self
                .pending
                .lock()
                .map_err(|_| PlaybackError::generic("pending call lock poisoned"))?;
            calls
                .as_mut()
                .ok_or(PlaybackError::WorkerDisconnected)?
                .insert(id, tx);
        }

        debug!(id, ?request, "sending worker request");
        if self.requests.send(Envelope { id, request }).is_err() {
            if let Ok(mut guard) = self.pending.lock() {
                if let Some(calls) = guard.as_mut() {
                    calls.remove(&id);
                }
            }
            return Err(PlaybackError::WorkerDisconnected);
        }

        let result = rx.await.map_err(|_| PlaybackError::WorkerDisconnected)?;
        result.map_err(PlaybackError::from)
    }
}

fn unexpected(response: WorkerResponse) -> PlaybackError {
    PlaybackError::generic(format!("unexpected worker response: {response:?}"))
}

#[async_trait]
impl DataProvider for RpcDataProvider {
    async fn initialize(&self, extension_point: ExtensionPoint) -> Result<InitializationResult> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(PlaybackError::AlreadyInitialized);
        }
        if let Ok(mut slot) = self.extension_point.lock() {
            *slot = Some(extension_point);
        }
        match self.call(WorkerRequest::Initialize).await? {
            WorkerResponse::Initialized(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    async fn get_messages(&self, start: Time, end: Time, topics: &[String]) -> Result<Vec<Message>> {
        let request = WorkerRequest::GetMessages {
            start,
            end,
            topics: topics.to_vec(),
        };
        match self.call(request).await? {
            WorkerResponse::Messages(messages) => Ok(messages),
            other => Err(unexpected(other)),
        }
    }

    async fn close(&self) -> Result<()> {
        match self.call(WorkerRequest::Close).await? {
            WorkerResponse::Closed => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
