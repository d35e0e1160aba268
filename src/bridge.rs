//! Turns the callback-driven upstream call into a pull stream of wire events.
//!
//! Each relay owns one bounded channel. The worker side (upstream call plus
//! its [`ChunkSink`]) is the only producer and the [`RelayStream`] is the
//! only consumer. Whichever side sees the end first closes it: the producer
//! by dropping its sender after a terminal event, the consumer by cancelling.

use crate::protocol::{Message, Role, StreamChunk, StreamRequest, ThinkMode, WireEvent};
use crate::upstream::{CompletionClient, Dispatch};
use futures::FutureExt;
use futures::stream::Stream;
use std::future::Future;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const MISSING_IDENTITY: &str = "missing user identity: log in first or pass userId";

/// Placeholder content used when a request carries no messages at all.
const PLACEHOLDER_CONTENT: &str = " ";

/// A fixed set of threads, separate from the ones serving connections, that
/// runs every upstream call.
pub struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    pub fn new(threads: usize) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("relay-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // May run inside the connection runtime, where a blocking shutdown panics.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Producer half of a relay channel.
pub struct EventSender {
    tx: Option<mpsc::Sender<WireEvent>>,
    cancel: CancellationToken,
}

impl EventSender {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `true` once a terminal event went out or the consumer went away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Enqueues one event, waiting for room. A terminal event closes the
    /// channel behind it.
    pub async fn send(&mut self, event: WireEvent) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            self.tx = None;
            return ControlFlow::Break(());
        }
        let Some(tx) = self.tx.as_ref() else {
            return ControlFlow::Break(());
        };

        let terminal = event.channel.is_terminal();
        if tx.send(event).await.is_err() {
            self.cancel.cancel();
            self.tx = None;
            return ControlFlow::Break(());
        }

        if terminal {
            self.tx = None;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Best-effort error event; a no-op once the channel is closed.
    pub async fn fail(&mut self, message: impl Into<String>) {
        let _ = self.send(WireEvent::error(message)).await;
    }

    /// Sends a single error without waiting and closes. The channel is
    /// fresh, so there is always room.
    fn reject(mut self, message: &str) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(WireEvent::error(message));
        }
    }
}

/// Consumer half of a relay channel. Dropping it cancels the producer.
pub struct RelayStream {
    rx: mpsc::Receiver<WireEvent>,
    cancel: CancellationToken,
}

#[cfg(test)]
impl RelayStream {
    /// Stops the producer. Safe to call any number of times.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for RelayStream {
    type Item = WireEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<WireEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn relay_channel(capacity: usize) -> (EventSender, RelayStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel = CancellationToken::new();

    (
        EventSender {
            tx: Some(tx),
            cancel: cancel.clone(),
        },
        RelayStream { rx, cancel },
    )
}

/// The callback handed to the upstream client.
pub struct ChunkSink {
    events: EventSender,
    thinking: bool,
}

impl ChunkSink {
    pub fn new(events: EventSender, think: ThinkMode) -> Self {
        Self {
            events,
            thinking: think == ThinkMode::Enabled,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    pub async fn deliver(&mut self, chunk: StreamChunk) -> ControlFlow<()> {
        if self.events.is_cancelled() {
            return ControlFlow::Break(());
        }

        let finished = chunk.finished;
        for event in chunk_events(chunk, self.thinking) {
            if self.events.send(event).await.is_break() {
                return ControlFlow::Break(());
            }
        }

        if finished {
            let _ = self.events.send(WireEvent::done()).await;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn fail(&mut self, message: impl Into<String>) {
        self.events.fail(message).await;
    }
}

/// Reasoning goes out before the delta; empty pieces produce nothing.
pub fn chunk_events(chunk: StreamChunk, thinking: bool) -> Vec<WireEvent> {
    let mut events = Vec::with_capacity(2);
    if thinking {
        if let Some(reasoning) = chunk.reasoning.filter(|text| !text.is_empty()) {
            events.push(WireEvent::thinking(reasoning));
        }
    }
    if !chunk.delta.is_empty() {
        events.push(WireEvent::message(chunk.delta));
    }
    events
}

/// Out-of-band prompt parameters used when `messages` is empty.
#[derive(Debug, Clone, Default)]
pub struct PromptParams {
    pub role: Option<String>,
    pub content: Option<String>,
}

pub fn normalize_messages(messages: Vec<Message>, prompt: &PromptParams) -> Vec<Message> {
    if !messages.is_empty() {
        return messages;
    }

    match prompt.content.as_deref().filter(|text| !text.trim().is_empty()) {
        Some(content) => {
            let role = prompt.role.as_deref().map(Role::coerce).unwrap_or_default();
            vec![Message::new(role, content)]
        }
        None => vec![Message::new(Role::User, PLACEHOLDER_CONTENT)],
    }
}

#[derive(Clone)]
pub struct Relay {
    client: Arc<dyn CompletionClient>,
    workers: Arc<WorkerPool>,
    capacity: usize,
}

impl Relay {
    pub fn new(client: Arc<dyn CompletionClient>, workers: Arc<WorkerPool>, capacity: usize) -> Self {
        Self {
            client,
            workers,
            capacity,
        }
    }

    /// A relay that yields exactly one error event and makes no upstream call.
    pub fn rejected(&self, message: &str) -> RelayStream {
        let (sender, stream) = relay_channel(self.capacity);
        sender.reject(message);
        stream
    }

    pub fn open(&self, request: StreamRequest, prompt: &PromptParams) -> RelayStream {
        let Some(user_id) = request.user_id else {
            debug!("relay rejected: no identity");
            return self.rejected(MISSING_IDENTITY);
        };

        let dispatch = Dispatch {
            user_id,
            session_id: request.session_id,
            messages: normalize_messages(request.messages, prompt),
            think: request.think,
        };

        let (sender, stream) = relay_channel(self.capacity);
        let cancel = sender.cancellation_token();
        let client = Arc::clone(&self.client);

        self.workers.spawn(async move {
            let mut sink = ChunkSink::new(sender, dispatch.think);

            let outcome = AssertUnwindSafe(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = client.invoke(&dispatch, &mut sink) => Some(result),
                }
            })
            .catch_unwind()
            .await;

            match outcome {
                Ok(None) => debug!(user_id, "relay cancelled, upstream call dropped"),
                Ok(Some(Ok(()))) => {
                    if !sink.is_closed() && !cancel.is_cancelled() {
                        warn!(user_id, "upstream returned without a final chunk");
                        sink.fail(crate::error::UpstreamError::Truncated.to_string())
                            .await;
                    }
                }
                Ok(Some(Err(err))) => {
                    warn!(user_id, error = %err, "upstream completion failed");
                    sink.fail(err.to_string()).await;
                }
                Err(_) => {
                    error!(user_id, "upstream worker panicked");
                    sink.fail("upstream worker failed unexpectedly").await;
                }
            }
        });

        stream
    }
}
