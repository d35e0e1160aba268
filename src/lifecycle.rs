//! Downstream connection ownership.
//!
//! A [`Connection`] holds the only writer for one streaming response. It
//! moves through `Open -> Streaming -> terminal`, and the first terminal
//! transition is the one that releases the connection; later attempts are
//! no-ops.

use crate::encoder::{KEEP_ALIVE_TEXT, sse_event};
use crate::protocol::{Channel, WireEvent};
use axum::body::Body;
use axum::http::{HeaderValue, Response};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const FRAME_BUFFER: usize = 16;

/// Deadline used when a lifetime does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

type Frame = Result<Event, Infallible>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Streaming,
    Completed,
    TimedOut,
    Errored,
    Cancelled,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConnectionState::Open | ConnectionState::Streaming)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    Completion,
    HotContent,
}

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    pub max_lifetime: Duration,
    pub keep_alive: Duration,
}

struct ConnectionEntry {
    kind: RelayKind,
    opened_at: Instant,
}

/// Live streaming connections, keyed by connection id.
#[derive(Default)]
pub struct ConnectionRegistry {
    active: Mutex<HashMap<Uuid, ConnectionEntry>>,
    released: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    pub fn released_count(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    fn register(&self, id: Uuid, kind: RelayKind) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                id,
                ConnectionEntry {
                    kind,
                    opened_at: Instant::now(),
                },
            );
        }
    }

    fn release(&self, id: Uuid) -> Option<ConnectionEntry> {
        let entry = self.active.lock().ok()?.remove(&id);
        if entry.is_some() {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        entry
    }
}

enum WriteError {
    Closed,
    Deadline,
}

pub struct Connection {
    id: Uuid,
    kind: RelayKind,
    state: Mutex<ConnectionState>,
    frames: Mutex<Option<mpsc::Sender<Frame>>>,
    registry: Arc<ConnectionRegistry>,
    deadline: Instant,
}

impl Connection {
    /// Accepts a downstream connection and arms its lifetime timer. The
    /// returned response streams whatever the connection writes.
    pub fn accept(
        registry: &Arc<ConnectionRegistry>,
        kind: RelayKind,
        policy: LifecyclePolicy,
    ) -> (Self, Response<Body>) {
        let (tx, rx) = mpsc::channel::<Frame>(FRAME_BUFFER);
        let id = Uuid::new_v4();
        registry.register(id, kind);
        info!(connection = %id, ?kind, lifetime_secs = policy.max_lifetime.as_secs(), "stream connection opened");

        let now = Instant::now();
        let connection = Self {
            id,
            kind,
            state: Mutex::new(ConnectionState::Open),
            frames: Mutex::new(Some(tx)),
            registry: Arc::clone(registry),
            deadline: now
                .checked_add(policy.max_lifetime)
                .unwrap_or(now + FAR_FUTURE),
        };

        let mut response = Sse::new(ReceiverStream::new(rx))
            .keep_alive(
                KeepAlive::new()
                    .interval(policy.keep_alive)
                    .text(KEEP_ALIVE_TEXT),
            )
            .into_response();
        response
            .headers_mut()
            .insert("x-accel-buffering", HeaderValue::from_static("no"));

        (connection, response)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Errored)
    }

    /// Pumps `events` onto the wire until a terminal event, the lifetime
    /// deadline, a failed write, or the peer going away. Always releases the
    /// connection before returning. Idle keep-alive comments come from the
    /// SSE response itself.
    pub async fn run<S>(self, mut events: S) -> ConnectionState
    where
        S: Stream<Item = WireEvent> + Unpin,
    {
        self.transition(ConnectionState::Open, ConnectionState::Streaming);

        let Some(frames) = self.writer() else {
            return self.finish(ConnectionState::Errored);
        };

        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut deadline => break ConnectionState::TimedOut,
                _ = frames.closed() => break ConnectionState::Cancelled,
                next = events.next() => {
                    let Some(event) = next else {
                        let _ = self.write(&frames, &WireEvent::error("stream ended unexpectedly")).await;
                        break ConnectionState::Errored;
                    };
                    let channel = event.channel;
                    debug!(connection = %self.id, channel = channel.as_str(), "frame");
                    match self.write(&frames, &event).await {
                        Ok(()) => {}
                        Err(WriteError::Deadline) => break ConnectionState::TimedOut,
                        Err(WriteError::Closed) => break ConnectionState::Errored,
                    }
                    match channel {
                        Channel::Done => break ConnectionState::Completed,
                        Channel::Error => break ConnectionState::Errored,
                        Channel::Message | Channel::Thinking => {}
                    }
                }
            }
        };

        drop(frames);
        drop(events);
        self.finish(outcome)
    }

    fn writer(&self) -> Option<mpsc::Sender<Frame>> {
        self.frames.lock().ok()?.clone()
    }

    async fn write(&self, frames: &mpsc::Sender<Frame>, event: &WireEvent) -> Result<(), WriteError> {
        match tokio::time::timeout_at(self.deadline, frames.send(Ok(sse_event(event)))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                warn!(connection = %self.id, "write to closed connection");
                Err(WriteError::Closed)
            }
            Err(_) => Err(WriteError::Deadline),
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == from => {
                *state = to;
                true
            }
            _ => false,
        }
    }

    /// Moves to `outcome` and releases the connection, unless some other path
    /// already did. Returns the state the connection ended in.
    pub fn finish(&self, outcome: ConnectionState) -> ConnectionState {
        let Ok(mut state) = self.state.lock() else {
            return ConnectionState::Errored;
        };
        if state.is_terminal() {
            return *state;
        }
        *state = outcome;
        drop(state);

        if let Ok(mut frames) = self.frames.lock() {
            frames.take();
        }
        if let Some(entry) = self.registry.release(self.id) {
            info!(
                connection = %self.id,
                kind = ?entry.kind,
                state = ?outcome,
                elapsed_ms = entry.opened_at.elapsed().as_millis() as u64,
                "stream connection released"
            );
        }
        outcome
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            debug!(connection = %self.id, kind = ?self.kind, "connection dropped mid-stream");
            self.finish(ConnectionState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn policy(lifetime: Duration) -> LifecyclePolicy {
        LifecyclePolicy {
            max_lifetime: lifetime,
            keep_alive: Duration::from_secs(3600),
        }
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn completes_on_done_and_releases_once() {
        let registry = ConnectionRegistry::new();
        let (connection, response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(registry.active_count(), 1);

        let events = futures::stream::iter(vec![
            WireEvent::message("hi"),
            WireEvent::message(" there"),
            WireEvent::done(),
            WireEvent::message("ignored"),
        ]);
        let state = connection.run(events).await;

        assert_eq!(state, ConnectionState::Completed);
        assert_eq!(
            body_text(response).await,
            "event: message\ndata: hi\n\nevent: message\ndata: &#32;there\n\nevent: done\ndata: [DONE]\n\n"
        );
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.released_count(), 1);
    }

    #[tokio::test]
    async fn error_event_ends_in_errored() {
        let registry = ConnectionRegistry::new();
        let (connection, response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));

        let events = futures::stream::iter(vec![WireEvent::message("a"), WireEvent::error("bad")]);
        assert_eq!(connection.run(events).await, ConnectionState::Errored);
        assert!(body_text(response).await.ends_with("event: error\ndata: bad\n\n"));
    }

    #[tokio::test]
    async fn times_out_silently() {
        let registry = ConnectionRegistry::new();
        let (connection, response) = Connection::accept(
            &registry,
            RelayKind::HotContent,
            policy(Duration::from_millis(50)),
        );

        let state = connection.run(futures::stream::pending::<WireEvent>()).await;
        assert_eq!(state, ConnectionState::TimedOut);
        assert_eq!(body_text(response).await, "");
        assert_eq!(registry.released_count(), 1);
    }

    #[tokio::test]
    async fn peer_disconnect_cancels() {
        let registry = ConnectionRegistry::new();
        let (connection, response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));
        drop(response);

        let state = connection.run(futures::stream::pending::<WireEvent>()).await;
        assert_eq!(state, ConnectionState::Cancelled);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.released_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_stream_without_terminal_is_an_error() {
        let registry = ConnectionRegistry::new();
        let (connection, response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));

        let state = connection
            .run(futures::stream::iter(vec![WireEvent::message("a")]))
            .await;
        assert_eq!(state, ConnectionState::Errored);
        assert!(
            body_text(response)
                .await
                .ends_with("event: error\ndata: stream&#32;ended&#32;unexpectedly\n\n")
        );
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (connection, _response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));

        assert_eq!(connection.finish(ConnectionState::Cancelled), ConnectionState::Cancelled);
        assert_eq!(connection.finish(ConnectionState::Completed), ConnectionState::Cancelled);
        drop(connection);
        assert_eq!(registry.released_count(), 1);
    }

    #[tokio::test]
    async fn dropping_an_open_connection_releases_it() {
        let registry = ConnectionRegistry::new();
        let (connection, _response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));
        drop(connection);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.released_count(), 1);
    }

    #[tokio::test]
    async fn response_is_an_unbuffered_event_stream() {
        let registry = ConnectionRegistry::new();
        let (_connection, response) =
            Connection::accept(&registry, RelayKind::Completion, policy(Duration::from_secs(5)));

        let headers = response.headers();
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[tokio::test]
    async fn unbounded_lifetime_does_not_overflow() {
        let registry = ConnectionRegistry::new();
        let (connection, response) =
            Connection::accept(&registry, RelayKind::HotContent, policy(Duration::MAX));
        assert_eq!(connection.state(), ConnectionState::Open);

        let state = connection
            .run(futures::stream::iter(vec![WireEvent::done()]))
            .await;
        assert_eq!(state, ConnectionState::Completed);
        assert_eq!(body_text(response).await, "event: done\ndata: [DONE]\n\n");
    }

    #[tokio::test]
    async fn keep_alive_comments_are_written() {
        let registry = ConnectionRegistry::new();
        let (connection, response) = Connection::accept(
            &registry,
            RelayKind::HotContent,
            LifecyclePolicy {
                max_lifetime: Duration::from_millis(120),
                keep_alive: Duration::from_millis(20),
            },
        );

        let state = connection.run(futures::stream::pending::<WireEvent>()).await;
        assert_eq!(state, ConnectionState::TimedOut);
        assert!(body_text(response).await.starts_with(": keep-alive\n\n"));
    }
}
