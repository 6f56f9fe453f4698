#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures::{SinkExt as _, StreamExt as _, future};
use live_channel::config::{Config, RetryPolicy};
use live_channel::connection::{ConnectionState, ErrorInfo, ErrorReason, Handlers};
use live_channel::message::{InboundMessage, MessageKind};
use live_channel::transport::{Link, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use url::Url;

pub const ENDPOINT: &str = "ws://metrics.local/live";

/// Retry policy without jitter: retries after 100ms, 200ms, 400ms, ... capped at 1s.
#[must_use]
pub fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(Duration::from_millis(100))
        .max_delay(Duration::from_secs(1))
        .jitter_ratio(0.0)
        .build()
}

/// Default config with the heartbeat switched off.
#[must_use]
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.heartbeat = None;
    config
}

/// What the fake transport does on a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Fail immediately with "connection refused"
    Refuse,
    /// Succeed and hand the server side to the test as a [`Peer`]
    Accept,
    /// Never complete
    Hang,
}

struct Inner {
    script: Mutex<VecDeque<Script>>,
    fallback: Script,
    attempts: AtomicU32,
    attempted_at: Mutex<Vec<Instant>>,
    peers: mpsc::UnboundedSender<Peer>,
}

/// In-memory transport that follows a script of connect outcomes.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Arc<Inner>,
}

impl FakeTransport {
    /// Plays `script` in order, then `fallback` for every further attempt.
    pub fn new<I: IntoIterator<Item = Script>>(
        script: I,
        fallback: Script,
    ) -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                attempts: AtomicU32::new(0),
                attempted_at: Mutex::new(Vec::new()),
                peers,
            }),
        };
        (transport, peers_rx)
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Offsets of every connect attempt relative to `start`.
    #[must_use]
    pub fn attempt_offsets(&self, start: Instant) -> Vec<Duration> {
        self.inner
            .attempted_at
            .lock()
            .iter()
            .map(|at| at.duration_since(start))
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _endpoint: &Url) -> Result<Link, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        self.inner.attempted_at.lock().push(Instant::now());
        let script = self
            .inner
            .script
            .lock()
            .pop_front()
            .unwrap_or(self.inner.fallback);

        match script {
            Script::Refuse => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            Script::Hang => future::pending().await,
            Script::Accept => {
                let (to_client, client_rx) = frames::unbounded();
                let (client_tx, from_client) = frames::unbounded();
                let sink = client_tx.sink_map_err(|e| TransportError::Io(io::Error::other(e)));

                drop(self.inner.peers.send(Peer {
                    to_client,
                    from_client,
                }));
                Ok(Link::new(sink, client_rx))
            }
        }
    }
}

/// Server side of an accepted fake link. Dropping it ends the client's frame stream.
pub struct Peer {
    to_client: frames::UnboundedSender<Result<String, TransportError>>,
    from_client: frames::UnboundedReceiver<String>,
}

impl Peer {
    pub fn push(&self, frame: &Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.to_client.unbounded_send(Ok(text.to_owned())).unwrap();
    }

    /// Deliver a binary frame that is not valid UTF-8.
    pub fn push_invalid_utf8(&self) {
        let error = String::from_utf8(b"{\"type\":\"metrics_update\",\"name\":\"\xff\xfe\"}".to_vec())
            .unwrap_err();
        self.to_client
            .unbounded_send(Err(TransportError::InvalidUtf8(error)))
            .unwrap();
    }

    /// Fail the link as if the socket broke.
    pub fn break_link(&self) {
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        self.to_client
            .unbounded_send(Err(TransportError::Io(error)))
            .unwrap();
    }

    /// Next frame written by the client, `None` once the client closed its side.
    pub async fn next_frame(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Answer every ping with a pong until the link goes away.
    pub fn auto_pong(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = self.next_frame().await {
                if frame == r#"{"type":"ping"}"# {
                    self.push_raw(r#"{"type":"pong"}"#);
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transport,
    ConnectTimeout,
    HeartbeatTimeout,
    AttemptsExhausted,
    Decode,
}

impl From<&ErrorReason> for Failure {
    fn from(reason: &ErrorReason) -> Self {
        match reason {
            ErrorReason::Transport(TransportError::ConnectTimeout(_)) => Self::ConnectTimeout,
            ErrorReason::Transport(_) => Self::Transport,
            ErrorReason::HeartbeatTimeout { .. } => Self::HeartbeatTimeout,
            ErrorReason::AttemptsExhausted { .. } => Self::AttemptsExhausted,
            ErrorReason::Decode(_) => Self::Decode,
            other => panic!("unexpected error reason: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    State(ConnectionState),
    Message(MessageKind, Value),
    Error(Failure),
}

/// Handlers that forward every callback, stamped with the (paused) clock.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<(Instant, Event)>,
}

impl Recorder {
    fn record(&self, event: Event) {
        drop(self.tx.send((Instant::now(), event)));
    }
}

impl Handlers for Recorder {
    fn on_state_change(&self, state: ConnectionState) {
        self.record(Event::State(state));
    }

    fn on_message(&self, message: InboundMessage) {
        self.record(Event::Message(message.kind, message.payload));
    }

    fn on_error(&self, error: &ErrorInfo) {
        self.record(Event::Error(Failure::from(&error.reason)));
    }
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<(Instant, Event)>,
}

#[must_use]
pub fn recorder() -> (Recorder, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Recorder { tx }, Events { rx })
}

impl Events {
    pub async fn next(&mut self) -> (Instant, Event) {
        timeout(Duration::from_secs(600), self.rx.recv())
            .await
            .expect("no event within 600s")
            .expect("recorder dropped")
    }

    /// Collect events up to and including the first one matching `done`.
    pub async fn until<F: Fn(&Event) -> bool>(&mut self, done: F) -> Vec<(Instant, Event)> {
        let mut seen = Vec::new();
        loop {
            let (at, event) = self.next().await;
            let finished = done(&event);
            seen.push((at, event));
            if finished {
                return seen;
            }
        }
    }

    /// Events already recorded, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut seen = Vec::new();
        while let Ok((_, event)) = self.rx.try_recv() {
            seen.push(event);
        }
        seen
    }
}

#[must_use]
pub fn states(events: &[(Instant, Event)]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|(_, event)| match event {
            Event::State(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[must_use]
pub fn failures(events: &[(Instant, Event)]) -> Vec<Failure> {
    events
        .iter()
        .filter_map(|(_, event)| match event {
            Event::Error(failure) => Some(*failure),
            _ => None,
        })
        .collect()
}
