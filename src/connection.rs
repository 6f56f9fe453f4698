#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use chrono::Utc;
use futures::{SinkExt as _, StreamExt as _, future};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::Result;
use crate::config::{Config, HeartbeatConfig, RetryPolicy};
use crate::error::{Error, Kind};
use crate::message::{Control, DecodeError, InboundMessage, MessageKind};
use crate::retry::RetryCounter;
#[cfg(feature = "ws")]
use crate::transport::WsTransport;
use crate::transport::{Link, Transport, TransportError};

/// How long a cancelled cycle waits for the close handshake before dropping the link.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Identifies one `open` cycle. Bumped on every `open` and on every `close` that ends a cycle.
pub type Generation = u64;

/// Lifecycle state of a [`ConnectionManager`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ConnectionState {
    /// Never opened
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// Link established, messages flow
    Open,
    /// `close` is tearing the cycle down
    Closing,
    /// Closed explicitly or after exhausting the retry policy
    Closed,
    /// Waiting for the backoff delay before the next attempt
    Reconnecting,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether an `open` cycle is running and `close` is required before reopening.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

/// Subscriber callbacks for one `open` cycle.
///
/// All callbacks run on the manager's driver task (or inside `close`), one at a time and
/// in the order the events happened. They must not block. Calling back into the manager
/// (`send`, `close`, `open`) from a callback is allowed.
pub trait Handlers: Send + Sync + 'static {
    fn on_state_change(&self, state: ConnectionState) {
        let _ = state;
    }

    fn on_message(&self, message: InboundMessage) {
        let _ = message;
    }

    fn on_error(&self, error: &ErrorInfo) {
        let _ = error;
    }
}

impl<H: Handlers> Handlers for Arc<H> {
    fn on_state_change(&self, state: ConnectionState) {
        (**self).on_state_change(state);
    }

    fn on_message(&self, message: InboundMessage) {
        (**self).on_message(message);
    }

    fn on_error(&self, error: &ErrorInfo) {
        (**self).on_error(error);
    }
}

/// An asynchronous failure, reported through [`Handlers::on_error`].
#[non_exhaustive]
#[derive(Debug)]
pub struct ErrorInfo {
    /// Cycle the failure belongs to
    pub generation: Generation,
    /// Connect attempts made in the current series when the failure was reported
    pub attempt: u32,
    pub reason: ErrorReason,
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (generation {}, attempt {})",
            self.reason, self.generation, self.attempt
        )
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum ErrorReason {
    /// Connect failure, connect timeout or abnormal close. Retried per policy.
    Transport(TransportError),
    /// No pong arrived in time; the link was treated as dead. Retried per policy.
    HeartbeatTimeout {
        /// The configured pong timeout
        timeout: Duration,
    },
    /// The retry policy allows no further attempts; the manager is now `Closed`.
    AttemptsExhausted {
        /// Connect attempts made in the final series
        attempts: u32,
    },
    /// A frame was not valid UTF-8 or not valid JSON. The link stays up.
    Decode(DecodeError),
}

impl ErrorReason {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AttemptsExhausted { .. })
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::HeartbeatTimeout { timeout } => {
                write!(f, "heartbeat timeout: no pong received within {timeout:?}")
            }
            Self::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {attempts} connect attempts")
            }
            Self::Decode(e) => write!(f, "failed to decode frame: {e}"),
        }
    }
}

impl StdError for ErrorReason {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

/// State shared between the manager handle and its driver task.
struct Shared {
    /// Held while writing state or invoking a callback. Re-entrant so callbacks can call
    /// back into the manager.
    gate: ReentrantMutex<()>,
    generation: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    active: Mutex<Option<Active>>,
}

impl Shared {
    fn current_generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    fn next_generation(&self) -> Generation {
        self.generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }
}

/// The running cycle as seen from the handle.
struct Active {
    handlers: Arc<dyn Handlers>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

/// Maintains one logical real-time channel: connects, reconnects with exponential backoff
/// and jitter, probes liveness with ping/pong, and dispatches messages and lifecycle
/// events to [`Handlers`].
///
/// # Example
///
/// ```no_run
/// use live_channel::config::{Config, RetryPolicy};
/// use live_channel::connection::{ConnectionManager, ConnectionState, Handlers};
/// use live_channel::message::InboundMessage;
///
/// struct Dashboard;
///
/// impl Handlers for Dashboard {
///     fn on_state_change(&self, state: ConnectionState) {
///         println!("channel is {state}");
///     }
///
///     fn on_message(&self, message: InboundMessage) {
///         println!("{}: {}", message.kind, message.payload);
///     }
/// }
///
/// # async fn example() -> live_channel::Result<()> {
/// let manager = ConnectionManager::websocket(Config::default());
/// manager.open("ws://localhost:8080/live", RetryPolicy::default(), Dashboard)?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: Config,
    shared: Arc<Shared>,
}

#[cfg(feature = "ws")]
impl ConnectionManager<WsTransport> {
    /// Create a manager that connects over WebSocket.
    #[must_use]
    pub fn websocket(config: Config) -> Self {
        Self::new(WsTransport, config)
    }
}

impl<T: Transport> ConnectionManager<T> {
    #[must_use]
    pub fn new(transport: T, config: Config) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            transport: Arc::new(transport),
            config,
            shared: Arc::new(Shared {
                gate: ReentrantMutex::new(()),
                generation: AtomicU64::new(0),
                state_tx,
                active: Mutex::new(None),
            }),
        }
    }

    /// Start a new cycle and begin connecting to `endpoint`.
    ///
    /// Fails with [`Kind::Configuration`] for an invalid policy, heartbeat or endpoint and
    /// with [`Kind::AlreadyOpen`] while a previous cycle is still active. Connection
    /// failures are never returned here; they are reported through the handlers.
    ///
    /// Must be called within a tokio runtime.
    pub fn open<H: Handlers>(
        &self,
        endpoint: &str,
        policy: RetryPolicy,
        handlers: H,
    ) -> Result<Generation> {
        policy.validate()?;
        self.config.validate()?;
        let endpoint = Url::parse(endpoint)?;
        self.transport.validate(&endpoint)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        let _tick = self.shared.gate.lock();
        let state = self.state();
        if state.is_active() {
            return Err(Error::already_open(state));
        }

        let generation = self.shared.next_generation();
        let handlers: Arc<dyn Handlers> = Arc::new(handlers);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let previous = self.shared.active.lock().replace(Active {
            handlers: Arc::clone(&handlers),
            outbound,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(generation, %endpoint, ?policy, "Opening channel");

        let cycle = Cycle {
            generation,
            endpoint,
            transport: Arc::clone(&self.transport),
            config: self.config,
            handlers,
            shared: Arc::clone(&self.shared),
            counter: RetryCounter::new(policy),
            cancel,
        };
        cycle.transition(ConnectionState::Connecting);
        runtime.spawn(cycle.run(outbound_rx));

        Ok(generation)
    }

    /// Serialize `payload` to JSON and write it to the open link.
    ///
    /// Fails with [`Kind::NotConnected`] unless the state is [`ConnectionState::Open`].
    /// Nothing is queued in that case.
    pub fn send<P: Serialize + ?Sized>(&self, payload: &P) -> Result<()> {
        let state = self.state();
        if !state.is_open() {
            return Err(Error::not_connected(state));
        }

        let frame = serde_json::to_string(payload)?;
        let sent = self
            .shared
            .active
            .lock()
            .as_ref()
            .is_some_and(|active| active.outbound.send(frame).is_ok());

        if sent {
            Ok(())
        } else {
            Err(Error::not_connected(self.state()))
        }
    }

    /// Tear down the active cycle: cancel the connect attempt, backoff timer and
    /// heartbeat, release the link and report `Closing` then `Closed`.
    ///
    /// Never fails. Does nothing when there is no active cycle.
    pub fn close(&self) {
        let _tick = self.shared.gate.lock();
        let Some(active) = self.shared.active.lock().take() else {
            return;
        };
        let generation = self.shared.next_generation();
        active.cancel.cancel();

        if !self.state().is_active() {
            // Already terminal after exhausting the retry policy
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(generation, "Closing channel");

        for state in [ConnectionState::Closing, ConnectionState::Closed] {
            // A callback may have started a new cycle
            if self.shared.current_generation() != generation {
                break;
            }
            self.shared.state_tx.send_replace(state);
            active.handlers.on_state_change(state);
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Generation of the most recent `open` or `close`.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.shared.current_generation()
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.shared.next_generation();
        if let Some(active) = self.shared.active.lock().take() {
            active.cancel.cancel();
        }
    }
}

impl<T: Transport> fmt::Debug for ConnectionManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Ping timer and pong deadline. Lives only while the link is open.
struct Heartbeat {
    config: HeartbeatConfig,
    ticker: Interval,
    awaiting_pong: Option<Instant>,
}

impl Heartbeat {
    fn start(config: HeartbeatConfig) -> Self {
        let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            config,
            ticker,
            awaiting_pong: None,
        }
    }

    /// Arms the pong deadline. Returns false while a ping is still unanswered.
    fn ping_due(&mut self) -> bool {
        if self.awaiting_pong.is_some() {
            return false;
        }
        self.awaiting_pong = Some(Instant::now() + self.config.timeout);
        true
    }

    fn pong_received(&mut self) {
        self.awaiting_pong = None;
    }
}

async fn next_tick(heartbeat: Option<&mut Heartbeat>) {
    match heartbeat {
        Some(heartbeat) => {
            heartbeat.ticker.tick().await;
        }
        None => future::pending().await,
    }
}

async fn expire_at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

/// Driver of one `open` cycle, owned by its task.
struct Cycle<T: Transport> {
    generation: Generation,
    endpoint: Url,
    transport: Arc<T>,
    config: Config,
    handlers: Arc<dyn Handlers>,
    shared: Arc<Shared>,
    counter: RetryCounter,
    cancel: CancellationToken,
}

impl<T: Transport> Cycle<T> {
    fn is_current(&self) -> bool {
        self.shared.current_generation() == self.generation
    }

    /// Each emitter returns false once the cycle has been superseded, after which the
    /// driver must stop.
    fn transition(&self, state: ConnectionState) -> bool {
        let _tick = self.shared.gate.lock();
        if !self.is_current() {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(generation = self.generation, %state, "State transition");

        self.shared.state_tx.send_replace(state);
        self.handlers.on_state_change(state);
        self.is_current()
    }

    fn report(&self, reason: ErrorReason) -> bool {
        let _tick = self.shared.gate.lock();
        if !self.is_current() {
            return false;
        }

        let error = ErrorInfo {
            generation: self.generation,
            attempt: self.counter.attempts(),
            reason,
        };
        #[cfg(feature = "tracing")]
        tracing::warn!(endpoint = %self.endpoint, "{error}");

        self.handlers.on_error(&error);
        self.is_current()
    }

    fn deliver(&self, message: InboundMessage) -> bool {
        let _tick = self.shared.gate.lock();
        if !self.is_current() {
            return false;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(kind = %message.kind, "Received message");

        self.handlers.on_message(message);
        self.is_current()
    }

    /// Main connection loop with automatic reconnection.
    async fn run(mut self, mut outbound_rx: mpsc::UnboundedReceiver<String>) {
        // `open` already announced the first attempt
        let mut announced = true;

        loop {
            if !announced && !self.transition(ConnectionState::Connecting) {
                return;
            }
            announced = false;
            if !self.is_current() {
                return;
            }

            let attempt = self.counter.record_attempt();
            let connect = timeout(
                self.config.connect_timeout,
                self.transport.connect(&self.endpoint),
            );
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                outcome = connect => outcome,
            };

            let delay = match outcome {
                Ok(Ok(link)) => {
                    self.counter.reset();
                    if !self.transition(ConnectionState::Open) {
                        return;
                    }
                    let Some(cause) = self.drive(link, &mut outbound_rx).await else {
                        return;
                    };
                    discard_unsent(&mut outbound_rx);
                    self.retry_after(cause, true)
                }
                Ok(Err(e)) => self.retry_after(ErrorReason::Transport(e), false),
                Err(_elapsed) => {
                    let e = TransportError::ConnectTimeout(self.config.connect_timeout);
                    self.retry_after(ErrorReason::Transport(e), false)
                }
            };
            let Some(delay) = delay else {
                return;
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, ?delay, "Scheduling reconnect");
            #[cfg(not(feature = "tracing"))]
            let _ = attempt;

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                () = sleep(delay) => {}
            }
        }
    }

    /// Reports `cause` and decides whether another attempt follows. Returns the backoff
    /// delay, or `None` when the cycle ended (superseded or attempts exhausted).
    fn retry_after(&mut self, cause: ErrorReason, lost_open_link: bool) -> Option<Duration> {
        if lost_open_link && !self.transition(ConnectionState::Reconnecting) {
            return None;
        }
        if !self.report(cause) {
            return None;
        }

        let Some(delay) = self.counter.next_backoff() else {
            let attempts = self.counter.attempts();
            if self.transition(ConnectionState::Closed) {
                self.report(ErrorReason::AttemptsExhausted { attempts });
            }
            return None;
        };

        if !lost_open_link && !self.transition(ConnectionState::Reconnecting) {
            return None;
        }
        Some(delay)
    }

    /// Pump frames while the link is open. Returns why the link was lost, or `None` when
    /// the cycle was cancelled or superseded.
    async fn drive(
        &self,
        link: Link,
        outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> Option<ErrorReason> {
        let Link {
            mut sink,
            mut stream,
        } = link;
        let mut heartbeat = self.config.heartbeat.map(Heartbeat::start);

        loop {
            let pong_deadline = heartbeat.as_ref().and_then(|h| h.awaiting_pong);

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    _ = timeout(CLOSE_GRACE_PERIOD, sink.close()).await;
                    return None;
                }

                frame = stream.next() => {
                    let decoded = match frame {
                        Some(Ok(text)) => InboundMessage::decode(&text, Utc::now()).map_err(DecodeError::from),
                        Some(Err(TransportError::InvalidUtf8(e))) => Err(DecodeError::Utf8(e)),
                        Some(Err(e)) => return Some(ErrorReason::Transport(e)),
                        None => return Some(ErrorReason::Transport(TransportError::stream_ended())),
                    };

                    let message = match decoded {
                        Ok(message) => message,
                        Err(e) => {
                            if !self.report(ErrorReason::Decode(e)) {
                                return None;
                            }
                            continue;
                        }
                    };

                    match message.kind {
                        MessageKind::Pong => {
                            if let Some(heartbeat) = heartbeat.as_mut() {
                                heartbeat.pong_received();
                            }
                        }
                        MessageKind::Ping => {
                            if let Err(e) = sink.send(Control::Pong.frame()).await {
                                return Some(ErrorReason::Transport(e));
                            }
                        }
                        _ => {}
                    }

                    if !self.deliver(message) {
                        return None;
                    }
                }

                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        return Some(ErrorReason::Transport(e));
                    }
                }

                () = expire_at(pong_deadline) => {
                    let timeout = heartbeat.as_ref().map_or(Duration::ZERO, |h| h.config.timeout);
                    return Some(ErrorReason::HeartbeatTimeout { timeout });
                }

                () = next_tick(heartbeat.as_mut()) => {
                    let ping_due = heartbeat.as_mut().is_some_and(Heartbeat::ping_due);
                    if ping_due && let Err(e) = sink.send(Control::Ping.frame()).await {
                        return Some(ErrorReason::Transport(e));
                    }
                }
            }
        }
    }
}

/// Frames accepted by `send` but not written before the link was lost are dropped.
fn discard_unsent(outbound_rx: &mut mpsc::UnboundedReceiver<String>) {
    let mut dropped = 0_usize;
    while outbound_rx.try_recv().is_ok() {
        dropped += 1;
    }

    #[cfg(feature = "tracing")]
    if dropped > 0 {
        tracing::debug!(dropped, "Discarded unsent frames after losing the link");
    }
    #[cfg(not(feature = "tracing"))]
    let _ = dropped;
}
