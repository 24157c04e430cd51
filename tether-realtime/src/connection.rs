//! One physical duplex stream with heartbeat and linear-backoff reconnect.
//!
//! State machine:
//!
//! ```text
//! Idle -> Connecting -> Open -> Closing -> Closed
//!                ^                           |
//!                +------ Reconnecting <------+  (unexpected close only)
//! ```
//!
//! An unexpected close bumps `reconnect_attempts` and schedules a reconnect
//! after `reconnect_interval * reconnect_attempts`. Once the attempt counter
//! passes `max_reconnect_attempts` the connection parks in `Closed` until a
//! caller invokes [`Connection::connect`] again.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tether_core::{ConnectionConfig, ConnectionError, Scheduler, TimerKey};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{ConnectionEvent, EventHandler, HandlerId};
use crate::transport::{Frame, FrameSink, FrameStream, Transport};

const HEARTBEAT_TIMER: &str = "heartbeat";
const RECONNECT_TIMER: &str = "reconnect";

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection timing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Delay before reconnect attempt number `attempt` (1-based). Linear backoff.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_interval.saturating_mul(attempt)
    }
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    reconnect_attempts: u32,
    /// Bumped on every open attempt and every caller disconnect; async work
    /// that finishes under an older generation is discarded.
    generation: u64,
}

struct ConnectionInner {
    id: Uuid,
    endpoint: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    status: Mutex<Status>,
    sink: tokio::sync::Mutex<Option<FrameSink>>,
    reader: Mutex<Option<AbortHandle>>,
    handlers: RwLock<Vec<(HandlerId, EventHandler)>>,
    next_handler: AtomicU64,
}

/// Shared handle to one physical stream. Cloning is cheap; all clones drive
/// the same state machine.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl Connection {
    pub fn new(
        endpoint: impl Into<String>,
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: Uuid::now_v7(),
                endpoint: endpoint.into(),
                options,
                transport,
                scheduler,
                status: Mutex::new(Status {
                    state: ConnectionState::Idle,
                    reconnect_attempts: 0,
                    generation: 0,
                }),
                sink: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                next_handler: AtomicU64::new(1),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock_status().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_status().reconnect_attempts
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Open the stream. No-op while connecting or open.
    ///
    /// A caller-initiated connect resets the attempt counter, so this is also
    /// how a connection that exhausted its reconnects is revived. A failed
    /// open is reported through an `Error` event and retried by the reconnect
    /// policy; `Err` is returned only when no retry will follow.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let mut status = self.inner.lock_status();
            if matches!(
                status.state,
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                return Ok(());
            }
            status.reconnect_attempts = 0;
        }
        self.inner.scheduler.cancel(&self.inner.timer(RECONNECT_TIMER));
        self.inner.open().await
    }

    /// Stop heartbeat and reconnect timers and close the stream. Idempotent;
    /// never triggers a reconnect.
    pub async fn disconnect(&self) {
        self.inner.disconnect("disconnected by caller").await;
    }

    /// Send a frame. Fails with `NotReady` unless the connection is open.
    pub async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(self.inner.not_ready(state));
        }
        let mut sink = self.inner.sink.lock().await;
        match sink.as_mut() {
            Some(sink) => sink.send(frame).await,
            None => Err(self.inner.not_ready(self.state())),
        }
    }

    /// Serialize `value` as JSON and send it as a text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ConnectionError> {
        let frame = Frame::json(value).map_err(|e| ConnectionError::Transport {
            endpoint: self.inner.endpoint.clone(),
            reason: format!("failed to encode payload: {}", e),
        })?;
        self.send(frame).await
    }

    /// Register an event handler. Handlers run synchronously, in registration
    /// order, on the task that produced the event.
    pub fn on<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.push((id, Arc::new(handler)));
        }
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let Ok(mut handlers) = self.inner.handlers.write() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }
}

impl ConnectionInner {
    fn lock_status(&self) -> MutexGuard<'_, Status> {
        // Status is plain data; a panic while holding it cannot leave it torn.
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn timer(&self, kind: &'static str) -> TimerKey {
        TimerKey::new(kind, self.id.to_string())
    }

    fn not_ready(&self, state: ConnectionState) -> ConnectionError {
        ConnectionError::NotReady {
            endpoint: self.endpoint.clone(),
            state: state.to_string(),
        }
    }

    /// One open attempt. Boxed so the reconnect timer can spawn it.
    fn open(self: &Arc<Self>) -> BoxFuture<'static, Result<(), ConnectionError>> {
        let this = Arc::clone(self);
        Box::pin(async move {
            let generation = {
                let mut status = this.lock_status();
                if matches!(
                    status.state,
                    ConnectionState::Connecting | ConnectionState::Open
                ) {
                    return Ok(());
                }
                status.state = ConnectionState::Connecting;
                status.generation += 1;
                status.generation
            };
            debug!(endpoint = %this.endpoint, generation, "Opening connection");

            match this.transport.open(&this.endpoint).await {
                Ok(duplex) => {
                    let mut sink_slot = this.sink.lock().await;
                    let current = {
                        let mut status = this.lock_status();
                        if status.generation == generation
                            && status.state == ConnectionState::Connecting
                        {
                            status.state = ConnectionState::Open;
                            status.reconnect_attempts = 0;
                            true
                        } else {
                            false
                        }
                    };
                    if !current {
                        drop(sink_slot);
                        let mut sink = duplex.sink;
                        let _ = sink.close().await;
                        debug!(endpoint = %this.endpoint, "Discarded stream opened after disconnect");
                        return Ok(());
                    }
                    *sink_slot = Some(duplex.sink);
                    drop(sink_slot);

                    info!(endpoint = %this.endpoint, connection_id = %this.id, "Connection open");
                    this.emit(&ConnectionEvent::Connected);
                    this.spawn_reader(duplex.stream, generation);
                    this.start_heartbeat();
                    Ok(())
                }
                Err(err) => {
                    {
                        let mut status = this.lock_status();
                        if status.generation != generation {
                            return Ok(());
                        }
                        status.state = ConnectionState::Closed;
                    }
                    warn!(
                        endpoint = %this.endpoint,
                        kind = %err.kind(),
                        error = %err,
                        "Connection attempt failed"
                    );
                    this.emit(&ConnectionEvent::Error(err));
                    this.schedule_reconnect()
                }
            }
        })
    }

    /// Apply the reconnect policy after a failure or unexpected close.
    fn schedule_reconnect(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let attempt = {
            let mut status = self.lock_status();
            status.reconnect_attempts += 1;
            if status.reconnect_attempts > self.options.max_reconnect_attempts {
                status.state = ConnectionState::Closed;
                None
            } else {
                status.state = ConnectionState::Reconnecting;
                Some(status.reconnect_attempts)
            }
        };

        match attempt {
            Some(attempt) => {
                let delay = self.options.reconnect_delay(attempt);
                info!(
                    endpoint = %self.endpoint,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                let weak = Arc::downgrade(self);
                self.scheduler
                    .schedule_once(self.timer(RECONNECT_TIMER), delay, async move {
                        if let Some(inner) = weak.upgrade() {
                            let _ = inner.open().await;
                        }
                    });
                Ok(())
            }
            None => {
                let err = ConnectionError::ReconnectExhausted {
                    endpoint: self.endpoint.clone(),
                    attempts: self.options.max_reconnect_attempts,
                };
                error!(endpoint = %self.endpoint, kind = %err.kind(), "Giving up on reconnect");
                self.emit(&ConnectionEvent::Error(err.clone()));
                Err(err)
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: FrameStream, generation: u64) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut reason = "stream ended".to_string();
            while let Some(item) = stream.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match item {
                    Ok(frame) if frame.is_control() => {}
                    Ok(frame) => inner.emit(&ConnectionEvent::Message(frame)),
                    Err(err) => {
                        reason = err.to_string();
                        inner.emit(&ConnectionEvent::Error(err));
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.handle_stream_closed(generation, reason).await;
            }
        });
        let previous = self
            .reader
            .lock()
            .ok()
            .and_then(|mut reader| reader.replace(handle.abort_handle()));
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn handle_stream_closed(self: &Arc<Self>, generation: u64, reason: String) {
        {
            let mut status = self.lock_status();
            if status.generation != generation || status.state != ConnectionState::Open {
                return;
            }
            status.state = ConnectionState::Closed;
        }
        self.scheduler.cancel(&self.timer(HEARTBEAT_TIMER));
        self.sink.lock().await.take();
        warn!(endpoint = %self.endpoint, reason = %reason, "Connection closed unexpectedly");
        self.emit(&ConnectionEvent::Disconnected { reason });
        let _ = self.schedule_reconnect();
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule_repeating(
            self.timer(HEARTBEAT_TIMER),
            self.options.heartbeat_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.send_heartbeat().await;
                    }
                }
            },
        );
    }

    /// Fire-and-forget liveness ping. Failures surface as `Error` events;
    /// the transport's own stream termination drives reconnect.
    async fn send_heartbeat(&self) {
        if self.lock_status().state != ConnectionState::Open {
            return;
        }
        let result = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(Frame::heartbeat()).await,
                None => return,
            }
        };
        if let Err(err) = result {
            let err = ConnectionError::HeartbeatFailed {
                endpoint: self.endpoint.clone(),
                reason: err.to_string(),
            };
            warn!(endpoint = %self.endpoint, kind = %err.kind(), error = %err, "Heartbeat failed");
            self.emit(&ConnectionEvent::Error(err));
        }
    }

    async fn disconnect(&self, reason: &str) {
        let previous = {
            let mut status = self.lock_status();
            status.generation += 1;
            let previous = status.state;
            if !matches!(previous, ConnectionState::Idle | ConnectionState::Closed) {
                status.state = ConnectionState::Closing;
            }
            previous
        };

        self.scheduler.cancel(&self.timer(HEARTBEAT_TIMER));
        self.scheduler.cancel(&self.timer(RECONNECT_TIMER));
        let reader = self.reader.lock().ok().and_then(|mut reader| reader.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(err) = sink.close().await {
                debug!(endpoint = %self.endpoint, error = %err, "Error while closing stream");
            }
        }

        if matches!(previous, ConnectionState::Idle | ConnectionState::Closed) {
            return;
        }
        self.lock_status().state = ConnectionState::Closed;
        info!(endpoint = %self.endpoint, connection_id = %self.id, "Connection closed");
        if previous == ConnectionState::Open {
            self.emit(&ConnectionEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Deliver `event` to every handler in registration order. A panicking
    /// handler is logged and skipped.
    fn emit(&self, event: &ConnectionEvent) {
        let handlers: Vec<(HandlerId, EventHandler)> = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(
                    endpoint = %self.endpoint,
                    handler = id.0,
                    event = event.kind(),
                    "Connection event handler panicked"
                );
            }
        }
    }
}
