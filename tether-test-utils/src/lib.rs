//! TETHER Test Utilities
//!
//! Shared test infrastructure for the TETHER workspace:
//! - Scripted transports and servers for driving connections
//! - Mock fetchers, probes and prefetchers
//! - Proptest generators for cache keys, routes and payloads
//! - Fixtures for common configurations

pub use tether_core::{
    ConnectionError, FetchError, ManualClock, ProbeError, Scheduler, SharedClock, TetherConfig,
    Timestamp,
};
pub use tether_realtime::{Connection, ConnectionEvent, ConnectionOptions, Frame};

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Sink;
use serde_json::{json, Value};
use tether_coordinator::{PrefetchRequest, Prefetcher};
use tether_offline::HealthProbe;
use tether_realtime::{DuplexStream, Transport};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// SCRIPTED TRANSPORT
// ============================================================================

#[derive(Debug)]
struct TransportState {
    accepting: AtomicBool,
    open_attempts: AtomicUsize,
    open_delay: Mutex<Duration>,
    servers: Mutex<Vec<ServerHandle>>,
}

/// In-memory [`Transport`]. Every accepted open creates a [`ServerHandle`]
/// the test uses to push frames, inspect what the client sent, or kill the
/// stream.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    state: Arc<TransportState>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// A transport that accepts every open.
    pub fn new() -> Self {
        Self {
            state: Arc::new(TransportState {
                accepting: AtomicBool::new(true),
                open_attempts: AtomicUsize::new(0),
                open_delay: Mutex::new(Duration::ZERO),
                servers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A transport that refuses every open until [`set_accepting`](Self::set_accepting).
    pub fn refusing() -> Self {
        let transport = Self::new();
        transport.set_accepting(false);
        transport
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Make every subsequent open take `delay` before it resolves.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.state.open_delay) = delay;
    }

    pub fn open_attempts(&self) -> usize {
        self.state.open_attempts.load(Ordering::SeqCst)
    }

    /// Every stream accepted so far, oldest first.
    pub fn servers(&self) -> Vec<ServerHandle> {
        lock(&self.state.servers).clone()
    }

    pub fn last_server(&self) -> Option<ServerHandle> {
        lock(&self.state.servers).last().cloned()
    }

    pub fn shared(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, endpoint: &str) -> Result<DuplexStream, ConnectionError> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerHandle {
            state: Arc::new(ServerState {
                endpoint: endpoint.to_string(),
                inbound: Mutex::new(Some(tx)),
                sent: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
                closed_by_client: AtomicBool::new(false),
            }),
        };
        lock(&self.state.servers).push(server.clone());

        let sink = RecordingSink {
            server: server.clone(),
        };
        Ok(DuplexStream::new(
            Box::pin(sink),
            Box::pin(UnboundedReceiverStream::new(rx)),
        ))
    }
}

#[derive(Debug)]
struct ServerState {
    endpoint: String,
    inbound: Mutex<Option<mpsc::UnboundedSender<Result<Frame, ConnectionError>>>>,
    sent: Mutex<Vec<Frame>>,
    fail_sends: AtomicBool,
    closed_by_client: AtomicBool,
}

/// The server side of one accepted stream.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &str {
        &self.state.endpoint
    }

    /// Deliver a frame to the client. Returns false once the stream is gone.
    pub fn push(&self, frame: Frame) -> bool {
        lock(&self.state.inbound)
            .as_ref()
            .map(|tx| tx.send(Ok(frame)).is_ok())
            .unwrap_or(false)
    }

    pub fn push_text(&self, text: &str) -> bool {
        self.push(Frame::text(text))
    }

    /// Deliver a stream error, which ends the client's read loop.
    pub fn push_error(&self, reason: &str) -> bool {
        let err = ConnectionError::Transport {
            endpoint: self.state.endpoint.clone(),
            reason: reason.to_string(),
        };
        lock(&self.state.inbound)
            .as_ref()
            .map(|tx| tx.send(Err(err)).is_ok())
            .unwrap_or(false)
    }

    /// End the stream as if the peer went away.
    pub fn drop_connection(&self) {
        lock(&self.state.inbound).take();
    }

    /// Make every subsequent client send fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<Frame> {
        lock(&self.state.sent).clone()
    }

    /// Text payloads the client sent, ignoring heartbeats.
    pub fn sent_text(&self) -> Vec<String> {
        lock(&self.state.sent)
            .iter()
            .filter_map(|frame| frame.as_text().map(str::to_string))
            .collect()
    }

    pub fn heartbeat_count(&self) -> usize {
        lock(&self.state.sent)
            .iter()
            .filter(|frame| frame.is_control())
            .count()
    }

    /// Whether the client closed its write half.
    pub fn closed_by_client(&self) -> bool {
        self.state.closed_by_client.load(Ordering::SeqCst)
    }
}

struct RecordingSink {
    server: ServerHandle,
}

impl Sink<Frame> for RecordingSink {
    type Error = ConnectionError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: Frame) -> Result<(), Self::Error> {
        let state = &self.server.state;
        if state.fail_sends.load(Ordering::SeqCst) {
            return Err(ConnectionError::Transport {
                endpoint: state.endpoint.clone(),
                reason: "broken pipe".to_string(),
            });
        }
        lock(&state.sent).push(frame);
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.server
            .state
            .closed_by_client
            .store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// EVENT RECORDER
// ============================================================================

/// Collects every event a connection emits.
#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl EventRecorder {
    pub fn attach(connection: &Connection) -> Self {
        let recorder = Self::default();
        let events = Arc::clone(&recorder.events);
        connection.on(move |event| lock(&events).push(event.clone()));
        recorder
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        lock(&self.events).clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(ConnectionEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|event| event.kind() == kind)
            .count()
    }

    /// Text of every `Message` event, in order.
    pub fn messages(&self) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ConnectionEvent::Message(frame) => frame.as_text().map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

// ============================================================================
// MOCK FETCHERS AND PROBES
// ============================================================================

/// Network stand-in that counts calls and returns a configurable response.
#[derive(Debug, Clone)]
pub struct CountingFetcher {
    calls: Arc<AtomicUsize>,
    response: Arc<Mutex<Result<Value, FetchError>>>,
    delay: Option<Duration>,
}

impl CountingFetcher {
    pub fn returning(value: Value) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            response: Arc::new(Mutex::new(Ok(value))),
            delay: None,
        }
    }

    pub fn failing(reason: &str) -> Self {
        let fetcher = Self::returning(Value::Null);
        fetcher.fail_with(reason);
        fetcher
    }

    /// Every fetch sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond_with(&self, value: Value) {
        *lock(&self.response) = Ok(value);
    }

    pub fn fail_with(&self, reason: &str) {
        *lock(&self.response) = Err(FetchError::failed(reason));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start one fetch. The call is counted immediately.
    pub fn fetch(&self) -> impl Future<Output = Result<Value, FetchError>> + Send + 'static {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = lock(&self.response).clone();
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }
}

/// Scripted [`HealthProbe`]. Queued responses are used first, then the
/// default health.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    healthy: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<(Duration, bool)>>>,
}

impl StaticProbe {
    pub fn healthy() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn unhealthy() -> Self {
        let probe = Self::healthy();
        probe.set_healthy(false);
        probe
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Queue one response that arrives after `delay`.
    pub fn push_response(&self, delay: Duration, healthy: bool) {
        lock(&self.script).push_back((delay, healthy));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> Arc<dyn HealthProbe> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = lock(&self.script).pop_front();
        let healthy = match scripted {
            Some((delay, healthy)) => {
                tokio::time::sleep(delay).await;
                healthy
            }
            None => self.healthy.load(Ordering::SeqCst),
        };
        if healthy {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy {
                url: url.to_string(),
                status: 503,
            })
        }
    }
}

/// [`Prefetcher`] that records requests and echoes them back as JSON.
#[derive(Debug, Clone, Default)]
pub struct RecordingPrefetcher {
    requests: Arc<Mutex<Vec<PrefetchRequest>>>,
    failing_types: Arc<Mutex<Vec<String>>>,
}

impl RecordingPrefetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every prefetch of `data_type`.
    pub fn fail_for(&self, data_type: &str) {
        lock(&self.failing_types).push(data_type.to_string());
    }

    pub fn requests(&self) -> Vec<PrefetchRequest> {
        lock(&self.requests).clone()
    }

    pub fn shared(&self) -> Arc<dyn Prefetcher> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Prefetcher for RecordingPrefetcher {
    async fn prefetch(&self, request: &PrefetchRequest) -> Result<Value, FetchError> {
        lock(&self.requests).push(request.clone());
        if lock(&self.failing_types).contains(&request.data_type) {
            return Err(FetchError::failed(format!(
                "no data for {}",
                request.data_type
            )));
        }
        Ok(json!({
            "route": request.route,
            "data_type": request.data_type,
            "user_id": request.user_id,
        }))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for TETHER inputs.

    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Short cache keys drawn from a small alphabet so collisions happen.
    pub fn arb_cache_key() -> impl Strategy<Value = String> {
        "[a-e]{1,3}"
    }

    /// Keys under one of the user-scoped or public prefixes.
    pub fn arb_prefixed_key() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["user:", "profile:", "sessions:", "courses:", "public:"]),
            "[a-z0-9]{1,6}",
        )
            .prop_map(|(prefix, rest)| format!("{}{}", prefix, rest))
    }

    /// Application routes like `/courses` or `/settings`.
    pub fn arb_route() -> impl Strategy<Value = String> {
        prop::sample::select(vec![
            "/dashboard",
            "/courses",
            "/profile",
            "/settings",
            "/help",
            "/library",
        ])
        .prop_map(str::to_string)
    }

    /// Small JSON payloads.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            "[a-z ]{0,16}".prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            ("[a-z]{1,8}", any::<u32>()).prop_map(|(name, n)| json!({ "name": name, "n": n })),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made configurations and clocks.

    use super::*;
    use chrono::{TimeZone, Utc};

    pub const API_BASE: &str = "http://localhost:3000";
    pub const WS_ENDPOINT: &str = "ws://localhost:3000/ws";

    /// Valid configuration pointing at localhost with short timers.
    pub fn test_config() -> TetherConfig {
        let mut config = TetherConfig::with_endpoints(API_BASE, WS_ENDPOINT);
        config.connection.heartbeat_interval_ms = 1_000;
        config.connection.reconnect_interval_ms = 100;
        config.connection.max_reconnect_attempts = 3;
        config
    }

    /// Connection options with a 1s heartbeat and 100ms reconnect step.
    pub fn fast_options() -> ConnectionOptions {
        ConnectionOptions::new()
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_reconnect_interval(Duration::from_millis(100))
            .with_max_reconnect_attempts(3)
    }

    /// A manual clock fixed at 2024-01-01T00:00:00Z.
    pub fn manual_clock() -> Arc<ManualClock> {
        let start: Timestamp = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Arc::new(ManualClock::new(start))
    }

    pub fn shared(clock: &Arc<ManualClock>) -> SharedClock {
        clock.clone()
    }
}
