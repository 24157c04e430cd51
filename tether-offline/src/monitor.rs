//! Network liveness monitor.
//!
//! The OS can report "online" while the origin is unreachable, so liveness
//! combines two signals: the OS connectivity flag and the result of the most
//! recent health probe. Either one failing means offline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_core::{ErrorKind, ProbeError, Scheduler, TetherConfig, TimerKey};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::probe::HealthProbe;

const PROBE_TIMER: &str = "network-probe";
const INITIAL_PROBE_TIMER: &str = "network-probe-initial";

/// Snapshot of both liveness signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub os_online: bool,
    pub heartbeat_failed: bool,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            os_online: true,
            heartbeat_failed: false,
        }
    }
}

impl NetworkStatus {
    pub fn is_offline(&self) -> bool {
        !self.os_online || self.heartbeat_failed
    }

    pub fn is_online(&self) -> bool {
        !self.is_offline()
    }
}

/// Result of one [`NetworkMonitor::probe_now`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(ProbeError),
    /// A newer probe started before this one finished; its result was dropped.
    Superseded,
}

/// Monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub health_url: String,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl MonitorConfig {
    pub fn new(health_url: impl Into<String>) -> Self {
        Self {
            health_url: health_url.into(),
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }
}

impl From<&TetherConfig> for MonitorConfig {
    fn from(config: &TetherConfig) -> Self {
        Self {
            health_url: config.endpoints.health_url(),
            probe_interval: Duration::from_millis(config.network.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.network.probe_timeout_ms),
        }
    }
}

struct MonitorInner {
    config: MonitorConfig,
    probe: Arc<dyn HealthProbe>,
    scheduler: Scheduler,
    status: watch::Sender<NetworkStatus>,
    generation: AtomicU64,
    in_flight: Mutex<Option<AbortHandle>>,
}

/// Shared monitor handle. Clones observe the same status.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("health_url", &self.inner.config.health_url)
            .field("status", &self.status())
            .finish()
    }
}

impl NetworkMonitor {
    pub fn new(config: MonitorConfig, probe: Arc<dyn HealthProbe>, scheduler: Scheduler) -> Self {
        let (status, _) = watch::channel(NetworkStatus::default());
        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                scheduler,
                status,
                generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn status(&self) -> NetworkStatus {
        *self.inner.status.borrow()
    }

    pub fn is_offline(&self) -> bool {
        self.status().is_offline()
    }

    /// Watch liveness changes. The receiver sees every status change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }

    /// Feed the OS connectivity flag.
    pub fn set_os_online(&self, online: bool) {
        let changed = self.inner.status.send_if_modified(|status| {
            let changed = status.os_online != online;
            status.os_online = online;
            changed
        });
        if changed {
            info!(online, "OS connectivity changed");
        }
    }

    /// Probe the health endpoint now, cancelling any probe still in flight.
    ///
    /// Only the newest probe may update the status. Failures flip
    /// `heartbeat_failed` and are logged; they are never returned as errors.
    pub async fn probe_now(&self) -> ProbeOutcome {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let url = inner.config.health_url.clone();
            let result = match tokio::time::timeout(
                inner.config.probe_timeout,
                inner.probe.probe(&url),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeError::Unreachable {
                    url: url.clone(),
                    reason: format!(
                        "timed out after {}ms",
                        inner.config.probe_timeout.as_millis()
                    ),
                }),
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return ProbeOutcome::Superseded;
            }
            let failed = result.is_err();
            inner.status.send_if_modified(|status| {
                let changed = status.heartbeat_failed != failed;
                status.heartbeat_failed = failed;
                changed
            });
            match result {
                Ok(()) => {
                    debug!(url = %url, "Health probe succeeded");
                    ProbeOutcome::Healthy
                }
                Err(e) => {
                    warn!(url = %url, kind = %ErrorKind::HeartbeatFailure, error = %e, "Health probe failed");
                    ProbeOutcome::Unhealthy(e)
                }
            }
        });

        let previous = self
            .inner
            .in_flight
            .lock()
            .ok()
            .and_then(|mut in_flight| in_flight.replace(task.abort_handle()));
        if let Some(previous) = previous {
            previous.abort();
        }

        task.await.unwrap_or(ProbeOutcome::Superseded)
    }

    /// Probe immediately and then every `probe_interval`.
    pub fn start(&self) {
        let initial = self.clone();
        self.inner.scheduler.schedule_once(
            TimerKey::singleton(INITIAL_PROBE_TIMER),
            Duration::ZERO,
            async move {
                initial.probe_now().await;
            },
        );
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule_repeating(
            TimerKey::singleton(PROBE_TIMER),
            self.inner.config.probe_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        NetworkMonitor { inner }.probe_now().await;
                    }
                }
            },
        );
    }

    pub fn stop(&self) {
        self.inner
            .scheduler
            .cancel(&TimerKey::singleton(INITIAL_PROBE_TIMER));
        self.inner.scheduler.cancel(&TimerKey::singleton(PROBE_TIMER));
        let in_flight = self
            .inner
            .in_flight
            .lock()
            .ok()
            .and_then(|mut in_flight| in_flight.take());
        if let Some(task) = in_flight {
            task.abort();
        }
    }
}
