//! Reference-counted pool of connections, one per endpoint.
//!
//! Subscribers borrow a shared [`Connection`] by `(endpoint, subscriber_id)`.
//! Releasing never tears the socket down; an idle sweep closes entries that
//! have had no subscribers for longer than `max_idle_time`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tether_core::{
    elapsed_between, ConnectionError, PoolSettings, Scheduler, SharedClock, TetherConfig,
    TimerKey,
};
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionOptions, ConnectionState};
use crate::transport::Transport;

const CLEANUP_TIMER: &str = "pool-cleanup";

/// Pool timing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub cleanup_interval: Duration,
    pub max_idle_time: Duration,
    /// Options for connections created without explicit options.
    pub connection: ConnectionOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            cleanup_interval: Duration::from_millis(settings.cleanup_interval_ms),
            max_idle_time: Duration::from_millis(settings.max_idle_time_ms),
            connection: ConnectionOptions::default(),
        }
    }
}

impl From<&TetherConfig> for PoolConfig {
    fn from(config: &TetherConfig) -> Self {
        Self::from(&config.pool).with_connection_options(ConnectionOptions::from(&config.connection))
    }
}

impl PoolConfig {
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }
}

#[derive(Debug)]
struct PooledConnectionEntry {
    connection: Connection,
    subscriber_ids: HashSet<String>,
    last_used_at: DateTime<Utc>,
}

struct PoolInner {
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    clock: SharedClock,
    config: PoolConfig,
    entries: Mutex<HashMap<String, PooledConnectionEntry>>,
}

impl PoolInner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, PooledConnectionEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared pool handle. Clones refer to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("total", &self.get_total_connection_count())
            .field("active", &self.get_active_connection_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheduler: Scheduler,
        clock: SharedClock,
        config: PoolConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                transport,
                scheduler,
                clock,
                config,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow the connection for `endpoint` on behalf of `subscriber_id`,
    /// creating and connecting it on first use.
    ///
    /// `options` only apply when the entry is created. A connection that gave
    /// up reconnecting is revived with an explicit connect.
    pub async fn get_connection(
        &self,
        endpoint: &str,
        subscriber_id: &str,
        options: Option<ConnectionOptions>,
    ) -> Result<Connection, ConnectionError> {
        let now = self.inner.clock.now();
        let (connection, created) = {
            let mut entries = self.inner.lock_entries();
            match entries.get_mut(endpoint) {
                Some(entry) => {
                    entry.subscriber_ids.insert(subscriber_id.to_string());
                    entry.last_used_at = now;
                    (entry.connection.clone(), false)
                }
                None => {
                    let connection = Connection::new(
                        endpoint,
                        options.unwrap_or_else(|| self.inner.config.connection.clone()),
                        Arc::clone(&self.inner.transport),
                        self.inner.scheduler.clone(),
                    );
                    let mut subscriber_ids = HashSet::new();
                    subscriber_ids.insert(subscriber_id.to_string());
                    entries.insert(
                        endpoint.to_string(),
                        PooledConnectionEntry {
                            connection: connection.clone(),
                            subscriber_ids,
                            last_used_at: now,
                        },
                    );
                    (connection, true)
                }
            }
        };

        let needs_connect = created
            || matches!(
                connection.state(),
                ConnectionState::Idle | ConnectionState::Closed
            );
        if needs_connect {
            if created {
                info!(endpoint = %endpoint, subscriber_id = %subscriber_id, "Creating pooled connection");
            } else {
                debug!(endpoint = %endpoint, "Reviving closed pooled connection");
            }
            if let Err(err) = connection.connect().await {
                self.remove_subscriber(endpoint, subscriber_id);
                return Err(err);
            }
        }
        Ok(connection)
    }

    /// Drop a subscriber's claim. The connection stays up until a sweep finds
    /// it idle.
    pub fn release_connection(&self, endpoint: &str, subscriber_id: &str) -> bool {
        let removed = self.remove_subscriber(endpoint, subscriber_id);
        if removed {
            debug!(endpoint = %endpoint, subscriber_id = %subscriber_id, "Released pooled connection");
        }
        removed
    }

    fn remove_subscriber(&self, endpoint: &str, subscriber_id: &str) -> bool {
        let now = self.inner.clock.now();
        let mut entries = self.inner.lock_entries();
        match entries.get_mut(endpoint) {
            Some(entry) => {
                let removed = entry.subscriber_ids.remove(subscriber_id);
                entry.last_used_at = now;
                removed
            }
            None => false,
        }
    }

    /// Disconnect and remove entries with no subscribers that have been idle
    /// longer than `max_idle_time`. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = self.inner.clock.now();
        let max_idle = self.inner.config.max_idle_time;
        let stale: Vec<(String, Connection)> = {
            let mut entries = self.inner.lock_entries();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry.subscriber_ids.is_empty()
                        && elapsed_between(entry.last_used_at, now) > max_idle
                })
                .map(|(endpoint, _)| endpoint.clone())
                .collect();
            keys.into_iter()
                .filter_map(|endpoint| {
                    entries
                        .remove(&endpoint)
                        .map(|entry| (endpoint, entry.connection))
                })
                .collect()
        };

        for (endpoint, connection) in &stale {
            debug!(endpoint = %endpoint, "Closing idle pooled connection");
            connection.disconnect().await;
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "Pool cleanup sweep");
        }
        stale.len()
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval`.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule_repeating(
            TimerKey::singleton(CLEANUP_TIMER),
            self.inner.config.cleanup_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionPool { inner }.cleanup().await;
                    }
                }
            },
        );
    }

    /// Stop the sweep and force-close every connection.
    pub async fn disconnect_all(&self) {
        self.inner
            .scheduler
            .cancel(&TimerKey::singleton(CLEANUP_TIMER));
        let drained: Vec<(String, PooledConnectionEntry)> =
            self.inner.lock_entries().drain().collect();
        for (endpoint, entry) in drained {
            debug!(endpoint = %endpoint, subscribers = entry.subscriber_ids.len(), "Force-closing pooled connection");
            entry.connection.disconnect().await;
        }
    }

    /// Entries with at least one subscriber.
    pub fn get_active_connection_count(&self) -> usize {
        self.inner
            .lock_entries()
            .values()
            .filter(|entry| !entry.subscriber_ids.is_empty())
            .count()
    }

    pub fn get_total_connection_count(&self) -> usize {
        self.inner.lock_entries().len()
    }

    /// Snapshot of the subscriber set for `endpoint`, sorted.
    pub fn subscribers(&self, endpoint: &str) -> Vec<String> {
        let mut subscribers: Vec<String> = self
            .inner
            .lock_entries()
            .get(endpoint)
            .map(|entry| entry.subscriber_ids.iter().cloned().collect())
            .unwrap_or_default();
        subscribers.sort();
        subscribers
    }

    pub fn connection(&self, endpoint: &str) -> Option<Connection> {
        self.inner
            .lock_entries()
            .get(endpoint)
            .map(|entry| entry.connection.clone())
    }
}
