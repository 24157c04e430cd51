//! Composition root.
//!
//! [`DeliveryContext`] wires every component from one [`TetherConfig`] and
//! owns their timers. Nothing in the workspace is a global; an application
//! builds one context at startup and calls [`DeliveryContext::shutdown`] on
//! the way out.

use std::sync::Arc;

use tether_coordinator::{CacheCoordinator, CoordinatorConfig, Prefetcher};
use tether_core::{
    millis, system_clock, ConnectionError, DeliveryResult, Scheduler, SharedClock, TetherConfig,
};
use tether_offline::{
    HealthProbe, HttpHealthProbe, MonitorConfig, NetworkMonitor, OfflineConfig,
    OfflineContentStore,
};
use tether_realtime::{Connection, ConnectionPool, PoolConfig, Transport, WsTransport};
use tether_storage::{CacheConfig, VersionedCache};
use tracing::info;

/// Overrides for the pieces a context talks to the outside world through.
/// Anything left unset gets its production implementation.
pub struct DeliveryContextBuilder {
    config: TetherConfig,
    clock: Option<SharedClock>,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn HealthProbe>>,
    prefetcher: Option<Arc<dyn Prefetcher>>,
}

impl DeliveryContextBuilder {
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_prefetcher(mut self, prefetcher: Arc<dyn Prefetcher>) -> Self {
        self.prefetcher = Some(prefetcher);
        self
    }

    /// Validate the config and construct every component. Opens the offline
    /// store; starts no timers.
    pub fn build(self) -> DeliveryResult<DeliveryContext> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let scheduler = Scheduler::new();
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WsTransport::new()),
        };
        let probe: Arc<dyn HealthProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpHealthProbe::new(millis(
                config.network.probe_timeout_ms,
            ))?),
        };

        let pool = ConnectionPool::new(
            transport,
            scheduler.clone(),
            clock.clone(),
            PoolConfig::from(&config),
        );
        let cache = Arc::new(VersionedCache::new(
            CacheConfig::from(&config.cache),
            clock.clone(),
        ));
        let coordinator_config = CoordinatorConfig::from(&config.coordinator);
        let coordinator = match self.prefetcher {
            Some(prefetcher) => CacheCoordinator::with_prefetcher(
                Arc::clone(&cache),
                clock.clone(),
                coordinator_config,
                prefetcher,
            ),
            None => CacheCoordinator::new(Arc::clone(&cache), clock.clone(), coordinator_config),
        };
        let monitor = NetworkMonitor::new(MonitorConfig::from(&config), probe, scheduler.clone());
        let offline = OfflineContentStore::open(
            OfflineConfig::from(&config.offline),
            monitor.clone(),
            clock.clone(),
            scheduler.clone(),
        )?;

        Ok(DeliveryContext {
            config,
            clock,
            scheduler,
            pool,
            cache,
            coordinator,
            monitor,
            offline,
        })
    }
}

/// Every delivery component, built from one config.
pub struct DeliveryContext {
    config: TetherConfig,
    clock: SharedClock,
    scheduler: Scheduler,
    pool: ConnectionPool,
    cache: Arc<VersionedCache>,
    coordinator: CacheCoordinator,
    monitor: NetworkMonitor,
    offline: OfflineContentStore,
}

impl std::fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("ws_endpoint", &self.config.endpoints.ws_endpoint)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl DeliveryContext {
    pub fn builder(config: TetherConfig) -> DeliveryContextBuilder {
        DeliveryContextBuilder {
            config,
            clock: None,
            transport: None,
            probe: None,
            prefetcher: None,
        }
    }

    /// Build with production transports and probes.
    pub fn from_config(config: TetherConfig) -> DeliveryResult<Self> {
        Self::builder(config).build()
    }

    /// Start the background work: pool sweep, cache sweep, liveness probes
    /// and the offline expiry sweep (which also runs once right away).
    pub fn init(&self) -> DeliveryResult<()> {
        self.pool.start();
        self.cache.start_sweeper(&self.scheduler);
        self.monitor.start();
        let expired = self.offline.start()?;
        info!(
            ws_endpoint = %self.config.endpoints.ws_endpoint,
            health_url = %self.monitor.config().health_url,
            expired,
            "Delivery context started"
        );
        Ok(())
    }

    /// Stop every timer and close every pooled connection.
    pub async fn shutdown(&self) {
        self.monitor.stop();
        self.offline.stop();
        self.cache.stop_sweeper(&self.scheduler);
        self.pool.disconnect_all().await;
        self.scheduler.cancel_all();
        info!("Delivery context shut down");
    }

    /// Borrow the connection to the configured WebSocket endpoint.
    pub async fn subscribe_realtime(
        &self,
        subscriber_id: &str,
    ) -> Result<Connection, ConnectionError> {
        self.pool
            .get_connection(&self.config.endpoints.ws_endpoint, subscriber_id, None)
            .await
    }

    pub fn release_realtime(&self, subscriber_id: &str) -> bool {
        self.pool
            .release_connection(&self.config.endpoints.ws_endpoint, subscriber_id)
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<VersionedCache> {
        &self.cache
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn offline(&self) -> &OfflineContentStore {
        &self.offline
    }
}
