//! Cache strategy coordinator.
//!
//! Every read names a data type; the data type's [`StrategyConfig`] decides
//! whether the answer comes from the cache, the network, or both. Writes into
//! the cache carry the strategy's TTL and tags, so tag invalidation reaches
//! everything a data type produced.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{
    to_chrono, CacheError, CoordinatorSettings, DeliveryError, DeliveryResult, ErrorKind,
    FetchError, SharedClock,
};
use tether_storage::{CacheStats, InvalidationEvent, InvalidationScope, SetOptions, VersionedCache};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::navigation::NavigationGraph;
use crate::prefetch::{PrefetchRequest, Prefetcher, SkipReason, WarmingPlan, WarmingTarget};
use crate::query_store::{QueryStore, QuerySubscription};
use crate::strategy::{CacheStrategy, StrategyConfig};

/// Key prefixes holding data that belongs to the signed-in user.
pub const USER_SCOPED_PREFIXES: &[&str] = &[
    "user:",
    "profile:",
    "sessions:",
    "providers:",
    "linked-providers:",
];

/// Coordinator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// How many predicted destinations are warmed per call.
    pub prediction_limit: usize,
    /// Default age after which navigation edges are pruned.
    pub pattern_max_age: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&CoordinatorSettings::default())
    }
}

impl From<&CoordinatorSettings> for CoordinatorConfig {
    fn from(settings: &CoordinatorSettings) -> Self {
        Self {
            prediction_limit: settings.prediction_limit,
            pattern_max_age: Duration::from_millis(settings.pattern_max_age_ms),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_prediction_limit(mut self, limit: usize) -> Self {
        self.prediction_limit = limit;
        self
    }

    pub fn with_pattern_max_age(mut self, max_age: Duration) -> Self {
        self.pattern_max_age = max_age;
        self
    }
}

/// Options for the `invalidate_*` family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Also tell matching live queries to refetch.
    pub refetch_active: bool,
}

impl InvalidateOptions {
    pub fn refetch() -> Self {
        Self {
            refetch_active: true,
        }
    }
}

/// Result of an invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub purged: usize,
    pub refetched: usize,
}

/// Cache statistics plus coordinator bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStats {
    pub cache: CacheStats,
    pub strategies: usize,
    pub navigation_edges: usize,
    pub live_queries: usize,
    pub in_flight_revalidations: usize,
}

struct CoordinatorInner {
    cache: Arc<VersionedCache>,
    clock: SharedClock,
    config: CoordinatorConfig,
    strategies: RwLock<HashMap<String, StrategyConfig>>,
    routes: RwLock<HashMap<String, Vec<String>>>,
    navigation: Mutex<NavigationGraph>,
    revalidating: Mutex<HashSet<String>>,
    queries: QueryStore,
    prefetcher: Option<Arc<dyn Prefetcher>>,
}

impl CoordinatorInner {
    fn lock_navigation(&self) -> MutexGuard<'_, NavigationGraph> {
        self.navigation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_revalidating(&self) -> MutexGuard<'_, HashSet<String>> {
        self.revalidating
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store<T: Serialize>(&self, config: &StrategyConfig, key: &str, data: &T) {
        let options = SetOptions::new()
            .ttl(config.ttl)
            .tags(config.tags.iter().cloned());
        if let Err(e) = self.cache.set_with(key, data, options) {
            warn!(key = %key, data_type = %config.data_type, error = %e, "Failed to cache fetched value");
        }
    }
}

/// Marks a key as being revalidated. Dropping it clears the mark, so a
/// refresh that panics or is aborted does not block later refreshes.
struct RevalidationGuard {
    inner: Arc<CoordinatorInner>,
    key: String,
}

impl RevalidationGuard {
    fn acquire(inner: &Arc<CoordinatorInner>, key: &str) -> Option<Self> {
        if !inner.lock_revalidating().insert(key.to_string()) {
            return None;
        }
        Some(Self {
            inner: Arc::clone(inner),
            key: key.to_string(),
        })
    }
}

impl Drop for RevalidationGuard {
    fn drop(&mut self) {
        self.inner.lock_revalidating().remove(&self.key);
    }
}

/// Shared coordinator handle. Clones refer to the same coordinator.
#[derive(Clone)]
pub struct CacheCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("config", &self.inner.config)
            .field("has_prefetcher", &self.inner.prefetcher.is_some())
            .finish()
    }
}

impl CacheCoordinator {
    pub fn new(cache: Arc<VersionedCache>, clock: SharedClock, config: CoordinatorConfig) -> Self {
        Self::build(cache, clock, config, None)
    }

    pub fn with_prefetcher(
        cache: Arc<VersionedCache>,
        clock: SharedClock,
        config: CoordinatorConfig,
        prefetcher: Arc<dyn Prefetcher>,
    ) -> Self {
        Self::build(cache, clock, config, Some(prefetcher))
    }

    fn build(
        cache: Arc<VersionedCache>,
        clock: SharedClock,
        config: CoordinatorConfig,
        prefetcher: Option<Arc<dyn Prefetcher>>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                cache,
                clock,
                config,
                strategies: RwLock::new(HashMap::new()),
                routes: RwLock::new(HashMap::new()),
                navigation: Mutex::new(NavigationGraph::new()),
                revalidating: Mutex::new(HashSet::new()),
                queries: QueryStore::new(),
                prefetcher,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<VersionedCache> {
        &self.inner.cache
    }

    pub fn queries(&self) -> &QueryStore {
        &self.inner.queries
    }

    // ========================================================================
    // STRATEGIES
    // ========================================================================

    /// Install the strategy for a data type. Last write wins.
    pub fn set_strategy_config(&self, config: StrategyConfig) {
        debug!(data_type = %config.data_type, strategy = %config.strategy, "Strategy configured");
        if let Ok(mut strategies) = self.inner.strategies.write() {
            strategies.insert(config.data_type.clone(), config);
        }
    }

    /// Strategy for `data_type`; unknown types are cache-first with the
    /// cache's default TTL.
    pub fn get_strategy_config(&self, data_type: &str) -> StrategyConfig {
        self.inner
            .strategies
            .read()
            .ok()
            .and_then(|strategies| strategies.get(data_type).cloned())
            .unwrap_or_else(|| {
                StrategyConfig::new(
                    data_type,
                    CacheStrategy::CacheFirst,
                    self.inner.cache.default_ttl(),
                )
            })
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read `key` of `data_type` according to its strategy.
    ///
    /// Errors only when the network is consulted, fails, and there is no
    /// cached value to fall back on.
    pub async fn resolve<T, F, Fut>(&self, data_type: &str, key: &str, fetch: F) -> DeliveryResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let config = self.get_strategy_config(data_type);
        match config.strategy {
            CacheStrategy::CacheFirst => {
                if let Some(cached) = self.inner.cache.get::<T>(key, None) {
                    return Ok(cached);
                }
                let data = fetch().await.map_err(|e| fetch_failed(&config, key, e))?;
                self.inner.store(&config, key, &data);
                Ok(data)
            }
            CacheStrategy::NetworkFirst => self.network_first(&config, key, fetch).await,
            CacheStrategy::StaleWhileRevalidate => match self.inner.cache.get::<T>(key, None) {
                Some(cached) => {
                    self.revalidate(config, key, fetch);
                    Ok(cached)
                }
                None => self.network_first(&config, key, fetch).await,
            },
            CacheStrategy::NetworkOnly => fetch().await.map_err(|e| fetch_failed(&config, key, e)),
        }
    }

    async fn network_first<T, F, Fut>(
        &self,
        config: &StrategyConfig,
        key: &str,
        fetch: F,
    ) -> DeliveryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        match fetch().await {
            Ok(data) => {
                self.inner.store(config, key, &data);
                Ok(data)
            }
            Err(e) => match self.inner.cache.get::<T>(key, None) {
                Some(cached) => {
                    warn!(
                        key = %key,
                        data_type = %config.data_type,
                        kind = %ErrorKind::FetchFailure,
                        error = %e,
                        "Fetch failed, serving cached value"
                    );
                    Ok(cached)
                }
                None => Err(fetch_failed(config, key, e)),
            },
        }
    }

    /// Refresh `key` in the background unless a refresh is already running.
    fn revalidate<T, F, Fut>(&self, config: StrategyConfig, key: &str, fetch: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let Some(guard) = RevalidationGuard::acquire(&self.inner, key) else {
            debug!(key = %key, "Revalidation already in flight");
            return;
        };
        tokio::spawn(async move {
            let key = guard.key.clone();
            match fetch().await {
                Ok(data) => {
                    guard.inner.store(&config, &key, &data);
                    debug!(key = %key, data_type = %config.data_type, "Revalidated");
                }
                Err(e) => warn!(
                    key = %key,
                    data_type = %config.data_type,
                    kind = %ErrorKind::FetchFailure,
                    error = %e,
                    "Background revalidation failed"
                ),
            }
            drop(guard);
        });
    }

    pub fn in_flight_revalidations(&self) -> usize {
        self.inner.lock_revalidating().len()
    }

    /// Register a live query for `key`, tagged with its data type's tags.
    pub fn subscribe_query<F>(&self, data_type: &str, key: &str, refetch: F) -> QuerySubscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let tags = self.get_strategy_config(data_type).tags;
        self.inner.queries.subscribe(key, data_type, tags, refetch)
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Purge every entry carrying `tag`. Entries written through
    /// [`resolve`](Self::resolve) carry their data type's tags.
    pub fn invalidate_by_tag(&self, tag: &str, opts: InvalidateOptions) -> InvalidationOutcome {
        let purged = self.inner.cache.invalidate_tag(tag);
        let refetched = if opts.refetch_active {
            self.inner
                .queries
                .refetch_where(|query| query.tags.contains(tag))
        } else {
            0
        };
        info!(tag = %tag, purged, refetched, "Invalidated by tag");
        InvalidationOutcome { purged, refetched }
    }

    pub fn invalidate_by_pattern(
        &self,
        pattern: &str,
        opts: InvalidateOptions,
    ) -> Result<InvalidationOutcome, CacheError> {
        let regex = Regex::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let purged = self.inner.cache.invalidate_matching(&regex);
        let refetched = if opts.refetch_active {
            self.inner
                .queries
                .refetch_where(|query| regex.is_match(&query.key))
        } else {
            0
        };
        info!(pattern = %pattern, purged, refetched, "Invalidated by pattern");
        Ok(InvalidationOutcome { purged, refetched })
    }

    /// Purge everything that belongs to the signed-in user.
    pub fn invalidate_user_caches(&self, opts: InvalidateOptions) -> InvalidationOutcome {
        let scope = InvalidationScope::Prefixes(USER_SCOPED_PREFIXES);
        let purged = self.inner.cache.invalidate_scope(scope);
        let refetched = if opts.refetch_active {
            self.inner
                .queries
                .refetch_where(|query| scope.matches(&query.key))
        } else {
            0
        };
        info!(purged, refetched, "Invalidated user caches");
        InvalidationOutcome { purged, refetched }
    }

    /// Apply an auth event to the cache. Live queries in the purged slice are
    /// refetched, except on login and logout where the whole session changes
    /// hands.
    pub fn handle_auth_event(&self, event: InvalidationEvent) -> InvalidationOutcome {
        let purged = self.inner.cache.invalidate(event);
        let scope = event.scope();
        let refetched = match scope {
            InvalidationScope::Prefixes(_) => self
                .inner
                .queries
                .refetch_where(|query| scope.matches(&query.key)),
            InvalidationScope::Everything | InvalidationScope::Nothing => 0,
        };
        InvalidationOutcome { purged, refetched }
    }

    // ========================================================================
    // NAVIGATION & WARMING
    // ========================================================================

    pub fn record_navigation(&self, from: &str, to: &str) -> u64 {
        let now = self.inner.clock.now();
        let count = self.inner.lock_navigation().record(from, to, now);
        debug!(from = %from, to = %to, count, "Navigation recorded");
        count
    }

    /// Declare which data types a route renders. Replaces earlier registrations.
    pub fn register_route_data<I, S>(&self, route: &str, data_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let data_types: Vec<String> = data_types.into_iter().map(Into::into).collect();
        if let Ok(mut routes) = self.inner.routes.write() {
            routes.insert(route.to_string(), data_types);
        }
    }

    pub fn route_data(&self, route: &str) -> Vec<String> {
        self.inner
            .routes
            .read()
            .ok()
            .and_then(|routes| routes.get(route).cloned())
            .unwrap_or_default()
    }

    /// Most likely next routes from `context`, best first.
    pub fn predict_next(&self, context: &str, limit: usize) -> Vec<String> {
        self.inner
            .lock_navigation()
            .ranked_from(context)
            .into_iter()
            .take(limit)
            .map(|edge| edge.to.clone())
            .collect()
    }

    /// Start background fetches for the data behind the routes a user is
    /// most likely to visit next from `context`.
    ///
    /// Network-only data is never prefetched, and cache-first or
    /// stale-while-revalidate data that is already cached is left alone.
    pub fn warm_cache_intelligently(&self, user_id: &str, context: &str) -> WarmingPlan {
        let predicted = self.predict_next(context, self.inner.config.prediction_limit);
        let mut plan = WarmingPlan::new(predicted.clone());
        let Some(prefetcher) = self.inner.prefetcher.clone() else {
            debug!(context = %context, "No prefetcher configured, skipping warm-up");
            return plan;
        };
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!(context = %context, "No async runtime available, prefetches not started");
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        for route in &predicted {
            for data_type in self.route_data(route) {
                let config = self.get_strategy_config(&data_type);
                if config.strategy == CacheStrategy::NetworkOnly {
                    plan.skip(route, &data_type, SkipReason::NetworkOnly);
                    continue;
                }
                let request = PrefetchRequest {
                    user_id: user_id.to_string(),
                    route: route.clone(),
                    data_type: data_type.clone(),
                };
                let cache_key = prefetcher.cache_key(&request);
                if !seen.insert(cache_key.clone()) {
                    continue;
                }
                let cached = matches!(
                    config.strategy,
                    CacheStrategy::CacheFirst | CacheStrategy::StaleWhileRevalidate
                ) && self.inner.cache.has(&cache_key, None);
                if cached {
                    plan.skip(route, &data_type, SkipReason::AlreadyCached);
                    continue;
                }

                let Some(runtime) = runtime.as_ref() else {
                    plan.skip(route, &data_type, SkipReason::NoRuntime);
                    continue;
                };

                let target = WarmingTarget {
                    route: route.clone(),
                    data_type: data_type.clone(),
                    cache_key: cache_key.clone(),
                    strategy: config.strategy,
                };
                let inner = Arc::clone(&self.inner);
                let prefetcher = Arc::clone(&prefetcher);
                let job = runtime.spawn(async move {
                    match prefetcher.prefetch(&request).await {
                        Ok(value) => {
                            inner.store(&config, &cache_key, &value);
                            true
                        }
                        Err(e) => {
                            debug!(
                                key = %cache_key,
                                data_type = %config.data_type,
                                kind = %ErrorKind::FetchFailure,
                                error = %e,
                                "Prefetch failed"
                            );
                            false
                        }
                    }
                });
                plan.push_job(target, job);
            }
        }

        info!(
            user_id = %user_id,
            context = %context,
            predicted = plan.predicted_routes.len(),
            warming = plan.targets.len(),
            skipped = plan.skipped.len(),
            "Cache warm-up started"
        );
        plan
    }

    /// Drop navigation edges not seen within `max_age` (default
    /// `pattern_max_age`). Returns how many were dropped.
    pub fn cleanup_old_patterns(&self, max_age: Option<Duration>) -> usize {
        let max_age = max_age.unwrap_or(self.inner.config.pattern_max_age);
        let cutoff = self
            .inner
            .clock
            .now()
            .checked_sub_signed(to_chrono(max_age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.inner.lock_navigation().prune_before(cutoff);
        if removed > 0 {
            debug!(removed, "Pruned navigation patterns");
        }
        removed
    }

    pub fn get_cache_stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache: self.inner.cache.get_stats(),
            strategies: self
                .inner
                .strategies
                .read()
                .map(|strategies| strategies.len())
                .unwrap_or(0),
            navigation_edges: self.inner.lock_navigation().len(),
            live_queries: self.inner.queries.len(),
            in_flight_revalidations: self.in_flight_revalidations(),
        }
    }
}

fn fetch_failed(config: &StrategyConfig, key: &str, err: FetchError) -> DeliveryError {
    warn!(
        key = %key,
        data_type = %config.data_type,
        strategy = %config.strategy,
        kind = %ErrorKind::FetchFailure,
        error = %err,
        "Fetch failed with no cached fallback"
    );
    DeliveryError::Fetch(err)
}
