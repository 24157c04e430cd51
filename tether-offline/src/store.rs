//! Offline content store.
//!
//! Wraps the LMDB [`RecordStore`] with TTLs, a network-aware fallback read and
//! cancellable batch downloads. Reads degrade to `None` on storage errors;
//! writes return them.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tether_core::{
    to_chrono, DeliveryError, ErrorKind, FetchError, OfflineSettings, Scheduler, SharedClock,
    StoreError, TimerKey,
};
use tether_storage::{CachedContentRecord, RecordStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::NetworkMonitor;

const SWEEP_TIMER: &str = "offline-sweep";

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineConfig {
    pub store_path: PathBuf,
    pub map_size_mb: usize,
    /// TTL for records written without an explicit one.
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self::from(&OfflineSettings::default())
    }
}

impl From<&OfflineSettings> for OfflineConfig {
    fn from(settings: &OfflineSettings) -> Self {
        Self {
            store_path: settings.store_path.clone(),
            map_size_mb: settings.map_size_mb,
            default_ttl: Duration::from_millis(settings.default_ttl_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms),
        }
    }
}

impl OfflineConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            ..Self::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Per-write options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheContentOptions {
    /// Overrides the store's default TTL.
    pub ttl: Option<Duration>,
    /// Keep the record until explicitly removed.
    pub never_expire: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl CacheContentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn never_expire(mut self) -> Self {
        self.never_expire = true;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of [`OfflineContentStore::get_content_with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct ContentResult<T> {
    pub data: Option<T>,
    pub from_cache: bool,
}

impl<T> ContentResult<T> {
    fn fresh(data: T) -> Self {
        Self {
            data: Some(data),
            from_cache: false,
        }
    }

    fn cached(data: T) -> Self {
        Self {
            data: Some(data),
            from_cache: true,
        }
    }

    fn empty() -> Self {
        Self {
            data: None,
            from_cache: false,
        }
    }
}

/// One item of a batch download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub id: String,
    pub content_type: String,
}

impl BatchItem {
    pub fn new(id: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content_type: content_type.into(),
        }
    }
}

/// What a batch download got done. Committed items stay committed even when
/// the batch was cancelled.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub completed: Vec<String>,
    pub failed: Vec<(String, DeliveryError)>,
    /// Items never attempted because the batch was cancelled.
    pub remaining: Vec<String>,
    pub cancelled: bool,
}

impl BatchOutcome {
    /// `Cancelled` if the batch was cut short, carrying the committed count.
    pub fn error(&self) -> Option<DeliveryError> {
        self.cancelled.then(|| DeliveryError::Cancelled {
            operation: "download_batch".to_string(),
            completed: self.completed.len(),
        })
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed.is_empty()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineStats {
    pub records: usize,
    pub expired: usize,
    pub total_bytes: usize,
    pub by_type: BTreeMap<String, usize>,
}

struct StoreInner {
    records: RecordStore,
    monitor: NetworkMonitor,
    clock: SharedClock,
    scheduler: Scheduler,
    config: OfflineConfig,
}

/// Shared handle to the offline store.
#[derive(Clone)]
pub struct OfflineContentStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for OfflineContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineContentStore")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl OfflineContentStore {
    /// Open the LMDB store at `config.store_path`.
    pub fn open(
        config: OfflineConfig,
        monitor: NetworkMonitor,
        clock: SharedClock,
        scheduler: Scheduler,
    ) -> Result<Self, StoreError> {
        let records = RecordStore::open(&config.store_path, config.map_size_mb)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                records,
                monitor,
                clock,
                scheduler,
                config,
            }),
        })
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.inner.monitor
    }

    /// Persist `data` under `id`.
    pub fn cache_content<T: Serialize>(
        &self,
        id: &str,
        content_type: &str,
        data: &T,
        options: CacheContentOptions,
    ) -> Result<CachedContentRecord, StoreError> {
        let data = serde_json::to_value(data).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;
        let record = self.build_record(id, content_type, data, options);
        self.inner.records.put(&record)?;
        debug!(id = %id, content_type = %content_type, "Cached offline content");
        Ok(record)
    }

    fn build_record(
        &self,
        id: &str,
        content_type: &str,
        data: Value,
        options: CacheContentOptions,
    ) -> CachedContentRecord {
        let now = self.inner.clock.now();
        let expires_at = if options.never_expire {
            None
        } else {
            let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
            now.checked_add_signed(to_chrono(ttl))
        };
        CachedContentRecord {
            id: id.to_string(),
            content_type: content_type.to_string(),
            data,
            cached_at: now,
            expires_at,
            metadata: options.metadata,
        }
    }

    /// The stored record for `id` if it has not expired. Expired records are
    /// removed on the way out.
    pub fn get_cached_content(&self, id: &str) -> Option<CachedContentRecord> {
        let record = match self.inner.records.get(id) {
            Ok(record) => record?,
            Err(e) => {
                warn!(id = %id, kind = %ErrorKind::Storage, error = %e, "Offline read failed");
                return None;
            }
        };
        if record.is_expired(self.inner.clock.now()) {
            if let Err(e) = self.inner.records.delete(id) {
                warn!(id = %id, error = %e, "Failed to remove expired record");
            }
            return None;
        }
        Some(record)
    }

    pub fn is_cached(&self, id: &str) -> bool {
        self.get_cached_content(id).is_some()
    }

    /// Fetch when online, persist the result and return it; otherwise (or when
    /// the fetch fails) serve the stored copy. `fetch` is never called while
    /// the monitor reports offline.
    pub async fn get_content_with_fallback<T, F, Fut>(
        &self,
        id: &str,
        fetch: F,
        content_type: &str,
        options: CacheContentOptions,
    ) -> ContentResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if self.inner.monitor.is_offline() {
            debug!(id = %id, "Offline, serving stored content");
        } else {
            match fetch().await {
                Ok(data) => {
                    if let Err(e) = self.cache_content(id, content_type, &data, options) {
                        warn!(id = %id, kind = %ErrorKind::Storage, error = %e, "Failed to persist fetched content");
                    }
                    return ContentResult::fresh(data);
                }
                Err(e) => {
                    warn!(id = %id, kind = %ErrorKind::FetchFailure, error = %e, "Fetch failed, trying stored content");
                }
            }
        }

        let Some(record) = self.get_cached_content(id) else {
            return ContentResult::empty();
        };
        match serde_json::from_value(record.data) {
            Ok(data) => ContentResult::cached(data),
            Err(e) => {
                warn!(id = %id, error = %e, "Stored content no longer decodes");
                ContentResult::empty()
            }
        }
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn clear_expired(&self) -> Result<usize, StoreError> {
        let removed = self.inner.records.remove_expired(self.inner.clock.now())?;
        if removed > 0 {
            info!(removed, "Cleared expired offline content");
        }
        Ok(removed)
    }

    pub fn clear_all(&self) -> Result<usize, StoreError> {
        let removed = self.inner.records.clear()?;
        info!(removed, "Cleared offline content");
        Ok(removed)
    }

    /// Unexpired records of one content type.
    pub fn list_by_type(&self, content_type: &str) -> Vec<CachedContentRecord> {
        let now = self.inner.clock.now();
        match self.inner.records.list() {
            Ok(records) => records
                .into_iter()
                .filter(|record| record.content_type == content_type && !record.is_expired(now))
                .collect(),
            Err(e) => {
                warn!(content_type = %content_type, error = %e, "Offline listing failed");
                Vec::new()
            }
        }
    }

    pub fn stats(&self) -> OfflineStats {
        let now = self.inner.clock.now();
        let records = match self.inner.records.list() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Offline stats unavailable");
                return OfflineStats::default();
            }
        };
        let mut stats = OfflineStats {
            records: records.len(),
            ..OfflineStats::default()
        };
        for record in &records {
            if record.is_expired(now) {
                stats.expired += 1;
            }
            stats.total_bytes += record.data_size();
            *stats.by_type.entry(record.content_type.clone()).or_default() += 1;
        }
        stats
    }

    /// Fetch and persist `items` in order, one at a time.
    ///
    /// Cancelling `cancel` stops the batch: an in-flight fetch is abandoned,
    /// items already persisted stay persisted and are listed in the outcome.
    /// Individual fetch failures are recorded and the batch moves on.
    pub async fn download_batch<F, Fut>(
        &self,
        items: Vec<BatchItem>,
        fetch: F,
        options: CacheContentOptions,
        cancel: CancellationToken,
    ) -> BatchOutcome
    where
        F: Fn(&BatchItem) -> Fut,
        Fut: Future<Output = Result<Value, FetchError>>,
    {
        let mut outcome = BatchOutcome::default();
        let mut pending = items.into_iter();

        while let Some(item) = pending.next() {
            if cancel.is_cancelled() {
                outcome.remaining.push(item.id);
                break;
            }
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = fetch(&item) => Some(result),
            };
            match result {
                None => {
                    outcome.remaining.push(item.id);
                    break;
                }
                Some(Ok(data)) => {
                    let record = self.build_record(&item.id, &item.content_type, data, options.clone());
                    match self.inner.records.put(&record) {
                        Ok(()) => outcome.completed.push(item.id),
                        Err(e) => outcome.failed.push((item.id, e.into())),
                    }
                }
                Some(Err(e)) => {
                    warn!(id = %item.id, kind = %ErrorKind::FetchFailure, error = %e, "Batch item failed");
                    outcome.failed.push((item.id, e.into()));
                }
            }
        }

        outcome.remaining.extend(pending.map(|item| item.id));
        outcome.cancelled = !outcome.remaining.is_empty();
        if outcome.cancelled {
            warn!(
                kind = %ErrorKind::UploadCancelled,
                completed = outcome.completed.len(),
                remaining = outcome.remaining.len(),
                "Batch download cancelled"
            );
        } else {
            info!(
                completed = outcome.completed.len(),
                failed = outcome.failed.len(),
                "Batch download finished"
            );
        }
        outcome
    }

    /// Clear expired records now and then every `sweep_interval`.
    pub fn start(&self) -> Result<usize, StoreError> {
        let removed = self.clear_expired()?;
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule_repeating(
            TimerKey::singleton(SWEEP_TIMER),
            self.inner.config.sweep_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let store = OfflineContentStore { inner };
                        if let Err(e) = store.clear_expired() {
                            warn!(kind = %ErrorKind::Storage, error = %e, "Offline sweep failed");
                        }
                    }
                }
            },
        );
        Ok(removed)
    }

    pub fn stop(&self) -> bool {
        self.inner
            .scheduler
            .cancel(&TimerKey::singleton(SWEEP_TIMER))
    }
}
