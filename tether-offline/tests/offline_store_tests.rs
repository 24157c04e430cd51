use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tether_core::{Clock, DeliveryError, FetchError, ManualClock, ProbeError, Scheduler};
use tether_offline::{
    BatchItem, CacheContentOptions, MonitorConfig, NetworkMonitor, OfflineConfig,
    OfflineContentStore, ProbeOutcome,
};
use tether_test_utils::fixtures::manual_clock;
use tether_test_utils::{CountingFetcher, StaticProbe};
use tokio_util::sync::CancellationToken;

struct Harness {
    store: OfflineContentStore,
    monitor: NetworkMonitor,
    probe: StaticProbe,
    clock: Arc<ManualClock>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = manual_clock();
    let probe = StaticProbe::healthy();
    let scheduler = Scheduler::new();
    let monitor = NetworkMonitor::new(
        MonitorConfig::new("http://localhost:3000/api/health")
            .with_probe_timeout(Duration::from_secs(1)),
        probe.shared(),
        scheduler.clone(),
    );
    let config = OfflineConfig::new(dir.path().join("offline"))
        .with_map_size_mb(8)
        .with_default_ttl(Duration::from_secs(3_600));
    let store =
        OfflineContentStore::open(config, monitor.clone(), clock.clone(), scheduler).unwrap();
    Harness {
        store,
        monitor,
        probe,
        clock,
        _dir: dir,
    }
}

async fn fallback(
    store: &OfflineContentStore,
    id: &str,
    fetcher: &CountingFetcher,
) -> (Option<Value>, bool) {
    let result = store
        .get_content_with_fallback(id, || fetcher.fetch(), "lesson", CacheContentOptions::new())
        .await;
    (result.data, result.from_cache)
}

// ============================================================================
// STORE
// ============================================================================

#[test]
fn test_cached_content_round_trips_with_metadata() {
    let h = harness();
    let options = CacheContentOptions::new().metadata("source", "download");
    let record = h
        .store
        .cache_content("lesson-1", "lesson", &json!({ "title": "Ownership" }), options)
        .unwrap();
    assert_eq!(record.cached_at, h.clock.now());

    let stored = h.store.get_cached_content("lesson-1").unwrap();
    assert_eq!(stored.data, json!({ "title": "Ownership" }));
    assert_eq!(stored.metadata.get("source"), Some(&json!("download")));
    assert!(h.store.is_cached("lesson-1"));
    assert!(!h.store.is_cached("lesson-2"));
}

#[test]
fn test_expired_content_is_removed_on_read() {
    let h = harness();
    h.store
        .cache_content(
            "lesson-1",
            "lesson",
            &json!(1),
            CacheContentOptions::new().ttl(Duration::from_secs(60)),
        )
        .unwrap();
    h.store
        .cache_content("pinned", "lesson", &json!(2), CacheContentOptions::new().never_expire())
        .unwrap();

    h.clock.advance(Duration::from_secs(61));
    assert!(h.store.get_cached_content("lesson-1").is_none());
    assert_eq!(h.store.stats().records, 1);

    h.clock.advance(Duration::from_secs(365 * 24 * 3_600));
    assert!(h.store.is_cached("pinned"));
}

#[test]
fn test_clear_expired_list_and_stats() {
    let h = harness();
    let short = CacheContentOptions::new().ttl(Duration::from_secs(10));
    h.store.cache_content("a", "lesson", &json!("a"), short.clone()).unwrap();
    h.store.cache_content("b", "lesson", &json!("b"), CacheContentOptions::new()).unwrap();
    h.store.cache_content("c", "video", &json!("c"), CacheContentOptions::new()).unwrap();

    h.clock.advance(Duration::from_secs(11));
    let stats = h.store.stats();
    assert_eq!(stats.records, 3);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.by_type.get("lesson"), Some(&2));
    assert!(stats.total_bytes > 0);

    let lessons: Vec<String> = h
        .store
        .list_by_type("lesson")
        .into_iter()
        .map(|record| record.id)
        .collect();
    assert_eq!(lessons, vec!["b"]);

    assert_eq!(h.store.clear_expired().unwrap(), 1);
    assert_eq!(h.store.stats().records, 2);
    assert_eq!(h.store.clear_all().unwrap(), 2);
    assert_eq!(h.store.stats().records, 0);
}

// ============================================================================
// NETWORK-AWARE READS
// ============================================================================

#[tokio::test]
async fn test_online_fetch_is_persisted() {
    let h = harness();
    let fetcher = CountingFetcher::returning(json!({ "v": 1 }));

    let (data, from_cache) = fallback(&h.store, "lesson-1", &fetcher).await;
    assert_eq!(data, Some(json!({ "v": 1 })));
    assert!(!from_cache);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(h.store.get_cached_content("lesson-1").unwrap().data, json!({ "v": 1 }));
}

#[tokio::test]
async fn test_fetch_failure_serves_stored_copy() {
    let h = harness();
    h.store
        .cache_content("lesson-1", "lesson", &json!("stored"), CacheContentOptions::new())
        .unwrap();
    let fetcher = CountingFetcher::failing("502");

    let (data, from_cache) = fallback(&h.store, "lesson-1", &fetcher).await;
    assert_eq!(data, Some(json!("stored")));
    assert!(from_cache);

    let (data, from_cache) = fallback(&h.store, "lesson-2", &fetcher).await;
    assert_eq!(data, None);
    assert!(!from_cache);
}

#[tokio::test]
async fn test_offline_never_calls_fetch() {
    let h = harness();
    h.store
        .cache_content("lesson-1", "lesson", &json!("stored"), CacheContentOptions::new())
        .unwrap();
    h.monitor.set_os_online(false);
    let fetcher = CountingFetcher::returning(json!("fresh"));

    let (data, from_cache) = fallback(&h.store, "lesson-1", &fetcher).await;
    assert_eq!(data, Some(json!("stored")));
    assert!(from_cache);

    let (data, _) = fallback(&h.store, "lesson-2", &fetcher).await;
    assert_eq!(data, None);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_failed_probe_means_offline_even_when_os_is_online() {
    let h = harness();
    h.probe.set_healthy(false);
    let mut changes = h.monitor.subscribe();

    let outcome = h.monitor.probe_now().await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Unhealthy(ProbeError::Unhealthy { status: 503, .. })
    ));
    assert!(changes.has_changed().unwrap());
    assert!(changes.borrow_and_update().heartbeat_failed);
    assert!(h.monitor.status().os_online);
    assert!(h.monitor.is_offline());

    let fetcher = CountingFetcher::returning(json!("fresh"));
    fallback(&h.store, "lesson-1", &fetcher).await;
    assert_eq!(fetcher.calls(), 0);

    h.probe.set_healthy(true);
    assert_eq!(h.monitor.probe_now().await, ProbeOutcome::Healthy);
    assert!(!h.monitor.is_offline());
}

#[tokio::test(start_paused = true)]
async fn test_newer_probe_supersedes_older() {
    let h = harness();
    h.probe.push_response(Duration::from_millis(500), false);
    h.probe.push_response(Duration::from_millis(10), true);

    let monitor = h.monitor.clone();
    let slow = tokio::spawn(async move { monitor.probe_now().await });
    tokio::time::sleep(Duration::from_millis(1)).await;

    assert_eq!(h.monitor.probe_now().await, ProbeOutcome::Healthy);
    assert_eq!(slow.await.unwrap(), ProbeOutcome::Superseded);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!h.monitor.status().heartbeat_failed);
    assert_eq!(h.probe.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_probe_times_out_as_unreachable() {
    let h = harness();
    h.probe.push_response(Duration::from_secs(5), true);

    let outcome = h.monitor.probe_now().await;
    assert!(matches!(
        outcome,
        ProbeOutcome::Unhealthy(ProbeError::Unreachable { .. })
    ));
    assert!(h.monitor.is_offline());
}

#[tokio::test(start_paused = true)]
async fn test_started_monitor_probes_immediately_and_periodically() {
    let h = harness();
    h.monitor.start();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.probe.calls(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.probe.calls(), 3);

    h.monitor.stop();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.probe.calls(), 3);
}

// ============================================================================
// BATCH DOWNLOADS
// ============================================================================

fn slow_fetch(item: &BatchItem) -> impl std::future::Future<Output = Result<Value, FetchError>> {
    let id = item.id.clone();
    async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({ "id": id }))
    }
}

fn items(ids: &[&str]) -> Vec<BatchItem> {
    ids.iter().map(|id| BatchItem::new(*id, "lesson")).collect()
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_batch_keeps_committed_items() {
    let h = harness();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        trigger.cancel();
    });

    let outcome = h
        .store
        .download_batch(items(&["a", "b", "c", "d"]), slow_fetch, CacheContentOptions::new(), cancel)
        .await;

    assert!(outcome.cancelled);
    assert_eq!(outcome.completed, vec!["a", "b"]);
    assert_eq!(outcome.remaining, vec!["c", "d"]);
    assert!(h.store.is_cached("a"));
    assert!(h.store.is_cached("b"));
    assert!(!h.store.is_cached("c"));

    let err = outcome.error().unwrap();
    assert!(matches!(err, DeliveryError::Cancelled { completed: 2, .. }));
}

#[tokio::test]
async fn test_batch_records_failures_and_continues() {
    let h = harness();
    let fetch = |item: &BatchItem| {
        let id = item.id.clone();
        async move {
            if id == "b" {
                Err(FetchError::failed("404"))
            } else {
                Ok(json!(id))
            }
        }
    };

    let outcome = h
        .store
        .download_batch(
            items(&["a", "b", "c"]),
            fetch,
            CacheContentOptions::new(),
            CancellationToken::new(),
        )
        .await;

    assert!(!outcome.cancelled);
    assert!(outcome.error().is_none());
    assert!(!outcome.is_complete());
    assert_eq!(outcome.completed, vec!["a", "c"]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, "b");
}

#[tokio::test]
async fn test_batch_with_cancelled_token_does_nothing() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = h
        .store
        .download_batch(items(&["a", "b"]), slow_fetch, CacheContentOptions::new(), cancel)
        .await;

    assert!(outcome.cancelled);
    assert!(outcome.completed.is_empty());
    assert_eq!(outcome.remaining, vec!["a", "b"]);
    assert_eq!(h.store.stats().records, 0);
}

#[tokio::test(start_paused = true)]
async fn test_started_store_sweeps_expired_records() {
    let h = harness();
    h.store
        .cache_content(
            "short",
            "lesson",
            &json!(1),
            CacheContentOptions::new().ttl(Duration::from_secs(30)),
        )
        .unwrap();
    assert_eq!(h.store.start().unwrap(), 0);

    h.clock.advance(Duration::from_secs(31));
    tokio::time::sleep(Duration::from_secs(3_601)).await;
    assert_eq!(h.store.stats().records, 0);
    assert!(h.store.stop());
}
