//! In-memory cache with TTL expiry, schema versions, LRU eviction and bulk
//! invalidation.
//!
//! Entries live in a key map; recency lives in a separate ordered index
//! (`access_seq -> key`). Every hit or write moves the key to a fresh,
//! strictly increasing sequence number, so the first entry of the index is
//! always the least recently used one.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tether_core::{CacheError, ErrorKind, Scheduler, SharedClock, TimerKey, Timestamp};
use tracing::{debug, info, warn};

use super::config::{CacheConfig, SetOptions};
use super::entry::CacheEntry;
use super::invalidation::{InvalidationEvent, InvalidationScope};
use super::stats::CacheStats;

const SWEEP_TIMER: &str = "cache-sweep";

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    lru: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn touch(&mut self, key: &str, now: Timestamp) -> Option<&CacheEntry> {
        let seq = self.next_seq();
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.access_seq);
        entry.access_seq = seq;
        entry.access_count += 1;
        entry.last_accessed_at = now;
        self.lru.insert(seq, key.to_string());
        Some(entry)
    }

    fn insert(&mut self, key: String, mut entry: CacheEntry) {
        let seq = self.next_seq();
        entry.access_seq = seq;
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            self.lru.remove(&previous.access_seq);
        }
        self.lru.insert(seq, key);
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.access_seq);
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.lru.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }

    /// Remove every entry matching `predicate` in one pass. Returns the count.
    fn purge_where<F>(&mut self, mut predicate: F) -> usize
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, entry)| predicate(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.lru.clear();
        count
    }
}

enum Lookup {
    /// The stored value and the access sequence it was read under.
    Hit(Value, u64),
    Miss,
}

/// Versioned TTL/LRU cache of JSON-serializable values.
///
/// All operations are synchronous and complete before returning; share it
/// behind an `Arc`.
#[derive(Debug)]
pub struct VersionedCache {
    config: CacheConfig,
    clock: SharedClock,
    state: Mutex<CacheState>,
}

impl VersionedCache {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read `key` as `T`.
    ///
    /// Absent, expired and version-mismatched entries are misses, and stale
    /// ones are purged on the way out. `expected_version` defaults to the
    /// cache's current schema version. A payload that no longer decodes as
    /// `T` is purged and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str, expected_version: Option<&str>) -> Option<T> {
        let (value, seq) = match self.lookup(key, expected_version, true) {
            Lookup::Hit(value, seq) => (value, seq),
            Lookup::Miss => return None,
        };
        match serde_json::from_value(value) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value no longer decodes, purging");
                self.purge_undecodable(key, seq);
                None
            }
        }
    }

    /// Drop an entry that failed to decode, unless it was rewritten since it
    /// was read under access sequence `seq`. Returns whether it was removed.
    fn purge_undecodable(&self, key: &str, seq: u64) -> bool {
        let mut state = self.lock();
        state.hits = state.hits.saturating_sub(1);
        state.misses += 1;
        let unchanged = state
            .entries
            .get(key)
            .is_some_and(|entry| entry.access_seq == seq);
        if unchanged {
            state.remove(key);
        }
        unchanged
    }

    /// Raw JSON read with the same miss semantics as [`get`](Self::get).
    pub fn get_value(&self, key: &str, expected_version: Option<&str>) -> Option<Value> {
        match self.lookup(key, expected_version, true) {
            Lookup::Hit(value, _) => Some(value),
            Lookup::Miss => None,
        }
    }

    /// Whether a usable entry exists. Purges stale entries but does not count
    /// as an access.
    pub fn has(&self, key: &str, expected_version: Option<&str>) -> bool {
        matches!(self.lookup(key, expected_version, false), Lookup::Hit(..))
    }

    fn lookup(&self, key: &str, expected_version: Option<&str>, record: bool) -> Lookup {
        let now = self.clock.now();
        let expected = expected_version.unwrap_or(&self.config.schema_version);
        let mut state = self.lock();

        let verdict = match state.entries.get(key) {
            None => Some("absent"),
            Some(entry) if entry.is_expired(now) => Some("expired"),
            Some(entry) if entry.schema_version != expected => {
                debug!(
                    key = %key,
                    kind = %ErrorKind::CacheVersionMismatch,
                    stored = %entry.schema_version,
                    expected = %expected,
                    "Cache version mismatch"
                );
                Some("version_mismatch")
            }
            Some(_) => None,
        };

        match verdict {
            Some(reason) => {
                if reason != "absent" {
                    state.remove(key);
                    if reason == "expired" {
                        state.expirations += 1;
                    }
                }
                if record {
                    state.misses += 1;
                }
                Lookup::Miss
            }
            None if record => {
                state.hits += 1;
                match state.touch(key, now) {
                    Some(entry) => Lookup::Hit(entry.data.clone(), entry.access_seq),
                    None => Lookup::Miss,
                }
            }
            None => match state.entries.get(key) {
                Some(entry) => Lookup::Hit(entry.data.clone(), entry.access_seq),
                None => Lookup::Miss,
            },
        }
    }

    /// Store `data` under `key`. `ttl` and `version` default to the cache's.
    pub fn set<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        ttl: Option<Duration>,
        version: Option<&str>,
    ) -> Result<(), CacheError> {
        let mut options = SetOptions::new();
        options.ttl = ttl;
        options.version = version.map(str::to_string);
        self.set_with(key, data, options)
    }

    /// Store `data` under `key` with explicit options.
    ///
    /// Inserting a new key into a full cache first evicts the least recently
    /// used entry.
    pub fn set_with<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        options: SetOptions,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(data).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.insert_value(key, value, options)
    }

    /// Store an already-serialized value.
    pub fn set_value(&self, key: &str, value: Value, options: SetOptions) -> Result<(), CacheError> {
        self.insert_value(key, value, options)
    }

    fn insert_value(&self, key: &str, value: Value, options: SetOptions) -> Result<(), CacheError> {
        let size_bytes = serde_json::to_vec(&value)
            .map(|bytes| bytes.len())
            .map_err(|e| CacheError::Serialization {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        let now = self.clock.now();
        let entry = CacheEntry {
            data: value,
            stored_at: now,
            ttl: options.ttl.unwrap_or(self.config.default_ttl),
            schema_version: options
                .version
                .unwrap_or_else(|| self.config.schema_version.clone()),
            access_count: 0,
            last_accessed_at: now,
            tags: options.tags,
            size_bytes,
            access_seq: 0,
        };

        let capacity = self.config.max_size.max(1);
        let mut state = self.lock();
        if !state.entries.contains_key(key) {
            while state.entries.len() >= capacity {
                match state.evict_lru() {
                    Some(evicted) => debug!(key = %evicted, "Evicted least recently used entry"),
                    None => break,
                }
            }
        }
        state.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) -> usize {
        self.lock().clear()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held, expired or not, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of an entry without touching it.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Keys in eviction order, least recently used first.
    pub fn lru_order(&self) -> Vec<String> {
        self.lock().lru.values().cloned().collect()
    }

    /// Purge the slice of the cache `event` covers. The purge is complete
    /// when this returns.
    pub fn invalidate(&self, event: InvalidationEvent) -> usize {
        let removed = self.invalidate_scope(event.scope());
        info!(event = %event, removed, "Cache invalidated");
        removed
    }

    /// Purge every key in `scope` in a single pass under one lock.
    pub fn invalidate_scope(&self, scope: InvalidationScope) -> usize {
        let mut state = self.lock();
        match scope {
            InvalidationScope::Everything => state.clear(),
            InvalidationScope::Nothing => 0,
            InvalidationScope::Prefixes(_) => state.purge_where(|key, _| scope.matches(key)),
        }
    }

    /// Purge every key matching the regular expression `pattern`.
    pub fn invalidate_pattern(&self, pattern: &str) -> Result<usize, CacheError> {
        let regex = Regex::new(pattern).map_err(|e| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.invalidate_matching(&regex))
    }

    pub fn invalidate_matching(&self, regex: &Regex) -> usize {
        let removed = self.lock().purge_where(|key, _| regex.is_match(key));
        debug!(pattern = %regex, removed, "Invalidated by pattern");
        removed
    }

    /// Purge every entry written with `tag`.
    pub fn invalidate_tag(&self, tag: &str) -> usize {
        let removed = self.lock().purge_where(|_, entry| entry.has_tag(tag));
        debug!(tag = %tag, removed, "Invalidated by tag");
        removed
    }

    /// Remove every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let removed = state.purge_where(|_, entry| entry.is_expired(now));
        state.expirations += removed as u64;
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `sweep_interval`.
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &Scheduler) {
        let weak = Arc::downgrade(self);
        scheduler.schedule_repeating(
            TimerKey::singleton(SWEEP_TIMER),
            self.config.sweep_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(cache) = weak.upgrade() {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Cache sweep");
                        }
                    }
                }
            },
        );
    }

    pub fn stop_sweeper(&self, scheduler: &Scheduler) -> bool {
        scheduler.cancel(&TimerKey::singleton(SWEEP_TIMER))
    }

    pub fn get_stats(&self) -> CacheStats {
        let state = self.lock();
        let memory_bytes: usize = state
            .entries
            .iter()
            .map(|(key, entry)| entry.footprint(key))
            .sum();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            entry_count: state.entries.len() as u64,
            memory_bytes: memory_bytes as u64,
            oldest_entry: state.entries.values().map(|entry| entry.stored_at).min(),
            newest_entry: state.entries.values().map(|entry| entry.stored_at).max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tether_core::{Clock, ManualClock};

    fn cache_with(config: CacheConfig) -> (Arc<ManualClock>, VersionedCache) {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = clock.clone();
        (clock, VersionedCache::new(config, shared))
    }

    fn cache() -> (Arc<ManualClock>, VersionedCache) {
        cache_with(CacheConfig::default())
    }

    #[test]
    fn test_set_then_get() {
        let (_, cache) = cache();
        cache.set("lessons:1", &vec![1, 2, 3], None, None).unwrap();
        assert_eq!(cache.get::<Vec<i32>>("lessons:1", None), Some(vec![1, 2, 3]));
        assert_eq!(cache.get::<Vec<i32>>("lessons:2", None), None);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_purged() {
        let (clock, cache) = cache();
        cache
            .set("k", &"v", Some(Duration::from_secs(10)), None)
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get::<String>("k", None).as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<String>("k", None), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get_stats().expirations, 1);
    }

    #[test]
    fn test_version_mismatch_is_a_miss_and_purged() {
        let (_, cache) = cache();
        cache.set("k", &1, None, Some("A")).unwrap();
        assert_eq!(cache.get::<i32>("k", Some("B")), None);
        assert!(!cache.has("k", Some("A")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_default_version_is_schema_version() {
        let (_, cache) = cache_with(CacheConfig::default().with_schema_version("7"));
        cache.set("k", &1, None, None).unwrap();
        assert_eq!(cache.entry("k").unwrap().schema_version, "7");
        assert_eq!(cache.get::<i32>("k", Some("7")), Some(1));
        assert_eq!(cache.get::<i32>("k", None), Some(1));
    }

    #[test]
    fn test_undecodable_value_is_a_miss() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Lesson {
            title: String,
        }
        let (_, cache) = cache();
        cache.set("lessons:1", &42, None, None).unwrap();
        assert!(cache.get::<Lesson>("lessons:1", None).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.get_stats().hits, 0);
    }

    #[test]
    fn test_undecodable_purge_spares_a_newer_write() {
        let (_, cache) = cache();
        cache.set("lessons:1", &42, None, None).unwrap();
        let stale_seq = cache.lock().entries["lessons:1"].access_seq;

        // Rewritten between the failed decode and the purge.
        cache.set("lessons:1", &"fresh", None, None).unwrap();
        assert!(!cache.purge_undecodable("lessons:1", stale_seq));
        assert_eq!(cache.get::<String>("lessons:1", None).as_deref(), Some("fresh"));

        let current_seq = cache.lock().entries["lessons:1"].access_seq;
        assert!(cache.purge_undecodable("lessons:1", current_seq));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_scope_purges_in_one_pass() {
        let (_, cache) = cache();
        for key in ["user:1", "profile:1", "courses:1"] {
            cache.set(key, &1, None, None).unwrap();
        }
        let removed = cache.invalidate_scope(InvalidationScope::Prefixes(&["user:", "profile:"]));
        assert_eq!(removed, 2);
        assert_eq!(cache.keys(), vec!["courses:1"]);
        assert_eq!(cache.invalidate_scope(InvalidationScope::Nothing), 0);
        assert_eq!(cache.invalidate_scope(InvalidationScope::Everything), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_has_does_not_touch_lru() {
        let (_, cache) = cache();
        cache.set("a", &1, None, None).unwrap();
        cache.set("b", &2, None, None).unwrap();
        assert!(cache.has("a", None));
        assert_eq!(cache.lru_order(), vec!["a", "b"]);
        assert_eq!(cache.get_stats().hits, 0);
    }

    #[test]
    fn test_lru_eviction_removes_least_recently_used() {
        let (_, cache) = cache_with(CacheConfig::default().with_max_size(3));
        cache.set("a", &1, None, None).unwrap();
        cache.set("b", &2, None, None).unwrap();
        cache.set("c", &3, None, None).unwrap();

        assert_eq!(cache.get::<i32>("a", None), Some(1));
        cache.set("d", &4, None, None).unwrap();

        assert_eq!(cache.keys(), vec!["a", "c", "d"]);
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let (_, cache) = cache_with(CacheConfig::default().with_max_size(2));
        cache.set("a", &1, None, None).unwrap();
        cache.set("b", &2, None, None).unwrap();
        cache.set("a", &10, None, None).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get::<i32>("a", None), Some(10));
        assert_eq!(cache.lru_order(), vec!["b", "a"]);
    }

    #[test]
    fn test_hit_bumps_access_metadata() {
        let (clock, cache) = cache();
        cache.set("k", &1, None, None).unwrap();
        clock.advance(Duration::from_secs(3));
        cache.get::<i32>("k", None);
        cache.get::<i32>("k", None);

        let entry = cache.entry("k").unwrap();
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed_at, clock.now());
        assert!(entry.last_accessed_at > entry.stored_at);
    }

    #[test]
    fn test_invalidate_profile_update_scope() {
        let (_, cache) = cache();
        for key in ["profile:1", "user:1", "user:1:prefs", "sessions:42", "lessons:1"] {
            cache.set(key, &key, None, None).unwrap();
        }
        assert_eq!(cache.invalidate(InvalidationEvent::ProfileUpdate), 3);
        assert_eq!(cache.keys(), vec!["lessons:1", "sessions:42"]);
    }

    #[test]
    fn test_invalidate_logout_clears_everything() {
        let (_, cache) = cache();
        cache.set("a", &1, None, None).unwrap();
        cache.set("sessions:1", &1, None, None).unwrap();
        assert_eq!(cache.invalidate(InvalidationEvent::Logout), 2);
        assert!(cache.is_empty());
        assert!(cache.lru_order().is_empty());
    }

    #[test]
    fn test_invalidate_token_refresh_is_noop() {
        let (_, cache) = cache();
        cache.set("profile:1", &1, None, None).unwrap();
        assert_eq!(cache.invalidate(InvalidationEvent::TokenRefresh), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_pattern_and_tag() {
        let (_, cache) = cache();
        cache
            .set_with("courses:1", &1, SetOptions::new().tag("catalog"))
            .unwrap();
        cache
            .set_with("courses:2", &2, SetOptions::new().tag("catalog"))
            .unwrap();
        cache.set("lessons:1", &3, None, None).unwrap();
        cache.set("lessons:2", &4, None, None).unwrap();

        assert_eq!(cache.invalidate_pattern(r"^lessons:\d+$").unwrap(), 2);
        assert_eq!(cache.invalidate_tag("catalog"), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let (_, cache) = cache();
        let err = cache.invalidate_pattern("([unclosed").unwrap_err();
        assert!(matches!(err, CacheError::InvalidPattern { .. }));
    }

    #[test]
    fn test_purge_expired() {
        let (clock, cache) = cache();
        cache.set("short", &1, Some(Duration::from_secs(1)), None).unwrap();
        cache.set("long", &1, Some(Duration::from_secs(60)), None).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.keys(), vec!["long"]);
    }

    #[test]
    fn test_stats_memory_and_timestamps() {
        let (clock, cache) = cache();
        cache.set("ab", &"xyz", None, None).unwrap();
        let first = clock.now();
        clock.advance(Duration::from_secs(5));
        cache.set("c", &1, None, None).unwrap();

        let stats = cache.get_stats();
        // "xyz" serializes to 5 bytes, 1 to 1 byte.
        assert_eq!(stats.memory_bytes, (2 + 5 + 96 + 1 + 1 + 96) as u64);
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.oldest_entry, Some(first));
        assert_eq!(stats.newest_entry, Some(clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_on_interval() {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = clock.clone();
        let cache = Arc::new(VersionedCache::new(
            CacheConfig::default().with_sweep_interval(Duration::from_secs(60)),
            shared,
        ));
        let scheduler = Scheduler::new();
        cache.start_sweeper(&scheduler);

        cache.set("k", &1, Some(Duration::from_secs(1)), None).unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 0);
        assert!(cache.stop_sweeper(&scheduler));
    }
}
