//! Cache entries.

use std::collections::BTreeSet;
use std::time::Duration;

use serde_json::Value;
use tether_core::{elapsed_between, Timestamp};

/// Fixed per-entry bookkeeping overhead counted in memory estimates.
pub const ENTRY_OVERHEAD_BYTES: usize = 96;

/// A cached value plus the metadata that decides whether it is still usable.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub data: Value,
    pub stored_at: Timestamp,
    pub ttl: Duration,
    pub schema_version: String,
    pub access_count: u64,
    pub last_accessed_at: Timestamp,
    pub tags: BTreeSet<String>,
    /// Serialized size of `data` in bytes.
    pub size_bytes: usize,
    /// Position in the LRU index. Larger is more recent.
    pub(crate) access_seq: u64,
}

impl CacheEntry {
    /// Expired once strictly more than `ttl` has passed since the write.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        elapsed_between(self.stored_at, now) > self.ttl
    }

    pub fn age(&self, now: Timestamp) -> Duration {
        elapsed_between(self.stored_at, now)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Approximate memory held by this entry under `key`.
    pub fn footprint(&self, key: &str) -> usize {
        key.len() + self.size_bytes + ENTRY_OVERHEAD_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(ttl: Duration) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            data: Value::from(1),
            stored_at: now,
            ttl,
            schema_version: "1".to_string(),
            access_count: 0,
            last_accessed_at: now,
            tags: BTreeSet::new(),
            size_bytes: 1,
            access_seq: 0,
        }
    }

    #[test]
    fn test_expiry_is_strict() {
        let entry = entry(Duration::from_secs(10));
        let at_ttl = entry.stored_at + chrono::Duration::seconds(10);
        let past_ttl = at_ttl + chrono::Duration::milliseconds(1);
        assert!(!entry.is_expired(at_ttl));
        assert!(entry.is_expired(past_ttl));
    }

    #[test]
    fn test_footprint_includes_key_and_overhead() {
        let entry = entry(Duration::from_secs(1));
        assert_eq!(entry.footprint("abc"), 3 + 1 + ENTRY_OVERHEAD_BYTES);
    }
}
