//! Durable content records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::Timestamp;

/// One piece of content kept for offline use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedContentRecord {
    pub id: String,
    pub content_type: String,
    pub data: Value,
    pub cached_at: Timestamp,
    /// `None` means the record never expires.
    pub expires_at: Option<Timestamp>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl CachedContentRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Serialized payload size in bytes.
    pub fn data_size(&self) -> usize {
        serde_json::to_vec(&self.data)
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}
