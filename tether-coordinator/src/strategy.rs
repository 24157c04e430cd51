//! Freshness strategies.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a read for a data type balances cache and network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Serve from cache while fresh, fetch on miss.
    CacheFirst,
    /// Always fetch; fall back to cache when the fetch fails.
    NetworkFirst,
    /// Serve from cache and refresh in the background.
    StaleWhileRevalidate,
    /// Always fetch; never touch the cache.
    NetworkOnly,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkOnly => "network-only",
        }
    }

    pub fn uses_cache(&self) -> bool {
        !matches!(self, Self::NetworkOnly)
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cache-first" => Ok(Self::CacheFirst),
            "network-first" => Ok(Self::NetworkFirst),
            "stale-while-revalidate" => Ok(Self::StaleWhileRevalidate),
            "network-only" => Ok(Self::NetworkOnly),
            other => Err(format!("unknown cache strategy: {}", other)),
        }
    }
}

/// Strategy for one data type. One active config per data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyConfig {
    pub data_type: String,
    pub strategy: CacheStrategy,
    pub ttl: Duration,
    /// Attached to every cache entry written for this data type.
    pub tags: BTreeSet<String>,
}

impl StrategyConfig {
    pub fn new(data_type: impl Into<String>, strategy: CacheStrategy, ttl: Duration) -> Self {
        Self {
            data_type: data_type.into(),
            strategy,
            ttl,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}
