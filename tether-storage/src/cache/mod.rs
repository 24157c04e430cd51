//! Versioned TTL/LRU cache.
//!
//! An entry is usable only while it is younger than its TTL and was written
//! under the schema version the reader expects. Anything else is an ordinary
//! miss: the cache never errors on reads, it just gets emptier.
//!
//! Bulk invalidation comes in three flavours:
//!
//! - [`InvalidationEvent`]: a fixed taxonomy of auth events, each mapped to a
//!   set of key prefixes (or to everything, or nothing)
//! - regular expressions over keys
//! - tags attached at write time through [`SetOptions`]

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod stats;
pub mod versioned;

pub use config::{CacheConfig, SetOptions};
pub use entry::{CacheEntry, ENTRY_OVERHEAD_BYTES};
pub use invalidation::{InvalidationEvent, InvalidationScope};
pub use stats::CacheStats;
pub use versioned::VersionedCache;
