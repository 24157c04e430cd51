//! TETHER Storage - where delivered data is kept.
//!
//! [`cache`] is the in-memory versioned TTL/LRU cache that sits in front of
//! every network read. [`offline`] is the LMDB record store that keeps
//! content across restarts for use when the network is gone.

pub mod cache;
pub mod offline;

pub use cache::{
    CacheConfig, CacheEntry, CacheStats, InvalidationEvent, InvalidationScope, SetOptions,
    VersionedCache,
};
pub use offline::{CachedContentRecord, RecordStore};
