//! Durable storage for offline content.

pub mod lmdb_store;
pub mod record;

pub use lmdb_store::RecordStore;
pub use record::CachedContentRecord;
