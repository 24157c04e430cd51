//! LMDB-backed record store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Records are stored as JSON
//! under their id in a single unnamed database, so they survive restarts of
//! the process.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get`, `list` and `len`
//! - Write transactions for `put`, `delete`, `remove_where` and `clear`

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tether_core::{StoreError, Timestamp};

use super::record::CachedContentRecord;

fn txn_error(e: heed::Error) -> StoreError {
    StoreError::Transaction {
        reason: e.to_string(),
    }
}

/// Durable store of [`CachedContentRecord`]s keyed by id.
pub struct RecordStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl RecordStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let open_error = |reason: String| StoreError::Open {
            path: path.display().to_string(),
            reason,
        };

        std::fs::create_dir_all(path).map_err(|e| open_error(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| open_error(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| open_error(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        tracing::debug!(path = %path.display(), "Opened record store");
        Ok(Self { env, db })
    }

    /// Insert or replace a record.
    pub fn put(&self, record: &CachedContentRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
            reason: e.to_string(),
        })?;
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        self.db
            .put(&mut wtxn, record.id.as_bytes(), &bytes)
            .map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    /// Insert or replace several records in one transaction.
    pub fn put_all(&self, records: &[CachedContentRecord]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        for record in records {
            let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Serialization {
                reason: e.to_string(),
            })?;
            self.db
                .put(&mut wtxn, record.id.as_bytes(), &bytes)
                .map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)
    }

    pub fn get(&self, id: &str) -> Result<Option<CachedContentRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        match self.db.get(&rtxn, id.as_bytes()).map_err(txn_error)? {
            Some(bytes) => decode(id, bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn contains(&self, id: &str) -> Result<bool, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        Ok(self.db.get(&rtxn, id.as_bytes()).map_err(txn_error)?.is_some())
    }

    /// Returns whether a record was removed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let removed = self.db.delete(&mut wtxn, id.as_bytes()).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(removed)
    }

    /// All records, in id order. Records that fail to decode are skipped.
    pub fn list(&self) -> Result<Vec<CachedContentRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let mut records = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_error)? {
            let (key, bytes) = item.map_err(txn_error)?;
            let id = String::from_utf8_lossy(key);
            match decode(&id, bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(id = %id, error = %e, "Skipping undecodable record"),
            }
        }
        Ok(records)
    }

    /// Remove every record matching `predicate` in one write transaction.
    /// Undecodable records are removed as well. Returns the count.
    pub fn remove_where<F>(&self, mut predicate: F) -> Result<usize, StoreError>
    where
        F: FnMut(&CachedContentRecord) -> bool,
    {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let doomed: Vec<Vec<u8>> = {
            let mut doomed = Vec::new();
            for item in self.db.iter(&wtxn).map_err(txn_error)? {
                let (key, bytes) = item.map_err(txn_error)?;
                let id = String::from_utf8_lossy(key);
                let remove = match decode(&id, bytes) {
                    Ok(record) => predicate(&record),
                    Err(_) => true,
                };
                if remove {
                    doomed.push(key.to_vec());
                }
            }
            doomed
        };
        for key in &doomed {
            self.db.delete(&mut wtxn, key).map_err(txn_error)?;
        }
        wtxn.commit().map_err(txn_error)?;
        Ok(doomed.len())
    }

    /// Remove records whose `expires_at` is before `now`.
    pub fn remove_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        self.remove_where(|record| record.is_expired(now))
    }

    /// Remove everything. Returns how many records were dropped.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let count = self.db.len(&wtxn).map_err(txn_error)?;
        self.db.clear(&mut wtxn).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(count as usize)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        Ok(self.db.len(&rtxn).map_err(txn_error)? as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn decode(id: &str, bytes: &[u8]) -> Result<CachedContentRecord, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization {
        id: id.to_string(),
        reason: e.to_string(),
    })
}
