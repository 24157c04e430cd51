//! Registry of live query subscriptions.
//!
//! A view that renders cached data registers a refetch callback here. When
//! the coordinator invalidates data with `refetch_active` set, matching live
//! queries are told to refetch. Dropping the [`QuerySubscription`] guard
//! unregisters the query.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, error};

type RefetchFn = Arc<dyn Fn() + Send + Sync>;

/// What a live query is watching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryInfo {
    pub key: String,
    pub data_type: String,
    pub tags: BTreeSet<String>,
}

struct QueryEntry {
    info: QueryInfo,
    refetch: RefetchFn,
}

#[derive(Default)]
struct QueryStoreInner {
    next_id: AtomicU64,
    queries: RwLock<HashMap<u64, QueryEntry>>,
}

/// Shared registry. Clones refer to the same set of queries.
#[derive(Clone, Default)]
pub struct QueryStore {
    inner: Arc<QueryStoreInner>,
}

impl std::fmt::Debug for QueryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStore").field("live", &self.len()).finish()
    }
}

/// Keeps a query registered until dropped.
#[must_use = "the query is unregistered when the subscription is dropped"]
pub struct QuerySubscription {
    id: u64,
    store: Weak<QueryStoreInner>,
}

impl std::fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySubscription").field("id", &self.id).finish()
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            if let Ok(mut queries) = store.queries.write() {
                queries.remove(&self.id);
            }
        }
    }
}

impl QueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(
        &self,
        key: impl Into<String>,
        data_type: impl Into<String>,
        tags: BTreeSet<String>,
        refetch: F,
    ) -> QuerySubscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = QueryEntry {
            info: QueryInfo {
                key: key.into(),
                data_type: data_type.into(),
                tags,
            },
            refetch: Arc::new(refetch),
        };
        if let Ok(mut queries) = self.inner.queries.write() {
            queries.insert(id, entry);
        }
        QuerySubscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Ask every live query matching `predicate` to refetch. Callbacks run
    /// outside the registry lock, so they may subscribe or unsubscribe.
    pub fn refetch_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&QueryInfo) -> bool,
    {
        let targets: Vec<(String, RefetchFn)> = match self.inner.queries.read() {
            Ok(queries) => queries
                .values()
                .filter(|entry| predicate(&entry.info))
                .map(|entry| (entry.info.key.clone(), Arc::clone(&entry.refetch)))
                .collect(),
            Err(_) => return 0,
        };
        for (key, refetch) in &targets {
            if catch_unwind(AssertUnwindSafe(|| refetch())).is_err() {
                error!(key = %key, "Query refetch callback panicked");
            }
        }
        if !targets.is_empty() {
            debug!(refetched = targets.len(), "Refetched live queries");
        }
        targets.len()
    }

    pub fn snapshot(&self) -> Vec<QueryInfo> {
        self.inner
            .queries
            .read()
            .map(|queries| queries.values().map(|entry| entry.info.clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner
            .queries
            .read()
            .map(|queries| queries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
