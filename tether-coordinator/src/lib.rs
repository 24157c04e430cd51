//! TETHER Coordinator - picks a freshness strategy per data type.
//!
//! The [`CacheCoordinator`] sits between data consumers and the
//! [`VersionedCache`](tether_storage::VersionedCache): it resolves reads by
//! strategy, fans invalidations out to live queries, and uses observed
//! navigation to warm the cache before the user gets there.

pub mod coordinator;
pub mod navigation;
pub mod prefetch;
pub mod query_store;
pub mod strategy;

pub use coordinator::{
    CacheCoordinator, CoordinatorConfig, CoordinatorStats, InvalidateOptions, InvalidationOutcome,
    USER_SCOPED_PREFIXES,
};
pub use navigation::{NavigationEdge, NavigationGraph};
pub use prefetch::{
    PrefetchRequest, Prefetcher, SkipReason, SkippedTarget, WarmingPlan, WarmingReport,
    WarmingTarget,
};
pub use query_store::{QueryInfo, QueryStore, QuerySubscription};
pub use strategy::{CacheStrategy, StrategyConfig};
