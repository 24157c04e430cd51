//! TETHER Offline - durable content for when the network is gone.
//!
//! [`NetworkMonitor`] decides whether the app is offline from two signals;
//! [`OfflineContentStore`] persists content in LMDB and serves it back when
//! fetching is impossible.

pub mod monitor;
pub mod probe;
pub mod store;

pub use monitor::{MonitorConfig, NetworkMonitor, NetworkStatus, ProbeOutcome};
pub use probe::{HealthProbe, HttpHealthProbe};
pub use store::{
    BatchItem, BatchOutcome, CacheContentOptions, ContentResult, OfflineConfig,
    OfflineContentStore, OfflineStats,
};
