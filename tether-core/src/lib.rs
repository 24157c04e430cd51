//! TETHER Core - shared foundations for the resilient delivery layer.
//!
//! Everything here is dependency-light and used by every other crate:
//! the error taxonomy, configuration, the wall clock and the keyed timer
//! scheduler.

pub mod clock;
pub mod config;
pub mod error;
pub mod scheduler;

pub use clock::{elapsed_between, system_clock, to_chrono, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    millis, CacheSettings, ConnectionConfig, CoordinatorSettings, EndpointConfig, LoggingConfig,
    NetworkSettings, OfflineSettings, PoolSettings, TetherConfig,
};
pub use error::{
    CacheError, ConfigError, ConnectionError, DeliveryError, DeliveryResult, ErrorKind,
    FetchError, ProbeError, StoreError,
};
pub use scheduler::{Scheduler, TimerKey};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
