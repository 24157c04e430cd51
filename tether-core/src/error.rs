//! Error types for TETHER operations

use std::fmt;
use thiserror::Error;

/// Physical connection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection to {endpoint} is not ready (state: {state})")]
    NotReady { endpoint: String, state: String },

    #[error("Transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Reconnect to {endpoint} abandoned after {attempts} attempts")]
    ReconnectExhausted { endpoint: String, attempts: u32 },

    #[error("Heartbeat to {endpoint} failed: {reason}")]
    HeartbeatFailed { endpoint: String, reason: String },
}

/// Errors raised by caller-supplied fetch functions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch failed: {reason}")]
    Failed { reason: String },

    #[error("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Response could not be decoded: {reason}")]
    Decode { reason: String },
}

impl FetchError {
    /// Shorthand for a generic failure.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// In-memory cache errors. Only write paths produce these.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Failed to serialize value for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Invalid invalidation pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Failed to open store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Deserialization error for record {id}: {reason}")]
    Deserialization { id: String, reason: String },
}

/// Health probe errors. Never surfaced to readers; they only flip liveness.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Health endpoint {url} unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Health endpoint {url} returned status {status}")]
    Unhealthy { url: String, status: u16 },

    #[error("Probe cancelled")]
    Cancelled,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or TETHER_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all TETHER errors.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{operation} cancelled after {completed} completed item(s)")]
    Cancelled { operation: String, completed: usize },
}

/// Result type alias for TETHER operations.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Coarse error taxonomy, used as the `kind` field in structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionError,
    HeartbeatFailure,
    CacheVersionMismatch,
    FetchFailure,
    UploadCancelled,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionError => "connection_error",
            Self::HeartbeatFailure => "heartbeat_failure",
            Self::CacheVersionMismatch => "cache_version_mismatch",
            Self::FetchFailure => "fetch_failure",
            Self::UploadCancelled => "upload_cancelled",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HeartbeatFailed { .. } => ErrorKind::HeartbeatFailure,
            _ => ErrorKind::ConnectionError,
        }
    }
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(err) => err.kind(),
            Self::Fetch(_) => ErrorKind::FetchFailure,
            Self::Cache(_) | Self::Store(_) => ErrorKind::Storage,
            Self::Probe(_) => ErrorKind::HeartbeatFailure,
            Self::Config(_) => ErrorKind::Config,
            Self::Cancelled { .. } => ErrorKind::UploadCancelled,
        }
    }

    /// True when the error is a caller-initiated cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

// =============================================================================
// TESTS
// =============================================================================
