//! Configuration loading for TETHER.
//!
//! Every section has defaults, so a config file only needs the endpoints.
//! Unknown keys are rejected.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub offline: OfflineSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub api_base_url: String,
    pub ws_endpoint: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

impl EndpointConfig {
    /// Absolute URL of the liveness probe target.
    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 1_000,
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSettings {
    pub cleanup_interval_ms: u64,
    pub max_idle_time_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 60_000,
            max_idle_time_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSettings {
    pub default_ttl_ms: u64,
    pub max_size: usize,
    pub schema_version: String,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_size: 1_000,
            schema_version: "1".to_string(),
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoordinatorSettings {
    pub prediction_limit: usize,
    pub pattern_max_age_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            prediction_limit: 3,
            pattern_max_age_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OfflineSettings {
    pub store_path: PathBuf,
    pub map_size_mb: usize,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("tether-offline"),
            map_size_mb: 64,
            default_ttl_ms: 24 * 60 * 60 * 1_000,
            sweep_interval_ms: 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkSettings {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            probe_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Milliseconds to `Duration`, the unit every config field uses.
pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl TetherConfig {
    /// Build a config with default sections for the given endpoints.
    pub fn with_endpoints(api_base_url: impl Into<String>, ws_endpoint: impl Into<String>) -> Self {
        Self {
            endpoints: EndpointConfig {
                api_base_url: api_base_url.into(),
                ws_endpoint: ws_endpoint.into(),
                health_path: default_health_path(),
            },
            connection: ConnectionConfig::default(),
            pool: PoolSettings::default(),
            cache: CacheSettings::default(),
            coordinator: CoordinatorSettings::default(),
            offline: OfflineSettings::default(),
            network: NetworkSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.api_base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.endpoints.ws_endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.ws_endpoint",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.endpoints.ws_endpoint.starts_with("ws://")
            && !self.endpoints.ws_endpoint.starts_with("wss://")
        {
            return Err(ConfigError::InvalidValue {
                field: "endpoints.ws_endpoint",
                reason: "must use the ws:// or wss:// scheme".to_string(),
            });
        }
        if self.connection.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.heartbeat_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.connection.reconnect_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connection.reconnect_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.pool.cleanup_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pool.cleanup_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.max_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache.schema_version.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "cache.schema_version",
                reason: "must not be empty".to_string(),
            });
        }
        if self.cache.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache.sweep_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.offline.store_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "offline.store_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.offline.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "offline.map_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.offline.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "offline.sweep_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.network.probe_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.probe_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.network.probe_timeout_ms == 0
            || self.network.probe_timeout_ms > self.network.probe_interval_ms
        {
            return Err(ConfigError::InvalidValue {
                field: "network.probe_timeout_ms",
                reason: "must be > 0 and <= probe_interval_ms".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
