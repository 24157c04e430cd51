//! Tracing subscriber setup.

use tether_core::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ClientError, ClientResult};

/// Install the global subscriber. `RUST_LOG` overrides `logging.filter`.
pub fn init_tracing(config: &LoggingConfig) -> ClientResult<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| ClientError::Telemetry {
            reason: format!("invalid filter '{}': {}", config.filter, e),
        })?,
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    result.map_err(|e| ClientError::Telemetry {
        reason: e.to_string(),
    })?;

    tracing::info!(filter = %config.filter, json = config.json, "Logging initialized");
    Ok(())
}
