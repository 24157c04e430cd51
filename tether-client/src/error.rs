//! Error type for the client binary and composition root.

use tether_core::{ConfigError, DeliveryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("Failed to initialize logging: {reason}")]
    Telemetry { reason: String },
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Delivery(err.into())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
