//! Liveness probes against the origin's health endpoint.

use std::time::Duration;

use async_trait::async_trait;
use tether_core::ProbeError;

/// Checks whether the origin server answers.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, url: &str) -> Result<(), ProbeError>;
}

/// `GET <url>`; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Unhealthy {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}
