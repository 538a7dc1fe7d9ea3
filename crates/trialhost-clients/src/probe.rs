//! HTTP readiness probe.

use async_trait::async_trait;
use reqwest::Client;
use tracing::trace;

use trialhost_common::ReadinessConfig;
use trialhost_core::Probe;

use crate::error::ApiError;
use crate::http::build_client;

/// Probe that treats any answered request with a status up to `ready_status_max` as ready.
///
/// A 404 or 401 still proves the tunnel, DNS and instance are serving; only
/// connection failures and edge errors (5xx) mean "not yet".
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    ready_status_max: u16,
}

impl HttpProbe {
    pub fn new(config: &ReadinessConfig) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(config.attempt_timeout(), !config.verify_tls)?,
            ready_status_max: config.ready_status_max,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                trace!(url, status, "Probe answered");
                status <= self.ready_status_max
            }
            Err(e) => {
                trace!(url, error = %e, "Probe failed");
                false
            }
        }
    }
}
