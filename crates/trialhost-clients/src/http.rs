//! Shared HTTP plumbing.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::error::ApiError;

/// Build a pooled client with the workspace defaults.
pub(crate) fn build_client(timeout: Duration, accept_invalid_certs: bool) -> Result<Client, ApiError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .pool_max_idle_per_host(10)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .user_agent(concat!("trialhost/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ApiError::config(format!("failed to create HTTP client: {e}")))
}

/// Join a base URL and a path with exactly one `/` between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Read the body and check the status.
pub(crate) async fn read_text(url: &str, response: Response) -> Result<(u16, String), ApiError> {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::from_reqwest(url, e))?;
    Ok((status, body))
}

/// Decode a successful JSON response.
pub(crate) async fn read_json<T: DeserializeOwned>(
    url: &str,
    response: Response,
) -> Result<T, ApiError> {
    let (status, body) = read_text(url, response).await?;
    if !(200..300).contains(&status) {
        return Err(ApiError::status(url, status, &body));
    }
    serde_json::from_str(&body).map_err(|e| ApiError::decode(url, e.to_string()))
}
