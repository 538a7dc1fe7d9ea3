//! Edge network client (tunnel and DNS API).
//!
//! Every response is wrapped in an envelope:
//!
//! ```json
//! { "success": true, "errors": [], "result": { ... } }
//! ```
//!
//! Tunnels are looked up by name before creation, so [`EdgeNetwork::create_tunnel`]
//! returns the existing tunnel on a repeated call.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use reqwest::{Client, Method};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use trialhost_common::{EdgeConfig, ProvisionError, Route, TunnelCredentials, TunnelToken};
use trialhost_core::{EdgeNetwork, RetryPolicy};

use crate::error::ApiError;
use crate::http::{build_client, join_url, read_text};

/// Size of a generated tunnel secret in bytes.
const TUNNEL_SECRET_LEN: usize = 32;

/// Catch-all ingress rule appended after the trial hostname.
const CATCH_ALL_SERVICE: &str = "http_status:404";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<Message>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Message {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Tunnel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
}

/// [`EdgeNetwork`] over the edge provider's REST API.
pub struct CloudflareEdge {
    client: Client,
    api_base: String,
    api_token: String,
    account_id: String,
    zone_id: String,
    cname_suffix: String,
    token_retry: RetryPolicy,
}

impl CloudflareEdge {
    /// Create a client. `token_retry` covers credential propagation after creation.
    pub fn new(config: &EdgeConfig, token_retry: RetryPolicy) -> Result<Self, ApiError> {
        let api_token = config
            .api_token
            .clone()
            .ok_or_else(|| ApiError::config("edge.api_token is not set"))?;
        if config.account_id.is_empty() || config.zone_id.is_empty() {
            return Err(ApiError::config("edge.account_id and edge.zone_id must be set"));
        }

        let client = build_client(
            std::time::Duration::from_secs(config.request_timeout_secs),
            false,
        )?;

        Ok(Self {
            client,
            api_base: config.api_base.clone(),
            api_token,
            account_id: config.account_id.clone(),
            zone_id: config.zone_id.clone(),
            cname_suffix: config.tunnel_cname_suffix.clone(),
            token_retry,
        })
    }

    fn tunnels_path(&self) -> String {
        format!("accounts/{}/cfd_tunnel", self.account_id)
    }

    fn dns_path(&self) -> String {
        format!("zones/{}/dns_records", self.zone_id)
    }

    /// Send a request and unwrap the response envelope.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Option<T>, ApiError> {
        let url = join_url(&self.api_base, path);
        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_token)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&url, e))?;
        let (status, text) = read_text(&url, response).await?;

        let Ok(envelope) = serde_json::from_str::<Envelope<T>>(&text) else {
            if (200..300).contains(&status) {
                return Err(ApiError::decode(&url, "unexpected response body"));
            }
            return Err(ApiError::status(&url, status, &text));
        };

        if !envelope.success || !(200..300).contains(&status) {
            let code = envelope.errors.first().map(|m| m.code);
            let message = if envelope.errors.is_empty() {
                "request was not successful".to_string()
            } else {
                envelope
                    .errors
                    .iter()
                    .map(|m| format!("[{}] {}", m.code, m.message))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(ApiError::Api {
                status,
                code,
                message,
            });
        }

        Ok(envelope.result)
    }

    /// Like [`Self::request`] but the result must be present.
    async fn request_result<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        self.request(method, path, query, body)
            .await?
            .ok_or_else(|| ApiError::decode(join_url(&self.api_base, path), "missing result"))
    }

    async fn find_tunnel(&self, name: &str) -> Result<Option<Tunnel>, ApiError> {
        let tunnels: Vec<Tunnel> = self
            .request(
                Method::GET,
                &self.tunnels_path(),
                &[("name", name), ("is_deleted", "false")],
                None,
            )
            .await?
            .unwrap_or_default();
        Ok(tunnels.into_iter().find(|t| t.name == name))
    }

    async fn fetch_token(&self, tunnel_id: &str) -> Result<String, ApiError> {
        let path = format!("{}/{tunnel_id}/token", self.tunnels_path());
        self.request_result(Method::GET, &path, &[], None).await
    }

    async fn dns_records(&self, hostname: &str) -> Result<Vec<DnsRecord>, ApiError> {
        let records: Vec<DnsRecord> = self
            .request(Method::GET, &self.dns_path(), &[("name", hostname)], None)
            .await?
            .unwrap_or_default();
        Ok(records.into_iter().filter(|r| r.name == hostname).collect())
    }

    async fn remove_dns(&self, hostname: &str) -> Result<usize, ApiError> {
        let records = self.dns_records(hostname).await?;
        for record in &records {
            let path = format!("{}/{}", self.dns_path(), record.id);
            match self.request::<Value>(Method::DELETE, &path, &[], None).await {
                Ok(_) => debug!(record_id = %record.id, hostname, "DNS record deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records.len())
    }
}

fn generate_tunnel_secret() -> String {
    let mut secret = [0u8; TUNNEL_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    BASE64.encode(secret)
}

#[async_trait]
impl EdgeNetwork for CloudflareEdge {
    #[instrument(skip(self))]
    async fn create_tunnel(&self, name: &str) -> Result<TunnelCredentials, ProvisionError> {
        let existing = self
            .find_tunnel(name)
            .await
            .map_err(|e| ProvisionError::tunnel_create_failed(e.to_string()))?;

        let reused = existing.is_some();
        let tunnel_id = if let Some(tunnel) = existing {
            info!(tunnel_id = %tunnel.id, "Reusing existing tunnel");
            tunnel.id
        } else {
            let body = json!({
                "name": name,
                "tunnel_secret": generate_tunnel_secret(),
                "config_src": "cloudflare",
            });
            let created: Tunnel = self
                .request_result(Method::POST, &self.tunnels_path(), &[], Some(&body))
                .await
                .map_err(|e| ProvisionError::tunnel_create_failed(e.to_string()))?;
            info!(tunnel_id = %created.id, "Tunnel created");
            created.id
        };

        let token = {
            let tunnel_id = tunnel_id.as_str();
            self.token_retry
                .run("fetch_tunnel_token", move || self.fetch_token(tunnel_id))
                .await
                .map_err(|e| {
                    ProvisionError::tunnel_create_failed(format!(
                        "credential for tunnel {tunnel_id} unavailable: {e}"
                    ))
                })?
        };

        Ok(TunnelCredentials {
            tunnel_id,
            token: TunnelToken::new(token),
            reused,
        })
    }

    #[instrument(skip(self, route), fields(hostname = %route.hostname, port = route.service_port))]
    async fn configure_routing(
        &self,
        tunnel_id: &str,
        route: &Route,
    ) -> Result<(), ProvisionError> {
        let path = format!("{}/{tunnel_id}/configurations", self.tunnels_path());
        let body = json!({
            "config": {
                "ingress": [
                    { "hostname": route.hostname, "service": route.service_url() },
                    { "service": CATCH_ALL_SERVICE },
                ]
            }
        });

        self.request::<Value>(Method::PUT, &path, &[], Some(&body))
            .await
            .map_err(|e| ProvisionError::routing_config_failed(e.to_string()))?;

        debug!(
            protocol = %route.transport.preferred,
            fallback = %route.transport.fallback,
            "Ingress configured"
        );
        Ok(())
    }

    #[instrument(skip(self))]
    async fn register_dns(&self, hostname: &str, tunnel_id: &str) -> Result<(), ProvisionError> {
        let replaced = self.remove_dns(hostname).await.map_err(|e| {
            warn!(error = %e, "Stale DNS record could not be removed");
            ProvisionError::dns_register_failed(format!(
                "stale record for {hostname} could not be removed: {e}"
            ))
        })?;
        if replaced > 0 {
            info!(replaced, "Replaced stale DNS records");
        }

        let body = json!({
            "type": "CNAME",
            "name": hostname,
            "content": format!("{tunnel_id}.{}", self.cname_suffix),
            "ttl": 1,
            "proxied": true,
        });
        self.request::<Value>(Method::POST, &self.dns_path(), &[], Some(&body))
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    ProvisionError::DnsConflict {
                        hostname: hostname.to_string(),
                    }
                } else {
                    ProvisionError::dns_register_failed(e.to_string())
                }
            })?;

        info!("DNS record created");
        Ok(())
    }

    async fn dns_exists(&self, hostname: &str) -> Result<bool, ProvisionError> {
        let records = self
            .dns_records(hostname)
            .await
            .map_err(|e| ProvisionError::dns_lookup_failed(e.to_string()))?;
        Ok(!records.is_empty())
    }

    #[instrument(skip(self))]
    async fn delete_dns(&self, hostname: &str) -> Result<(), ProvisionError> {
        self.remove_dns(hostname)
            .await
            .map(|_| ())
            .map_err(|e| ProvisionError::teardown_failed(format!("dns {hostname}"), e.to_string()))
    }

    #[instrument(skip(self))]
    async fn destroy_tunnel(&self, tunnel_id: &str) -> Result<(), ProvisionError> {
        let path = format!("{}/{tunnel_id}", self.tunnels_path());

        // Active connections block deletion.
        let connections = format!("{path}/connections");
        if let Err(e) = self
            .request::<Value>(Method::DELETE, &connections, &[], None)
            .await
        {
            if !e.is_not_found() {
                warn!(error = %e, "Failed to clean up tunnel connections");
            }
        }

        match self.request::<Value>(Method::DELETE, &path, &[], None).await {
            Ok(_) => {
                info!("Tunnel deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Tunnel already gone");
                Ok(())
            }
            Err(e) => Err(ProvisionError::teardown_failed(
                format!("tunnel {tunnel_id}"),
                e.to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for CloudflareEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareEdge")
            .field("api_base", &self.api_base)
            .field("account_id", &self.account_id)
            .field("zone_id", &self.zone_id)
            .finish_non_exhaustive()
    }
}
