//! Hypervisor client (container clone, start, stop and destroy).
//!
//! Mutating calls return a task identifier (UPID) immediately; the client
//! polls the task until it stops and treats any exit status other than `OK`
//! as a failure of the call.
//!
//! Two authentication modes are supported:
//! - API token: `Authorization: PVEAPIToken=<id>=<secret>` on every request
//! - Ticket: username/password exchanged for a cookie plus CSRF token, cached
//!   until shortly before it expires or until the server answers 401

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use trialhost_common::{
    HypervisorConfig, InstanceId, InstanceRecord, InstanceState, ProvisionError,
};
use trialhost_core::Hypervisor;

use crate::error::ApiError;
use crate::http::{build_client, join_url, read_text};

/// Tickets are valid for two hours; refresh a little earlier.
const TICKET_LIFETIME: Duration = Duration::from_secs(110 * 60);

const CSRF_HEADER: &str = "CSRFPreventionToken";

#[derive(Debug, Clone, Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug)]
struct CachedTicket {
    ticket: Ticket,
    issued_at: Instant,
}

enum Auth {
    Token(String),
    Ticket {
        username: String,
        password: String,
        cache: tokio::sync::RwLock<Option<CachedTicket>>,
    },
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    vmid: Option<u32>,
}

/// [`Hypervisor`] over the cluster's JSON API (`/api2/json`).
pub struct ProxmoxHypervisor {
    client: Client,
    api_base: String,
    node: String,
    storage: String,
    auth: Auth,
    task_poll_interval: Duration,
    task_timeout: Duration,
}

impl ProxmoxHypervisor {
    pub fn new(config: &HypervisorConfig) -> Result<Self, ApiError> {
        if config.base_url.is_empty() || config.node.is_empty() {
            return Err(ApiError::config(
                "hypervisor.base_url and hypervisor.node must be set",
            ));
        }

        let auth = match (
            &config.token_id,
            &config.token_secret,
            &config.user,
            &config.password,
        ) {
            (Some(id), Some(secret), _, _) => Auth::Token(format!("PVEAPIToken={id}={secret}")),
            (_, _, Some(user), Some(password)) => Auth::Ticket {
                username: user.clone(),
                password: password.clone(),
                cache: tokio::sync::RwLock::new(None),
            },
            _ => {
                return Err(ApiError::config(
                    "hypervisor credentials missing: set token_id/token_secret or user/password",
                ));
            }
        };

        let client = build_client(
            Duration::from_secs(config.request_timeout_secs),
            !config.verify_tls,
        )?;

        Ok(Self {
            client,
            api_base: join_url(&config.base_url, "api2/json"),
            node: config.node.clone(),
            storage: config.storage.clone(),
            auth,
            task_poll_interval: Duration::from_millis(config.task_poll_interval_ms),
            task_timeout: Duration::from_secs(config.task_timeout_secs),
        })
    }

    fn lxc_path(&self, id: InstanceId) -> String {
        format!("nodes/{}/lxc/{id}", self.node)
    }

    /// Get a ticket, from the cache if still valid.
    async fn ticket(&self) -> Result<Option<Ticket>, ApiError> {
        let Auth::Ticket {
            username,
            password,
            cache,
        } = &self.auth
        else {
            return Ok(None);
        };

        {
            let cached = cache.read().await;
            if let Some(c) = cached.as_ref() {
                if c.issued_at.elapsed() < TICKET_LIFETIME {
                    return Ok(Some(c.ticket.clone()));
                }
            }
        }

        let url = join_url(&self.api_base, "access/ticket");
        let response = self
            .client
            .post(&url)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&url, e))?;
        let (status, body) = read_text(&url, response).await?;
        if !(200..300).contains(&status) {
            return Err(parse_error(&url, status, &body));
        }
        let ticket: Ticket = data_of(&url, &body)?;
        debug!(username = %username, "Obtained hypervisor ticket");

        let mut cached = cache.write().await;
        *cached = Some(CachedTicket {
            ticket: ticket.clone(),
            issued_at: Instant::now(),
        });
        Ok(Some(ticket))
    }

    async fn invalidate_ticket(&self) {
        if let Auth::Ticket { cache, .. } = &self.auth {
            *cache.write().await = None;
        }
    }

    async fn authorize(
        &self,
        request: RequestBuilder,
        method: &Method,
    ) -> Result<RequestBuilder, ApiError> {
        Ok(match &self.auth {
            Auth::Token(header) => request.header(reqwest::header::AUTHORIZATION, header),
            Auth::Ticket { .. } => {
                let Some(ticket) = self.ticket().await? else {
                    return Ok(request);
                };
                let request = request.header(
                    reqwest::header::COOKIE,
                    format!("PVEAuthCookie={}", ticket.ticket),
                );
                if *method == Method::GET {
                    request
                } else {
                    request.header(CSRF_HEADER, ticket.csrf_token)
                }
            }
        })
    }

    /// Send a request and return the `data` member of the response.
    ///
    /// With ticket auth, a 401 drops the cached ticket and the call is repeated once.
    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, String)]>,
    ) -> Result<Value, ApiError> {
        let url = join_url(&self.api_base, path);
        let mut retried = false;

        loop {
            let mut request = self.client.request(method.clone(), &url).query(query);
            if let Some(form) = form {
                request = request.form(form);
            }
            let request = self.authorize(request, &method).await?;

            let response = request
                .send()
                .await
                .map_err(|e| ApiError::from_reqwest(&url, e))?;
            let (status, body) = read_text(&url, response).await?;

            if status == 401 && !retried && matches!(self.auth, Auth::Ticket { .. }) {
                warn!(url = %url, "Hypervisor ticket rejected, re-authenticating");
                self.invalidate_ticket().await;
                retried = true;
                continue;
            }
            if !(200..300).contains(&status) {
                return Err(parse_error(&url, status, &body));
            }
            return data_of(&url, &body);
        }
    }

    /// Poll a task until it stops.
    #[instrument(skip(self))]
    async fn wait_task(&self, upid: &str) -> Result<(), ApiError> {
        let path = format!("nodes/{}/tasks/{upid}/status", self.node);
        let deadline = tokio::time::Instant::now() + self.task_timeout;

        loop {
            let status: TaskStatus = serde_json::from_value(
                self.call(Method::GET, &path, &[], None).await?,
            )
            .map_err(|e| ApiError::decode(&path, e.to_string()))?;

            if status.status == "stopped" {
                let exit_status = status.exitstatus.unwrap_or_default();
                if exit_status == "OK" {
                    debug!("Task finished");
                    return Ok(());
                }
                return Err(ApiError::Task {
                    upid: upid.to_string(),
                    exit_status,
                });
            }

            if tokio::time::Instant::now() + self.task_poll_interval > deadline {
                return Err(ApiError::Timeout {
                    url: join_url(&self.api_base, &path),
                });
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }

    /// Run a task-producing call and wait for the task.
    async fn run_task(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, String)]>,
    ) -> Result<(), ApiError> {
        let data = self.call(method, path, query, form).await?;
        match data.as_str() {
            Some(upid) => self.wait_task(upid).await,
            None => Ok(()),
        }
    }
}

/// Extract `data` from a successful response body.
fn data_of<T: serde::de::DeserializeOwned>(url: &str, body: &str) -> Result<T, ApiError> {
    #[derive(Deserialize)]
    struct Data<T> {
        data: T,
    }
    serde_json::from_str::<Data<T>>(body)
        .map(|d| d.data)
        .map_err(|e| ApiError::decode(url, e.to_string()))
}

/// Error bodies carry `message` and per-parameter `errors`; fall back to the raw text.
fn parse_error(url: &str, status: u16, body: &str) -> ApiError {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return ApiError::status(url, status, body);
    };

    let mut parts = Vec::new();
    if let Some(message) = value.get("message").and_then(Value::as_str) {
        parts.push(message.trim().to_string());
    }
    if let Some(errors) = value.get("errors").and_then(Value::as_object) {
        for (field, reason) in errors {
            let reason = reason.as_str().map_or_else(|| reason.to_string(), str::to_string);
            parts.push(format!("{field}: {}", reason.trim()));
        }
    }

    if parts.is_empty() {
        ApiError::status(url, status, body)
    } else {
        ApiError::Api {
            status,
            code: None,
            message: parts.join("; "),
        }
    }
}

#[async_trait]
impl Hypervisor for ProxmoxHypervisor {
    async fn list_instance_ids(&self) -> Result<BTreeSet<InstanceId>, ProvisionError> {
        let data = self
            .call(Method::GET, "cluster/resources", &[("type", "vm")], None)
            .await
            .map_err(|e| ProvisionError::hypervisor_unavailable(e.to_string()))?;
        let resources: Vec<Resource> = serde_json::from_value(data)
            .map_err(|e| ProvisionError::hypervisor_unavailable(format!("bad resource list: {e}")))?;

        Ok(resources
            .into_iter()
            .filter_map(|r| r.vmid)
            .map(InstanceId::new)
            .collect())
    }

    #[instrument(skip(self), fields(vmid = %new_id))]
    async fn clone_instance(
        &self,
        template_id: u32,
        new_id: InstanceId,
        hostname: &str,
    ) -> Result<InstanceRecord, ProvisionError> {
        let path = format!("nodes/{}/lxc/{template_id}/clone", self.node);
        let form = [
            ("newid", new_id.to_string()),
            ("hostname", hostname.to_string()),
            ("full", "1".to_string()),
            ("storage", self.storage.clone()),
        ];

        self.run_task(Method::POST, &path, &[], Some(&form[..]))
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    ProvisionError::CloneConflict { id: new_id }
                } else if e.is_not_found() {
                    ProvisionError::TemplateMissing { template_id }
                } else {
                    ProvisionError::CloneFailed {
                        id: new_id,
                        reason: e.to_string(),
                    }
                }
            })?;

        info!(template_id, hostname, "Instance cloned");
        Ok(InstanceRecord {
            id: new_id,
            template_id,
            hostname: hostname.to_string(),
            state: InstanceState::Stopped,
        })
    }

    #[instrument(skip(self), fields(vmid = %id))]
    async fn start(&self, id: InstanceId) -> Result<(), ProvisionError> {
        let path = format!("{}/status/start", self.lxc_path(id));
        self.run_task(Method::POST, &path, &[], None)
            .await
            .map_err(|e| ProvisionError::start_failed(id, e.to_string()))?;
        info!("Instance started");
        Ok(())
    }

    #[instrument(skip(self), fields(vmid = %id))]
    async fn stop(&self, id: InstanceId) -> Result<(), ProvisionError> {
        let path = format!("{}/status/stop", self.lxc_path(id));
        match self.run_task(Method::POST, &path, &[], None).await {
            Ok(()) => {
                debug!("Instance stopped");
                Ok(())
            }
            Err(e) if e.is_not_found() || is_not_running(&e) => Ok(()),
            Err(e) => Err(ProvisionError::teardown_failed(
                format!("instance {id}"),
                e.to_string(),
            )),
        }
    }

    #[instrument(skip(self), fields(vmid = %id))]
    async fn destroy(&self, id: InstanceId) -> Result<(), ProvisionError> {
        match self
            .run_task(Method::DELETE, &self.lxc_path(id), &[("purge", "1")], None)
            .await
        {
            Ok(()) => {
                info!("Instance destroyed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!("Instance already gone");
                Ok(())
            }
            Err(e) => Err(ProvisionError::teardown_failed(
                format!("instance {id}"),
                e.to_string(),
            )),
        }
    }
}

fn is_not_running(error: &ApiError) -> bool {
    error.to_string().to_lowercase().contains("not running")
}

impl std::fmt::Debug for ProxmoxHypervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match self.auth {
            Auth::Token(_) => "token",
            Auth::Ticket { .. } => "ticket",
        };
        f.debug_struct("ProxmoxHypervisor")
            .field("api_base", &self.api_base)
            .field("node", &self.node)
            .field("auth", &auth)
            .finish_non_exhaustive()
    }
}
