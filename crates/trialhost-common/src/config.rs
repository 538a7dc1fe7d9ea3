//! Configuration structures for trialhost.
//!
//! This module defines configuration options for the provisioning workflow
//! and the external systems it talks to:
//! - [`ProvisionerConfig`]: Workflow settings (domain, pool, readiness, retries, apps)
//! - [`HypervisorConfig`]: Instance hypervisor API
//! - [`EdgeConfig`]: Edge network (tunnel + DNS) API
//! - [`MetadataConfig`]: Metadata file server

use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{InstanceId, TransportPolicy};

/// Provisioning workflow configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProvisionerConfig {
    /// Domain under which trial hostnames are created.
    #[serde(default = "defaults::domain")]
    pub domain: String,

    /// Identifier pool instances are allocated from.
    #[serde(default)]
    pub pool: PoolConfig,

    /// What to do when the requested subdomain already has DNS.
    #[serde(default)]
    pub subdomain_policy: SubdomainPolicy,

    /// Tear down created resources when readiness times out.
    ///
    /// Off by default: the resources are usually valid and merely slow,
    /// so they are kept for inspection.
    #[serde(default)]
    pub rollback_on_readiness_timeout: bool,

    /// How many identifiers to try when cloning hits an identifier conflict.
    #[serde(default = "defaults::max_clone_attempts")]
    pub max_clone_attempts: u32,

    /// Readiness wait settings.
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Retry policy for propagation-sensitive calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tunnel names are `{tunnel_prefix}-{subdomain}`.
    #[serde(default = "defaults::tunnel_prefix")]
    pub tunnel_prefix: String,

    /// Tunnel transport preference published to the instance.
    #[serde(default)]
    pub transport: TransportPolicy,

    /// Application catalog.
    #[serde(default = "defaults::apps")]
    pub apps: Vec<AppTemplate>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            domain: defaults::domain(),
            pool: PoolConfig::default(),
            subdomain_policy: SubdomainPolicy::default(),
            rollback_on_readiness_timeout: false,
            max_clone_attempts: defaults::max_clone_attempts(),
            readiness: ReadinessConfig::default(),
            retry: RetryConfig::default(),
            tunnel_prefix: defaults::tunnel_prefix(),
            transport: TransportPolicy::default(),
            apps: defaults::apps(),
        }
    }
}

impl ProvisionerConfig {
    /// Look up an application template by type name.
    pub fn app(&self, oss_type: &str) -> Option<&AppTemplate> {
        self.apps.iter().find(|app| app.name == oss_type)
    }

    /// Fully qualified public hostname for a subdomain.
    pub fn public_hostname(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.domain)
    }

    /// Edge tunnel name for a subdomain.
    pub fn tunnel_name(&self, subdomain: &str) -> String {
        format!("{}-{subdomain}", self.tunnel_prefix)
    }

    /// Public URL for a subdomain.
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("https://{}", self.public_hostname(subdomain))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.is_empty() {
            return Err("provisioner.domain must not be empty".into());
        }
        if self.pool.start > self.pool.end {
            return Err(format!(
                "provisioner.pool is empty: start {} > end {}",
                self.pool.start, self.pool.end
            ));
        }
        if self.apps.is_empty() {
            return Err("provisioner.apps must define at least one application".into());
        }
        if self.max_clone_attempts == 0 {
            return Err("provisioner.max_clone_attempts must be at least 1".into());
        }
        Ok(())
    }
}

/// Bounded identifier pool.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PoolConfig {
    #[serde(default = "defaults::pool_start")]
    pub start: u32,
    #[serde(default = "defaults::pool_end")]
    pub end: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start: defaults::pool_start(),
            end: defaults::pool_end(),
        }
    }
}

impl PoolConfig {
    /// Identifiers in the pool, lowest first.
    pub fn range(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    /// Returns `true` if `id` belongs to the pool.
    pub fn contains(&self, id: InstanceId) -> bool {
        self.range().contains(&id.get())
    }
}

/// Behavior when a requested subdomain still has DNS from an earlier trial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubdomainPolicy {
    /// Fail the request with `SubdomainInUse`.
    #[default]
    Reject,
    /// Reuse the tunnel and replace the stale DNS record.
    Reclaim,
}

/// Readiness wait configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    /// Overall deadline in seconds.
    #[serde(default = "defaults::readiness_timeout_secs")]
    pub timeout_secs: u64,

    /// Pause between probes in seconds.
    #[serde(default = "defaults::readiness_interval_secs")]
    pub interval_secs: u64,

    /// Per-probe timeout in seconds, distinct from the overall deadline.
    #[serde(default = "defaults::readiness_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Highest HTTP status still counted as "answering".
    #[serde(default = "defaults::ready_status_max")]
    pub ready_status_max: u16,

    /// Verify TLS certificates of the public URL.
    #[serde(default = "defaults::verify_tls")]
    pub verify_tls: bool,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::readiness_timeout_secs(),
            interval_secs: defaults::readiness_interval_secs(),
            attempt_timeout_secs: defaults::readiness_attempt_timeout_secs(),
            ready_status_max: defaults::ready_status_max(),
            verify_tls: defaults::verify_tls(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "defaults::retry_attempts")]
    pub attempts: u32,

    /// Pause between attempts in milliseconds.
    #[serde(default = "defaults::retry_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: defaults::retry_attempts(),
            interval_ms: defaults::retry_interval_ms(),
        }
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// An application type that can be provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AppTemplate {
    /// Application type name used in requests (e.g. `nginx`).
    pub name: String,
    /// Hypervisor template the instance is cloned from.
    pub template_id: u32,
    /// Local port the application listens on inside the instance.
    pub service_port: u16,
}

/// Instance hypervisor API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HypervisorConfig {
    /// API base URL (e.g. `https://pve.local:8006`).
    #[serde(default = "defaults::hypervisor_url")]
    pub base_url: String,

    /// Node that hosts templates and trial instances.
    #[serde(default = "defaults::hypervisor_node")]
    pub node: String,

    /// Login user (e.g. `root@pam`) for ticket authentication.
    #[serde(default)]
    pub user: Option<String>,

    /// Login password for ticket authentication.
    #[serde(default)]
    pub password: Option<String>,

    /// API token id (`user@realm!name`); preferred over password login.
    #[serde(default)]
    pub token_id: Option<String>,

    /// API token secret.
    #[serde(default)]
    pub token_secret: Option<String>,

    /// Storage that full clones are written to.
    #[serde(default = "defaults::hypervisor_storage")]
    pub storage: String,

    /// Verify the hypervisor's TLS certificate.
    #[serde(default)]
    pub verify_tls: bool,

    /// How often to poll asynchronous hypervisor tasks, in milliseconds.
    #[serde(default = "defaults::task_poll_interval_ms")]
    pub task_poll_interval_ms: u64,

    /// Upper bound on a single hypervisor task, in seconds.
    #[serde(default = "defaults::task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::hypervisor_url(),
            node: defaults::hypervisor_node(),
            user: None,
            password: None,
            token_id: None,
            token_secret: None,
            storage: defaults::hypervisor_storage(),
            verify_tls: false,
            task_poll_interval_ms: defaults::task_poll_interval_ms(),
            task_timeout_secs: defaults::task_timeout_secs(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

/// Edge network (tunnel + DNS) API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EdgeConfig {
    /// API base URL.
    #[serde(default = "defaults::edge_api_base")]
    pub api_base: String,

    /// Bearer token for the API.
    #[serde(default)]
    pub api_token: Option<String>,

    /// Account that owns the tunnels.
    #[serde(default)]
    pub account_id: String,

    /// DNS zone of the trial domain.
    #[serde(default)]
    pub zone_id: String,

    /// CNAME target suffix: records point at `{tunnel_id}.{tunnel_cname_suffix}`.
    #[serde(default = "defaults::tunnel_cname_suffix")]
    pub tunnel_cname_suffix: String,

    /// Per-request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            api_base: defaults::edge_api_base(),
            api_token: None,
            account_id: String::new(),
            zone_id: String::new(),
            tunnel_cname_suffix: defaults::tunnel_cname_suffix(),
            request_timeout_secs: defaults::request_timeout_secs(),
        }
    }
}

/// Metadata file server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetadataConfig {
    /// Base URL of the file server, as reachable by both orchestrator and instances.
    #[serde(default = "defaults::metadata_url")]
    pub base_url: String,

    /// Path documents are uploaded to (PUT / DELETE).
    #[serde(default = "defaults::metadata_upload_path")]
    pub upload_path: String,

    /// Path instances fetch documents from (GET).
    #[serde(default = "defaults::metadata_public_path")]
    pub public_path: String,

    /// Per-request timeout in seconds.
    #[serde(default = "defaults::metadata_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::metadata_url(),
            upload_path: defaults::metadata_upload_path(),
            public_path: defaults::metadata_public_path(),
            request_timeout_secs: defaults::metadata_timeout_secs(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    use super::AppTemplate;

    pub fn domain() -> String {
        "persys.jp".to_string()
    }

    pub const fn pool_start() -> u32 {
        9000
    }

    pub const fn pool_end() -> u32 {
        9999
    }

    pub const fn max_clone_attempts() -> u32 {
        5
    }

    pub const fn readiness_timeout_secs() -> u64 {
        300
    }

    pub const fn readiness_interval_secs() -> u64 {
        10
    }

    pub const fn readiness_attempt_timeout_secs() -> u64 {
        5
    }

    pub const fn ready_status_max() -> u16 {
        499
    }

    pub const fn verify_tls() -> bool {
        true
    }

    pub const fn retry_attempts() -> u32 {
        10
    }

    pub const fn retry_interval_ms() -> u64 {
        3000
    }

    pub fn apps() -> Vec<AppTemplate> {
        vec![AppTemplate {
            name: "nginx".to_string(),
            template_id: 8011,
            service_port: 80,
        }]
    }

    pub fn hypervisor_url() -> String {
        "https://127.0.0.1:8006".to_string()
    }

    pub fn hypervisor_node() -> String {
        "odin".to_string()
    }

    pub fn hypervisor_storage() -> String {
        "vm-storage".to_string()
    }

    pub const fn task_poll_interval_ms() -> u64 {
        1000
    }

    pub const fn task_timeout_secs() -> u64 {
        300
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub fn edge_api_base() -> String {
        "https://api.cloudflare.com/client/v4".to_string()
    }

    pub fn tunnel_prefix() -> String {
        "trial".to_string()
    }

    pub fn tunnel_cname_suffix() -> String {
        "cfargotunnel.com".to_string()
    }

    pub fn metadata_url() -> String {
        "http://127.0.0.1:8080".to_string()
    }

    pub fn metadata_upload_path() -> String {
        "/upload".to_string()
    }

    pub fn metadata_public_path() -> String {
        "/metadata".to_string()
    }

    pub const fn metadata_timeout_secs() -> u64 {
        10
    }
}
