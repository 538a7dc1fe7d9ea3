//! Domain types shared across the workspace.
//!
//! The provisioning data model is a chain of 1:1 records:
//! [`ProvisioningRequest`] → [`InstanceId`] → [`TunnelCredentials`] →
//! [`MetadataDocument`] → [`InstanceRecord`], summarised for callers as a
//! [`ProvisioningResult`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CompensationFailure, ProvisionError};

/// Maximum length of a subdomain label.
pub const MAX_SUBDOMAIN_LEN: usize = 12;

/// Hypervisor identifier of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Wrap a raw identifier.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The raw identifier.
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Workflow states of the provisioning orchestrator, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Validating,
    Allocating,
    TunnelCreating,
    RoutingConfiguring,
    DnsRegistering,
    MetadataPublishing,
    InstanceCloning,
    InstanceStarting,
    WaitingReady,
    Succeeded,
}

impl Stage {
    /// All non-terminal stages in order.
    pub const STEPS: [Stage; 9] = [
        Stage::Validating,
        Stage::Allocating,
        Stage::TunnelCreating,
        Stage::RoutingConfiguring,
        Stage::DnsRegistering,
        Stage::MetadataPublishing,
        Stage::InstanceCloning,
        Stage::InstanceStarting,
        Stage::WaitingReady,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "Validating",
            Stage::Allocating => "Allocating",
            Stage::TunnelCreating => "TunnelCreating",
            Stage::RoutingConfiguring => "RoutingConfiguring",
            Stage::DnsRegistering => "DnsRegistering",
            Stage::MetadataPublishing => "MetadataPublishing",
            Stage::InstanceCloning => "InstanceCloning",
            Stage::InstanceStarting => "InstanceStarting",
            Stage::WaitingReady => "WaitingReady",
            Stage::Succeeded => "Succeeded",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's request for a trial environment. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Customer e-mail address.
    pub customer_email: String,
    /// Requested application type (e.g. `nginx`).
    pub oss_type: String,
    /// Requested subdomain label.
    pub subdomain: String,
    /// Trial duration in days.
    pub duration_days: u32,
}

impl ProvisioningRequest {
    /// Validate the request fields that do not depend on configuration.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        validate_subdomain(&self.subdomain)?;
        validate_email(&self.customer_email)?;
        if self.duration_days == 0 {
            return Err(ProvisionError::invalid_request(
                "duration_days must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Validate a subdomain label.
///
/// Rules: 1 to 12 characters, lowercase ASCII letters, digits and `-`,
/// and no leading or trailing hyphen.
pub fn validate_subdomain(subdomain: &str) -> Result<(), ProvisionError> {
    if subdomain.is_empty() {
        return Err(ProvisionError::invalid_request("subdomain must not be empty"));
    }
    if subdomain.len() > MAX_SUBDOMAIN_LEN {
        return Err(ProvisionError::invalid_request(format!(
            "subdomain must be at most {MAX_SUBDOMAIN_LEN} characters (got {})",
            subdomain.len()
        )));
    }
    if !subdomain
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(ProvisionError::invalid_request(format!(
            "subdomain may only contain a-z, 0-9 and '-': {subdomain}"
        )));
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err(ProvisionError::invalid_request(format!(
            "subdomain must not start or end with '-': {subdomain}"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<(), ProvisionError> {
    match email.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(())
        }
        _ => Err(ProvisionError::invalid_request(format!(
            "invalid customer email: {email}"
        ))),
    }
}

/// Bearer credential of an edge tunnel.
///
/// Formatting never prints the secret; use [`TunnelToken::expose`] where the
/// raw value is actually needed (the metadata document).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelToken(String);

impl TunnelToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw credential.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TunnelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TunnelToken([redacted])")
    }
}

impl fmt::Display for TunnelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Identifier and credential of an edge tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCredentials {
    pub tunnel_id: String,
    pub token: TunnelToken,
    /// The tunnel already existed under this name and was not created by this call.
    pub reused: bool,
}

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// Datagram-based transport.
    Quic,
    /// Stream-based transport.
    Http2,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Quic => f.write_str("quic"),
            TransportProtocol::Http2 => f.write_str("http2"),
        }
    }
}

/// Preferred tunnel transport and the one to fall back to when it fails to establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPolicy {
    pub preferred: TransportProtocol,
    pub fallback: TransportProtocol,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            preferred: TransportProtocol::Quic,
            fallback: TransportProtocol::Http2,
        }
    }
}

/// Ingress rule of a tunnel: public hostname → local service port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub hostname: String,
    pub service_port: u16,
    pub transport: TransportPolicy,
}

impl Route {
    /// Local origin the tunnel forwards to.
    pub fn service_url(&self) -> String {
        format!("http://localhost:{}", self.service_port)
    }
}

/// Name under which a metadata document is published for `hostname`.
pub fn metadata_file_name(hostname: &str) -> String {
    format!("metadata-{hostname}.json")
}

/// Per-instance configuration document fetched by the instance on first boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub vmid: InstanceId,
    /// Network hostname of the instance; the document is published under it.
    pub hostname: String,
    pub subdomain: String,
    pub domain: String,
    pub customer_email: String,
    pub oss_type: String,
    pub url: String,
    pub tunnel_id: String,
    pub tunnel_token: TunnelToken,
    pub service_port: u16,
    pub duration_days: u32,
    pub tunnel_protocol: TransportProtocol,
    pub tunnel_protocol_fallback: TransportProtocol,
    pub created_at: DateTime<Utc>,
}

/// Boot state of an instance as observed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Cloning,
    Stopped,
    Running,
    Destroyed,
}

/// An instance created from a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub template_id: u32,
    pub hostname: String,
    pub state: InstanceState,
}

/// Durable artifact of a successful run, persisted by the caller for later deprovisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningResult {
    pub identifier: InstanceId,
    pub public_url: String,
    pub tunnel_id: String,
    pub subdomain: String,
    pub oss_type: String,
    pub duration_days: u32,
    pub customer_email: String,
}

/// Resources to tear down when a trial ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub identifier: InstanceId,
    pub tunnel_id: String,
    pub subdomain: String,
}

impl From<&ProvisioningResult> for DeprovisionRequest {
    fn from(result: &ProvisioningResult) -> Self {
        Self {
            identifier: result.identifier,
            tunnel_id: result.tunnel_id.clone(),
            subdomain: result.subdomain.clone(),
        }
    }
}

/// Outcome of a deprovision run. Every teardown is attempted; failures are collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprovisionReport {
    pub identifier: Option<InstanceId>,
    pub warnings: Vec<CompensationFailure>,
}

impl DeprovisionReport {
    /// Returns `true` if every teardown succeeded.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
