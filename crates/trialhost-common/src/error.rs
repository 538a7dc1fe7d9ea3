//! Error types for trialhost.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`ProvisionError`]: Typed failure surfaced by a single component step
//! - [`ProvisionFailure`]: Terminal workflow failure (stage + cause + warnings)
//! - [`CompensationFailure`]: A teardown that failed during rollback or cleanup

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{InstanceId, ProvisioningResult, Stage};

/// Failures raised by the individual provisioning components.
///
/// Each component surfaces one of these; only the orchestrator decides
/// how a component failure maps onto a workflow-level [`ProvisionFailure`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// The request failed validation.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// The requested application type has no configured template.
    #[error("Unsupported application type: {oss_type}")]
    UnknownApp {
        /// The application type that was requested.
        oss_type: String,
    },

    /// DNS for the public hostname already exists from an earlier trial.
    #[error("Subdomain already in use: {hostname}")]
    SubdomainInUse {
        /// The public hostname that is taken.
        hostname: String,
    },

    /// Every identifier in the pool is taken.
    #[error("Identifier pool exhausted: {start}-{end} all in use")]
    PoolExhausted {
        /// First identifier of the pool.
        start: u32,
        /// Last identifier of the pool.
        end: u32,
    },

    /// The hypervisor could not be queried.
    #[error("Hypervisor unavailable: {reason}")]
    HypervisorUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// Creating (or looking up) the edge tunnel failed.
    #[error("Tunnel creation failed: {reason}")]
    TunnelCreateFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Configuring the tunnel ingress rules failed.
    #[error("Routing configuration failed: {reason}")]
    RoutingConfigFailed {
        /// Description of the failure.
        reason: String,
    },

    /// A DNS record for the hostname exists and could not be replaced.
    #[error("DNS conflict: {hostname}")]
    DnsConflict {
        /// The conflicting hostname.
        hostname: String,
    },

    /// Looking up existing DNS records failed.
    #[error("DNS lookup failed: {reason}")]
    DnsLookupFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Registering the DNS record failed.
    #[error("DNS registration failed: {reason}")]
    DnsRegisterFailed {
        /// Description of the failure.
        reason: String,
    },

    /// Uploading or verifying the metadata document failed.
    #[error("Metadata publish failed: {reason}")]
    MetadataPublishFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The identifier is already used by another instance.
    #[error("Instance {id} already exists")]
    CloneConflict {
        /// The identifier that was taken.
        id: InstanceId,
    },

    /// The source template does not exist on the hypervisor.
    #[error("Template {template_id} not found")]
    TemplateMissing {
        /// The missing template.
        template_id: u32,
    },

    /// Cloning failed for a reason other than conflict or missing template.
    #[error("Clone of instance {id} failed: {reason}")]
    CloneFailed {
        /// The identifier being cloned into.
        id: InstanceId,
        /// Description of the failure.
        reason: String,
    },

    /// The hypervisor refused to boot the instance.
    #[error("Start of instance {id} failed: {reason}")]
    StartFailed {
        /// The instance that failed to start.
        id: InstanceId,
        /// Description of the failure.
        reason: String,
    },

    /// The public URL did not answer successfully before the deadline.
    #[error("Readiness timeout: {url} not ready after {waited_secs}s")]
    ReadinessTimeout {
        /// The URL that was probed.
        url: String,
        /// How long the prober waited.
        waited_secs: u64,
    },

    /// The run was cancelled before it completed.
    #[error("Provisioning cancelled")]
    Cancelled,

    /// A best-effort teardown call failed.
    #[error("Teardown of {resource} failed: {reason}")]
    TeardownFailed {
        /// The resource being torn down.
        resource: String,
        /// Description of the failure.
        reason: String,
    },
}

impl ProvisionError {
    /// Create a new `InvalidRequest` error.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Create a new `HypervisorUnavailable` error.
    pub fn hypervisor_unavailable(reason: impl Into<String>) -> Self {
        Self::HypervisorUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a new `TunnelCreateFailed` error.
    pub fn tunnel_create_failed(reason: impl Into<String>) -> Self {
        Self::TunnelCreateFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `RoutingConfigFailed` error.
    pub fn routing_config_failed(reason: impl Into<String>) -> Self {
        Self::RoutingConfigFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `DnsLookupFailed` error.
    pub fn dns_lookup_failed(reason: impl Into<String>) -> Self {
        Self::DnsLookupFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `DnsRegisterFailed` error.
    pub fn dns_register_failed(reason: impl Into<String>) -> Self {
        Self::DnsRegisterFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `MetadataPublishFailed` error.
    pub fn metadata_publish_failed(reason: impl Into<String>) -> Self {
        Self::MetadataPublishFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `StartFailed` error.
    pub fn start_failed(id: InstanceId, reason: impl Into<String>) -> Self {
        Self::StartFailed {
            id,
            reason: reason.into(),
        }
    }

    /// Create a new `TeardownFailed` error.
    pub fn teardown_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TeardownFailed {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Stable name of the error kind, used in structured failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::UnknownApp { .. } => "UnknownApp",
            Self::SubdomainInUse { .. } => "SubdomainInUse",
            Self::PoolExhausted { .. } => "PoolExhausted",
            Self::HypervisorUnavailable { .. } => "HypervisorUnavailable",
            Self::TunnelCreateFailed { .. } => "TunnelCreateFailed",
            Self::RoutingConfigFailed { .. } => "RoutingConfigFailed",
            Self::DnsConflict { .. } => "DnsConflict",
            Self::DnsLookupFailed { .. } => "DnsLookupFailed",
            Self::DnsRegisterFailed { .. } => "DnsRegisterFailed",
            Self::MetadataPublishFailed { .. } => "MetadataPublishFailed",
            Self::CloneConflict { .. } => "CloneConflict",
            Self::TemplateMissing { .. } => "TemplateMissing",
            Self::CloneFailed { .. } => "CloneFailed",
            Self::StartFailed { .. } => "StartFailed",
            Self::ReadinessTimeout { .. } => "ReadinessTimeout",
            Self::Cancelled => "Cancelled",
            Self::TeardownFailed { .. } => "TeardownFailed",
        }
    }

    /// Returns `true` if the identifier was already taken (allocation must retry).
    pub fn is_clone_conflict(&self) -> bool {
        matches!(self, Self::CloneConflict { .. })
    }

    /// Returns `true` if the request itself was at fault rather than a backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest { .. } | Self::UnknownApp { .. } | Self::SubdomainInUse { .. }
        )
    }
}

/// A teardown action that failed while compensating or cleaning up.
///
/// These are warnings: they are attached to the terminal failure and
/// never replace its cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    /// The teardown that was attempted (e.g. `destroy_tunnel`).
    pub action: String,
    /// Why it failed.
    pub reason: String,
}

impl std::fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.action, self.reason)
    }
}

/// Terminal failure of a provisioning workflow.
#[derive(Error, Debug, Clone)]
#[error("Provisioning failed at {stage}: {cause}")]
pub struct ProvisionFailure {
    /// The stage that failed.
    pub stage: Stage,
    /// The original cause.
    #[source]
    pub cause: ProvisionError,
    /// Teardown failures encountered during compensation.
    pub warnings: Vec<CompensationFailure>,
    /// Whether compensation ran at all (it is skipped on readiness timeout by default).
    pub compensated: bool,
    /// Resources left in place when compensation was skipped.
    pub retained: Option<ProvisioningResult>,
}

impl ProvisionFailure {
    /// Create a failure without compensation warnings.
    pub fn new(stage: Stage, cause: ProvisionError) -> Self {
        Self {
            stage,
            cause,
            warnings: Vec::new(),
            compensated: false,
            retained: None,
        }
    }

    /// Returns `true` if one or more compensating teardowns failed.
    pub fn compensation_partially_failed(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Serializable view for callers.
    pub fn report(&self) -> FailureReport {
        FailureReport {
            stage: self.stage,
            kind: self.cause.kind().to_string(),
            cause: self.cause.to_string(),
            compensated: self.compensated,
            warnings: self.warnings.clone(),
            retained: self.retained.clone(),
        }
    }
}

/// The structured `{stage, cause}` failure returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Stage that failed.
    pub stage: Stage,
    /// Error kind (see [`ProvisionError::kind`]).
    pub kind: String,
    /// Human-readable cause.
    pub cause: String,
    /// Whether compensation ran.
    pub compensated: bool,
    /// Compensation failures, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<CompensationFailure>,
    /// Resources kept for inspection, if compensation was skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained: Option<ProvisioningResult>,
}
