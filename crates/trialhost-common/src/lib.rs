//! Common types, errors, and configuration for trialhost.
//!
//! This crate provides shared functionality used across the trialhost workspace:
//! - Error types using `thiserror` for the provisioning failure taxonomy
//! - The provisioning data model (request, metadata document, result)
//! - Configuration structures for the workflow and its external systems

pub mod config;
pub mod config_file;
pub mod error;
pub mod types;

pub use config::{
    AppTemplate, EdgeConfig, HypervisorConfig, MetadataConfig, PoolConfig, ProvisionerConfig,
    ReadinessConfig, RetryConfig, SubdomainPolicy,
};
pub use config_file::{ApiConfig, ConfigFile, ConfigFileError, ServerConfigFile};
pub use error::{CompensationFailure, FailureReport, ProvisionError, ProvisionFailure};
pub use types::{
    DeprovisionReport, DeprovisionRequest, InstanceId, InstanceRecord, InstanceState,
    MetadataDocument, ProvisioningRequest, ProvisioningResult, Route, Stage, TransportPolicy,
    TransportProtocol, TunnelCredentials, TunnelToken,
};
