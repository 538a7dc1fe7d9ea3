//! Configuration file structures for trialhost.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`ApiConfig`]: Token guard for mutating API endpoints

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{EdgeConfig, HypervisorConfig, MetadataConfig, ProvisionerConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [server]
/// bind_addr = "0.0.0.0:8000"
///
/// [api]
/// enabled = true
/// token = "your-secret-token"
///
/// [provisioner]
/// domain = "persys.jp"
///
/// [provisioner.pool]
/// start = 9000
/// end = 9999
///
/// [[provisioner.apps]]
/// name = "nginx"
/// template_id = 8011
/// service_port = 80
///
/// [hypervisor]
/// base_url = "https://pve.local:8006"
/// node = "odin"
/// token_id = "root@pam!trialhost"
///
/// [edge]
/// account_id = "..."
/// zone_id = "..."
///
/// [metadata]
/// base_url = "http://10.0.0.5:8080"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// API authentication.
    #[serde(default)]
    pub api: ApiConfig,

    /// Provisioning workflow configuration.
    #[serde(default)]
    pub provisioner: ProvisionerConfig,

    /// Hypervisor API.
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// Edge network API.
    #[serde(default)]
    pub edge: EdgeConfig,

    /// Metadata file server.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML or the
    /// provisioner settings are inconsistent.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })?;
        config
            .provisioner
            .validate()
            .map_err(|message| ConfigFileError::Invalid { message })?;
        Ok(config)
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:8000").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Request timeout in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
        }
    }
}

/// Token guard for endpoints that create or destroy resources.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Require a token on mutating endpoints.
    #[serde(default)]
    pub enabled: bool,

    /// Authentication token (required when enabled).
    ///
    /// Clients must include this token in the `X-Api-Token` header.
    pub token: Option<String>,
}

impl ApiConfig {
    /// Check if the token guard is properly configured.
    ///
    /// Returns `true` if enabled and token is set.
    pub fn is_configured(&self) -> bool {
        self.enabled && self.token.is_some()
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },

    /// The file parsed but the settings are inconsistent.
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn bind_addr() -> String {
        "0.0.0.0:8000".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }
}
