//! HTTP clients for the external systems trialhost drives.
//!
//! - [`CloudflareEdge`]: Tunnels, ingress and DNS
//! - [`ProxmoxHypervisor`]: Container clone and lifecycle
//! - [`FileServerStore`]: Metadata documents
//! - [`HttpProbe`]: Readiness checks against the public URL
//!
//! [`production_backends`] wires them into the [`Backends`] the provisioner runs on.

pub mod cloudflare;
pub mod error;
pub mod fileserver;
mod http;
pub mod probe;
pub mod proxmox;

use std::sync::Arc;

use tracing::info;

use trialhost_common::ConfigFile;
use trialhost_core::{Backends, Hypervisor, PoolAllocator, RetryPolicy};

pub use cloudflare::CloudflareEdge;
pub use error::ApiError;
pub use fileserver::FileServerStore;
pub use probe::HttpProbe;
pub use proxmox::ProxmoxHypervisor;

/// Build the backends for a real deployment from the loaded configuration.
pub fn production_backends(config: &ConfigFile) -> Result<Backends, ApiError> {
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(ProxmoxHypervisor::new(&config.hypervisor)?);
    let pool = Arc::new(PoolAllocator::new(config.provisioner.pool, hypervisor.clone()));
    let edge = CloudflareEdge::new(&config.edge, RetryPolicy::from(config.provisioner.retry))?;
    let metadata = FileServerStore::new(&config.metadata)?;
    let probe = HttpProbe::new(&config.provisioner.readiness)?;

    info!(
        hypervisor = %config.hypervisor.base_url,
        node = %config.hypervisor.node,
        metadata = %config.metadata.base_url,
        "Production backends configured"
    );

    Ok(Backends {
        pool,
        edge: Arc::new(edge),
        metadata: Arc::new(metadata),
        hypervisor,
        probe: Arc::new(probe),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_backends_require_credentials() {
        let config = ConfigFile::default();
        assert!(matches!(
            production_backends(&config),
            Err(ApiError::Config { .. })
        ));
    }

    #[test]
    fn test_production_backends() {
        let config = ConfigFile::from_toml(
            r#"
            [hypervisor]
            token_id = "root@pam!trial"
            token_secret = "secret"

            [edge]
            api_token = "cf"
            account_id = "acc"
            zone_id = "zone"
            "#,
        )
        .unwrap();
        assert!(production_backends(&config).is_ok());
    }
}
