//! Edge network contract: tunnels and their DNS aliases.

use async_trait::async_trait;

use trialhost_common::{ProvisionError, Route, TunnelCredentials};

/// Tunnel and DNS operations on the third-party edge network.
///
/// Teardown operations are best-effort from the workflow's point of view but
/// still report failure, so the caller can attach it as a warning.
#[async_trait]
pub trait EdgeNetwork: Send + Sync {
    /// Create a tunnel named `name`, or fetch the existing one with that name.
    ///
    /// Calling this twice with the same name yields the same tunnel id; the
    /// second call reports `reused`.
    async fn create_tunnel(&self, name: &str) -> Result<TunnelCredentials, ProvisionError>;

    /// Set the ingress rule of `tunnel_id` to forward `route.hostname` to the
    /// local service port.
    async fn configure_routing(&self, tunnel_id: &str, route: &Route)
    -> Result<(), ProvisionError>;

    /// Point `hostname` at the tunnel, replacing any record that already exists.
    async fn register_dns(&self, hostname: &str, tunnel_id: &str) -> Result<(), ProvisionError>;

    /// Returns `true` if any DNS record exists for `hostname`.
    async fn dns_exists(&self, hostname: &str) -> Result<bool, ProvisionError>;

    /// Remove every DNS record for `hostname`. Absent records are not an error.
    async fn delete_dns(&self, hostname: &str) -> Result<(), ProvisionError>;

    /// Delete the tunnel. An already deleted tunnel is not an error.
    async fn destroy_tunnel(&self, tunnel_id: &str) -> Result<(), ProvisionError>;
}
