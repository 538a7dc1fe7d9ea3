//! Instance lifecycle contract.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::{debug, warn};

use trialhost_common::{InstanceId, InstanceRecord, ProvisionError};

/// Instance operations on the hypervisor.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Identifiers of every instance (and template) currently on the hypervisor.
    async fn list_instance_ids(&self) -> Result<BTreeSet<InstanceId>, ProvisionError>;

    /// Full clone of `template_id` into `new_id` with network hostname `hostname`.
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::CloneConflict`] if `new_id` is already in use
    /// - [`ProvisionError::TemplateMissing`] if the template does not exist
    /// - [`ProvisionError::CloneFailed`] otherwise; the instance may exist
    ///   partially and must still be destroyed
    async fn clone_instance(
        &self,
        template_id: u32,
        new_id: InstanceId,
        hostname: &str,
    ) -> Result<InstanceRecord, ProvisionError>;

    /// Boot the instance.
    async fn start(&self, id: InstanceId) -> Result<(), ProvisionError>;

    /// Stop the instance. Stopping a stopped instance is not an error.
    async fn stop(&self, id: InstanceId) -> Result<(), ProvisionError>;

    /// Destroy the instance. Destroying a missing instance is not an error.
    async fn destroy(&self, id: InstanceId) -> Result<(), ProvisionError>;
}

/// Stop then destroy an instance.
///
/// A failed stop is only logged since destroy may still succeed (the instance
/// may never have started).
pub async fn teardown_instance(
    hypervisor: &dyn Hypervisor,
    id: InstanceId,
) -> Result<(), ProvisionError> {
    if let Err(e) = hypervisor.stop(id).await {
        warn!(vmid = %id, error = %e, "Stop before destroy failed");
    }
    hypervisor.destroy(id).await?;
    debug!(vmid = %id, "Instance destroyed");
    Ok(())
}
