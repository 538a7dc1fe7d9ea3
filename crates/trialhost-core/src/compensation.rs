//! Compensation stack.
//!
//! Each successful step pushes the action that reverses it. On failure the
//! stack is unwound newest first. Every action runs even if an earlier one
//! failed; failures come back as [`CompensationFailure`] warnings.

use std::fmt;

use tracing::{debug, warn};

use trialhost_common::{CompensationFailure, InstanceId};

use crate::lifecycle::teardown_instance;
use crate::orchestrator::Backends;

/// Reverses one provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Return an identifier that never got an instance.
    ReleaseIdentifier(InstanceId),
    DestroyTunnel { tunnel_id: String },
    DeleteDns { hostname: String },
    UnpublishMetadata { hostname: String },
    /// Stop and destroy a cloned instance.
    DestroyInstance(InstanceId),
}

impl Compensation {
    /// Stable action name used in logs and warnings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReleaseIdentifier(_) => "release_identifier",
            Self::DestroyTunnel { .. } => "destroy_tunnel",
            Self::DeleteDns { .. } => "delete_dns",
            Self::UnpublishMetadata { .. } => "unpublish_metadata",
            Self::DestroyInstance(_) => "destroy_instance",
        }
    }

    async fn run(&self, backends: &Backends) -> Result<(), trialhost_common::ProvisionError> {
        match self {
            Self::ReleaseIdentifier(id) => {
                backends.pool.release(*id);
                Ok(())
            }
            Self::DestroyTunnel { tunnel_id } => backends.edge.destroy_tunnel(tunnel_id).await,
            Self::DeleteDns { hostname } => backends.edge.delete_dns(hostname).await,
            Self::UnpublishMetadata { hostname } => backends.metadata.unpublish(hostname).await,
            Self::DestroyInstance(id) => teardown_instance(backends.hypervisor.as_ref(), *id).await,
        }
    }
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReleaseIdentifier(id) | Self::DestroyInstance(id) => {
                write!(f, "{}({id})", self.name())
            }
            Self::DestroyTunnel { tunnel_id } => write!(f, "{}({tunnel_id})", self.name()),
            Self::DeleteDns { hostname } | Self::UnpublishMetadata { hostname } => {
                write!(f, "{}({hostname})", self.name())
            }
        }
    }
}

/// Teardowns for everything created so far, in creation order.
#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        debug!(action = %action, "Compensation registered");
        self.actions.push(action);
    }

    /// Drop the release of `id`: an instance exists under it now.
    pub fn forget_identifier(&mut self, id: InstanceId) {
        self.actions
            .retain(|action| action != &Compensation::ReleaseIdentifier(id));
    }

    pub fn actions(&self) -> &[Compensation] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every registered teardown, newest first.
    pub async fn unwind(self, backends: &Backends) -> Vec<CompensationFailure> {
        let mut failures = Vec::new();

        for action in self.actions.into_iter().rev() {
            match action.run(backends).await {
                Ok(()) => debug!(action = %action, "Compensated"),
                Err(e) => {
                    warn!(action = %action, error = %e, "Compensation failed");
                    failures.push(CompensationFailure {
                        action: action.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        failures
    }
}
