//! Provisioning orchestrator.
//!
//! Runs one request as a sequential workflow:
//!
//! ```text
//! Validating → Allocating → TunnelCreating → RoutingConfiguring → DnsRegistering
//!   → MetadataPublishing → InstanceCloning → InstanceStarting → WaitingReady → Succeeded
//! ```
//!
//! Each step starts only after the previous one returned success. A failure at
//! any step ends the run at that stage and unwinds the compensation stack, so
//! a failed run leaves nothing behind. A readiness timeout is the exception:
//! by default the resources are kept and reported as `retained`.
//!
//! Cancellation is checked at every stage boundary and during the readiness
//! wait. A cancelled run fails with [`ProvisionError::Cancelled`] and unwinds
//! like any other failure; a step already in flight completes first.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use trialhost_common::types::validate_subdomain;
use trialhost_common::{
    AppTemplate, DeprovisionReport, DeprovisionRequest, InstanceId, MetadataDocument,
    ProvisionError, ProvisionFailure, ProvisionerConfig, ProvisioningRequest, ProvisioningResult,
    Route, Stage, SubdomainPolicy, TunnelCredentials,
};

use crate::allocator::IdentifierPool;
use crate::compensation::{Compensation, CompensationStack};
use crate::edge::EdgeNetwork;
use crate::lifecycle::Hypervisor;
use crate::metadata::{MetadataStore, publish_confirmed};
use crate::readiness::{Probe, ReadinessProber};
use crate::retry::RetryPolicy;

/// Observer of workflow stage transitions.
pub type ProgressFn<'a> = dyn Fn(Stage) + Send + Sync + 'a;

/// The external systems a [`Provisioner`] drives.
#[derive(Clone)]
pub struct Backends {
    pub pool: Arc<dyn IdentifierPool>,
    pub edge: Arc<dyn EdgeNetwork>,
    pub metadata: Arc<dyn MetadataStore>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Per-run state: the current stage and what to undo.
struct Workflow<'a> {
    stage: Stage,
    stack: CompensationStack,
    progress: &'a ProgressFn<'a>,
    cancel: &'a CancellationToken,
    /// Result to report if readiness times out and resources are kept.
    pending: Option<ProvisioningResult>,
}

impl<'a> Workflow<'a> {
    fn new(progress: &'a ProgressFn<'a>, cancel: &'a CancellationToken) -> Self {
        Self {
            stage: Stage::Validating,
            stack: CompensationStack::new(),
            progress,
            cancel,
            pending: None,
        }
    }

    /// Move to `stage`, unless the run has been cancelled.
    fn enter(&mut self, stage: Stage) -> Result<(), ProvisionError> {
        if self.cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        self.report(stage);
        Ok(())
    }

    fn report(&mut self, stage: Stage) {
        debug!(stage = %stage, "Entering stage");
        self.stage = stage;
        (self.progress)(stage);
    }
}

/// Provisions and deprovisions trial environments.
#[derive(Debug, Clone)]
pub struct Provisioner {
    config: ProvisionerConfig,
    backends: Backends,
    retry: RetryPolicy,
    prober: ReadinessProber,
}

impl Provisioner {
    pub fn new(config: ProvisionerConfig, backends: Backends) -> Self {
        let retry = RetryPolicy::from(config.retry);
        let prober =
            ReadinessProber::new(backends.probe.clone(), config.readiness.attempt_timeout());
        Self {
            config,
            backends,
            retry,
            prober,
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Provision a trial environment.
    pub async fn provision(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResult, ProvisionFailure> {
        self.provision_with_progress(request, &|_: Stage| {}).await
    }

    /// Provision a trial environment, reporting each stage to `progress`.
    pub async fn provision_with_progress(
        &self,
        request: &ProvisioningRequest,
        progress: &ProgressFn<'_>,
    ) -> Result<ProvisioningResult, ProvisionFailure> {
        self.provision_cancellable(request, progress, &CancellationToken::new())
            .await
    }

    /// Provision a trial environment until `cancel` fires.
    ///
    /// Cancelling does not abort in place: the run stops at the next stage
    /// boundary (or leaves the readiness wait) and compensates everything
    /// created so far before returning `Cancelled`. Callers must keep
    /// polling the future after cancelling.
    #[instrument(
        skip(self, request, progress, cancel),
        fields(subdomain = %request.subdomain, oss_type = %request.oss_type)
    )]
    pub async fn provision_cancellable(
        &self,
        request: &ProvisioningRequest,
        progress: &ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProvisioningResult, ProvisionFailure> {
        let mut workflow = Workflow::new(progress, cancel);

        match self.run(request, &mut workflow).await {
            Ok(result) => {
                info!(
                    vmid = %result.identifier,
                    tunnel_id = %result.tunnel_id,
                    url = %result.public_url,
                    "Provisioning succeeded"
                );
                Ok(result)
            }
            Err(cause) => Err(self.fail(workflow, cause).await),
        }
    }

    async fn run(
        &self,
        request: &ProvisioningRequest,
        workflow: &mut Workflow<'_>,
    ) -> Result<ProvisioningResult, ProvisionError> {
        let edge = self.backends.edge.as_ref();
        let pool = self.backends.pool.as_ref();
        let hypervisor = self.backends.hypervisor.as_ref();
        let metadata = self.backends.metadata.as_ref();

        workflow.enter(Stage::Validating)?;
        let app = self.validate(request).await?;
        let public_hostname = self.config.public_hostname(&request.subdomain);
        let instance_hostname = request.subdomain.as_str();

        workflow.enter(Stage::Allocating)?;
        let mut excluded = BTreeSet::new();
        let mut id = pool.allocate(&excluded).await?;
        workflow.stack.push(Compensation::ReleaseIdentifier(id));

        workflow.enter(Stage::TunnelCreating)?;
        let credentials = edge
            .create_tunnel(&self.config.tunnel_name(&request.subdomain))
            .await?;
        if credentials.reused && self.config.subdomain_policy == SubdomainPolicy::Reject {
            // Another run owns this tunnel; leave it alone.
            warn!(tunnel_id = %credentials.tunnel_id, "Tunnel already exists for subdomain");
            return Err(ProvisionError::SubdomainInUse {
                hostname: public_hostname,
            });
        }
        workflow.stack.push(Compensation::DestroyTunnel {
            tunnel_id: credentials.tunnel_id.clone(),
        });
        info!(tunnel_id = %credentials.tunnel_id, "Tunnel ready");

        workflow.enter(Stage::RoutingConfiguring)?;
        let route = Route {
            hostname: public_hostname.clone(),
            service_port: app.service_port,
            transport: self.config.transport,
        };
        {
            let tunnel_id = credentials.tunnel_id.as_str();
            let route = &route;
            self.retry
                .run("configure_routing", move || {
                    edge.configure_routing(tunnel_id, route)
                })
                .await?;
        }

        workflow.enter(Stage::DnsRegistering)?;
        edge.register_dns(&public_hostname, &credentials.tunnel_id).await?;
        workflow.stack.push(Compensation::DeleteDns {
            hostname: public_hostname.clone(),
        });

        workflow.enter(Stage::MetadataPublishing)?;
        let mut document = self.document(request, &app, id, &credentials);
        publish_confirmed(metadata, instance_hostname, &document, &self.retry).await?;
        workflow.stack.push(Compensation::UnpublishMetadata {
            hostname: instance_hostname.to_string(),
        });

        workflow.enter(Stage::InstanceCloning)?;
        let mut attempts = 1;
        loop {
            match hypervisor
                .clone_instance(app.template_id, id, instance_hostname)
                .await
            {
                Ok(record) => {
                    debug!(vmid = %record.id, state = ?record.state, "Instance cloned");
                    break;
                }
                Err(e) if e.is_clone_conflict() && attempts < self.config.max_clone_attempts => {
                    warn!(vmid = %id, attempt = attempts, "Identifier taken, allocating another");
                    excluded.insert(id);
                    workflow.stack.forget_identifier(id);
                    pool.release(id);

                    id = pool.allocate(&excluded).await?;
                    workflow.stack.push(Compensation::ReleaseIdentifier(id));

                    document.vmid = id;
                    workflow.enter(Stage::MetadataPublishing)?;
                    publish_confirmed(metadata, instance_hostname, &document, &self.retry).await?;
                    workflow.enter(Stage::InstanceCloning)?;
                    attempts += 1;
                }
                Err(e) => {
                    if matches!(e, ProvisionError::CloneFailed { .. }) {
                        // The hypervisor may still be creating it.
                        workflow.stack.push(Compensation::DestroyInstance(id));
                    }
                    return Err(e);
                }
            }
        }
        pool.confirm(id);
        workflow.stack.forget_identifier(id);
        workflow.stack.push(Compensation::DestroyInstance(id));

        workflow.enter(Stage::InstanceStarting)?;
        hypervisor.start(id).await?;
        info!(vmid = %id, "Instance started");

        let result = ProvisioningResult {
            identifier: id,
            public_url: self.config.public_url(&request.subdomain),
            tunnel_id: credentials.tunnel_id.clone(),
            subdomain: request.subdomain.clone(),
            oss_type: request.oss_type.clone(),
            duration_days: request.duration_days,
            customer_email: request.customer_email.clone(),
        };
        workflow.pending = Some(result.clone());

        workflow.enter(Stage::WaitingReady)?;
        let readiness = &self.config.readiness;
        let report = tokio::select! {
            report = self.prober.wait_until_ready(
                &result.public_url,
                readiness.timeout(),
                readiness.interval(),
            ) => report,
            () = workflow.cancel.cancelled() => return Err(ProvisionError::Cancelled),
        };
        if !report.ready {
            return Err(ProvisionError::ReadinessTimeout {
                url: result.public_url.clone(),
                waited_secs: report.elapsed.as_secs(),
            });
        }

        workflow.report(Stage::Succeeded);
        Ok(result)
    }

    async fn validate(&self, request: &ProvisioningRequest) -> Result<AppTemplate, ProvisionError> {
        request.validate()?;
        let app = self
            .config
            .app(&request.oss_type)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownApp {
                oss_type: request.oss_type.clone(),
            })?;

        let hostname = self.config.public_hostname(&request.subdomain);
        if self.backends.edge.dns_exists(&hostname).await? {
            match self.config.subdomain_policy {
                SubdomainPolicy::Reject => {
                    return Err(ProvisionError::SubdomainInUse { hostname });
                }
                SubdomainPolicy::Reclaim => {
                    warn!(hostname = %hostname, "Subdomain has stale DNS, reclaiming");
                }
            }
        }

        Ok(app)
    }

    fn document(
        &self,
        request: &ProvisioningRequest,
        app: &AppTemplate,
        id: InstanceId,
        credentials: &TunnelCredentials,
    ) -> MetadataDocument {
        MetadataDocument {
            vmid: id,
            hostname: request.subdomain.clone(),
            subdomain: request.subdomain.clone(),
            domain: self.config.domain.clone(),
            customer_email: request.customer_email.clone(),
            oss_type: request.oss_type.clone(),
            url: self.config.public_url(&request.subdomain),
            tunnel_id: credentials.tunnel_id.clone(),
            tunnel_token: credentials.token.clone(),
            service_port: app.service_port,
            duration_days: request.duration_days,
            tunnel_protocol: self.config.transport.preferred,
            tunnel_protocol_fallback: self.config.transport.fallback,
            created_at: Utc::now().trunc_subsecs(0),
        }
    }

    async fn fail(&self, workflow: Workflow<'_>, cause: ProvisionError) -> ProvisionFailure {
        let stage = workflow.stage;
        if matches!(cause, ProvisionError::Cancelled) {
            warn!(stage = %stage, "Provisioning cancelled, rolling back");
        } else {
            error!(stage = %stage, error = %cause, "Provisioning step failed");
        }

        let keep = matches!(cause, ProvisionError::ReadinessTimeout { .. })
            && !self.config.rollback_on_readiness_timeout;
        let mut failure = ProvisionFailure::new(stage, cause);

        if keep {
            warn!("Keeping resources after readiness timeout");
            failure.retained = workflow.pending;
            return failure;
        }

        if !workflow.stack.is_empty() {
            failure.warnings = workflow.stack.unwind(&self.backends).await;
            failure.compensated = true;
            if failure.compensation_partially_failed() {
                warn!(
                    failed = failure.warnings.len(),
                    "Compensation partially failed"
                );
            }
        }

        failure
    }

    /// Tear down every resource of a provisioned trial.
    ///
    /// Every teardown runs even if an earlier one fails.
    #[instrument(skip(self), fields(vmid = %request.identifier, subdomain = %request.subdomain))]
    pub async fn deprovision(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionReport, ProvisionError> {
        validate_subdomain(&request.subdomain)?;

        let mut stack = CompensationStack::new();
        if !request.tunnel_id.is_empty() {
            stack.push(Compensation::DestroyTunnel {
                tunnel_id: request.tunnel_id.clone(),
            });
        }
        stack.push(Compensation::DeleteDns {
            hostname: self.config.public_hostname(&request.subdomain),
        });
        stack.push(Compensation::UnpublishMetadata {
            hostname: request.subdomain.clone(),
        });
        stack.push(Compensation::DestroyInstance(request.identifier));

        let warnings = stack.unwind(&self.backends).await;
        if warnings.is_empty() {
            info!("Deprovisioned");
        } else {
            warn!(failed = warnings.len(), "Deprovisioned with warnings");
        }

        Ok(DeprovisionReport {
            identifier: Some(request.identifier),
            warnings,
        })
    }

    /// Returns `true` if no DNS record exists yet for the subdomain.
    pub async fn check_subdomain(&self, subdomain: &str) -> Result<bool, ProvisionError> {
        validate_subdomain(subdomain)?;
        let hostname = self.config.public_hostname(subdomain);
        let exists = self.backends.edge.dns_exists(&hostname).await?;
        Ok(!exists)
    }
}
