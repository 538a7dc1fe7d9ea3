//! Integration tests for trialhost-core.
//!
//! These tests drive the full workflow against the simulated cloud:
//! - End-to-end success and the stages reported on the way
//! - Failure injection at every stage and the rollback that follows
//! - Readiness timeout with and without rollback
//! - Identifier conflicts and concurrent allocation
//! - Deprovisioning and subdomain checks
//! - Cancellation, which rolls back instead of stopping in place

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use trialhost_common::{
    DeprovisionRequest, InstanceId, InstanceRecord, InstanceState, MetadataDocument, PoolConfig,
    ProvisionError, ProvisionerConfig, ProvisioningRequest, ReadinessConfig, RetryConfig, Stage,
    SubdomainPolicy,
};
use trialhost_core::metadata::publish_confirmed;
use trialhost_core::{
    Backends, EdgeNetwork, Hypervisor, IdentifierPool, MetadataStore, Operation, PoolAllocator,
    Provisioner, RetryPolicy, SimulatedCloud,
};

// ============================================================================
// Helpers
// ============================================================================

fn config(pool: PoolConfig) -> ProvisionerConfig {
    ProvisionerConfig {
        pool,
        readiness: ReadinessConfig {
            timeout_secs: 10,
            interval_secs: 2,
            attempt_timeout_secs: 1,
            ..Default::default()
        },
        retry: RetryConfig {
            attempts: 3,
            interval_ms: 10,
        },
        ..Default::default()
    }
}

fn request(subdomain: &str) -> ProvisioningRequest {
    ProvisioningRequest {
        customer_email: "test@example.com".into(),
        oss_type: "nginx".into(),
        subdomain: subdomain.into(),
        duration_days: 7,
    }
}

fn cloud() -> Arc<SimulatedCloud> {
    Arc::new(SimulatedCloud::new().with_template(8011))
}

fn provisioner(cloud: &Arc<SimulatedCloud>) -> Provisioner {
    let config = config(PoolConfig::default());
    Provisioner::new(config, cloud.backends(PoolConfig::default()))
}

/// Counts releases on top of a real allocator.
struct CountingPool {
    inner: PoolAllocator,
    releases: AtomicUsize,
}

#[async_trait]
impl IdentifierPool for CountingPool {
    async fn allocate(
        &self,
        excluded: &BTreeSet<InstanceId>,
    ) -> Result<InstanceId, ProvisionError> {
        self.inner.allocate(excluded).await
    }

    fn confirm(&self, id: InstanceId) {
        self.inner.confirm(id);
    }

    fn release(&self, id: InstanceId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(id);
    }
}

/// Hands out the lowest identifier not excluded, ignoring live instances,
/// like a process whose view of the hypervisor is stale.
struct StalePool {
    pool: PoolConfig,
}

#[async_trait]
impl IdentifierPool for StalePool {
    async fn allocate(
        &self,
        excluded: &BTreeSet<InstanceId>,
    ) -> Result<InstanceId, ProvisionError> {
        trialhost_core::allocator::lowest_free(self.pool, |id| excluded.contains(&id)).ok_or(
            ProvisionError::PoolExhausted {
                start: self.pool.start,
                end: self.pool.end,
            },
        )
    }

    fn confirm(&self, _id: InstanceId) {}

    fn release(&self, _id: InstanceId) {}
}

/// Clones into the simulated cloud, then reports failure, like a clone task
/// that outlives its wait.
struct SlowCloneHypervisor {
    cloud: Arc<SimulatedCloud>,
}

#[async_trait]
impl Hypervisor for SlowCloneHypervisor {
    async fn list_instance_ids(&self) -> Result<BTreeSet<InstanceId>, ProvisionError> {
        self.cloud.list_instance_ids().await
    }

    async fn clone_instance(
        &self,
        template_id: u32,
        new_id: InstanceId,
        hostname: &str,
    ) -> Result<InstanceRecord, ProvisionError> {
        self.cloud
            .clone_instance(template_id, new_id, hostname)
            .await?;
        Err(ProvisionError::CloneFailed {
            id: new_id,
            reason: "Request timed out".into(),
        })
    }

    async fn start(&self, id: InstanceId) -> Result<(), ProvisionError> {
        self.cloud.start(id).await
    }

    async fn stop(&self, id: InstanceId) -> Result<(), ProvisionError> {
        self.cloud.stop(id).await
    }

    async fn destroy(&self, id: InstanceId) -> Result<(), ProvisionError> {
        self.cloud.destroy(id).await
    }
}

/// Accepts the first publish and rejects every later one.
struct FirstPublishOnly {
    cloud: Arc<SimulatedCloud>,
    publishes: AtomicUsize,
}

#[async_trait]
impl MetadataStore for FirstPublishOnly {
    async fn publish(
        &self,
        hostname: &str,
        document: &MetadataDocument,
    ) -> Result<(), ProvisionError> {
        if self.publishes.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(ProvisionError::metadata_publish_failed("upload rejected"));
        }
        self.cloud.publish(hostname, document).await
    }

    async fn fetch(&self, hostname: &str) -> Result<Option<MetadataDocument>, ProvisionError> {
        self.cloud.fetch(hostname).await
    }

    async fn unpublish(&self, hostname: &str) -> Result<(), ProvisionError> {
        self.cloud.unpublish(hostname).await
    }

    fn document_url(&self, hostname: &str) -> String {
        self.cloud.document_url(hostname)
    }
}

// ============================================================================
// Test: End-to-end
// ============================================================================

#[tokio::test]
async fn test_provision_demo_succeeds() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);

    let stages = Mutex::new(Vec::new());
    let progress = |stage: Stage| stages.lock().unwrap().push(stage);
    let result = assert_ok!(
        provisioner
            .provision_with_progress(&request("demo"), &progress)
            .await
    );

    assert_eq!(result.identifier, InstanceId::new(9000));
    assert_eq!(result.public_url, "https://demo.persys.jp");
    assert_eq!(result.oss_type, "nginx");
    assert_eq!(result.duration_days, 7);

    let stages = stages.into_inner().unwrap();
    let mut expected = Stage::STEPS.to_vec();
    expected.push(Stage::Succeeded);
    assert_eq!(stages, expected);

    let instance = cloud.instance(InstanceId::new(9000)).unwrap();
    assert_eq!(instance.state, InstanceState::Running);
    assert_eq!(instance.hostname, "demo");
    assert_eq!(cloud.dns_record("demo.persys.jp"), Some(result.tunnel_id.clone()));

    let route = cloud.route(&result.tunnel_id).unwrap();
    assert_eq!(route.service_url(), "http://localhost:80");

    let document = cloud.fetch("demo").await.unwrap().unwrap();
    assert_eq!(document.vmid, InstanceId::new(9000));
    assert_eq!(document.tunnel_id, result.tunnel_id);
    assert_eq!(document.url, "https://demo.persys.jp");
    assert_eq!(document.domain, "persys.jp");
}

#[tokio::test]
async fn test_metadata_published_before_boot() {
    let cloud = cloud();
    provisioner(&cloud).provision(&request("demo")).await.unwrap();

    let journal = cloud.journal();
    let position = |op| journal.iter().position(|o| *o == op).unwrap();
    assert!(position(Operation::Publish) < position(Operation::Fetch));
    assert!(position(Operation::Fetch) < position(Operation::Clone));
    assert!(position(Operation::Clone) < position(Operation::Start));
    assert!(position(Operation::ConfigureRouting) < position(Operation::RegisterDns));
}

// ============================================================================
// Test: Failure and rollback
// ============================================================================

#[tokio::test]
async fn test_dns_failure_rolls_back_tunnel_and_identifier() {
    let cloud = cloud();
    let pool = Arc::new(CountingPool {
        inner: PoolAllocator::new(PoolConfig::default(), cloud.clone()),
        releases: AtomicUsize::new(0),
    });
    let backends = Backends {
        pool: pool.clone(),
        ..cloud.backends(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config(PoolConfig::default()), backends);
    cloud.fail_on(Operation::RegisterDns);

    let failure = assert_err!(provisioner.provision(&request("demo")).await);

    assert_eq!(failure.stage, Stage::DnsRegistering);
    assert_eq!(failure.cause.kind(), "DnsRegisterFailed");
    assert!(failure.compensated);
    assert_eq!(cloud.calls(Operation::DestroyTunnel), 1);
    assert_eq!(pool.releases.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.calls(Operation::Clone), 0);
    assert!(cloud.is_empty());
    assert!(pool.inner.reserved().is_empty());
}

#[tokio::test]
async fn test_failure_at_each_stage_leaves_nothing_behind() {
    let cases = [
        (Operation::DnsExists, Stage::Validating),
        (Operation::ListInstances, Stage::Allocating),
        (Operation::CreateTunnel, Stage::TunnelCreating),
        (Operation::ConfigureRouting, Stage::RoutingConfiguring),
        (Operation::RegisterDns, Stage::DnsRegistering),
        (Operation::Publish, Stage::MetadataPublishing),
        (Operation::Clone, Stage::InstanceCloning),
        (Operation::Start, Stage::InstanceStarting),
    ];

    for (operation, stage) in cases {
        let cloud = cloud();
        let provisioner = provisioner(&cloud);
        cloud.fail_on(operation);

        let failure = provisioner.provision(&request("demo")).await.unwrap_err();

        assert_eq!(failure.stage, stage, "fault in {operation:?}");
        assert!(failure.warnings.is_empty(), "fault in {operation:?}");
        assert!(cloud.is_empty(), "orphaned resources after fault in {operation:?}");
    }
}

#[tokio::test]
async fn test_compensation_failure_does_not_mask_cause() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    cloud.fail_on(Operation::Start);
    cloud.fail_on(Operation::Unpublish);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::InstanceStarting);
    assert_eq!(failure.cause.kind(), "StartFailed");
    assert!(failure.compensation_partially_failed());
    assert_eq!(failure.warnings.len(), 1);
    assert_eq!(failure.warnings[0].action, "unpublish_metadata(demo)");

    // The remaining teardowns still ran.
    assert!(cloud.instance(InstanceId::new(9000)).is_none());
    assert_eq!(cloud.tunnel_count(), 0);
    assert!(cloud.dns_record("demo.persys.jp").is_none());
}

#[tokio::test]
async fn test_transient_routing_failure_is_retried() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    cloud.fail_times(Operation::ConfigureRouting, 2);

    assert_ok!(provisioner.provision(&request("demo")).await);
    assert_eq!(cloud.calls(Operation::ConfigureRouting), 3);
}

#[tokio::test]
async fn test_invalid_request_rejected_before_allocation() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);

    let failure = provisioner
        .provision(&request("Not_Valid"))
        .await
        .unwrap_err();
    assert_eq!(failure.stage, Stage::Validating);
    assert!(failure.cause.is_client_error());

    let mut unknown = request("demo");
    unknown.oss_type = "wordpress".into();
    let failure = provisioner.provision(&unknown).await.unwrap_err();
    assert_eq!(failure.cause.kind(), "UnknownApp");

    assert_eq!(cloud.calls(Operation::ListInstances), 0);
    assert!(!failure.compensated);
}

#[tokio::test]
async fn test_failed_clone_destroys_partial_instance() {
    let cloud = cloud();
    let backends = Backends {
        hypervisor: Arc::new(SlowCloneHypervisor {
            cloud: cloud.clone(),
        }),
        ..cloud.backends(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config(PoolConfig::default()), backends);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::InstanceCloning);
    assert_eq!(failure.cause.kind(), "CloneFailed");
    assert!(failure.warnings.is_empty());
    assert!(cloud.instance(InstanceId::new(9000)).is_none());
    assert!(cloud.is_empty());
}

// ============================================================================
// Test: Readiness timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_keeps_resources() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    cloud.fail_on(Operation::Probe);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::WaitingReady);
    assert!(matches!(
        failure.cause,
        ProvisionError::ReadinessTimeout { waited_secs: 10, .. }
    ));
    assert!(!failure.compensated);

    let retained = failure.retained.unwrap();
    assert_eq!(retained.identifier, InstanceId::new(9000));
    assert!(cloud.instance(InstanceId::new(9000)).is_some());
    assert_eq!(cloud.tunnel_count(), 1);
    assert!(cloud.has_document("demo"));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_with_rollback() {
    let cloud = cloud();
    let config = ProvisionerConfig {
        rollback_on_readiness_timeout: true,
        ..config(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config, cloud.backends(PoolConfig::default()));
    cloud.fail_on(Operation::Probe);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::WaitingReady);
    assert!(failure.compensated);
    assert!(failure.retained.is_none());
    assert!(cloud.is_empty());
}

// ============================================================================
// Test: Identifier conflicts
// ============================================================================

#[tokio::test]
async fn test_clone_conflict_retries_with_next_identifier() {
    let cloud = cloud();
    cloud.insert_instance(InstanceId::new(9000), "other");
    let backends = Backends {
        pool: Arc::new(StalePool {
            pool: PoolConfig::default(),
        }),
        ..cloud.backends(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config(PoolConfig::default()), backends);

    let result = assert_ok!(provisioner.provision(&request("demo")).await);

    assert_eq!(result.identifier, InstanceId::new(9001));
    let document = cloud.fetch("demo").await.unwrap().unwrap();
    assert_eq!(document.vmid, InstanceId::new(9001));
    assert_eq!(cloud.instance(InstanceId::new(9000)).unwrap().hostname, "other");
}

#[tokio::test]
async fn test_clone_conflict_gives_up_after_max_attempts() {
    let cloud = cloud();
    for id in 9000..9005 {
        cloud.insert_instance(InstanceId::new(id), "other");
    }
    let config = ProvisionerConfig {
        max_clone_attempts: 3,
        ..config(PoolConfig::default())
    };
    let backends = Backends {
        pool: Arc::new(StalePool {
            pool: PoolConfig::default(),
        }),
        ..cloud.backends(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config, backends);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::InstanceCloning);
    assert!(failure.cause.is_clone_conflict());
    assert_eq!(cloud.calls(Operation::Clone), 3);
    assert_eq!(cloud.tunnel_count(), 0);
    assert!(!cloud.has_document("demo"));
}

#[tokio::test]
async fn test_republish_failure_reported_at_metadata_stage() {
    let cloud = cloud();
    cloud.insert_instance(InstanceId::new(9000), "other");
    let backends = Backends {
        pool: Arc::new(StalePool {
            pool: PoolConfig::default(),
        }),
        metadata: Arc::new(FirstPublishOnly {
            cloud: cloud.clone(),
            publishes: AtomicUsize::new(0),
        }),
        ..cloud.backends(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config(PoolConfig::default()), backends);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::MetadataPublishing);
    assert_eq!(failure.cause.kind(), "MetadataPublishFailed");
    assert_eq!(cloud.instance(InstanceId::new(9000)).unwrap().hostname, "other");
    assert_eq!(cloud.tunnel_count(), 0);
    assert!(!cloud.has_document("demo"));
}

async fn run_concurrently(provisioners: Vec<Arc<Provisioner>>) -> (Vec<InstanceId>, usize) {
    let handles: Vec<_> = provisioners
        .into_iter()
        .enumerate()
        .map(|(i, provisioner)| {
            tokio::spawn(async move { provisioner.provision(&request(&format!("t{i}"))).await })
        })
        .collect();

    let mut ids = Vec::new();
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => ids.push(result.identifier),
            Err(failure) => {
                assert_eq!(failure.cause.kind(), "PoolExhausted", "{failure}");
                exhausted += 1;
            }
        }
    }
    (ids, exhausted)
}

fn small_pool_config() -> (PoolConfig, ProvisionerConfig) {
    let pool = PoolConfig {
        start: 9000,
        end: 9004,
    };
    let config = ProvisionerConfig {
        max_clone_attempts: 10,
        ..config(pool)
    };
    (pool, config)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation_independent_allocators() {
    let cloud = cloud();
    let (pool, config) = small_pool_config();

    // One allocator per workflow: only clone verification prevents duplicates.
    let provisioners = (0..8)
        .map(|_| Arc::new(Provisioner::new(config.clone(), cloud.backends(pool))))
        .collect();
    let (ids, exhausted) = run_concurrently(provisioners).await;

    let distinct: BTreeSet<_> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 5);
    assert_eq!(distinct.len(), 5);
    assert_eq!(exhausted, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation_shared_allocator() {
    let cloud = cloud();
    let (pool, config) = small_pool_config();

    let shared = Arc::new(Provisioner::new(config, cloud.backends(pool)));
    let provisioners = (0..8).map(|_| shared.clone()).collect();
    let (ids, exhausted) = run_concurrently(provisioners).await;

    let distinct: BTreeSet<_> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), ids.len());
    assert_eq!(ids.len(), 5);
    assert_eq!(exhausted, 3);
}

// ============================================================================
// Test: Subdomain in use
// ============================================================================

async fn leave_stale_dns(cloud: &SimulatedCloud) -> String {
    let stale = cloud.create_tunnel("trial-demo").await.unwrap();
    cloud
        .register_dns("demo.persys.jp", &stale.tunnel_id)
        .await
        .unwrap();
    stale.tunnel_id
}

#[tokio::test]
async fn test_subdomain_in_use_rejected() {
    let cloud = cloud();
    leave_stale_dns(&cloud).await;
    let provisioner = provisioner(&cloud);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::Validating);
    assert_eq!(
        failure.cause,
        ProvisionError::SubdomainInUse {
            hostname: "demo.persys.jp".into()
        }
    );
    assert_eq!(cloud.calls(Operation::ListInstances), 0);
    assert_eq!(cloud.tunnel_count(), 1);
}

#[tokio::test]
async fn test_tunnel_owned_by_another_run_left_alone() {
    let cloud = cloud();
    // Another run created the tunnel but has not registered DNS yet.
    let other = cloud.create_tunnel("trial-demo").await.unwrap();
    let provisioner = provisioner(&cloud);

    let failure = provisioner.provision(&request("demo")).await.unwrap_err();

    assert_eq!(failure.stage, Stage::TunnelCreating);
    assert_eq!(failure.cause.kind(), "SubdomainInUse");
    assert_eq!(cloud.calls(Operation::DestroyTunnel), 0);
    assert_eq!(cloud.tunnel_count(), 1);
    assert!(cloud.route(&other.tunnel_id).is_none());
}

#[tokio::test]
async fn test_subdomain_in_use_reclaimed() {
    let cloud = cloud();
    let stale_tunnel = leave_stale_dns(&cloud).await;
    let config = ProvisionerConfig {
        subdomain_policy: SubdomainPolicy::Reclaim,
        ..config(PoolConfig::default())
    };
    let provisioner = Provisioner::new(config, cloud.backends(PoolConfig::default()));

    let result = assert_ok!(provisioner.provision(&request("demo")).await);

    assert_eq!(result.tunnel_id, stale_tunnel);
    assert_eq!(cloud.tunnel_count(), 1);
}

#[tokio::test]
async fn test_check_subdomain() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);

    assert!(provisioner.check_subdomain("demo").await.unwrap());
    provisioner.provision(&request("demo")).await.unwrap();
    assert!(!provisioner.check_subdomain("demo").await.unwrap());

    let err = provisioner.check_subdomain("-bad").await.unwrap_err();
    assert_eq!(err.kind(), "InvalidRequest");
}

// ============================================================================
// Test: Deprovision
// ============================================================================

#[tokio::test]
async fn test_deprovision_removes_everything() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    let result = provisioner.provision(&request("demo")).await.unwrap();

    let report = provisioner
        .deprovision(&DeprovisionRequest::from(&result))
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.identifier, Some(InstanceId::new(9000)));
    assert!(cloud.is_empty());
}

#[tokio::test]
async fn test_deprovision_continues_past_failures() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    let result = provisioner.provision(&request("demo")).await.unwrap();
    cloud.fail_on(Operation::DeleteDns);

    let report = provisioner
        .deprovision(&DeprovisionRequest::from(&result))
        .await
        .unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].action, "delete_dns(demo.persys.jp)");
    assert!(cloud.instance(result.identifier).is_none());
    assert_eq!(cloud.tunnel_count(), 0);
    assert!(!cloud.has_document("demo"));
}

#[tokio::test]
async fn test_deprovision_twice_is_harmless() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    let result = provisioner.provision(&request("demo")).await.unwrap();
    let request = DeprovisionRequest::from(&result);

    assert!(provisioner.deprovision(&request).await.unwrap().is_clean());
    assert!(provisioner.deprovision(&request).await.unwrap().is_clean());
}

// ============================================================================
// Test: Tunnel and metadata contracts
// ============================================================================

#[tokio::test]
async fn test_tunnel_creation_idempotent_by_name() {
    let cloud = cloud();
    let first = cloud.create_tunnel("trial-demo").await.unwrap();
    let second = cloud.create_tunnel("trial-demo").await.unwrap();

    assert_eq!(first.tunnel_id, second.tunnel_id);
    assert_eq!(first.token, second.token);
    assert_eq!(cloud.tunnel_count(), 1);
}

#[tokio::test]
async fn test_metadata_round_trip() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    provisioner.provision(&request("demo")).await.unwrap();
    let document = cloud.fetch("demo").await.unwrap().unwrap();

    cloud.publish("copy", &document).await.unwrap();
    let fetched = cloud.fetch("copy").await.unwrap();

    assert_eq!(fetched, Some(document));
    assert_eq!(
        cloud.document_url("copy"),
        "sim://metadata/metadata-copy.json"
    );
}

#[tokio::test]
async fn test_publish_confirmed_retries_read_back() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    provisioner.provision(&request("demo")).await.unwrap();
    let document = cloud.fetch("demo").await.unwrap().unwrap();
    cloud.fail_times(Operation::Fetch, 2);

    let retry = RetryPolicy::new(3, std::time::Duration::from_millis(1));
    assert_ok!(publish_confirmed(&*cloud, "again", &document, &retry).await);

    cloud.fail_on(Operation::Fetch);
    let err = publish_confirmed(&*cloud, "again", &document, &retry)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "MetadataPublishFailed");
}

// ============================================================================
// Test: Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_before_start_touches_nothing() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let failure = provisioner
        .provision_cancellable(&request("demo"), &|_: Stage| {}, &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Validating);
    assert_eq!(failure.cause, ProvisionError::Cancelled);
    assert!(!failure.compensated);
    assert!(cloud.journal().is_empty());
}

#[tokio::test]
async fn test_cancel_lets_step_finish_then_rolls_back() {
    let cloud = cloud();
    let provisioner = provisioner(&cloud);
    let cancel = CancellationToken::new();
    let progress = |stage: Stage| {
        if stage == Stage::DnsRegistering {
            cancel.cancel();
        }
    };

    let failure = provisioner
        .provision_cancellable(&request("demo"), &progress, &cancel)
        .await
        .unwrap_err();

    assert_eq!(failure.stage, Stage::DnsRegistering);
    assert_eq!(failure.cause.kind(), "Cancelled");
    assert!(failure.compensated);
    assert_eq!(cloud.calls(Operation::RegisterDns), 1);
    assert_eq!(cloud.calls(Operation::DeleteDns), 1);
    assert_eq!(cloud.calls(Operation::Publish), 0);
    assert!(cloud.is_empty());
}

#[tokio::test]
async fn test_cancel_during_readiness_wait_rolls_back() {
    let cloud = cloud();
    cloud.fail_on(Operation::Probe);
    // Resources would be kept on a readiness timeout; cancellation still unwinds.
    let provisioner = Arc::new(provisioner(&cloud));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let provisioner = provisioner.clone();
        let cancel = cancel.clone();
        async move {
            let request = request("demo");
            provisioner
                .provision_cancellable(&request, &|_: Stage| {}, &cancel)
                .await
        }
    });
    while cloud.calls(Operation::Probe) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let failure = run.await.unwrap().unwrap_err();

    assert_eq!(failure.stage, Stage::WaitingReady);
    assert_eq!(failure.cause, ProvisionError::Cancelled);
    assert!(failure.compensated);
    assert!(failure.retained.is_none());
    assert!(cloud.is_empty());
}
