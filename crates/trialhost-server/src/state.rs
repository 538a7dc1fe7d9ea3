//! Shared application state.
//!
//! This module provides [`AppState`], which holds the provisioner and the
//! table of provisioning jobs submitted over HTTP. Finished jobs are kept
//! up to a retention limit, oldest dropped first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use trialhost_common::{FailureReport, ProvisioningRequest, ProvisioningResult, Stage};
use trialhost_core::Provisioner;

/// Finished jobs kept in the table by default.
pub const DEFAULT_JOB_RETENTION: usize = 1000;

/// Lifecycle of a background provisioning job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
}

/// A provisioning run submitted over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub subdomain: String,
    pub oss_type: String,
    /// Last stage the workflow reported.
    pub stage: Stage,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProvisioningResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
}

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    provisioner: Arc<Provisioner>,

    /// Job table (job id -> job).
    jobs: Arc<DashMap<Uuid, Job>>,

    /// Subdomains with a running job (subdomain -> job id).
    active: Arc<DashMap<String, Uuid>>,

    next_seq: Arc<AtomicU64>,

    /// Maximum number of finished jobs kept.
    job_retention: usize,

    /// Fired on shutdown; running jobs stop and roll back.
    shutdown: CancellationToken,

    /// Workflow tasks, awaited on shutdown.
    tasks: TaskTracker,

    /// Token required on mutating endpoints, if the guard is enabled.
    api_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(provisioner: Provisioner, api_token: Option<String>) -> Self {
        Self {
            provisioner: Arc::new(provisioner),
            jobs: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            job_retention: DEFAULT_JOB_RETENTION,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            api_token: api_token.map(Arc::from),
        }
    }

    /// Set how many finished jobs are kept.
    #[must_use]
    pub fn with_job_retention(mut self, retention: usize) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    /// Register a job and run the workflow for it in the background.
    ///
    /// Returns `None` if a job for the same subdomain is still running.
    /// Jobs submitted after [`Self::shutdown`] started are cancelled before
    /// their first step.
    pub fn submit(&self, request: ProvisioningRequest) -> Option<Uuid> {
        let id = Uuid::new_v4();
        match self.active.entry(request.subdomain.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        self.jobs.insert(
            id,
            Job {
                id,
                subdomain: request.subdomain.clone(),
                oss_type: request.oss_type.clone(),
                stage: Stage::Validating,
                status: JobStatus::Running,
                submitted_at: Utc::now(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                result: None,
                failure: None,
            },
        );

        let provisioner = self.provisioner.clone();
        let jobs = self.jobs.clone();
        let cancel = self.shutdown.clone();
        let guard = JobGuard {
            id,
            subdomain: request.subdomain.clone(),
            jobs: self.jobs.clone(),
            active: self.active.clone(),
            retention: self.job_retention,
        };
        let span = info_span!("job", job_id = %id, subdomain = %request.subdomain);

        self.tasks.spawn(
            async move {
                let _guard = guard;
                let progress = {
                    let jobs = jobs.clone();
                    move |stage: Stage| {
                        if let Some(mut job) = jobs.get_mut(&id) {
                            job.stage = stage;
                        }
                    }
                };

                let outcome = provisioner
                    .provision_cancellable(&request, &progress, &cancel)
                    .await;

                if let Some(mut job) = jobs.get_mut(&id) {
                    match outcome {
                        Ok(result) => {
                            info!(url = %result.public_url, "Job succeeded");
                            job.stage = Stage::Succeeded;
                            job.status = JobStatus::Succeeded;
                            job.result = Some(result);
                        }
                        Err(failure) => {
                            warn!(error = %failure, "Job failed");
                            job.stage = failure.stage;
                            job.status = JobStatus::Failed;
                            job.failure = Some(failure.report());
                        }
                    }
                }
            }
            .instrument(span),
        );

        Some(id)
    }

    pub fn job(&self, id: &Uuid) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    /// All jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|job| job.clone()).collect();
        jobs.sort_by_key(|job| job.seq);
        jobs
    }

    pub fn running_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel running jobs and wait until each has finished rolling back.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Settles a job when its task ends, including by panic.
struct JobGuard {
    id: Uuid,
    subdomain: String,
    jobs: Arc<DashMap<Uuid, Job>>,
    active: Arc<DashMap<String, Uuid>>,
    retention: usize,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if let Some(mut job) = self.jobs.get_mut(&self.id) {
            if job.status == JobStatus::Running {
                error!(job_id = %self.id, "Job task ended without an outcome");
                job.status = JobStatus::Failed;
                job.failure = Some(FailureReport {
                    stage: job.stage,
                    kind: "Aborted".to_string(),
                    cause: "Job task ended unexpectedly".to_string(),
                    compensated: false,
                    warnings: Vec::new(),
                    retained: None,
                });
            }
        }
        self.active.remove_if(&self.subdomain, |_, owner| *owner == self.id);
        prune_finished(&self.jobs, self.retention);
    }
}

/// Drop the oldest finished jobs beyond `retention`.
fn prune_finished(jobs: &DashMap<Uuid, Job>, retention: usize) {
    let mut finished: Vec<(u64, Uuid)> = jobs
        .iter()
        .filter(|job| job.status != JobStatus::Running)
        .map(|job| (job.seq, job.id))
        .collect();
    if finished.len() <= retention {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("jobs_count", &self.jobs.len())
            .field("job_retention", &self.job_retention)
            .field("token_guard", &self.api_token.is_some())
            .finish_non_exhaustive()
    }
}
