//! Readiness prober.
//!
//! Polls the public URL until it answers or the overall deadline passes. Each
//! probe has its own timeout, clipped to the time left, so a hanging probe can
//! never push the wait past the deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A single readiness check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Returns `true` if `url` answered successfully.
    ///
    /// Connection refused, unresolvable names and TLS errors are expected
    /// while the tunnel comes up and are reported as `false`, not as errors.
    async fn check(&self, url: &str) -> bool;
}

/// Outcome of [`ReadinessProber::wait_until_ready`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessReport {
    pub ready: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Bounded polling loop over a [`Probe`].
#[derive(Clone)]
pub struct ReadinessProber {
    probe: Arc<dyn Probe>,
    attempt_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(probe: Arc<dyn Probe>, attempt_timeout: Duration) -> Self {
        Self {
            probe,
            attempt_timeout,
        }
    }

    /// Probe `url` every `interval` until it is ready or `timeout` elapses.
    #[instrument(skip(self))]
    pub async fn wait_until_ready(
        &self,
        url: &str,
        timeout: Duration,
        interval: Duration,
    ) -> ReadinessReport {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let budget = self.attempt_timeout.min(remaining);
            match tokio::time::timeout(budget, self.probe.check(url)).await {
                Ok(true) => {
                    let elapsed = start.elapsed();
                    info!(attempts, elapsed_ms = elapsed.as_millis(), "Endpoint ready");
                    return ReadinessReport {
                        ready: true,
                        attempts,
                        elapsed,
                    };
                }
                Ok(false) => debug!(attempt = attempts, "Endpoint not ready yet"),
                Err(_) => debug!(attempt = attempts, budget_ms = budget.as_millis(), "Probe timed out"),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(interval.min(remaining)).await;
        }

        let elapsed = start.elapsed();
        warn!(attempts, elapsed_secs = elapsed.as_secs(), "Endpoint not ready before deadline");
        ReadinessReport {
            ready: false,
            attempts,
            elapsed,
        }
    }
}

impl std::fmt::Debug for ReadinessProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProber")
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}
