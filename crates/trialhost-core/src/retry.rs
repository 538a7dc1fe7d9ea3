//! Bounded fixed-interval retry.
//!
//! Used where an external system needs time to converge after a write:
//! tunnel credential propagation before routing is configured, and
//! metadata read-back after upload.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use trialhost_common::RetryConfig;

/// Retry an operation a fixed number of times with a fixed pause in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    /// Create a policy. `attempts` counts the first call and is at least 1.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `f` until it succeeds or the attempts are used up.
    ///
    /// The error of the last attempt is returned.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut f: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.interval).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config.attempts, config.interval())
    }
}
