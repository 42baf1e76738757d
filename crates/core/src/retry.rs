//! Bounded backoff for transient failures inside a single run.
//!
//! Cross-run retries are the dataset record's business (`retry_count`,
//! released claims, the reaper). This module only covers the short in-run
//! loop: a store call that hits a dropped connection, a cloud listing that
//! gets a 5xx mid-transfer. Budgets are small on purpose; anything that
//! does not clear up within a few seconds should fail the run and go
//! through the status machinery instead.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Errors that may clear up on their own within seconds.
pub trait RetryableError {
    fn is_retryable(&self) -> bool;
}

/// Connectivity-level store failures are worth a second try; everything
/// else (bad rows, constraint violations, missing rows) is not.
impl RetryableError for sqlx::Error {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Tls(_)
        )
    }
}

impl RetryableError for crate::error::PipelineError {
    fn is_retryable(&self) -> bool {
        crate::error::PipelineError::is_retryable(self)
    }
}

/// A doubling backoff schedule: `base_delay` before the first retry, twice
/// that before the next, capped at `cap`. Each sleep is shaved by up to 20%
/// at random so replicas hitting the same outage spread out instead of
/// stampeding back together.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retries after the initial attempt.
    pub attempts: u32,
    pub base_delay: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Schedule for dataset-store calls. Kept tight: a scheduler tick must
    /// never be held hostage by a dead database, and "store unavailable"
    /// already means "try again next tick" to every caller.
    pub fn for_store() -> Self {
        Self {
            attempts: env_u32("STORE_RETRY_ATTEMPTS", 3),
            base_delay: Duration::from_millis(env_u64("STORE_RETRY_BASE_MS", 50)),
            cap: Duration::from_millis(env_u64("STORE_RETRY_CAP_MS", 2_000)),
        }
    }

    /// Schedule for cloud-API reads inside a transfer run. More patient
    /// than the store schedule: a rate-limited Drive listing is routine and
    /// the run has a two-hour wall clock anyway.
    pub fn for_transfer() -> Self {
        Self {
            attempts: env_u32("TRANSFER_RETRY_ATTEMPTS", 4),
            base_delay: Duration::from_millis(env_u64("TRANSFER_RETRY_BASE_MS", 500)),
            cap: Duration::from_millis(env_u64("TRANSFER_RETRY_CAP_MS", 15_000)),
        }
    }

    /// The sleep before retry number `retry` (1-based). Doubles from
    /// `base_delay`, saturates at `cap`, then loses a random 0-20%.
    fn sleep_before(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        let full = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.cap);
        let shave: f64 = rand::rng().random_range(0.0..0.2);
        full.mul_f64(1.0 - shave)
    }

    /// Run `op`, retrying transient errors until the budget is spent. The
    /// final error is returned unchanged for the caller to classify.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display + RetryableError,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(operation, retries = retry, "Succeeded after backing off");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && retry < self.attempts => {
                    retry += 1;
                    let sleep = self.sleep_before(retry);
                    warn!(
                        operation,
                        retry,
                        budget = self.attempts,
                        sleep_ms = sleep.as_millis() as u64,
                        error = %e,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(sleep).await;
                }
                Err(e) => {
                    if retry > 0 {
                        warn!(operation, retries = retry, error = %e, "Retry budget spent");
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_classification_drives_retries() {
        let reset =
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_retryable());
        assert!(sqlx::Error::PoolTimedOut.is_retryable());
        assert!(!sqlx::Error::RowNotFound.is_retryable());

        let dup = crate::error::PipelineError::Conflict("duplicate slug".into());
        assert!(!dup.is_retryable());
        assert!(crate::error::PipelineError::RateLimited("429".into()).is_retryable());
    }

    #[test]
    fn schedule_doubles_and_saturates_under_the_cap() {
        let backoff = Backoff {
            attempts: 8,
            base_delay: Duration::from_millis(100),
            cap: Duration::from_millis(1_500),
        };
        // Jitter shaves at most 20%, so each sleep lands in
        // [0.8 * expected, expected].
        for (retry, expected_ms) in [(1u32, 100u64), (2, 200), (3, 400), (4, 800), (5, 1_500), (12, 1_500)] {
            let sleep = backoff.sleep_before(retry);
            let expected = Duration::from_millis(expected_ms);
            assert!(sleep <= expected, "retry {retry}: {sleep:?} > {expected:?}");
            assert!(
                sleep >= expected.mul_f64(0.79),
                "retry {retry}: {sleep:?} shaved below jitter floor"
            );
        }
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried_until_success() {
        let backoff = Backoff {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result: Result<u32, sqlx::Error> = backoff
            .run("test_op", || {
                calls += 1;
                let fail = calls < 3;
                async move { if fail { Err(sqlx::Error::PoolTimedOut) } else { Ok(7) } }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_on_the_first_attempt() {
        let backoff = Backoff {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result: Result<u32, sqlx::Error> = backoff
            .run("test_op", || {
                calls += 1;
                async move { Err(sqlx::Error::RowNotFound) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
