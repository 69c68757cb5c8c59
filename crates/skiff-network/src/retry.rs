//! Bounded exponential backoff for calls into VMs that may still be booting.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_common::SkiffResult;

/// Retry schedule: `initial_delay_ms`, doubled per attempt, capped at
/// `max_delay_ms`, at most `max_attempts` calls in total.
///
/// Only transient errors ([`skiff_common::SkiffError::is_transient`]) are
/// retried; a definitive failure is returned immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay.
    pub max_delay_ms: u64,
    /// Total number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 25,
            max_delay_ms: 2_000,
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 1,
        }
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Run `op` until it succeeds, fails definitively, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the last error produced by `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SkiffResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SkiffResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(what, attempt, ?delay, error = %err, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
