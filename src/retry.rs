//! Bounded exponential-backoff retry.
//!
//! A pure control-flow wrapper: no caching, no deduplication. Attempt 1 runs
//! immediately; after a retryable failure on attempt `n` the policy waits
//! `base_delay * 2^(n-1)` before attempt `n + 1`.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry budget for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub retries: u32,

    /// Delay before the second attempt; doubles for every further attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            retries,
            base_delay,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        RetryPolicy::new(1, Duration::ZERO)
    }

    /// Attempts allowed; at least one.
    pub fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// - `Error::Aborted`: `cancel` fired during an attempt or a backoff
    /// - `Error::ExhaustedRetries`: the last of several attempts failed transiently
    /// - any non-retryable error from `operation`, unchanged
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Aborted),
                result = operation() => result,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts {
                if attempt == 1 {
                    return Err(error);
                }
                warn!("Operation failed after {} attempts: {}", attempt, error);
                return Err(Error::ExhaustedRetries {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for(attempt);
            debug!(
                "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                attempt, max_attempts, delay, error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
