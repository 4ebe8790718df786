//! Retry policy for resolver calls
//!
//! Implements bounded exponential backoff for transient resolver failures.
//! Sits under the adaptive rate limiter: throttling errors are returned
//! immediately so the limiter, not this policy, decides how long to back off.
//! Backoff sleeps end early on cancellation with [`ResolveError::Cancelled`].

use crate::services::resolver::ResolveError;
use keyfill_common::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_secs_f64(config.initial_backoff_secs),
            multiplier: config.multiplier,
            max_backoff: Duration::from_secs_f64(config.max_backoff_secs),
        }
    }

    /// Backoff slept after failed attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out
    ///
    /// **Algorithm:**
    /// 1. Attempt operation
    /// 2. Success or non-retryable error: return it
    /// 3. Retryable error with attempts left: log WARN, back off, retry
    /// 4. Attempts exhausted: return the last error
    /// 5. Cancelled during a backoff: return `Cancelled`
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResolveError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation = operation_name, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(err);
                }
                Err(err) => {
                    let backoff = self.backoff_for(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::debug!(operation = operation_name, attempt, "Cancelled during retry backoff");
                            return Err(ResolveError::Cancelled);
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
