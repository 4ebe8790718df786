//! Adaptive rate limiter
//!
//! Shared by every worker. The delay doubles on each rate-limit signal
//! (capped at `max_delay`) and decays by 5% on each success (floored at
//! `base_delay`). After `failure_threshold` consecutive failures callers
//! take a long pause before continuing.

use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const GROWTH_FACTOR: f64 = 2.0;
const DECAY_FACTOR: f64 = 0.95;
const JITTER_MIN: f64 = 0.8;
const JITTER_MAX: f64 = 1.2;

/// Consistent view of the limiter's mutable state
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterState {
    /// Current inter-request delay, seconds
    pub current_delay_secs: f64,
    /// Rate-limit failures since the last success or pause
    pub consecutive_failures: u32,
}

/// Rate limiter adapting its delay to throttling feedback
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    base_delay_secs: f64,
    max_delay_secs: f64,
    failure_threshold: u32,
    long_pause: Duration,
    state: Mutex<RateLimiterState>,
}

impl AdaptiveRateLimiter {
    /// Limiter with the default threshold of 5 failures and a 30 second pause
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_pause(base_delay, max_delay, 5, Duration::from_secs(30))
    }

    pub fn with_pause(
        base_delay: Duration,
        max_delay: Duration,
        failure_threshold: u32,
        long_pause: Duration,
    ) -> Self {
        let base_delay_secs = base_delay.as_secs_f64();
        let max_delay_secs = max_delay.as_secs_f64().max(base_delay_secs);
        Self {
            base_delay_secs,
            max_delay_secs,
            failure_threshold: failure_threshold.max(1),
            long_pause,
            state: Mutex::new(RateLimiterState {
                current_delay_secs: base_delay_secs,
                consecutive_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RateLimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delay to sleep before the next request: current delay with ±20% jitter
    pub fn get_delay(&self) -> Duration {
        let current = self.lock().current_delay_secs;
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        Duration::from_secs_f64(current * jitter)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.current_delay_secs = (state.current_delay_secs * DECAY_FACTOR).max(self.base_delay_secs);
    }

    /// Register a rate-limit signal from the external source
    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        state.current_delay_secs = (state.current_delay_secs * GROWTH_FACTOR).min(self.max_delay_secs);
        tracing::debug!(
            consecutive_failures = state.consecutive_failures,
            delay_secs = state.current_delay_secs,
            "Rate limit signal, backing off"
        );
    }

    /// Long pause to take, or zero while under the failure threshold
    ///
    /// After sleeping the returned duration the caller must call
    /// [`AdaptiveRateLimiter::reset_failures`].
    pub fn should_pause(&self) -> Duration {
        if self.lock().consecutive_failures >= self.failure_threshold {
            self.long_pause
        } else {
            Duration::ZERO
        }
    }

    pub fn reset_failures(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn state(&self) -> RateLimiterState {
        *self.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> AdaptiveRateLimiter {
        AdaptiveRateLimiter::new(Duration::from_secs_f64(1.0), Duration::from_secs_f64(10.0))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_starts_at_base_delay() {
        let state = limiter().state();
        assert_close(state.current_delay_secs, 1.0);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_failures_double_then_success_decays() {
        let limiter = limiter();
        for _ in 0..3 {
            limiter.record_failure();
        }
        let state = limiter.state();
        assert_close(state.current_delay_secs, 8.0);
        assert_eq!(state.consecutive_failures, 3);

        limiter.record_success();
        let state = limiter.state();
        assert_close(state.current_delay_secs, 7.6);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let limiter = limiter();
        for _ in 0..10 {
            limiter.record_failure();
        }
        assert_close(limiter.state().current_delay_secs, 10.0);
    }

    #[test]
    fn test_success_never_drops_below_base() {
        let limiter = limiter();
        for _ in 0..50 {
            limiter.record_success();
        }
        assert_close(limiter.state().current_delay_secs, 1.0);
    }

    #[test]
    fn test_should_pause_only_at_threshold() {
        let limiter = limiter();
        for _ in 0..4 {
            limiter.record_failure();
            assert_eq!(limiter.should_pause(), Duration::ZERO);
        }
        limiter.record_failure();
        assert_eq!(limiter.should_pause(), Duration::from_secs(30));

        limiter.reset_failures();
        assert_eq!(limiter.should_pause(), Duration::ZERO);
    }

    #[test]
    fn test_should_pause_zero_after_success() {
        let limiter = limiter();
        for _ in 0..6 {
            limiter.record_failure();
        }
        assert!(limiter.should_pause() > Duration::ZERO);

        limiter.record_success();
        assert_eq!(limiter.should_pause(), Duration::ZERO);
    }

    #[test]
    fn test_get_delay_within_jitter_bounds() {
        let limiter = limiter();
        limiter.record_failure();
        for _ in 0..200 {
            let delay = limiter.get_delay().as_secs_f64();
            assert!((1.6 - 1e-9..=2.4 + 1e-9).contains(&delay), "delay {} out of range", delay);
        }
    }
}
