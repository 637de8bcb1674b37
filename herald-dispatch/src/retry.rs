//! Retry policy for transient transport failures.
//!
//! A job that fails transiently is re-enqueued at the tail of the dispatch
//! queue after an exponential backoff delay, until it has been attempted
//! `max_attempts` times. The final transient failure is escalated to a
//! permanent one.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts per job, the first one included.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The delay before attempt `n + 1` is `base * 2^(n - 1)`.
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,

    /// Maximum retry delay (in milliseconds).
    ///
    /// Default: 60000 milliseconds (1 minute)
    #[serde(default = "defaults::max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Jitter factor for randomizing retry delays.
    ///
    /// The delay is randomized within ±`retry_jitter_factor`.
    ///
    /// Default: 0.1 (±10%)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_retry_delay_ms: defaults::base_retry_delay_ms(),
            max_retry_delay_ms: defaults::max_retry_delay_ms(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Check if another attempt should be made after `attempt_count` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Delay to wait after the `attempt`-th attempt (1-indexed) failed.
    ///
    /// `delay = min(base * 2^(attempt - 1), max) * (1 ± jitter)`
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay = if exponent >= 63 {
            self.max_retry_delay_ms
        } else {
            self.base_retry_delay_ms
                .saturating_mul(1_u64 << exponent)
                .min(self.max_retry_delay_ms)
        };

        if self.retry_jitter_factor <= 0.0 || delay == 0 {
            return Duration::from_millis(delay);
        }

        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let jittered = {
            let jitter_range = (delay as f64) * self.retry_jitter_factor;
            let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
            ((delay as f64) + jitter).max(0.0) as u64
        };

        Duration::from_millis(jittered)
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_retry_delay_ms() -> u64 {
        1_000
    }

    pub const fn max_retry_delay_ms() -> u64 {
        60_000
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_retry_delay_ms: 100,
            max_retry_delay_ms: 1_000,
            retry_jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_retry_delay_ms, 1_000);
        assert_eq!(policy.max_retry_delay_ms, 60_000);
        assert!((policy.retry_jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = without_jitter();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(100), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let policy = RetryPolicy {
            retry_jitter_factor: 0.2,
            ..without_jitter()
        };

        for _ in 0..100 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(160), "{delay:?}");
            assert!(delay <= Duration::from_millis(240), "{delay:?}");
        }
    }
}
