//! Token bucket rate limiting shared by every worker using a transport
//!
//! - Tokens are added to the bucket at a constant rate (`refill_rate`)
//! - Each attempt consumes one token
//! - If no token is available the worker waits rather than failing
//! - The bucket has a maximum capacity, which allows short bursts
//!
//! Waiters queue on a fair async mutex, so tokens are handed out in the order
//! workers asked for them and no worker starves.
//!
//! ```text
//! Rate limit: 10 msg/sec, burst: 20
//! - Bucket starts with 20 tokens
//! - Tokens refill at 10/sec
//! - Can send 20 messages immediately (burst)
//! - Then limited to 10/sec sustained rate
//! ```

use std::time::Duration;

use herald_common::RateLimit;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Rate limits applied to transports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit for transports that declare none and have no override
    #[serde(default)]
    pub default: Option<RateLimit>,

    /// Per-transport overrides, keyed by transport name
    #[serde(default)]
    pub transports: ahash::AHashMap<String, RateLimit>,
}

// Float refills can land a hair under a whole token
const TOKEN_EPSILON: f64 = 1e-9;
// Timers have millisecond resolution
const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        let capacity = f64::from(limit.burst_size.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: limit.messages_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens + TOKEN_EPSILON >= 1.0 {
            return Duration::ZERO;
        }

        let tokens_needed = 1.0 - self.tokens;
        Duration::from_secs_f64(tokens_needed / self.refill_rate).max(MIN_WAIT)
    }
}

/// A token bucket gate that many workers can wait on concurrently
#[derive(Debug)]
pub struct RateLimiter {
    bucket: tokio::sync::Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Build a limiter, or `None` when the rate does not limit anything
    #[must_use]
    pub fn new(limit: RateLimit) -> Option<Self> {
        (limit.messages_per_second.is_finite() && limit.messages_per_second > 0.0).then(|| Self {
            bucket: tokio::sync::Mutex::new(TokenBucket::new(limit)),
        })
    }

    /// Wait until a token is available and consume it
    ///
    /// The bucket lock is held while sleeping, so concurrent callers are
    /// served strictly in arrival order.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        while !bucket.try_consume() {
            let wait = bucket.time_until_available();
            tracing::trace!(
                wait_seconds = wait.as_secs_f64(),
                "Rate limit exceeded, waiting for a token"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_non_positive_rate_is_unlimited() {
        assert!(RateLimiter::new(RateLimit::new(0.0, 5)).is_none());
        assert!(RateLimiter::new(RateLimit::new(f64::INFINITY, 5)).is_none());
        assert!(RateLimiter::new(RateLimit::new(1.0, 1)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_sustained_rate() {
        let limiter = RateLimiter::new(RateLimit::new(10.0, 5)).unwrap();

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        for _ in 0..10 {
            limiter.acquire().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_share_the_rate() {
        let limiter = Arc::new(RateLimiter::new(RateLimit::new(20.0, 1)).unwrap());
        let start = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        limiter.acquire().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        // 20 tokens at 20/s with one token up front
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(940), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time_refills_up_to_capacity() {
        let limiter = RateLimiter::new(RateLimit::new(2.0, 4)).unwrap();
        for _ in 0..4 {
            limiter.acquire().await;
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(499), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(510), "{elapsed:?}");
    }
}
