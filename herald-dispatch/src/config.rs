//! Dispatch engine configuration

use serde::Deserialize;

use crate::{monitor::FailureMonitorConfig, rate_limiter::RateLimitConfig, retry::RetryPolicy};

mod defaults {
    pub fn workers() -> usize {
        num_cpus::get().max(1)
    }

    pub const fn queue_capacity() -> usize {
        1_000
    }

    pub const fn page_size() -> usize {
        500
    }

    pub const fn send_timeout_ms() -> u64 {
        30_000
    }

    pub const fn scheduler_interval_secs() -> u64 {
        5
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }

    pub const fn source_retry_delay_ms() -> u64 {
        1_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Size of the worker pool shared by every campaign
    ///
    /// Default: number of CPUs
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Jobs the dispatch queue holds before producers block
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Subscribers fetched per page by a dispatch session
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,

    /// Deadline for a single transport call (in milliseconds)
    ///
    /// Exceeding it counts as a transient failure.
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// How often scheduled campaigns are checked for their send time (in seconds)
    #[serde(default = "defaults::scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    /// How long shutdown waits for in-flight attempts (in seconds)
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Delay before a session retries a failed page fetch (in milliseconds)
    #[serde(default = "defaults::source_retry_delay_ms")]
    pub source_retry_delay_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub auto_pause: FailureMonitorConfig,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            queue_capacity: defaults::queue_capacity(),
            page_size: defaults::page_size(),
            send_timeout_ms: defaults::send_timeout_ms(),
            scheduler_interval_secs: defaults::scheduler_interval_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            source_retry_delay_ms: defaults::source_retry_delay_ms(),
            retry: RetryPolicy::default(),
            auto_pause: FailureMonitorConfig::default(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}
