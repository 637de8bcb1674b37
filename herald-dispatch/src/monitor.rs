//! Sliding-window failure monitor driving automatic pauses
//!
//! Each running campaign owns one monitor. Every transport attempt is
//! recorded as a sample; when enough samples inside the window failed, or the
//! run scheduled more retries than its budget, the monitor reports the
//! condition and the campaign is paused instead of hammering a broken
//! transport.

use std::{collections::VecDeque, time::Duration};

use herald_common::AutoPauseReason;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureMonitorConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Length of the sliding window (in seconds)
    #[serde(default = "defaults::window_secs")]
    pub window_secs: u64,

    /// Samples required inside the window before the ratio is evaluated
    #[serde(default = "defaults::min_samples")]
    pub min_samples: u32,

    /// Failed share of samples that triggers a pause (0.0 to 1.0)
    #[serde(default = "defaults::failure_ratio")]
    pub failure_ratio: f64,

    /// Maximum retries scheduled per run before pausing, unlimited when absent
    #[serde(default)]
    pub retry_budget: Option<u64>,
}

mod defaults {
    pub const fn enabled() -> bool {
        true
    }

    pub const fn window_secs() -> u64 {
        60
    }

    pub const fn min_samples() -> u32 {
        20
    }

    pub const fn failure_ratio() -> f64 {
        0.8
    }
}

impl Default for FailureMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            window_secs: defaults::window_secs(),
            min_samples: defaults::min_samples(),
            failure_ratio: defaults::failure_ratio(),
            retry_budget: None,
        }
    }
}

#[derive(Debug)]
pub struct FailureMonitor {
    config: FailureMonitorConfig,
    samples: VecDeque<(Instant, bool)>,
    retries: u64,
}

impl FailureMonitor {
    #[must_use]
    pub const fn new(config: FailureMonitorConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
            retries: 0,
        }
    }

    /// Record one transport attempt
    pub fn record(&mut self, success: bool) -> Option<AutoPauseReason> {
        if !self.config.enabled {
            return None;
        }

        let now = Instant::now();
        self.samples.push_back((now, success));
        self.evict(now);

        let samples = u32::try_from(self.samples.len()).unwrap_or(u32::MAX);
        if samples < self.config.min_samples.max(1) {
            return None;
        }

        let failures = u32::try_from(self.samples.iter().filter(|(_, ok)| !ok).count())
            .unwrap_or(u32::MAX);
        let ratio = f64::from(failures) / f64::from(samples);

        (ratio >= self.config.failure_ratio).then_some(AutoPauseReason::FailureRate {
            failures,
            samples,
            window_secs: self.config.window_secs,
        })
    }

    /// Record a scheduled retry
    pub fn record_retry(&mut self) -> Option<AutoPauseReason> {
        if !self.config.enabled {
            return None;
        }

        self.retries += 1;
        let budget = self.config.retry_budget?;

        (self.retries > budget).then_some(AutoPauseReason::RetryBudgetExhausted {
            retries: self.retries,
            budget,
        })
    }

    /// Forget every sample, used when a paused campaign resumes
    pub fn reset(&mut self) {
        self.samples.clear();
        self.retries = 0;
    }

    fn evict(&mut self, now: Instant) {
        let window = Duration::from_secs(self.config.window_secs);
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
