//! Suppression policy and correlator configuration
//!
//! Each bounce class has a rule: once a subscriber collects `count` bounces
//! of that class inside the rule's window, the rule's action applies.
//! Suppression is a one-way latch; nothing here ever clears it.

use chrono::Duration;
use herald_common::BounceClass;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceAction {
    /// Only record the bounce
    None,
    /// Stop sending to the subscriber from every campaign
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceRule {
    /// Bounces of this class needed to trigger the action
    pub count: u32,

    /// Rolling window the bounces are counted in (in seconds)
    ///
    /// Every bounce ever recorded counts when absent.
    #[serde(default)]
    pub window_secs: Option<u64>,

    pub action: BounceAction,
}

impl BounceRule {
    #[must_use]
    pub const fn suppress_after(count: u32, window_secs: Option<u64>) -> Self {
        Self {
            count,
            window_secs,
            action: BounceAction::Suppress,
        }
    }

    #[must_use]
    pub fn window(&self) -> Option<Duration> {
        self.window_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BouncePolicy {
    /// Default: suppress after 3 soft bounces within 7 days
    #[serde(default = "defaults::soft")]
    pub soft: BounceRule,

    /// Default: suppress on the first hard bounce
    #[serde(default = "defaults::immediate")]
    pub hard: BounceRule,

    /// Default: suppress on the first complaint
    #[serde(default = "defaults::immediate")]
    pub complaint: BounceRule,
}

impl Default for BouncePolicy {
    fn default() -> Self {
        Self {
            soft: defaults::soft(),
            hard: defaults::immediate(),
            complaint: defaults::immediate(),
        }
    }
}

impl BouncePolicy {
    #[must_use]
    pub const fn rule(&self, class: BounceClass) -> &BounceRule {
        match class {
            BounceClass::Soft => &self.soft,
            BounceClass::Hard => &self.hard,
            BounceClass::Complaint => &self.complaint,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BounceConfig {
    #[serde(default)]
    pub policy: BouncePolicy,

    /// How far back a bounce without a campaign hint looks for the send it
    /// belongs to (in seconds)
    ///
    /// Default: 3 days
    #[serde(default = "defaults::correlation_window_secs")]
    pub correlation_window_secs: u64,

    /// Bounce events buffered for the correlator before submitters wait
    #[serde(default = "defaults::channel_capacity")]
    pub channel_capacity: usize,

    /// How often a bounce mailbox is scanned (in seconds)
    #[serde(default = "defaults::mailbox_poll_interval_secs")]
    pub mailbox_poll_interval_secs: u64,
}

impl Default for BounceConfig {
    fn default() -> Self {
        Self {
            policy: BouncePolicy::default(),
            correlation_window_secs: defaults::correlation_window_secs(),
            channel_capacity: defaults::channel_capacity(),
            mailbox_poll_interval_secs: defaults::mailbox_poll_interval_secs(),
        }
    }
}

impl BounceConfig {
    #[must_use]
    pub fn correlation_window(&self) -> Duration {
        i64::try_from(self.correlation_window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }
}

mod defaults {
    use super::BounceRule;

    pub const fn soft() -> BounceRule {
        BounceRule::suppress_after(3, Some(7 * 24 * 60 * 60))
    }

    pub const fn immediate() -> BounceRule {
        BounceRule::suppress_after(1, None)
    }

    pub const fn correlation_window_secs() -> u64 {
        3 * 24 * 60 * 60
    }

    pub const fn channel_capacity() -> usize {
        1_024
    }

    pub const fn mailbox_poll_interval_secs() -> u64 {
        300
    }
}
