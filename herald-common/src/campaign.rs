//! Campaign model and lifecycle states
//!
//! A campaign moves through a small state machine:
//!
//! ```text
//! draft ──> scheduled ──> running <──> paused
//!   ^           │            │            │
//!   └───────────┘            v            │
//!                        finished         │
//!
//! any non-terminal state ──> cancelled
//! ```
//!
//! The transitions themselves are enforced by the dispatch engine; this module
//! only knows which edges are legal.

use core::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{message::DeliveryOutcome, subscriber::SubscriberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub u64);

impl Display for CampaignId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl core::str::FromStr for CampaignId {
    type Err = core::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u64);

impl Display for TemplateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    /// Cancelled and finished campaigns never change state again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }

    /// Whether the state machine has an edge from `self` to `next`
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Draft, Self::Scheduled)
            | (Self::Scheduled, Self::Draft | Self::Running)
            | (Self::Running, Self::Paused | Self::Finished)
            | (Self::Paused, Self::Running) => true,
            (current, Self::Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
        }
    }
}

impl Display for CampaignStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sustained send rate, expressed as a token bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens added per second
    pub messages_per_second: f64,
    /// Maximum tokens held at once
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

const fn default_burst_size() -> u32 {
    1
}

impl RateLimit {
    #[must_use]
    pub const fn new(messages_per_second: f64, burst_size: u32) -> Self {
        Self {
            messages_per_second,
            burst_size,
        }
    }
}

/// Why a running campaign was paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseReason {
    /// An operator asked for it
    Manual,
    /// The engine detected a systemic failure and stopped sending
    Auto(AutoPauseReason),
}

/// The condition that made the engine pause a campaign by itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoPauseReason {
    /// Too many transport attempts failed inside the sliding window
    FailureRate {
        failures: u32,
        samples: u32,
        window_secs: u64,
    },
    /// More retries were scheduled during this run than the budget allows
    RetryBudgetExhausted { retries: u64, budget: u64 },
}

impl Display for AutoPauseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailureRate {
                failures,
                samples,
                window_secs,
            } => write!(
                f,
                "{failures} of the last {samples} attempts failed within {window_secs}s"
            ),
            Self::RetryBudgetExhausted { retries, budget } => {
                write!(f, "{retries} retries exceeded the budget of {budget}")
            }
        }
    }
}

/// Aggregate delivery counters for one campaign run
///
/// `sent`, `failed` and `skipped` only ever grow while a campaign runs. Each
/// member of the frozen audience is accounted at most once, so their sum never
/// exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Size of the eligible subscriber set captured when the run started
    pub total: u64,
    /// Messages accepted by the transport
    pub sent: u64,
    /// Messages that reached a permanent failure (including render failures)
    pub failed: u64,
    /// Snapshot members suppressed before their job was created
    pub skipped: u64,
}

impl Counters {
    #[must_use]
    pub const fn processed(&self) -> u64 {
        self.sent + self.failed + self.skipped
    }

    /// Account for one terminal outcome
    ///
    /// A transient failure is never terminal, so it does not move any counter.
    pub const fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.sent += 1,
            DeliveryOutcome::PermanentFailure => self.failed += 1,
            DeliveryOutcome::TransientFailure => {}
        }
    }

    pub const fn record_skip(&mut self) {
        self.skipped += 1;
    }
}

/// A scheduled bulk send targeting one or more lists with one template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub lists: Vec<ListId>,
    pub template: TemplateId,
    /// Name of the transport that delivers this campaign
    pub transport: String,
    pub status: CampaignStatus,
    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,
    /// Optional per-campaign send rate, applied on top of the transport limit
    #[serde(default)]
    pub throttle: Option<RateLimit>,
    /// Optional cap on this campaign's concurrently in-flight attempts
    #[serde(default)]
    pub max_in_flight: Option<u32>,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    /// Last subscriber handed to the dispatch queue
    #[serde(default)]
    pub cursor: Option<SubscriberId>,
    /// Highest subscriber id in the snapshot taken at start
    #[serde(default)]
    pub ceiling: Option<SubscriberId>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// A new draft campaign with no schedule and zeroed counters
    #[must_use]
    pub fn draft(
        id: CampaignId,
        name: impl Into<String>,
        lists: Vec<ListId>,
        template: TemplateId,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            lists,
            template,
            transport: transport.into(),
            status: CampaignStatus::Draft,
            send_at: None,
            throttle: None,
            max_in_flight: None,
            counters: Counters::default(),
            pause_reason: None,
            cursor: None,
            ceiling: None,
            started_at: None,
            updated_at: None,
        }
    }

    #[must_use]
    pub const fn with_send_at(mut self, send_at: DateTime<Utc>) -> Self {
        self.send_at = Some(send_at);
        self
    }
}
