//! Bounce events and the records the correlator keeps for them

use core::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{campaign::CampaignId, subscriber::SubscriberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceClass {
    /// Temporary failure at the receiving end (mailbox full, greylisting)
    Soft,
    /// Permanent failure (unknown mailbox, domain gone)
    Hard,
    /// The recipient reported the message as spam
    Complaint,
}

impl BounceClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Complaint => "complaint",
        }
    }
}

impl Display for BounceClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a bounce event came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BounceSource {
    /// Parsed out of a polled bounce mailbox
    Mailbox,
    /// Delivered by a provider webhook (provider name attached)
    Webhook(String),
    /// Signalled inline by the transport while sending
    Transport,
}

impl Display for BounceSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mailbox => f.write_str("mailbox"),
            Self::Webhook(provider) => write!(f, "webhook:{provider}"),
            Self::Transport => f.write_str("transport"),
        }
    }
}

/// Normalised bounce, independent of the adapter that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceEvent {
    pub recipient: String,
    pub class: BounceClass,
    pub timestamp: DateTime<Utc>,
    /// The provider payload as received, kept for audit
    pub raw_payload: String,
    /// Campaign recovered from the original message headers, if any
    pub campaign_hint: Option<CampaignId>,
    pub source: BounceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BounceId(pub Ulid);

impl BounceId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for BounceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable record of an ingested bounce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceRecord {
    pub id: BounceId,
    /// Set when the recipient resolves to a known subscriber
    pub subscriber: Option<SubscriberId>,
    /// Set only when the bounce matched a previously sent message
    pub campaign: Option<CampaignId>,
    pub class: BounceClass,
    pub source: BounceSource,
    pub raw_payload: String,
    pub timestamp: DateTime<Utc>,
}

impl BounceRecord {
    /// Orphaned records are kept for audit and never affect subscriber state
    #[must_use]
    pub const fn is_orphaned(&self) -> bool {
        self.campaign.is_none()
    }
}
