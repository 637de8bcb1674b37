use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{campaign::CampaignId, subscriber::SubscriberId};

/// Header carrying the campaign id, read back by bounce adapters
pub const CAMPAIGN_HEADER: &str = "X-Herald-Campaign";
/// Header carrying the subscriber id
pub const SUBSCRIBER_HEADER: &str = "X-Herald-Subscriber";

/// A message ready to be handed to a transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl RenderedMessage {
    /// Set a header, replacing any existing value with the same (case-insensitive) name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The campaign this message was sent for, if it has been stamped
    #[must_use]
    pub fn campaign_hint(&self) -> Option<CampaignId> {
        self.header(CAMPAIGN_HEADER)
            .and_then(|value| value.parse().ok())
    }
}

/// Result of one transport attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    Delivered,
    TransientFailure,
    PermanentFailure,
}

impl DeliveryOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::TransientFailure => "transient-failure",
            Self::PermanentFailure => "permanent-failure",
        }
    }
}

/// Ledger entry for a message that reached a terminal transport outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentRecord {
    pub campaign: CampaignId,
    pub subscriber: SubscriberId,
    pub recipient: String,
    pub outcome: DeliveryOutcome,
    pub at: DateTime<Utc>,
}
