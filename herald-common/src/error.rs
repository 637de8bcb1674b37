//! Error types for the persistence contracts.

use thiserror::Error;

use crate::{campaign::CampaignId, subscriber::SubscriberId};

/// Errors surfaced by any store or subscriber source backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The campaign does not exist.
    #[error("Campaign not found: {0}")]
    CampaignNotFound(CampaignId),

    /// The subscriber does not exist.
    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),

    /// No audience has been frozen for the campaign.
    #[error("No audience snapshot for campaign {0}")]
    SnapshotMissing(CampaignId),

    /// The backend refused or failed the operation.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The backend is temporarily unreachable; the operation may succeed later.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns `true` if retrying the operation later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
