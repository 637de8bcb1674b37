use herald_common::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BounceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The correlator task is no longer running
    #[error("Bounce correlator has stopped")]
    Closed,
}

/// Why a bounce could not be tied to a sent message
///
/// Misses are retained as orphaned records and never escalated.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CorrelationMiss {
    #[error("recipient is not a known subscriber")]
    UnknownRecipient,

    #[error("no matching send in the correlation window")]
    NoMatchingSend,
}

impl CorrelationMiss {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownRecipient => "unknown_recipient",
            Self::NoMatchingSend => "no_matching_send",
        }
    }
}

/// A webhook body that could not be normalised
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Unsupported notification type: {0}")]
    Unsupported(String),

    /// SNS wants the endpoint confirmed before it sends notifications
    #[error("Subscription confirmation required: {subscribe_url}")]
    SubscriptionConfirmation { subscribe_url: String },
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("Unable to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    /// A regular message that landed in the bounce mailbox
    #[error("Not a delivery status or feedback report")]
    NotABounce,

    #[error("Report has no recipient")]
    MissingRecipient,

    #[error("Mailbox fetch failed: {0}")]
    Fetch(String),
}
