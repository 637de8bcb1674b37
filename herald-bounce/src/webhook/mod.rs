//! Provider webhook normalisation
//!
//! Each provider posts bounces and complaints in its own shape. The adapters
//! here parse those bodies into `BounceEvent`s before anything reaches the
//! correlator. Receiving the HTTP request is left to the embedding service;
//! only the body is handled here.
//!
//! Notifications that are not bounces or complaints (deliveries, opens, ...)
//! normalise to no events rather than an error.

mod forwardemail;
mod postmark;
mod sendgrid;
mod ses;

use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use herald_common::{BounceEvent, CAMPAIGN_HEADER, CampaignId};
use serde::{Deserialize, Serialize};

use crate::error::WebhookError;

/// Metadata / custom-argument key providers echo back to us
pub const CAMPAIGN_METADATA_KEY: &str = "herald_campaign";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ses,
    SendGrid,
    Postmark,
    ForwardEmail,
}

impl Provider {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ses => "ses",
            Self::SendGrid => "sendgrid",
            Self::Postmark => "postmark",
            Self::ForwardEmail => "forwardemail",
        }
    }
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = WebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ses" => Ok(Self::Ses),
            "sendgrid" => Ok(Self::SendGrid),
            "postmark" => Ok(Self::Postmark),
            "forwardemail" => Ok(Self::ForwardEmail),
            other => Err(WebhookError::Unsupported(other.to_string())),
        }
    }
}

/// Parse a provider webhook body into bounce events
///
/// # Errors
/// A `WebhookError` if the body does not have the provider's shape, or
/// `SubscriptionConfirmation` when SES asks for the endpoint to be confirmed
pub fn normalize(provider: Provider, body: &[u8]) -> Result<Vec<BounceEvent>, WebhookError> {
    let events = match provider {
        Provider::Ses => ses::parse(body),
        Provider::SendGrid => sendgrid::parse(body),
        Provider::Postmark => postmark::parse(body),
        Provider::ForwardEmail => forwardemail::parse(body),
    }?;

    herald_common::incoming!(
        level = DEBUG,
        "Normalised {} bounce events from {provider} webhook",
        events.len()
    );

    Ok(events)
}

/// Read the campaign hint out of a set of header name/value pairs
pub(crate) fn campaign_from_headers<'a>(
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Option<CampaignId> {
    headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(CAMPAIGN_HEADER))
        .and_then(|(_, value)| value.parse().ok())
}

/// Read the campaign hint out of a JSON metadata object
pub(crate) fn campaign_from_metadata(
    metadata: Option<&serde_json::Map<String, serde_json::Value>>,
) -> Option<CampaignId> {
    let metadata = metadata?;
    let value = metadata
        .get(CAMPAIGN_METADATA_KEY)
        .or_else(|| metadata.get(CAMPAIGN_HEADER))?;

    match value {
        serde_json::Value::String(id) => id.parse().ok(),
        serde_json::Value::Number(id) => id.as_u64().map(CampaignId),
        _ => None,
    }
}

/// Providers occasionally omit timestamps; fall back to arrival time
pub(crate) fn timestamp_or_now(timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
    timestamp.unwrap_or_else(Utc::now)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        assert_eq!("SES".parse::<Provider>().unwrap(), Provider::Ses);
        assert_eq!("sendgrid".parse::<Provider>().unwrap(), Provider::SendGrid);
        assert_eq!(Provider::ForwardEmail.to_string(), "forwardemail");
        assert!("mailgun".parse::<Provider>().is_err());
    }

    #[test]
    fn test_campaign_hints() {
        let headers = [("From", "news@example.com"), ("x-herald-campaign", " 42 ")];
        assert_eq!(campaign_from_headers(headers), Some(CampaignId(42)));

        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"herald_campaign": 7}"#).unwrap();
        assert_eq!(campaign_from_metadata(Some(&metadata)), Some(CampaignId(7)));

        let metadata: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"herald_campaign": "nope"}"#).unwrap();
        assert_eq!(campaign_from_metadata(Some(&metadata)), None);
        assert_eq!(campaign_from_metadata(None), None);
    }
}
