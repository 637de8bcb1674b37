//! Forward Email bounce webhook

use chrono::{DateTime, Utc};
use herald_common::{BounceClass, BounceEvent, BounceSource};
use serde::Deserialize;

use super::{Provider, campaign_from_headers, timestamp_or_now};
use crate::error::WebhookError;

#[derive(Debug, Deserialize)]
struct Payload {
    recipient: String,
    #[serde(default)]
    headers: Headers,
    bounce: Bounce,
    bounced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Bounce {
    /// `reject`, `soft-reject` or `defer`
    action: String,
}

/// Original message headers, sent either as a map or as name/value pairs
#[derive(Debug, Default, Deserialize)]
#[serde(untagged)]
enum Headers {
    #[default]
    Missing,
    Map(serde_json::Map<String, serde_json::Value>),
    List(Vec<Header>),
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

impl Headers {
    fn pairs(&self) -> Vec<(&str, &str)> {
        match self {
            Self::Missing => Vec::new(),
            Self::Map(map) => map
                .iter()
                .filter_map(|(name, value)| value.as_str().map(|value| (name.as_str(), value)))
                .collect(),
            Self::List(list) => list
                .iter()
                .map(|header| (header.name.as_str(), header.value.as_str()))
                .collect(),
        }
    }
}

pub(super) fn parse(body: &[u8]) -> Result<Vec<BounceEvent>, WebhookError> {
    let payload: Payload = serde_json::from_slice(body)?;

    let class = match payload.bounce.action.as_str() {
        "reject" => BounceClass::Hard,
        "soft-reject" | "defer" => BounceClass::Soft,
        other => return Err(WebhookError::Unsupported(other.to_string())),
    };

    Ok(vec![BounceEvent {
        class,
        timestamp: timestamp_or_now(payload.bounced_at),
        raw_payload: String::from_utf8_lossy(body).into_owned(),
        campaign_hint: campaign_from_headers(payload.headers.pairs()),
        source: BounceSource::Webhook(Provider::ForwardEmail.to_string()),
        recipient: payload.recipient,
    }])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::CampaignId;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_reject_with_header_map() {
        let body = br#"{
            "email_id": "6436ea7bd1b4b62a63b1b2ca",
            "recipient": "gone@example.com",
            "message": "550 5.1.1 user unknown",
            "response_code": 550,
            "headers": {"X-Herald-Campaign": "5", "Subject": "Weekly news"},
            "bounce": {"action": "reject", "message": "user unknown", "category": "recipient"},
            "bounced_at": "2024-05-01T09:30:00.000Z"
        }"#;

        let events = parse(body).unwrap();
        assert_eq!(events[0].class, BounceClass::Hard);
        assert_eq!(events[0].campaign_hint, Some(CampaignId(5)));
        assert_eq!(events[0].source, BounceSource::Webhook("forwardemail".into()));
    }

    #[test]
    fn test_defer_with_header_list() {
        let body = br#"{
            "recipient": "busy@example.com",
            "headers": [{"name": "x-herald-campaign", "value": "8"}],
            "bounce": {"action": "defer"}
        }"#;

        let events = parse(body).unwrap();
        assert_eq!(events[0].class, BounceClass::Soft);
        assert_eq!(events[0].campaign_hint, Some(CampaignId(8)));
    }

    #[test]
    fn test_unknown_action() {
        let body = br#"{"recipient": "a@example.com", "bounce": {"action": "explode"}}"#;
        assert!(matches!(parse(body), Err(WebhookError::Unsupported(action)) if action == "explode"));
    }
}
