//! SendGrid event webhook
//!
//! The body is an array of events. Custom arguments set at send time come
//! back as top-level keys on each event.

use chrono::DateTime;
use herald_common::{BounceClass, BounceEvent, BounceSource};
use serde::Deserialize;

use super::{Provider, campaign_from_metadata, timestamp_or_now};
use crate::error::WebhookError;

#[derive(Debug, Deserialize)]
struct Event {
    email: String,
    event: String,
    /// Unix seconds
    timestamp: Option<i64>,
    /// `bounce` or `blocked` on bounce events
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    fn class(&self) -> Option<BounceClass> {
        match self.event.as_str() {
            "bounce" if self.kind.as_deref() == Some("blocked") => Some(BounceClass::Soft),
            "bounce" | "dropped" => Some(BounceClass::Hard),
            "blocked" => Some(BounceClass::Soft),
            "spamreport" => Some(BounceClass::Complaint),
            _ => None,
        }
    }
}

pub(super) fn parse(body: &[u8]) -> Result<Vec<BounceEvent>, WebhookError> {
    let events: Vec<serde_json::Value> = serde_json::from_slice(body)?;

    events
        .into_iter()
        .filter_map(|value| {
            let raw = value.to_string();
            let event = match serde_json::from_value::<Event>(value) {
                Ok(event) => event,
                Err(err) => return Some(Err(WebhookError::from(err))),
            };
            let class = event.class()?;

            Some(Ok(BounceEvent {
                recipient: event.email.clone(),
                class,
                timestamp: timestamp_or_now(
                    event
                        .timestamp
                        .and_then(|secs| DateTime::from_timestamp(secs, 0)),
                ),
                raw_payload: raw,
                campaign_hint: campaign_from_metadata(Some(&event.extra)),
                source: BounceSource::Webhook(Provider::SendGrid.to_string()),
            }))
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::CampaignId;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_event_batch() {
        let body = br#"[
            {"email": "a@example.com", "event": "delivered", "timestamp": 1714564800},
            {"email": "b@example.com", "event": "bounce", "type": "bounce", "timestamp": 1714564800,
             "reason": "550 5.1.1 unknown user", "herald_campaign": "9"},
            {"email": "c@example.com", "event": "bounce", "type": "blocked", "timestamp": 1714564800},
            {"email": "d@example.com", "event": "spamreport", "timestamp": 1714564800}
        ]"#;

        let events = parse(body).unwrap();
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.recipient.as_str(), e.class, e.campaign_hint))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("b@example.com", BounceClass::Hard, Some(CampaignId(9))),
                ("c@example.com", BounceClass::Soft, None),
                ("d@example.com", BounceClass::Complaint, None),
            ]
        );
        assert_eq!(events[0].timestamp.timestamp(), 1_714_564_800);
        assert!(events[0].raw_payload.contains("unknown user"));
    }

    #[test]
    fn test_rejects_non_array() {
        assert!(matches!(
            parse(br#"{"email": "a@example.com"}"#),
            Err(WebhookError::Json(_))
        ));
    }
}
