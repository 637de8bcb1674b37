//! Postmark bounce and spam complaint webhooks

use chrono::{DateTime, Utc};
use herald_common::{BounceClass, BounceEvent, BounceSource};
use serde::Deserialize;

use super::{Provider, campaign_from_metadata, timestamp_or_now};
use crate::error::WebhookError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Record {
    record_type: String,
    #[serde(rename = "Type")]
    kind: Option<String>,
    email: String,
    bounced_at: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Postmark bounce types that are not delivery failures at all
const IGNORED: &[&str] = &[
    "AutoResponder",
    "Subscribe",
    "Unsubscribe",
    "OpenRelayTest",
    "ChallengeVerification",
    "AddressChange",
];

fn class(record: &Record) -> Option<BounceClass> {
    match (record.record_type.as_str(), record.kind.as_deref()) {
        ("SpamComplaint", _) | ("Bounce", Some("SpamComplaint" | "SpamNotification")) => {
            Some(BounceClass::Complaint)
        }
        ("Bounce", Some("HardBounce" | "BadEmailAddress" | "ManuallyDeactivated")) => {
            Some(BounceClass::Hard)
        }
        ("Bounce", Some(kind)) if IGNORED.contains(&kind) => None,
        ("Bounce", _) => Some(BounceClass::Soft),
        _ => None,
    }
}

pub(super) fn parse(body: &[u8]) -> Result<Vec<BounceEvent>, WebhookError> {
    let record: Record = serde_json::from_slice(body)?;

    let Some(class) = class(&record) else {
        return Ok(Vec::new());
    };

    Ok(vec![BounceEvent {
        class,
        timestamp: timestamp_or_now(record.bounced_at),
        raw_payload: String::from_utf8_lossy(body).into_owned(),
        campaign_hint: campaign_from_metadata(record.metadata.as_ref()),
        source: BounceSource::Webhook(Provider::Postmark.to_string()),
        recipient: record.email,
    }])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::CampaignId;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_hard_bounce() {
        let body = br#"{
            "RecordType": "Bounce",
            "ID": 4323372036854775807,
            "Type": "HardBounce",
            "TypeCode": 1,
            "Email": "john@example.com",
            "BouncedAt": "2024-05-01T10:00:00Z",
            "Metadata": {"herald_campaign": "3"}
        }"#;

        let events = parse(body).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].class, BounceClass::Hard);
        assert_eq!(events[0].recipient, "john@example.com");
        assert_eq!(events[0].campaign_hint, Some(CampaignId(3)));
    }

    #[test]
    fn test_classification() {
        let parse_kind = |record_type: &str, kind: &str| {
            let body = serde_json::json!({
                "RecordType": record_type,
                "Type": kind,
                "Email": "x@example.com",
            });
            parse(body.to_string().as_bytes())
                .unwrap()
                .first()
                .map(|event| event.class)
        };

        assert_eq!(parse_kind("Bounce", "SoftBounce"), Some(BounceClass::Soft));
        assert_eq!(parse_kind("Bounce", "Transient"), Some(BounceClass::Soft));
        assert_eq!(parse_kind("SpamComplaint", "SpamComplaint"), Some(BounceClass::Complaint));
        assert_eq!(parse_kind("Bounce", "AutoResponder"), None);
        assert_eq!(parse_kind("Delivery", ""), None);
    }
}
