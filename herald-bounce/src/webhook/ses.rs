//! Amazon SES notifications, delivered through SNS
//!
//! SNS wraps the SES notification as a JSON string in `Message`. Bodies that
//! are already the bare SES notification (SES event publishing) are accepted
//! too.

use chrono::{DateTime, Utc};
use herald_common::{BounceClass, BounceEvent, BounceSource};
use serde::Deserialize;

use super::{Provider, campaign_from_headers, timestamp_or_now};
use crate::error::WebhookError;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
    #[serde(rename = "SubscribeURL")]
    subscribe_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Notification {
    notification_type: Option<String>,
    event_type: Option<String>,
    bounce: Option<Bounce>,
    complaint: Option<Complaint>,
    mail: Option<Mail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Bounce {
    bounce_type: String,
    bounced_recipients: Vec<Recipient>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Complaint {
    complained_recipients: Vec<Recipient>,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct Mail {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

pub(super) fn parse(body: &[u8]) -> Result<Vec<BounceEvent>, WebhookError> {
    let envelope: Envelope = serde_json::from_slice(body)?;

    let raw = match envelope.kind.as_deref() {
        Some("SubscriptionConfirmation") => {
            return Err(WebhookError::SubscriptionConfirmation {
                subscribe_url: envelope
                    .subscribe_url
                    .ok_or(WebhookError::MissingField("SubscribeURL"))?,
            });
        }
        Some("UnsubscribeConfirmation") => return Ok(Vec::new()),
        Some("Notification") => envelope.message.ok_or(WebhookError::MissingField("Message"))?,
        Some(other) => return Err(WebhookError::Unsupported(other.to_string())),
        None => String::from_utf8_lossy(body).into_owned(),
    };

    let notification: Notification = serde_json::from_str(&raw)?;
    let kind = notification
        .notification_type
        .as_deref()
        .or(notification.event_type.as_deref())
        .ok_or(WebhookError::MissingField("notificationType"))?;

    let campaign_hint = notification.mail.as_ref().and_then(|mail| {
        campaign_from_headers(
            mail.headers
                .iter()
                .map(|header| (header.name.as_str(), header.value.as_str())),
        )
    });

    let event = |recipient: &Recipient, class, timestamp| BounceEvent {
        recipient: recipient.email_address.clone(),
        class,
        timestamp: timestamp_or_now(timestamp),
        raw_payload: raw.clone(),
        campaign_hint,
        source: BounceSource::Webhook(Provider::Ses.to_string()),
    };

    match kind {
        "Bounce" => {
            let bounce = notification
                .bounce
                .ok_or(WebhookError::MissingField("bounce"))?;
            let class = if bounce.bounce_type == "Permanent" {
                BounceClass::Hard
            } else {
                BounceClass::Soft
            };
            Ok(bounce
                .bounced_recipients
                .iter()
                .map(|recipient| event(recipient, class, bounce.timestamp))
                .collect())
        }
        "Complaint" => {
            let complaint = notification
                .complaint
                .ok_or(WebhookError::MissingField("complaint"))?;
            Ok(complaint
                .complained_recipients
                .iter()
                .map(|recipient| event(recipient, BounceClass::Complaint, complaint.timestamp))
                .collect())
        }
        _ => Ok(Vec::new()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::CampaignId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn sns(message: &serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "Type": "Notification",
            "MessageId": "22b80b92-fdea-4c2c-8f9d-bdfb0c7bf324",
            "Message": message.to_string(),
        }))
        .unwrap()
    }

    #[test]
    fn test_permanent_bounce() {
        let body = sns(&serde_json::json!({
            "notificationType": "Bounce",
            "bounce": {
                "bounceType": "Permanent",
                "bounceSubType": "General",
                "bouncedRecipients": [
                    { "emailAddress": "jane@example.com", "status": "5.1.1" },
                    { "emailAddress": "richard@example.com" }
                ],
                "timestamp": "2024-05-01T12:00:00.000Z"
            },
            "mail": {
                "headers": [{ "name": "X-Herald-Campaign", "value": "12" }]
            }
        }));

        let events = parse(&body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].recipient, "jane@example.com");
        assert_eq!(events[0].class, BounceClass::Hard);
        assert_eq!(events[0].campaign_hint, Some(CampaignId(12)));
        assert_eq!(events[1].source, BounceSource::Webhook("ses".into()));
        assert_eq!(events[0].timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    }

    #[test]
    fn test_transient_bounce_and_complaint() {
        let body = sns(&serde_json::json!({
            "notificationType": "Bounce",
            "bounce": {
                "bounceType": "Transient",
                "bouncedRecipients": [{ "emailAddress": "full@example.com" }]
            }
        }));
        let events = parse(&body).unwrap();
        assert_eq!(events[0].class, BounceClass::Soft);
        assert_eq!(events[0].campaign_hint, None);

        let body = br#"{
            "eventType": "Complaint",
            "complaint": { "complainedRecipients": [{ "emailAddress": "angry@example.com" }] }
        }"#;
        let events = parse(body).unwrap();
        assert_eq!(events[0].class, BounceClass::Complaint);
        assert_eq!(events[0].recipient, "angry@example.com");
    }

    #[test]
    fn test_subscription_confirmation() {
        let body = br#"{
            "Type": "SubscriptionConfirmation",
            "SubscribeURL": "https://sns.us-east-1.amazonaws.com/?Action=ConfirmSubscription"
        }"#;

        let err = parse(body).unwrap_err();
        assert!(matches!(
            err,
            WebhookError::SubscriptionConfirmation { subscribe_url } if subscribe_url.contains("ConfirmSubscription")
        ));
    }

    #[test]
    fn test_delivery_is_ignored() {
        let body = sns(&serde_json::json!({ "notificationType": "Delivery" }));
        assert!(parse(&body).unwrap().is_empty());
    }
}
