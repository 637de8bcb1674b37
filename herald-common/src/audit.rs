//! Audit logging for campaign and subscriber lifecycle events
//!
//! Every event is emitted as a structured tracing event with an `event` field
//! naming it, so a JSON or OTLP log pipeline can pick them out.
//!
//! ## Audit Events
//!
//! - `CampaignTransition`: A campaign changed lifecycle state
//! - `DeliverySuccess`: A transport accepted a message
//! - `DeliveryFailure`: A message reached a permanent failure
//! - `BounceRecorded`: A bounce was ingested, correlated or orphaned
//! - `SubscriberSuppressed`: A subscriber's suppression latch was set
//!
//! ## PII Redaction
//!
//! Recipient addresses can be redacted through `AuditConfig`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    bounce::BounceRecord,
    campaign::{CampaignId, CampaignStatus},
    subscriber::SubscriberId,
};

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging for lifecycle events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact the local part of recipient addresses
    #[serde(default)]
    pub redact_recipients: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_recipients: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

static AUDIT_CONFIG: std::sync::OnceLock<Arc<AuditConfig>> = std::sync::OnceLock::new();

/// Initialize audit logging with configuration
pub fn init(config: AuditConfig) {
    AUDIT_CONFIG.get_or_init(|| Arc::new(config));
}

/// Get the current audit configuration
#[must_use]
pub fn config() -> Arc<AuditConfig> {
    AUDIT_CONFIG
        .get()
        .cloned()
        .unwrap_or_else(|| Arc::new(AuditConfig::default()))
}

/// Redact email address if redaction is enabled
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if redact {
        // Keep domain but redact local part
        if let Some((_, domain)) = email.split_once('@') {
            format!("[REDACTED]@{domain}")
        } else {
            "[REDACTED]".to_string()
        }
    } else {
        email.to_string()
    }
}

/// Log a campaign state change
///
/// # Fields
/// - `campaign_id`: Campaign identifier
/// - `from`: Previous status
/// - `to`: New status
/// - `reason`: Free-form cause (operator, scheduler, auto-pause condition)
pub fn log_campaign_transition(
    campaign: CampaignId,
    from: CampaignStatus,
    to: CampaignStatus,
    reason: &str,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    tracing::event!(
        tracing::Level::INFO,
        event = "CampaignTransition",
        campaign_id = %campaign,
        from = %from,
        to = %to,
        reason = %reason,
        "Audit: Campaign transition"
    );
}

/// Log delivery success event
///
/// # Fields
/// - `campaign_id`: Campaign identifier
/// - `subscriber_id`: Subscriber identifier
/// - `recipient`: Recipient address (redacted if configured)
/// - `transport`: Transport that accepted the message
/// - `delivery_attempt`: Final attempt number
pub fn log_delivery_success(
    campaign: CampaignId,
    subscriber: SubscriberId,
    recipient: &str,
    transport: &str,
    attempt: u32,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::INFO,
        event = "DeliverySuccess",
        campaign_id = %campaign,
        subscriber_id = %subscriber,
        recipient = %recipient,
        transport = %transport,
        delivery_attempt = attempt,
        "Audit: Delivery successful"
    );
}

/// Log delivery failure event
///
/// Logged when a message permanently fails, either straight away or after
/// exhausting its retry attempts.
pub fn log_delivery_failure(
    campaign: CampaignId,
    subscriber: SubscriberId,
    recipient: &str,
    error: &str,
    attempt: u32,
) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::WARN,
        event = "DeliveryFailure",
        campaign_id = %campaign,
        subscriber_id = %subscriber,
        recipient = %recipient,
        error = %error,
        delivery_attempt = attempt,
        "Audit: Delivery failed"
    );
}

/// Log an ingested bounce, whether it correlated or not
pub fn log_bounce_recorded(record: &BounceRecord, recipient: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);
    let subscriber = record.subscriber.map(|s| s.to_string());
    let campaign = record.campaign.map(|c| c.to_string());

    tracing::event!(
        tracing::Level::INFO,
        event = "BounceRecorded",
        bounce_id = %record.id,
        recipient = %recipient,
        class = %record.class,
        source = %record.source,
        subscriber_id = ?subscriber,
        campaign_id = ?campaign,
        orphaned = record.is_orphaned(),
        "Audit: Bounce recorded"
    );
}

/// Log a subscriber being suppressed by bounce policy
pub fn log_subscriber_suppressed(subscriber: SubscriberId, recipient: &str, rule: &str) {
    let config = config();
    if !config.enabled {
        return;
    }

    let recipient = redact_email(recipient, config.redact_recipients);

    tracing::event!(
        tracing::Level::WARN,
        event = "SubscriberSuppressed",
        subscriber_id = %subscriber,
        recipient = %recipient,
        rule = %rule,
        "Audit: Subscriber suppressed"
    );
}
