//! The built-in dry-run transport
//!
//! Real transports (SMTP relays, provider APIs) are plugged in by embedding
//! `herald-dispatch`. The binary ships a transport that only logs what it
//! would have sent, so a configuration can be exercised end to end.

use async_trait::async_trait;
use herald_common::{RateLimit, RenderedMessage, outgoing};
use herald_dispatch::{Transport, TransportError};
use serde::Deserialize;

mod defaults {
    pub const fn messages_per_second() -> f64 {
        10.0
    }

    pub const fn burst_size() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Name campaigns select this transport by
    pub name: String,

    #[serde(default = "defaults::messages_per_second")]
    pub messages_per_second: f64,

    #[serde(default = "defaults::burst_size")]
    pub burst_size: u32,

    /// Concurrent sends allowed, unlimited when absent
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

/// Logs every message instead of delivering it
#[derive(Debug)]
pub struct LogTransport {
    config: TransportConfig,
}

impl LogTransport {
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for LogTransport {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit::new(self.config.messages_per_second, self.config.burst_size)
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.config.max_concurrency
    }

    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError> {
        outgoing!(
            level = INFO,
            "[{}] To: {} Subject: {} ({} bytes, campaign {})",
            self.config.name,
            message.to,
            message.subject,
            message.body.len(),
            message
                .campaign_hint()
                .map_or_else(|| "-".to_string(), |campaign| campaign.to_string())
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::CAMPAIGN_HEADER;

    use super::*;

    #[tokio::test]
    async fn test_log_transport_accepts_everything() {
        let config: TransportConfig = ron::from_str(r#"(name: "log", max_concurrency: Some(2))"#).unwrap();
        let transport = LogTransport::new(config);

        assert_eq!(transport.name(), "log");
        assert_eq!(transport.rate_limit(), RateLimit::new(10.0, 1));
        assert_eq!(transport.max_concurrency(), Some(2));

        let mut message = RenderedMessage {
            to: "someone@example.com".to_string(),
            subject: "Hi".to_string(),
            ..RenderedMessage::default()
        };
        message.set_header(CAMPAIGN_HEADER, "7");
        assert!(transport.send(&message).await.is_ok());
    }
}
