//! The transport contract and the registry workers resolve transports from
//!
//! A transport is one pluggable way of handing a rendered message to the
//! outside world (SMTP relay, provider API, ...). Implementations live outside
//! this crate; the engine only needs a name, a declared sustained rate, an
//! optional concurrency hint and `send`.

use std::sync::Arc;

use async_trait::async_trait;
use herald_common::{RateLimit, RenderedMessage};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::rate_limiter::{RateLimitConfig, RateLimiter};

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Name campaigns use to select this transport
    fn name(&self) -> &str;

    /// Maximum sustained rate this transport accepts
    fn rate_limit(&self) -> RateLimit;

    /// Maximum concurrent `send` calls, unlimited when `None`
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Attempt delivery of one message
    ///
    /// # Errors
    /// A `TransportError` classifying the failure as transient or permanent
    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError>;
}

/// Failure reported by a transport for a single attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying with backoff
    #[error("Transient failure: {0}")]
    Transient(#[from] TransientError),

    /// Never retried
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransientError {
    /// The attempt exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The provider asked us to slow down
    #[error("Throttled: {0}")]
    Throttled(String),

    /// The provider or relay could not be reached
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PermanentError {
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The provider refused the message (policy, content, account)
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The receiving system reported the mailbox as permanently undeliverable
    #[error("Hard bounce: {0}")]
    HardBounce(String),
}

impl TransportError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Whether the transport reported an inline hard bounce
    #[must_use]
    pub const fn signals_hard_bounce(&self) -> bool {
        matches!(self, Self::Permanent(PermanentError::HardBounce(_)))
    }

    /// Short label used for metrics and audit
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Transient(TransientError::Timeout(_)) => "timeout",
            Self::Transient(TransientError::Throttled(_)) => "throttled",
            Self::Transient(TransientError::Unavailable(_)) => "unavailable",
            Self::Permanent(PermanentError::InvalidRecipient(_)) => "invalid_recipient",
            Self::Permanent(PermanentError::Rejected(_)) => "rejected",
            Self::Permanent(PermanentError::HardBounce(_)) => "hard_bounce",
        }
    }
}

/// A registered transport with the gates every worker shares for it
#[derive(Debug)]
pub struct Lane {
    transport: Arc<dyn Transport>,
    limiter: Option<RateLimiter>,
    concurrency: Option<Arc<Semaphore>>,
}

impl Lane {
    #[must_use]
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    #[must_use]
    pub const fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    #[must_use]
    pub const fn concurrency(&self) -> Option<&Arc<Semaphore>> {
        self.concurrency.as_ref()
    }
}

/// Transports by name
#[derive(Debug, Default)]
pub struct TransportRegistry {
    limits: RateLimitConfig,
    lanes: ahash::AHashMap<String, Arc<Lane>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            limits,
            lanes: ahash::AHashMap::default(),
        }
    }

    /// Register a transport, replacing any previous one with the same name
    ///
    /// A configured per-transport rate takes precedence over the rate the
    /// transport declares.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        let name = transport.name().to_string();
        let limit = self
            .limits
            .transports
            .get(&name)
            .copied()
            .unwrap_or_else(|| transport.rate_limit());

        let lane = Lane {
            limiter: RateLimiter::new(limit).or_else(|| self.limits.default.and_then(RateLimiter::new)),
            concurrency: transport
                .max_concurrency()
                .map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
            transport,
        };

        tracing::debug!(
            transport = %name,
            messages_per_second = limit.messages_per_second,
            burst_size = limit.burst_size,
            "Registered transport"
        );

        self.lanes.insert(name, Arc::new(lane));
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Lane>> {
        self.lanes.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.lanes.contains_key(name)
    }
}
