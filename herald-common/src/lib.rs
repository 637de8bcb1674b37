//! Shared building blocks for the herald campaign dispatcher
//!
//! This crate holds everything the dispatch engine and the bounce correlator
//! both need to agree on:
//! - The data model (campaigns, subscribers, bounces, rendered messages)
//! - The persistence contracts the engine reads and writes through
//! - An in-memory backend for those contracts
//! - Logging initialisation, log macros and audit events

pub mod audit;
pub mod bounce;
pub mod campaign;
pub mod error;
pub mod logging;
pub mod message;
pub mod store;
pub mod subscriber;

pub use bounce::{BounceClass, BounceEvent, BounceId, BounceRecord, BounceSource};
pub use campaign::{
    AutoPauseReason, Campaign, CampaignId, CampaignStatus, Counters, ListId, PauseReason,
    RateLimit, TemplateId,
};
pub use error::StoreError;
pub use message::{CAMPAIGN_HEADER, DeliveryOutcome, RenderedMessage, SUBSCRIBER_HEADER, SentRecord};
pub use store::{
    BounceStore, CampaignStore, Cursor, DeliveryLedger, MemoryStore, Page, Snapshot,
    SubscriberSource, SubscriberStore,
};
pub use subscriber::{BounceCounters, Subscriber, SubscriberId, SubscriptionStatus};
pub use tracing;

/// Process-wide lifecycle signal broadcast to long running tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
