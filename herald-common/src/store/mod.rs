//! Persistence contracts
//!
//! The engine never talks to a database directly. Everything it needs is
//! expressed by the traits in this module:
//! - `CampaignStore`: campaign definitions, status, counters and cursor
//! - `SubscriberStore`: subscriber lookups and the suppression latch
//! - `BounceStore`: immutable bounce records
//! - `DeliveryLedger`: terminal send outcomes, used to correlate bounces
//! - `SubscriberSource`: paged, snapshot-bounded iteration over a campaign's audience
//!
//! `MemoryStore` implements all of them and is what the tests and the
//! dry-run binary use.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use self::memory::MemoryStore;
use crate::{
    bounce::{BounceClass, BounceRecord},
    campaign::{Campaign, CampaignId, CampaignStatus},
    error::StoreError,
    message::SentRecord,
    subscriber::{Subscriber, SubscriberId},
};

pub type Result<T> = core::result::Result<T, StoreError>;

#[async_trait]
pub trait CampaignStore: Send + Sync + std::fmt::Debug {
    /// Load a campaign
    ///
    /// # Errors
    /// `StoreError::CampaignNotFound` if no campaign has this id
    async fn get_campaign(&self, id: CampaignId) -> Result<Campaign>;

    /// Insert or replace a campaign
    ///
    /// # Errors
    /// If the backend fails to persist the campaign
    async fn save_campaign(&self, campaign: &Campaign) -> Result<()>;

    /// List campaigns, optionally restricted to one status
    ///
    /// # Errors
    /// If the backend fails to enumerate campaigns
    async fn list_campaigns(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>>;
}

#[async_trait]
pub trait SubscriberStore: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// `StoreError::SubscriberNotFound` if no subscriber has this id
    async fn get_subscriber(&self, id: SubscriberId) -> Result<Subscriber>;

    /// Resolve a recipient address (case-insensitive)
    ///
    /// # Errors
    /// If the backend lookup fails
    async fn find_by_email(&self, email: &str) -> Result<Option<Subscriber>>;

    /// # Errors
    /// If the backend lookup fails
    async fn is_suppressed(&self, id: SubscriberId) -> Result<bool>;

    /// Bump the per-class bounce counter for a subscriber
    ///
    /// # Errors
    /// If the subscriber does not exist or the backend fails
    async fn record_bounce(&self, id: SubscriberId, class: BounceClass) -> Result<()>;

    /// Set the suppression latch
    ///
    /// Returns `true` if the subscriber was not suppressed before this call.
    /// There is no way to clear the latch through this trait.
    ///
    /// # Errors
    /// If the subscriber does not exist or the backend fails
    async fn suppress(&self, id: SubscriberId) -> Result<bool>;
}

#[async_trait]
pub trait BounceStore: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// If the backend fails to persist the record
    async fn insert_bounce(&self, record: &BounceRecord) -> Result<()>;

    /// Count correlated (non-orphaned) bounces of `class` for a subscriber at or after `since`
    ///
    /// # Errors
    /// If the backend query fails
    async fn count_bounces(
        &self,
        subscriber: SubscriberId,
        class: BounceClass,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// # Errors
    /// If the backend query fails
    async fn list_bounces(&self, subscriber: Option<SubscriberId>) -> Result<Vec<BounceRecord>>;
}

#[async_trait]
pub trait DeliveryLedger: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// If the backend fails to persist the record
    async fn record_sent(&self, record: &SentRecord) -> Result<()>;

    /// Find the send a bounce most likely refers to
    ///
    /// With a campaign hint, returns the latest entry for that
    /// (subscriber, campaign) pair regardless of age. Without one, returns the
    /// latest entry for the subscriber inside `[since, until]`.
    ///
    /// # Errors
    /// If the backend query fails
    async fn find_sent(
        &self,
        subscriber: SubscriberId,
        campaign_hint: Option<CampaignId>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<SentRecord>>;
}

/// Summary of the audience frozen when a campaign starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Highest eligible subscriber id at capture time, `None` when nobody is eligible
    pub ceiling: Option<SubscriberId>,
    pub total: u64,
}

/// Position in a snapshot-bounded iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Only subscribers with an id strictly greater than this are returned
    pub after: Option<SubscriberId>,
    /// Only subscribers with an id less than or equal to this are returned
    pub ceiling: SubscriberId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Eligible subscribers in ascending id order
    pub subscribers: Vec<Subscriber>,
    /// Cursor for the following page
    pub next: Cursor,
    /// No audience members remain below the ceiling
    pub done: bool,
}

#[async_trait]
pub trait SubscriberSource: Send + Sync + std::fmt::Debug {
    /// Count the subscribers currently on any of a campaign's target lists
    ///
    /// Nothing is recorded; this is what scheduling validates against.
    ///
    /// # Errors
    /// If the backend fails
    async fn count_eligible(&self, campaign: &Campaign) -> Result<u64>;

    /// Freeze the eligible audience of a campaign
    ///
    /// Taking a new snapshot replaces the previous one for that campaign.
    /// Subscribers who join a target list afterwards are not part of it.
    ///
    /// # Errors
    /// If the backend fails
    async fn snapshot(&self, campaign: &Campaign) -> Result<Snapshot>;

    /// Fetch the next page of a campaign's frozen audience
    ///
    /// Members who have since left every target list are passed over.
    ///
    /// # Errors
    /// `SnapshotMissing` if no snapshot was taken for the campaign, or if the
    /// campaign does not exist or the backend query fails
    async fn fetch_page(
        &self,
        campaign: CampaignId,
        cursor: Cursor,
        page_size: usize,
    ) -> Result<Page>;
}
