use core::ops::Bound;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    BounceStore, CampaignStore, Cursor, DeliveryLedger, Page, Result, Snapshot, SubscriberSource,
    SubscriberStore,
};
use crate::{
    bounce::{BounceClass, BounceRecord},
    campaign::{Campaign, CampaignId, CampaignStatus},
    error::StoreError,
    message::SentRecord,
    subscriber::{Subscriber, SubscriberId},
};

#[derive(Debug, Default)]
struct Inner {
    campaigns: BTreeMap<CampaignId, Campaign>,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    by_email: HashMap<String, SubscriberId>,
    bounces: Vec<BounceRecord>,
    ledger: Vec<SentRecord>,
    /// Frozen audience per campaign, captured by `snapshot`
    audiences: HashMap<CampaignId, BTreeSet<SubscriberId>>,
}

/// In-memory implementation of every persistence contract
///
/// Cloning is cheap and every clone shares the same data, so one instance can
/// be handed to the engine as all of its stores at once.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a subscriber
    pub fn upsert_subscriber(&self, subscriber: Subscriber) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.subscribers.get(&subscriber.id) {
            let stale = previous.email.to_ascii_lowercase();
            inner.by_email.remove(&stale);
        }
        inner
            .by_email
            .insert(subscriber.email.to_ascii_lowercase(), subscriber.id);
        inner.subscribers.insert(subscriber.id, subscriber);
    }

    /// Insert or replace a campaign without going through the async trait
    pub fn insert_campaign(&self, campaign: Campaign) {
        self.inner.write().campaigns.insert(campaign.id, campaign);
    }

    #[must_use]
    pub fn campaign(&self, id: CampaignId) -> Option<Campaign> {
        self.inner.read().campaigns.get(&id).cloned()
    }

    #[must_use]
    pub fn subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
        self.inner.read().subscribers.get(&id).cloned()
    }

    /// Every ledger entry, in insertion order
    #[must_use]
    pub fn sent_records(&self) -> Vec<SentRecord> {
        self.inner.read().ledger.clone()
    }

    /// Every bounce record, in insertion order
    #[must_use]
    pub fn bounce_records(&self) -> Vec<BounceRecord> {
        self.inner.read().bounces.clone()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn get_campaign(&self, id: CampaignId) -> Result<Campaign> {
        self.campaign(id).ok_or(StoreError::CampaignNotFound(id))
    }

    async fn save_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.insert_campaign(campaign.clone());
        Ok(())
    }

    async fn list_campaigns(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>> {
        Ok(self
            .inner
            .read()
            .campaigns
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn get_subscriber(&self, id: SubscriberId) -> Result<Subscriber> {
        self.subscriber(id).ok_or(StoreError::SubscriberNotFound(id))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        let inner = self.inner.read();
        Ok(inner
            .by_email
            .get(&email.trim().to_ascii_lowercase())
            .and_then(|id| inner.subscribers.get(id))
            .cloned())
    }

    async fn is_suppressed(&self, id: SubscriberId) -> Result<bool> {
        self.inner
            .read()
            .subscribers
            .get(&id)
            .map(|s| s.suppressed)
            .ok_or(StoreError::SubscriberNotFound(id))
    }

    async fn record_bounce(&self, id: SubscriberId, class: BounceClass) -> Result<()> {
        let mut inner = self.inner.write();
        let subscriber = inner
            .subscribers
            .get_mut(&id)
            .ok_or(StoreError::SubscriberNotFound(id))?;
        subscriber.bounces.increment(class);
        Ok(())
    }

    async fn suppress(&self, id: SubscriberId) -> Result<bool> {
        let mut inner = self.inner.write();
        let subscriber = inner
            .subscribers
            .get_mut(&id)
            .ok_or(StoreError::SubscriberNotFound(id))?;
        let newly = !subscriber.suppressed;
        subscriber.suppressed = true;
        Ok(newly)
    }
}

#[async_trait]
impl BounceStore for MemoryStore {
    async fn insert_bounce(&self, record: &BounceRecord) -> Result<()> {
        self.inner.write().bounces.push(record.clone());
        Ok(())
    }

    async fn count_bounces(
        &self,
        subscriber: SubscriberId,
        class: BounceClass,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count = self
            .inner
            .read()
            .bounces
            .iter()
            .filter(|b| {
                !b.is_orphaned()
                    && b.subscriber == Some(subscriber)
                    && b.class == class
                    && b.timestamp >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn list_bounces(&self, subscriber: Option<SubscriberId>) -> Result<Vec<BounceRecord>> {
        Ok(self
            .inner
            .read()
            .bounces
            .iter()
            .filter(|b| subscriber.is_none() || b.subscriber == subscriber)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeliveryLedger for MemoryStore {
    async fn record_sent(&self, record: &SentRecord) -> Result<()> {
        self.inner.write().ledger.push(record.clone());
        Ok(())
    }

    async fn find_sent(
        &self,
        subscriber: SubscriberId,
        campaign_hint: Option<CampaignId>,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<SentRecord>> {
        let inner = self.inner.read();
        let matching = inner.ledger.iter().filter(|r| r.subscriber == subscriber);

        let found = match campaign_hint {
            Some(campaign) => matching.filter(|r| r.campaign == campaign).max_by_key(|r| r.at),
            None => matching
                .filter(|r| r.at >= since && r.at <= until)
                .max_by_key(|r| r.at),
        };

        Ok(found.cloned())
    }
}

#[async_trait]
impl SubscriberSource for MemoryStore {
    async fn count_eligible(&self, campaign: &Campaign) -> Result<u64> {
        let count = self
            .inner
            .read()
            .subscribers
            .values()
            .filter(|s| s.is_subscribed_to_any(&campaign.lists))
            .count();
        Ok(count as u64)
    }

    async fn snapshot(&self, campaign: &Campaign) -> Result<Snapshot> {
        let mut inner = self.inner.write();
        let audience: BTreeSet<SubscriberId> = inner
            .subscribers
            .values()
            .filter(|s| s.is_subscribed_to_any(&campaign.lists))
            .map(|s| s.id)
            .collect();

        let snapshot = Snapshot {
            ceiling: audience.last().copied(),
            total: audience.len() as u64,
        };
        inner.audiences.insert(campaign.id, audience);
        Ok(snapshot)
    }

    async fn fetch_page(
        &self,
        campaign: CampaignId,
        cursor: Cursor,
        page_size: usize,
    ) -> Result<Page> {
        let inner = self.inner.read();
        let lists = inner
            .campaigns
            .get(&campaign)
            .map(|c| c.lists.clone())
            .ok_or(StoreError::CampaignNotFound(campaign))?;
        let audience = inner
            .audiences
            .get(&campaign)
            .ok_or(StoreError::SnapshotMissing(campaign))?;

        if cursor.after.is_some_and(|after| after >= cursor.ceiling) {
            return Ok(Page {
                subscribers: Vec::new(),
                next: cursor,
                done: true,
            });
        }

        let lower = cursor
            .after
            .map_or(Bound::Unbounded, Bound::Excluded);
        let mut remaining = audience
            .range((lower, Bound::Included(cursor.ceiling)))
            .filter_map(|id| inner.subscribers.get(id))
            .filter(|s| s.is_subscribed_to_any(&lists))
            .peekable();
        let subscribers: Vec<Subscriber> = remaining.by_ref().take(page_size).cloned().collect();
        let done = remaining.peek().is_none();

        let next = Cursor {
            after: subscribers.last().map(|s| s.id).or(cursor.after),
            ceiling: cursor.ceiling,
        };

        Ok(Page {
            subscribers,
            next,
            done,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::{
        bounce::{BounceId, BounceSource},
        campaign::{ListId, TemplateId},
        message::DeliveryOutcome,
        subscriber::SubscriptionStatus,
    };

    fn campaign() -> Campaign {
        Campaign::draft(CampaignId(1), "test", vec![ListId(1)], TemplateId(1), "log")
    }

    fn seed(store: &MemoryStore, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            store.upsert_subscriber(
                Subscriber::new(SubscriberId(id), format!("user{id}@example.com"))
                    .subscribed_to(ListId(1)),
            );
        }
    }

    #[tokio::test]
    async fn test_snapshot_counts_list_members() {
        let store = MemoryStore::new();
        seed(&store, 1..=5);

        let mut unsubscribed = store.subscriber(SubscriberId(3)).unwrap();
        unsubscribed
            .lists
            .insert(ListId(1), SubscriptionStatus::Unsubscribed);
        store.upsert_subscriber(unsubscribed);
        store.suppress(SubscriberId(5)).await.unwrap();
        store.upsert_subscriber(Subscriber::new(SubscriberId(9), "other@example.com"));

        // Suppressed members stay in the audience and are skipped at dispatch time
        assert_eq!(store.count_eligible(&campaign()).await.unwrap(), 4);
        let snapshot = store.snapshot(&campaign()).await.unwrap();
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.ceiling, Some(SubscriberId(5)));
    }

    #[tokio::test]
    async fn test_pages_respect_ceiling_and_cursor() {
        let store = MemoryStore::new();
        seed(&store, 1..=5);

        store.insert_campaign(campaign());
        store.snapshot(&campaign()).await.unwrap();
        let first = store
            .fetch_page(
                CampaignId(1),
                Cursor {
                    after: None,
                    ceiling: SubscriberId(4),
                },
                3,
            )
            .await
            .unwrap();
        let ids: Vec<u64> = first.subscribers.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(!first.done);

        let second = store.fetch_page(CampaignId(1), first.next, 3).await.unwrap();
        let ids: Vec<u64> = second.subscribers.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![4]);
        assert!(second.done);
    }

    #[tokio::test]
    async fn test_pages_follow_the_frozen_audience() {
        let store = MemoryStore::new();
        seed(&store, [1, 2, 4, 5]);
        store.upsert_subscriber(Subscriber::new(SubscriberId(3), "user3@example.com"));
        store.insert_campaign(campaign());

        let snapshot = store.snapshot(&campaign()).await.unwrap();
        assert_eq!(snapshot.total, 4);

        // Joins below the ceiling after the snapshot
        let joined = store.subscriber(SubscriberId(3)).unwrap().subscribed_to(ListId(1));
        store.upsert_subscriber(joined);
        // Leaves before being paged
        let mut left = store.subscriber(SubscriberId(4)).unwrap();
        left.lists.insert(ListId(1), SubscriptionStatus::Unsubscribed);
        store.upsert_subscriber(left);

        let page = store
            .fetch_page(
                CampaignId(1),
                Cursor {
                    after: None,
                    ceiling: SubscriberId(5),
                },
                10,
            )
            .await
            .unwrap();
        let ids: Vec<u64> = page.subscribers.iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![1, 2, 5]);
        assert!(page.done);
    }

    #[tokio::test]
    async fn test_fetch_without_snapshot_fails() {
        let store = MemoryStore::new();
        seed(&store, [1]);
        store.insert_campaign(campaign());

        let err = store
            .fetch_page(
                CampaignId(1),
                Cursor {
                    after: None,
                    ceiling: SubscriberId(1),
                },
                10,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SnapshotMissing(CampaignId(1))));
    }

    #[tokio::test]
    async fn test_suppress_is_a_latch() {
        let store = MemoryStore::new();
        seed(&store, [1]);

        assert!(store.suppress(SubscriberId(1)).await.unwrap());
        assert!(!store.suppress(SubscriberId(1)).await.unwrap());
        assert!(store.is_suppressed(SubscriberId(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_email_is_case_insensitive() {
        let store = MemoryStore::new();
        seed(&store, [7]);

        let found = store.find_by_email("USER7@Example.com").await.unwrap();
        assert_eq!(found.map(|s| s.id), Some(SubscriberId(7)));
    }

    #[tokio::test]
    async fn test_find_sent_prefers_hint_then_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (campaign, age) in [(1, 10), (2, 2)] {
            store
                .record_sent(&SentRecord {
                    campaign: CampaignId(campaign),
                    subscriber: SubscriberId(1),
                    recipient: "user1@example.com".into(),
                    outcome: DeliveryOutcome::Delivered,
                    at: now - Duration::days(age),
                })
                .await
                .unwrap();
        }

        let hinted = store
            .find_sent(SubscriberId(1), Some(CampaignId(1)), now, now)
            .await
            .unwrap();
        assert_eq!(hinted.map(|r| r.campaign), Some(CampaignId(1)));

        let windowed = store
            .find_sent(SubscriberId(1), None, now - Duration::days(5), now)
            .await
            .unwrap();
        assert_eq!(windowed.map(|r| r.campaign), Some(CampaignId(2)));

        let nothing = store
            .find_sent(SubscriberId(1), None, now - Duration::days(1), now)
            .await
            .unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn test_orphans_do_not_count() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for campaign in [Some(CampaignId(1)), None] {
            store
                .insert_bounce(&BounceRecord {
                    id: BounceId::generate(),
                    subscriber: Some(SubscriberId(1)),
                    campaign,
                    class: BounceClass::Soft,
                    source: BounceSource::Mailbox,
                    raw_payload: String::new(),
                    timestamp: now,
                })
                .await
                .unwrap();
        }

        let count = store
            .count_bounces(SubscriberId(1), BounceClass::Soft, now - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
