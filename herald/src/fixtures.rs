//! Seed data for the in-memory store

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use herald_common::{
    Campaign, CampaignId, ListId, MemoryStore, RateLimit, Subscriber, SubscriberId, TemplateId,
};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Fixtures {
    #[serde(default, alias = "subscriber")]
    pub subscribers: Vec<SubscriberFixture>,
    #[serde(default, alias = "campaign")]
    pub campaigns: Vec<CampaignFixture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberFixture {
    pub id: SubscriberId,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lists: Vec<ListId>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub suppressed: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignFixture {
    pub id: CampaignId,
    pub name: String,
    pub lists: Vec<ListId>,
    pub template: TemplateId,
    pub transport: String,
    /// Seconds after startup the campaign becomes due; left as a draft when absent
    #[serde(default)]
    pub send_in_secs: Option<u64>,
    #[serde(default)]
    pub throttle: Option<RateLimit>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
}

impl From<&SubscriberFixture> for Subscriber {
    fn from(fixture: &SubscriberFixture) -> Self {
        let mut subscriber = fixture
            .lists
            .iter()
            .fold(Self::new(fixture.id, &fixture.email), |subscriber, list| {
                subscriber.subscribed_to(*list)
            });
        subscriber.name.clone_from(&fixture.name);
        subscriber.suppressed = fixture.suppressed;
        subscriber.attributes = fixture
            .attributes
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::Value::from(value.as_str())))
            .collect();
        subscriber
    }
}

impl CampaignFixture {
    fn campaign(&self, now: DateTime<Utc>) -> Campaign {
        let mut campaign = Campaign::draft(
            self.id,
            &self.name,
            self.lists.clone(),
            self.template,
            &self.transport,
        );
        campaign.send_at = self.send_in_secs.map(|secs| {
            now + chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
                .unwrap_or(chrono::Duration::MAX)
        });
        campaign.throttle = self.throttle;
        campaign.max_in_flight = self.max_in_flight;
        campaign
    }
}

impl Fixtures {
    /// Load everything into `store`, returning the campaigns that should be scheduled
    pub fn seed(&self, store: &MemoryStore, now: DateTime<Utc>) -> Vec<CampaignId> {
        for subscriber in &self.subscribers {
            store.upsert_subscriber(subscriber.into());
        }

        self.campaigns
            .iter()
            .map(|fixture| {
                let campaign = fixture.campaign(now);
                let due = campaign.send_at.is_some();
                store.insert_campaign(campaign);
                (fixture.id, due)
            })
            .filter_map(|(id, due)| due.then_some(id))
            .collect()
    }
}
