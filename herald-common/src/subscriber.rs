use core::fmt::{self, Display, Formatter};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{bounce::BounceClass, campaign::ListId};

/// Subscriber identity
///
/// Ids are handed out in increasing order, which is what lets a dispatch
/// session page through a list with a simple "after this id" cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl Display for SubscriberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Unconfirmed,
    Confirmed,
    Unsubscribed,
}

impl SubscriptionStatus {
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Unsubscribed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceCounters {
    pub soft: u32,
    pub hard: u32,
    pub complaint: u32,
}

impl BounceCounters {
    pub const fn increment(&mut self, class: BounceClass) {
        match class {
            BounceClass::Soft => self.soft += 1,
            BounceClass::Hard => self.hard += 1,
            BounceClass::Complaint => self.complaint += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub email: String,
    #[serde(default)]
    pub name: String,
    /// Free-form attributes made available to the template renderer
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub lists: BTreeMap<ListId, SubscriptionStatus>,
    #[serde(default)]
    pub bounces: BounceCounters,
    /// One-way latch set by the bounce correlator
    #[serde(default)]
    pub suppressed: bool,
}

impl Subscriber {
    #[must_use]
    pub fn new(id: SubscriberId, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            name: String::new(),
            attributes: serde_json::Map::new(),
            lists: BTreeMap::new(),
            bounces: BounceCounters::default(),
            suppressed: false,
        }
    }

    #[must_use]
    pub fn subscribed_to(mut self, list: ListId) -> Self {
        self.lists.insert(list, SubscriptionStatus::Confirmed);
        self
    }

    /// Whether this subscriber is in the audience of a campaign aimed at `lists`
    ///
    /// Suppression is not considered here. The dispatch session checks it
    /// right before creating each job and counts the subscriber as skipped.
    #[must_use]
    pub fn is_subscribed_to_any(&self, lists: &[ListId]) -> bool {
        lists.iter().any(|list| {
            self.lists
                .get(list)
                .is_some_and(|status| status.is_active())
        })
    }
}
