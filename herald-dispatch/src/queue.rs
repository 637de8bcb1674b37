//! The bounded dispatch queue shared by every running campaign
//!
//! Producers block when the queue is full instead of dropping jobs, so memory
//! is bounded by the queue capacity whatever the campaign size. Workers share
//! one receiver, taking jobs in FIFO order.

use core::fmt::{self, Display, Formatter};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_common::{CampaignId, RenderedMessage, SubscriberId};
use tokio::sync::{Mutex, mpsc};
use ulid::Ulid;

use crate::session::DispatchSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(Ulid);

impl JobId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One rendered message on its way to a transport
///
/// A job carries a reference to the session that created it, so it stays
/// bound to that campaign run until it reaches a terminal outcome.
#[derive(Debug)]
pub struct MessageJob {
    pub id: JobId,
    pub campaign: CampaignId,
    pub subscriber: SubscriberId,
    pub recipient: String,
    pub message: RenderedMessage,
    /// Transport attempts made so far
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub(crate) session: Arc<DispatchSession>,
}

#[derive(Debug)]
pub struct DispatchQueue {
    sender: mpsc::Sender<MessageJob>,
    receiver: Mutex<mpsc::Receiver<MessageJob>>,
}

impl DispatchQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub(crate) const fn sender(&self) -> &mpsc::Sender<MessageJob> {
        &self.sender
    }

    /// Take the next job, waiting for one to arrive
    ///
    /// Returns `None` once the queue is closed and empty.
    pub(crate) async fn recv(&self) -> Option<MessageJob> {
        self.receiver.lock().await.recv().await
    }

    /// Jobs currently waiting in the queue
    #[must_use]
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}
