//! Dispatch sessions: the live execution context of one running campaign
//!
//! A session owns the in-memory copy of its campaign (status, counters and
//! stream cursor) and runs at most one producer at a time. The producer pages
//! through the snapshot taken at start, renders each subscriber and pushes the
//! job onto the shared queue, blocking while the queue is full.
//!
//! Pausing never loses or duplicates work. A job that meets a paused campaign
//! (in the producer, at a worker, or at a retry checkpoint) is parked on the
//! session; resuming re-injects parked jobs before the producer continues
//! from the cursor.

use core::fmt::{self, Display, Formatter};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use herald_common::{
    CAMPAIGN_HEADER, Campaign, CampaignId, CampaignStatus, CampaignStore, Counters, Cursor,
    PauseReason, SUBSCRIBER_HEADER, StoreError, Subscriber,
};
use tokio::sync::{Notify, Semaphore, watch};
use ulid::Ulid;

use crate::{
    engine::Shared,
    error::TransitionError,
    monitor::{FailureMonitor, FailureMonitorConfig},
    queue::{JobId, MessageJob},
    rate_limiter::RateLimiter,
    reporter::Report,
    transport::Lane,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Ulid);

impl SessionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a status checkpoint decided for a job
pub(crate) enum Checkpoint {
    /// The campaign is running, carry on with the job
    Proceed(MessageJob),
    /// The campaign is paused and the job now waits on the session
    Parked,
    /// The campaign is over, drop the job
    Discard(MessageJob),
}

/// Where an enqueue attempt left the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    Parked,
    Discarded,
    /// The engine is stopping
    Halted,
}

pub struct DispatchSession {
    id: SessionId,
    campaign_id: CampaignId,
    campaign: parking_lot::Mutex<Campaign>,
    status: watch::Sender<CampaignStatus>,
    lane: Arc<Lane>,
    throttle: Option<RateLimiter>,
    in_flight: Option<Arc<Semaphore>>,
    monitor: parking_lot::Mutex<FailureMonitor>,
    epoch: AtomicU64,

    // Serialises producers across pause/resume cycles
    producer_lock: tokio::sync::Mutex<()>,
    // Keeps persisted snapshots in mutation order
    persist_lock: tokio::sync::Mutex<()>,

    /// Producers spawned and not yet reported as exited
    pub(crate) producers: AtomicUsize,
    exhausted: AtomicBool,
    /// Jobs created and not yet terminal, parked ones included
    pub(crate) outstanding: AtomicU64,
    parked: parking_lot::Mutex<VecDeque<MessageJob>>,
    idle: Notify,
}

impl fmt::Debug for DispatchSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchSession")
            .field("id", &self.id)
            .field("campaign", &self.campaign_id)
            .field("status", &*self.status.borrow())
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DispatchSession {
    pub(crate) fn open(campaign: Campaign, lane: Arc<Lane>, monitor: &FailureMonitorConfig) -> Arc<Self> {
        let throttle = campaign.throttle.and_then(RateLimiter::new);
        let in_flight = campaign
            .max_in_flight
            .map(|permits| Arc::new(Semaphore::new(permits.max(1) as usize)));
        let (status, _) = watch::channel(campaign.status);

        Arc::new(Self {
            id: SessionId::generate(),
            campaign_id: campaign.id,
            campaign: parking_lot::Mutex::new(campaign),
            status,
            lane,
            throttle,
            in_flight,
            monitor: parking_lot::Mutex::new(FailureMonitor::new(monitor.clone())),
            epoch: AtomicU64::new(0),
            producer_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            producers: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            outstanding: AtomicU64::new(0),
            parked: parking_lot::Mutex::new(VecDeque::new()),
            idle: Notify::new(),
        })
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn campaign_id(&self) -> CampaignId {
        self.campaign_id
    }

    pub fn status(&self) -> CampaignStatus {
        *self.status.borrow()
    }

    pub fn campaign(&self) -> Campaign {
        self.campaign.lock().clone()
    }

    pub fn counters(&self) -> Counters {
        self.campaign.lock().counters
    }

    pub(crate) const fn lane(&self) -> &Arc<Lane> {
        &self.lane
    }

    pub(crate) const fn throttle(&self) -> Option<&RateLimiter> {
        self.throttle.as_ref()
    }

    pub(crate) const fn in_flight(&self) -> Option<&Arc<Semaphore>> {
        self.in_flight.as_ref()
    }

    pub(crate) const fn monitor(&self) -> &parking_lot::Mutex<FailureMonitor> {
        &self.monitor
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    /// Incremented every time the campaign resumes
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Mutate the in-memory campaign
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Campaign) -> R) -> R {
        let mut campaign = self.campaign.lock();
        let result = f(&mut campaign);
        campaign.updated_at = Some(Utc::now());
        result
    }

    /// Move the campaign along one edge of the state machine
    ///
    /// Returns the previous status. The pause reason is kept only while paused.
    pub(crate) fn transition(
        &self,
        to: CampaignStatus,
        reason: Option<PauseReason>,
    ) -> Result<CampaignStatus, TransitionError> {
        let mut campaign = self.campaign.lock();
        let from = campaign.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                campaign: self.campaign_id,
                from,
                to,
            });
        }

        campaign.status = to;
        campaign.pause_reason = if to == CampaignStatus::Paused {
            reason
        } else {
            None
        };
        campaign.updated_at = Some(Utc::now());
        self.status.send_replace(to);
        drop(campaign);

        self.idle.notify_waiters();
        Ok(from)
    }

    /// Write the current in-memory campaign through to the store
    ///
    /// # Errors
    /// If the store rejects the write
    pub(crate) async fn persist(&self, store: &dyn CampaignStore) -> Result<(), StoreError> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.campaign();
        store.save_campaign(&snapshot).await
    }

    /// Decide a job's fate against the current status
    ///
    /// Runs under the parked lock, so it cannot interleave with a resume or a
    /// cancel draining the parked jobs.
    pub(crate) fn checkpoint(&self, job: MessageJob) -> Checkpoint {
        let mut parked = self.parked.lock();
        match self.status() {
            CampaignStatus::Running => Checkpoint::Proceed(job),
            CampaignStatus::Paused => {
                parked.push_back(job);
                drop(parked);
                self.idle.notify_waiters();
                Checkpoint::Parked
            }
            _ => Checkpoint::Discard(job),
        }
    }

    pub(crate) fn drain_parked(&self) -> Vec<MessageJob> {
        self.parked.lock().drain(..).collect()
    }

    fn take_parked(&self) -> Option<MessageJob> {
        self.parked.lock().pop_front()
    }

    /// Parked jobs waiting for the campaign to resume
    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }

    /// No producer is running and every outstanding job is parked
    pub fn is_idle(&self) -> bool {
        let parked = self.parked.lock().len() as u64;
        self.producers.load(Ordering::SeqCst) == 0
            && self.outstanding.load(Ordering::SeqCst) == parked
    }

    pub(crate) fn notify_idle(&self) {
        self.idle.notify_waiters();
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }

            notified.await;
        }
    }

    /// Push a job onto the dispatch queue, waiting for room
    ///
    /// The campaign status is re-checked whenever it changes while waiting.
    pub(crate) async fn enqueue(self: &Arc<Self>, job: MessageJob, shared: &Shared) -> Enqueued {
        let mut status = self.status.subscribe();
        let mut stopping = shared.stopping.subscribe();
        let mut job = job;

        loop {
            match self.checkpoint(job) {
                Checkpoint::Proceed(next) => job = next,
                Checkpoint::Parked => return Enqueued::Parked,
                Checkpoint::Discard(_) => {
                    shared.report(Report::Discarded {
                        session: self.clone(),
                        count: 1,
                    });
                    return Enqueued::Discarded;
                }
            }

            if *stopping.borrow_and_update() {
                return Enqueued::Halted;
            }
            status.borrow_and_update();

            tokio::select! {
                permit = shared.queue.sender().reserve() => {
                    let Ok(permit) = permit else {
                        return Enqueued::Halted;
                    };
                    permit.send(job);
                    shared.observe_queue_depth();
                    return Enqueued::Queued;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return Enqueued::Halted;
                    }
                }
                _ = stopping.changed() => return Enqueued::Halted,
            }
        }
    }

    /// Producer task body
    pub(crate) async fn produce(self: Arc<Self>, shared: Arc<Shared>) {
        let _guard = self.producer_lock.lock().await;
        tracing::debug!(
            campaign = %self.campaign_id,
            session = %self.id,
            epoch = self.epoch(),
            "Dispatch session producer started"
        );

        let exhausted = self.stream(&shared).await;

        if let Err(err) = self.persist(shared.ctx.campaigns.as_ref()).await {
            tracing::error!(campaign = %self.campaign_id, error = %err, "Failed to persist cursor");
        }

        tracing::debug!(
            campaign = %self.campaign_id,
            session = %self.id,
            exhausted,
            "Dispatch session producer stopped"
        );
        shared.report(Report::ProducerExited {
            session: self.clone(),
            exhausted,
        });
    }

    /// Returns `true` once every snapshot member has been handled
    async fn stream(self: &Arc<Self>, shared: &Shared) -> bool {
        while let Some(job) = self.take_parked() {
            if self.enqueue(job, shared).await != Enqueued::Queued {
                return false;
            }
        }

        let page_size = shared.config.page_size.max(1);

        loop {
            // Checkpoint before every page
            if self.status() != CampaignStatus::Running {
                return false;
            }

            let (after, ceiling) = {
                let campaign = self.campaign.lock();
                (campaign.cursor, campaign.ceiling)
            };
            let Some(ceiling) = ceiling else {
                return true;
            };

            let page = match shared
                .ctx
                .source
                .fetch_page(self.campaign_id, Cursor { after, ceiling }, page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(
                        campaign = %self.campaign_id,
                        error = %err,
                        "Failed to fetch subscriber page, retrying"
                    );
                    if !self.pause_for(shared, Duration::from_millis(shared.config.source_retry_delay_ms)).await {
                        return false;
                    }
                    continue;
                }
            };

            for subscriber in page.subscribers {
                if self.status() != CampaignStatus::Running {
                    return false;
                }

                let id = subscriber.id;
                if let Some(job) = self.prepare(subscriber, shared).await {
                    match self.enqueue(job, shared).await {
                        Enqueued::Queued | Enqueued::Parked => {}
                        Enqueued::Discarded | Enqueued::Halted => return false,
                    }
                }
                self.update(|campaign| campaign.cursor = Some(id));
            }

            if let Err(err) = self.persist(shared.ctx.campaigns.as_ref()).await {
                tracing::warn!(campaign = %self.campaign_id, error = %err, "Failed to persist cursor");
            }

            if page.done {
                return true;
            }
        }
    }

    /// Sleep unless the engine stops first
    async fn pause_for(&self, shared: &Shared, delay: Duration) -> bool {
        let mut stopping = shared.stopping.subscribe();
        if *stopping.borrow_and_update() {
            return false;
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            _ = stopping.changed() => false,
        }
    }

    /// Turn one subscriber into a job, or account for why not
    async fn prepare(self: &Arc<Self>, subscriber: Subscriber, shared: &Shared) -> Option<MessageJob> {
        let suppressed = match shared.ctx.subscribers.is_suppressed(subscriber.id).await {
            Ok(suppressed) => suppressed || subscriber.suppressed,
            Err(err) => {
                tracing::warn!(
                    subscriber = %subscriber.id,
                    error = %err,
                    "Suppression lookup failed, using the paged record"
                );
                subscriber.suppressed
            }
        };

        if suppressed {
            shared.report(Report::Skipped {
                session: self.clone(),
                subscriber: subscriber.id,
            });
            return None;
        }

        let template = self.campaign.lock().template;
        match shared.ctx.renderer.render(template, &subscriber).await {
            Ok(mut message) => {
                if message.to.is_empty() {
                    message.to.clone_from(&subscriber.email);
                }
                message.set_header(CAMPAIGN_HEADER, self.campaign_id.to_string());
                message.set_header(SUBSCRIBER_HEADER, subscriber.id.to_string());

                self.outstanding.fetch_add(1, Ordering::SeqCst);
                Some(MessageJob {
                    id: JobId::generate(),
                    campaign: self.campaign_id,
                    subscriber: subscriber.id,
                    recipient: message.to.clone(),
                    message,
                    attempts: 0,
                    created_at: Utc::now(),
                    session: self.clone(),
                })
            }
            Err(error) => {
                shared.report(Report::RenderFailed {
                    session: self.clone(),
                    subscriber: subscriber.id,
                    recipient: subscriber.email,
                    error,
                });
                None
            }
        }
    }
}

/// Operator-facing handle on a dispatch session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session: Arc<DispatchSession>,
}

impl SessionHandle {
    pub(crate) const fn new(session: Arc<DispatchSession>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    #[must_use]
    pub fn campaign_id(&self) -> CampaignId {
        self.session.campaign_id()
    }

    #[must_use]
    pub fn status(&self) -> CampaignStatus {
        self.session.status()
    }

    #[must_use]
    pub fn campaign(&self) -> Campaign {
        self.session.campaign()
    }

    #[must_use]
    pub fn counters(&self) -> Counters {
        self.session.counters()
    }

    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.session.epoch()
    }

    /// Jobs parked while the campaign is paused
    #[must_use]
    pub fn parked(&self) -> usize {
        self.session.parked()
    }

    /// Watch the campaign status
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CampaignStatus> {
        self.session.status.subscribe()
    }

    /// Resolve once the session has nothing left in motion
    ///
    /// That is: no producer running, and every job created so far either
    /// reached a terminal outcome or is parked waiting for a resume.
    pub async fn wait_idle(&self) {
        self.session.wait_idle().await;
    }
}
