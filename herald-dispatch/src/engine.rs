//! The dispatch engine: campaign lifecycle control and the shared runtime
//!
//! One engine owns the bounded dispatch queue, the worker pool and the
//! reporter task, and keeps one `DispatchSession` per live campaign. Every
//! lifecycle operation goes through the state machine in
//! `CampaignStatus::can_transition_to` and is serialised by a control lock,
//! so concurrent operator calls on the same campaign never race each other.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use herald_bounce::BounceHandle;
use herald_common::{
    AutoPauseReason, Campaign, CampaignId, CampaignStatus, CampaignStore, Counters,
    DeliveryLedger, MemoryStore, PauseReason, Signal, StoreError, SubscriberSource,
    SubscriberStore, audit, internal,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::DispatchConfig,
    error::{DispatchError, TransitionError, ValidationError},
    queue::DispatchQueue,
    render::TemplateRenderer,
    reporter::{self, Report},
    session::{DispatchSession, SessionHandle},
    transport::TransportRegistry,
    worker,
};

/// Everything the engine reads from and writes to
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub campaigns: Arc<dyn CampaignStore>,
    pub subscribers: Arc<dyn SubscriberStore>,
    pub source: Arc<dyn SubscriberSource>,
    pub ledger: Arc<dyn DeliveryLedger>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub transports: Arc<TransportRegistry>,
    /// Inline hard bounces are handed here when set
    pub bounces: Option<BounceHandle>,
}

impl EngineContext {
    /// A context backed entirely by one in-memory store
    #[must_use]
    pub fn memory(
        store: &MemoryStore,
        renderer: Arc<dyn TemplateRenderer>,
        transports: TransportRegistry,
    ) -> Self {
        let store = Arc::new(store.clone());
        Self {
            campaigns: store.clone(),
            subscribers: store.clone(),
            source: store.clone(),
            ledger: store,
            renderer,
            transports: Arc::new(transports),
            bounces: None,
        }
    }

    #[must_use]
    pub fn with_bounces(mut self, bounces: BounceHandle) -> Self {
        self.bounces = Some(bounces);
        self
    }
}

/// Lifecycle notifications for operators and tests
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignEvent {
    StatusChanged {
        campaign: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
    },
    AutoPaused {
        campaign: CampaignId,
        reason: AutoPauseReason,
    },
}

/// State shared by the engine, its workers, producers and the reporter
pub(crate) struct Shared {
    pub(crate) config: DispatchConfig,
    pub(crate) ctx: EngineContext,
    pub(crate) queue: DispatchQueue,
    reports: mpsc::UnboundedSender<Report>,
    events: broadcast::Sender<CampaignEvent>,
    sessions: DashMap<CampaignId, Arc<DispatchSession>>,
    pub(crate) stopping: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn report(&self, report: Report) {
        if self.reports.send(report).is_err() {
            tracing::warn!("Dispatch reporter is gone, dropping report");
        }
    }

    pub(crate) fn emit(&self, event: CampaignEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn observe_queue_depth(&self) {
        if let Some(metrics) = herald_metrics::metrics() {
            metrics.dispatch.set_queue_depth(self.queue.depth() as u64);
        }
    }

    /// Persist, audit and announce a transition the session already applied
    pub(crate) async fn commit_transition(
        &self,
        session: &DispatchSession,
        from: CampaignStatus,
        to: CampaignStatus,
        reason: &str,
    ) {
        if let Err(err) = session.persist(self.ctx.campaigns.as_ref()).await {
            tracing::error!(
                campaign = %session.campaign_id(),
                error = %err,
                "Failed to persist campaign transition"
            );
        }

        audit::log_campaign_transition(session.campaign_id(), from, to, reason);
        self.emit(CampaignEvent::StatusChanged {
            campaign: session.campaign_id(),
            from,
            to,
        });
    }

    /// Forget a terminal session, unless a newer one replaced it
    pub(crate) fn retire(&self, session: &Arc<DispatchSession>) {
        self.sessions
            .remove_if(&session.campaign_id(), |_, current| Arc::ptr_eq(current, session));
    }

    fn live_session(&self, id: CampaignId) -> Option<Arc<DispatchSession>> {
        self.sessions
            .get(&id)
            .map(|entry| entry.value().clone())
            .filter(|session| !session.status().is_terminal())
    }

    fn spawn_producer(self: &Arc<Self>, session: &Arc<DispatchSession>) {
        session
            .producers
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::spawn(session.clone().produce(self.clone()));
    }
}

struct Tasks {
    workers: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

struct EngineInner {
    shared: Arc<Shared>,
    control: tokio::sync::Mutex<()>,
    tasks: parking_lot::Mutex<Tasks>,
}

/// Handle on a running dispatch engine
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("sessions", &self.inner.shared.sessions.len())
            .field("queue_depth", &self.inner.shared.queue.depth())
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    /// Spawn the worker pool and the reporter
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: DispatchConfig, ctx: EngineContext) -> Self {
        let (reports, reports_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (stopping, _) = watch::channel(false);
        let workers = config.workers.max(1);

        let shared = Arc::new(Shared {
            queue: DispatchQueue::new(config.queue_capacity),
            config,
            ctx,
            reports,
            events,
            sessions: DashMap::new(),
            stopping,
        });

        let reporter = tokio::spawn(reporter::run(shared.clone(), reports_rx));
        let workers = (0..workers)
            .map(|index| tokio::spawn(worker::run(index, shared.clone())))
            .collect();

        internal!(
            level = INFO,
            "Dispatch engine started with {} workers, queue capacity {}",
            shared.config.workers.max(1),
            shared.queue.capacity()
        );

        Self {
            inner: Arc::new(EngineInner {
                shared,
                control: tokio::sync::Mutex::new(()),
                tasks: parking_lot::Mutex::new(Tasks {
                    workers,
                    reporter: Some(reporter),
                }),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    async fn control(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, DispatchError> {
        let guard = self.inner.control.lock().await;
        if *self.shared().stopping.borrow() {
            return Err(DispatchError::ShuttingDown);
        }
        Ok(guard)
    }

    async fn load(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        match self.shared().ctx.campaigns.get_campaign(id).await {
            Ok(campaign) => Ok(campaign),
            Err(StoreError::CampaignNotFound(_)) => Err(DispatchError::UnknownCampaign(id)),
            Err(err) => Err(err.into()),
        }
    }

    /// Apply a transition to a campaign that has no live session
    async fn transition_stored(
        &self,
        mut campaign: Campaign,
        to: CampaignStatus,
        reason: &str,
    ) -> Result<Campaign, DispatchError> {
        let from = campaign.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError {
                campaign: campaign.id,
                from,
                to,
            }
            .into());
        }

        campaign.status = to;
        campaign.pause_reason = None;
        campaign.updated_at = Some(Utc::now());
        self.shared().ctx.campaigns.save_campaign(&campaign).await?;

        audit::log_campaign_transition(campaign.id, from, to, reason);
        self.shared().emit(CampaignEvent::StatusChanged {
            campaign: campaign.id,
            from,
            to,
        });
        Ok(campaign)
    }

    async fn validate(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let invalid = |error| DispatchError::Validation {
            campaign: campaign.id,
            error,
        };

        match campaign.send_at {
            None => return Err(invalid(ValidationError::MissingSendTime)),
            Some(send_at) if send_at <= now => return Err(invalid(ValidationError::SendTimeInPast)),
            Some(_) => {}
        }

        if campaign.lists.is_empty() {
            return Err(invalid(ValidationError::NoLists));
        }

        if !self.shared().ctx.transports.contains(&campaign.transport) {
            return Err(invalid(ValidationError::UnknownTransport(
                campaign.transport.clone(),
            )));
        }

        if self.shared().ctx.source.count_eligible(campaign).await? == 0 {
            return Err(invalid(ValidationError::NoSubscribers));
        }

        Ok(())
    }

    /// Validate a draft and move it to scheduled
    ///
    /// # Errors
    /// `Validation` naming the first failed check, `Transition` unless the
    /// campaign is a draft, `UnknownCampaign`, or a store failure
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn schedule(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        let _guard = self.control().await?;
        let campaign = self.load(id).await?;

        if !campaign.status.can_transition_to(CampaignStatus::Scheduled) {
            return Err(TransitionError {
                campaign: id,
                from: campaign.status,
                to: CampaignStatus::Scheduled,
            }
            .into());
        }

        self.validate(&campaign, Utc::now()).await?;
        self.transition_stored(campaign, CampaignStatus::Scheduled, "scheduled")
            .await
    }

    /// Return a scheduled campaign to draft
    ///
    /// # Errors
    /// `Transition` unless the campaign is scheduled, `UnknownCampaign`, or a
    /// store failure
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn unschedule(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        let _guard = self.control().await?;
        let campaign = self.load(id).await?;
        self.transition_stored(campaign, CampaignStatus::Draft, "unscheduled")
            .await
    }

    /// Start dispatching a scheduled campaign
    ///
    /// Starting a campaign that already has a live session returns that
    /// session instead of creating a second one.
    ///
    /// # Errors
    /// `Transition` unless the campaign is scheduled, `UnknownTransport` if
    /// its transport is not registered, `UnknownCampaign`, or a store failure
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn start(&self, id: CampaignId) -> Result<SessionHandle, DispatchError> {
        let _guard = self.control().await?;
        let shared = self.shared();

        if let Some(session) = shared.live_session(id) {
            tracing::debug!(campaign = %id, session = %session.id(), "Campaign already has a session");
            return Ok(SessionHandle::new(session));
        }

        let mut campaign = self.load(id).await?;
        if campaign.status != CampaignStatus::Scheduled {
            return Err(TransitionError {
                campaign: id,
                from: campaign.status,
                to: CampaignStatus::Running,
            }
            .into());
        }

        let lane = shared
            .ctx
            .transports
            .get(&campaign.transport)
            .ok_or_else(|| DispatchError::UnknownTransport(campaign.transport.clone()))?;

        let snapshot = shared.ctx.source.snapshot(&campaign).await?;
        let now = Utc::now();
        campaign.status = CampaignStatus::Running;
        campaign.counters = Counters {
            total: snapshot.total,
            ..Counters::default()
        };
        campaign.ceiling = snapshot.ceiling;
        campaign.cursor = None;
        campaign.pause_reason = None;
        campaign.started_at = Some(now);
        campaign.updated_at = Some(now);

        let session = DispatchSession::open(campaign, lane, &shared.config.auto_pause);
        shared
            .commit_transition(&session, CampaignStatus::Scheduled, CampaignStatus::Running, "started")
            .await;
        shared.sessions.insert(id, session.clone());

        tracing::info!(
            campaign = %id,
            session = %session.id(),
            total = snapshot.total,
            "Campaign started"
        );

        shared.spawn_producer(&session);
        Ok(SessionHandle::new(session))
    }

    /// Pause a running campaign
    ///
    /// Jobs already queued or waiting on a retry are parked when they reach
    /// their next status check. A transport call already in progress finishes
    /// and its outcome is recorded normally.
    ///
    /// # Errors
    /// `Transition` unless the campaign is running, or `UnknownCampaign`
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn pause(&self, id: CampaignId) -> Result<SessionHandle, DispatchError> {
        let _guard = self.control().await?;
        let session = self.require_session(id, CampaignStatus::Paused).await?;

        let from = session.transition(CampaignStatus::Paused, Some(PauseReason::Manual))?;
        self.shared()
            .commit_transition(&session, from, CampaignStatus::Paused, "manual")
            .await;

        tracing::info!(campaign = %id, "Campaign paused");
        Ok(SessionHandle::new(session))
    }

    /// Resume a paused campaign from where it stopped
    ///
    /// Parked jobs go back onto the queue first, then the producer continues
    /// from the persisted cursor. Resuming also clears the failure monitor.
    ///
    /// # Errors
    /// `Transition` unless the campaign is paused, or `UnknownCampaign`
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn resume(&self, id: CampaignId) -> Result<SessionHandle, DispatchError> {
        let _guard = self.control().await?;
        let shared = self.shared();
        let session = self.require_session(id, CampaignStatus::Running).await?;

        let from = session.transition(CampaignStatus::Running, None)?;
        session.monitor().lock().reset();
        let epoch = session.bump_epoch();
        shared
            .commit_transition(&session, from, CampaignStatus::Running, "resumed")
            .await;

        tracing::info!(campaign = %id, epoch, parked = session.parked(), "Campaign resumed");
        shared.spawn_producer(&session);
        Ok(SessionHandle::new(session))
    }

    /// Cancel a campaign in any non-terminal state
    ///
    /// Queued and parked jobs are discarded without being attempted. Attempts
    /// already in progress finish and are recorded.
    ///
    /// # Errors
    /// `Transition` if the campaign is already terminal, `UnknownCampaign`,
    /// or a store failure
    #[tracing::instrument(level = "debug", skip(self), fields(campaign = %id))]
    pub async fn cancel(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        let _guard = self.control().await?;
        let shared = self.shared();

        let Some(session) = shared.live_session(id) else {
            let campaign = self.load(id).await?;
            return self
                .transition_stored(campaign, CampaignStatus::Cancelled, "cancelled")
                .await;
        };

        let from = session.transition(CampaignStatus::Cancelled, None)?;
        let parked = session.drain_parked().len() as u64;
        shared
            .commit_transition(&session, from, CampaignStatus::Cancelled, "cancelled")
            .await;

        tracing::info!(campaign = %id, parked, "Campaign cancelled");
        shared.report(Report::Discarded {
            session: session.clone(),
            count: parked,
        });
        Ok(session.campaign())
    }

    /// The live session for `id`, or the right error for wanting to move it to `to`
    async fn require_session(
        &self,
        id: CampaignId,
        to: CampaignStatus,
    ) -> Result<Arc<DispatchSession>, DispatchError> {
        if let Some(session) = self.shared().live_session(id) {
            return Ok(session);
        }

        let campaign = self.load(id).await?;
        Err(TransitionError {
            campaign: id,
            from: campaign.status,
            to,
        }
        .into())
    }

    /// Start every scheduled campaign whose send time is at or before `now`
    ///
    /// A campaign failing to start is logged and does not stop the others.
    ///
    /// # Errors
    /// If the scheduled campaigns cannot be listed
    pub async fn start_due(&self, now: DateTime<Utc>) -> Result<Vec<SessionHandle>, DispatchError> {
        let due = self
            .shared()
            .ctx
            .campaigns
            .list_campaigns(Some(CampaignStatus::Scheduled))
            .await?
            .into_iter()
            .filter(|campaign| campaign.send_at.is_some_and(|send_at| send_at <= now));

        let mut started = Vec::new();
        for campaign in due {
            match self.start(campaign.id).await {
                Ok(handle) => started.push(handle),
                Err(DispatchError::ShuttingDown) => break,
                Err(err) => {
                    tracing::error!(campaign = %campaign.id, error = %err, "Failed to start due campaign");
                }
            }
        }

        Ok(started)
    }

    /// Rebuild sessions for campaigns left running or paused by a previous process
    ///
    /// Running campaigns continue from their persisted cursor; paused ones
    /// wait for an explicit resume. Jobs that were in flight when the previous
    /// process stopped are not replayed.
    ///
    /// # Errors
    /// If the campaigns cannot be listed
    pub async fn recover(&self) -> Result<Vec<SessionHandle>, DispatchError> {
        let _guard = self.control().await?;
        let shared = self.shared();

        let mut campaigns = shared
            .ctx
            .campaigns
            .list_campaigns(Some(CampaignStatus::Running))
            .await?;
        campaigns.extend(
            shared
                .ctx
                .campaigns
                .list_campaigns(Some(CampaignStatus::Paused))
                .await?,
        );

        let mut recovered = Vec::new();
        for campaign in campaigns {
            if shared.live_session(campaign.id).is_some() {
                continue;
            }

            let Some(lane) = shared.ctx.transports.get(&campaign.transport) else {
                tracing::error!(
                    campaign = %campaign.id,
                    transport = %campaign.transport,
                    "Cannot recover campaign, transport is not registered"
                );
                continue;
            };

            let id = campaign.id;
            let running = campaign.status == CampaignStatus::Running;
            let session = DispatchSession::open(campaign, lane, &shared.config.auto_pause);
            shared.sessions.insert(id, session.clone());

            tracing::info!(
                campaign = %id,
                status = %session.status(),
                cursor = ?session.campaign().cursor,
                "Recovered campaign"
            );

            if running {
                shared.spawn_producer(&session);
            }
            recovered.push(SessionHandle::new(session));
        }

        Ok(recovered)
    }

    /// Current state of a campaign, live counters included
    ///
    /// # Errors
    /// `UnknownCampaign`, or a store failure
    pub async fn campaign(&self, id: CampaignId) -> Result<Campaign, DispatchError> {
        if let Some(session) = self.shared().sessions.get(&id) {
            return Ok(session.campaign());
        }
        self.load(id).await
    }

    #[must_use]
    pub fn session(&self, id: CampaignId) -> Option<SessionHandle> {
        self.shared()
            .sessions
            .get(&id)
            .map(|entry| SessionHandle::new(entry.value().clone()))
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CampaignEvent> {
        self.shared().events.subscribe()
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.shared().queue.depth()
    }

    /// Start due campaigns on an interval until a shutdown signal arrives
    ///
    /// # Errors
    /// Currently infallible; failures to start are logged per campaign
    pub async fn serve(&self, mut signal: broadcast::Receiver<Signal>) -> Result<(), DispatchError> {
        let period = Duration::from_secs(self.shared().config.scheduler_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        internal!(level = INFO, "Dispatch scheduler checking every {period:?}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.start_due(Utc::now()).await {
                        tracing::error!(error = %err, "Failed to check for due campaigns");
                    }
                }
                sig = signal.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => {
                            internal!(level = INFO, "Dispatch scheduler received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop taking work and wait for in-flight attempts
    ///
    /// Workers finish the attempt they are making; queued jobs stay where
    /// they are. Waits at most `shutdown_timeout_secs` before aborting
    /// whatever is still running.
    pub async fn shutdown(&self) {
        let shared = self.shared();
        if shared.stopping.send_replace(true) {
            return;
        }

        internal!(level = INFO, "Dispatch engine shutting down");

        // Wait for operator calls in progress
        drop(self.inner.control.lock().await);

        let (workers, reporter) = {
            let mut tasks = self.inner.tasks.lock();
            (std::mem::take(&mut tasks.workers), tasks.reporter.take())
        };

        let timeout = Duration::from_secs(shared.config.shutdown_timeout_secs);
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(timeout, async {
            for worker in workers {
                let _ = worker.await;
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!(
                timeout_secs = shared.config.shutdown_timeout_secs,
                "Shutdown timeout exceeded, aborting workers"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        shared.report(Report::Shutdown);
        if let Some(reporter) = reporter
            && tokio::time::timeout(timeout, reporter).await.is_err()
        {
            tracing::warn!("Dispatch reporter did not stop in time");
        }

        for entry in &shared.sessions {
            let campaign = entry.value().campaign();
            tracing::info!(
                campaign = %campaign.id,
                status = %campaign.status,
                cursor = ?campaign.cursor,
                "Campaign left for recovery"
            );
        }

        internal!(level = INFO, "Dispatch engine stopped");
    }
}
