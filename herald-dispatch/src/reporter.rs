//! Outcome reporting for dispatch sessions
//!
//! Workers, producers and retry tasks never touch campaign counters directly.
//! They send a `Report` to a single reporter task which applies it, writes
//! the delivery ledger, feeds the failure monitor and decides when a session
//! has finished. Processing reports one at a time keeps the counters exact
//! under any amount of worker concurrency.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use chrono::Utc;
use herald_common::{
    AutoPauseReason, BounceClass, BounceEvent, BounceSource, CampaignStatus, DeliveryOutcome,
    PauseReason, SentRecord, SubscriberId, audit, internal,
};
use tokio::sync::mpsc;

use crate::{
    engine::{CampaignEvent, Shared},
    queue::MessageJob,
    render::RenderError,
    session::DispatchSession,
    transport::TransportError,
};

#[derive(Debug)]
pub(crate) enum Report {
    /// The transport accepted the message
    Delivered { job: MessageJob, elapsed: Duration },

    /// Terminal failure: permanent, or transient with no attempts left
    Failed { job: MessageJob, error: TransportError },

    /// A transient failure that will be retried after backoff
    Retrying {
        session: Arc<DispatchSession>,
        subscriber: SubscriberId,
        attempts: u32,
        error: TransportError,
    },

    RenderFailed {
        session: Arc<DispatchSession>,
        subscriber: SubscriberId,
        recipient: String,
        error: RenderError,
    },

    /// Suppressed at dispatch time
    Skipped {
        session: Arc<DispatchSession>,
        subscriber: SubscriberId,
    },

    /// Jobs dropped because their campaign was cancelled
    Discarded {
        session: Arc<DispatchSession>,
        count: u64,
    },

    ProducerExited {
        session: Arc<DispatchSession>,
        exhausted: bool,
    },

    /// Sent last during engine shutdown
    Shutdown,
}

pub(crate) async fn run(shared: Arc<Shared>, mut reports: mpsc::UnboundedReceiver<Report>) {
    internal!("Dispatch reporter started");

    while let Some(report) = reports.recv().await {
        match report {
            Report::Shutdown => break,
            report => handle(&shared, report).await,
        }
    }

    internal!("Dispatch reporter stopped");
}

async fn handle(shared: &Shared, report: Report) {
    match report {
        Report::Delivered { job, elapsed } => delivered(shared, job, elapsed).await,
        Report::Failed { job, error } => failed(shared, job, error).await,
        Report::Retrying {
            session,
            subscriber,
            attempts,
            error,
        } => {
            tracing::debug!(
                campaign = %session.campaign_id(),
                subscriber = %subscriber,
                attempts,
                error = %error,
                "Transient failure, retry scheduled"
            );
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.dispatch.record_retry(session.lane().name());
            }

            let tripped = {
                let mut monitor = session.monitor().lock();
                let by_ratio = monitor.record(false);
                let by_budget = monitor.record_retry();
                by_ratio.or(by_budget)
            };
            if let Some(reason) = tripped {
                auto_pause(shared, &session, reason).await;
            }
        }
        Report::RenderFailed {
            session,
            subscriber,
            recipient,
            error,
        } => {
            session.update(|campaign| campaign.counters.record(DeliveryOutcome::PermanentFailure));
            audit::log_delivery_failure(
                session.campaign_id(),
                subscriber,
                &recipient,
                &error.to_string(),
                0,
            );
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.dispatch.record_failed(session.lane().name(), "render");
            }
            persist(shared, &session).await;
        }
        Report::Skipped {
            session,
            subscriber,
        } => {
            tracing::debug!(
                campaign = %session.campaign_id(),
                subscriber = %subscriber,
                "Skipping suppressed subscriber"
            );
            session.update(|campaign| campaign.counters.record_skip());
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.dispatch.record_skipped();
            }
            persist(shared, &session).await;
        }
        Report::Discarded { session, count } => {
            if count > 0 {
                tracing::debug!(
                    campaign = %session.campaign_id(),
                    count,
                    "Discarded jobs of a cancelled campaign"
                );
                if let Some(metrics) = herald_metrics::metrics() {
                    metrics.dispatch.record_discarded(count);
                }
            }
            settle(shared, &session, count, false).await;
        }
        Report::ProducerExited { session, exhausted } => {
            if exhausted {
                session.mark_exhausted();
            }
            settle(shared, &session, 0, true).await;
        }
        Report::Shutdown => {}
    }
}

async fn delivered(shared: &Shared, job: MessageJob, elapsed: Duration) {
    let session = job.session.clone();
    let transport = session.lane().name().to_string();

    session.update(|campaign| campaign.counters.record(DeliveryOutcome::Delivered));
    record_sent(shared, &job, DeliveryOutcome::Delivered).await;

    audit::log_delivery_success(
        job.campaign,
        job.subscriber,
        &job.recipient,
        &transport,
        job.attempts,
    );
    if let Some(metrics) = herald_metrics::metrics() {
        metrics
            .dispatch
            .record_delivered(&transport, elapsed.as_secs_f64());
    }

    let tripped = session.monitor().lock().record(true);
    if let Some(reason) = tripped {
        auto_pause(shared, &session, reason).await;
    }

    persist(shared, &session).await;
    settle(shared, &session, 1, false).await;
}

async fn failed(shared: &Shared, job: MessageJob, error: TransportError) {
    let session = job.session.clone();

    session.update(|campaign| campaign.counters.record(DeliveryOutcome::PermanentFailure));
    // Written before the bounce goes out, so the correlator can match it
    record_sent(shared, &job, DeliveryOutcome::PermanentFailure).await;

    audit::log_delivery_failure(
        job.campaign,
        job.subscriber,
        &job.recipient,
        &error.to_string(),
        job.attempts,
    );
    if let Some(metrics) = herald_metrics::metrics() {
        let reason = if error.is_transient() {
            "retries_exhausted"
        } else {
            error.reason()
        };
        metrics.dispatch.record_failed(session.lane().name(), reason);
    }

    let tripped = session.monitor().lock().record(false);
    if let Some(reason) = tripped {
        auto_pause(shared, &session, reason).await;
    }

    if error.signals_hard_bounce()
        && let Some(bounces) = &shared.ctx.bounces
    {
        let event = BounceEvent {
            recipient: job.recipient.clone(),
            class: BounceClass::Hard,
            timestamp: Utc::now(),
            raw_payload: error.to_string(),
            campaign_hint: Some(job.campaign),
            source: BounceSource::Transport,
        };
        if let Err(err) = bounces.submit(event).await {
            tracing::error!(
                campaign = %job.campaign,
                subscriber = %job.subscriber,
                error = %err,
                "Failed to hand inline hard bounce to the correlator"
            );
        }
    }

    persist(shared, &session).await;
    settle(shared, &session, 1, false).await;
}

async fn record_sent(shared: &Shared, job: &MessageJob, outcome: DeliveryOutcome) {
    let record = SentRecord {
        campaign: job.campaign,
        subscriber: job.subscriber,
        recipient: job.recipient.clone(),
        outcome,
        at: Utc::now(),
    };

    if let Err(err) = shared.ctx.ledger.record_sent(&record).await {
        tracing::error!(
            campaign = %job.campaign,
            subscriber = %job.subscriber,
            error = %err,
            "Failed to write delivery ledger entry"
        );
    }
}

async fn persist(shared: &Shared, session: &DispatchSession) {
    if let Err(err) = session.persist(shared.ctx.campaigns.as_ref()).await {
        tracing::error!(
            campaign = %session.campaign_id(),
            error = %err,
            "Failed to persist campaign progress"
        );
    }
}

async fn auto_pause(shared: &Shared, session: &Arc<DispatchSession>, reason: AutoPauseReason) {
    // Only a running campaign can be auto-paused; anything else already moved on
    let Ok(from) = session.transition(
        CampaignStatus::Paused,
        Some(PauseReason::Auto(reason.clone())),
    ) else {
        return;
    };

    tracing::warn!(
        campaign = %session.campaign_id(),
        reason = %reason,
        "Campaign paused automatically"
    );

    if let Some(metrics) = herald_metrics::metrics() {
        let condition = match reason {
            AutoPauseReason::FailureRate { .. } => "failure_rate",
            AutoPauseReason::RetryBudgetExhausted { .. } => "retry_budget",
        };
        metrics.dispatch.record_auto_pause(condition);
    }

    shared
        .commit_transition(session, from, CampaignStatus::Paused, &reason.to_string())
        .await;
    shared.emit(CampaignEvent::AutoPaused {
        campaign: session.campaign_id(),
        reason,
    });
}

/// Retire `jobs` outstanding jobs (and a producer) and finish the campaign
/// once nothing is left
async fn settle(shared: &Shared, session: &Arc<DispatchSession>, jobs: u64, producer_exited: bool) {
    let outstanding = session
        .outstanding
        .load(Ordering::SeqCst)
        .saturating_sub(jobs);
    let producers = session
        .producers
        .load(Ordering::SeqCst)
        .saturating_sub(usize::from(producer_exited));
    let drained = outstanding == 0 && producers == 0;

    if drained
        && session.is_exhausted()
        && session.status() == CampaignStatus::Running
        && let Ok(from) = session.transition(CampaignStatus::Finished, None)
    {
        let counters = session.counters();
        tracing::info!(
            campaign = %session.campaign_id(),
            total = counters.total,
            sent = counters.sent,
            failed = counters.failed,
            skipped = counters.skipped,
            "Campaign finished"
        );
        shared
            .commit_transition(session, from, CampaignStatus::Finished, "completed")
            .await;
    }

    session.outstanding.fetch_sub(jobs, Ordering::SeqCst);
    if producer_exited {
        session.producers.fetch_sub(1, Ordering::SeqCst);
    }

    if drained && session.status().is_terminal() {
        shared.retire(session);
    }

    session.notify_idle();
}
