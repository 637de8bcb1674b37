//! The worker pool shared by every running campaign
//!
//! Each worker takes the next job off the dispatch queue, re-checks the
//! campaign status, waits on the transport and campaign rate limits and
//! concurrency caps, and makes one transport attempt. Transient failures are
//! re-enqueued at the tail of the queue after backoff so a retrying job never
//! blocks the jobs behind it.

use std::{sync::Arc, time::Duration};

use herald_common::{internal, outgoing};
use tokio::time::Instant;

use crate::{
    engine::Shared,
    queue::MessageJob,
    reporter::Report,
    session::Checkpoint,
    transport::{TransientError, TransportError},
};

pub(crate) async fn run(index: usize, shared: Arc<Shared>) {
    let mut stopping = shared.stopping.subscribe();
    internal!(level = DEBUG, "Dispatch worker {index} started");

    loop {
        if *stopping.borrow_and_update() {
            break;
        }

        let job = tokio::select! {
            job = shared.queue.recv() => job,
            _ = stopping.changed() => break,
        };

        let Some(job) = job else {
            break;
        };

        shared.observe_queue_depth();
        process(job, &shared).await;
    }

    internal!(level = DEBUG, "Dispatch worker {index} stopped");
}

/// Apply the status checkpoint, reporting discards
fn admit(job: MessageJob, shared: &Shared) -> Option<MessageJob> {
    let session = job.session.clone();
    match session.checkpoint(job) {
        Checkpoint::Proceed(job) => Some(job),
        Checkpoint::Parked => None,
        Checkpoint::Discard(_) => {
            shared.report(Report::Discarded { session, count: 1 });
            None
        }
    }
}

async fn process(job: MessageJob, shared: &Arc<Shared>) {
    let Some(job) = admit(job, shared) else {
        return;
    };
    let session = job.session.clone();
    let lane = session.lane().clone();

    if let Some(limiter) = lane.limiter() {
        limiter.acquire().await;
    }
    if let Some(throttle) = session.throttle() {
        throttle.acquire().await;
    }

    // Waiting on the limits can take a while; the campaign may have moved on
    let Some(mut job) = admit(job, shared) else {
        return;
    };

    let _transport_permit = match lane.concurrency() {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    };
    let _campaign_permit = match session.in_flight() {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
    };

    job.attempts += 1;
    outgoing!(
        level = DEBUG,
        "Sending job {} (attempt {}) via {}",
        job.id,
        job.attempts,
        lane.name()
    );

    let deadline = Duration::from_millis(shared.config.send_timeout_ms);
    let started = Instant::now();
    let result = match tokio::time::timeout(deadline, lane.transport().send(&job.message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::from(TransientError::Timeout(format!(
            "no response within {}ms",
            shared.config.send_timeout_ms
        )))),
    };
    let elapsed = started.elapsed();

    match result {
        Ok(()) => shared.report(Report::Delivered { job, elapsed }),
        Err(error) if error.is_transient() && shared.config.retry.should_retry(job.attempts) => {
            shared.report(Report::Retrying {
                session: session.clone(),
                subscriber: job.subscriber,
                attempts: job.attempts,
                error,
            });
            schedule_retry(job, shared.clone());
        }
        Err(error) => shared.report(Report::Failed { job, error }),
    }
}

/// Re-enqueue a job at the tail of the queue once its backoff elapses
fn schedule_retry(job: MessageJob, shared: Arc<Shared>) {
    let delay = shared.config.retry.backoff(job.attempts);
    tracing::trace!(
        job = %job.id,
        attempts = job.attempts,
        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        "Retry scheduled"
    );

    tokio::spawn(async move {
        let mut stopping = shared.stopping.subscribe();
        if *stopping.borrow_and_update() {
            return;
        }

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = stopping.changed() => return,
        }

        let session = job.session.clone();
        session.enqueue(job, &shared).await;
    });
}
