//! The bounce correlator
//!
//! Every bounce, whatever adapter produced it, ends up here as a normalised
//! `BounceEvent`. The correlator ties it back to a delivery ledger entry,
//! stores an immutable `BounceRecord` and applies the suppression policy.
//! It is the only writer of subscriber bounce counters and suppression flags.
//!
//! A single task owns the correlator; adapters and the dispatch engine talk
//! to it through a cloneable `BounceHandle`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_common::{
    BounceEvent, BounceId, BounceRecord, BounceStore, DeliveryLedger, SubscriberStore, audit,
    internal,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    error::{BounceError, CorrelationMiss},
    policy::{BounceAction, BounceConfig},
};

/// What ingesting one bounce event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub record: BounceRecord,
    /// Set when the record is orphaned
    pub miss: Option<CorrelationMiss>,
    /// Whether this bounce flipped the subscriber's suppression latch
    pub suppressed: bool,
}

impl Correlation {
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        self.miss.is_none()
    }
}

#[derive(Debug)]
pub struct BounceCorrelator {
    config: BounceConfig,
    subscribers: Arc<dyn SubscriberStore>,
    bounces: Arc<dyn BounceStore>,
    ledger: Arc<dyn DeliveryLedger>,
}

impl BounceCorrelator {
    #[must_use]
    pub fn new(
        config: BounceConfig,
        subscribers: Arc<dyn SubscriberStore>,
        bounces: Arc<dyn BounceStore>,
        ledger: Arc<dyn DeliveryLedger>,
    ) -> Self {
        Self {
            config,
            subscribers,
            bounces,
            ledger,
        }
    }

    /// Correlate, record and apply policy for one bounce event
    ///
    /// # Errors
    /// If one of the stores fails. A bounce that matches nothing is not an
    /// error; it is recorded as orphaned.
    #[tracing::instrument(level = "debug", skip_all, fields(class = %event.class, source = %event.source))]
    pub async fn ingest(&self, event: BounceEvent) -> Result<Correlation, BounceError> {
        let subscriber = self.subscribers.find_by_email(&event.recipient).await?;

        let sent = match &subscriber {
            Some(subscriber) => {
                let since = event
                    .timestamp
                    .checked_sub_signed(self.config.correlation_window())
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                let hinted = match event.campaign_hint {
                    Some(hint) => {
                        self.ledger
                            .find_sent(subscriber.id, Some(hint), since, event.timestamp)
                            .await?
                    }
                    None => None,
                };
                // A hint nothing was sent under is stale or mangled; fall back to the window
                match hinted {
                    Some(sent) => Some(sent),
                    None => {
                        self.ledger
                            .find_sent(subscriber.id, None, since, event.timestamp)
                            .await?
                    }
                }
            }
            None => None,
        };

        let miss = match (&subscriber, &sent) {
            (None, _) => Some(CorrelationMiss::UnknownRecipient),
            (Some(_), None) => Some(CorrelationMiss::NoMatchingSend),
            (Some(_), Some(_)) => None,
        };

        let record = BounceRecord {
            id: BounceId::generate(),
            subscriber: subscriber.as_ref().map(|s| s.id),
            campaign: sent.as_ref().map(|s| s.campaign),
            class: event.class,
            source: event.source.clone(),
            raw_payload: event.raw_payload,
            timestamp: event.timestamp,
        };
        self.bounces.insert_bounce(&record).await?;

        audit::log_bounce_recorded(&record, &event.recipient);
        if let Some(metrics) = herald_metrics::metrics() {
            metrics
                .bounce
                .record_bounce(record.class.as_str(), &record.source.to_string());
        }

        let (Some(subscriber), None) = (subscriber, miss) else {
            let miss = miss.unwrap_or(CorrelationMiss::NoMatchingSend);
            tracing::debug!(
                bounce = %record.id,
                reason = %miss,
                "Orphaned bounce, subscriber left untouched"
            );
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.bounce.record_orphan(miss.as_str());
            }
            return Ok(Correlation {
                record,
                miss: Some(miss),
                suppressed: false,
            });
        };

        self.subscribers
            .record_bounce(subscriber.id, record.class)
            .await?;

        let rule = self.config.policy.rule(record.class);
        let mut suppressed = false;
        if rule.action == BounceAction::Suppress {
            let since = rule
                .window()
                .and_then(|window| record.timestamp.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let count = self
                .bounces
                .count_bounces(subscriber.id, record.class, since)
                .await?;

            if count >= u64::from(rule.count.max(1)) {
                suppressed = self.subscribers.suppress(subscriber.id).await?;
            }
        }

        if suppressed {
            let rule_name = format!("{}>={}", record.class, rule.count);
            tracing::info!(
                subscriber = %subscriber.id,
                class = %record.class,
                "Subscriber suppressed"
            );
            audit::log_subscriber_suppressed(subscriber.id, &subscriber.email, &rule_name);
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.bounce.record_suppression(record.class.as_str());
            }
        }

        Ok(Correlation {
            record,
            miss: None,
            suppressed,
        })
    }

    /// Move the correlator onto its own task
    ///
    /// The task stops once every `BounceHandle` has been dropped and the
    /// channel is drained.
    #[must_use]
    pub fn spawn(self) -> (BounceHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let task = tokio::spawn(self.run(receiver));
        (BounceHandle { sender }, task)
    }

    async fn run(self, mut receiver: mpsc::Receiver<Submission>) {
        internal!(level = INFO, "Bounce correlator started");

        while let Some(Submission { event, reply }) = receiver.recv().await {
            let result = self.ingest(event).await;
            if let Err(err) = &result {
                tracing::error!(error = %err, "Failed to ingest bounce");
            }

            if let Some(reply) = reply {
                // The submitter may have given up waiting
                let _ = reply.send(result);
            }
        }

        internal!(level = INFO, "Bounce correlator stopped");
    }
}

#[derive(Debug)]
struct Submission {
    event: BounceEvent,
    reply: Option<oneshot::Sender<Result<Correlation, BounceError>>>,
}

/// Cloneable entry point into the correlator task
#[derive(Debug, Clone)]
pub struct BounceHandle {
    sender: mpsc::Sender<Submission>,
}

impl BounceHandle {
    /// Queue an event for correlation, waiting only for channel capacity
    ///
    /// # Errors
    /// `BounceError::Closed` if the correlator has stopped
    pub async fn submit(&self, event: BounceEvent) -> Result<(), BounceError> {
        self.sender
            .send(Submission { event, reply: None })
            .await
            .map_err(|_| BounceError::Closed)
    }

    /// Queue an event and wait for its correlation
    ///
    /// # Errors
    /// `BounceError::Closed` if the correlator has stopped, or the ingest error
    pub async fn correlate(&self, event: BounceEvent) -> Result<Correlation, BounceError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Submission {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| BounceError::Closed)?;

        response.await.map_err(|_| BounceError::Closed)?
    }
}
