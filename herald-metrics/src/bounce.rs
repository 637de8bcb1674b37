//! Bounce correlation metrics

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

use crate::MetricsError;

/// Bounce metrics collector
#[derive(Debug)]
pub struct BounceMetrics {
    /// Ingested bounces by class and source
    bounces: Counter<u64>,

    /// Bounces that could not be matched to a send
    orphaned: Counter<u64>,

    /// Subscribers newly suppressed, by the rule that fired
    suppressions: Counter<u64>,

    orphaned_total: AtomicU64,
    suppressions_total: AtomicU64,
}

impl BounceMetrics {
    /// Create a new bounce metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let bounces = meter
            .u64_counter("herald.bounce.received.total")
            .with_description("Bounce events ingested by class and source")
            .build();

        let orphaned = meter
            .u64_counter("herald.bounce.orphaned.total")
            .with_description("Bounce events that did not correlate to a send")
            .build();

        let suppressions = meter
            .u64_counter("herald.bounce.suppressions.total")
            .with_description("Subscribers suppressed by bounce policy")
            .build();

        Ok(Self {
            bounces,
            orphaned,
            suppressions,
            orphaned_total: AtomicU64::new(0),
            suppressions_total: AtomicU64::new(0),
        })
    }

    pub fn record_bounce(&self, class: &str, source: &str) {
        self.bounces.add(
            1,
            &[
                KeyValue::new("class", class.to_string()),
                KeyValue::new("source", source.to_string()),
            ],
        );
    }

    /// Record an uncorrelated bounce
    pub fn record_orphan(&self, reason: &str) {
        self.orphaned
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
        self.orphaned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suppression(&self, class: &str) {
        self.suppressions
            .add(1, &[KeyValue::new("class", class.to_string())]);
        self.suppressions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn orphaned_count(&self) -> u64 {
        self.orphaned_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn suppression_count(&self) -> u64 {
        self.suppressions_total.load(Ordering::Relaxed)
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("herald.bounce")
}
