//! Dispatch engine metrics
//!
//! Tracks outbound campaign traffic:
//! - Terminal outcomes per transport (delivered, failed, skipped, discarded)
//! - Retries and send latency per transport
//! - Dispatch queue depth
//! - Automatic pauses by condition

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Dispatch metrics collector
#[derive(Debug)]
pub struct DispatchMetrics {
    delivered: Counter<u64>,
    failed: Counter<u64>,
    retried: Counter<u64>,
    skipped: Counter<u64>,
    discarded: Counter<u64>,
    auto_paused: Counter<u64>,
    send_duration_seconds: Histogram<f64>,

    // Shared with the observable gauge callback
    queue_depth: Arc<AtomicU64>,

    // Local tallies so callers (and tests) can read totals without an exporter
    delivered_by_transport: DashMap<String, AtomicU64>,
    failed_total: AtomicU64,
}

impl DispatchMetrics {
    /// Create a new dispatch metrics collector
    ///
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let delivered = meter
            .u64_counter("herald.dispatch.messages.delivered.total")
            .with_description("Messages accepted by a transport")
            .build();

        let failed = meter
            .u64_counter("herald.dispatch.messages.failed.total")
            .with_description("Messages that reached a permanent failure")
            .build();

        let retried = meter
            .u64_counter("herald.dispatch.messages.retried.total")
            .with_description("Transient failures that were scheduled for another attempt")
            .build();

        let skipped = meter
            .u64_counter("herald.dispatch.messages.skipped.total")
            .with_description("Snapshot members skipped because they were suppressed")
            .build();

        let discarded = meter
            .u64_counter("herald.dispatch.messages.discarded.total")
            .with_description("Queued jobs dropped because their campaign was cancelled")
            .build();

        let auto_paused = meter
            .u64_counter("herald.dispatch.campaigns.auto_paused.total")
            .with_description("Campaigns paused automatically by the failure monitor")
            .build();

        let send_duration_seconds = meter
            .f64_histogram("herald.dispatch.send.duration.seconds")
            .with_description("Distribution of transport send latency")
            .build();

        let queue_depth = Arc::new(AtomicU64::new(0));
        let depth = queue_depth.clone();

        // The meter keeps this alive internally via the callback
        meter
            .u64_observable_gauge("herald.dispatch.queue.depth")
            .with_description("Jobs currently waiting in the dispatch queue")
            .with_callback(move |observer| {
                observer.observe(depth.load(Ordering::Relaxed), &[]);
            })
            .build();

        Ok(Self {
            delivered,
            failed,
            retried,
            skipped,
            discarded,
            auto_paused,
            send_duration_seconds,
            queue_depth,
            delivered_by_transport: DashMap::new(),
            failed_total: AtomicU64::new(0),
        })
    }

    /// Record a message accepted by `transport`
    pub fn record_delivered(&self, transport: &str, duration_secs: f64) {
        let attributes = [KeyValue::new("transport", transport.to_string())];
        self.delivered.add(1, &attributes);
        self.send_duration_seconds.record(duration_secs, &attributes);

        self.delivered_by_transport
            .entry(transport.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a permanent failure
    pub fn record_failed(&self, transport: &str, reason: &str) {
        self.failed.add(
            1,
            &[
                KeyValue::new("transport", transport.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
        self.failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, transport: &str) {
        self.retried
            .add(1, &[KeyValue::new("transport", transport.to_string())]);
    }

    pub fn record_skipped(&self) {
        self.skipped.add(1, &[]);
    }

    pub fn record_discarded(&self, count: u64) {
        self.discarded.add(count, &[]);
    }

    pub fn record_auto_pause(&self, condition: &str) {
        self.auto_paused
            .add(1, &[KeyValue::new("condition", condition.to_string())]);
    }

    /// Set the current dispatch queue depth
    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    #[must_use]
    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Messages delivered through `transport` since startup
    #[must_use]
    pub fn delivered_count(&self, transport: &str) -> u64 {
        self.delivered_by_transport
            .get(transport)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.failed_total.load(Ordering::Relaxed)
    }
}

/// Get the OpenTelemetry meter for dispatch metrics
fn meter() -> Meter {
    opentelemetry::global::meter("herald.dispatch")
}
