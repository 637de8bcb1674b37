//! OpenTelemetry metrics for herald
//!
//! Dispatch and bounce instruments are pushed over OTLP/HTTP to a collector.
//! Until `init_metrics` runs with metrics enabled, `metrics()` is `None` and
//! every call site skips recording.
//!
//! ```rust,no_run
//! use herald_metrics::{MetricsConfig, init_metrics};
//!
//! # fn example() -> Result<(), herald_metrics::MetricsError> {
//! init_metrics(&MetricsConfig {
//!     enabled: true,
//!     ..MetricsConfig::default()
//! })?;
//!
//! if let Some(metrics) = herald_metrics::metrics() {
//!     metrics.dispatch.set_queue_depth(0);
//! }
//! # Ok(())
//! # }
//! ```

mod bounce;
mod config;
mod dispatch;
mod error;
mod exporter;

pub use bounce::BounceMetrics;
pub use config::MetricsConfig;
pub use dispatch::DispatchMetrics;
pub use error::MetricsError;
use once_cell::sync::OnceCell;

/// Global metrics instance
static METRICS_INSTANCE: OnceCell<Metrics> = OnceCell::new();

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub dispatch: DispatchMetrics,
    pub bounce: BounceMetrics,
}

/// Install the global meter provider and build every instrument
///
/// A no-op when metrics are disabled.
///
/// # Errors
///
/// If the exporter cannot be built, or metrics were already initialised
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        tracing::info!("Metrics disabled");
        return Ok(());
    }

    if METRICS_INSTANCE.get().is_some() {
        return Err(MetricsError::AlreadyInitialized);
    }

    let provider = exporter::meter_provider(config)?;
    opentelemetry::global::set_meter_provider(provider);

    METRICS_INSTANCE
        .set(Metrics {
            dispatch: DispatchMetrics::new()?,
            bounce: BounceMetrics::new()?,
        })
        .map_err(|_| MetricsError::AlreadyInitialized)?;

    tracing::info!(
        endpoint = %config.endpoint,
        service = %config.service_name,
        interval_secs = config.export_interval_secs,
        "Metrics exporting over OTLP"
    );

    Ok(())
}

#[must_use]
pub fn metrics() -> Option<&'static Metrics> {
    METRICS_INSTANCE.get()
}

#[must_use]
pub fn is_enabled() -> bool {
    METRICS_INSTANCE.get().is_some()
}
