use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    /// `init_metrics` already installed the global instance
    #[error("Metrics already initialised")]
    AlreadyInitialized,

    #[error("Invalid OTLP endpoint {0:?}: expected an http or https URL")]
    InvalidEndpoint(String),

    /// The OTLP exporter or an instrument could not be built
    #[error("OpenTelemetry exporter error: {0}")]
    Exporter(String),
}
