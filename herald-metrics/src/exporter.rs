//! OTLP/HTTP push exporter

use std::time::Duration;

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
};

use crate::{MetricsConfig, MetricsError};

/// Build a meter provider that pushes to the configured collector on an interval
///
/// # Errors
///
/// If the endpoint is not an http(s) URL or the exporter cannot be built
pub fn meter_provider(config: &MetricsConfig) -> Result<SdkMeterProvider, MetricsError> {
    if !config.has_valid_endpoint() {
        return Err(MetricsError::InvalidEndpoint(config.endpoint.clone()));
    }

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(config.endpoint.trim())
        .build()
        .map_err(|e| MetricsError::Exporter(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(config.export_interval_secs.max(1)))
        .build();

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}
