//! Metrics configuration

use serde::Deserialize;

mod defaults {
    pub const fn enabled() -> bool {
        false
    }

    pub fn endpoint() -> String {
        "http://localhost:4318/v1/metrics".to_string()
    }

    pub fn service_name() -> String {
        "herald".to_string()
    }

    pub const fn export_interval_secs() -> u64 {
        60
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Every instrument is a no-op when disabled
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// OTLP/HTTP collector endpoint
    #[serde(default = "defaults::endpoint")]
    pub endpoint: String,

    /// `service.name` resource attribute attached to every data point
    #[serde(default = "defaults::service_name")]
    pub service_name: String,

    /// How often accumulated metrics are pushed (in seconds)
    #[serde(default = "defaults::export_interval_secs")]
    pub export_interval_secs: u64,
}

impl MetricsConfig {
    /// Whether `endpoint` looks like something the HTTP exporter can push to
    #[must_use]
    pub fn has_valid_endpoint(&self) -> bool {
        let endpoint = self.endpoint.trim();
        ["http://", "https://"].iter().any(|scheme| {
            endpoint
                .strip_prefix(scheme)
                .is_some_and(|rest| !rest.is_empty())
        })
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            endpoint: defaults::endpoint(),
            service_name: defaults::service_name(),
            export_interval_secs: defaults::export_interval_secs(),
        }
    }
}
