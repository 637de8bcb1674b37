use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use chrono::Utc;
use herald_bounce::{BounceConfig, BounceCorrelator, DirectoryMailbox, MailboxPoller};
use herald_common::{
    MemoryStore, Signal, TemplateId,
    audit::{self, AuditConfig},
    internal, logging,
};
use herald_dispatch::{DispatchConfig, DispatchEngine, EngineContext, TransportRegistry};
use herald_metrics::MetricsConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{
    fixtures::Fixtures,
    render::{StaticRenderer, TemplateConfig},
    transport::{LogTransport, TransportConfig},
};

#[derive(Debug, Default, Deserialize)]
pub struct Herald {
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    bounce: BounceConfig,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    audit: AuditConfig,
    #[serde(default, alias = "transport")]
    transports: Vec<TransportConfig>,
    #[serde(default, alias = "template")]
    templates: Vec<TemplateConfig>,
    #[serde(default)]
    fixtures: Fixtures,
    /// Directory of `.eml` bounce reports to poll
    #[serde(default)]
    mailbox: Option<PathBuf>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Herald {
    /// Read a RON configuration file
    ///
    /// # Errors
    ///
    /// If the file cannot be read or is not a valid configuration
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        ron::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    fn transports(&self) -> anyhow::Result<TransportRegistry> {
        let mut registry = TransportRegistry::new(self.dispatch.rate_limits.clone());
        for transport in &self.transports {
            anyhow::ensure!(
                !registry.contains(&transport.name),
                "Transport {} is configured more than once",
                transport.name
            );
            registry.register(Arc::new(LogTransport::new(transport.clone())));
        }
        Ok(registry)
    }

    /// Check that every seeded campaign refers to a known transport and template
    ///
    /// # Errors
    ///
    /// Describing the first inconsistency found
    pub fn check(&self) -> anyhow::Result<()> {
        let registry = self.transports()?;
        let renderer = StaticRenderer::new(&self.templates);
        anyhow::ensure!(
            self.dispatch.workers > 0,
            "dispatch.workers must be at least 1"
        );

        for campaign in &self.fixtures.campaigns {
            anyhow::ensure!(
                registry.contains(&campaign.transport),
                "Campaign {} uses unknown transport {}",
                campaign.id,
                campaign.transport
            );
            anyhow::ensure!(
                renderer.contains(campaign.template),
                "Campaign {} uses unknown template {}",
                campaign.id,
                campaign.template
            );
        }

        let mut templates: Vec<TemplateId> =
            self.templates.iter().map(|t| TemplateId(t.id)).collect();
        templates.sort_unstable();
        let before = templates.len();
        templates.dedup();
        anyhow::ensure!(before == templates.len(), "Template ids must be unique");

        Ok(())
    }

    /// Run the dispatcher until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// If the configuration is inconsistent, metrics fail to initialise, or
    /// the engine cannot list campaigns on startup
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        audit::init(self.audit.clone());
        herald_metrics::init_metrics(&self.metrics)?;
        self.check()?;

        internal!(level = INFO, "Controller running");

        let store = MemoryStore::new();
        let due = self.fixtures.seed(&store, Utc::now());

        let backing = Arc::new(store.clone());
        let (bounces, correlator) =
            BounceCorrelator::new(self.bounce.clone(), backing.clone(), backing.clone(), backing)
                .spawn();

        let poller = self.mailbox.as_ref().map(|dir| {
            internal!(level = INFO, "Polling {} for bounce reports", dir.display());
            MailboxPoller::new(
                Arc::new(DirectoryMailbox::new(dir)),
                bounces.clone(),
                &self.bounce,
            )
        });

        let engine = DispatchEngine::new(
            self.dispatch.clone(),
            EngineContext::memory(
                &store,
                Arc::new(StaticRenderer::new(&self.templates)),
                self.transports()?,
            )
            .with_bounces(bounces),
        );

        for session in engine.recover().await? {
            internal!(level = INFO, "Recovered campaign {}", session.campaign_id());
        }

        for id in due {
            match engine.schedule(id).await {
                Ok(campaign) => tracing::info!(
                    campaign = %id,
                    send_at = ?campaign.send_at,
                    "Campaign scheduled"
                ),
                Err(err) => tracing::error!(campaign = %id, error = %err, "Failed to schedule campaign"),
            }
        }

        let ret = tokio::select! {
            r = engine.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = async {
                match &poller {
                    Some(poller) => poller.serve(SHUTDOWN_BROADCAST.subscribe()).await,
                    None => std::future::pending().await,
                }
            } => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        engine.shutdown().await;
        // The correlator stops once every handle to it is gone
        drop(engine);
        drop(poller);
        if let Err(err) = correlator.await {
            tracing::error!(error = %err, "Bounce correlator task failed");
        }

        ret
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONFIG: &str = r#"(
        dispatch: (workers: 2, retry: (max_attempts: 5)),
        bounce: (correlation_window_secs: 86400),
        transports: [(name: "log", messages_per_second: 5.0)],
        templates: [(id: 1, subject: "Hi {{name}}", body: "Hello")],
        fixtures: (
            subscribers: [(id: 1, email: "a@example.com", lists: [1])],
            campaigns: [(id: 1, name: "Launch", lists: [1], template: 1, transport: "log", send_in_secs: Some(5))],
        ),
    )"#;

    #[test]
    fn test_load_and_check() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let herald = Herald::load(file.path()).unwrap();
        assert_eq!(herald.dispatch.workers, 2);
        assert_eq!(herald.dispatch.retry.max_attempts, 5);
        assert_eq!(herald.bounce.correlation_window_secs, 86_400);
        assert!(herald.mailbox.is_none());
        herald.check().unwrap();
    }

    #[test]
    fn test_check_rejects_unknown_references() {
        let herald: Herald = ron::from_str(&CONFIG.replace("transport: \"log\",", "transport: \"smtp\",")).unwrap();
        let err = herald.check().unwrap_err();
        assert!(err.to_string().contains("unknown transport smtp"), "{err}");

        let herald: Herald = ron::from_str(&CONFIG.replace("template: 1,", "template: 2,")).unwrap();
        assert!(herald.check().unwrap_err().to_string().contains("unknown template 2"));

        let herald: Herald = ron::from_str(
            &CONFIG.replace("transports: [(name: \"log\",", "transports: [(name: \"log\"), (name: \"log\","),
        )
        .unwrap();
        assert!(herald.check().unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_missing_file() {
        let err = Herald::load(Path::new("/nonexistent/herald.config.ron")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
