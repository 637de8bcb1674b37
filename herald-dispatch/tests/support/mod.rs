//! Shared fixtures for dispatch engine tests
#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use herald_common::{
    Campaign, CampaignId, CampaignStatus, ListId, MemoryStore, RateLimit, RenderedMessage,
    Subscriber, SubscriberId, TemplateId,
};
use herald_dispatch::{
    DispatchConfig, DispatchEngine, EngineContext, FailureMonitorConfig, RateLimitConfig,
    RenderError, RetryPolicy, SessionHandle, TemplateRenderer, Transport, TransportError,
    TransportRegistry,
};
use parking_lot::Mutex;
use tokio::{sync::Semaphore, time::Instant};

pub const TRANSPORT: &str = "scripted";

/// A transport whose outcomes are scripted per recipient
#[derive(Debug)]
pub struct ScriptedTransport {
    limit: RateLimit,
    concurrency: Option<usize>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    fallback: Option<TransportError>,
    scripts: Mutex<HashMap<String, VecDeque<TransportError>>>,
    attempts: Mutex<HashMap<String, u32>>,
    delivered: Mutex<Vec<(RenderedMessage, Instant)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            limit: RateLimit::new(0.0, 1),
            concurrency: None,
            delay: Duration::ZERO,
            gate: None,
            fallback: None,
            scripts: Mutex::default(),
            attempts: Mutex::default(),
            delivered: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, limit: RateLimit) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Every send waits for a permit on `gate` before completing
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Fail every recipient without a script with `error`
    pub fn always_failing(mut self, error: TransportError) -> Self {
        self.fallback = Some(error);
        self
    }

    /// The next attempts for `recipient` fail with `errors`, in order
    pub fn fail(self, recipient: &str, errors: Vec<TransportError>) -> Self {
        self.scripts
            .lock()
            .insert(recipient.to_string(), errors.into());
        self
    }

    pub fn attempts(&self, recipient: &str) -> u32 {
        self.attempts.lock().get(recipient).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().values().sum()
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered
            .lock()
            .iter()
            .map(|(message, _)| message.to.clone())
            .collect()
    }

    pub fn delivered_messages(&self) -> Vec<RenderedMessage> {
        self.delivered
            .lock()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }

    pub fn delivered_at(&self) -> Vec<Instant> {
        self.delivered.lock().iter().map(|(_, at)| *at).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    fn rate_limit(&self) -> RateLimit {
        self.limit
    }

    fn max_concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    async fn send(&self, message: &RenderedMessage) -> Result<(), TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        *self.attempts.lock().entry(message.to.clone()).or_default() += 1;

        if let Some(gate) = &self.gate
            && let Ok(permit) = gate.acquire().await
        {
            permit.forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&message.to)
            .and_then(VecDeque::pop_front);
        let result = match scripted.or_else(|| self.fallback.clone()) {
            Some(error) => Err(error),
            None => {
                self.delivered.lock().push((message.clone(), Instant::now()));
                Ok(())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Renders a greeting; subscribers with a `broken` attribute fail to render
#[derive(Debug, Default)]
pub struct TestRenderer;

#[async_trait]
impl TemplateRenderer for TestRenderer {
    async fn render(
        &self,
        _template: TemplateId,
        subscriber: &Subscriber,
    ) -> Result<RenderedMessage, RenderError> {
        if subscriber.attributes.contains_key("broken") {
            return Err(RenderError::InvalidAttributes(format!(
                "subscriber {} has broken attributes",
                subscriber.id
            )));
        }

        Ok(RenderedMessage {
            subject: "Hello".to_string(),
            body: format!("Hi {}", subscriber.email),
            ..RenderedMessage::default()
        })
    }
}

pub fn email(id: u64) -> String {
    format!("sub{id}@example.com")
}

/// Subscribers `1..=count` on list 1
pub fn seed_subscribers(store: &MemoryStore, count: u64) {
    for id in 1..=count {
        store.upsert_subscriber(Subscriber::new(SubscriberId(id), email(id)).subscribed_to(ListId(1)));
    }
}

/// A draft campaign on list 1, due in an hour
pub fn seed_campaign(store: &MemoryStore, id: u64) -> CampaignId {
    let campaign = Campaign::draft(
        CampaignId(id),
        format!("Campaign {id}"),
        vec![ListId(1)],
        TemplateId(1),
        TRANSPORT,
    )
    .with_send_at(Utc::now() + chrono::Duration::hours(1));
    store.insert_campaign(campaign);
    CampaignId(id)
}

pub fn config() -> DispatchConfig {
    DispatchConfig {
        workers: 4,
        queue_capacity: 16,
        page_size: 4,
        send_timeout_ms: 5_000,
        scheduler_interval_secs: 1,
        shutdown_timeout_secs: 5,
        source_retry_delay_ms: 10,
        retry: RetryPolicy {
            max_attempts: 3,
            base_retry_delay_ms: 10,
            max_retry_delay_ms: 100,
            retry_jitter_factor: 0.0,
        },
        auto_pause: FailureMonitorConfig {
            enabled: false,
            ..FailureMonitorConfig::default()
        },
        rate_limits: RateLimitConfig::default(),
    }
}

pub fn engine(
    store: &MemoryStore,
    transport: Arc<ScriptedTransport>,
    config: DispatchConfig,
) -> DispatchEngine {
    let mut transports = TransportRegistry::new(config.rate_limits.clone());
    transports.register(transport);
    DispatchEngine::new(
        config,
        EngineContext::memory(store, Arc::new(TestRenderer), transports),
    )
}

/// Schedule and start a seeded campaign
pub async fn launch(engine: &DispatchEngine, id: CampaignId) -> SessionHandle {
    engine.schedule(id).await.expect("campaign schedules");
    engine.start(id).await.expect("campaign starts")
}

pub async fn wait_for_status(handle: &SessionHandle, status: CampaignStatus) {
    let mut status_rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(30), status_rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("campaign never reached {status}, stuck at {}", handle.status()))
        .expect("session dropped");
}

/// Poll `condition` until it holds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
