//! Campaign dispatch engine
//!
//! This crate turns a scheduled campaign into a stream of individually
//! rendered, rate-limited and retried deliveries:
//! - The campaign state machine and its operator-facing operations
//! - One dispatch session per running campaign, paging through subscribers
//! - A bounded dispatch queue feeding a fixed worker pool
//! - Per-transport and per-campaign rate limits, retries with backoff
//! - Automatic pausing when a campaign's transport keeps failing

mod config;
mod engine;
mod error;
mod monitor;
pub mod queue;
mod rate_limiter;
mod render;
mod reporter;
mod retry;
mod session;
mod transport;
mod worker;

pub use config::DispatchConfig;
pub use engine::{CampaignEvent, DispatchEngine, EngineContext};
pub use error::{DispatchError, TransitionError, ValidationError};
pub use monitor::{FailureMonitor, FailureMonitorConfig};
pub use queue::{DispatchQueue, JobId, MessageJob};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use render::{RenderError, TemplateRenderer};
pub use retry::RetryPolicy;
pub use session::{SessionHandle, SessionId};
pub use transport::{
    Lane, PermanentError, TransientError, Transport, TransportError, TransportRegistry,
};
