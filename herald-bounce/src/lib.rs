//! Bounce handling for herald
//!
//! - The correlator that ties bounces back to sent messages and applies the
//!   suppression policy
//! - Provider webhook normalisation (SES, SendGrid, Postmark, Forward Email)
//! - Bounce mailbox parsing (DSN and ARF reports) and the periodic poller

mod correlator;
mod error;
pub mod mailbox;
mod policy;
pub mod webhook;

pub use correlator::{BounceCorrelator, BounceHandle, Correlation};
pub use error::{BounceError, CorrelationMiss, MailboxError, WebhookError};
pub use mailbox::{DirectoryMailbox, Mailbox, MailboxPoller, MemoryMailbox, parse_report};
pub use policy::{BounceAction, BounceConfig, BouncePolicy, BounceRule};
pub use webhook::{Provider, normalize};
