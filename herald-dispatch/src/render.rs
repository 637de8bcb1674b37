//! The template renderer contract

use async_trait::async_trait;
use herald_common::{RenderedMessage, Subscriber, TemplateId};
use thiserror::Error;

/// Turns a campaign template and one subscriber into a message
///
/// The renderer owns the template syntax; the engine only stamps tracking
/// headers on the result and fills in the recipient when left empty.
#[async_trait]
pub trait TemplateRenderer: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// A `RenderError` for this subscriber only; the session carries on
    async fn render(
        &self,
        template: TemplateId,
        subscriber: &Subscriber,
    ) -> Result<RenderedMessage, RenderError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Unknown template: {0}")]
    UnknownTemplate(TemplateId),

    /// The subscriber's attributes did not satisfy the template
    #[error("Invalid attribute data: {0}")]
    InvalidAttributes(String),

    #[error("Render failed: {0}")]
    Failed(String),
}
