//! A minimal placeholder renderer for configured templates
//!
//! `{{email}}` and `{{name}}` expand to the subscriber's fields; any other
//! `{{key}}` expands to the subscriber attribute of that name. A placeholder
//! with no value fails the render for that subscriber only.

use ahash::AHashMap;
use async_trait::async_trait;
use herald_common::{RenderedMessage, Subscriber, TemplateId};
use herald_dispatch::{RenderError, TemplateRenderer};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    pub id: u64,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct StaticRenderer {
    templates: AHashMap<TemplateId, TemplateConfig>,
}

impl StaticRenderer {
    #[must_use]
    pub fn new(templates: &[TemplateConfig]) -> Self {
        Self {
            templates: templates
                .iter()
                .map(|template| (TemplateId(template.id), template.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn contains(&self, id: TemplateId) -> bool {
        self.templates.contains_key(&id)
    }
}

fn lookup(subscriber: &Subscriber, key: &str) -> Option<String> {
    match key {
        "email" => Some(subscriber.email.clone()),
        "name" => Some(subscriber.name.clone()),
        _ => subscriber.attributes.get(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

fn expand(text: &str, subscriber: &Subscriber) -> Result<String, RenderError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(RenderError::Failed(format!(
                "unterminated placeholder in {text:?}"
            )));
        };

        let key = after[..end].trim();
        let value = lookup(subscriber, key).ok_or_else(|| {
            RenderError::InvalidAttributes(format!("subscriber {} has no {key}", subscriber.id))
        })?;
        out.push_str(&value);
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

#[async_trait]
impl TemplateRenderer for StaticRenderer {
    async fn render(
        &self,
        template: TemplateId,
        subscriber: &Subscriber,
    ) -> Result<RenderedMessage, RenderError> {
        let config = self
            .templates
            .get(&template)
            .ok_or(RenderError::UnknownTemplate(template))?;

        Ok(RenderedMessage {
            to: subscriber.email.clone(),
            subject: expand(&config.subject, subscriber)?,
            body: expand(&config.body, subscriber)?,
            headers: Vec::new(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use herald_common::SubscriberId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn renderer() -> StaticRenderer {
        StaticRenderer::new(&[TemplateConfig {
            id: 1,
            subject: "News for {{ name }}".to_string(),
            body: "Hi {{name}}, your plan is {{plan}}. Sent to {{email}}.".to_string(),
        }])
    }

    fn subscriber() -> Subscriber {
        let mut subscriber = Subscriber::new(SubscriberId(4), "ada@example.com");
        subscriber.name = "Ada".to_string();
        subscriber
            .attributes
            .insert("plan".to_string(), serde_json::Value::from("pro"));
        subscriber
    }

    #[tokio::test]
    async fn test_expands_fields_and_attributes() {
        let message = renderer().render(TemplateId(1), &subscriber()).await.unwrap();

        assert_eq!(message.to, "ada@example.com");
        assert_eq!(message.subject, "News for Ada");
        assert_eq!(message.body, "Hi Ada, your plan is pro. Sent to ada@example.com.");
    }

    #[tokio::test]
    async fn test_missing_attribute_and_template() {
        let mut subscriber = subscriber();
        subscriber.attributes.clear();

        assert!(matches!(
            renderer().render(TemplateId(1), &subscriber).await,
            Err(RenderError::InvalidAttributes(_))
        ));
        assert_eq!(
            renderer().render(TemplateId(2), &subscriber).await,
            Err(RenderError::UnknownTemplate(TemplateId(2)))
        );
    }
}
