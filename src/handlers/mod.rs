//! One delivery handler per integration type.
//!
//! Handlers validate their config before any I/O, perform exactly one
//! delivery and classify failures as permanent or transient. They hold no
//! per-job state and may run the same job more than once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};

use crate::config::ChannelSettings;
use crate::error::{DispatchError, HandlerError};
use crate::types::{IntegrationJob, IntegrationType};

mod discord;
mod email;
mod slack;
mod telegram;
mod webhook;
mod whatsapp;

pub use discord::DiscordHandler;
pub use email::{ApiEmailHandler, OauthEmailHandler, SmtpEmailHandler};
pub use slack::{SlackClient, SlackHandler};
pub use telegram::{TelegramClient, TelegramHandler};
pub use webhook::WebhookHandler;
pub use whatsapp::WhatsappHandler;

/// Delivers jobs of one integration type.
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    fn integration_type(&self) -> IntegrationType;

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError>;
}

/// Handlers keyed by the integration type they serve.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<IntegrationType, Arc<dyn IntegrationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handler for every integration type,
    /// sharing one HTTP client.
    pub fn with_defaults(settings: &ChannelSettings) -> Result<Self, DispatchError> {
        let client = http_client(settings)?;
        let telegram = Arc::new(TelegramClient::new(client.clone(), settings));
        let slack = Arc::new(SlackClient::new(client.clone(), settings));

        let mut registry = Self::new();
        registry.register(WebhookHandler::new(client.clone()));
        registry.register(SmtpEmailHandler::new(settings.smtp.clone(), settings.http_timeout()));
        registry.register(OauthEmailHandler::new(client.clone(), settings));
        registry.register(ApiEmailHandler::new(client.clone(), settings));
        registry.register(TelegramHandler::new(telegram));
        registry.register(DiscordHandler::new(client.clone()));
        registry.register(SlackHandler::new(slack));
        registry.register(WhatsappHandler::new(client, settings));
        Ok(registry)
    }

    /// Add a handler, replacing any previous one for the same type.
    pub fn register(&mut self, handler: impl IntegrationHandler + 'static) -> &mut Self {
        self.register_arc(Arc::new(handler))
    }

    pub fn register_arc(&mut self, handler: Arc<dyn IntegrationHandler>) -> &mut Self {
        self.handlers.insert(handler.integration_type(), handler);
        self
    }

    pub fn get(&self, kind: IntegrationType) -> Option<Arc<dyn IntegrationHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered types in declaration order.
    pub fn kinds(&self) -> Vec<IntegrationType> {
        IntegrationType::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}

pub(crate) fn http_client(settings: &ChannelSettings) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(settings.http_timeout())
        .user_agent(settings.user_agent.clone())
        .build()
}

pub(crate) fn require<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, HandlerError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| HandlerError::config(field))
}

pub(crate) fn config_mismatch(job: &IntegrationJob) -> HandlerError {
    HandlerError::permanent(format!(
        "{} job carries {} config",
        job.integration_type,
        job.config.kind()
    ))
}

/// Classify a request that never produced a response.
pub(crate) fn send_error(channel: &str, err: reqwest::Error) -> HandlerError {
    if err.is_builder() {
        HandlerError::permanent(format!("{channel}: invalid request: {err}"))
    } else if err.is_timeout() {
        HandlerError::transient(format!("{channel}: request timed out"))
    } else {
        HandlerError::transient(format!("{channel}: {err}"))
    }
}

/// Pass a successful response through; map an error status to a failure.
///
/// Statuses listed in `permanent` fail permanently, everything else
/// (5xx, 429, unexpected codes) is retried.
pub(crate) async fn check_status(
    channel: &str,
    response: Response,
    permanent: &[StatusCode],
) -> Result<Response, HandlerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(channel, status, &body, permanent))
}

pub(crate) fn status_error(
    channel: &str,
    status: StatusCode,
    body: &str,
    permanent: &[StatusCode],
) -> HandlerError {
    let message = format!("{channel}: HTTP {status}: {}", truncate(body, 300));
    if permanent.contains(&status) {
        HandlerError::permanent(message)
    } else {
        HandlerError::transient(message)
    }
}

/// At most `max` characters of `text`.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(IntegrationType);

    #[async_trait]
    impl IntegrationHandler for Noop {
        fn integration_type(&self) -> IntegrationType {
            self.0
        }

        async fn handle(&self, _job: &IntegrationJob) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn defaults_cover_every_type() {
        let registry = HandlerRegistry::with_defaults(&ChannelSettings::default()).expect("client");
        assert_eq!(registry.kinds(), IntegrationType::ALL.to_vec());
    }

    #[test]
    fn register_replaces_existing_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register(Noop(IntegrationType::Slack));
        registry.register(Noop(IntegrationType::Slack));
        assert_eq!(registry.kinds(), vec![IntegrationType::Slack]);
        assert!(registry.get(IntegrationType::Webhook).is_none());
    }

    #[test]
    fn status_classification() {
        let permanent = [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN];
        assert!(status_error("x", StatusCode::FORBIDDEN, "", &permanent).is_permanent());
        assert!(!status_error("x", StatusCode::TOO_MANY_REQUESTS, "", &permanent).is_permanent());
        assert!(!status_error("x", StatusCode::BAD_GATEWAY, "", &permanent).is_permanent());
    }

    #[test]
    fn required_fields_reject_blank_values() {
        assert_eq!(require(&Some(" t ".into()), "token"), Ok("t"));
        assert!(require(&Some("  ".into()), "token").unwrap_err().is_permanent());
        assert_eq!(
            require(&None, "token"),
            Err(HandlerError::config("token"))
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
