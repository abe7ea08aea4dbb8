use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{config_mismatch, require, send_error, truncate, IntegrationHandler};
use crate::config::ChannelSettings;
use crate::error::HandlerError;
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

/// Graph API error codes: expired/invalid token, account not registered.
const PERMANENT_CODES: [i64; 2] = [190, 131030];

const MAX_BODY_CHARS: usize = 4096;

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// Sends a text message through the Meta Cloud API.
pub struct WhatsappHandler {
    client: reqwest::Client,
    api_base: String,
}

impl WhatsappHandler {
    pub fn new(client: reqwest::Client, settings: &ChannelSettings) -> Self {
        Self {
            client,
            api_base: settings.whatsapp_api_base.trim_end_matches('/').to_string(),
        }
    }
}

pub(crate) fn classify_graph_error(status: reqwest::StatusCode, body: &str) -> HandlerError {
    let parsed = serde_json::from_str::<GraphErrorBody>(body).ok();
    let code = parsed.as_ref().and_then(|b| b.error.code);
    let detail = parsed
        .as_ref()
        .and_then(|b| b.error.message.clone())
        .unwrap_or_else(|| truncate(body, 300).to_string());
    let message = match code {
        Some(code) => format!("whatsapp: HTTP {status}: code {code}: {detail}"),
        None => format!("whatsapp: HTTP {status}: {detail}"),
    };

    if code.is_some_and(|c| PERMANENT_CODES.contains(&c)) {
        HandlerError::permanent(message)
    } else {
        HandlerError::transient(message)
    }
}

#[async_trait]
impl IntegrationHandler for WhatsappHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Whatsapp
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::Whatsapp(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let phone_number_id = require(&config.phone_number_id, "phoneNumberId")?;
        let token = require(&config.access_token, "accessToken")?;
        let recipient = require(&config.recipient, "recipient")?;

        let response = self
            .client
            .post(format!("{}/{phone_number_id}/messages", self.api_base))
            .bearer_auth(token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": recipient,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": truncate(&job.formatted_message, MAX_BODY_CHARS),
                },
            }))
            .send()
            .await
            .map_err(|e| send_error("whatsapp", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_graph_error(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn token_and_registration_codes_are_permanent() {
        let expired = r#"{"error":{"message":"Error validating access token","type":"OAuthException","code":190}}"#;
        assert!(classify_graph_error(StatusCode::UNAUTHORIZED, expired).is_permanent());

        let unregistered = r#"{"error":{"message":"Recipient not registered","code":131030}}"#;
        assert!(classify_graph_error(StatusCode::BAD_REQUEST, unregistered).is_permanent());
    }

    #[test]
    fn other_failures_are_retried() {
        let throttled = r#"{"error":{"message":"Rate limit hit","code":130429}}"#;
        let err = classify_graph_error(StatusCode::BAD_REQUEST, throttled);
        assert!(!err.is_permanent());
        assert!(err.message().contains("130429"));

        assert!(!classify_graph_error(StatusCode::BAD_GATEWAY, "<html>").is_permanent());
    }
}
