use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use super::{check_status, config_mismatch, require, send_error, IntegrationHandler};
use crate::config::ChannelSettings;
use crate::error::HandlerError;
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

const PERMANENT: [StatusCode; 2] = [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN];

/// `ok: false` error codes that no retry can fix.
const PERMANENT_API_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "no_permission",
    "missing_scope",
    "channel_not_found",
    "not_in_channel",
    "is_archived",
    "invalid_arguments",
];

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Web API client; the bot token is supplied per call.
pub struct SlackClient {
    http: reqwest::Client,
    api_base: String,
}

impl SlackClient {
    pub fn new(http: reqwest::Client, settings: &ChannelSettings) -> Self {
        Self {
            http,
            api_base: settings.slack_api_base.trim_end_matches('/').to_string(),
        }
    }

    /// `chat.postMessage` to `channel`.
    pub async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
    ) -> Result<(), HandlerError> {
        let response = self
            .http
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await
            .map_err(|e| send_error("slack", e))?;

        let response = check_status("slack", response, &PERMANENT).await?;
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::transient(format!("slack: unreadable response: {e}")))?;

        if body.ok {
            return Ok(());
        }
        let error = body.error.unwrap_or_else(|| "unknown_error".to_string());
        if PERMANENT_API_ERRORS.contains(&error.as_str()) {
            Err(HandlerError::permanent(format!("slack: {error}")))
        } else {
            Err(HandlerError::transient(format!("slack: {error}")))
        }
    }
}

pub struct SlackHandler {
    client: Arc<SlackClient>,
}

impl SlackHandler {
    pub fn new(client: Arc<SlackClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntegrationHandler for SlackHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Slack
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::Slack(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let channel = require(&config.channel_id, "channelId")?;
        let token = require(&config.access_token, "accessToken")?;
        self.client
            .post_message(token, channel, &job.formatted_message)
            .await
    }
}
