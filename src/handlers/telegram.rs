use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;

use super::{check_status, config_mismatch, require, send_error, truncate, IntegrationHandler};
use crate::config::ChannelSettings;
use crate::error::HandlerError;
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

const PERMANENT: [StatusCode; 3] = [
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
];

/// Longest text `sendMessage` accepts.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Bot API client, built once per process and shared by every job.
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: Option<String>,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, settings: &ChannelSettings) -> Self {
        Self {
            http,
            api_base: settings.telegram_api_base.trim_end_matches('/').to_string(),
            bot_token: settings.telegram_bot_token.clone(),
        }
    }

    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), HandlerError> {
        let token = require(&self.bot_token, "telegram bot token")?;
        let url = format!("{}/bot{token}/sendMessage", self.api_base);
        let text = truncate(text, MAX_MESSAGE_CHARS);

        let response = self
            .http
            .post(url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| send_error("telegram", e.without_url()))?;

        check_status("telegram", response, &PERMANENT).await?;
        Ok(())
    }
}

pub struct TelegramHandler {
    client: Arc<TelegramClient>,
}

impl TelegramHandler {
    pub fn new(client: Arc<TelegramClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntegrationHandler for TelegramHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Telegram
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::Telegram(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let chat_id = require(&config.chat_id, "chatId")?;
        self.client
            .send_message(chat_id, &job.formatted_message)
            .await
    }
}
