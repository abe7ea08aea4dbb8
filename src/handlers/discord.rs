use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{check_status, config_mismatch, require, send_error, truncate, IntegrationHandler};
use crate::error::HandlerError;
use crate::format::field_text;
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

const PERMANENT: [StatusCode; 3] = [
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
];

// Discord embed limits.
const MAX_FIELDS: usize = 25;
const MAX_FIELD_NAME: usize = 256;
const MAX_FIELD_VALUE: usize = 1024;
const EMBED_COLOR: u32 = 0x5865F2;

/// Executes a Discord webhook with one rich embed per submission.
pub struct DiscordHandler {
    client: reqwest::Client,
}

impl DiscordHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Embed payload: title, one field per submitted key, footer, timestamp.
pub(crate) fn embed_payload(job: &IntegrationJob) -> Value {
    let fields: Vec<Value> = job
        .form_data
        .iter()
        .take(MAX_FIELDS)
        .map(|(name, value)| {
            let text = field_text(value);
            let text = if text.trim().is_empty() { "-".to_string() } else { text };
            json!({
                "name": truncate(name, MAX_FIELD_NAME),
                "value": truncate(&text, MAX_FIELD_VALUE),
                "inline": false,
            })
        })
        .collect();

    json!({
        "embeds": [{
            "title": format!("New Submission: {}", job.form_name),
            "color": EMBED_COLOR,
            "fields": fields,
            "footer": { "text": format!("Submission #{} · Form #{}", job.submission_id, job.form_id) },
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }]
    })
}

#[async_trait]
impl IntegrationHandler for DiscordHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Discord
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::Discord(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let url = require(&config.webhook_url, "webhookUrl")?;

        let response = self
            .client
            .post(url)
            .json(&embed_payload(job))
            .send()
            .await
            .map_err(|e| send_error("discord", e.without_url()))?;

        check_status("discord", response, &PERMANENT).await?;
        Ok(())
    }
}
