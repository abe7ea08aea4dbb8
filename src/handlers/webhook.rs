use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::StatusCode;

use super::{check_status, config_mismatch, send_error, IntegrationHandler};
use crate::error::HandlerError;
use crate::signing::build_signature_headers;
use crate::template::{render_request, TemplateContext};
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

const PERMANENT: [StatusCode; 4] = [
    StatusCode::BAD_REQUEST,
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
];

/// Sends the templated HTTP request of a webhook integration.
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntegrationHandler for WebhookHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::Webhook
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::Webhook(config) = &job.config else {
            return Err(config_mismatch(job));
        };

        let ctx = TemplateContext::from_job(job);
        let rendered = render_request(config, &ctx)?;

        let body = match &rendered.body {
            Some(body) => serde_json::to_vec(body)
                .map_err(|e| HandlerError::permanent(format!("webhook: body not encodable: {e}")))?,
            None => Vec::new(),
        };

        let mut request = self
            .client
            .request(rendered.method, rendered.url)
            .header("X-Correlation-Id", &job.correlation_id);

        for (name, value) in &rendered.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = &rendered.cookie {
            request = request.header(COOKIE, cookie.as_str());
        }
        if let Some(secret) = config.secret.as_deref().filter(|s| !s.is_empty()) {
            let signed = build_signature_headers(secret, &body);
            request = request
                .header(signed.signature.0, signed.signature.1)
                .header(signed.timestamp.0, signed.timestamp.1);
        }
        if rendered.body.is_some() {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = request.send().await.map_err(|e| send_error("webhook", e))?;
        check_status("webhook", response, &PERMANENT).await?;
        Ok(())
    }
}
