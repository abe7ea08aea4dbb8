use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::Error as SmtpError;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{check_status, config_mismatch, require, send_error, IntegrationHandler};
use crate::config::{ChannelSettings, SmtpSettings};
use crate::error::HandlerError;
use crate::types::{IntegrationConfig, IntegrationJob, IntegrationType};

const DEFAULT_OAUTH_HOST: &str = "smtp.gmail.com";
const IMPLICIT_TLS_PORT: u16 = 465;
const SUBMISSION_PORT: u16 = 587;

const API_PERMANENT: [StatusCode; 2] = [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN];

pub(crate) fn email_subject(form_name: &str) -> String {
    format!("New submission: {form_name}")
}

fn require_recipients(recipients: &[String]) -> Result<&[String], HandlerError> {
    if recipients.is_empty() {
        return Err(HandlerError::config("recipients"));
    }
    Ok(recipients)
}

fn mailbox(address: &str) -> Result<Mailbox, HandlerError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| HandlerError::permanent(format!("email: invalid address {address}: {e}")))
}

fn build_message(
    from: &str,
    recipients: &[String],
    job: &IntegrationJob,
) -> Result<Message, HandlerError> {
    let mut builder = Message::builder()
        .from(mailbox(from)?)
        .subject(email_subject(&job.form_name));
    for recipient in recipients {
        builder = builder.to(mailbox(recipient)?);
    }
    builder
        .header(ContentType::TEXT_PLAIN)
        .body(job.formatted_message.clone())
        .map_err(|e| HandlerError::permanent(format!("email: cannot build message: {e}")))
}

/// Connection parameters for one SMTP send.
struct SmtpTarget<'a> {
    host: &'a str,
    port: Option<u16>,
    secure: Option<bool>,
    credentials: Option<Credentials>,
    mechanisms: Option<Vec<Mechanism>>,
}

impl SmtpTarget<'_> {
    fn transport(
        self,
        timeout: Duration,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, HandlerError> {
        let implicit_tls = self
            .secure
            .unwrap_or(self.port == Some(IMPLICIT_TLS_PORT));
        let port = self.port.unwrap_or(if implicit_tls {
            IMPLICIT_TLS_PORT
        } else {
            SUBMISSION_PORT
        });

        let builder = if implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(self.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(self.host)
        }
        .map_err(|e| HandlerError::permanent(format!("smtp: invalid host {}: {e}", self.host)))?;

        let mut builder = builder.port(port).timeout(Some(timeout));
        if let Some(credentials) = self.credentials {
            builder = builder.credentials(credentials);
        }
        if let Some(mechanisms) = self.mechanisms {
            builder = builder.authentication(mechanisms);
        }
        Ok(builder.build())
    }
}

/// SMTP reply codes for rejected or required authentication.
const AUTH_CODES: [&str; 3] = ["530", "534", "535"];

pub(crate) fn is_auth_failure(code: Option<&str>, message: &str) -> bool {
    code.is_some_and(|c| AUTH_CODES.contains(&c))
        || message.to_ascii_lowercase().contains("authentication")
}

fn smtp_auth_failed(err: &SmtpError) -> bool {
    let code = err.status().map(|code| code.to_string());
    is_auth_failure(code.as_deref(), &err.to_string())
}

/// Only authentication failures are permanent.
fn classify_smtp(err: &SmtpError) -> HandlerError {
    let message = format!("smtp: {err}");
    if smtp_auth_failed(err) {
        HandlerError::permanent(message)
    } else {
        HandlerError::transient(message)
    }
}

/// Plain SMTP with per-integration or process-wide transport settings.
pub struct SmtpEmailHandler {
    default: Option<SmtpSettings>,
    timeout: Duration,
}

impl SmtpEmailHandler {
    pub fn new(default: Option<SmtpSettings>, timeout: Duration) -> Self {
        Self { default, timeout }
    }
}

#[async_trait]
impl IntegrationHandler for SmtpEmailHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::EmailSmtp
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::EmailSmtp(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let recipients = require_recipients(&config.recipients)?;

        let (target, from) = match (config.host.as_deref(), self.default.as_ref()) {
            (Some(host), _) => {
                let credentials = match (&config.username, &config.password) {
                    (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
                    _ => None,
                };
                let target = SmtpTarget {
                    host,
                    port: config.port,
                    secure: config.secure,
                    credentials,
                    mechanisms: None,
                };
                (target, config.from.as_ref().or(config.username.as_ref()))
            }
            (None, Some(default)) if !default.host.is_empty() => {
                let credentials = match (&default.username, &default.password) {
                    (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
                    _ => None,
                };
                let target = SmtpTarget {
                    host: &default.host,
                    port: Some(default.port),
                    secure: default.secure,
                    credentials,
                    mechanisms: None,
                };
                let from = config
                    .from
                    .as_ref()
                    .or(default.from.as_ref())
                    .or(default.username.as_ref());
                (target, from)
            }
            _ => return Err(HandlerError::config("host")),
        };
        let from = require(&from.cloned(), "from")?.to_string();

        let message = build_message(&from, recipients, job)?;
        let host = target.host.to_string();
        let transport = target.transport(self.timeout)?;

        debug!(host = %host, recipients = recipients.len(), "sending smtp email");
        transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| classify_smtp(&e))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// SMTP with XOAUTH2; refreshes the access token once on auth failure.
pub struct OauthEmailHandler {
    http: reqwest::Client,
    token_url: String,
    timeout: Duration,
}

impl OauthEmailHandler {
    pub fn new(http: reqwest::Client, settings: &ChannelSettings) -> Self {
        Self {
            http,
            token_url: settings.oauth_token_url.clone(),
            timeout: settings.http_timeout(),
        }
    }

    async fn refresh_access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<String, HandlerError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| send_error("oauth", e))?;

        let response = check_status(
            "oauth",
            response,
            &[StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED],
        )
        .await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::transient(format!("oauth: unreadable token response: {e}")))?;
        Ok(token.access_token)
    }

    fn transport(
        &self,
        host: &str,
        port: Option<u16>,
        user: &str,
        access_token: &str,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, HandlerError> {
        SmtpTarget {
            host,
            port,
            secure: None,
            credentials: Some(Credentials::new(user.to_string(), access_token.to_string())),
            mechanisms: Some(vec![Mechanism::Xoauth2]),
        }
        .transport(self.timeout)
    }
}

#[async_trait]
impl IntegrationHandler for OauthEmailHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::EmailOauth
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::EmailOauth(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let recipients = require_recipients(&config.recipients)?;
        let user = require(&config.user, "user")?;
        let client_id = require(&config.client_id, "clientId")?;
        let client_secret = require(&config.client_secret, "clientSecret")?;
        let refresh_token = require(&config.refresh_token, "refreshToken")?;
        let host = config.host.as_deref().unwrap_or(DEFAULT_OAUTH_HOST);
        let from = config.from.as_deref().unwrap_or(user);

        let message = build_message(from, recipients, job)?;

        let stored = config.access_token.as_deref().filter(|t| !t.trim().is_empty());
        let access_token = match stored {
            Some(token) => token.to_string(),
            None => {
                self.refresh_access_token(client_id, client_secret, refresh_token)
                    .await?
            }
        };

        let transport = self.transport(host, config.port, user, &access_token)?;
        match transport.send(message.clone()).await {
            Ok(_) => Ok(()),
            Err(err) if stored.is_some() && smtp_auth_failed(&err) => {
                debug!(user, "xoauth2 rejected, refreshing access token");
                let fresh = self
                    .refresh_access_token(client_id, client_secret, refresh_token)
                    .await?;
                self.transport(host, config.port, user, &fresh)?
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_smtp(&e))
            }
            Err(err) => Err(classify_smtp(&err)),
        }
    }
}

/// Transactional email through a provider HTTP API.
pub struct ApiEmailHandler {
    http: reqwest::Client,
    sendgrid_base: String,
    resend_base: String,
}

impl ApiEmailHandler {
    pub fn new(http: reqwest::Client, settings: &ChannelSettings) -> Self {
        Self {
            http,
            sendgrid_base: settings.sendgrid_api_base.trim_end_matches('/').to_string(),
            resend_base: settings.resend_api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn post(
        &self,
        provider: &str,
        url: String,
        token: &str,
        body: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(provider, e))?;
        check_status(provider, response, &API_PERMANENT).await?;
        Ok(())
    }
}

pub(crate) fn sendgrid_body(
    from: &str,
    recipients: &[String],
    job: &IntegrationJob,
) -> serde_json::Value {
    let to: Vec<_> = recipients.iter().map(|email| json!({ "email": email })).collect();
    json!({
        "personalizations": [{ "to": to }],
        "from": { "email": from },
        "subject": email_subject(&job.form_name),
        "content": [{ "type": "text/plain", "value": job.formatted_message }],
    })
}

pub(crate) fn resend_body(
    from: &str,
    recipients: &[String],
    job: &IntegrationJob,
) -> serde_json::Value {
    json!({
        "from": from,
        "to": recipients,
        "subject": email_subject(&job.form_name),
        "text": job.formatted_message,
    })
}

#[async_trait]
impl IntegrationHandler for ApiEmailHandler {
    fn integration_type(&self) -> IntegrationType {
        IntegrationType::EmailApi
    }

    async fn handle(&self, job: &IntegrationJob) -> Result<(), HandlerError> {
        let IntegrationConfig::EmailApi(config) = &job.config else {
            return Err(config_mismatch(job));
        };
        let provider = require(&config.provider, "provider")?;
        let token = require(&config.api_token, "apiKey")?;

        match provider {
            "sendgrid" | "resend" => {}
            other => {
                warn!(
                    provider = other,
                    submission_id = %job.submission_id,
                    "email provider not supported, skipping delivery"
                );
                return Ok(());
            }
        }

        let recipients = require_recipients(&config.recipients)?;
        let from = require(&config.from, "from")?;

        if provider == "sendgrid" {
            let url = format!("{}/mail/send", self.sendgrid_base);
            self.post("sendgrid", url, token, sendgrid_body(from, recipients, job))
                .await
        } else {
            let url = format!("{}/emails", self.resend_base);
            self.post("resend", url, token, resend_body(from, recipients, job))
                .await
        }
    }
}
