use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::queue::RetrySchedule;
use crate::types::{IntegrationType, RetryPolicy};

/// Dispatcher settings.
///
/// Every field has a default, so a config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How often an idle queue loop looks for due retries.
    pub poll_interval_ms: u64,
    /// Jobs of one queue handled at the same time.
    pub queue_concurrency: usize,
    /// Upper bound for one handler invocation.
    pub handler_timeout_secs: u64,
    /// In-flight jobs older than this are assumed orphaned and retried.
    pub active_timeout_secs: u64,
    /// Finished jobs are deleted once they are older than this.
    pub finished_retention_secs: u64,
    pub retry_max_secs: u64,
    pub retry_jitter_ms: u64,
    /// Buffered delivery reports per subscriber.
    pub report_capacity: usize,
    pub policies: RetryPolicies,
    pub channels: ChannelSettings,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            queue_concurrency: 5,
            handler_timeout_secs: 60,
            active_timeout_secs: 15 * 60,
            finished_retention_secs: 7 * 24 * 60 * 60,
            retry_max_secs: 60 * 60,
            retry_jitter_ms: 500,
            report_capacity: 1_024,
            policies: RetryPolicies::default(),
            channels: ChannelSettings::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_env();
        Ok(config)
    }

    /// Override channel credentials from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(token) = var("TELEGRAM_BOT_TOKEN") {
            self.channels.telegram_bot_token = Some(token);
        }

        if let Some(host) = var("SMTP_HOST") {
            let smtp = self.channels.smtp.get_or_insert_with(SmtpSettings::default);
            smtp.host = host;
        }
        if let Some(smtp) = self.channels.smtp.as_mut() {
            if let Some(port) = var("SMTP_PORT").and_then(|p| p.parse().ok()) {
                smtp.port = port;
            }
            if let Some(secure) = var("SMTP_SECURE") {
                smtp.secure = Some(matches!(secure.as_str(), "1" | "true" | "yes"));
            }
            if let Some(user) = var("SMTP_USER") {
                smtp.username = Some(user);
            }
            if let Some(pass) = var("SMTP_PASS") {
                smtp.password = Some(pass);
            }
            if let Some(from) = var("SMTP_FROM") {
                smtp.from = Some(from);
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs.max(1))
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_secs(self.active_timeout_secs)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_secs)
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule {
            max_delay_secs: self.retry_max_secs,
            jitter_ms: self.retry_jitter_ms,
        }
    }
}

/// Default retry policies by channel class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub email: RetryPolicy,
    /// Webhook, chat and social channels.
    pub messaging: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            email: RetryPolicy::EMAIL,
            messaging: RetryPolicy::MESSAGING,
        }
    }
}

impl RetryPolicies {
    pub fn for_integration(&self, kind: IntegrationType) -> RetryPolicy {
        if kind.is_email() {
            self.email
        } else {
            self.messaging
        }
    }
}

/// Process-wide channel clients and endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Per-call HTTP timeout.
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub slack_api_base: String,
    pub whatsapp_api_base: String,
    pub sendgrid_api_base: String,
    pub resend_api_base: String,
    /// Token endpoint used to refresh XOAUTH2 access tokens.
    pub oauth_token_url: String,
    /// Default transport for SMTP integrations without their own host.
    pub smtp: Option<SmtpSettings>,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            http_timeout_secs: 10,
            user_agent: concat!("form-dispatch/", env!("CARGO_PKG_VERSION")).to_string(),
            telegram_bot_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            slack_api_base: "https://slack.com/api".to_string(),
            whatsapp_api_base: "https://graph.facebook.com/v21.0".to_string(),
            sendgrid_api_base: "https://api.sendgrid.com/v3".to_string(),
            resend_api_base: "https://api.resend.com".to_string(),
            oauth_token_url: "https://oauth2.googleapis.com/token".to_string(),
            smtp: None,
        }
    }
}

impl ChannelSettings {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    /// Implicit TLS; `None` picks it from the port (465).
    pub secure: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            secure: None,
            username: None,
            password: None,
            from: None,
        }
    }
}
