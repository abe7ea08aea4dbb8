use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Raw submitted field data, keyed by field name in submission order.
pub type FormData = Map<String, Value>;

/// Identifier of a form submission.
///
/// Strongly-typed wrapper to avoid mixing submission ids with form or
/// organization ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub i64);

/// Identifier of a form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormId(pub i64);

/// Identifier of an organization (tenant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub i64);

/// Identifier of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }
        )*
    };
}

display_inner!(SubmissionId, FormId, OrganizationId, JobId);

/// Notification channel kinds. Each kind has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegrationType {
    #[serde(rename = "webhook")]
    Webhook,
    #[serde(rename = "email-smtp")]
    EmailSmtp,
    #[serde(rename = "email-oauth")]
    EmailOauth,
    #[serde(rename = "email-api")]
    EmailApi,
    #[serde(rename = "telegram")]
    Telegram,
    #[serde(rename = "discord")]
    Discord,
    #[serde(rename = "slack")]
    Slack,
    #[serde(rename = "whatsapp")]
    Whatsapp,
}

impl IntegrationType {
    pub const ALL: [IntegrationType; 8] = [
        IntegrationType::Webhook,
        IntegrationType::EmailSmtp,
        IntegrationType::EmailOauth,
        IntegrationType::EmailApi,
        IntegrationType::Telegram,
        IntegrationType::Discord,
        IntegrationType::Slack,
        IntegrationType::Whatsapp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::Webhook => "webhook",
            IntegrationType::EmailSmtp => "email-smtp",
            IntegrationType::EmailOauth => "email-oauth",
            IntegrationType::EmailApi => "email-api",
            IntegrationType::Telegram => "telegram",
            IntegrationType::Discord => "discord",
            IntegrationType::Slack => "slack",
            IntegrationType::Whatsapp => "whatsapp",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn is_email(&self) -> bool {
        matches!(
            self,
            IntegrationType::EmailSmtp | IntegrationType::EmailOauth | IntegrationType::EmailApi
        )
    }

    /// Name of the delivery queue for this kind, e.g. `integration-slack`.
    pub fn queue_name(&self) -> String {
        format!("integration-{}", self.as_str())
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrationScope {
    Organization,
    Form,
}

/// One configured channel as stored by the dashboard.
///
/// `config` is the untyped bag the dashboard writes; the resolver turns it
/// into an [`IntegrationConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub form_id: Option<FormId>,
    pub scope: IntegrationScope,
    #[serde(rename = "type")]
    pub kind: IntegrationType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl IntegrationRecord {
    /// Organization-wide record.
    pub fn organization(
        organization_id: OrganizationId,
        kind: IntegrationType,
        config: Value,
    ) -> Self {
        Self {
            id: None,
            organization_id,
            form_id: None,
            scope: IntegrationScope::Organization,
            kind,
            name: kind.as_str().to_string(),
            config,
            is_active: true,
        }
    }

    /// Record attached to a single form.
    pub fn form(
        organization_id: OrganizationId,
        form_id: FormId,
        kind: IntegrationType,
        config: Value,
    ) -> Self {
        Self {
            id: None,
            organization_id,
            form_id: Some(form_id),
            scope: IntegrationScope::Form,
            kind,
            name: kind.as_str().to_string(),
            config,
            is_active: true,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Channel configuration, one variant per integration type.
///
/// Fields the dashboard left empty are `None`; handlers reject missing
/// required fields before doing any I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum IntegrationConfig {
    #[serde(rename = "webhook")]
    Webhook(WebhookConfig),
    #[serde(rename = "email-smtp")]
    EmailSmtp(SmtpEmailConfig),
    #[serde(rename = "email-oauth")]
    EmailOauth(OauthEmailConfig),
    #[serde(rename = "email-api")]
    EmailApi(ApiEmailConfig),
    #[serde(rename = "telegram")]
    Telegram(TelegramConfig),
    #[serde(rename = "discord")]
    Discord(DiscordConfig),
    #[serde(rename = "slack")]
    Slack(SlackConfig),
    #[serde(rename = "whatsapp")]
    Whatsapp(WhatsappConfig),
}

impl IntegrationConfig {
    pub fn kind(&self) -> IntegrationType {
        match self {
            IntegrationConfig::Webhook(_) => IntegrationType::Webhook,
            IntegrationConfig::EmailSmtp(_) => IntegrationType::EmailSmtp,
            IntegrationConfig::EmailOauth(_) => IntegrationType::EmailOauth,
            IntegrationConfig::EmailApi(_) => IntegrationType::EmailApi,
            IntegrationConfig::Telegram(_) => IntegrationType::Telegram,
            IntegrationConfig::Discord(_) => IntegrationType::Discord,
            IntegrationConfig::Slack(_) => IntegrationType::Slack,
            IntegrationConfig::Whatsapp(_) => IntegrationType::Whatsapp,
        }
    }
}

/// Ordered key/value template pairs.
pub type TemplatePairs = Vec<(String, String)>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: TemplatePairs,
    pub query_params: TemplatePairs,
    pub body_params: TemplatePairs,
    pub cookies: TemplatePairs,
    /// HMAC secret; when set the request carries signature headers.
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmtpEmailConfig {
    pub recipients: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secure: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OauthEmailConfig {
    pub recipients: Vec<String>,
    /// Mailbox the OAuth2 grant belongs to.
    pub user: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiEmailConfig {
    pub recipients: Vec<String>,
    pub provider: Option<String>,
    pub api_token: Option<String>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    pub channel_id: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhatsappConfig {
    pub phone_number_id: Option<String>,
    pub access_token: Option<String>,
    pub recipient: Option<String>,
}

/// Submission facts the caller hands to the enqueue step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionContext {
    pub submission_id: SubmissionId,
    pub form_id: FormId,
    pub organization_id: OrganizationId,
    pub form_name: String,
    pub form_data: FormData,
    /// Shared by every job of this submission; generated when absent.
    pub correlation_id: Option<String>,
    /// Upstream request idempotency key; used to build singleton keys.
    pub idempotency_key: Option<String>,
}

impl SubmissionContext {
    pub fn new(
        submission_id: SubmissionId,
        form_id: FormId,
        organization_id: OrganizationId,
        form_name: impl Into<String>,
        form_data: FormData,
    ) -> Self {
        Self {
            submission_id,
            form_id,
            organization_id,
            form_name: form_name.into(),
            form_data,
            correlation_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// One unit of delivery work for a (submission, integration) pair.
///
/// Self-sufficient: handlers never look anything else up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationJob {
    pub submission_id: SubmissionId,
    pub form_id: FormId,
    pub organization_id: OrganizationId,
    pub integration_type: IntegrationType,
    pub correlation_id: String,
    pub form_data: FormData,
    pub formatted_message: String,
    pub form_name: String,
    pub config: IntegrationConfig,
}

/// Retry and expiry settings attached to every queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub retry_limit: u32,
    pub retry_delay_secs: u64,
    /// Exponential (`true`) or fixed delay.
    pub retry_backoff: bool,
    /// Job is abandoned this long after it was first enqueued.
    pub expire_in_secs: u64,
}

impl RetryPolicy {
    /// Email providers mostly fail on rate limits; wait them out longer.
    pub const EMAIL: RetryPolicy = RetryPolicy {
        retry_limit: 5,
        retry_delay_secs: 10,
        retry_backoff: true,
        expire_in_secs: 60 * 60,
    };

    pub const MESSAGING: RetryPolicy = RetryPolicy {
        retry_limit: 3,
        retry_delay_secs: 5,
        retry_backoff: true,
        expire_in_secs: 30 * 60,
    };
}

/// Options for [`crate::JobQueue::enqueue`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub policy: RetryPolicy,
    /// At most one unfinished job per key and queue.
    pub singleton_key: Option<String>,
}

impl EnqueueOptions {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            singleton_key: None,
        }
    }

    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::new(RetryPolicy::MESSAGING)
    }
}

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InFlight,
    RetryScheduled,
    Completed,
    Exhausted,
    Expired,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InFlight => "in_flight",
            JobState::RetryScheduled => "retry_scheduled",
            JobState::Completed => "completed",
            JobState::Exhausted => "exhausted",
            JobState::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            JobState::Pending,
            JobState::InFlight,
            JobState::RetryScheduled,
            JobState::Completed,
            JobState::Exhausted,
            JobState::Expired,
        ]
        .into_iter()
        .find(|state| state.as_str() == value)
    }

    /// Waiting for a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::RetryScheduled)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Exhausted | JobState::Expired
        )
    }
}

/// A job as held by the delivery queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    pub payload: Value,
    pub state: JobState,
    /// Retries consumed so far; the attempt number is `retry_count + 1`.
    pub retry_count: u32,
    pub policy: RetryPolicy,
    pub singleton_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl QueuedJob {
    pub fn new(
        queue: impl Into<String>,
        payload: Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            state: JobState::Pending,
            retry_count: 0,
            policy: options.policy,
            singleton_key: options.singleton_key.clone(),
            created_at: now,
            start_after: now,
            expire_at: add_secs(now, options.policy.expire_in_secs),
            started_at: None,
            completed_at: None,
            last_error: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// `at + secs`, saturating at the latest representable instant.
pub(crate) fn add_secs(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    add_millis(at, secs.saturating_mul(1_000))
}

pub(crate) fn add_millis(at: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub retry_scheduled: u64,
    pub completed: u64,
    pub exhausted: u64,
    pub expired: u64,
}

impl QueueCounts {
    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::InFlight => self.in_flight += n,
            JobState::RetryScheduled => self.retry_scheduled += n,
            JobState::Completed => self.completed += n,
            JobState::Exhausted => self.exhausted += n,
            JobState::Expired => self.expired += n,
        }
    }
}
