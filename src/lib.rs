//! Integration dispatch pipeline for form submissions.
//!
//! For each accepted submission this crate decides which notification
//! channels fire, in what configuration, and delivers each notification
//! through a durable per-channel queue with retry, backoff and
//! permanent-vs-transient failure classification.
//!
//! ## Flow
//! 1. [`resolve`] merges organization and form integration records
//!    (legacy single-row configs go through [`normalize_legacy_config`]).
//! 2. [`Dispatcher::enqueue_integration_deliveries`] formats the message
//!    and enqueues one [`IntegrationJob`] per integration onto
//!    `integration-<type>`.
//! 3. One consume loop per queue hands jobs to the matching
//!    [`IntegrationHandler`] and reports every attempt as a
//!    [`DeliveryReport`].
//!
//! ## Guarantees
//! - At-least-once delivery; handlers tolerate repeats
//! - A permanently failing job is never attempted again
//! - A transiently failing job runs at most `retry_limit + 1` times and
//!   never past its expiry
//! - Channels are isolated from each other
//!
//! ## Non-Guarantees
//! - Exactly-once delivery to third parties
//! - Ordering across submissions or integrations

mod config;
mod dispatcher;
mod error;
mod format;
pub mod handlers;
mod queue;
mod resolver;
mod signing;
mod storage;
mod template;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use config::{ChannelSettings, DispatcherConfig, RetryPolicies, SmtpSettings};
pub use dispatcher::{enqueue_integration_deliveries, DeliveryReport, Dispatcher, EnqueuedDelivery};
pub use error::{ConfigError, DeliveryOutcome, DispatchError, HandlerError, StoreError};
pub use format::{field_text, format_submission_message};
pub use handlers::{HandlerRegistry, IntegrationHandler};
pub use queue::{Enqueued, JobQueue, RetrySchedule};
pub use resolver::{
    normalize_legacy_config, normalize_recipients, normalize_record, parse_config, resolve,
    EffectiveIntegrationSet, LegacyIntegrationConfig, ResolvedIntegration,
};
pub use signing::{
    build_signature_headers, compute_signature, is_timestamp_fresh, verify_signature,
    verify_webhook_request, SignatureHeaders, VerificationError, SIGNATURE_HEADER,
    TIMESTAMP_HEADER,
};
pub use storage::{InMemoryStore, InsertOutcome, QueueStore, StaleAttempt};
pub use template::{
    build_body, build_cookie_header, build_pairs, default_body, interpolate, method_allows_body,
    parse_method, render_request, resolve_value, RenderedRequest, TemplateContext,
};
pub use types::{
    ApiEmailConfig, DiscordConfig, EnqueueOptions, FormData, FormId, IntegrationConfig,
    IntegrationJob, IntegrationRecord, IntegrationScope, IntegrationType, JobId, JobState,
    OauthEmailConfig, OrganizationId, QueueCounts, QueuedJob, RetryPolicy, SlackConfig,
    SmtpEmailConfig, SubmissionContext, SubmissionId, TelegramConfig, TemplatePairs,
    WebhookConfig, WhatsappConfig,
};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
