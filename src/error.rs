use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors returned when work cannot be accepted *before* delivery begins.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    #[error("queue store failure: {0}")]
    Store(#[from] StoreError),

    #[error("job payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The shared HTTP client could not be built.
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Failures of the persistent job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Enqueue into a queue that was never declared.
    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    /// A stored row could not be decoded.
    #[error("corrupt job row: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("postgres: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Failure reported by an integration handler.
///
/// The variant decides what the queue does next: a transient failure is
/// retried under the job's policy, a permanent one exhausts the job at once.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Permanent(String),

    #[error("{0}")]
    Transient(String),
}

impl HandlerError {
    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        HandlerError::Transient(message.into())
    }

    /// Missing or unusable channel configuration.
    pub fn config(field: &str) -> Self {
        HandlerError::Permanent(format!("missing required config field: {field}"))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Permanent(message) | HandlerError::Transient(message) => message,
        }
    }
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result of one delivery attempt after the queue applied its policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,

    /// Transient failure; the job runs again at `retry_at`.
    RetryScheduled {
        error: String,
        retry_at: DateTime<Utc>,
    },

    /// No attempts left, or the failure was permanent.
    Exhausted { error: String, permanent: bool },

    /// The job outlived its expiry before it could succeed.
    Expired { error: String },
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }

    /// No further attempt will be made.
    pub fn is_final(&self) -> bool {
        !matches!(self, DeliveryOutcome::RetryScheduled { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::RetryScheduled { .. } => "retry_scheduled",
            DeliveryOutcome::Exhausted { .. } => "exhausted",
            DeliveryOutcome::Expired { .. } => "expired",
        }
    }
}
