//! Durable named job queues with per-job retry policy, expiry and
//! duplicate suppression.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};

use crate::error::{DispatchError, HandlerError, StoreError};
use crate::storage::{InsertOutcome, QueueStore, StaleAttempt};
use crate::types::{add_millis, EnqueueOptions, JobId, JobState, QueueCounts, QueuedJob, RetryPolicy};

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str, queue: &str) {
    metrics::increment_counter!(name, "queue" => queue.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str, _queue: &str) {}

/// Process-wide bounds applied on top of each job's [`RetryPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Upper bound for a single backoff delay.
    pub max_delay_secs: u64,
    /// Random extra delay in `0..=jitter_ms`.
    pub jitter_ms: u64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_delay_secs: 60 * 60,
            jitter_ms: 500,
        }
    }
}

impl RetrySchedule {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, policy: &RetryPolicy, retry: u32) -> Duration {
        let base = policy.retry_delay_secs;
        let max = self.max_delay_secs.max(base);
        let secs = if policy.retry_backoff {
            let pow = 2u64.saturating_pow(retry.saturating_sub(1));
            base.saturating_mul(pow).min(max)
        } else {
            base.min(max)
        };
        Duration::from_secs(secs).saturating_add(jitter_delay(self.jitter_ms))
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Failure recorded for an attempt whose worker vanished.
pub(crate) fn abandoned_error() -> HandlerError {
    HandlerError::transient("attempt abandoned: worker did not report back")
}

/// Apply one failed attempt to an in-flight job.
///
/// Permanent failures and exhausted budgets finish the job; otherwise the
/// job is rescheduled, or expired when the next run would fall past its
/// expiry.
pub(crate) fn apply_failure(
    job: &mut QueuedJob,
    error: &HandlerError,
    now: DateTime<Utc>,
    schedule: &RetrySchedule,
) {
    job.last_error = Some(error.message().to_string());

    if error.is_permanent() || job.retry_count >= job.policy.retry_limit {
        job.state = JobState::Exhausted;
        job.completed_at = Some(now);
        return;
    }

    let delay = schedule.delay_for(&job.policy, job.retry_count + 1);
    let retry_at = add_millis(now, u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
    if retry_at >= job.expire_at {
        job.state = JobState::Expired;
        job.completed_at = Some(now);
        return;
    }

    job.retry_count += 1;
    job.state = JobState::RetryScheduled;
    job.start_after = retry_at;
}

/// Result of [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Created(JobId),
    /// Suppressed by the singleton key; `existing` is still unfinished.
    Duplicate { existing: JobId },
}

impl Enqueued {
    pub fn job_id(&self) -> JobId {
        match self {
            Enqueued::Created(id) => *id,
            Enqueued::Duplicate { existing } => *existing,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Enqueued::Duplicate { .. })
    }
}

/// Named multi-queue job store.
///
/// Wraps a [`QueueStore`] with queue declaration caching, retry scheduling
/// and wake-ups for idle consumers.
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    schedule: RetrySchedule,
    declared: RwLock<HashSet<String>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>, schedule: RetrySchedule) -> Self {
        Self {
            store,
            schedule,
            declared: RwLock::new(HashSet::new()),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn schedule(&self) -> &RetrySchedule {
        &self.schedule
    }

    /// Woken whenever a job is enqueued.
    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Declare a queue. Idempotent.
    pub async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
        if self.declared.read().await.contains(name) {
            return Ok(());
        }
        self.store.create_queue(name).await?;
        self.declared.write().await.insert(name.to_string());
        Ok(())
    }

    async fn is_declared(&self, name: &str) -> Result<bool, StoreError> {
        if self.declared.read().await.contains(name) {
            return Ok(true);
        }
        let exists = self.store.queue_exists(name).await?;
        if exists {
            self.declared.write().await.insert(name.to_string());
        }
        Ok(exists)
    }

    pub async fn enqueue<T: Serialize>(
        &self,
        queue: &str,
        payload: &T,
        options: &EnqueueOptions,
    ) -> Result<Enqueued, DispatchError> {
        if !self.is_declared(queue).await? {
            return Err(StoreError::UnknownQueue(queue.to_string()).into());
        }

        let payload = serde_json::to_value(payload)?;
        let job = QueuedJob::new(queue, payload, options, Utc::now());
        match self.store.insert(job).await? {
            InsertOutcome::Inserted(id) => {
                metric_inc("integration.enqueued", queue);
                self.notify.notify_waiters();
                Ok(Enqueued::Created(id))
            }
            InsertOutcome::Duplicate { existing } => {
                metric_inc("integration.enqueue.duplicate", queue);
                Ok(Enqueued::Duplicate { existing })
            }
        }
    }

    /// Claim the next due job of `queue`. Overdue jobs are never claimed;
    /// [`JobQueue::expire_due`] moves them to `Expired`.
    pub async fn fetch(&self, queue: &str) -> Result<Option<QueuedJob>, StoreError> {
        self.store.claim_next(queue, Utc::now()).await
    }

    /// Abandon waiting jobs of `queue` whose expiry has passed.
    pub async fn expire_due(&self, queue: &str) -> Result<Vec<QueuedJob>, StoreError> {
        let expired = self.store.expire_due(queue, Utc::now()).await?;
        if !expired.is_empty() {
            tracing::warn!(queue, expired = expired.len(), "abandoned expired jobs");
        }
        Ok(expired)
    }

    pub async fn complete(&self, id: JobId) -> Result<bool, StoreError> {
        self.store.complete(id, Utc::now()).await
    }

    /// Record a failed attempt; the returned job carries the new state.
    pub async fn fail(
        &self,
        id: JobId,
        error: &HandlerError,
    ) -> Result<Option<QueuedJob>, StoreError> {
        self.store.fail(id, error, Utc::now(), &self.schedule).await
    }

    /// Requeue attempts whose worker vanished more than `active_timeout` ago.
    pub async fn recover_stale(
        &self,
        queue: &str,
        active_timeout: Duration,
    ) -> Result<Vec<StaleAttempt>, StoreError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(active_timeout).unwrap_or(chrono::Duration::MAX);
        let Some(started_before) = now.checked_sub_signed(timeout) else {
            return Ok(Vec::new());
        };
        self.store
            .fail_stale(queue, started_before, now, &self.schedule)
            .await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
        self.store.job(id).await
    }

    pub async fn queue_counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        self.store.counts(queue).await
    }

    pub async fn purge(&self, queue: &str) -> Result<u64, StoreError> {
        self.store.purge(queue).await
    }

    /// Delete jobs of `queue` that finished more than `retention` ago.
    pub async fn prune(&self, queue: &str, retention: Duration) -> Result<u64, StoreError> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(finished_before) = now.checked_sub_signed(retention) else {
            return Ok(0);
        };
        self.store.prune(queue, finished_before).await
    }
}
