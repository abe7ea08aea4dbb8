use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

use crate::error::{HandlerError, StoreError};
use crate::queue::{abandoned_error, apply_failure, RetrySchedule};
use crate::types::{JobId, JobState, QueueCounts, QueuedJob};

/// Result of inserting a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(JobId),
    /// An unfinished job with the same singleton key already exists.
    Duplicate { existing: JobId },
}

/// An in-flight attempt whose worker never reported back.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleAttempt {
    /// The job as it was claimed.
    pub claimed: QueuedJob,
    /// The job after the retry policy was applied.
    pub updated: QueuedJob,
}

/// Persistent job store behind [`crate::JobQueue`].
///
/// Every state transition is atomic for a single job id: two workers can
/// never both claim the same job, and failure bookkeeping never
/// double-counts an attempt.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Declare a queue. Declaring an existing queue is a no-op.
    async fn create_queue(&self, name: &str) -> Result<(), StoreError>;

    async fn queue_exists(&self, name: &str) -> Result<bool, StoreError>;

    async fn insert(&self, job: QueuedJob) -> Result<InsertOutcome, StoreError>;

    /// Move the oldest due, unexpired job of `queue` to `InFlight`.
    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError>;

    /// Mark an in-flight job completed. Returns `false` if it was not in flight.
    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record a failed attempt and apply the job's retry policy.
    ///
    /// Returns the updated job, or `None` if it was not in flight.
    async fn fail(
        &self,
        id: JobId,
        error: &HandlerError,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Option<QueuedJob>, StoreError>;

    /// Abandon waiting jobs whose expiry has passed. Returns them.
    async fn expire_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>, StoreError>;

    /// Fail in-flight jobs started before `started_before` (their worker is
    /// gone) as transient, so they re-enter the retry schedule.
    async fn fail_stale(
        &self,
        queue: &str,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Vec<StaleAttempt>, StoreError>;

    async fn job(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError>;

    /// Drop every unfinished job of `queue`. Returns how many.
    async fn purge(&self, queue: &str) -> Result<u64, StoreError>;

    /// Delete finished jobs of `queue` that finished before `finished_before`.
    async fn prune(&self, queue: &str, finished_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory store for single-process deployments and tests.
///
/// Finished jobs are kept for inspection up to `finished_capacity`, oldest
/// dropped first.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    finished_capacity: usize,
}

#[derive(Default)]
struct MemoryState {
    queues: HashSet<String>,
    jobs: HashMap<JobId, QueuedJob>,
    finished: VecDeque<JobId>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_finished_capacity(10_000)
    }

    pub fn with_finished_capacity(finished_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            finished_capacity,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryState {
    fn mark_finished(&mut self, id: JobId, capacity: usize) {
        self.finished.push_back(id);
        while self.finished.len() > capacity {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn create_queue(&self, name: &str) -> Result<(), StoreError> {
        self.state.lock().await.queues.insert(name.to_string());
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.queues.contains(name))
    }

    async fn insert(&self, job: QueuedJob) -> Result<InsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if !state.queues.contains(&job.queue) {
            return Err(StoreError::UnknownQueue(job.queue));
        }

        if let Some(key) = job.singleton_key.as_deref() {
            let existing = state.jobs.values().find(|other| {
                other.queue == job.queue
                    && !other.state.is_finished()
                    && other.singleton_key.as_deref() == Some(key)
            });
            if let Some(existing) = existing {
                return Ok(InsertOutcome::Duplicate {
                    existing: existing.id,
                });
            }
        }

        let id = job.id;
        state.jobs.insert(id, job);
        Ok(InsertOutcome::Inserted(id))
    }

    async fn claim_next(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let mut state = self.state.lock().await;
        let next = state
            .jobs
            .values()
            .filter(|job| {
                job.queue == queue
                    && job.state.is_waiting()
                    && job.start_after <= now
                    && job.expire_at > now
            })
            .min_by_key(|job| (job.start_after, job.created_at))
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::InFlight;
        job.started_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.state != JobState::InFlight {
            return Ok(false);
        }
        job.state = JobState::Completed;
        job.completed_at = Some(now);
        job.last_error = None;
        state.mark_finished(id, self.finished_capacity);
        Ok(true)
    }

    async fn fail(
        &self,
        id: JobId,
        error: &HandlerError,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Option<QueuedJob>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.state != JobState::InFlight {
            return Ok(None);
        }
        apply_failure(job, error, now, schedule);
        let updated = job.clone();
        if updated.state.is_finished() {
            state.mark_finished(id, self.finished_capacity);
        }
        Ok(Some(updated))
    }

    async fn expire_due(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>, StoreError> {
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for job in state.jobs.values_mut() {
            if job.queue == queue && job.state.is_waiting() && job.expire_at <= now {
                job.state = JobState::Expired;
                job.completed_at = Some(now);
                expired.push(job.clone());
            }
        }
        for job in &expired {
            state.mark_finished(job.id, self.finished_capacity);
        }
        Ok(expired)
    }

    async fn fail_stale(
        &self,
        queue: &str,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
        schedule: &RetrySchedule,
    ) -> Result<Vec<StaleAttempt>, StoreError> {
        let mut state = self.state.lock().await;
        let error = abandoned_error();
        let mut failed = Vec::new();
        for job in state.jobs.values_mut() {
            let stale = job.queue == queue
                && job.state == JobState::InFlight
                && job.started_at.is_some_and(|at| at < started_before);
            if stale {
                let claimed = job.clone();
                apply_failure(job, &error, now, schedule);
                failed.push(StaleAttempt {
                    claimed,
                    updated: job.clone(),
                });
            }
        }
        for attempt in &failed {
            if attempt.updated.state.is_finished() {
                state.mark_finished(attempt.updated.id, self.finished_capacity);
            }
        }
        Ok(failed)
    }

    async fn job(&self, id: JobId) -> Result<Option<QueuedJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values().filter(|job| job.queue == queue) {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn purge(&self, queue: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| job.queue != queue || job.state.is_finished());
        Ok((before - state.jobs.len()) as u64)
    }

    async fn prune(&self, queue: &str, finished_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            job.queue != queue
                || !job.state.is_finished()
                || job.completed_at.map_or(true, |at| at >= finished_before)
        });
        let jobs = &state.jobs;
        let kept: VecDeque<JobId> = state
            .finished
            .iter()
            .copied()
            .filter(|id| jobs.contains_key(id))
            .collect();
        state.finished = kept;
        Ok((before - state.jobs.len()) as u64)
    }
}
