use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{DeliveryOutcome, HandlerError};
use crate::queue::{abandoned_error, metric_inc, JobQueue};
use crate::types::{JobState, QueuedJob};

/// Work performed for each claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: &QueuedJob) -> Result<(), HandlerError>;

    /// A failed attempt, before the queue applies the retry policy.
    async fn on_failure(&self, _job: &QueuedJob, _error: &HandlerError) {}

    /// The attempt after the queue recorded it.
    async fn on_outcome(&self, _job: &QueuedJob, _outcome: &DeliveryOutcome) {}
}

/// Settings for one queue's consume loop.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    pub active_timeout: Duration,
    pub finished_retention: Duration,
}

pub(crate) struct Consumer {
    pub queue: Arc<JobQueue>,
    pub name: String,
    pub handler: Arc<dyn JobHandler>,
    pub settings: ConsumerSettings,
    pub is_running: Arc<AtomicBool>,
    pub shutdown: Arc<Notify>,
}

/// Outcome reported for a failed attempt, from the job's new state.
pub(crate) fn failure_outcome(updated: &QueuedJob, error: &HandlerError) -> DeliveryOutcome {
    let message = error.message().to_string();
    match updated.state {
        JobState::RetryScheduled => DeliveryOutcome::RetryScheduled {
            error: message,
            retry_at: updated.start_after,
        },
        JobState::Expired => DeliveryOutcome::Expired { error: message },
        _ => DeliveryOutcome::Exhausted {
            error: message,
            permanent: error.is_permanent(),
        },
    }
}

fn record_metric(queue: &str, outcome: &DeliveryOutcome) {
    let name = match outcome {
        DeliveryOutcome::Delivered => "integration.delivery.success",
        DeliveryOutcome::RetryScheduled { .. } => "integration.delivery.retry_scheduled",
        DeliveryOutcome::Exhausted { .. } => "integration.delivery.exhausted",
        DeliveryOutcome::Expired { .. } => "integration.delivery.expired",
    };
    metric_inc(name, queue);
}

/// Consume loop for one queue.
///
/// Each iteration:
/// - Takes a concurrency permit
/// - Claims the next due job and hands it to a task holding the permit
/// - Sleeps until an enqueue, the poll interval or shutdown when idle
///
/// In-flight tasks are awaited before the loop returns.
pub(crate) async fn consume_loop(consumer: Arc<Consumer>) {
    let semaphore = Arc::new(Semaphore::new(consumer.settings.concurrency.max(1)));
    let wake = consumer.queue.notifier();
    let mut tasks = JoinSet::new();

    // Recovery must never catch attempts this process is still running.
    let active_timeout = consumer
        .settings
        .active_timeout
        .max(consumer.settings.handler_timeout.saturating_mul(2));
    let recovery_interval = (active_timeout / 4).max(consumer.settings.poll_interval);
    let mut next_recovery = Some(Instant::now());

    tracing::debug!(queue = %consumer.name, "consumer started");

    while consumer.is_running.load(Ordering::SeqCst) {
        while tasks.try_join_next().is_some() {}

        if next_recovery.is_some_and(|at| Instant::now() >= at) {
            recover_stale(&consumer, active_timeout).await;
            prune_finished(&consumer).await;
            next_recovery = Instant::now().checked_add(recovery_interval);
        }
        expire_due(&consumer).await;

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        // Register for wake-ups before looking, so an enqueue racing the
        // fetch is not lost.
        let enqueued = wake.notified();
        let stopping = consumer.shutdown.notified();
        tokio::pin!(enqueued, stopping);
        enqueued.as_mut().enable();
        stopping.as_mut().enable();

        if !consumer.is_running.load(Ordering::SeqCst) {
            break;
        }

        match consumer.queue.fetch(&consumer.name).await {
            Ok(Some(job)) => {
                tasks.spawn(process_job(consumer.clone(), job, permit));
                continue;
            }
            Ok(None) => drop(permit),
            Err(err) => {
                tracing::error!(queue = %consumer.name, error = %err, "failed to fetch job");
                drop(permit);
            }
        }

        tokio::select! {
            _ = &mut enqueued => {}
            _ = &mut stopping => {}
            _ = sleep(consumer.settings.poll_interval) => {}
        }
    }

    while tasks.join_next().await.is_some() {}
    tracing::debug!(queue = %consumer.name, "consumer stopped");
}

/// Fail attempts whose worker vanished and report them like any other.
async fn recover_stale(consumer: &Consumer, active_timeout: Duration) {
    let recovered = match consumer
        .queue
        .recover_stale(&consumer.name, active_timeout)
        .await
    {
        Ok(recovered) => recovered,
        Err(err) => {
            tracing::error!(queue = %consumer.name, error = %err, "stale job recovery failed");
            return;
        }
    };

    let error = abandoned_error();
    for attempt in recovered {
        tracing::warn!(
            queue = %consumer.name,
            job_id = %attempt.claimed.id,
            state = attempt.updated.state.as_str(),
            "recovered abandoned in-flight job"
        );
        consumer.handler.on_failure(&attempt.claimed, &error).await;
        let outcome = failure_outcome(&attempt.updated, &error);
        record_metric(&consumer.name, &outcome);
        consumer.handler.on_outcome(&attempt.claimed, &outcome).await;
    }
}

/// Abandon overdue waiting jobs and report each as expired.
async fn expire_due(consumer: &Consumer) {
    let expired = match consumer.queue.expire_due(&consumer.name).await {
        Ok(expired) => expired,
        Err(err) => {
            tracing::error!(queue = %consumer.name, error = %err, "failed to expire jobs");
            return;
        }
    };

    for job in expired {
        let error = job
            .last_error
            .clone()
            .unwrap_or_else(|| "expired before delivery".to_string());
        let outcome = DeliveryOutcome::Expired { error };
        record_metric(&consumer.name, &outcome);
        consumer.handler.on_outcome(&job, &outcome).await;
    }
}

async fn prune_finished(consumer: &Consumer) {
    match consumer
        .queue
        .prune(&consumer.name, consumer.settings.finished_retention)
        .await
    {
        Ok(0) => {}
        Ok(pruned) => tracing::debug!(queue = %consumer.name, pruned, "pruned finished jobs"),
        Err(err) => {
            tracing::error!(queue = %consumer.name, error = %err, "failed to prune finished jobs")
        }
    }
}

/// Run one attempt and record its outcome.
async fn process_job(consumer: Arc<Consumer>, job: QueuedJob, _permit: OwnedSemaphorePermit) {
    let limit = consumer.settings.handler_timeout;
    let result = match timeout(limit, consumer.handler.run(&job)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::transient(format!(
            "handler timed out after {}s",
            limit.as_secs()
        ))),
    };

    let outcome = match result {
        Ok(()) => match consumer.queue.complete(job.id).await {
            Ok(true) => Some(DeliveryOutcome::Delivered),
            Ok(false) => {
                tracing::warn!(queue = %consumer.name, job_id = %job.id, "job was no longer in flight");
                None
            }
            Err(err) => {
                tracing::error!(queue = %consumer.name, job_id = %job.id, error = %err, "failed to complete job");
                None
            }
        },
        Err(error) => {
            consumer.handler.on_failure(&job, &error).await;
            match consumer.queue.fail(job.id, &error).await {
                Ok(Some(updated)) => Some(failure_outcome(&updated, &error)),
                Ok(None) => {
                    tracing::warn!(queue = %consumer.name, job_id = %job.id, "job was no longer in flight");
                    None
                }
                Err(err) => {
                    tracing::error!(queue = %consumer.name, job_id = %job.id, error = %err, "failed to record failed attempt");
                    None
                }
            }
        }
    };

    if let Some(outcome) = outcome {
        record_metric(&consumer.name, &outcome);
        consumer.handler.on_outcome(&job, &outcome).await;
    }
}
