use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{DispatcherConfig, RetryPolicies};
use crate::error::{DeliveryOutcome, DispatchError, HandlerError};
use crate::format::format_submission_message;
use crate::handlers::{HandlerRegistry, IntegrationHandler};
use crate::queue::{Enqueued, JobQueue};
use crate::resolver::{EffectiveIntegrationSet, ResolvedIntegration};
use crate::storage::{InMemoryStore, QueueStore};
use crate::types::{
    EnqueueOptions, FormId, IntegrationJob, IntegrationType, JobId, QueuedJob, SubmissionContext,
    SubmissionId,
};
use crate::worker::{consume_loop, Consumer, ConsumerSettings, JobHandler};

/// One delivery attempt as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub job_id: JobId,
    pub queue: String,
    pub integration_type: IntegrationType,
    /// `None` only when the stored payload could not be decoded.
    pub submission_id: Option<SubmissionId>,
    pub form_id: Option<FormId>,
    pub correlation_id: Option<String>,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
}

/// A job created (or found) for one resolved integration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedDelivery {
    pub integration_type: IntegrationType,
    pub integration_name: String,
    pub queue: String,
    pub result: Enqueued,
}

/// Singleton key for one (submission, integration) pair.
fn singleton_key(submission: &SubmissionContext, integration: &ResolvedIntegration) -> String {
    match submission.idempotency_key.as_deref() {
        Some(key) => format!("{key}:{}", integration.key()),
        None => format!("{}:{}", submission.submission_id, integration.key()),
    }
}

/// Format the submission once and enqueue one job per integration.
///
/// Repeating the call for the same submission while its jobs are
/// unfinished yields duplicates instead of new jobs, so a partially failed
/// call can simply be retried.
pub async fn enqueue_integration_deliveries(
    queue: &JobQueue,
    policies: &RetryPolicies,
    integrations: &EffectiveIntegrationSet,
    submission: &SubmissionContext,
) -> Result<Vec<EnqueuedDelivery>, DispatchError> {
    let formatted_message = format_submission_message(&submission.form_name, &submission.form_data);
    let correlation_id = submission
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut enqueued = Vec::with_capacity(integrations.len());
    for integration in integrations.iter() {
        let kind = integration.kind();
        let queue_name = kind.queue_name();
        queue.create_queue(&queue_name).await?;

        let job = IntegrationJob {
            submission_id: submission.submission_id,
            form_id: submission.form_id,
            organization_id: submission.organization_id,
            integration_type: kind,
            correlation_id: correlation_id.clone(),
            form_data: submission.form_data.clone(),
            formatted_message: formatted_message.clone(),
            form_name: submission.form_name.clone(),
            config: integration.config.clone(),
        };
        let options = EnqueueOptions::new(policies.for_integration(kind))
            .with_singleton_key(singleton_key(submission, integration));

        let result = queue.enqueue(&queue_name, &job, &options).await?;
        if let Enqueued::Duplicate { existing } = result {
            tracing::debug!(
                queue = %queue_name,
                job_id = %existing,
                submission_id = %submission.submission_id,
                "delivery already queued"
            );
        }
        enqueued.push(EnqueuedDelivery {
            integration_type: kind,
            integration_name: integration.name.clone(),
            queue: queue_name,
            result,
        });
    }

    tracing::info!(
        submission_id = %submission.submission_id,
        form_id = %submission.form_id,
        correlation_id = %correlation_id,
        jobs = enqueued.len(),
        "integration deliveries enqueued"
    );
    Ok(enqueued)
}

/// Fields every job payload carries, read without decoding the config.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobLabels {
    submission_id: Option<SubmissionId>,
    form_id: Option<FormId>,
    correlation_id: Option<String>,
}

impl JobLabels {
    fn of(job: &QueuedJob) -> Self {
        JobLabels::deserialize(&job.payload).unwrap_or_default()
    }
}

/// Routes jobs of one integration queue to their handler.
struct DeliveryWorker {
    kind: IntegrationType,
    handler: Option<Arc<dyn IntegrationHandler>>,
    reports: broadcast::Sender<DeliveryReport>,
}

#[async_trait]
impl JobHandler for DeliveryWorker {
    async fn run(&self, job: &QueuedJob) -> Result<(), HandlerError> {
        let Some(handler) = &self.handler else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for {}",
                self.kind
            )));
        };
        let payload = IntegrationJob::deserialize(&job.payload)
            .map_err(|e| HandlerError::permanent(format!("undecodable job payload: {e}")))?;
        handler.handle(&payload).await
    }

    async fn on_failure(&self, job: &QueuedJob, error: &HandlerError) {
        let labels = JobLabels::of(job);
        tracing::warn!(
            queue = %job.queue,
            job_id = %job.id,
            integration_type = %self.kind,
            submission_id = ?labels.submission_id.map(|id| id.0),
            form_id = ?labels.form_id.map(|id| id.0),
            correlation_id = labels.correlation_id.as_deref().unwrap_or(""),
            attempt = job.attempt(),
            permanent = error.is_permanent(),
            error = %error,
            "integration delivery attempt failed"
        );
    }

    async fn on_outcome(&self, job: &QueuedJob, outcome: &DeliveryOutcome) {
        let labels = JobLabels::of(job);
        match outcome {
            DeliveryOutcome::Delivered => tracing::info!(
                queue = %job.queue,
                job_id = %job.id,
                integration_type = %self.kind,
                attempt = job.attempt(),
                "integration delivered"
            ),
            DeliveryOutcome::Exhausted { error, permanent } => tracing::error!(
                queue = %job.queue,
                job_id = %job.id,
                integration_type = %self.kind,
                submission_id = ?labels.submission_id.map(|id| id.0),
                form_id = ?labels.form_id.map(|id| id.0),
                correlation_id = labels.correlation_id.as_deref().unwrap_or(""),
                attempt = job.attempt(),
                permanent,
                error = %error,
                "integration delivery abandoned"
            ),
            DeliveryOutcome::Expired { error } => tracing::error!(
                queue = %job.queue,
                job_id = %job.id,
                integration_type = %self.kind,
                submission_id = ?labels.submission_id.map(|id| id.0),
                form_id = ?labels.form_id.map(|id| id.0),
                correlation_id = labels.correlation_id.as_deref().unwrap_or(""),
                attempt = job.attempt(),
                error = %error,
                "integration delivery expired"
            ),
            DeliveryOutcome::RetryScheduled { retry_at, .. } => tracing::debug!(
                queue = %job.queue,
                job_id = %job.id,
                retry_at = %retry_at,
                "integration delivery retry scheduled"
            ),
        }

        // No subscribers is fine.
        let _ = self.reports.send(DeliveryReport {
            job_id: job.id,
            queue: job.queue.clone(),
            integration_type: self.kind,
            submission_id: labels.submission_id,
            form_id: labels.form_id,
            correlation_id: labels.correlation_id,
            attempt: job.attempt(),
            outcome: outcome.clone(),
        });
    }
}

/// Runs one consume loop per integration queue.
///
/// Loops are independent: a slow or failing channel never holds up
/// another channel's queue.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<JobQueue>,
    registry: HandlerRegistry,
    reports: broadcast::Sender<DeliveryReport>,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn QueueStore>,
        registry: HandlerRegistry,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(store, config.retry_schedule()));
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        Self {
            config,
            queue,
            registry,
            reports,
            is_running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
            handles: Vec::new(),
        }
    }

    /// In-memory store and the built-in handlers.
    pub fn in_memory(config: DispatcherConfig) -> Result<Self, DispatchError> {
        let registry = HandlerRegistry::with_defaults(&config.channels)?;
        Ok(Self::new(config, Arc::new(InMemoryStore::new()), registry))
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    /// Declare every integration queue and start consuming. Idempotent.
    pub async fn start(&mut self) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        if !self.handles.is_empty() {
            return Ok(());
        }

        let settings = ConsumerSettings {
            concurrency: self.config.queue_concurrency,
            poll_interval: self.config.poll_interval(),
            handler_timeout: self.config.handler_timeout(),
            active_timeout: self.config.active_timeout(),
            finished_retention: self.config.finished_retention(),
        };

        for kind in IntegrationType::ALL {
            let name = kind.queue_name();
            self.queue.create_queue(&name).await?;

            let handler = self.registry.get(kind);
            if handler.is_none() {
                tracing::warn!(queue = %name, "no handler registered; jobs will fail permanently");
            }
            let consumer = Arc::new(Consumer {
                queue: self.queue.clone(),
                name,
                handler: Arc::new(DeliveryWorker {
                    kind,
                    handler,
                    reports: self.reports.clone(),
                }),
                settings: settings.clone(),
                is_running: self.is_running.clone(),
                shutdown: self.shutdown.clone(),
            });
            self.handles.push(tokio::spawn(consume_loop(consumer)));
        }

        tracing::info!(queues = self.handles.len(), "dispatcher started");
        Ok(())
    }

    /// Resolve-time entry point: see [`enqueue_integration_deliveries`].
    pub async fn enqueue_integration_deliveries(
        &self,
        integrations: &EffectiveIntegrationSet,
        submission: &SubmissionContext,
    ) -> Result<Vec<EnqueuedDelivery>, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        enqueue_integration_deliveries(&self.queue, &self.config.policies, integrations, submission)
            .await
    }

    /// Stop claiming jobs and wait for in-flight attempts to finish.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        tracing::info!("dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}
