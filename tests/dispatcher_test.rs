use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use form_dispatch::{
    resolve, verify_webhook_request, ChannelSettings, DeliveryOutcome, DeliveryReport, Dispatcher,
    DispatcherConfig, FormData, FormId, HandlerError, HandlerRegistry, InMemoryStore,
    IntegrationConfig, IntegrationHandler, IntegrationJob, IntegrationRecord, IntegrationType,
    JobState, OrganizationId, RetryPolicies, RetryPolicy, SlackConfig, SubmissionContext,
    SubmissionId,
};

const ORG: OrganizationId = OrganizationId(1);

fn fast_policy(retry_limit: u32) -> RetryPolicy {
    RetryPolicy {
        retry_limit,
        retry_delay_secs: 0,
        retry_backoff: true,
        expire_in_secs: 60,
    }
}

fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval_ms: 10,
        retry_jitter_ms: 0,
        policies: RetryPolicies {
            email: fast_policy(3),
            messaging: fast_policy(3),
        },
        ..Default::default()
    }
}

fn form_data(value: Value) -> FormData {
    match value {
        Value::Object(map) => map,
        _ => FormData::new(),
    }
}

fn submission(id: i64) -> SubmissionContext {
    SubmissionContext::new(
        SubmissionId(id),
        FormId(3),
        ORG,
        "Contact",
        form_data(json!({"email": "a@b.com", "message": "hello"})),
    )
}

async fn final_report(reports: &mut broadcast::Receiver<DeliveryReport>) -> DeliveryReport {
    timeout(Duration::from_secs(5), async {
        loop {
            match reports.recv().await {
                Ok(report) if report.outcome.is_final() => return report,
                Ok(_) => continue,
                Err(err) => panic!("report channel failed: {err}"),
            }
        }
    })
    .await
    .expect("final delivery report")
}

async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub server");
    });
    format!("http://{addr}")
}

type Recorded = mpsc::UnboundedSender<(HeaderMap, Value)>;

/// Handler that fails every attempt the same way.
struct Failing {
    kind: IntegrationType,
    error: HandlerError,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationHandler for Failing {
    fn integration_type(&self) -> IntegrationType {
        self.kind
    }

    async fn handle(&self, _job: &IntegrationJob) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Handler that succeeds after an optional delay.
struct Succeeding {
    kind: IntegrationType,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl IntegrationHandler for Succeeding {
    fn integration_type(&self) -> IntegrationType {
        self.kind
    }

    async fn handle(&self, _job: &IntegrationJob) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

fn slack_record(channel: &str, token: &str) -> IntegrationRecord {
    IntegrationRecord::organization(
        ORG,
        IntegrationType::Slack,
        json!({"channelId": channel, "accessToken": token}),
    )
    .with_id(11)
}

#[tokio::test]
async fn transient_failures_run_retry_limit_plus_one_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Failing {
        kind: IntegrationType::Slack,
        error: HandlerError::transient("HTTP 503"),
        calls: calls.clone(),
    });

    let mut dispatcher = Dispatcher::new(test_config(), Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    let enqueued = dispatcher
        .enqueue_integration_deliveries(&set, &submission(7))
        .await
        .expect("enqueue");
    assert_eq!(enqueued.len(), 1);

    let report = final_report(&mut reports).await;
    assert_eq!(report.attempt, 4);
    assert!(matches!(
        report.outcome,
        DeliveryOutcome::Exhausted { permanent: false, .. }
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let job = dispatcher
        .queue()
        .job(enqueued[0].result.job_id())
        .await
        .expect("store")
        .expect("job kept");
    assert_eq!(job.state, JobState::Exhausted);
    assert_eq!(job.last_error.as_deref(), Some("HTTP 503"));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_is_never_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Failing {
        kind: IntegrationType::Slack,
        error: HandlerError::permanent("HTTP 403"),
        calls: calls.clone(),
    });

    let mut dispatcher = Dispatcher::new(test_config(), Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(8))
        .await
        .expect("enqueue");

    let report = final_report(&mut reports).await;
    assert_eq!(report.attempt, 1);
    assert_eq!(report.submission_id, Some(SubmissionId(8)));
    assert_eq!(
        report.outcome,
        DeliveryOutcome::Exhausted {
            error: "HTTP 403".into(),
            permanent: true
        }
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn slow_channel_does_not_block_other_queues() {
    let telegram_calls = Arc::new(AtomicUsize::new(0));
    let slack_calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Succeeding {
        kind: IntegrationType::Telegram,
        delay: Duration::from_secs(2),
        calls: telegram_calls.clone(),
    });
    registry.register(Succeeding {
        kind: IntegrationType::Slack,
        delay: Duration::ZERO,
        calls: slack_calls.clone(),
    });

    let config = DispatcherConfig {
        queue_concurrency: 1,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let records = vec![
        IntegrationRecord::organization(ORG, IntegrationType::Telegram, json!({"chatId": 555})),
        slack_record("C1", "T1"),
    ];
    let set = resolve(&records, &[], true);
    assert_eq!(set.kinds(), vec![IntegrationType::Telegram, IntegrationType::Slack]);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(9))
        .await
        .expect("enqueue");

    let report = timeout(Duration::from_secs(1), final_report(&mut reports))
        .await
        .expect("slack delivered while telegram is still busy");
    assert_eq!(report.integration_type, IntegrationType::Slack);
    assert!(report.outcome.is_delivered());
    assert_eq!(telegram_calls.load(Ordering::SeqCst), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn repeated_enqueue_for_same_submission_is_suppressed() {
    let dispatcher = Dispatcher::new(
        test_config(),
        Arc::new(InMemoryStore::new()),
        HandlerRegistry::new(),
    );
    let set = resolve(&[slack_record("C1", "T1")], &[], true);

    let first = dispatcher
        .enqueue_integration_deliveries(&set, &submission(10))
        .await
        .expect("first enqueue");
    let second = dispatcher
        .enqueue_integration_deliveries(&set, &submission(10))
        .await
        .expect("second enqueue");

    assert!(!first[0].result.is_duplicate());
    assert!(second[0].result.is_duplicate());
    assert_eq!(first[0].result.job_id(), second[0].result.job_id());

    let counts = dispatcher
        .queue()
        .queue_counts("integration-slack")
        .await
        .expect("counts");
    assert_eq!(counts.pending, 1);
}

async fn slack_forbidden(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let _ = recorded.send((headers, body));
    (
        StatusCode::FORBIDDEN,
        Json(json!({"ok": false, "error": "invalid_auth"})),
    )
}

#[tokio::test]
async fn org_slack_integration_end_to_end_403_is_permanent() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let base = spawn_stub(
        Router::new()
            .route("/chat.postMessage", post(slack_forbidden))
            .with_state(tx),
    )
    .await;

    let channels = ChannelSettings {
        slack_api_base: base,
        ..Default::default()
    };
    let registry = HandlerRegistry::with_defaults(&channels).expect("registry");
    let config = DispatcherConfig {
        channels,
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    let enqueued = dispatcher
        .enqueue_integration_deliveries(&set, &submission(12))
        .await
        .expect("enqueue");
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].queue, "integration-slack");

    let queue = dispatcher.queue();
    let counts = queue.queue_counts("integration-slack").await.expect("counts");
    assert_eq!(counts.pending, 1);
    let stored = queue
        .job(enqueued[0].result.job_id())
        .await
        .expect("store")
        .expect("job");
    let job: IntegrationJob = serde_json::from_value(stored.payload).expect("payload");
    assert_eq!(
        job.config,
        IntegrationConfig::Slack(SlackConfig {
            channel_id: Some("C1".into()),
            access_token: Some("T1".into()),
        })
    );
    assert!(job.formatted_message.contains("email: a@b.com"));

    dispatcher.start().await.expect("start");
    let report = final_report(&mut reports).await;
    assert_eq!(report.attempt, 1);
    assert!(matches!(
        report.outcome,
        DeliveryOutcome::Exhausted { permanent: true, .. }
    ));

    let (headers, body) = rx.recv().await.expect("slack request");
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer T1")
    );
    assert_eq!(body["channel"], json!("C1"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err(), "403 must not be retried");

    dispatcher.shutdown().await;
}

async fn record_ok(
    State(recorded): State<Recorded>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    let _ = recorded.send((headers, value));
    StatusCode::OK
}

#[tokio::test]
async fn webhook_body_is_templated_and_signed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let base = spawn_stub(Router::new().route("/hook", post(record_ok)).with_state(tx)).await;

    let registry = HandlerRegistry::with_defaults(&ChannelSettings::default()).expect("registry");
    let mut dispatcher = Dispatcher::new(test_config(), Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let record = IntegrationRecord::form(
        ORG,
        FormId(3),
        IntegrationType::Webhook,
        json!({
            "url": format!("{base}/hook"),
            "headers": {"X-Form": "{{formName}}"},
            "bodyParams": [
                {"key": "email_field", "value": "{{field.email}}"},
                {"key": "sub", "value": "{{submissionId}}"},
                {"key": "all", "value": "{{formData}}"}
            ],
            "secret": "s3cret"
        }),
    );
    let set = resolve(&[], &[record], true);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(7).with_correlation_id("corr-7"))
        .await
        .expect("enqueue");

    let report = final_report(&mut reports).await;
    assert!(report.outcome.is_delivered());
    assert_eq!(report.correlation_id.as_deref(), Some("corr-7"));

    let (headers, body) = rx.recv().await.expect("webhook request");
    assert_eq!(
        body,
        json!({
            "email_field": "a@b.com",
            "sub": "7",
            "all": {"email": "a@b.com", "message": "hello"}
        })
    );
    assert_eq!(headers.get("x-form").and_then(|v| v.to_str().ok()), Some("Contact"));
    assert_eq!(
        headers.get("x-correlation-id").and_then(|v| v.to_str().ok()),
        Some("corr-7")
    );

    let raw = serde_json::to_vec(&body).expect("body bytes");
    let pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs();
    assert_eq!(verify_webhook_request(pairs, &raw, b"s3cret", 60, now), Ok(()));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn telegram_delivers_formatted_message_to_chat() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let base = spawn_stub(
        Router::new()
            .route("/bot123abc/sendMessage", post(record_ok))
            .with_state(tx),
    )
    .await;

    let channels = ChannelSettings {
        telegram_api_base: base,
        telegram_bot_token: Some("123abc".into()),
        ..Default::default()
    };
    let registry = HandlerRegistry::with_defaults(&channels).expect("registry");
    let mut dispatcher = Dispatcher::new(test_config(), Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let record = IntegrationRecord::organization(ORG, IntegrationType::Telegram, json!({"chatId": 555}));
    let set = resolve(&[record], &[], true);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(13))
        .await
        .expect("enqueue");

    let report = final_report(&mut reports).await;
    assert!(report.outcome.is_delivered());

    let (_, body) = rx.recv().await.expect("telegram request");
    assert_eq!(body["chat_id"], json!("555"));
    assert!(body["text"]
        .as_str()
        .is_some_and(|text| text.starts_with("New submission for Contact")));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn missing_config_fails_permanently_without_io() {
    let registry = HandlerRegistry::with_defaults(&ChannelSettings::default()).expect("registry");
    let mut dispatcher = Dispatcher::new(test_config(), Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await.expect("start");

    let record = IntegrationRecord::organization(ORG, IntegrationType::Discord, json!({}));
    let set = resolve(&[record], &[], true);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(14))
        .await
        .expect("enqueue");

    let report = final_report(&mut reports).await;
    assert_eq!(report.attempt, 1);
    assert_eq!(
        report.outcome,
        DeliveryOutcome::Exhausted {
            error: HandlerError::config("webhookUrl").to_string(),
            permanent: true
        }
    );

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn enqueue_after_shutdown_is_rejected() {
    let mut dispatcher = Dispatcher::new(
        test_config(),
        Arc::new(InMemoryStore::new()),
        HandlerRegistry::new(),
    );
    dispatcher.start().await.expect("start");
    dispatcher.shutdown().await;

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    let result = dispatcher
        .enqueue_integration_deliveries(&set, &submission(15))
        .await;
    assert!(matches!(result, Err(form_dispatch::DispatchError::Shutdown)));
}

#[tokio::test]
async fn abandoned_in_flight_job_is_reported() {
    let config = DispatcherConfig {
        handler_timeout_secs: 1,
        active_timeout_secs: 0,
        policies: RetryPolicies {
            email: fast_policy(0),
            messaging: fast_policy(0),
        },
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(
        config,
        Arc::new(InMemoryStore::new()),
        HandlerRegistry::new(),
    );
    let mut reports = dispatcher.subscribe();

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    let enqueued = dispatcher
        .enqueue_integration_deliveries(&set, &submission(14))
        .await
        .expect("enqueue");

    // A worker that claimed the job and then died.
    let claimed = dispatcher
        .queue()
        .fetch("integration-slack")
        .await
        .expect("fetch")
        .expect("job");
    assert_eq!(claimed.id, enqueued[0].result.job_id());

    dispatcher.start().await.expect("start");
    let report = final_report(&mut reports).await;
    assert_eq!(report.job_id, claimed.id);
    assert_eq!(report.attempt, 1);
    assert_eq!(report.submission_id, Some(SubmissionId(14)));
    assert_eq!(
        report.outcome,
        DeliveryOutcome::Exhausted {
            error: "attempt abandoned: worker did not report back".into(),
            permanent: false
        }
    );

    let job = dispatcher
        .queue()
        .job(claimed.id)
        .await
        .expect("store")
        .expect("job kept");
    assert_eq!(job.state, JobState::Exhausted);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn overdue_job_is_reported_expired() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register(Succeeding {
        kind: IntegrationType::Slack,
        delay: Duration::ZERO,
        calls: calls.clone(),
    });
    let config = DispatcherConfig {
        policies: RetryPolicies {
            email: fast_policy(3),
            messaging: RetryPolicy {
                expire_in_secs: 0,
                ..fast_policy(3)
            },
        },
        ..test_config()
    };
    let mut dispatcher = Dispatcher::new(config, Arc::new(InMemoryStore::new()), registry);
    let mut reports = dispatcher.subscribe();

    let set = resolve(&[slack_record("C1", "T1")], &[], true);
    dispatcher
        .enqueue_integration_deliveries(&set, &submission(15))
        .await
        .expect("enqueue");
    dispatcher.start().await.expect("start");

    let report = final_report(&mut reports).await;
    assert_eq!(report.submission_id, Some(SubmissionId(15)));
    assert_eq!(
        report.outcome,
        DeliveryOutcome::Expired {
            error: "expired before delivery".into()
        }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    dispatcher.shutdown().await;
}
