//! Resolve a form's integrations, enqueue one submission and watch it land
//! on a local webhook receiver.
//!
//! ```text
//! RUST_LOG=form_dispatch=debug cargo run --example submit [config.toml]
//! ```

use std::time::Duration;

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use form_dispatch::{
    normalize_legacy_config, resolve, DeliveryOutcome, Dispatcher, DispatcherConfig, FormData,
    FormId, IntegrationRecord, IntegrationType, LegacyIntegrationConfig, OrganizationId,
    SubmissionContext, SubmissionId,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => DispatcherConfig::load(path)?,
        None => {
            let mut config = DispatcherConfig::default();
            config.apply_env();
            config
        }
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let receiver = format!("http://{}", listener.local_addr()?);
    let app = Router::new().route(
        "/hooks/{form}",
        post(|Json(body): Json<Value>| async move {
            println!("receiver got: {body}");
            "ok"
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let org = OrganizationId(1);
    let form = FormId(10);

    let org_records = vec![IntegrationRecord::organization(
        org,
        IntegrationType::Webhook,
        json!({"url": format!("{receiver}/hooks/org")}),
    )
    .with_id(1)
    .with_name("org-wide")];

    let mut legacy = LegacyIntegrationConfig::new(org, Some(form));
    legacy.webhook_enabled = true;
    legacy.webhook_url = Some(format!("{receiver}/hooks/legacy"));
    let mut form_records = normalize_legacy_config(&legacy);
    form_records.push(
        IntegrationRecord::form(
            org,
            form,
            IntegrationType::Webhook,
            json!({
                "url": format!("{receiver}/hooks/templated"),
                "bodyParams": {"who": "{{field.email}}", "all": "{{formData}}"},
            }),
        )
        .with_id(2)
        .with_name("templated"),
    );

    let integrations = resolve(&org_records, &form_records, true);
    println!("effective integrations: {:?}", integrations.kinds());

    let mut dispatcher = Dispatcher::in_memory(config)?;
    let mut reports = dispatcher.subscribe();
    dispatcher.start().await?;

    let mut form_data = FormData::new();
    form_data.insert("email".into(), json!("ada@example.com"));
    form_data.insert("topics".into(), json!(["billing", "support"]));
    let submission = SubmissionContext::new(SubmissionId(1001), form, org, "Contact Us", form_data);

    let enqueued = dispatcher
        .enqueue_integration_deliveries(&integrations, &submission)
        .await?;

    let mut pending = enqueued.len();
    while pending > 0 {
        let report = tokio::time::timeout(Duration::from_secs(30), reports.recv()).await??;
        println!(
            "{} attempt {} -> {}",
            report.queue,
            report.attempt,
            report.outcome.label()
        );
        if report.outcome.is_final() {
            pending -= 1;
        }
        if let DeliveryOutcome::Exhausted { error, .. } = &report.outcome {
            println!("  gave up: {error}");
        }
    }

    dispatcher.shutdown().await;
    Ok(())
}
