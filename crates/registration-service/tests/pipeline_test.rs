//! End-to-end tests: HTTP intake -> local queue -> consumer -> HTTP downstream

use axum::{http::StatusCode, routing::post, Json, Router};
use ingest_common::RegistrationStatus;
use registration_service::{
    create_router, AppState, ConsumerConfig, HttpIngestionClient, IngestionConsumer, LocalQueue,
    ProcessOutcome, RegistrationStore,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "device-registrations.v1";

struct Pipeline {
    base_url: String,
    store: Arc<RegistrationStore>,
    queue: Arc<LocalQueue>,
    _dir: tempfile::TempDir,
}

/// Serve `app` on an ephemeral port and return its base URL
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn start_pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RegistrationStore::new(dir.path().join("devices")));
    let queue = Arc::new(LocalQueue::new(dir.path().join("queue")));

    let app = create_router(AppState::new(store.clone(), queue.clone(), TOPIC));
    let base_url = serve(app).await;

    Pipeline {
        base_url,
        store,
        queue,
        _dir: dir,
    }
}

fn consumer(pipeline: &Pipeline, endpoint: String) -> IngestionConsumer {
    let config = ConsumerConfig {
        ingestion_endpoint: endpoint,
        retry_base_delay: Duration::from_millis(5),
        ..ConsumerConfig::default()
    };
    let client = HttpIngestionClient::new(config.ingestion_endpoint.clone(), Duration::from_secs(5))
        .unwrap();

    IngestionConsumer::new(
        pipeline.store.clone(),
        pipeline.queue.clone(),
        Arc::new(client),
        TOPIC,
        &config,
    )
}

async fn register(base_url: &str, body: Value) -> Value {
    let response = reqwest::Client::new()
        .post(format!("{}/api/devices/register", base_url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    response.json().await.unwrap()
}

async fn fetch_device(base_url: &str, device_id: &str) -> Value {
    reqwest::get(format!("{}/api/devices/{}", base_url, device_id))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_registration_is_acknowledged_by_mock_ingestion() {
    let pipeline = start_pipeline().await;
    let consumer = consumer(
        &pipeline,
        format!("{}/api/ingestion/mock", pipeline.base_url),
    );

    let accepted = register(
        &pipeline.base_url,
        json!({
            "hardwareId": "E2E-HW-0001",
            "model": "E2E-Model",
            "firmwareVersion": "e2e-0.1",
            "location": "test-lab",
            "initialTelemetry": {"battery": 100}
        }),
    )
    .await;
    let device_id = accepted["deviceId"].as_str().unwrap();

    let outcome = consumer.poll_once().await.unwrap().expect("message");
    assert!(outcome.is_success());

    let record = fetch_device(&pipeline.base_url, device_id).await;
    assert_eq!(record["status"], "acknowledged");
    assert_eq!(record["processingAttempts"], 1);
    assert_eq!(record["ingestionResult"]["status"], "acknowledged");
    assert_eq!(record["ingestionResult"]["duplicate"], false);
    assert_eq!(record["initialTelemetry"]["battery"], 100);

    // Queue is drained
    assert!(consumer.poll_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_failing_downstream_marks_failed_after_three_attempts() {
    let pipeline = start_pipeline().await;

    let hits = Arc::new(AtomicU32::new(0));
    let downstream = {
        let hits = hits.clone();
        Router::new().route(
            "/ingest",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "ingestion offline"})),
                    )
                }
            }),
        )
    };
    let downstream_url = serve(downstream).await;
    let consumer = consumer(&pipeline, format!("{}/ingest", downstream_url));

    let accepted = register(
        &pipeline.base_url,
        json!({"hardwareId": "HW-1", "model": "X"}),
    )
    .await;
    let device_id = accepted["deviceId"].as_str().unwrap();

    let outcome = consumer.poll_once().await.unwrap().expect("message");
    match outcome {
        ProcessOutcome::Failed { error, attempts } => {
            assert_eq!(attempts, 3);
            assert!(error.contains("ingestion offline"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let stored = pipeline.store.get(device_id).await.unwrap().unwrap();
    assert_eq!(stored.status(), RegistrationStatus::Failed);
    assert_eq!(stored.processing_attempts, Some(3));
    assert!(stored.error.is_some());

    // Manual re-entry puts it back on the queue
    let response = reqwest::Client::new()
        .post(format!(
            "{}/api/devices/{}/retry",
            pipeline.base_url, device_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);

    let record = fetch_device(&pipeline.base_url, device_id).await;
    assert_eq!(record["status"], "queued");
    assert!(record.get("error").is_none());
}
