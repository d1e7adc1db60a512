//! Registration intake: validate, persist, enqueue, mark queued

use chrono::{DateTime, Utc};
use ingest_common::{
    DeviceRegistration, Error, QueueMessage, RegistrationPayload, RegistrationStatus, Result,
    TransitionDetails,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::queue::QueueBackend;
use crate::store::{validate_device_id, RegistrationStore};

/// Incoming registration request
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// Raw hardware identifier; hashed and never persisted
    pub hardware_id: Option<String>,
    pub model: Option<String>,
    pub device_id: Option<String>,
    pub firmware_version: Option<String>,
    pub location: Option<serde_json::Value>,
    pub initial_telemetry: Option<serde_json::Value>,
    pub source: Option<String>,
    /// Client timestamp (RFC 3339)
    pub ts: Option<String>,
}

/// Response for an accepted registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub device_id: String,
    pub status: RegistrationStatus,
    pub queue_message_id: String,
}

pub struct RegistrationIntake {
    store: Arc<RegistrationStore>,
    queue: Arc<dyn QueueBackend>,
    topic: String,
}

impl RegistrationIntake {
    pub fn new(
        store: Arc<RegistrationStore>,
        queue: Arc<dyn QueueBackend>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            topic: topic.into(),
        }
    }

    /// Register a device and hand it to the queue.
    ///
    /// One store write, one queue write, one store transition, in that order.
    /// If the enqueue fails the record stays `registered`.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let RegisterRequest {
            hardware_id,
            model,
            device_id,
            firmware_version,
            location,
            initial_telemetry,
            source,
            ts,
        } = request;

        let hardware_id = required(hardware_id, "hardwareId")?;
        let model = required(model, "model")?;
        let reported_at = match ts {
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| Error::Validation(format!("Invalid ts {:?}: {}", raw, e)))?
                .with_timezone(&Utc),
            None => Utc::now(),
        };

        let device_id = device_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_device_id);
        validate_device_id(&device_id)?;

        let hardware_id_hash = hash_hardware_id(&hardware_id);
        drop(hardware_id);

        if let Some(existing) = self.store.get(&device_id).await? {
            warn!(
                device_id = %device_id,
                status = %existing.status(),
                "Overwriting existing registration"
            );
        }

        let mut registration = DeviceRegistration::new(device_id, hardware_id_hash, model);
        registration.firmware_version = firmware_version;
        registration.location = location;
        registration.initial_telemetry = initial_telemetry;
        registration.reported_at = reported_at;
        registration.source = Some(source.unwrap_or_else(|| "api".to_string()));

        let saved = self.store.save(&registration).await?;

        let message = match self.enqueue(&saved).await {
            Ok(message) => message,
            Err(e) => {
                error!(device_id = %saved.device_id, error = %e, "Enqueue failed, registration left in registered");
                return Err(e);
            }
        };

        let queued = self
            .store
            .transition(
                &saved.device_id,
                RegistrationStatus::Queued,
                TransitionDetails {
                    queued_at: Some(Utc::now()),
                    queue_message_id: Some(message.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(device_id = %queued.device_id, message_id = %message.id, "Registration queued");

        Ok(RegisterResponse {
            status: queued.status(),
            device_id: queued.device_id,
            queue_message_id: message.id,
        })
    }

    /// Re-enter a `failed` registration into the queue.
    ///
    /// The record moves to `queued` before the message is written so the
    /// consumer never sees a message for a record still marked `failed`.
    /// If the enqueue fails the record goes back to `failed`.
    pub async fn retry(&self, device_id: &str) -> Result<RegisterResponse> {
        let record = self
            .store
            .transition(
                device_id,
                RegistrationStatus::Queued,
                TransitionDetails {
                    queued_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;

        let message = match self.enqueue(&record).await {
            Ok(message) => message,
            Err(e) => {
                error!(device_id, error = %e, "Re-enqueue failed, returning registration to failed");
                self.store
                    .transition(
                        device_id,
                        RegistrationStatus::Failed,
                        TransitionDetails {
                            failed_at: Some(Utc::now()),
                            error: Some(e.to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(e);
            }
        };

        self.store
            .annotate(
                device_id,
                TransitionDetails {
                    queue_message_id: Some(message.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(device_id, message_id = %message.id, "Registration re-queued");

        Ok(RegisterResponse {
            device_id: device_id.to_string(),
            status: RegistrationStatus::Queued,
            queue_message_id: message.id,
        })
    }

    async fn enqueue(&self, registration: &DeviceRegistration) -> Result<QueueMessage> {
        let payload =
            RegistrationPayload::from_registration(registration, Uuid::new_v4().to_string());
        self.queue
            .enqueue(&self.topic, serde_json::to_value(&payload)?)
            .await
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::Validation(format!("{} is required", field)))
}

/// `{unix_millis}-{8 hex}`
fn generate_device_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Lowercase hex SHA-256
pub fn hash_hardware_id(hardware_id: &str) -> String {
    hex::encode(Sha256::digest(hardware_id.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::LocalQueue;
    use async_trait::async_trait;
    use ingest_common::DEVICE_REGISTRATIONS_TOPIC;
    use serde_json::json;
    use tempfile::TempDir;

    struct BrokenQueue;

    #[async_trait]
    impl QueueBackend for BrokenQueue {
        async fn enqueue(&self, _topic: &str, _payload: serde_json::Value) -> Result<QueueMessage> {
            Err(Error::QueueUnavailable("connection refused".to_string()))
        }

        async fn dequeue(&self, _topic: &str) -> Result<Option<QueueMessage>> {
            Err(Error::QueueUnavailable("connection refused".to_string()))
        }

        async fn list(&self, _topic: &str) -> Result<Vec<QueueMessage>> {
            Ok(Vec::new())
        }

        fn supports_listing(&self) -> bool {
            false
        }

        fn kind(&self) -> &'static str {
            "broken"
        }
    }

    struct Fixture {
        intake: RegistrationIntake,
        store: Arc<RegistrationStore>,
        queue: Arc<LocalQueue>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistrationStore::new(dir.path().join("devices")));
        let queue = Arc::new(LocalQueue::new(dir.path().join("queue")));
        let intake =
            RegistrationIntake::new(store.clone(), queue.clone(), DEVICE_REGISTRATIONS_TOPIC);
        Fixture {
            intake,
            store,
            queue,
            _dir: dir,
        }
    }

    fn request(hardware_id: Option<&str>, model: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            hardware_id: hardware_id.map(String::from),
            model: model.map(String::from),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_register_queues_device() {
        let f = fixture();

        let response = f
            .intake
            .register(request(Some("HW-1"), Some("X")))
            .await
            .unwrap();
        assert_eq!(response.status, RegistrationStatus::Queued);

        let stored = f.store.get(&response.device_id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RegistrationStatus::Queued);
        assert_eq!(
            stored.queue_message_id.as_deref(),
            Some(response.queue_message_id.as_str())
        );
        assert_eq!(stored.source.as_deref(), Some("api"));

        let pending = f.queue.list(DEVICE_REGISTRATIONS_TOPIC).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, response.queue_message_id);
        assert_eq!(pending[0].payload["deviceId"], json!(response.device_id));
        assert!(pending[0].payload["traceId"].is_string());
    }

    #[tokio::test]
    async fn test_raw_hardware_id_is_never_persisted() {
        let f = fixture();

        let response = f
            .intake
            .register(request(Some("HW-SECRET-42"), Some("X")))
            .await
            .unwrap();

        let stored = f.store.get(&response.device_id).await.unwrap().unwrap();
        assert_eq!(stored.hardware_id_hash, hash_hardware_id("HW-SECRET-42"));
        assert_eq!(stored.hardware_id_hash.len(), 64);

        let record_json = serde_json::to_string(&stored).unwrap();
        assert!(!record_json.contains("HW-SECRET-42"));

        let pending = f.queue.list(DEVICE_REGISTRATIONS_TOPIC).await.unwrap();
        assert!(!pending[0].payload.to_string().contains("HW-SECRET-42"));
    }

    #[tokio::test]
    async fn test_missing_hardware_id_creates_nothing() {
        let f = fixture();

        let err = f.intake.register(request(None, Some("X"))).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let blank = f
            .intake
            .register(request(Some("  "), Some("X")))
            .await
            .unwrap_err();
        assert!(matches!(blank, Error::Validation(_)));

        assert!(f.store.list().await.unwrap().is_empty());
        assert!(f
            .queue
            .list(DEVICE_REGISTRATIONS_TOPIC)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_model_is_rejected() {
        let f = fixture();
        let err = f.intake.register(request(Some("HW-1"), None)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_client_supplied_fields() {
        let f = fixture();

        let response = f
            .intake
            .register(RegisterRequest {
                hardware_id: Some("HW-1".to_string()),
                model: Some("X".to_string()),
                device_id: Some("my-device".to_string()),
                firmware_version: Some("2.0.1".to_string()),
                location: Some(json!({"lat": 47.6, "lon": -122.3})),
                initial_telemetry: Some(json!({"battery": 100})),
                source: Some("factory".to_string()),
                ts: Some("2024-05-01T12:00:00Z".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(response.device_id, "my-device");

        let stored = f.store.get("my-device").await.unwrap().unwrap();
        assert_eq!(stored.firmware_version.as_deref(), Some("2.0.1"));
        assert_eq!(stored.source.as_deref(), Some("factory"));
        assert_eq!(stored.reported_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(stored.initial_telemetry, Some(json!({"battery": 100})));
    }

    #[tokio::test]
    async fn test_invalid_ts_and_device_id_are_rejected() {
        let f = fixture();

        let bad_ts = f
            .intake
            .register(RegisterRequest {
                ts: Some("yesterday".to_string()),
                ..request(Some("HW-1"), Some("X"))
            })
            .await;
        assert!(matches!(bad_ts, Err(Error::Validation(_))));

        let bad_id = f
            .intake
            .register(RegisterRequest {
                device_id: Some("../escape".to_string()),
                ..request(Some("HW-1"), Some("X"))
            })
            .await;
        assert!(matches!(bad_id, Err(Error::Validation(_))));
    }

    #[test]
    fn test_generated_device_id_shape() {
        let id = generate_device_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 8);
        assert!(validate_device_id(&id).is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_failure_leaves_registered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistrationStore::new(dir.path().join("devices")));
        let intake = RegistrationIntake::new(
            store.clone(),
            Arc::new(BrokenQueue),
            DEVICE_REGISTRATIONS_TOPIC,
        );

        let err = intake
            .register(RegisterRequest {
                device_id: Some("dev-1".to_string()),
                ..request(Some("HW-1"), Some("X"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));

        let stored = store.get("dev-1").await.unwrap().unwrap();
        assert_eq!(stored.status(), RegistrationStatus::Registered);
        assert!(stored.queue_message_id.is_none());
    }

    #[tokio::test]
    async fn test_retry_requeues_failed_registration() {
        let f = fixture();
        let response = f
            .intake
            .register(request(Some("HW-1"), Some("X")))
            .await
            .unwrap();
        let id = response.device_id.as_str();

        // Not failed yet
        let early = f.intake.retry(id).await;
        assert!(matches!(early, Err(Error::InvalidTransition { .. })));

        f.store
            .transition(
                id,
                RegistrationStatus::Failed,
                TransitionDetails {
                    error: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retried = f.intake.retry(id).await.unwrap();
        assert_eq!(retried.status, RegistrationStatus::Queued);
        assert_ne!(retried.queue_message_id, response.queue_message_id);

        let stored = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), RegistrationStatus::Queued);
        assert_eq!(
            stored.queue_message_id.as_deref(),
            Some(retried.queue_message_id.as_str())
        );
        assert!(stored.error.is_none());
        assert_eq!(f.queue.list(DEVICE_REGISTRATIONS_TOPIC).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_enqueue_failure_returns_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistrationStore::new(dir.path().join("devices")));
        let mut record =
            DeviceRegistration::new("dev-1".to_string(), "hash".to_string(), "X".to_string());
        for status in [RegistrationStatus::Queued, RegistrationStatus::Failed] {
            record
                .apply_transition(status, TransitionDetails::default(), Utc::now())
                .unwrap();
        }
        store.save(&record).await.unwrap();

        let intake = RegistrationIntake::new(
            store.clone(),
            Arc::new(BrokenQueue),
            DEVICE_REGISTRATIONS_TOPIC,
        );
        let err = intake.retry("dev-1").await.unwrap_err();
        assert!(matches!(err, Error::QueueUnavailable(_)));

        let stored = store.get("dev-1").await.unwrap().unwrap();
        assert_eq!(stored.status(), RegistrationStatus::Failed);
        assert!(stored.error.unwrap().contains("connection refused"));
    }
}
