//! API handlers for the Registration Service

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use ingest_common::{DeviceRegistration, Error};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

use crate::intake::{RegisterRequest, RegisterResponse, RegistrationIntake};
use crate::queue::QueueBackend;
use crate::store::RegistrationStore;

/// Trace IDs remembered by the mock ingestion endpoint
const SEEN_TRACE_ID_CAPACITY: usize = 10_000;

/// Shared application state
pub struct AppState {
    pub intake: RegistrationIntake,
    pub store: Arc<RegistrationStore>,
    pub queue: Arc<dyn QueueBackend>,
    pub seen_trace_ids: SeenTraceIds,
}

impl AppState {
    pub fn new(
        store: Arc<RegistrationStore>,
        queue: Arc<dyn QueueBackend>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            intake: RegistrationIntake::new(store.clone(), queue.clone(), topic),
            store,
            queue,
            seen_trace_ids: SeenTraceIds::new(SEEN_TRACE_ID_CAPACITY),
        }
    }
}

/// Bounded set of trace IDs; the oldest is evicted when full
pub struct SeenTraceIds {
    capacity: usize,
    inner: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl SeenTraceIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Record `trace_id`, returning whether it had been seen before
    pub fn check_and_insert(&self, trace_id: &str) -> bool {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (set, order) = &mut *guard;

        if set.contains(trace_id) {
            return true;
        }

        if order.len() >= self.capacity {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        set.insert(trace_id.to_string());
        order.push_back(trace_id.to_string());
        false
    }
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            Error::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::DownstreamIngestion(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: rejection.body_text(),
        }
    }
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "registration-service"
    }))
}

/// Register a device and queue it for ingestion
pub async fn register_device_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(request) = payload?;

    let response = state.intake.register(request).await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Get a registration by device ID
pub async fn get_device_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceRegistration>, ApiError> {
    // An ID that fails validation can never have been stored
    let found = match state.store.get(&device_id).await {
        Ok(found) => found,
        Err(Error::Validation(_)) => None,
        Err(e) => return Err(e.into()),
    };

    match found {
        Some(registration) => Ok(Json(registration)),
        None => Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: "Device not found".to_string(),
        }),
    }
}

/// List all registrations
pub async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.store.list().await?;

    Ok(Json(serde_json::json!({
        "total": devices.len(),
        "devices": devices
    })))
}

/// Re-queue a failed registration
pub async fn retry_device_handler(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    info!("Retry requested for device: {}", device_id);

    let response = state.intake.retry(&device_id).await?;

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Pending messages on a topic
pub async fn list_queue_handler(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pending = state.queue.list(&topic).await?;

    Ok(Json(serde_json::json!({
        "topic": topic,
        "supported": state.queue.supports_listing(),
        "total": pending.len(),
        "pending": pending
    })))
}

/// Local stand-in for the downstream ingestion collaborator
pub async fn mock_ingestion_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<serde_json::Value>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(payload) = payload?;

    let trace_id = payload
        .get("traceId")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "traceId is required".to_string(),
        })?;

    let duplicate = state.seen_trace_ids.check_and_insert(trace_id);
    info!(trace_id, duplicate, "Mock ingestion received payload");

    Ok(Json(serde_json::json!({
        "status": "acknowledged",
        "traceId": trace_id,
        "duplicate": duplicate,
        "receivedAt": Utc::now()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_trace_ids_detects_duplicates() {
        let seen = SeenTraceIds::new(10);
        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("a"));
        assert!(!seen.check_and_insert("b"));
    }

    #[test]
    fn test_seen_trace_ids_evicts_oldest() {
        let seen = SeenTraceIds::new(2);
        seen.check_and_insert("a");
        seen.check_and_insert("b");
        seen.check_and_insert("c");

        assert!(!seen.check_and_insert("a"));
        assert!(seen.check_and_insert("c"));
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::Validation("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::QueueUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::QueueStorage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::DownstreamIngestion("x".into()), StatusCode::BAD_GATEWAY),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
