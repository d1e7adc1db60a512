//! Registration Service
//!
//! Accepts device registrations, persists them, and hands them to a queue.
//! A single consumer drains the queue into a downstream ingestion endpoint,
//! driving each registration through its status lifecycle.

pub mod config;
pub mod consumer;
pub mod downstream;
pub mod handlers;
pub mod intake;
pub mod queue;
pub mod store;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, ConsumerConfig, QueueBackendConfig};
pub use consumer::{IngestionConsumer, ProcessOutcome};
pub use downstream::{HttpIngestionClient, IngestionClient};
pub use handlers::AppState;
pub use intake::{RegisterRequest, RegisterResponse, RegistrationIntake};
pub use queue::{BrokerQueue, LocalQueue, QueueBackend};
pub use store::RegistrationStore;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/devices", get(handlers::list_devices_handler))
        .route(
            "/api/devices/register",
            post(handlers::register_device_handler),
        )
        .route(
            "/api/devices/{device_id}",
            get(handlers::get_device_handler),
        )
        .route(
            "/api/devices/{device_id}/retry",
            post(handlers::retry_device_handler),
        )
        .route("/api/queue/{topic}", get(handlers::list_queue_handler))
        .route(
            "/api/ingestion/mock",
            post(handlers::mock_ingestion_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
