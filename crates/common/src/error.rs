use thiserror::Error;

use crate::status::RegistrationStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for device {device_id}: {from} -> {to}")]
    InvalidTransition {
        device_id: String,
        from: RegistrationStatus,
        to: RegistrationStatus,
    },

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Queue storage error: {0}")]
    QueueStorage(String),

    #[error("Registration storage error: {0}")]
    Storage(String),

    #[error("Downstream ingestion error: {0}")]
    DownstreamIngestion(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
