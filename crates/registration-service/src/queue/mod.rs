//! Durable append/pop queue over named topics
//!
//! Two interchangeable backends share one contract: a Redis-backed broker
//! and a directory of JSON files. One backend is built at startup and
//! shared for the lifetime of the process.

mod broker;
mod local;

pub use broker::BrokerQueue;
pub use local::LocalQueue;

use async_trait::async_trait;
use ingest_common::{QueueMessage, Result};
use std::sync::Arc;
use tracing::info;

use crate::config::QueueBackendConfig;

#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Append a message to `topic`
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<QueueMessage>;

    /// Remove and return the oldest message, acknowledging it
    async fn dequeue(&self, topic: &str) -> Result<Option<QueueMessage>>;

    /// Pending messages on `topic`.
    ///
    /// Best-effort: when [`QueueBackend::supports_listing`] is false the
    /// empty result means "unknown", not "empty topic".
    async fn list(&self, topic: &str) -> Result<Vec<QueueMessage>>;

    fn supports_listing(&self) -> bool;

    /// Short backend name for logs
    fn kind(&self) -> &'static str;
}

/// Build the single queue backend selected by configuration
pub async fn connect(config: &QueueBackendConfig) -> Result<Arc<dyn QueueBackend>> {
    let backend: Arc<dyn QueueBackend> = match config {
        QueueBackendConfig::Broker { url, receive_wait } => {
            Arc::new(BrokerQueue::connect(url, *receive_wait).await?)
        }
        QueueBackendConfig::Local { dir } => Arc::new(LocalQueue::new(dir)),
    };

    info!(backend = backend.kind(), "Queue backend selected");
    Ok(backend)
}
