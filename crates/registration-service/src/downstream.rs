//! Client for the downstream ingestion collaborator

use async_trait::async_trait;
use ingest_common::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Value of `status` that marks a successful ingestion
pub const ACKNOWLEDGED: &str = "acknowledged";

#[async_trait]
pub trait IngestionClient: Send + Sync {
    /// Forward one payload. `Ok` carries the acknowledging response body;
    /// anything else is a `DownstreamIngestion` error.
    async fn ingest(&self, payload: &serde_json::Value) -> Result<serde_json::Value>;
}

/// HTTP implementation: `POST <endpoint>` with the payload as the JSON body
pub struct HttpIngestionClient {
    endpoint: String,
    http_client: reqwest::Client,
}

impl HttpIngestionClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DownstreamIngestion(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: endpoint.into(),
            http_client,
        })
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn ingest(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::DownstreamIngestion(format!("Request failed: {}", e)))?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        debug!(endpoint = %self.endpoint, %status, "Downstream ingestion responded");

        if status.is_success() && body.get("status").and_then(|s| s.as_str()) == Some(ACKNOWLEDGED)
        {
            return Ok(body);
        }

        let reason = body
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or("Unknown error");
        Err(Error::DownstreamIngestion(format!(
            "Ingestion failed: {} - {}",
            status.as_u16(),
            reason
        )))
    }
}
