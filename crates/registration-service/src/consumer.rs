//! Ingestion consumer - drains the registration topic into downstream ingestion

use chrono::Utc;
use ingest_common::{
    Error, QueueMessage, RegistrationPayload, RegistrationStatus, Result, TransitionDetails,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ConsumerConfig;
use crate::downstream::IngestionClient;
use crate::queue::QueueBackend;
use crate::store::RegistrationStore;

/// A `registered` record younger than this is assumed to be mid-intake
const DEFER_WINDOW_SECS: i64 = 30;

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Downstream acknowledged the registration
    Acknowledged {
        result: serde_json::Value,
        attempts: u32,
    },
    /// Retries exhausted; the record is `failed`
    Failed { error: String, attempts: u32 },
    /// Redelivery for a record that is already settled
    Skipped { status: RegistrationStatus },
    /// Intake has not recorded `queued` yet; the message went back on the queue
    Deferred,
}

impl ProcessOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Acknowledged { .. })
    }
}

/// Single-worker consumer for one topic
pub struct IngestionConsumer {
    store: Arc<RegistrationStore>,
    queue: Arc<dyn QueueBackend>,
    client: Arc<dyn IngestionClient>,
    topic: String,
    max_retries: u32,
    retry_base_delay: Duration,
    poll_interval: Duration,
    processing_lease: Option<Duration>,
}

impl IngestionConsumer {
    pub fn new(
        store: Arc<RegistrationStore>,
        queue: Arc<dyn QueueBackend>,
        client: Arc<dyn IngestionClient>,
        topic: impl Into<String>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            client,
            topic: topic.into(),
            max_retries: config.max_retries.max(1),
            retry_base_delay: config.retry_base_delay,
            poll_interval: config.poll_interval,
            processing_lease: config.processing_lease,
        }
    }

    /// Poll until `cancel` fires.
    ///
    /// Cancellation is only observed between polls; a delivery in progress,
    /// including its backoff sleeps, runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            topic = %self.topic,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Ingestion consumer started, polling for messages..."
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Received shutdown signal, stopping consumer");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Consumer error");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        if self.processing_lease.is_some() {
            self.sweep_stale_processing().await?;
        }
        self.poll_once().await?;
        Ok(())
    }

    /// Dequeue at most one message and process it
    pub async fn poll_once(&self) -> Result<Option<ProcessOutcome>> {
        match self.queue.dequeue(&self.topic).await? {
            Some(message) => self.process_message(&message, 0).await.map(Some),
            None => Ok(None),
        }
    }

    /// Forward one message downstream, retrying with exponential backoff.
    ///
    /// `retry_count` is the number of attempts already spent on this delivery.
    pub async fn process_message(
        &self,
        message: &QueueMessage,
        retry_count: u32,
    ) -> Result<ProcessOutcome> {
        let payload: RegistrationPayload = serde_json::from_value(message.payload.clone())
            .map_err(|e| {
                error!(message_id = %message.id, error = %e, "Dropping undecodable payload");
                Error::Validation(format!("Undecodable payload in message {}: {}", message.id, e))
            })?;
        let device_id = payload.device_id.as_str();

        let record = self
            .store
            .get(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device not found: {}", device_id)))?;

        match record.status() {
            RegistrationStatus::Queued => {
                self.store
                    .transition(
                        device_id,
                        RegistrationStatus::Processing,
                        TransitionDetails {
                            processing_started_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            RegistrationStatus::Processing => {
                warn!(device_id, message_id = %message.id, "Resuming registration left in processing");
            }
            RegistrationStatus::Registered
                if (Utc::now() - record.created_at).num_seconds() < DEFER_WINDOW_SECS =>
            {
                let requeued = self
                    .queue
                    .enqueue(&message.topic, message.payload.clone())
                    .await?;
                warn!(
                    device_id,
                    message_id = %message.id,
                    requeued_id = %requeued.id,
                    "Registration not queued yet, deferred"
                );

                self.store
                    .annotate(
                        device_id,
                        TransitionDetails {
                            queue_message_id: Some(requeued.id),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(ProcessOutcome::Deferred);
            }
            status => {
                info!(device_id, message_id = %message.id, %status, "Skipping redelivered message");
                return Ok(ProcessOutcome::Skipped { status });
            }
        }

        let mut retry = retry_count;
        loop {
            let attempt = retry + 1;
            info!(device_id, message_id = %message.id, attempt, "Processing message");

            match self.client.ingest(&message.payload).await {
                Ok(result) => {
                    self.store
                        .transition(
                            device_id,
                            RegistrationStatus::Acknowledged,
                            TransitionDetails {
                                acknowledged_at: Some(Utc::now()),
                                ingestion_result: Some(result.clone()),
                                processing_attempts: Some(attempt),
                                ..Default::default()
                            },
                        )
                        .await?;

                    info!(device_id, message_id = %message.id, attempt, "Message acknowledged");
                    return Ok(ProcessOutcome::Acknowledged {
                        result,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(device_id, attempt, error = %e, "Downstream ingestion failed");

                    if retry + 1 < self.max_retries {
                        let delay = self.backoff(retry);
                        info!(device_id, delay_ms = delay.as_millis() as u64, "Retrying");
                        sleep(delay).await;
                        retry += 1;
                        continue;
                    }

                    let error = e.to_string();
                    self.store
                        .transition(
                            device_id,
                            RegistrationStatus::Failed,
                            TransitionDetails {
                                failed_at: Some(Utc::now()),
                                error: Some(error.clone()),
                                processing_attempts: Some(attempt),
                                ..Default::default()
                            },
                        )
                        .await?;

                    error!(device_id, message_id = %message.id, attempts = attempt, "Max retries exceeded");
                    return Ok(ProcessOutcome::Failed {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// `base * 2^retry`
    fn backoff(&self, retry: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(retry))
    }

    /// Fail records stuck in `processing` longer than the lease.
    ///
    /// Returns how many records were failed.
    pub async fn sweep_stale_processing(&self) -> Result<usize> {
        let Some(lease) = self.processing_lease else {
            return Ok(0);
        };

        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Other(anyhow::anyhow!("Invalid processing lease: {}", e)))?;
        let stale = self.store.find_stale_processing(Utc::now() - lease).await?;

        let mut failed = 0;
        for record in stale {
            let result = self
                .store
                .transition(
                    &record.device_id,
                    RegistrationStatus::Failed,
                    TransitionDetails {
                        failed_at: Some(Utc::now()),
                        error: Some("processing lease expired".to_string()),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => {
                    warn!(device_id = %record.device_id, "Processing lease expired, marked failed");
                    failed += 1;
                }
                Err(e) => error!(device_id = %record.device_id, error = %e, "Failed to expire processing lease"),
            }
        }

        Ok(failed)
    }
}
