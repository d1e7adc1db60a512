//! Redis-backed queue: one list per topic

use async_trait::async_trait;
use ingest_common::{Error, QueueMessage, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::QueueBackend;

/// Remote broker backend
pub struct BrokerQueue {
    client: redis::Client,
    sender: ConnectionManager,
    receive_wait: Duration,
}

impl BrokerQueue {
    /// Connect to the broker. Fails with `QueueUnavailable` if it cannot be reached.
    pub async fn connect(url: &str, receive_wait: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;

        let sender = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;

        info!("Connected to queue broker at {}", url);

        Ok(Self {
            client,
            sender,
            receive_wait,
        })
    }
}

fn topic_key(topic: &str) -> String {
    format!("queue:{}", topic)
}

fn unavailable(err: redis::RedisError) -> Error {
    Error::QueueUnavailable(err.to_string())
}

#[async_trait]
impl QueueBackend for BrokerQueue {
    async fn enqueue(&self, topic: &str, payload: serde_json::Value) -> Result<QueueMessage> {
        let message = QueueMessage::new(Uuid::new_v4().to_string(), topic, payload);
        let body = serde_json::to_string(&message)?;

        let mut sender = self.sender.clone();
        let _: usize = sender
            .rpush(topic_key(topic), body)
            .await
            .map_err(unavailable)?;

        debug!(topic, message_id = %message.id, "Sent message to broker");
        Ok(message)
    }

    async fn dequeue(&self, topic: &str) -> Result<Option<QueueMessage>> {
        // Dedicated connection so a blocking receive never stalls senders
        let mut receiver = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        // BLPOP removes the message, which completes it on the broker.
        // A zero timeout would block forever.
        let wait = self.receive_wait.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> = receiver
            .blpop(topic_key(topic), wait)
            .await
            .map_err(unavailable)?;

        match popped {
            Some((_, body)) => {
                let message: QueueMessage = serde_json::from_str(&body).map_err(|e| {
                    Error::QueueStorage(format!("Undecodable message on {}: {}", topic, e))
                })?;
                debug!(topic, message_id = %message.id, "Received message from broker");
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, topic: &str) -> Result<Vec<QueueMessage>> {
        warn!(topic, "list() is not supported by the broker backend");
        Ok(Vec::new())
    }

    fn supports_listing(&self) -> bool {
        false
    }

    fn kind(&self) -> &'static str {
        "broker"
    }
}
