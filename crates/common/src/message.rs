use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic carrying device registrations
pub const DEVICE_REGISTRATIONS_TOPIC: &str = "device-registrations.v1";

/// One enqueued unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Broker-native or generated message ID
    pub id: String,

    pub topic: String,

    /// Enqueue time
    pub timestamp: DateTime<Utc>,

    pub payload: serde_json::Value,
}

impl QueueMessage {
    pub fn new(id: String, topic: &str, payload: serde_json::Value) -> Self {
        Self {
            id,
            topic: topic.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}
