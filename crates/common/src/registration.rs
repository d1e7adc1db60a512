//! Device registration records and the payload handed to the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::status::RegistrationStatus;

/// One persisted registration attempt for a physical device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Canonical device ID (primary key, immutable)
    pub device_id: String,

    /// Lowercase hex SHA-256 of the raw hardware identifier
    pub hardware_id_hash: String,

    pub model: String,

    pub firmware_version: Option<String>,

    pub location: Option<serde_json::Value>,

    /// Client-reported registration time
    pub reported_at: DateTime<Utc>,

    pub initial_telemetry: Option<serde_json::Value>,

    pub source: Option<String>,

    status: RegistrationStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,

    /// ID of the in-flight queue message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_message_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    /// Response body from downstream ingestion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingestion_result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_attempts: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceRegistration {
    /// Create a new record in the `registered` status
    pub fn new(device_id: String, hardware_id_hash: String, model: String) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            hardware_id_hash,
            model,
            firmware_version: None,
            location: None,
            reported_at: now,
            initial_telemetry: None,
            source: None,
            status: RegistrationStatus::Registered,
            created_at: now,
            updated_at: now,
            queued_at: None,
            queue_message_id: None,
            processing_started_at: None,
            acknowledged_at: None,
            failed_at: None,
            ingestion_result: None,
            processing_attempts: None,
            error: None,
        }
    }

    pub fn status(&self) -> RegistrationStatus {
        self.status
    }

    /// Move to `to` if the edge is declared, merging `details` into the record.
    ///
    /// The record is left untouched when the edge is not declared.
    pub fn apply_transition(
        &mut self,
        to: RegistrationStatus,
        details: TransitionDetails,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                device_id: self.device_id.clone(),
                from: self.status,
                to,
            });
        }

        if matches!(
            to,
            RegistrationStatus::Queued | RegistrationStatus::Acknowledged
        ) {
            self.error = None;
        }

        self.status = to;
        self.merge_details(details, now);

        Ok(())
    }

    /// Merge `details` without changing the status
    pub fn merge_details(&mut self, details: TransitionDetails, now: DateTime<Utc>) {
        self.updated_at = now;
        details.merge_into(self);
    }
}

/// Fields merged into a record alongside a status transition.
///
/// Every `Some` field overwrites the record's value.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetails {
    pub queued_at: Option<DateTime<Utc>>,
    pub queue_message_id: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub ingestion_result: Option<serde_json::Value>,
    pub processing_attempts: Option<u32>,
    pub error: Option<String>,
}

impl TransitionDetails {
    fn merge_into(self, record: &mut DeviceRegistration) {
        if let Some(v) = self.queued_at {
            record.queued_at = Some(v);
        }
        if let Some(v) = self.queue_message_id {
            record.queue_message_id = Some(v);
        }
        if let Some(v) = self.processing_started_at {
            record.processing_started_at = Some(v);
        }
        if let Some(v) = self.acknowledged_at {
            record.acknowledged_at = Some(v);
        }
        if let Some(v) = self.failed_at {
            record.failed_at = Some(v);
        }
        if let Some(v) = self.ingestion_result {
            record.ingestion_result = Some(v);
        }
        if let Some(v) = self.processing_attempts {
            record.processing_attempts = Some(v);
        }
        if let Some(v) = self.error {
            record.error = Some(v);
        }
    }
}

/// Denormalized snapshot of a registration carried by a queue message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    pub device_id: String,
    pub hardware_id_hash: String,
    pub model: String,
    pub firmware_version: Option<String>,
    pub location: Option<serde_json::Value>,
    pub reported_at: DateTime<Utc>,
    pub initial_telemetry: Option<serde_json::Value>,
    pub source: Option<String>,

    /// Idempotency key for downstream processing
    pub trace_id: String,
}

impl RegistrationPayload {
    pub fn from_registration(registration: &DeviceRegistration, trace_id: String) -> Self {
        Self {
            device_id: registration.device_id.clone(),
            hardware_id_hash: registration.hardware_id_hash.clone(),
            model: registration.model.clone(),
            firmware_version: registration.firmware_version.clone(),
            location: registration.location.clone(),
            reported_at: registration.reported_at,
            initial_telemetry: registration.initial_telemetry.clone(),
            source: registration.source.clone(),
            trace_id,
        }
    }
}
