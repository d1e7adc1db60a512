//! Registration status lifecycle
//!
//! ```text
//! registered -> queued -> processing -> acknowledged
//!                 |            |
//!                 +--> failed <+
//!                        |
//!                        +--> queued
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a device registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Persisted, not yet handed to the queue
    Registered,
    /// A queue message is in flight
    Queued,
    /// The consumer is forwarding it downstream
    Processing,
    /// Downstream ingestion confirmed it (terminal)
    Acknowledged,
    /// Retries exhausted; may re-enter `Queued`
    Failed,
}

impl RegistrationStatus {
    /// Statuses reachable from `self` in one step
    pub fn allowed_transitions(self) -> &'static [RegistrationStatus] {
        use RegistrationStatus::*;
        match self {
            Registered => &[Queued],
            Queued => &[Processing, Failed],
            Processing => &[Acknowledged, Failed],
            Acknowledged => &[],
            Failed => &[Queued],
        }
    }

    pub fn can_transition_to(self, next: RegistrationStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegistrationStatus::Registered => "registered",
            RegistrationStatus::Queued => "queued",
            RegistrationStatus::Processing => "processing",
            RegistrationStatus::Acknowledged => "acknowledged",
            RegistrationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
