//! Error events as delivered by the telemetry side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed failure on one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    #[serde(alias = "errorType")]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        service: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            service: service.into(),
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Milliseconds from `earlier` to this event; negative if this event
    /// happened first.
    pub fn millis_since(&self, earlier: &ErrorEvent) -> i64 {
        (self.timestamp - earlier.timestamp).num_milliseconds()
    }
}

/// Stable chronological sort: ties keep their input order.
pub fn sort_chronologically(events: &mut [ErrorEvent]) {
    events.sort_by_key(|e| e.timestamp);
}
