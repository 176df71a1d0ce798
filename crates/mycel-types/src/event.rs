//! Event intake records.
//!
//! External sources (agents, devices, webhooks) submit events which are
//! persisted in insertion order; critical events are additionally fanned out
//! on the `event.critical` bus topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::MAX_EVENT_DATA_LEN;

/// Event severity; `Critical` triggers immediate fan-out to alert subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// Routine information.
    Info,
    /// Degraded but operating.
    Warn,
    /// Requires attention; fanned out on `event.critical`.
    Critical,
}

impl EventSeverity {
    /// Stable wire string for the severity.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warn => "warn",
            EventSeverity::Critical => "critical",
        }
    }
}

/// Inbound event submission, before an id and timestamp are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubmission {
    /// Originating source (e.g. `agent.mycology_bio`, `device.bme688-12`).
    pub source: String,
    /// Source-defined event type.
    pub event_type: String,
    /// Severity; defaults to `info`.
    #[serde(default = "EventSeverity::default_severity")]
    pub severity: EventSeverity,
    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventSeverity {
    fn default_severity() -> Self {
        EventSeverity::Info
    }
}

impl EventSubmission {
    /// Validate the submission: `source` and `event_type` are required, and
    /// the payload is size-capped.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source is required".to_string());
        }
        if self.event_type.trim().is_empty() {
            return Err("event_type is required".to_string());
        }
        let data_len = serde_json::to_vec(&self.data).map(|b| b.len()).unwrap_or(0);
        if data_len > MAX_EVENT_DATA_LEN {
            return Err(format!("data too large: {data_len} > {MAX_EVENT_DATA_LEN}"));
        }
        Ok(())
    }
}

/// Persisted event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Record id (UUID v4).
    pub id: String,
    /// Intake timestamp.
    pub timestamp: DateTime<Utc>,
    /// Originating source.
    pub source: String,
    /// Source-defined event type.
    pub event_type: String,
    /// Severity.
    pub severity: EventSeverity,
    /// Optional correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event payload.
    pub data: serde_json::Value,
    /// Whether an alert subscriber has acknowledged the event.
    pub handled: bool,
}

impl EventRecord {
    /// Assign an id and timestamp to an accepted submission.
    pub fn from_submission(submission: EventSubmission) -> Self {
        Self {
            id: crate::new_id(),
            timestamp: Utc::now(),
            source: submission.source,
            event_type: submission.event_type,
            severity: submission.severity,
            correlation_id: submission.correlation_id,
            data: submission.data,
            handled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submission_requires_source_and_type() {
        let sub: EventSubmission = serde_json::from_value(json!({
            "source": "",
            "event_type": "contamination"
        }))
        .unwrap();
        assert_eq!(sub.validate().unwrap_err(), "source is required");
    }

    #[test]
    fn severity_defaults_to_info() {
        let sub: EventSubmission = serde_json::from_value(json!({
            "source": "device.bme688-12",
            "event_type": "telemetry"
        }))
        .unwrap();
        assert_eq!(sub.severity, EventSeverity::Info);
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn record_adopts_submission_fields() {
        let sub: EventSubmission = serde_json::from_value(json!({
            "source": "agent.mycology_bio",
            "event_type": "contamination",
            "severity": "critical",
            "data": { "id": "c42" }
        }))
        .unwrap();
        let record = EventRecord::from_submission(sub);
        assert_eq!(record.severity, EventSeverity::Critical);
        assert_eq!(record.data["id"], "c42");
        assert!(!record.handled);
    }
}
