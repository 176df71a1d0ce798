//! Immutable audit trail records.
//!
//! One [`AuditRecord`] is written per terminal command outcome, to both the
//! relational `audit` table and the append-only JSONL file. Records are never
//! mutated; intermediate routing decisions live in `metadata`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::integration::{IntegrationCategory, RiskLevel};

/// Terminal status recorded for a routed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    /// Dispatch succeeded.
    Ok,
    /// Dispatch failed.
    Error,
    /// Policy refused the command before dispatch.
    Denied,
}

impl AuditStatus {
    /// Stable wire string for the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Ok => "ok",
            AuditStatus::Error => "error",
            AuditStatus::Denied => "denied",
        }
    }
}

/// One immutable audit trail entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record id (UUID v4).
    pub id: String,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Caller's request id.
    pub request_id: String,
    /// Requesting principal.
    pub actor: String,
    /// Target integration.
    pub integration: String,
    /// Requested action.
    pub action: String,
    /// Integration category at dispatch time, when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<IntegrationCategory>,
    /// SHA-256 of the canonical-JSON parameters.
    pub params_hash: String,
    /// SHA-256 of the canonical-JSON response payload.
    pub response_hash: String,
    /// Terminal status.
    pub status: AuditStatus,
    /// Wall-clock dispatch duration in milliseconds.
    pub duration_ms: u64,
    /// Failure message on error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Risk classification at dispatch time, when resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    /// Whether the caller supplied `confirm=true`.
    pub confirmed: bool,
    /// Caller correlation id, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Intermediate routing decisions (e.g. `native_missing`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Filter for audit queries; all clauses are conjunctive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Match a single actor.
    #[serde(default)]
    pub actor: Option<String>,
    /// Match a single integration.
    #[serde(default)]
    pub integration: Option<String>,
    /// Match a terminal status.
    #[serde(default)]
    pub status: Option<AuditStatus>,
    /// Inclusive lower bound on `timestamp`.
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `timestamp`.
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    /// Maximum rows returned, newest first.
    #[serde(default)]
    pub limit: Option<u32>,
}
