#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-types** – Shared primitive data structures for Mycel.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the command/response envelopes of the integration fabric, the
//! integration catalog entries, the audit and event records, and the agent
//! descriptors consumed by the orchestrator. It intentionally makes no
//! assumptions about I/O, networking, or storage.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Validation ceilings
//─────────────────────────────

/// Maximum allowed length for identifier-like fields (request ids, actors,
/// integration and action names) to prevent memory exhaustion.
pub const MAX_IDENT_LEN: usize = 128;

/// Maximum serialized size for command parameters.
pub const MAX_PARAMS_LEN: usize = 262_144; // 256 KiB

/// Maximum serialized size for event payloads.
pub const MAX_EVENT_DATA_LEN: usize = 262_144; // 256 KiB

//─────────────────────────────
//  Submodules
//─────────────────────────────

/// Command envelope, response envelope, and the stable error-code set.
pub mod command;
/// Integration catalog entries: category, auth scheme, risk classification.
pub mod integration;
/// Immutable audit trail records.
pub mod audit;
/// Event intake records and severities.
pub mod event;

pub use audit::{AuditQuery, AuditRecord, AuditStatus};
pub use command::{Command, CommandResponse, CommandStatus, ErrorBody, ErrorCode};
pub use event::{EventRecord, EventSeverity, EventSubmission};
pub use integration::{AuthScheme, IntegrationCategory, IntegrationSpec, RiskLevel};

//─────────────────────────────
//  Core identifiers
//─────────────────────────────

/// Stable identifier of a registered agent.
///
/// Agent ids come from the service configuration (e.g. `mycology_bio`,
/// `treasury`) and never change after registration, so they double as
/// directory names for agent-owned storage and as graph node ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Generate a fresh UUID v4 string for record/audit/event identifiers.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

//─────────────────────────────
//  Agent descriptors
//─────────────────────────────

/// Broad classification of an agent, used for display and routing only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Biological research records and experiment pipelines.
    Bio,
    /// Token pools, staking, and reward distribution.
    Treasury,
    /// Knowledge graph curation.
    Knowledge,
    /// Device telemetry intake.
    Telemetry,
    /// Deployment-specific agent kind.
    Custom(String),
}

/// Immutable description of an agent, fixed at registration time.
///
/// The `config` value is opaque to the framework and handed verbatim to the
/// agent factory. `dependencies` declare the startup ordering edges surfaced
/// by the topology graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Stable agent id, unique within the orchestrator.
    pub id: AgentId,
    /// Human-readable name.
    pub name: String,
    /// Agent classification.
    pub kind: AgentKind,
    /// Opaque builder configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Agents that must be running before this one starts.
    #[serde(default)]
    pub dependencies: Vec<AgentId>,
}

impl AgentDescriptor {
    /// Validate the descriptor shape.
    ///
    /// Rejects empty ids/names, oversized identifiers, and self-dependencies.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.as_str().trim().is_empty() {
            return Err("agent id cannot be empty".to_string());
        }
        if self.id.as_str().len() > MAX_IDENT_LEN {
            return Err(format!(
                "agent id too long: {} > {}",
                self.id.as_str().len(),
                MAX_IDENT_LEN
            ));
        }
        if self.name.trim().is_empty() {
            return Err("agent name cannot be empty".to_string());
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(format!("agent '{}' cannot depend on itself", self.id));
        }
        Ok(())
    }
}
