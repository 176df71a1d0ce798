//! Service configuration.
//!
//! One document describes the whole deployment: store locations, the
//! registry path, the HTTP bind address, per-path concurrency limits,
//! credentials, and the agent list with builder arguments. Values can be
//! overridden from the environment with the `MYCEL__` prefix
//! (e.g. `MYCEL__HTTP__BIND`). Agents are not reconfigurable at runtime;
//! the document is read once at boot.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use mycel_fabric::CredentialEntry;
use mycel_types::{AgentDescriptor, AgentId, AgentKind};

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_command_concurrency() -> usize {
    64
}

fn default_event_concurrency() -> usize {
    128
}

fn default_stop_deadline_secs() -> u64 {
    30
}

fn default_init_retries() -> u32 {
    3
}

/// HTTP edge settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Socket address to bind.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Concurrency limit for `POST /command`.
    #[serde(default = "default_command_concurrency")]
    pub command_concurrency: usize,
    /// Concurrency limit for `POST /event`.
    #[serde(default = "default_event_concurrency")]
    pub event_concurrency: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            command_concurrency: default_command_concurrency(),
            event_concurrency: default_event_concurrency(),
        }
    }
}

/// Store locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (audit + events tables).
    pub db_path: PathBuf,
    /// Append-only audit JSONL path.
    pub audit_log_path: PathBuf,
    /// Root directory for agent-owned data directories.
    pub data_root: PathBuf,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Global `stop_all` deadline in seconds.
    #[serde(default = "default_stop_deadline_secs")]
    pub stop_deadline_secs: u64,
    /// `initialize` attempts per agent.
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            stop_deadline_secs: default_stop_deadline_secs(),
            init_retries: default_init_retries(),
        }
    }
}

/// One agent entry in the configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    /// Stable agent id.
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Builder kind: `bio` or `treasury`.
    pub kind: String,
    /// Opaque builder arguments.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Agents that must be running first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl AgentEntry {
    /// Convert the entry into a registration descriptor.
    pub fn descriptor(&self) -> Result<AgentDescriptor> {
        let kind = match self.kind.as_str() {
            "bio" => AgentKind::Bio,
            "treasury" => AgentKind::Treasury,
            other => AgentKind::Custom(other.to_string()),
        };
        let descriptor = AgentDescriptor {
            id: AgentId::from(self.id.as_str()),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            kind,
            config: self.config.clone(),
            dependencies: self.dependencies.iter().map(|d| AgentId::from(d.as_str())).collect(),
        };
        descriptor
            .validate()
            .map_err(|reason| anyhow::anyhow!("agent '{}': {reason}", self.id))?;
        Ok(descriptor)
    }
}

/// The whole service configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// HTTP edge settings.
    #[serde(default)]
    pub http: HttpConfig,
    /// Store locations.
    pub store: StoreConfig,
    /// Path to the integration registry JSON document.
    pub registry_path: PathBuf,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Per-integration credentials.
    #[serde(default)]
    pub credentials: HashMap<String, CredentialEntry>,
    /// Agents to register at boot.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

impl ServiceConfig {
    /// Load the configuration from `path`, with `MYCEL__`-prefixed
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MYCEL").separator("__"))
            .build()
            .with_context(|| format!("failed to read configuration from {path}"))?;
        settings
            .try_deserialize()
            .context("configuration document has an invalid shape")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_document_parses_with_defaults() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "store": {
                "db_path": "data/mycel.db",
                "audit_log_path": "data/audit.jsonl",
                "data_root": "data/agents"
            },
            "registry_path": "config/integrations.json",
            "agents": [
                { "id": "mycology_bio", "kind": "bio" },
                { "id": "treasury", "kind": "treasury", "dependencies": ["mycology_bio"] }
            ]
        }))
        .unwrap();

        assert_eq!(config.http.bind, "0.0.0.0:8080");
        assert_eq!(config.orchestrator.init_retries, 3);
        assert_eq!(config.agents.len(), 2);

        let descriptor = config.agents[1].descriptor().unwrap();
        assert_eq!(descriptor.kind, AgentKind::Treasury);
        assert_eq!(descriptor.dependencies, vec![AgentId::from("mycology_bio")]);
    }

    #[test]
    fn invalid_agent_entry_is_rejected() {
        let entry = AgentEntry {
            id: String::new(),
            name: None,
            kind: "bio".to_string(),
            config: serde_json::Value::Null,
            dependencies: Vec::new(),
        };
        assert!(entry.descriptor().is_err());
    }
}
