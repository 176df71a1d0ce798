//! Integration registry: load, validate, and serve the integration catalog.
//!
//! The catalog is a JSON document `{ "version": ..., "integrations": [...] }`.
//! Loading is all-or-nothing: any invalid entry rejects the whole document.
//! Reload swaps an `Arc` snapshot atomically; in-flight commands keep the
//! snapshot they captured at dispatch time, so a reload never changes the
//! rules mid-command.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use mycel_types::{IntegrationCategory, IntegrationSpec, RiskLevel};

use crate::FabricError;

//─────────────────────────────
//  Document
//─────────────────────────────

/// On-disk shape of the registry document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    /// Document version string, surfaced in introspection.
    pub version: String,
    /// Catalog entries.
    pub integrations: Vec<IntegrationSpec>,
}

//─────────────────────────────
//  Snapshot
//─────────────────────────────

/// Immutable view of the catalog at one load.
#[derive(Debug)]
pub struct RegistrySnapshot {
    version: String,
    loaded_at: DateTime<Utc>,
    by_name: HashMap<String, Arc<IntegrationSpec>>,
}

impl RegistrySnapshot {
    /// Resolve an integration by name (enabled or not; the router checks
    /// `enabled` itself so the distinction can be audited).
    pub fn get(&self, integration: &str) -> Option<Arc<IntegrationSpec>> {
        self.by_name.get(integration).cloned()
    }

    /// Document version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// When this snapshot was loaded.
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Number of catalog entries.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Introspection summaries, sorted by integration name.
    pub fn summaries(&self) -> Vec<IntegrationSummary> {
        let mut entries: Vec<IntegrationSummary> = self
            .by_name
            .values()
            .map(|spec| IntegrationSummary {
                integration: spec.integration.clone(),
                category: spec.category,
                native: spec.native,
                risk: spec.risk,
                confirm_required: spec.confirm_required,
                enabled: spec.enabled,
            })
            .collect();
        entries.sort_by(|a, b| a.integration.cmp(&b.integration));
        entries
    }
}

/// Introspection row for one catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSummary {
    /// Integration name.
    pub integration: String,
    /// Functional category.
    pub category: IntegrationCategory,
    /// Whether a native handler owns it.
    pub native: bool,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Whether the confirmation gate always applies.
    pub confirm_required: bool,
    /// Whether the entry resolves at all.
    pub enabled: bool,
}

//─────────────────────────────
//  Registry
//─────────────────────────────

/// Read-mostly integration catalog with atomic hot reload.
pub struct IntegrationRegistry {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl IntegrationRegistry {
    /// Load the catalog from a JSON document at `path`.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, FabricError> {
        let path = path.into();
        let snapshot = read_snapshot(&path).await?;
        info!(path = %path.display(), entries = snapshot.len(), "integration registry loaded");
        Ok(Self { path: Some(path), snapshot: RwLock::new(Arc::new(snapshot)) })
    }

    /// Build a registry from an in-memory document (tests, embedded setups).
    pub fn from_document(document: RegistryDocument) -> Result<Self, FabricError> {
        let snapshot = build_snapshot(document)?;
        Ok(Self { path: None, snapshot: RwLock::new(Arc::new(snapshot)) })
    }

    /// Re-read the document and swap the snapshot atomically.
    ///
    /// All-or-nothing: a validation failure leaves the previous snapshot in
    /// place. Reloading an unchanged file is idempotent: the pointer is
    /// replaced but resolution behavior is identical.
    pub async fn reload(&self) -> Result<(), FabricError> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| FabricError::Registry("registry has no backing file".to_string()))?;
        let snapshot = read_snapshot(path).await?;
        info!(entries = snapshot.len(), "integration registry reloaded");
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(snapshot);
        Ok(())
    }

    /// The current snapshot. Callers hold it for the whole dispatch.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

async fn read_snapshot(path: &std::path::Path) -> Result<RegistrySnapshot, FabricError> {
    let raw = tokio::fs::read(path).await.map_err(|err| {
        FabricError::Registry(format!("cannot read '{}': {err}", path.display()))
    })?;
    let document: RegistryDocument = serde_json::from_slice(&raw)
        .map_err(|err| FabricError::Registry(format!("invalid registry document: {err}")))?;
    build_snapshot(document)
}

fn build_snapshot(document: RegistryDocument) -> Result<RegistrySnapshot, FabricError> {
    let mut by_name = HashMap::with_capacity(document.integrations.len());
    for spec in document.integrations {
        validate_spec(&spec)?;
        let name = spec.integration.clone();
        if by_name.insert(name.clone(), Arc::new(spec)).is_some() {
            return Err(FabricError::Registry(format!("duplicate integration entry '{name}'")));
        }
    }
    Ok(RegistrySnapshot { version: document.version, loaded_at: Utc::now(), by_name })
}

fn validate_spec(spec: &IntegrationSpec) -> Result<(), FabricError> {
    if spec.integration.trim().is_empty() {
        return Err(FabricError::Registry("integration name cannot be empty".to_string()));
    }
    if !spec.native {
        let base_url = spec.base_url.as_deref().ok_or_else(|| {
            FabricError::Registry(format!(
                "integration '{}' is not native and has no base_url",
                spec.integration
            ))
        })?;
        let parsed = Url::parse(base_url).map_err(|err| {
            FabricError::Registry(format!(
                "integration '{}' has invalid base_url: {err}",
                spec.integration
            ))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FabricError::Registry(format!(
                "integration '{}' base_url must be http(s)",
                spec.integration
            )));
        }
    }
    if spec.risk == RiskLevel::Admin && !spec.confirm_required {
        return Err(FabricError::Registry(format!(
            "integration '{}' is admin risk and must set confirm_required",
            spec.integration
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> IntegrationSpec {
        serde_json::from_value(value).unwrap()
    }

    fn document(integrations: Vec<IntegrationSpec>) -> RegistryDocument {
        RegistryDocument { version: "2026-07".to_string(), integrations }
    }

    #[test]
    fn resolves_entries_by_name() {
        let registry = IntegrationRegistry::from_document(document(vec![spec(json!({
            "integration": "httpbin",
            "category": "generic",
            "risk": "read_only",
            "base_url": "https://httpbin.org"
        }))]))
        .unwrap();

        let snapshot = registry.snapshot();
        assert!(snapshot.get("httpbin").is_some());
        assert!(snapshot.get("nope").is_none());
        assert_eq!(snapshot.version(), "2026-07");
    }

    #[test]
    fn non_native_without_base_url_is_rejected() {
        let result = IntegrationRegistry::from_document(document(vec![spec(json!({
            "integration": "broken",
            "category": "generic",
            "risk": "read_only"
        }))]));
        assert!(matches!(result, Err(FabricError::Registry(_))));
    }

    #[test]
    fn admin_risk_without_confirm_required_is_rejected() {
        let result = IntegrationRegistry::from_document(document(vec![spec(json!({
            "integration": "proxmox",
            "category": "infrastructure",
            "native": true,
            "risk": "admin"
        }))]));
        assert!(matches!(result, Err(FabricError::Registry(_))));
    }

    #[test]
    fn duplicate_entries_reject_the_whole_document() {
        let entry = spec(json!({
            "integration": "httpbin",
            "category": "generic",
            "risk": "read_only",
            "base_url": "https://httpbin.org"
        }));
        let result = IntegrationRegistry::from_document(document(vec![entry.clone(), entry]));
        assert!(matches!(result, Err(FabricError::Registry(_))));
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integrations.json");
        let write = |integrations: serde_json::Value| {
            let doc = json!({ "version": "v1", "integrations": integrations });
            std::fs::write(&path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
        };
        write(json!([{
            "integration": "httpbin",
            "category": "generic",
            "risk": "read_only",
            "base_url": "https://httpbin.org"
        }]));

        let registry = IntegrationRegistry::load(&path).await.unwrap();
        let before = registry.snapshot();
        assert!(before.get("grafana").is_none());

        write(json!([
            {
                "integration": "httpbin",
                "category": "generic",
                "risk": "read_only",
                "base_url": "https://httpbin.org"
            },
            {
                "integration": "grafana",
                "category": "infrastructure",
                "risk": "read_only",
                "base_url": "https://grafana.local"
            }
        ]));
        registry.reload().await.unwrap();

        // The captured snapshot is unchanged; the new one sees the entry.
        assert!(before.get("grafana").is_none());
        assert!(registry.snapshot().get("grafana").is_some());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("integrations.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({ "version": "v1", "integrations": [{
                "integration": "httpbin",
                "category": "generic",
                "risk": "read_only",
                "base_url": "https://httpbin.org"
            }] }))
            .unwrap(),
        )
        .unwrap();
        let registry = IntegrationRegistry::load(&path).await.unwrap();

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(registry.reload().await.is_err());
        assert!(registry.snapshot().get("httpbin").is_some());
    }
}
