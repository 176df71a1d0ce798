//! Integration catalog entries.
//!
//! An [`IntegrationSpec`] classifies one integration by category, auth style,
//! and risk, and records whether a native handler owns it or the generic
//! connector serves it. Specs are loaded from the registry document and are
//! immutable once a snapshot is published.

use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Classification enums
//─────────────────────────────

/// Functional grouping of integrations; native handlers register per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationCategory {
    /// Hosts, hypervisors, tunnels.
    Infrastructure,
    /// Lab and research tooling.
    Research,
    /// Payments, tokens, treasuries.
    Finance,
    /// Sensors and device fleets.
    Devices,
    /// Knowledge bases and graphs.
    Knowledge,
    /// Chat, mail, and paging targets.
    Communication,
    /// In-process agent operations.
    Agents,
    /// Anything served purely by the generic connector.
    Generic,
}

impl IntegrationCategory {
    /// Stable wire string for the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationCategory::Infrastructure => "infrastructure",
            IntegrationCategory::Research => "research",
            IntegrationCategory::Finance => "finance",
            IntegrationCategory::Devices => "devices",
            IntegrationCategory::Knowledge => "knowledge",
            IntegrationCategory::Communication => "communication",
            IntegrationCategory::Agents => "agents",
            IntegrationCategory::Generic => "generic",
        }
    }
}

/// Authentication style the connector applies to outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// No authentication.
    None,
    /// Bearer token from the credential store.
    ApiKey,
    /// HTTP Basic credentials from the credential store.
    Basic,
    /// OAuth2 bearer token; refresh is the credential store's concern.
    #[serde(rename = "oauth2")]
    OAuth2,
}

/// Risk classification driving the confirmation gate and audit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Pure reads; no side effects.
    ReadOnly,
    /// Mutating but routine.
    Write,
    /// Destructive or privileged; always requires confirmation.
    Admin,
}

impl RiskLevel {
    /// Stable wire string for the risk level.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::ReadOnly => "read_only",
            RiskLevel::Write => "write",
            RiskLevel::Admin => "admin",
        }
    }
}

//─────────────────────────────
//  Integration spec
//─────────────────────────────

fn default_enabled() -> bool {
    true
}

/// One entry in the integration registry.
///
/// Unknown document fields are preserved in `extra` but carry no semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSpec {
    /// Unique integration name, the registry key.
    pub integration: String,
    /// Functional category.
    pub category: IntegrationCategory,
    /// True when a native handler owns this integration.
    #[serde(default)]
    pub native: bool,
    /// Authentication style for the generic connector.
    #[serde(default = "AuthScheme::default_scheme")]
    pub auth: AuthScheme,
    /// Base URL for generic dispatch; required when `native` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Permitted actions; empty means any action is permitted.
    #[serde(default)]
    pub default_actions: Vec<String>,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Whether the confirmation gate applies regardless of risk.
    #[serde(default)]
    pub confirm_required: bool,
    /// Disabled entries resolve as unknown.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Unknown document fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AuthScheme {
    fn default_scheme() -> Self {
        AuthScheme::None
    }
}

impl IntegrationSpec {
    /// Whether the confirmation gate applies to this integration.
    pub fn requires_confirmation(&self) -> bool {
        self.confirm_required || self.risk == RiskLevel::Admin
    }

    /// Whether `action` passes the action permit.
    pub fn permits_action(&self, action: &str) -> bool {
        self.default_actions.is_empty() || self.default_actions.iter().any(|a| a == action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_deserializes_with_defaults_and_extras() {
        let spec: IntegrationSpec = serde_json::from_value(json!({
            "integration": "httpbin",
            "category": "generic",
            "risk": "read_only",
            "base_url": "https://httpbin.org",
            "owner_team": "platform"
        }))
        .unwrap();
        assert!(!spec.native);
        assert_eq!(spec.auth, AuthScheme::None);
        assert!(spec.enabled);
        assert!(spec.permits_action("read"));
        assert_eq!(spec.extra["owner_team"], "platform");
    }

    #[test]
    fn admin_risk_always_requires_confirmation() {
        let spec: IntegrationSpec = serde_json::from_value(json!({
            "integration": "proxmox",
            "category": "infrastructure",
            "risk": "admin",
            "confirm_required": true,
            "native": true
        }))
        .unwrap();
        assert!(spec.requires_confirmation());
    }

    #[test]
    fn default_actions_restrict_the_permit() {
        let spec: IntegrationSpec = serde_json::from_value(json!({
            "integration": "grafana",
            "category": "infrastructure",
            "risk": "read_only",
            "base_url": "https://grafana.local",
            "default_actions": ["read", "call"]
        }))
        .unwrap();
        assert!(spec.permits_action("read"));
        assert!(!spec.permits_action("delete"));
    }
}
