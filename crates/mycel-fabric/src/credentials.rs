//! Credential storage for outbound integrations.
//!
//! Credential material is wrapped in [`secrecy::Secret`] so it never appears
//! in logs or debug output. The connector requests a credential per call and
//! never caches it; OAuth2 token refresh is the store's concern, not the
//! connector's.

use std::collections::HashMap;

use secrecy::Secret;
use serde::Deserialize;

//─────────────────────────────
//  Credential shapes
//─────────────────────────────

/// One credential, matched to the integration's auth scheme.
pub enum Credential {
    /// Bearer token for `api_key` auth.
    ApiKey(Secret<String>),
    /// Username/password for HTTP Basic auth.
    Basic {
        /// Basic-auth username.
        username: String,
        /// Basic-auth password.
        password: Secret<String>,
    },
    /// Current OAuth2 bearer token; refreshed by the store out of band.
    OAuth2Token(Secret<String>),
}

/// Store of per-integration credentials.
pub trait CredentialStore: Send + Sync {
    /// Fetch the credential for `integration`, if any is configured.
    fn credential(&self, integration: &str) -> Option<Credential>;
}

//─────────────────────────────
//  Config-backed store
//─────────────────────────────

/// One entry in the service configuration's credential table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum CredentialEntry {
    /// `scheme = "api_key"`.
    ApiKey {
        /// The bearer token value.
        key: String,
    },
    /// `scheme = "basic"`.
    Basic {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// `scheme = "oauth2"`.
    Oauth2 {
        /// Current access token.
        token: String,
    },
}

/// Credential store backed by the service configuration document.
#[derive(Default)]
pub struct ConfigCredentialStore {
    entries: HashMap<String, CredentialEntry>,
}

impl ConfigCredentialStore {
    /// Build the store from configuration entries keyed by integration name.
    pub fn new(entries: HashMap<String, CredentialEntry>) -> Self {
        Self { entries }
    }

    /// Insert or replace one entry (tests, dynamic provisioning).
    pub fn insert(&mut self, integration: impl Into<String>, entry: CredentialEntry) {
        self.entries.insert(integration.into(), entry);
    }
}

impl CredentialStore for ConfigCredentialStore {
    fn credential(&self, integration: &str) -> Option<Credential> {
        self.entries.get(integration).map(|entry| match entry {
            CredentialEntry::ApiKey { key } => Credential::ApiKey(Secret::new(key.clone())),
            CredentialEntry::Basic { username, password } => Credential::Basic {
                username: username.clone(),
                password: Secret::new(password.clone()),
            },
            CredentialEntry::Oauth2 { token } => Credential::OAuth2Token(Secret::new(token.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn entries_deserialize_by_scheme_tag() {
        let entry: CredentialEntry = serde_json::from_value(serde_json::json!({
            "scheme": "api_key",
            "key": "tok-123"
        }))
        .unwrap();
        assert!(matches!(entry, CredentialEntry::ApiKey { .. }));
    }

    #[test]
    fn store_resolves_by_integration_name() {
        let mut store = ConfigCredentialStore::default();
        store.insert("grafana", CredentialEntry::ApiKey { key: "tok-123".to_string() });
        store.insert(
            "registry",
            CredentialEntry::Basic { username: "svc".to_string(), password: "pw".to_string() },
        );

        match store.credential("grafana") {
            Some(Credential::ApiKey(secret)) => assert_eq!(secret.expose_secret(), "tok-123"),
            _ => panic!("expected api key credential"),
        }
        assert!(store.credential("unknown").is_none());
    }
}
