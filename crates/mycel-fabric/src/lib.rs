#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-fabric** – Integration fabric for Mycel.
//!
//! The fabric turns a uniform [`Command`](mycel_types::Command) envelope into
//! an outcome with full auditability:
//!
//! - [`IntegrationRegistry`]: typed catalog of integrations loaded from a
//!   JSON document, hot-reloadable via atomic snapshot swap.
//! - [`CommandRouter`]: schema gate → registry resolve → action permit →
//!   confirmation gate → dispatch → audit-before-respond.
//! - [`HttpConnector`]: uniform HTTP caller for integrations without a
//!   native handler, with per-scheme authentication and bounded retries.
//! - [`AuditLogger`]: dual-sink immutable trail (relational table plus
//!   append-only JSONL) with canonical SHA-256 hashes.
//! - [`EventIntake`]: validated event persistence with critical-severity
//!   fan-out on the bus.

use mycel_types::ErrorCode;

mod audit;
mod connector;
mod credentials;
mod events;
mod registry;
mod router;

pub use audit::AuditLogger;
pub use connector::{HttpConnector, RetryPolicy};
pub use credentials::{ConfigCredentialStore, Credential, CredentialEntry, CredentialStore};
pub use events::{EventIntake, FanoutPolicy};
pub use registry::{IntegrationRegistry, IntegrationSummary, RegistryDocument, RegistrySnapshot};
pub use router::{CommandRouter, NativeHandler, RouterConfig};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Typed failures inside the fabric. The router converts these into command
/// responses with a stable [`ErrorCode`]; original details go into the audit
/// record's metadata, never into the response body.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// The envelope or submission failed validation.
    #[error("schema violation: {0}")]
    Schema(String),
    /// The registry document is invalid or cannot be loaded.
    #[error("registry error: {0}")]
    Registry(String),
    /// The integration does not exist or is disabled.
    #[error("unknown integration '{0}'")]
    UnknownIntegration(String),
    /// The action is not in the integration's permitted set.
    #[error("action '{action}' not permitted for integration '{integration}'")]
    ActionNotPermitted {
        /// Target integration.
        integration: String,
        /// Refused action.
        action: String,
    },
    /// Confirmation was required but not supplied.
    #[error("confirmation required for integration '{0}'")]
    ConfirmationRequired(String),
    /// Authentication missing or rejected by the target.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// A required parameter is missing or malformed.
    #[error("missing or invalid parameter '{0}'")]
    MissingParam(String),
    /// The connector has no method mapping for the action.
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),
    /// No credential is stored for the integration.
    #[error("no credential for integration '{0}'")]
    Credential(String),
    /// The dispatch exceeded its deadline.
    #[error("dispatch timed out after {timeout_ms}ms")]
    Timeout {
        /// Enforced deadline in milliseconds.
        timeout_ms: u64,
    },
    /// The integration returned a non-success response.
    #[error("upstream returned {http_status}")]
    Upstream {
        /// Upstream HTTP status.
        http_status: u16,
        /// Truncated response body.
        body: String,
    },
    /// Transport-level failure that survived the retry policy.
    #[error("transport failure: {0}")]
    Transport(String),
    /// A native handler failed with an explicit code.
    #[error("handler failed ({code}): {message}")]
    Handler {
        /// Stable code chosen by the handler.
        code: ErrorCode,
        /// Failure description.
        message: String,
    },
    /// The audit trail could not be written.
    #[error("audit write failed: {0}")]
    Audit(String),
    /// Unclassified framework failure.
    #[error("internal fabric error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Stable error code for the response envelope.
    pub fn code(&self) -> ErrorCode {
        match self {
            FabricError::Schema(_) | FabricError::MissingParam(_) => ErrorCode::Schema,
            FabricError::Registry(_) | FabricError::Internal(_) | FabricError::Audit(_) => {
                ErrorCode::Internal
            }
            FabricError::UnknownIntegration(_) => ErrorCode::UnknownIntegration,
            FabricError::ActionNotPermitted { .. } => ErrorCode::ActionNotPermitted,
            FabricError::ConfirmationRequired(_) => ErrorCode::ConfirmationRequired,
            FabricError::Unauthorized(_) => ErrorCode::Unauthorized,
            FabricError::UnsupportedAction(_) => ErrorCode::UnsupportedAction,
            FabricError::Credential(_) => ErrorCode::Unauthorized,
            FabricError::Timeout { .. } => ErrorCode::Timeout,
            FabricError::Upstream { .. } => ErrorCode::Upstream,
            FabricError::Transport(_) => ErrorCode::Transient,
            FabricError::Handler { code, .. } => *code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabric_errors_map_to_stable_codes() {
        assert_eq!(FabricError::Schema("x".into()).code(), ErrorCode::Schema);
        assert_eq!(
            FabricError::UnknownIntegration("nope".into()).code(),
            ErrorCode::UnknownIntegration
        );
        assert_eq!(
            FabricError::ConfirmationRequired("proxmox".into()).code(),
            ErrorCode::ConfirmationRequired
        );
        assert_eq!(FabricError::Timeout { timeout_ms: 30_000 }.code(), ErrorCode::Timeout);
        assert_eq!(
            FabricError::Upstream { http_status: 502, body: String::new() }.code(),
            ErrorCode::Upstream
        );
        assert_eq!(
            FabricError::Handler { code: ErrorCode::UnknownOperation, message: String::new() }
                .code(),
            ErrorCode::UnknownOperation
        );
    }
}
