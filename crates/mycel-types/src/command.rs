//! Command envelope submitted to the integration router, the response
//! envelope returned to callers, and the stable error-code vocabulary.
//!
//! Callers are expected to key off [`ErrorCode`] values, never off the
//! human-readable messages.

use serde::{Deserialize, Serialize};

use crate::{MAX_IDENT_LEN, MAX_PARAMS_LEN};

//─────────────────────────────
//  Command envelope
//─────────────────────────────

/// Uniform envelope carrying a request to an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Caller-supplied request id; audit records for this id are totally ordered.
    pub request_id: String,
    /// Identity of the requesting principal (human or agent).
    pub actor: String,
    /// Integration name, resolved against the registry.
    pub integration: String,
    /// Action to perform (`read`, `create`, `call`, ...).
    pub action: String,
    /// Action parameters, interpreted by the handler or connector.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Explicit confirmation for risky actions.
    #[serde(default)]
    pub confirm: bool,
    /// Optional correlation id propagated into audit and events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Command {
    /// Validate the envelope against the schema gate.
    ///
    /// Requires `request_id`, `actor`, `integration`, and `action` to be
    /// present and non-empty, and enforces size ceilings on identifiers and
    /// parameters.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("request_id", &self.request_id),
            ("actor", &self.actor),
            ("integration", &self.integration),
            ("action", &self.action),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{field} is required"));
            }
            if value.len() > MAX_IDENT_LEN {
                return Err(format!("{field} too long: {} > {}", value.len(), MAX_IDENT_LEN));
            }
        }
        let params_len = serde_json::to_vec(&self.params).map(|b| b.len()).unwrap_or(0);
        if params_len > MAX_PARAMS_LEN {
            return Err(format!("params too large: {params_len} > {MAX_PARAMS_LEN}"));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Response envelope
//─────────────────────────────

/// Terminal status of a routed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// The dispatch completed successfully.
    Ok,
    /// The dispatch failed; `error.code` identifies the failure class.
    Error,
    /// The command was refused by policy before dispatch.
    Denied,
}

/// Machine-readable error payload attached to non-`ok` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable message; not part of the stable contract.
    pub message: String,
}

/// Response envelope returned for every routed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Echo of the caller's request id.
    pub request_id: String,
    /// Echo of the target integration.
    pub integration: String,
    /// Terminal status.
    pub status: CommandStatus,
    /// Handler/connector result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Failure details on error or denial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    /// Additional requirements the caller must satisfy (e.g. `{ confirm: true }`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<serde_json::Value>,
    /// Always true: the audit record was written before this response.
    pub audit_logged: bool,
}

impl CommandResponse {
    /// Build a success response.
    pub fn ok(request_id: impl Into<String>, integration: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            integration: integration.into(),
            status: CommandStatus::Ok,
            data: Some(data),
            error: None,
            requirements: None,
            audit_logged: true,
        }
    }

    /// Build an error response with a stable code.
    pub fn error(
        request_id: impl Into<String>,
        integration: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            integration: integration.into(),
            status: CommandStatus::Error,
            data: None,
            error: Some(ErrorBody { code, message: message.into() }),
            requirements: None,
            audit_logged: true,
        }
    }

    /// Build a policy denial response.
    pub fn denied(
        request_id: impl Into<String>,
        integration: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        requirements: serde_json::Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            integration: integration.into(),
            status: CommandStatus::Denied,
            data: None,
            error: Some(ErrorBody { code, message: message.into() }),
            requirements: Some(requirements),
            audit_logged: true,
        }
    }
}

//─────────────────────────────
//  Error codes
//─────────────────────────────

/// Stable error-code vocabulary shared by the router, the connector, and the
/// HTTP edge. Wire representation is `snake_case`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The envelope is malformed or missing required fields.
    Schema,
    /// The integration does not exist or is disabled.
    UnknownIntegration,
    /// The action is not listed in the integration's permitted actions.
    ActionNotPermitted,
    /// A risky action was requested without `confirm=true`.
    ConfirmationRequired,
    /// Authentication missing or rejected by the target integration.
    Unauthorized,
    /// The dispatch did not complete within its deadline.
    Timeout,
    /// The integration returned a non-success response.
    Upstream,
    /// Unhandled framework failure.
    Internal,
    /// Task queue at capacity.
    QueueFull,
    /// Task queue draining or closed.
    QueueClosed,
    /// Retriable condition; the response carries a retry hint.
    Transient,
    /// The connector has no method mapping for the action.
    UnsupportedAction,
    /// The agent has no handler for the operation.
    UnknownOperation,
}

impl ErrorCode {
    /// Stable wire string for the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Schema => "schema",
            ErrorCode::UnknownIntegration => "unknown_integration",
            ErrorCode::ActionNotPermitted => "action_not_permitted",
            ErrorCode::ConfirmationRequired => "confirmation_required",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Upstream => "upstream",
            ErrorCode::Internal => "internal",
            ErrorCode::QueueFull => "queue_full",
            ErrorCode::QueueClosed => "queue_closed",
            ErrorCode::Transient => "transient",
            ErrorCode::UnsupportedAction => "unsupported_action",
            ErrorCode::UnknownOperation => "unknown_operation",
        }
    }

    /// HTTP status the edge maps this code to.
    ///
    /// The edge only ever answers with 200, 202, 400, 403, 404, 408, 500, or
    /// 503; upstream and authentication failures bucket into 500, with the
    /// stable code carried in the body.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Schema | ErrorCode::UnsupportedAction | ErrorCode::UnknownOperation => 400,
            ErrorCode::ActionNotPermitted | ErrorCode::ConfirmationRequired => 403,
            ErrorCode::UnknownIntegration => 404,
            ErrorCode::Timeout => 408,
            ErrorCode::QueueFull | ErrorCode::QueueClosed | ErrorCode::Transient => 503,
            ErrorCode::Unauthorized | ErrorCode::Upstream | ErrorCode::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command() -> Command {
        Command {
            request_id: "r1".to_string(),
            actor: "morgan".to_string(),
            integration: "httpbin".to_string(),
            action: "read".to_string(),
            params: json!({ "endpoint": "/get" }),
            confirm: false,
            correlation_id: None,
        }
    }

    #[test]
    fn validate_accepts_complete_envelope() {
        assert!(command().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let mut cmd = command();
        cmd.actor = "  ".to_string();
        assert_eq!(cmd.validate().unwrap_err(), "actor is required");
    }

    #[test]
    fn validate_rejects_oversized_identifier() {
        let mut cmd = command();
        cmd.integration = "x".repeat(MAX_IDENT_LEN + 1);
        assert!(cmd.validate().unwrap_err().contains("too long"));
    }

    #[test]
    fn error_codes_round_trip_snake_case() {
        let code: ErrorCode = serde_json::from_str("\"confirmation_required\"").unwrap();
        assert_eq!(code, ErrorCode::ConfirmationRequired);
        assert_eq!(code.as_str(), "confirmation_required");
        assert_eq!(code.http_status(), 403);
    }

    #[test]
    fn http_statuses_stay_within_the_edge_set() {
        let codes = [
            ErrorCode::Schema,
            ErrorCode::UnknownIntegration,
            ErrorCode::ActionNotPermitted,
            ErrorCode::ConfirmationRequired,
            ErrorCode::Unauthorized,
            ErrorCode::Timeout,
            ErrorCode::Upstream,
            ErrorCode::Internal,
            ErrorCode::QueueFull,
            ErrorCode::QueueClosed,
            ErrorCode::Transient,
            ErrorCode::UnsupportedAction,
            ErrorCode::UnknownOperation,
        ];
        for code in codes {
            assert!(
                matches!(code.http_status(), 400 | 403 | 404 | 408 | 500 | 503),
                "{code} maps outside the edge status set"
            );
        }
        // Upstream and auth failures bucket into 500.
        assert_eq!(ErrorCode::Unauthorized.http_status(), 500);
        assert_eq!(ErrorCode::Upstream.http_status(), 500);
    }

    #[test]
    fn command_defaults_fill_optional_fields() {
        let cmd: Command = serde_json::from_value(json!({
            "request_id": "r2",
            "actor": "x",
            "integration": "nope",
            "action": "read"
        }))
        .unwrap();
        assert_eq!(cmd.params, serde_json::Value::Null);
        assert!(!cmd.confirm);
    }

    #[test]
    fn denied_response_carries_requirements() {
        let resp = CommandResponse::denied(
            "r2",
            "proxmox",
            ErrorCode::ConfirmationRequired,
            "confirmation required for admin-risk integration",
            json!({ "confirm": true }),
        );
        assert_eq!(resp.status, CommandStatus::Denied);
        assert!(resp.audit_logged);
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["error"]["code"], "confirmation_required");
        assert_eq!(wire["requirements"]["confirm"], true);
    }
}
