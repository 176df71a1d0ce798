//! Command router: validate, resolve, gate, dispatch, audit, respond.
//!
//! The dispatch pipeline runs in a fixed order: schema gate, registry
//! resolve, action permit, confirmation gate, dispatch (native handler or
//! generic connector), then audit. Exactly one audit record is written per
//! command *before* the response is returned. Denied commands never reach a
//! handler or the connector. Framework error details go into the audit
//! record's metadata; the response body only carries the stable code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, instrument, warn};

use mycel_types::{
    AuditRecord, AuditStatus, Command, CommandResponse, ErrorCode, IntegrationCategory,
    IntegrationSpec,
};

use crate::{AuditLogger, FabricError, HttpConnector, IntegrationRegistry};

//─────────────────────────────
//  Native handlers
//─────────────────────────────

/// Handler owning the native client for one integration category.
///
/// Handlers are registered at boot; a spec marked `native` whose category has
/// no registered handler falls back to the generic connector with
/// `metadata.native_missing = true` on the audit record.
#[async_trait]
pub trait NativeHandler: Send + Sync {
    /// Execute the command against the native integration.
    async fn call(
        &self,
        spec: &IntegrationSpec,
        command: &Command,
    ) -> Result<serde_json::Value, FabricError>;
}

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Router dispatch limits.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline applied when the caller does not set `params.timeout_ms`.
    pub default_timeout: Duration,
    /// Ceiling for caller-supplied deadlines.
    pub max_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(120),
        }
    }
}

//─────────────────────────────
//  Router
//─────────────────────────────

/// The integration fabric's command gate.
pub struct CommandRouter {
    registry: Arc<IntegrationRegistry>,
    connector: Arc<HttpConnector>,
    audit: Arc<AuditLogger>,
    handlers: HashMap<IntegrationCategory, Arc<dyn NativeHandler>>,
    config: RouterConfig,
}

enum Outcome {
    Ok(serde_json::Value),
    Error { code: ErrorCode, message: String },
    Denied { code: ErrorCode, message: String, requirements: serde_json::Value },
}

impl CommandRouter {
    /// Build a router over the registry, connector, and audit logger.
    pub fn new(
        registry: Arc<IntegrationRegistry>,
        connector: Arc<HttpConnector>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            registry,
            connector,
            audit,
            handlers: HashMap::new(),
            config: RouterConfig::default(),
        }
    }

    /// Register the native handler for a category. Last registration wins.
    pub fn with_handler(
        mut self,
        category: IntegrationCategory,
        handler: Arc<dyn NativeHandler>,
    ) -> Self {
        self.handlers.insert(category, handler);
        self
    }

    /// Override dispatch limits.
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// The registry serving this router.
    pub fn registry(&self) -> &Arc<IntegrationRegistry> {
        &self.registry
    }

    /// The audit logger serving this router.
    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    /// Route one command to its outcome.
    #[instrument(
        skip(self, command),
        fields(
            request_id = %command.request_id,
            integration = %command.integration,
            action = %command.action,
        )
    )]
    pub async fn dispatch(&self, command: Command) -> CommandResponse {
        let started = Instant::now();
        let params_hash = AuditLogger::hash_value(&command.params);
        let mut metadata = serde_json::Map::new();

        // 1. Schema gate: reject malformed envelopes without touching the
        //    registry.
        if let Err(reason) = command.validate() {
            let outcome = Outcome::Error { code: ErrorCode::Schema, message: reason };
            return self
                .finalize(&command, None, outcome, params_hash, elapsed_ms(started), metadata)
                .await;
        }

        // 2. Registry resolve. The snapshot is held for the whole dispatch so
        //    a concurrent reload cannot change the rules mid-command.
        let snapshot = self.registry.snapshot();
        let spec = match snapshot.get(&command.integration) {
            Some(spec) if spec.enabled => spec,
            _ => {
                let outcome = Outcome::Error {
                    code: ErrorCode::UnknownIntegration,
                    message: format!("integration '{}' is not available", command.integration),
                };
                return self
                    .finalize(&command, None, outcome, params_hash, elapsed_ms(started), metadata)
                    .await;
            }
        };

        // 3. Action permit.
        if !spec.permits_action(&command.action) {
            let outcome = Outcome::Error {
                code: ErrorCode::ActionNotPermitted,
                message: format!(
                    "action '{}' is not permitted for '{}'",
                    command.action, command.integration
                ),
            };
            return self
                .finalize(&command, Some(&spec), outcome, params_hash, elapsed_ms(started), metadata)
                .await;
        }

        // 4. Confirmation gate: denials never dispatch.
        if spec.requires_confirmation() && !command.confirm {
            let outcome = Outcome::Denied {
                code: ErrorCode::ConfirmationRequired,
                message: format!(
                    "integration '{}' requires confirm=true for this action",
                    command.integration
                ),
                requirements: serde_json::json!({ "confirm": true }),
            };
            return self
                .finalize(&command, Some(&spec), outcome, params_hash, elapsed_ms(started), metadata)
                .await;
        }

        // 5. Dispatch: native handler by category, otherwise the generic
        //    connector, under the effective deadline.
        let handler = if spec.native { self.handlers.get(&spec.category).cloned() } else { None };
        if spec.native && handler.is_none() {
            warn!(category = spec.category.as_str(), "no native handler registered; using connector");
            metadata.insert("native_missing".to_string(), serde_json::Value::Bool(true));
        }
        let timeout = self.effective_timeout(&command);
        let dispatch = async {
            match handler {
                Some(handler) => handler.call(&spec, &command).await,
                None => self.connector.dispatch(&spec, &command).await,
            }
        };

        let (outcome, duration_ms) = match tokio::time::timeout(timeout, dispatch).await {
            Err(_) => (
                Outcome::Error {
                    code: ErrorCode::Timeout,
                    message: "dispatch did not complete within the deadline".to_string(),
                },
                timeout.as_millis() as u64,
            ),
            Ok(Ok(data)) => (Outcome::Ok(data), elapsed_ms(started)),
            Ok(Err(err)) => {
                metadata.insert(
                    "detail".to_string(),
                    serde_json::Value::String(err.to_string()),
                );
                (
                    Outcome::Error { code: err.code(), message: message_for(err.code()) },
                    elapsed_ms(started),
                )
            }
        };

        // 6-7. Audit, then respond.
        self.finalize(&command, Some(&spec), outcome, params_hash, duration_ms, metadata).await
    }

    fn effective_timeout(&self, command: &Command) -> Duration {
        let requested = command
            .params
            .get("timeout_ms")
            .and_then(|v| v.as_u64())
            .map(Duration::from_millis);
        match requested {
            Some(timeout) => timeout.clamp(Duration::from_millis(1), self.config.max_timeout),
            None => self.config.default_timeout,
        }
    }

    /// Write the single audit record for this command and build the
    /// response. The record always lands before the caller sees an answer;
    /// if the audit write itself fails, the response degrades to an internal
    /// error with `audit_logged: false`.
    async fn finalize(
        &self,
        command: &Command,
        spec: Option<&IntegrationSpec>,
        outcome: Outcome,
        params_hash: String,
        duration_ms: u64,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> CommandResponse {
        let (status, response_hash, error_message) = match &outcome {
            Outcome::Ok(data) => (AuditStatus::Ok, AuditLogger::hash_value(data), None),
            Outcome::Error { message, .. } => (
                AuditStatus::Error,
                AuditLogger::hash_value(&serde_json::Value::Null),
                Some(message.clone()),
            ),
            Outcome::Denied { message, .. } => (
                AuditStatus::Denied,
                AuditLogger::hash_value(&serde_json::Value::Null),
                Some(message.clone()),
            ),
        };

        let record = AuditRecord {
            id: mycel_types::new_id(),
            timestamp: Utc::now(),
            request_id: command.request_id.clone(),
            actor: command.actor.clone(),
            integration: command.integration.clone(),
            action: command.action.clone(),
            category: spec.map(|s| s.category),
            params_hash,
            response_hash,
            status,
            duration_ms,
            error_message,
            risk: spec.map(|s| s.risk),
            confirmed: command.confirm,
            correlation_id: command.correlation_id.clone(),
            metadata: if metadata.is_empty() {
                None
            } else {
                Some(serde_json::Value::Object(metadata))
            },
        };

        if let Err(err) = self.audit.record(&record).await {
            error!(error = %err, request_id = %command.request_id, "audit write failed");
            let mut response = CommandResponse::error(
                &command.request_id,
                &command.integration,
                ErrorCode::Internal,
                "audit trail unavailable",
            );
            response.audit_logged = false;
            return response;
        }

        match outcome {
            Outcome::Ok(data) => {
                CommandResponse::ok(&command.request_id, &command.integration, data)
            }
            Outcome::Error { code, message } => {
                CommandResponse::error(&command.request_id, &command.integration, code, message)
            }
            Outcome::Denied { code, message, requirements } => CommandResponse::denied(
                &command.request_id,
                &command.integration,
                code,
                message,
                requirements,
            ),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn message_for(code: ErrorCode) -> String {
    match code {
        ErrorCode::Schema => "the request is malformed",
        ErrorCode::UnknownIntegration => "the integration is not available",
        ErrorCode::ActionNotPermitted => "the action is not permitted",
        ErrorCode::ConfirmationRequired => "confirmation is required",
        ErrorCode::Unauthorized => "authentication was rejected",
        ErrorCode::Timeout => "the dispatch did not complete within the deadline",
        ErrorCode::Upstream => "the integration returned a non-success response",
        ErrorCode::QueueFull => "the target queue is at capacity",
        ErrorCode::QueueClosed => "the target queue is draining",
        ErrorCode::Transient => "a transient failure occurred; retry later",
        ErrorCode::UnsupportedAction => "the action has no connector mapping",
        ErrorCode::UnknownOperation => "the agent has no such operation",
        ErrorCode::Internal => "an internal error occurred",
    }
    .to_string()
}
