#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-agent** – Agent framework for Mycel.
//!
//! An agent is a supervised unit owning a configuration, a set of named task
//! queues, one or more background loops, a table of public operations, and an
//! error-handling contract. This crate provides the [`Agent`] trait agents
//! implement, the [`AgentContext`] of framework services injected into them
//! (bus, queues, document store, heartbeat), and the [`AgentHost`] supervisor
//! that drives initialization, loop execution, and draining shutdown.
//!
//! Agents are values implementing the trait; the framework never relies on
//! concrete types, and agents never share mutable state: cross-agent effects
//! go through the message bus or explicit operation calls authorized by the
//! orchestrator.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mycel_queue::QueueError;
use mycel_store_core::StoreError;
use mycel_types::{AgentDescriptor, ErrorCode};

mod context;
mod host;

pub use context::{AgentContext, RuntimeState};
pub use host::{AgentHealth, AgentHost, AGENT_ERROR_TOPIC};

/// Default wall-clock allowance for draining an agent on `stop`.
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(10);

/// Pause between supervised loop iterations when the loop body does not wait
/// on its own (queue receive, timer, I/O).
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(100);

/// Base delay for loop backoff after a failed iteration.
pub const LOOP_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Cap on loop backoff delay.
pub const LOOP_BACKOFF_MAX: Duration = Duration::from_secs(30);

//─────────────────────────────
//  Lifecycle status
//─────────────────────────────

/// Lifecycle state of a hosted agent. Mutated only by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// `initialize` has not completed yet.
    Initializing,
    /// Loops are running and operations are accepted.
    Running,
    /// `stop` was requested: new work refused, in-flight work finishing.
    Draining,
    /// Orderly shutdown completed.
    Stopped,
    /// Initialization or shutdown failed, or loops had to be force-aborted.
    Failed,
}

//─────────────────────────────
//  Background loops
//─────────────────────────────

/// Declaration of one supervised background loop.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    /// Loop name, passed back to [`Agent::run_loop`].
    pub name: String,
    /// Pause between iterations; the body may also wait on its own.
    pub interval: Duration,
}

impl LoopSpec {
    /// Declare a loop with the default iteration interval.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), interval: DEFAULT_LOOP_INTERVAL }
    }

    /// Declare a loop with an explicit iteration interval.
    pub fn with_interval(name: impl Into<String>, interval: Duration) -> Self {
        Self { name: name.into(), interval }
    }
}

//─────────────────────────────
//  Error handling contract
//─────────────────────────────

/// Classification handed to [`Agent::handle_error`].
///
/// The common kinds have fixed wire names; anything else arrives as `Other`.
/// Kinds are agent-specific; the framework only requires a well-formed
/// [`ErrorOutcome`] in return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A culture/sample/experiment-style resource went bad.
    Resource,
    /// A transaction could not complete.
    Transaction,
    /// An upstream API client failed.
    Api,
    /// A token pool is misbehaving.
    Token,
    /// Any kind the framework does not define.
    Other(String),
}

impl ErrorKind {
    /// Stable wire string for the kind.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::Resource => "resource_error",
            ErrorKind::Transaction => "transaction_error",
            ErrorKind::Api => "api_error",
            ErrorKind::Token => "token_error",
            ErrorKind::Other(name) => name,
        }
    }

    /// Parse a wire string back into a kind.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "resource_error" => ErrorKind::Resource,
            "transaction_error" => ErrorKind::Transaction,
            "api_error" => ErrorKind::Api,
            "token_error" => ErrorKind::Token,
            other => ErrorKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation the agent performed in response to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The subject was marked contaminated/invalid/failed and persisted.
    MarkedFailed,
    /// The named API client was scheduled for reinitialization.
    ClientReinitialized,
    /// The affected token pool was suspended and persisted.
    PoolSuspended,
    /// The task was retried.
    Retried,
    /// The task was dropped with a logged warning.
    Dropped,
    /// The task was requeued at the tail.
    Requeued,
    /// No remediation applied.
    Unhandled,
}

/// Outcome of [`Agent::handle_error`]; the agent's decision is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorOutcome {
    /// Whether the agent considers the error remediated.
    pub success: bool,
    /// Remediation applied.
    pub action: RecoveryAction,
    /// Entity the remediation applied to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorOutcome {
    /// A successful remediation.
    pub fn handled(action: RecoveryAction) -> Self {
        Self { success: true, action, subject: None, detail: None }
    }

    /// The required outcome for an unrecognized error kind.
    pub fn unknown_kind() -> Self {
        Self {
            success: false,
            action: RecoveryAction::Unhandled,
            subject: None,
            detail: Some("unknown error kind".to_string()),
        }
    }

    /// Attach the remediated subject id.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attach free-form detail.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

//─────────────────────────────
//  Agent error type
//─────────────────────────────

/// Typed errors surfaced by agent operations and loop iterations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// `initialize` could not acquire its resources.
    #[error("initialization failed: {0}")]
    Initialization(String),
    /// The operation is not in the agent's dispatch table.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    /// Operation parameters failed validation.
    #[error("invalid params: {0}")]
    InvalidParams(String),
    /// The requested entity does not exist.
    #[error("'{0}' not found")]
    NotFound(String),
    /// A domain resource (culture, sample, experiment) went bad.
    #[error("resource '{subject}' failed: {detail}")]
    Resource {
        /// Affected entity id.
        subject: String,
        /// What went wrong.
        detail: String,
    },
    /// A transaction could not complete.
    #[error("transaction '{subject}' failed: {detail}")]
    Transaction {
        /// Affected transaction id.
        subject: String,
        /// What went wrong.
        detail: String,
    },
    /// An upstream API client failed.
    #[error("api client '{service}' failed: {detail}")]
    Api {
        /// Failing service name.
        service: String,
        /// What went wrong.
        detail: String,
    },
    /// A token pool is misbehaving.
    #[error("token pool '{subject}' failed: {detail}")]
    Token {
        /// Affected pool id.
        subject: String,
        /// What went wrong.
        detail: String,
    },
    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Task queue capacity or lifecycle violation.
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The agent is not accepting work in its current state.
    #[error("agent unavailable (status {status:?})")]
    Unavailable {
        /// Status at the time of the call.
        status: AgentStatus,
    },
    /// The operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Unclassified framework failure.
    #[error("internal agent error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Stable error code for the fabric response vocabulary.
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::UnknownOperation(_) => ErrorCode::UnknownOperation,
            AgentError::InvalidParams(_) => ErrorCode::Schema,
            AgentError::NotFound(_) => ErrorCode::UnknownIntegration,
            AgentError::Queue(err) => err.code(),
            AgentError::Unavailable { .. } => ErrorCode::Transient,
            AgentError::Timeout(_) => ErrorCode::Timeout,
            AgentError::Api { .. } => ErrorCode::Upstream,
            _ => ErrorCode::Internal,
        }
    }

    /// Classify the error into a [`handle_error`](Agent::handle_error) kind
    /// plus structured data about the failure.
    pub fn classify(&self) -> (ErrorKind, serde_json::Value) {
        match self {
            AgentError::Resource { subject, detail } => (
                ErrorKind::Resource,
                serde_json::json!({ "subject": subject, "detail": detail }),
            ),
            AgentError::Transaction { subject, detail } => (
                ErrorKind::Transaction,
                serde_json::json!({ "subject": subject, "detail": detail }),
            ),
            AgentError::Api { service, detail } => (
                ErrorKind::Api,
                serde_json::json!({ "service": service, "detail": detail }),
            ),
            AgentError::Token { subject, detail } => (
                ErrorKind::Token,
                serde_json::json!({ "subject": subject, "detail": detail }),
            ),
            other => (
                ErrorKind::Other("unclassified".to_string()),
                serde_json::json!({ "detail": other.to_string() }),
            ),
        }
    }
}

//─────────────────────────────
//  Agent trait
//─────────────────────────────

/// The uniform agent contract.
///
/// Implementations own their domain records exclusively and persist them
/// through the context's document store on every state transition.
#[async_trait]
pub trait Agent: Send + Sync {
    /// The immutable descriptor this agent was registered with.
    fn descriptor(&self) -> &AgentDescriptor;

    /// Acquire agent-scoped resources (queues, subscriptions, directories).
    ///
    /// Must be idempotent: the supervisor retries failed initialization, and
    /// a repeated call after success must not error.
    async fn initialize(&self, ctx: &AgentContext) -> Result<(), AgentError>;

    /// Names of the public operations this agent dispatches.
    fn operations(&self) -> Vec<String>;

    /// Execute a public operation.
    ///
    /// Operations outside [`operations`](Agent::operations) are rejected by
    /// the host before this is called.
    async fn handle(
        &self,
        operation: &str,
        params: serde_json::Value,
        ctx: &AgentContext,
    ) -> Result<serde_json::Value, AgentError>;

    /// Decide remediation for a classified failure.
    ///
    /// Invoked synchronously whenever a background loop catches an unhandled
    /// failure and whenever a public operation returns a typed error. The
    /// returned outcome is authoritative and is published for the audit
    /// trail. Unrecognized kinds must produce [`ErrorOutcome::unknown_kind`].
    async fn handle_error(
        &self,
        kind: ErrorKind,
        data: serde_json::Value,
        ctx: &AgentContext,
    ) -> ErrorOutcome;

    /// Background loops the supervisor hosts for this agent.
    fn loops(&self) -> Vec<LoopSpec> {
        Vec::new()
    }

    /// One iteration of the named background loop.
    ///
    /// The supervisor heartbeats before each iteration, catches errors,
    /// classifies them, routes them through
    /// [`handle_error`](Agent::handle_error), and applies backoff.
    async fn run_loop(&self, _name: &str, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }

    /// Release resources on shutdown; runs on every exit path.
    async fn shutdown(&self, _ctx: &AgentContext) -> Result<(), AgentError> {
        Ok(())
    }
}
