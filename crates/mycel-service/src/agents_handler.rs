//! Native handler for the `agents` category.
//!
//! Commands targeting an `agents`-category integration are forwarded to a
//! registered agent's public operation through the orchestrator, the one
//! sanctioned agent-call path. `params.agent` names the target (falling back
//! to an `agent_id` field on the integration spec), the command's `action` is
//! the operation name, and `params.params` carries the operation arguments.

use std::sync::Arc;

use async_trait::async_trait;

use mycel_fabric::{FabricError, NativeHandler};
use mycel_orchestration::{Orchestrator, OrchestratorError};
use mycel_types::{AgentId, Command, ErrorCode, IntegrationSpec};

/// Routes `agents`-category commands onto agent operations.
pub struct AgentsHandler {
    orchestrator: Arc<Orchestrator>,
}

impl AgentsHandler {
    /// Build the handler over the running orchestrator.
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    fn target(&self, spec: &IntegrationSpec, command: &Command) -> Result<AgentId, FabricError> {
        if let Some(agent) = command.params.get("agent").and_then(|v| v.as_str()) {
            return Ok(AgentId::from(agent));
        }
        if let Some(agent) = spec.extra.get("agent_id").and_then(|v| v.as_str()) {
            return Ok(AgentId::from(agent));
        }
        Err(FabricError::MissingParam("agent".to_string()))
    }
}

#[async_trait]
impl NativeHandler for AgentsHandler {
    async fn call(
        &self,
        spec: &IntegrationSpec,
        command: &Command,
    ) -> Result<serde_json::Value, FabricError> {
        let agent = self.target(spec, command)?;
        let params = command.params.get("params").cloned().unwrap_or(serde_json::Value::Null);

        match self.orchestrator.call(&agent, &command.action, params).await {
            Ok(data) => Ok(data),
            Err(OrchestratorError::UnknownAgent(id)) => Err(FabricError::Handler {
                code: ErrorCode::UnknownIntegration,
                message: format!("agent '{id}' is not registered"),
            }),
            Err(OrchestratorError::Agent(err)) => {
                Err(FabricError::Handler { code: err.code(), message: err.to_string() })
            }
            Err(other) => Err(FabricError::Internal(other.to_string())),
        }
    }
}
