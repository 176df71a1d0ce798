#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-orchestration** – Root supervisor for Mycel agents.
//!
//! The orchestrator is the only component permitted to construct, start, or
//! destroy agents. It records descriptors and factories at registration time,
//! starts agents in dependency order (rolling back already-started agents in
//! reverse when a required dependency fails), drains everything under a
//! global deadline on shutdown, and surfaces per-agent health and the
//! declared topology graph. All other interactions with agents go through
//! the message bus or through [`Orchestrator::call`], the explicit operation
//! path authorized at registration time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use mycel_agent::{Agent, AgentContext, AgentError, AgentHealth, AgentHost, AgentStatus};
use mycel_bus::MessageBus;
use mycel_types::{AgentDescriptor, AgentId, AgentKind};

mod dependency;

pub use dependency::DependencyResolver;

/// Default number of `initialize` attempts before an agent is marked failed.
pub const DEFAULT_INIT_RETRIES: u32 = 3;

/// Default global deadline for `stop_all`.
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(30);

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Orchestration failures.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// An agent with this id is already registered.
    #[error("agent '{0}' already registered")]
    DuplicateAgent(AgentId),
    /// The descriptor failed validation.
    #[error("invalid descriptor for '{agent}': {reason}")]
    InvalidDescriptor {
        /// Offending agent id.
        agent: AgentId,
        /// Validation failure.
        reason: String,
    },
    /// A declared dependency was never registered.
    #[error("agent '{agent}' depends on unregistered agent '{dependency}'")]
    UnknownDependency {
        /// Agent declaring the dependency.
        agent: AgentId,
        /// Missing dependency id.
        dependency: AgentId,
    },
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving agent '{agent}'")]
    DependencyCycle {
        /// An agent on the cycle.
        agent: AgentId,
    },
    /// The factory failed to build the agent value.
    #[error("factory for '{agent}' failed: {reason}")]
    Factory {
        /// Agent id.
        agent: AgentId,
        /// Builder failure.
        reason: String,
    },
    /// A required agent failed during startup; startup was rolled back.
    #[error("startup aborted: agent '{agent}' failed: {source}")]
    StartupAborted {
        /// Failing agent id.
        agent: AgentId,
        /// Underlying agent error.
        #[source]
        source: AgentError,
    },
    /// The target agent is not registered or not started.
    #[error("unknown agent '{0}'")]
    UnknownAgent(AgentId),
    /// An operation call failed inside the agent.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

//─────────────────────────────
//  Topology graph
//─────────────────────────────

/// One node of the declared agent topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Agent id.
    pub id: AgentId,
    /// Human-readable name.
    pub name: String,
    /// Agent classification.
    pub kind: AgentKind,
}

/// One declared dependency edge (`from` depends on `to`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Depending agent.
    pub from: AgentId,
    /// Dependency.
    pub to: AgentId,
}

/// Declared topology: nodes plus dependency edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyGraph {
    /// All registered agents.
    pub nodes: Vec<GraphNode>,
    /// All declared dependency links.
    pub edges: Vec<GraphEdge>,
}

//─────────────────────────────
//  Orchestrator
//─────────────────────────────

/// Builder callable producing the agent value for a descriptor.
pub type AgentFactory =
    Box<dyn Fn(&AgentDescriptor) -> Result<Arc<dyn Agent>, String> + Send + Sync>;

struct Registration {
    descriptor: AgentDescriptor,
    factory: AgentFactory,
}

/// The root supervisor.
pub struct Orchestrator {
    bus: MessageBus,
    data_root: PathBuf,
    init_retries: u32,
    registrations: RwLock<Vec<Registration>>,
    hosts: RwLock<HashMap<AgentId, Arc<AgentHost>>>,
    started_order: RwLock<Vec<AgentId>>,
}

impl Orchestrator {
    /// Create an orchestrator publishing on `bus` and rooting agent data
    /// directories at `data_root`.
    pub fn new(bus: MessageBus, data_root: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            data_root: data_root.into(),
            init_retries: DEFAULT_INIT_RETRIES,
            registrations: RwLock::new(Vec::new()),
            hosts: RwLock::new(HashMap::new()),
            started_order: RwLock::new(Vec::new()),
        }
    }

    /// Override the number of `initialize` attempts per agent.
    pub fn with_init_retries(mut self, retries: u32) -> Self {
        self.init_retries = retries.max(1);
        self
    }

    /// The shared bus handle.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Record a descriptor and its builder. Duplicate ids are rejected; the
    /// descriptor is immutable from here on.
    pub async fn register(
        &self,
        descriptor: AgentDescriptor,
        factory: AgentFactory,
    ) -> Result<(), OrchestratorError> {
        descriptor.validate().map_err(|reason| OrchestratorError::InvalidDescriptor {
            agent: descriptor.id.clone(),
            reason,
        })?;
        let mut registrations = self.registrations.write().await;
        if registrations.iter().any(|r| r.descriptor.id == descriptor.id) {
            return Err(OrchestratorError::DuplicateAgent(descriptor.id));
        }
        info!(agent = %descriptor.id, "agent registered");
        registrations.push(Registration { descriptor, factory });
        Ok(())
    }

    /// Start every registered agent in dependency order.
    ///
    /// Agents whose dependencies are all satisfied form a wave and start
    /// concurrently; waves run in sequence. On the first failure the
    /// already-started agents are stopped in reverse start order and the
    /// error is returned; the orchestrator is left with no running agents.
    #[instrument(skip(self))]
    pub async fn start_all(&self) -> Result<(), OrchestratorError> {
        let registrations = self.registrations.read().await;
        let descriptors: Vec<AgentDescriptor> =
            registrations.iter().map(|r| r.descriptor.clone()).collect();
        let resolver = DependencyResolver::new(&descriptors)?;
        let waves = resolver.start_waves()?;
        info!(agents = descriptors.len(), waves = waves.len(), "starting agents");

        for wave in waves {
            let wave_registrations: Vec<&Registration> = wave
                .iter()
                .map(|id| {
                    registrations
                        .iter()
                        .find(|r| &r.descriptor.id == id)
                        .expect("start waves contain only registered agents")
                })
                .collect();

            let results = join_all(
                wave_registrations.iter().map(|registration| self.start_one(registration)),
            )
            .await;

            let mut failure = None;
            for (registration, result) in wave_registrations.iter().zip(results) {
                let id = &registration.descriptor.id;
                match result {
                    Ok(host) => {
                        self.hosts.write().await.insert(id.clone(), host);
                        self.started_order.write().await.push(id.clone());
                    }
                    Err(err) => {
                        error!(agent = %id, error = %err, "agent startup failed");
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }
            if let Some(err) = failure {
                warn!("startup aborted; rolling back started agents");
                self.rollback().await;
                return Err(err);
            }
        }

        info!("all agents running");
        Ok(())
    }

    async fn start_one(
        &self,
        registration: &Registration,
    ) -> Result<Arc<AgentHost>, OrchestratorError> {
        let descriptor = &registration.descriptor;
        let agent = (registration.factory)(descriptor).map_err(|reason| {
            OrchestratorError::Factory { agent: descriptor.id.clone(), reason }
        })?;
        let ctx = AgentContext::create(descriptor.id.clone(), &self.data_root, self.bus.clone())
            .await
            .map_err(|err| OrchestratorError::StartupAborted {
                agent: descriptor.id.clone(),
                source: err,
            })?;
        let host = Arc::new(AgentHost::new(agent, ctx));
        host.initialize(self.init_retries).await.map_err(|err| {
            OrchestratorError::StartupAborted { agent: descriptor.id.clone(), source: err }
        })?;
        host.start().await.map_err(|err| OrchestratorError::StartupAborted {
            agent: descriptor.id.clone(),
            source: err,
        })?;
        Ok(host)
    }

    async fn rollback(&self) {
        let started: Vec<AgentId> = {
            let mut order = self.started_order.write().await;
            order.drain(..).collect()
        };
        let hosts = self.hosts.read().await;
        for id in started.iter().rev() {
            if let Some(host) = hosts.get(id) {
                warn!(agent = %id, "stopping agent during rollback");
                host.stop(DEFAULT_STOP_DEADLINE).await;
            }
        }
    }

    /// Stop every running agent in reverse start order under one global
    /// deadline. Every agent ends `Stopped` or `Failed`.
    #[instrument(skip(self))]
    pub async fn stop_all(&self, deadline: Duration) -> HashMap<AgentId, AgentStatus> {
        let started: Vec<AgentId> = {
            let mut order = self.started_order.write().await;
            order.drain(..).collect()
        };
        let hosts = self.hosts.read().await;
        let begun = Instant::now();
        let mut outcome = HashMap::new();

        for id in started.iter().rev() {
            let Some(host) = hosts.get(id) else { continue };
            let remaining = deadline.saturating_sub(begun.elapsed());
            let status = host.stop(remaining).await;
            outcome.insert(id.clone(), status);
        }
        info!(agents = outcome.len(), "stop_all complete");
        outcome
    }

    /// Execute a public operation on a running agent.
    ///
    /// This is the explicit agent-call path; everything else goes through the
    /// bus.
    pub async fn call(
        &self,
        agent: &AgentId,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, OrchestratorError> {
        let host = {
            let hosts = self.hosts.read().await;
            hosts.get(agent).cloned()
        }
        .ok_or_else(|| OrchestratorError::UnknownAgent(agent.clone()))?;
        Ok(host.call(operation, params).await?)
    }

    /// Per-agent health, in registration order. Registered agents that were
    /// never started report `Initializing` with empty queues.
    pub async fn health(&self) -> Vec<AgentHealth> {
        let registrations = self.registrations.read().await;
        let hosts = self.hosts.read().await;
        registrations
            .iter()
            .map(|registration| {
                let descriptor = &registration.descriptor;
                match hosts.get(&descriptor.id) {
                    Some(host) => host.health(),
                    None => AgentHealth {
                        id: descriptor.id.clone(),
                        name: descriptor.name.clone(),
                        status: AgentStatus::Initializing,
                        last_heartbeat_ms: 0,
                        queue_depths: Default::default(),
                        metrics: Default::default(),
                    },
                }
            })
            .collect()
    }

    /// Whether every registered agent is currently `Running`.
    pub async fn all_running(&self) -> bool {
        let registrations = self.registrations.read().await;
        let hosts = self.hosts.read().await;
        !registrations.is_empty()
            && registrations.iter().all(|registration| {
                hosts
                    .get(&registration.descriptor.id)
                    .map(|host| host.status() == AgentStatus::Running)
                    .unwrap_or(false)
            })
    }

    /// Declared topology: every registered agent plus dependency edges.
    pub async fn graph(&self) -> TopologyGraph {
        let registrations = self.registrations.read().await;
        let nodes = registrations
            .iter()
            .map(|registration| GraphNode {
                id: registration.descriptor.id.clone(),
                name: registration.descriptor.name.clone(),
                kind: registration.descriptor.kind.clone(),
            })
            .collect();
        let edges = registrations
            .iter()
            .flat_map(|registration| {
                let from = registration.descriptor.id.clone();
                registration
                    .descriptor
                    .dependencies
                    .iter()
                    .map(move |dep| GraphEdge { from: from.clone(), to: dep.clone() })
            })
            .collect();
        TopologyGraph { nodes, edges }
    }
}
