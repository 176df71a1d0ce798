#![forbid(unsafe_code)]

//! **mycel-service** – HTTP edge and wiring for the Mycel runtime.
//!
//! The service reads one configuration document, builds the stores, bus,
//! registry, audit logger, connector, router, and orchestrator, registers the
//! configured domain agents, and serves the HTTP edge. Everything is
//! constructed here and injected; no component reaches for global state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub mod config;
pub mod http;

mod agents_handler;

pub use agents_handler::AgentsHandler;
pub use config::ServiceConfig;
pub use http::{build_app, AppState};

use mycel_agent::AGENT_ERROR_TOPIC;
use mycel_agents::{BioAgent, TreasuryAgent};
use mycel_bus::MessageBus;
use mycel_fabric::{
    AuditLogger, CommandRouter, ConfigCredentialStore, EventIntake, HttpConnector,
    IntegrationRegistry,
};
use mycel_orchestration::{AgentFactory, Orchestrator};
use mycel_store_fs::JsonlSink;
use mycel_store_sqlite::SqliteStore;
use mycel_types::{EventSeverity, EventSubmission, IntegrationCategory};

/// Everything the running service hands to the HTTP edge and the shutdown
/// path.
pub struct Service {
    /// Shared endpoint state.
    pub state: AppState,
    /// Root supervisor (for `start_all`/`stop_all`).
    pub orchestrator: Arc<Orchestrator>,
    /// Global stop deadline from configuration.
    pub stop_deadline: Duration,
}

/// Build the full service from its configuration. Agents are registered but
/// not started; the caller drives `start_all`.
pub async fn build(config: ServiceConfig) -> Result<Service> {
    let bus = MessageBus::new();

    // Stores.
    if let Some(parent) = config.store.db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let store = SqliteStore::open(&config.store.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.store.db_path.display()))?;
    let sink = JsonlSink::open(&config.store.audit_log_path)
        .await
        .with_context(|| format!("opening audit log at {}", config.store.audit_log_path.display()))?;
    let audit = Arc::new(AuditLogger::new(store.clone(), sink, bus.clone()));
    let intake = Arc::new(EventIntake::new(store, bus.clone()));

    // Fabric.
    let registry = Arc::new(
        IntegrationRegistry::load(&config.registry_path)
            .await
            .with_context(|| format!("loading registry from {}", config.registry_path.display()))?,
    );
    let credentials = Arc::new(ConfigCredentialStore::new(config.credentials.clone()));
    let connector = Arc::new(
        HttpConnector::new(credentials).map_err(|err| anyhow::anyhow!(err.to_string()))?,
    );

    // Orchestrator and agents.
    let orchestrator = Arc::new(
        Orchestrator::new(bus.clone(), &config.store.data_root)
            .with_init_retries(config.orchestrator.init_retries),
    );
    for entry in &config.agents {
        let descriptor = entry.descriptor()?;
        let factory = factory_for(&entry.kind)
            .with_context(|| format!("agent '{}' has unknown kind '{}'", entry.id, entry.kind))?;
        orchestrator
            .register(descriptor, factory)
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    }

    let router = Arc::new(
        CommandRouter::new(registry, connector, audit)
            .with_handler(IntegrationCategory::Agents, Arc::new(AgentsHandler::new(orchestrator.clone()))),
    );

    // Agent error outcomes become durable event rows.
    let _forwarder = spawn_error_forwarder(&bus, intake.clone());

    let state = AppState {
        router,
        intake,
        orchestrator: orchestrator.clone(),
        command_permits: Arc::new(Semaphore::new(config.http.command_concurrency.max(1))),
        event_permits: Arc::new(Semaphore::new(config.http.event_concurrency.max(1))),
        started_at: Instant::now(),
    };

    info!(agents = config.agents.len(), "service assembled");
    Ok(Service {
        state,
        orchestrator,
        stop_deadline: Duration::from_secs(config.orchestrator.stop_deadline_secs),
    })
}

fn factory_for(kind: &str) -> Option<AgentFactory> {
    match kind {
        "bio" => Some(Box::new(|descriptor| {
            BioAgent::from_descriptor(descriptor)
                .map(|agent| Arc::new(agent) as Arc<dyn mycel_agent::Agent>)
        })),
        "treasury" => Some(Box::new(|descriptor| {
            TreasuryAgent::from_descriptor(descriptor)
                .map(|agent| Arc::new(agent) as Arc<dyn mycel_agent::Agent>)
        })),
        _ => None,
    }
}

/// Forward `agent.error` outcomes into the events table so every
/// `handle_error` decision is durably recorded.
pub fn spawn_error_forwarder(
    bus: &MessageBus,
    intake: Arc<EventIntake>,
) -> tokio::task::JoinHandle<()> {
    let mut subscription = bus.subscribe(AGENT_ERROR_TOPIC, 64);
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            let source = message
                .payload
                .get("agent")
                .and_then(|v| v.as_str())
                .map(|agent| format!("agent.{agent}"))
                .unwrap_or_else(|| "agent.unknown".to_string());
            let submission = EventSubmission {
                source,
                event_type: "error_outcome".to_string(),
                severity: EventSeverity::Warn,
                correlation_id: message.correlation_id.clone(),
                data: message.payload,
            };
            if let Err(err) = intake.ingest(submission).await {
                warn!(error = %err, "could not record agent error outcome");
            }
        }
    })
}
