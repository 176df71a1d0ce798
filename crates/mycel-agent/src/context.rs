//! Framework services injected into each agent.
//!
//! The context is the only way an agent touches the outside world: its own
//! data directory, its named task queues, the shared message bus, and its
//! runtime state (status, heartbeat, metrics). Everything is constructed by
//! the orchestrator and scoped to the owning agent; nothing here is global.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use mycel_bus::{emit_notification, MessageBus, PublishOutcome, Subscription};
use mycel_queue::TaskQueue;
use mycel_store_fs::FsDocumentStore;
use mycel_types::AgentId;

use crate::{AgentError, AgentStatus};

//─────────────────────────────
//  Runtime state
//─────────────────────────────

/// Mutable runtime state of one hosted agent.
///
/// Status is mutated only by the supervisor; metrics and heartbeat are
/// updated from the agent's own loops.
#[derive(Debug)]
pub struct RuntimeState {
    status: RwLock<AgentStatus>,
    last_heartbeat: Mutex<Instant>,
    metrics: DashMap<String, f64>,
}

impl RuntimeState {
    pub(crate) fn new() -> Self {
        Self {
            status: RwLock::new(AgentStatus::Initializing),
            last_heartbeat: Mutex::new(Instant::now()),
            metrics: DashMap::new(),
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> AgentStatus {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_status(&self, status: AgentStatus) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    /// Record a heartbeat now.
    pub fn heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    /// Age of the most recent heartbeat.
    pub fn heartbeat_age(&self) -> std::time::Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    /// Add `delta` to the named metric.
    pub fn metric_add(&self, name: &str, delta: f64) {
        *self.metrics.entry(name.to_string()).or_insert(0.0) += delta;
    }

    /// Snapshot of all metrics.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

//─────────────────────────────
//  Agent context
//─────────────────────────────

/// Per-agent handle onto framework services.
pub struct AgentContext {
    id: AgentId,
    data_dir: PathBuf,
    documents: Arc<FsDocumentStore>,
    bus: MessageBus,
    queues: DashMap<String, TaskQueue<serde_json::Value>>,
    runtime: Arc<RuntimeState>,
    shutdown: CancellationToken,
}

impl AgentContext {
    /// Build the context for `id`, creating its data directory under
    /// `data_root` and opening the agent-owned document store.
    pub async fn create(
        id: AgentId,
        data_root: &Path,
        bus: MessageBus,
    ) -> Result<Self, AgentError> {
        let data_dir = data_root.join(id.as_str());
        let documents = FsDocumentStore::open(&data_dir)
            .await
            .map_err(|err| AgentError::Initialization(err.to_string()))?;
        Ok(Self {
            id,
            data_dir,
            documents: Arc::new(documents),
            bus,
            queues: DashMap::new(),
            runtime: Arc::new(RuntimeState::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// The owning agent's id.
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// The agent-owned data directory; no other agent writes here.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The agent-owned JSON document store.
    pub fn documents(&self) -> &FsDocumentStore {
        &self.documents
    }

    /// Runtime state handle (status, heartbeat, metrics).
    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.runtime
    }

    /// Current lifecycle status.
    pub fn status(&self) -> AgentStatus {
        self.runtime.status()
    }

    /// Record a heartbeat; called automatically on each loop iteration.
    pub fn heartbeat(&self) {
        self.runtime.heartbeat();
    }

    /// Token observed by loops at every suspension point.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn trigger_shutdown(&self) {
        self.shutdown.cancel();
    }

    //───────────────────── queues ─────────────────────

    /// Register a named bounded queue; duplicate names fail.
    pub fn register_queue(
        &self,
        name: &str,
        capacity: usize,
    ) -> Result<TaskQueue<serde_json::Value>, AgentError> {
        if self.queues.contains_key(name) {
            return Err(AgentError::Initialization(format!(
                "queue '{name}' already registered for agent '{}'",
                self.id
            )));
        }
        let queue = TaskQueue::bounded(name, capacity);
        self.queues.insert(name.to_string(), queue.clone());
        Ok(queue)
    }

    /// Look up a registered queue.
    pub fn queue(&self, name: &str) -> Option<TaskQueue<serde_json::Value>> {
        self.queues.get(name).map(|entry| entry.value().clone())
    }

    /// Depth of every registered queue, by name.
    pub fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().depth()))
            .collect()
    }

    /// Close every queue: further enqueues fail while existing items drain.
    pub fn close_queues(&self) {
        for entry in self.queues.iter() {
            entry.value().close();
        }
    }

    //───────────────────── bus ─────────────────────

    /// Publish `payload` on `topic`.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) -> PublishOutcome {
        let outcome = self.bus.publish(topic, payload);
        if !outcome.fully_delivered() {
            warn!(
                agent = %self.id,
                topic,
                overflowed = outcome.overflowed.len(),
                "bus publish overflowed subscriber queues"
            );
        }
        outcome
    }

    /// Publish a state-change notification (`{ type, id, timestamp, ... }`).
    pub fn notify(&self, kind: &str, subject: &str, payload: serde_json::Value) {
        emit_notification(&self.bus, kind, subject, payload);
    }

    /// Subscribe to a bus topic with a bounded delivery queue.
    pub fn subscribe(&self, topic: &str, depth: usize) -> Subscription {
        self.bus.subscribe(topic, depth)
    }

    /// The shared bus handle.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }
}
