//! Agent supervision: lifecycle transitions and background-loop hosting.
//!
//! The [`AgentHost`] wraps one agent value and drives it through
//! `Initializing → Running → Draining → Stopped` (or `Failed`). Loop bodies
//! run one iteration at a time: an iteration always runs to completion so
//! in-flight work is never torn mid-task, while the pause between iterations
//! and the body's own suspension points observe the shutdown token. Loops
//! that ignore the token are force-aborted at the stop deadline and the agent
//! is marked `Failed`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use mycel_types::AgentId;

use crate::{
    Agent, AgentContext, AgentError, AgentStatus, LoopSpec, LOOP_BACKOFF_BASE, LOOP_BACKOFF_MAX,
};

/// Consecutive loop failures after which backoff stops growing.
const MAX_COUNTED_FAILURES: u32 = 8;

/// Bus topic error outcomes are published on for the audit trail.
pub const AGENT_ERROR_TOPIC: &str = "agent.error";

//─────────────────────────────
//  Health snapshot
//─────────────────────────────

/// Point-in-time health of one hosted agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    /// Agent id.
    pub id: AgentId,
    /// Human-readable name.
    pub name: String,
    /// Lifecycle status.
    pub status: AgentStatus,
    /// Milliseconds since the last heartbeat.
    pub last_heartbeat_ms: u64,
    /// Depth of every registered queue.
    pub queue_depths: std::collections::BTreeMap<String, usize>,
    /// Agent metrics snapshot.
    pub metrics: std::collections::BTreeMap<String, f64>,
}

//─────────────────────────────
//  Host
//─────────────────────────────

/// Supervisor for one agent value.
pub struct AgentHost {
    agent: Arc<dyn Agent>,
    ctx: Arc<AgentContext>,
    loops: tokio::sync::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl AgentHost {
    /// Wrap `agent` with its prepared context.
    pub fn new(agent: Arc<dyn Agent>, ctx: AgentContext) -> Self {
        Self {
            agent,
            ctx: Arc::new(ctx),
            loops: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// The hosted agent's id.
    pub fn id(&self) -> &AgentId {
        self.ctx.id()
    }

    /// The agent's context (read-side: health, queue depths).
    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Current lifecycle status.
    pub fn status(&self) -> AgentStatus {
        self.ctx.status()
    }

    /// Run `initialize`, retrying up to `attempts` times before failing the
    /// agent.
    #[instrument(skip(self), fields(agent = %self.ctx.id()))]
    pub async fn initialize(&self, attempts: u32) -> Result<(), AgentError> {
        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.agent.initialize(&self.ctx).await {
                Ok(()) => {
                    debug!(attempt, "agent initialized");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "agent initialization attempt failed");
                    last_error = Some(err);
                }
            }
        }
        self.ctx.runtime().set_status(AgentStatus::Failed);
        self.ctx.notify(
            "agent.failed",
            self.ctx.id().as_str(),
            serde_json::json!({ "phase": "initialize" }),
        );
        Err(last_error
            .unwrap_or_else(|| AgentError::Initialization("no attempts executed".to_string())))
    }

    /// Transition Initializing→Running and spawn every declared loop.
    #[instrument(skip(self), fields(agent = %self.ctx.id()))]
    pub async fn start(&self) -> Result<(), AgentError> {
        let status = self.ctx.status();
        if status != AgentStatus::Initializing {
            return Err(AgentError::Unavailable { status });
        }
        self.ctx.runtime().set_status(AgentStatus::Running);
        self.ctx.heartbeat();

        let mut loops = self.loops.lock().await;
        for spec in self.agent.loops() {
            let agent = Arc::clone(&self.agent);
            let ctx = Arc::clone(&self.ctx);
            let name = spec.name.clone();
            let handle = tokio::spawn(supervised_loop(agent, ctx, spec));
            loops.push((name, handle));
        }
        info!(loops = loops.len(), "agent running");
        self.ctx.notify(
            "agent.started",
            self.ctx.id().as_str(),
            serde_json::Value::Object(Default::default()),
        );
        Ok(())
    }

    /// Drain and stop the agent within `deadline`.
    ///
    /// New work is refused as soon as draining begins; queued work keeps
    /// draining and the current loop iterations finish. Loops still alive at
    /// the deadline are aborted and the agent is marked `Failed`.
    #[instrument(skip(self), fields(agent = %self.ctx.id()))]
    pub async fn stop(&self, deadline: Duration) -> AgentStatus {
        match self.ctx.status() {
            AgentStatus::Stopped | AgentStatus::Failed => return self.ctx.status(),
            _ => {}
        }
        self.ctx.runtime().set_status(AgentStatus::Draining);
        self.ctx.notify(
            "agent.draining",
            self.ctx.id().as_str(),
            serde_json::Value::Object(Default::default()),
        );
        self.ctx.close_queues();
        self.ctx.trigger_shutdown();

        let mut loops = self.loops.lock().await;
        let handles: Vec<(String, JoinHandle<()>)> = loops.drain(..).collect();
        let aborts: Vec<tokio::task::AbortHandle> =
            handles.iter().map(|(_, handle)| handle.abort_handle()).collect();
        let mut forced = false;
        let join_all = async {
            for (name, handle) in handles {
                if let Err(err) = handle.await {
                    if !err.is_cancelled() {
                        error!(loop_name = %name, error = %err, "loop task panicked");
                    }
                }
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!("stop deadline exceeded; aborting remaining loops");
            for abort in aborts {
                abort.abort();
            }
            forced = true;
        }

        let final_status = if forced {
            AgentStatus::Failed
        } else {
            match self.agent.shutdown(&self.ctx).await {
                Ok(()) => AgentStatus::Stopped,
                Err(err) => {
                    error!(error = %err, "agent shutdown hook failed");
                    AgentStatus::Failed
                }
            }
        };
        self.ctx.runtime().set_status(final_status);
        self.ctx.notify(
            if final_status == AgentStatus::Stopped { "agent.stopped" } else { "agent.failed" },
            self.ctx.id().as_str(),
            serde_json::Value::Object(Default::default()),
        );
        info!(status = ?final_status, "agent stopped");
        final_status
    }

    /// Execute a public operation against the hosted agent.
    ///
    /// Refused unless the agent is `Running`. Unknown operations never reach
    /// the agent. A typed error triggers the agent's `handle_error` decision,
    /// which is published for the audit trail before the error propagates.
    #[instrument(skip(self, params), fields(agent = %self.ctx.id(), operation))]
    pub async fn call(
        &self,
        operation: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, AgentError> {
        let status = self.ctx.status();
        if status != AgentStatus::Running {
            return Err(AgentError::Unavailable { status });
        }
        if !self.agent.operations().iter().any(|op| op == operation) {
            return Err(AgentError::UnknownOperation(operation.to_string()));
        }
        match self.agent.handle(operation, params, &self.ctx).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let (kind, data) = err.classify();
                let outcome = self.agent.handle_error(kind.clone(), data.clone(), &self.ctx).await;
                publish_error_outcome(&self.ctx, Some(operation), None, &kind, &data, &outcome);
                Err(err)
            }
        }
    }

    /// Point-in-time health snapshot.
    pub fn health(&self) -> AgentHealth {
        let runtime = self.ctx.runtime();
        AgentHealth {
            id: self.ctx.id().clone(),
            name: self.agent.descriptor().name.clone(),
            status: runtime.status(),
            last_heartbeat_ms: runtime.heartbeat_age().as_millis() as u64,
            queue_depths: self.ctx.queue_depths(),
            metrics: runtime.metrics(),
        }
    }
}

//─────────────────────────────
//  Loop supervision
//─────────────────────────────

async fn supervised_loop(agent: Arc<dyn Agent>, ctx: Arc<AgentContext>, spec: LoopSpec) {
    let token = ctx.shutdown_token();
    let mut consecutive_failures: u32 = 0;
    debug!(agent = %ctx.id(), loop_name = %spec.name, "loop starting");

    loop {
        if token.is_cancelled() {
            break;
        }
        ctx.heartbeat();

        // The iteration always runs to completion: in-flight work finishes
        // even while draining. The body observes the token at its own
        // suspension points.
        match agent.run_loop(&spec.name, &ctx).await {
            Ok(()) => consecutive_failures = 0,
            Err(err) => {
                consecutive_failures = (consecutive_failures + 1).min(MAX_COUNTED_FAILURES);
                warn!(
                    agent = %ctx.id(),
                    loop_name = %spec.name,
                    consecutive_failures,
                    error = %err,
                    "loop iteration failed"
                );
                let (kind, data) = err.classify();
                let outcome = agent.handle_error(kind.clone(), data.clone(), &ctx).await;
                publish_error_outcome(&ctx, None, Some(&spec.name), &kind, &data, &outcome);
            }
        }

        if token.is_cancelled() {
            break;
        }
        let pause = if consecutive_failures == 0 {
            spec.interval
        } else {
            backoff_delay(consecutive_failures)
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    debug!(agent = %ctx.id(), loop_name = %spec.name, "loop exited");
}

/// Exponential backoff for failing loops, capped at [`LOOP_BACKOFF_MAX`].
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(MAX_COUNTED_FAILURES);
    let delay = LOOP_BACKOFF_BASE.saturating_mul(2u32.saturating_pow(exp));
    delay.min(LOOP_BACKOFF_MAX)
}

fn publish_error_outcome(
    ctx: &AgentContext,
    operation: Option<&str>,
    loop_name: Option<&str>,
    kind: &crate::ErrorKind,
    data: &serde_json::Value,
    outcome: &crate::ErrorOutcome,
) {
    let payload = serde_json::json!({
        "agent": ctx.id().as_str(),
        "operation": operation,
        "loop": loop_name,
        "kind": kind.as_str(),
        "data": data,
        "outcome": outcome,
    });
    ctx.emit(AGENT_ERROR_TOPIC, payload);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mycel_bus::MessageBus;
    use mycel_types::{AgentDescriptor, AgentKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct WorkerAgent {
        descriptor: AgentDescriptor,
        processed: AtomicU32,
        fail_iterations: AtomicU32,
        errors_handled: AtomicU32,
    }

    impl WorkerAgent {
        fn new(id: &str) -> Self {
            Self {
                descriptor: AgentDescriptor {
                    id: mycel_types::AgentId::from(id),
                    name: id.to_string(),
                    kind: AgentKind::Bio,
                    config: serde_json::Value::Null,
                    dependencies: Vec::new(),
                },
                processed: AtomicU32::new(0),
                fail_iterations: AtomicU32::new(0),
                errors_handled: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Agent for WorkerAgent {
        fn descriptor(&self) -> &AgentDescriptor {
            &self.descriptor
        }

        async fn initialize(&self, ctx: &AgentContext) -> Result<(), AgentError> {
            if ctx.queue("work").is_none() {
                ctx.register_queue("work", 8)?;
            }
            Ok(())
        }

        fn operations(&self) -> Vec<String> {
            vec!["enqueue".to_string(), "processed".to_string()]
        }

        async fn handle(
            &self,
            operation: &str,
            params: serde_json::Value,
            ctx: &AgentContext,
        ) -> Result<serde_json::Value, AgentError> {
            match operation {
                "enqueue" => {
                    let queue = ctx.queue("work").ok_or_else(|| {
                        AgentError::Internal("work queue missing".to_string())
                    })?;
                    queue.enqueue(params).map_err(|(_, err)| AgentError::Queue(err))?;
                    Ok(serde_json::json!({ "enqueued": true }))
                }
                "processed" => Ok(serde_json::json!(self.processed.load(Ordering::SeqCst))),
                other => Err(AgentError::UnknownOperation(other.to_string())),
            }
        }

        async fn handle_error(
            &self,
            kind: crate::ErrorKind,
            _data: serde_json::Value,
            _ctx: &AgentContext,
        ) -> crate::ErrorOutcome {
            self.errors_handled.fetch_add(1, Ordering::SeqCst);
            match kind {
                crate::ErrorKind::Resource => {
                    crate::ErrorOutcome::handled(crate::RecoveryAction::MarkedFailed)
                }
                _ => crate::ErrorOutcome::unknown_kind(),
            }
        }

        fn loops(&self) -> Vec<LoopSpec> {
            vec![LoopSpec::with_interval("work-loop", Duration::from_millis(5))]
        }

        async fn run_loop(&self, _name: &str, ctx: &AgentContext) -> Result<(), AgentError> {
            if self.fail_iterations.load(Ordering::SeqCst) > 0 {
                self.fail_iterations.fetch_sub(1, Ordering::SeqCst);
                return Err(AgentError::Resource {
                    subject: "c1".to_string(),
                    detail: "contaminated".to_string(),
                });
            }
            let queue = match ctx.queue("work") {
                Some(queue) => queue,
                None => return Ok(()),
            };
            let token = ctx.shutdown_token();
            tokio::select! {
                _ = token.cancelled() => {}
                lease = queue.dequeue() => {
                    if let Some(lease) = lease {
                        // Simulated in-flight work.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        lease.done();
                        self.processed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Ok(())
        }
    }

    async fn hosted(id: &str) -> (tempfile::TempDir, Arc<WorkerAgent>, AgentHost) {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(WorkerAgent::new(id));
        let ctx = AgentContext::create(
            mycel_types::AgentId::from(id),
            dir.path(),
            MessageBus::new(),
        )
        .await
        .unwrap();
        let host = AgentHost::new(agent.clone() as Arc<dyn Agent>, ctx);
        (dir, agent, host)
    }

    #[tokio::test]
    async fn lifecycle_reaches_stopped() {
        let (_dir, _agent, host) = hosted("w1").await;
        host.initialize(3).await.unwrap();
        host.start().await.unwrap();
        assert_eq!(host.status(), AgentStatus::Running);
        let status = host.stop(Duration::from_secs(1)).await;
        assert_eq!(status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn in_flight_task_finishes_during_stop() {
        let (_dir, agent, host) = hosted("w2").await;
        host.initialize(1).await.unwrap();
        host.start().await.unwrap();

        host.call("enqueue", serde_json::json!({ "task": "a" })).await.unwrap();
        // Give the loop a moment to pick the task up.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let status = host.stop(Duration::from_secs(1)).await;
        assert_eq!(status, AgentStatus::Stopped);
        assert_eq!(agent.processed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn calls_refused_while_not_running() {
        let (_dir, _agent, host) = hosted("w3").await;
        host.initialize(1).await.unwrap();
        let err = host.call("enqueue", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected_before_the_agent() {
        let (_dir, _agent, host) = hosted("w4").await;
        host.initialize(1).await.unwrap();
        host.start().await.unwrap();
        let err = host.call("does_not_exist", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownOperation(_)));
        host.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn loop_failures_route_through_handle_error() {
        let (_dir, agent, host) = hosted("w5").await;
        agent.fail_iterations.store(2, Ordering::SeqCst);
        host.initialize(1).await.unwrap();
        host.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(agent.errors_handled.load(Ordering::SeqCst) >= 1);
        host.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn new_enqueues_fail_once_draining() {
        let (_dir, _agent, host) = hosted("w6").await;
        host.initialize(1).await.unwrap();
        host.start().await.unwrap();
        let status = host.stop(Duration::from_secs(1)).await;
        assert_eq!(status, AgentStatus::Stopped);
        let err = host.call("enqueue", serde_json::Value::Null).await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { .. }));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), LOOP_BACKOFF_BASE);
        assert_eq!(backoff_delay(2), LOOP_BACKOFF_BASE * 2);
        assert!(backoff_delay(32) <= LOOP_BACKOFF_MAX);
    }
}
