//! Biological research records agent.
//!
//! Owns bio data records (cultures, samples, sequence files) and three
//! pipelines: `analysis` re-derives summary metadata for a record, `import`
//! creates records from external drops, `export` materializes a record into
//! the agent's `exports/` directory. Records are persisted on every state
//! transition and every transition is announced on the bus.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use mycel_agent::{
    Agent, AgentContext, AgentError, ErrorKind, ErrorOutcome, LoopSpec, RecoveryAction,
};
use mycel_store_core::DocumentStore;
use mycel_types::AgentDescriptor;

use crate::{parse_params, MAX_TASK_ATTEMPTS};

//─────────────────────────────
//  Record model
//─────────────────────────────

/// Lifecycle status of a bio record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BioRecordStatus {
    /// Usable record.
    Active,
    /// A pipeline is currently working on it.
    Processing,
    /// A resource failure marked the underlying material contaminated.
    Contaminated,
    /// The record's data is unusable.
    Invalid,
}

/// One biological data record, exclusively owned by the bio agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BioRecord {
    /// Record id.
    pub id: String,
    /// Record type (`culture`, `sample`, `sequence`, ...).
    pub record_type: String,
    /// Data format (`fastq`, `csv`, `image`, ...).
    pub format: String,
    /// Where the data came from.
    pub source: String,
    /// Species, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    /// Storage paths associated with the record.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Lifecycle status.
    pub status: BioRecordStatus,
    /// Derived analysis summary, refreshed by the analysis pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

//─────────────────────────────
//  Configuration and params
//─────────────────────────────

fn default_queue_capacity() -> usize {
    64
}

/// Builder configuration carried in the agent descriptor.
#[derive(Debug, Clone, Deserialize)]
pub struct BioConfig {
    /// Capacity of each pipeline queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for BioConfig {
    fn default() -> Self {
        Self { queue_capacity: default_queue_capacity() }
    }
}

#[derive(Debug, Deserialize)]
struct CreateRecordParams {
    record_type: String,
    format: String,
    source: String,
    #[serde(default)]
    species: Option<String>,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RecordIdParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ImportParams {
    source: String,
    format: String,
    path: String,
    #[serde(default)]
    species: Option<String>,
}

//─────────────────────────────
//  Agent
//─────────────────────────────

/// The biological research records agent.
pub struct BioAgent {
    descriptor: AgentDescriptor,
    config: BioConfig,
    /// Bumped whenever `api_error` remediation reinitializes the lab client.
    client_generation: AtomicU64,
}

impl BioAgent {
    /// Build the agent from its registration descriptor.
    pub fn from_descriptor(descriptor: &AgentDescriptor) -> Result<Self, String> {
        let config = if descriptor.config.is_null() {
            BioConfig::default()
        } else {
            serde_json::from_value(descriptor.config.clone())
                .map_err(|err| format!("invalid bio agent config: {err}"))?
        };
        Ok(Self {
            descriptor: descriptor.clone(),
            config,
            client_generation: AtomicU64::new(0),
        })
    }

    /// Generation counter of the lab API client; bumps on reinitialization.
    pub fn client_generation(&self) -> u64 {
        self.client_generation.load(Ordering::SeqCst)
    }

    async fn load_record(&self, ctx: &AgentContext, id: &str) -> Result<BioRecord, AgentError> {
        let value = ctx
            .documents()
            .get(id)
            .await?
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        serde_json::from_value(value)
            .map_err(|err| AgentError::Internal(format!("corrupt record '{id}': {err}")))
    }

    async fn persist(&self, ctx: &AgentContext, record: &BioRecord) -> Result<(), AgentError> {
        let value = serde_json::to_value(record)
            .map_err(|err| AgentError::Internal(err.to_string()))?;
        ctx.documents().put(&record.id, &value).await?;
        Ok(())
    }

    async fn create_record(
        &self,
        ctx: &AgentContext,
        params: CreateRecordParams,
    ) -> Result<BioRecord, AgentError> {
        let now = Utc::now();
        let record = BioRecord {
            id: format!("bio-{}", uuid::Uuid::new_v4()),
            record_type: params.record_type,
            format: params.format,
            source: params.source,
            species: params.species,
            paths: params.paths,
            status: BioRecordStatus::Active,
            analysis: None,
            created_at: now,
            updated_at: now,
        };
        self.persist(ctx, &record).await?;
        ctx.notify("record.created", &record.id, json!({ "record_type": record.record_type }));
        ctx.runtime().metric_add("records_created", 1.0);
        Ok(record)
    }

    fn enqueue_task(
        &self,
        ctx: &AgentContext,
        queue_name: &str,
        task: serde_json::Value,
    ) -> Result<(), AgentError> {
        let queue = ctx
            .queue(queue_name)
            .ok_or_else(|| AgentError::Internal(format!("queue '{queue_name}' missing")))?;
        queue.enqueue(task).map_err(|(_, err)| AgentError::Queue(err))
    }

    /// One worker iteration over the named pipeline queue.
    async fn work(&self, pipeline: &str, ctx: &AgentContext) -> Result<(), AgentError> {
        let queue = match ctx.queue(pipeline) {
            Some(queue) => queue,
            None => return Ok(()),
        };
        let token = ctx.shutdown_token();
        // Wake periodically even when idle so the heartbeat stays fresh.
        let lease = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => return Ok(()),
            lease = queue.dequeue() => match lease {
                Some(lease) => lease,
                None => return Ok(()),
            },
        };

        // The lease stays in flight until processing settles.
        let result = match pipeline {
            "analysis" => self.run_analysis(ctx, lease.task()).await,
            "import" => self.run_import(ctx, lease.task()).await,
            "export" => self.run_export(ctx, lease.task()).await,
            other => Err(AgentError::Internal(format!("no worker for pipeline '{other}'"))),
        };

        match result {
            Ok(()) => {
                lease.done();
                ctx.runtime().metric_add(&format!("{pipeline}_completed"), 1.0);
                Ok(())
            }
            Err(AgentError::NotFound(id)) => {
                // The subject disappeared; nothing to retry against.
                lease.done();
                warn!(pipeline, id = %id, "task target missing; dropping task");
                ctx.runtime().metric_add(&format!("{pipeline}_dropped"), 1.0);
                Ok(())
            }
            Err(AgentError::Store(err)) => {
                // Transient persistence trouble: requeue at the tail with a
                // bounded attempt counter.
                let task = lease.done();
                let attempt = task.get("attempt").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
                if attempt >= MAX_TASK_ATTEMPTS {
                    warn!(pipeline, %err, attempt, "task exhausted retries; dropping");
                    ctx.runtime().metric_add(&format!("{pipeline}_dropped"), 1.0);
                    return Ok(());
                }
                let mut retried = task;
                if let Some(map) = retried.as_object_mut() {
                    map.insert("attempt".to_string(), json!(attempt));
                }
                self.enqueue_task(ctx, pipeline, retried)?;
                Err(AgentError::Store(err))
            }
            Err(err) => {
                lease.done();
                Err(err)
            }
        }
    }

    async fn run_analysis(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let id = task
            .get("record_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidParams("analysis task needs record_id".to_string()))?;
        let mut record = self.load_record(ctx, id).await?;
        if record.status == BioRecordStatus::Contaminated {
            return Err(AgentError::Resource {
                subject: record.id.clone(),
                detail: "cannot analyze contaminated material".to_string(),
            });
        }

        record.status = BioRecordStatus::Processing;
        record.updated_at = Utc::now();
        self.persist(ctx, &record).await?;

        // Summary derivation only; the actual science lives outside this core.
        record.analysis = Some(json!({
            "paths_indexed": record.paths.len(),
            "format": record.format,
            "client_generation": self.client_generation(),
            "analyzed_at": Utc::now().to_rfc3339(),
        }));
        record.status = BioRecordStatus::Active;
        record.updated_at = Utc::now();
        self.persist(ctx, &record).await?;

        ctx.notify("analysis.completed", &record.id, json!({ "format": record.format }));
        debug!(record = %record.id, "analysis complete");
        Ok(())
    }

    async fn run_import(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let params: ImportParams = parse_params(task.clone())?;
        let record = self
            .create_record(
                ctx,
                CreateRecordParams {
                    record_type: "imported".to_string(),
                    format: params.format,
                    source: params.source,
                    species: params.species,
                    paths: vec![params.path],
                },
            )
            .await?;
        ctx.notify("import.completed", &record.id, json!({ "source": record.source }));
        Ok(())
    }

    async fn run_export(
        &self,
        ctx: &AgentContext,
        task: &serde_json::Value,
    ) -> Result<(), AgentError> {
        let id = task
            .get("record_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidParams("export task needs record_id".to_string()))?;
        let record = self.load_record(ctx, id).await?;

        let export_dir = ctx.data_dir().join("exports");
        tokio::fs::create_dir_all(&export_dir)
            .await
            .map_err(mycel_store_core::StoreError::from)?;
        let path = export_dir.join(format!("{}.json", record.id));
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|err| AgentError::Internal(err.to_string()))?;
        mycel_store_core::atomic_write(&path, &bytes).await?;

        ctx.notify(
            "export.completed",
            &record.id,
            json!({ "path": path.to_string_lossy() }),
        );
        Ok(())
    }
}

#[async_trait]
impl Agent for BioAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn initialize(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        for pipeline in ["analysis", "import", "export"] {
            if ctx.queue(pipeline).is_none() {
                ctx.register_queue(pipeline, self.config.queue_capacity)?;
            }
        }
        info!(agent = %ctx.id(), "bio agent initialized");
        Ok(())
    }

    fn operations(&self) -> Vec<String> {
        [
            "create_record",
            "get_record",
            "list_records",
            "delete_record",
            "record_status",
            "queue_analysis",
            "queue_import",
            "queue_export",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn handle(
        &self,
        operation: &str,
        params: serde_json::Value,
        ctx: &AgentContext,
    ) -> Result<serde_json::Value, AgentError> {
        match operation {
            "create_record" => {
                let record = self.create_record(ctx, parse_params(params)?).await?;
                Ok(serde_json::to_value(record).unwrap_or_default())
            }
            "get_record" => {
                let params: RecordIdParams = parse_params(params)?;
                let record = self.load_record(ctx, &params.id).await?;
                Ok(serde_json::to_value(record).unwrap_or_default())
            }
            "list_records" => {
                let ids = ctx.documents().list_ids().await?;
                Ok(json!({ "records": ids, "count": ids.len() }))
            }
            "delete_record" => {
                let params: RecordIdParams = parse_params(params)?;
                let existed = ctx.documents().delete(&params.id).await?;
                if !existed {
                    return Err(AgentError::NotFound(params.id));
                }
                ctx.notify("record.deleted", &params.id, json!({}));
                Ok(json!({ "deleted": true }))
            }
            "record_status" => {
                let params: RecordIdParams = parse_params(params)?;
                let record = self.load_record(ctx, &params.id).await?;
                Ok(json!({ "id": record.id, "status": record.status }))
            }
            "queue_analysis" => {
                let params: RecordIdParams = parse_params(params)?;
                // Validate the subject before accepting the task.
                self.load_record(ctx, &params.id).await?;
                self.enqueue_task(ctx, "analysis", json!({ "record_id": params.id }))?;
                Ok(json!({ "queued": true }))
            }
            "queue_import" => {
                let params: ImportParams = parse_params(params)?;
                self.enqueue_task(
                    ctx,
                    "import",
                    json!({
                        "source": params.source,
                        "format": params.format,
                        "path": params.path,
                        "species": params.species,
                    }),
                )?;
                Ok(json!({ "queued": true }))
            }
            "queue_export" => {
                let params: RecordIdParams = parse_params(params)?;
                self.load_record(ctx, &params.id).await?;
                self.enqueue_task(ctx, "export", json!({ "record_id": params.id }))?;
                Ok(json!({ "queued": true }))
            }
            other => Err(AgentError::UnknownOperation(other.to_string())),
        }
    }

    async fn handle_error(
        &self,
        kind: ErrorKind,
        data: serde_json::Value,
        ctx: &AgentContext,
    ) -> ErrorOutcome {
        match kind {
            ErrorKind::Resource => {
                let Some(subject) = data.get("subject").and_then(|v| v.as_str()) else {
                    return ErrorOutcome::unknown_kind().with_detail("resource_error without subject");
                };
                let detail = data.get("detail").and_then(|v| v.as_str()).unwrap_or_default();
                let status = if detail.contains("contaminat") {
                    BioRecordStatus::Contaminated
                } else {
                    BioRecordStatus::Invalid
                };
                match self.load_record(ctx, subject).await {
                    Ok(mut record) => {
                        record.status = status;
                        record.updated_at = Utc::now();
                        if let Err(err) = self.persist(ctx, &record).await {
                            return ErrorOutcome {
                                success: false,
                                action: RecoveryAction::MarkedFailed,
                                subject: Some(subject.to_string()),
                                detail: Some(format!("persist failed: {err}")),
                            };
                        }
                        ctx.notify(
                            "record.quarantined",
                            subject,
                            json!({ "status": record.status }),
                        );
                        ErrorOutcome::handled(RecoveryAction::MarkedFailed).with_subject(subject)
                    }
                    Err(err) => ErrorOutcome {
                        success: false,
                        action: RecoveryAction::MarkedFailed,
                        subject: Some(subject.to_string()),
                        detail: Some(err.to_string()),
                    },
                }
            }
            ErrorKind::Api => {
                let service = data
                    .get("service")
                    .and_then(|v| v.as_str())
                    .unwrap_or("lab")
                    .to_string();
                let generation = self.client_generation.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.notify(
                    "api.client.reinitialized",
                    &service,
                    json!({ "generation": generation }),
                );
                ErrorOutcome::handled(RecoveryAction::ClientReinitialized).with_subject(service)
            }
            _ => ErrorOutcome::unknown_kind(),
        }
    }

    fn loops(&self) -> Vec<LoopSpec> {
        vec![
            LoopSpec::new("analysis-worker"),
            LoopSpec::new("import-worker"),
            LoopSpec::new("export-worker"),
        ]
    }

    async fn run_loop(&self, name: &str, ctx: &AgentContext) -> Result<(), AgentError> {
        match name {
            "analysis-worker" => self.work("analysis", ctx).await,
            "import-worker" => self.work("import", ctx).await,
            "export-worker" => self.work("export", ctx).await,
            other => Err(AgentError::Internal(format!("unknown loop '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mycel_bus::MessageBus;
    use mycel_types::{AgentId, AgentKind};

    fn descriptor() -> AgentDescriptor {
        AgentDescriptor {
            id: AgentId::from("mycology_bio"),
            name: "Mycology bio records".to_string(),
            kind: AgentKind::Bio,
            config: serde_json::Value::Null,
            dependencies: Vec::new(),
        }
    }

    async fn agent_ctx() -> (tempfile::TempDir, BioAgent, AgentContext) {
        let dir = tempfile::tempdir().unwrap();
        let agent = BioAgent::from_descriptor(&descriptor()).unwrap();
        let ctx = AgentContext::create(AgentId::from("mycology_bio"), dir.path(), MessageBus::new())
            .await
            .unwrap();
        agent.initialize(&ctx).await.unwrap();
        (dir, agent, ctx)
    }

    fn create_params() -> serde_json::Value {
        json!({
            "record_type": "culture",
            "format": "csv",
            "source": "lab-3",
            "species": "Pleurotus ostreatus",
            "paths": ["/data/cultures/c42.csv"]
        })
    }

    #[tokio::test]
    async fn create_and_fetch_record() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let created = agent.handle("create_record", create_params(), &ctx).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = agent.handle("get_record", json!({ "id": id }), &ctx).await.unwrap();
        assert_eq!(fetched["species"], "Pleurotus ostreatus");
        assert_eq!(fetched["status"], "active");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (_dir, agent, ctx) = agent_ctx().await;
        agent.initialize(&ctx).await.unwrap();
        agent.initialize(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn analysis_pipeline_updates_the_record() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let created = agent.handle("create_record", create_params(), &ctx).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        agent.handle("queue_analysis", json!({ "id": id }), &ctx).await.unwrap();
        agent.run_loop("analysis-worker", &ctx).await.unwrap();

        let fetched = agent.handle("get_record", json!({ "id": id }), &ctx).await.unwrap();
        assert_eq!(fetched["status"], "active");
        assert_eq!(fetched["analysis"]["paths_indexed"], 1);
    }

    #[tokio::test]
    async fn import_pipeline_creates_a_record() {
        let (_dir, agent, ctx) = agent_ctx().await;
        agent
            .handle(
                "queue_import",
                json!({ "source": "nas", "format": "fastq", "path": "/drop/seq-1.fastq" }),
                &ctx,
            )
            .await
            .unwrap();
        agent.run_loop("import-worker", &ctx).await.unwrap();

        let listed = agent.handle("list_records", json!({}), &ctx).await.unwrap();
        assert_eq!(listed["count"], 1);
    }

    #[tokio::test]
    async fn export_pipeline_writes_a_file() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let created = agent.handle("create_record", create_params(), &ctx).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        agent.handle("queue_export", json!({ "id": id }), &ctx).await.unwrap();
        agent.run_loop("export-worker", &ctx).await.unwrap();

        let exported = ctx.data_dir().join("exports").join(format!("{id}.json"));
        assert!(exported.is_file());
    }

    #[tokio::test]
    async fn resource_error_quarantines_the_subject() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let created = agent.handle("create_record", create_params(), &ctx).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let outcome = agent
            .handle_error(
                ErrorKind::Resource,
                json!({ "subject": id, "detail": "visible contamination on plate" }),
                &ctx,
            )
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.action, RecoveryAction::MarkedFailed);

        let fetched = agent.handle("record_status", json!({ "id": id }), &ctx).await.unwrap();
        assert_eq!(fetched["status"], "contaminated");
    }

    #[tokio::test]
    async fn api_error_reinitializes_the_client() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let before = agent.client_generation();
        let outcome = agent
            .handle_error(ErrorKind::Api, json!({ "service": "sequencer" }), &ctx)
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.action, RecoveryAction::ClientReinitialized);
        assert_eq!(agent.client_generation(), before + 1);
    }

    #[tokio::test]
    async fn unknown_kinds_return_the_required_outcome() {
        let (_dir, agent, ctx) = agent_ctx().await;
        let outcome = agent
            .handle_error(ErrorKind::Other("market_error".to_string()), json!({}), &ctx)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.detail.as_deref(), Some("unknown error kind"));
    }

    #[tokio::test]
    async fn queue_full_propagates_to_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = descriptor();
        descriptor.config = json!({ "queue_capacity": 1 });
        let agent = BioAgent::from_descriptor(&descriptor).unwrap();
        let ctx = AgentContext::create(AgentId::from("mycology_bio"), dir.path(), MessageBus::new())
            .await
            .unwrap();
        agent.initialize(&ctx).await.unwrap();

        let created = agent.handle("create_record", create_params(), &ctx).await.unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        agent.handle("queue_analysis", json!({ "id": id }), &ctx).await.unwrap();
        let err = agent
            .handle("queue_analysis", json!({ "id": id }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), mycel_types::ErrorCode::QueueFull);
    }
}
