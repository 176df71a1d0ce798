//! Dual-sink immutable audit trail.
//!
//! Every terminal command outcome is written to the relational `audit` table
//! and to an append-only JSONL file. The relational write is the commit
//! point: if the file write fails afterwards, the record stands in the
//! database and an `audit.divergence` notification is emitted so operators
//! can reconcile the sinks. Records are never modified after the fact.

use tracing::warn;

use mycel_bus::{emit_notification, MessageBus};
use mycel_store_core::canonical_sha256;
use mycel_store_fs::JsonlSink;
use mycel_store_sqlite::SqliteStore;
use mycel_types::{AuditQuery, AuditRecord};

use crate::FabricError;

/// Two-sink audit writer.
pub struct AuditLogger {
    store: SqliteStore,
    sink: JsonlSink,
    bus: MessageBus,
}

impl AuditLogger {
    /// Build a logger over the relational store and the JSONL sink.
    pub fn new(store: SqliteStore, sink: JsonlSink, bus: MessageBus) -> Self {
        Self { store, sink, bus }
    }

    /// Canonical SHA-256 digest of a params/response value.
    pub fn hash_value(value: &serde_json::Value) -> String {
        canonical_sha256(value)
    }

    /// Commit one audit record to both sinks.
    ///
    /// The database row must land; a JSONL failure degrades to a divergence
    /// notification rather than failing the command.
    pub async fn record(&self, record: &AuditRecord) -> Result<(), FabricError> {
        self.store
            .insert_audit(record)
            .await
            .map_err(|err| FabricError::Audit(err.to_string()))?;

        let line = serde_json::to_value(record)
            .map_err(|err| FabricError::Audit(format!("serializing audit record: {err}")))?;
        if let Err(err) = self.sink.append(&line).await {
            warn!(
                record = %record.id,
                request_id = %record.request_id,
                error = %err,
                "audit JSONL write failed; sinks diverged"
            );
            emit_notification(
                &self.bus,
                "audit.divergence",
                &record.id,
                serde_json::json!({
                    "request_id": record.request_id,
                    "error": err.to_string(),
                }),
            );
        }
        Ok(())
    }

    /// Query audit rows, newest first.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>, FabricError> {
        self.store
            .query_audit(query)
            .await
            .map_err(|err| FabricError::Audit(err.to_string()))
    }

    /// All audit rows for one request id, oldest first.
    pub async fn by_request(&self, request_id: &str) -> Result<Vec<AuditRecord>, FabricError> {
        self.store
            .audit_by_request(request_id)
            .await
            .map_err(|err| FabricError::Audit(err.to_string()))
    }
}
