#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **mycel-store-sqlite** – SQLite relational store for Mycel.
//!
//! This crate persists the append-only `audit` and `events` tables via sqlx.
//! Audit rows are written in a single-row transaction and never updated or
//! deleted; event rows gain only a `handled` flag after insertion. Retention
//! is an external concern.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use mycel_types::{
    AuditQuery, AuditRecord, AuditStatus, EventRecord, EventSeverity, IntegrationCategory,
    RiskLevel,
};

/// Default cap on rows returned by audit queries.
const DEFAULT_QUERY_LIMIT: u32 = 100;

//─────────────────────────────
//  Store
//─────────────────────────────

/// SQLite-backed relational store for audit and event rows.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database at `path` and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let database_url = format!("sqlite://{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePool::connect(&database_url)
            .await
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory database (testing and ephemeral deployments).
    ///
    /// Capped at one connection: each SQLite `:memory:` connection is its own
    /// database, so a wider pool would scatter the tables.
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Build a store from an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Ensure the schema is current.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                request_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                integration TEXT NOT NULL,
                action TEXT NOT NULL,
                category TEXT,
                params_hash TEXT NOT NULL,
                response_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                error_message TEXT,
                risk TEXT,
                confirmed INTEGER NOT NULL,
                correlation_id TEXT,
                metadata TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL,
                event_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                correlation_id TEXT,
                data TEXT NOT NULL,
                handled INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_audit_request_id ON audit(request_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit(actor)",
            "CREATE INDEX IF NOT EXISTS idx_audit_integration ON audit(integration)",
            "CREATE INDEX IF NOT EXISTS idx_audit_status ON audit(status)",
            "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC)",
            "CREATE INDEX IF NOT EXISTS idx_events_source ON events(source)",
            "CREATE INDEX IF NOT EXISTS idx_events_severity ON events(severity)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    //───────────────────── audit ─────────────────────

    /// Insert one audit record in a single-row transaction.
    pub async fn insert_audit(&self, record: &AuditRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO audit
            (id, timestamp, request_id, actor, integration, action, category,
             params_hash, response_hash, status, duration_ms, error_message,
             risk, confirmed, correlation_id, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(encode_timestamp(&record.timestamp))
        .bind(&record.request_id)
        .bind(&record.actor)
        .bind(&record.integration)
        .bind(&record.action)
        .bind(record.category.map(|c| c.as_str()))
        .bind(&record.params_hash)
        .bind(&record.response_hash)
        .bind(record.status.as_str())
        .bind(record.duration_ms as i64)
        .bind(&record.error_message)
        .bind(record.risk.map(|r| r.as_str()))
        .bind(record.confirmed as i64)
        .bind(&record.correlation_id)
        .bind(record.metadata.as_ref().map(|m| m.to_string()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Query audit rows, newest first. All filter clauses are conjunctive.
    pub async fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM audit WHERE 1=1");
        if let Some(actor) = &query.actor {
            builder.push(" AND actor = ").push_bind(actor);
        }
        if let Some(integration) = &query.integration {
            builder.push(" AND integration = ").push_bind(integration);
        }
        if let Some(status) = &query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = &query.since {
            builder.push(" AND timestamp >= ").push_bind(encode_timestamp(since));
        }
        if let Some(until) = &query.until {
            builder.push(" AND timestamp < ").push_bind(encode_timestamp(until));
        }
        builder.push(" ORDER BY timestamp DESC LIMIT ");
        builder.push_bind(query.limit.unwrap_or(DEFAULT_QUERY_LIMIT) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_audit_row).collect()
    }

    /// All audit rows for one request id, oldest first.
    pub async fn audit_by_request(&self, request_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audit WHERE request_id = ? ORDER BY timestamp ASC")
            .bind(request_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_audit_row).collect()
    }

    /// Total number of audit rows.
    pub async fn audit_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM audit")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }

    //───────────────────── events ─────────────────────

    /// Insert one event row.
    pub async fn insert_event(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events
            (id, timestamp, source, event_type, severity, correlation_id, data, handled)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(encode_timestamp(&record.timestamp))
        .bind(&record.source)
        .bind(&record.event_type)
        .bind(record.severity.as_str())
        .bind(&record.correlation_id)
        .bind(record.data.to_string())
        .bind(record.handled as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag an event as handled; returns whether the row existed.
    pub async fn mark_event_handled(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE events SET handled = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: u32) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY timestamp DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_event_row).collect()
    }

    /// Total number of event rows.
    pub async fn event_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}

//─────────────────────────────
//  Row codecs
//─────────────────────────────

fn encode_timestamp(timestamp: &DateTime<Utc>) -> String {
    // Fixed-width nanosecond RFC 3339 so lexicographic order matches time order.
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp '{raw}'"))?
        .with_timezone(&Utc))
}

fn decode_status(raw: &str) -> Result<AuditStatus> {
    match raw {
        "ok" => Ok(AuditStatus::Ok),
        "error" => Ok(AuditStatus::Error),
        "denied" => Ok(AuditStatus::Denied),
        other => anyhow::bail!("invalid stored audit status '{other}'"),
    }
}

fn decode_risk(raw: &str) -> Result<RiskLevel> {
    match raw {
        "read_only" => Ok(RiskLevel::ReadOnly),
        "write" => Ok(RiskLevel::Write),
        "admin" => Ok(RiskLevel::Admin),
        other => anyhow::bail!("invalid stored risk level '{other}'"),
    }
}

fn decode_category(raw: &str) -> Result<IntegrationCategory> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("invalid stored category '{raw}'"))
}

fn decode_severity(raw: &str) -> Result<EventSeverity> {
    match raw {
        "info" => Ok(EventSeverity::Info),
        "warn" => Ok(EventSeverity::Warn),
        "critical" => Ok(EventSeverity::Critical),
        other => anyhow::bail!("invalid stored severity '{other}'"),
    }
}

fn decode_audit_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditRecord> {
    let timestamp: String = row.get("timestamp");
    let status: String = row.get("status");
    let category: Option<String> = row.get("category");
    let risk: Option<String> = row.get("risk");
    let metadata: Option<String> = row.get("metadata");
    Ok(AuditRecord {
        id: row.get("id"),
        timestamp: decode_timestamp(&timestamp)?,
        request_id: row.get("request_id"),
        actor: row.get("actor"),
        integration: row.get("integration"),
        action: row.get("action"),
        category: category.as_deref().map(decode_category).transpose()?,
        params_hash: row.get("params_hash"),
        response_hash: row.get("response_hash"),
        status: decode_status(&status)?,
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        error_message: row.get("error_message"),
        risk: risk.as_deref().map(decode_risk).transpose()?,
        confirmed: row.get::<i64, _>("confirmed") != 0,
        correlation_id: row.get("correlation_id"),
        metadata: metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("invalid stored audit metadata")?,
    })
}

fn decode_event_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord> {
    let timestamp: String = row.get("timestamp");
    let severity: String = row.get("severity");
    let data: String = row.get("data");
    Ok(EventRecord {
        id: row.get("id"),
        timestamp: decode_timestamp(&timestamp)?,
        source: row.get("source"),
        event_type: row.get("event_type"),
        severity: decode_severity(&severity)?,
        correlation_id: row.get("correlation_id"),
        data: serde_json::from_str(&data).context("invalid stored event data")?,
        handled: row.get::<i64, _>("handled") != 0,
    })
}
