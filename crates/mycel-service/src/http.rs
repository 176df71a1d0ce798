//! HTTP edge: command intake, event intake, health, and introspection.
//!
//! Non-2xx bodies carry `{ code, message }` (for `/command`, inside the
//! response envelope's `error` object). Each write path holds a bounded
//! semaphore; over-limit requests are shed with `503` and a `Retry-After`
//! hint instead of queueing.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::warn;

use mycel_fabric::{CommandRouter, EventIntake, FabricError};
use mycel_orchestration::Orchestrator;
use mycel_types::{AuditQuery, AuditStatus, Command, CommandStatus, EventSubmission};

//─────────────────────────────
//  State
//─────────────────────────────

/// Shared state behind every endpoint.
#[derive(Clone)]
pub struct AppState {
    /// Integration router.
    pub router: Arc<CommandRouter>,
    /// Event intake.
    pub intake: Arc<EventIntake>,
    /// Root supervisor.
    pub orchestrator: Arc<Orchestrator>,
    /// Concurrency permits for `POST /command`.
    pub command_permits: Arc<Semaphore>,
    /// Concurrency permits for `POST /event`.
    pub event_permits: Arc<Semaphore>,
    /// Process start time, for uptime reporting.
    pub started_at: Instant,
}

/// Build the axum application over the shared state.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/command", post(submit_command))
        .route("/event", post(submit_event))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/status", get(api_status))
        .route("/api/graph", get(api_graph))
        .route("/api/integrations", get(api_integrations))
        .route("/api/audit", get(api_audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

//─────────────────────────────
//  Error body
//─────────────────────────────

fn error_body(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (status, Json(json!({ "code": code, "message": message.into() }))).into_response()
}

fn over_capacity() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, "1")],
        Json(json!({ "code": "over_capacity", "message": "too many in-flight requests" })),
    )
        .into_response()
}

fn rejection_body(rejection: JsonRejection) -> Response {
    error_body(StatusCode::BAD_REQUEST, "schema", rejection.body_text())
}

//─────────────────────────────
//  Command and event intake
//─────────────────────────────

async fn submit_command(
    State(state): State<AppState>,
    body: Result<Json<Command>, JsonRejection>,
) -> Response {
    let Json(command) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_body(rejection),
    };
    let Ok(_permit) = state.command_permits.try_acquire() else {
        return over_capacity();
    };

    let response = state.router.dispatch(command).await;
    let status = match response.status {
        CommandStatus::Ok => StatusCode::OK,
        _ => response
            .error
            .as_ref()
            .and_then(|error| StatusCode::from_u16(error.code.http_status()).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    };
    (status, Json(response)).into_response()
}

async fn submit_event(
    State(state): State<AppState>,
    body: Result<Json<EventSubmission>, JsonRejection>,
) -> Response {
    let Json(submission) = match body {
        Ok(body) => body,
        Err(rejection) => return rejection_body(rejection),
    };
    let Ok(_permit) = state.event_permits.try_acquire() else {
        return over_capacity();
    };

    match state.intake.ingest(submission).await {
        Ok(record) => (
            StatusCode::ACCEPTED,
            Json(json!({ "accepted": true, "event_id": record.id })),
        )
            .into_response(),
        Err(FabricError::Schema(reason)) => {
            error_body(StatusCode::BAD_REQUEST, "schema", reason)
        }
        Err(err) => {
            warn!(error = %err, "event intake failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal", "event intake failed")
        }
    }
}

//─────────────────────────────
//  Health and readiness
//─────────────────────────────

async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
    .into_response()
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.orchestrator.all_running().await {
        Json(json!({ "ready": true })).into_response()
    } else {
        error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "required agents are not all running",
        )
    }
}

//─────────────────────────────
//  Introspection
//─────────────────────────────

async fn api_status(State(state): State<AppState>) -> Response {
    let agents = state.orchestrator.health().await;
    Json(json!({ "agents": agents })).into_response()
}

async fn api_graph(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.graph().await).into_response()
}

async fn api_integrations(State(state): State<AppState>) -> Response {
    let snapshot = state.router.registry().snapshot();
    Json(json!({
        "version": snapshot.version(),
        "loaded_at": snapshot.loaded_at(),
        "integrations": snapshot.summaries(),
    }))
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct AuditParams {
    actor: Option<String>,
    integration: Option<String>,
    status: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<u32>,
}

async fn api_audit(
    State(state): State<AppState>,
    params: Result<Query<AuditParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => {
            return error_body(StatusCode::BAD_REQUEST, "schema", rejection.body_text())
        }
    };
    let status = match params.status.as_deref() {
        None => None,
        Some("ok") => Some(AuditStatus::Ok),
        Some("error") => Some(AuditStatus::Error),
        Some("denied") => Some(AuditStatus::Denied),
        Some(other) => {
            return error_body(
                StatusCode::BAD_REQUEST,
                "schema",
                format!("unknown audit status '{other}'"),
            )
        }
    };
    let query = AuditQuery {
        actor: params.actor,
        integration: params.integration,
        status,
        since: params.since,
        until: params.until,
        limit: params.limit,
    };
    match state.router.audit().query(&query).await {
        Ok(records) => Json(json!({ "count": records.len(), "records": records })).into_response(),
        Err(err) => {
            warn!(error = %err, "audit query failed");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal", "audit query failed")
        }
    }
}
