//! End-to-end tests over the assembled service: real router, stores, agents,
//! and HTTP edge, with outbound calls against a local mock server.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mycel_service::{build, build_app, Service, ServiceConfig};

async fn service_with_registry(registry: Value) -> (tempfile::TempDir, Service) {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = dir.path().join("integrations.json");
    std::fs::write(&registry_path, serde_json::to_vec_pretty(&registry).unwrap()).unwrap();

    let config: ServiceConfig = serde_json::from_value(json!({
        "store": {
            "db_path": dir.path().join("mycel.db"),
            "audit_log_path": dir.path().join("audit.jsonl"),
            "data_root": dir.path().join("agents")
        },
        "registry_path": registry_path,
        "orchestrator": { "stop_deadline_secs": 5 },
        "agents": [
            { "id": "mycology_bio", "kind": "bio" },
            { "id": "treasury", "kind": "treasury", "dependencies": ["mycology_bio"] }
        ]
    }))
    .unwrap();

    let service = build(config).await.unwrap();
    service.orchestrator.start_all().await.unwrap();
    (dir, service)
}

fn base_registry(httpbin_url: &str) -> Value {
    json!({
        "version": "test",
        "integrations": [
            {
                "integration": "httpbin",
                "category": "generic",
                "native": false,
                "auth": "none",
                "risk": "read_only",
                "confirm_required": false,
                "base_url": httpbin_url
            },
            {
                "integration": "proxmox",
                "category": "infrastructure",
                "native": true,
                "risk": "admin",
                "confirm_required": true
            },
            {
                "integration": "lab",
                "category": "agents",
                "native": true,
                "risk": "write"
            },
            {
                "integration": "grafana",
                "category": "infrastructure",
                "native": false,
                "auth": "api_key",
                "risk": "read_only",
                "base_url": httpbin_url
            }
        ]
    })
}

async fn request(app: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn generic_read_happy_path_audits_ok() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "origin": "test" })))
        .mount(&upstream)
        .await;

    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r1",
                "actor": "morgan",
                "integration": "httpbin",
                "action": "read",
                "params": { "endpoint": "/get" },
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"]["http_status"], 200);
    assert_eq!(body["audit_logged"], true);

    let rows = service.state.router.audit().by_request("r1").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, mycel_types::AuditStatus::Ok);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn confirmation_gate_returns_403_and_denied_audit() {
    let upstream = MockServer::start().await;
    let (dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r2",
                "actor": "morgan",
                "integration": "proxmox",
                "action": "snapshot",
                "params": { "node": "build", "vmid": 100, "snapshot_name": "pre" },
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["status"], "denied");
    assert_eq!(body["error"]["code"], "confirmation_required");
    assert_eq!(body["requirements"]["confirm"], true);

    let rows = service.state.router.audit().by_request("r2").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, mycel_types::AuditStatus::Denied);
    assert!(!rows[0].confirmed);

    // JSONL and relational sinks agree on status and hashes.
    let jsonl = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    let line = jsonl
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap())
        .find(|line| line["request_id"] == "r2")
        .unwrap();
    assert_eq!(line["status"], "denied");
    assert_eq!(line["params_hash"], rows[0].params_hash);
    assert_eq!(line["response_hash"], rows[0].response_hash);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unknown_integration_returns_404_with_audit() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r3",
                "actor": "x",
                "integration": "nope",
                "action": "read",
                "params": {},
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], "unknown_integration");

    let rows = service.state.router.audit().by_request("r3").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, mycel_types::AuditStatus::Error);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn upstream_failure_buckets_into_500_with_upstream_code() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "detail": "no such page" })))
        .mount(&upstream)
        .await;

    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r-upstream",
                "actor": "morgan",
                "integration": "httpbin",
                "action": "read",
                "params": { "endpoint": "/missing" },
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], "upstream");

    let rows = service.state.router.audit().by_request("r-upstream").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, mycel_types::AuditStatus::Error);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn missing_credential_buckets_into_500_with_unauthorized_code() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    // grafana declares api_key auth but the configuration carries no
    // credential for it.
    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r-no-cred",
                "actor": "morgan",
                "integration": "grafana",
                "action": "read",
                "params": { "endpoint": "/dashboards" },
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"]["code"], "unauthorized");

    let rows = service.state.router.audit().by_request("r-no-cred").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, mycel_types::AuditStatus::Error);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn malformed_command_body_is_a_schema_error() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(app, post_json("/command", json!({ "request_id": "r4" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "schema");

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn critical_event_is_accepted_and_fanned_out() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;

    // Subscribe like an alerting agent would.
    let mut alerts = service
        .orchestrator
        .bus()
        .subscribe(mycel_bus::CRITICAL_EVENT_TOPIC, 8);

    let app = build_app(service.state.clone());
    let (status, body) = request(
        app,
        post_json(
            "/event",
            json!({
                "source": "agent.mycology_bio",
                "event_type": "contamination",
                "severity": "critical",
                "data": { "id": "c42" }
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], true);
    let event_id = body["event_id"].as_str().unwrap().to_string();

    // Fan-out happened before the 202 returned.
    let message = alerts.try_recv().expect("critical event published");
    assert_eq!(message.payload["id"], Value::String(event_id.clone()));

    // And the row is persisted.
    let recent = service.state.intake.recent(10).await.unwrap();
    assert!(recent.iter().any(|event| event.id == event_id));

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn event_without_source_is_rejected() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app,
        post_json("/event", json!({ "source": "", "event_type": "telemetry" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "schema");

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn readiness_tracks_agent_states() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;

    let (status, body) = request(build_app(service.state.clone()), get("/ready")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;

    let (status, body) = request(build_app(service.state.clone()), get("/ready")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "not_ready");
}

#[tokio::test]
async fn status_and_graph_surface_the_topology() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;

    let (status, body) = request(build_app(service.state.clone()), get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    let agents = body["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 2);
    assert!(agents.iter().all(|agent| agent["status"] == "running"));
    assert!(agents
        .iter()
        .any(|agent| agent["queue_depths"].get("analysis").is_some()));

    let (status, body) = request(build_app(service.state.clone()), get("/api/graph")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nodes"].as_array().unwrap().len(), 2);
    assert_eq!(body["edges"][0]["from"], "treasury");
    assert_eq!(body["edges"][0]["to"], "mycology_bio");

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn agents_category_commands_reach_agent_operations() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    let (status, body) = request(
        app.clone(),
        post_json(
            "/command",
            json!({
                "request_id": "r-create",
                "actor": "morgan",
                "integration": "lab",
                "action": "create_record",
                "params": {
                    "agent": "mycology_bio",
                    "params": {
                        "record_type": "culture",
                        "format": "csv",
                        "source": "lab-3"
                    }
                },
                "confirm": false
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["data"]["record_type"], "culture");

    // Unknown operations come back as a stable error code.
    let (status, body) = request(
        app,
        post_json(
            "/command",
            json!({
                "request_id": "r-unknown-op",
                "actor": "morgan",
                "integration": "lab",
                "action": "transmute",
                "params": { "agent": "mycology_bio" },
                "confirm": false
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unknown_operation");

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn audit_endpoint_filters_by_actor_and_status() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&upstream)
        .await;

    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;
    let app = build_app(service.state.clone());

    request(
        app.clone(),
        post_json(
            "/command",
            json!({
                "request_id": "ra",
                "actor": "morgan",
                "integration": "httpbin",
                "action": "read",
                "params": { "endpoint": "/get" },
                "confirm": false
            }),
        ),
    )
    .await;
    request(
        app.clone(),
        post_json(
            "/command",
            json!({
                "request_id": "rb",
                "actor": "casey",
                "integration": "nope",
                "action": "read",
                "params": {},
                "confirm": false
            }),
        ),
    )
    .await;

    let (status, body) =
        request(app.clone(), get("/api/audit?actor=morgan&status=ok")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["records"][0]["request_id"], "ra");

    let (status, body) = request(app, get("/api/audit?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "schema");

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn integrations_endpoint_lists_the_snapshot() {
    let upstream = MockServer::start().await;
    let (_dir, service) = service_with_registry(base_registry(&upstream.uri())).await;

    let (status, body) = request(build_app(service.state.clone()), get("/api/integrations")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], "test");
    let names: Vec<&str> = body["integrations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["integration"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["grafana", "httpbin", "lab", "proxmox"]);

    service.orchestrator.stop_all(Duration::from_secs(5)).await;
}
