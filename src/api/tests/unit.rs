use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

use crate::api::ApiServer;
use crate::auth::Role;
use crate::core::Core;

struct TestApi {
    _dir: tempfile::TempDir,
    core: Arc<Core>,
    router: Router,
    admin: String,
    operator: String,
    viewer: String,
}

fn setup() -> TestApi {
    let dir = tempfile::tempdir().unwrap();
    crate::config::ensure_adt_home(dir.path()).unwrap();

    std::fs::write(
        dir.path().join("config.yml"),
        concat!(
            "providers:\n",
            "  test:\n    type: custom\n    command: \"sh -c\"\n    default: true\n",
            "agents:\n  default_provider: test\n",
        ),
    )
    .unwrap();

    let project_dir = dir.path().join("workdirs").join("demo");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(
        dir.path().join("projects.json"),
        json!([{"name": "demo", "path": project_dir}]).to_string(),
    )
    .unwrap();

    let core = Core::init(dir.path()).unwrap();
    let router = ApiServer::new(Arc::clone(&core)).build_router();

    let (admin, _) = core.auth.create_token("admin", Role::Admin, None, None).unwrap();
    let (operator, _) = core
        .auth
        .create_token("operator", Role::Operator, None, None)
        .unwrap();
    let (viewer, _) = core.auth.create_token("viewer", Role::Viewer, None, None).unwrap();

    TestApi {
        _dir: dir,
        core,
        router,
        admin,
        operator,
        viewer,
    }
}

async fn send(
    router: &Router,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let mut request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({}));
    (status, value)
}

#[tokio::test]
async fn health_is_public() {
    let api = setup();
    let (status, body) = send(&api.router, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "adt-core");
}

#[tokio::test]
async fn protected_endpoints_require_a_token() {
    let api = setup();
    let (status, _) = send(&api.router, "GET", "/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&api.router, "GET", "/status", Some("adt_bogus"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&api.router, "GET", "/status", Some(&api.viewer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["tasks"].is_object());
}

#[tokio::test]
async fn viewer_spawn_is_denied_and_audited() {
    let api = setup();
    let (status, body) = send(
        &api.router,
        "POST",
        "/agents/spawn",
        Some(&api.viewer),
        Some(json!({"project": "demo"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("agents.spawn"));

    let entries = api
        .core
        .audit
        .query(&crate::audit::AuditQuery {
            action: Some("auth.denied".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].resource_type.as_deref(), Some("endpoint"));
    assert_eq!(entries[0].resource_id.as_deref(), Some("/agents/spawn"));
    assert!(entries[0].actor_id.is_some());
}

#[tokio::test]
async fn task_create_get_round_trip() {
    let api = setup();
    let (status, created) = send(
        &api.router,
        "POST",
        "/tasks",
        Some(&api.operator),
        Some(json!({
            "project": "demo",
            "description": "write hello.txt",
            "priority": "normal",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "pending");
    let task_id = created["id"].as_str().unwrap();

    let (status, fetched) = send(
        &api.router,
        "GET",
        &format!("/tasks/{task_id}"),
        Some(&api.viewer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["description"], "write hello.txt");
    assert_eq!(fetched["priority"], "normal");
}

#[tokio::test]
async fn invalid_priority_is_a_validation_error() {
    let api = setup();
    let (status, body) = send(
        &api.router,
        "POST",
        "/tasks",
        Some(&api.operator),
        Some(json!({"project": "demo", "description": "x", "priority": "asap"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("asap"));
}

#[tokio::test]
async fn missing_task_is_404_and_terminal_cancel_conflicts() {
    let api = setup();
    let (status, _) = send(&api.router, "GET", "/tasks/nope", Some(&api.viewer), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let task = api
        .core
        .tasks
        .create(crate::store::CreateTask {
            project: "demo".to_string(),
            description: "done already".to_string(),
            ..Default::default()
        })
        .unwrap();
    api.core.tasks.claim_next("demo").unwrap();
    api.core.tasks.complete(&task.id, Some("ok")).unwrap();

    let (status, _) = send(
        &api.router,
        "POST",
        &format!("/tasks/{}/cancel", task.id),
        Some(&api.operator),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn concurrent_spawns_one_wins_one_conflicts() {
    let api = setup();
    let (status, body) = send(
        &api.router,
        "POST",
        "/agents/spawn",
        Some(&api.operator),
        Some(json!({"project": "demo", "task": "sleep 5"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["pid"].as_u64().is_some());

    let (status, body) = send(
        &api.router,
        "POST",
        "/agents/spawn",
        Some(&api.operator),
        Some(json!({"project": "demo", "task": "echo nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already running"));

    api.core.agents.stop_all(true);
}

#[tokio::test]
async fn token_management_is_admin_only() {
    let api = setup();
    let (status, _) = send(&api.router, "GET", "/tokens", Some(&api.operator), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &api.router,
        "POST",
        "/tokens",
        Some(&api.admin),
        Some(json!({"name": "ci", "role": "viewer"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let bearer = body["token"].as_str().unwrap().to_string();
    assert!(bearer.starts_with("adt_"));

    // The fresh token authenticates with its declared role.
    let (status, _) = send(&api.router, "GET", "/status", Some(&bearer), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &api.router,
        "POST",
        "/tasks",
        Some(&bearer),
        Some(json!({"project": "demo", "description": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Revocation takes effect immediately.
    let token_id = body["info"]["id"].as_str().unwrap();
    let (status, _) = send(
        &api.router,
        "DELETE",
        &format!("/tokens/{token_id}"),
        Some(&api.admin),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&api.router, "GET", "/status", Some(&bearer), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn secret_values_never_appear_in_responses() {
    let api = setup();
    let (status, _) = send(
        &api.router,
        "POST",
        "/secrets",
        Some(&api.admin),
        Some(json!({"key": "API_KEY", "value": "super-secret-value-9000"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&api.router, "GET", "/secrets", Some(&api.admin), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["keys"], json!(["API_KEY"]));
    assert!(!body.to_string().contains("super-secret-value-9000"));
}

#[tokio::test]
async fn rate_limit_denies_burst_and_audits() {
    let api = setup();
    let mut denied = 0;
    for _ in 0..30 {
        let (status, _) = send(&api.router, "GET", "/health", None, None).await;
        if status == StatusCode::TOO_MANY_REQUESTS {
            denied += 1;
        }
    }
    assert!(denied > 0, "burst of 30 should trip the per-second window");

    let entries = api
        .core
        .audit
        .query(&crate::audit::AuditQuery {
            action: Some("security.rate_limit".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(!entries.is_empty());
}

#[tokio::test]
async fn ports_assign_and_release_via_api() {
    let api = setup();
    let (status, body) = send(
        &api.router,
        "POST",
        "/ports/assign",
        Some(&api.operator),
        Some(json!({"project": "demo", "service": "frontend", "preferred": 5173})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let port = body["port"].as_u64().unwrap();
    assert_ne!(port, 0);

    let (status, body) = send(&api.router, "GET", "/ports", Some(&api.viewer), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assignments"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &api.router,
        "DELETE",
        "/ports/demo/frontend",
        Some(&api.operator),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &api.router,
        "DELETE",
        "/ports/demo/frontend",
        Some(&api.operator),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn review_flow_over_http() {
    let api = setup();
    let (_, created) = send(
        &api.router,
        "POST",
        "/tasks",
        Some(&api.operator),
        Some(json!({
            "project": "demo",
            "description": "needs approval",
            "requires_review": true,
        })),
    )
    .await;
    assert_eq!(created["status"], "awaiting_review");
    let task_id = created["id"].as_str().unwrap();

    let (status, body) = send(
        &api.router,
        "GET",
        "/tasks/pending-review",
        Some(&api.viewer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    let (status, reviewed) = send(
        &api.router,
        "POST",
        &format!("/tasks/{task_id}/review"),
        Some(&api.operator),
        Some(json!({"approved": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviewed["status"], "pending");
    assert!(reviewed["reviewed_by"].is_string());
}

#[tokio::test]
async fn orchestrator_endpoints_toggle_the_loop() {
    let api = setup();
    let (status, body) = send(
        &api.router,
        "GET",
        "/orchestrator/status",
        Some(&api.viewer),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], false);

    let (status, _) = send(
        &api.router,
        "POST",
        "/orchestrator/start",
        Some(&api.operator),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(api.core.orchestrator.is_running());

    send(
        &api.router,
        "POST",
        "/orchestrator/stop",
        Some(&api.operator),
        None,
    )
    .await;
    assert!(!api.core.orchestrator.is_running());
}
