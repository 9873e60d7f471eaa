//! Gateway middleware: request ids, rate limiting, authentication, and
//! per-endpoint authorization.
//!
//! Order per request: request id, rate limit on the composite client id,
//! authenticate (public and optional-auth paths excepted), authorize via
//! the (method, route-pattern) permission map.

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

use crate::audit::{Actor, AuditAction, AuditDetails};
use crate::auth::{Permission, TokenInfo};
use crate::core::Core;

/// Paths served without a token.
const PUBLIC_PATHS: &[&str] = &["/", "/health"];

/// Paths where the token may arrive later (WebSocket auth message).
const OPTIONAL_AUTH_PATHS: &[&str] = &["/ws"];

/// (method, route pattern) -> required permission.
const ENDPOINT_PERMISSIONS: &[(&str, &str, Permission)] = &[
    ("GET", "/status", Permission::StatusRead),
    ("GET", "/projects", Permission::ProjectsRead),
    // Tasks
    ("GET", "/tasks", Permission::TasksRead),
    ("POST", "/tasks", Permission::TasksCreate),
    ("GET", "/tasks/stats", Permission::TasksRead),
    ("GET", "/tasks/pending-review", Permission::TasksRead),
    ("POST", "/tasks/chain", Permission::TasksCreate),
    ("GET", "/tasks/{task_id}", Permission::TasksRead),
    ("GET", "/tasks/{task_id}/output", Permission::TasksRead),
    ("POST", "/tasks/{task_id}/cancel", Permission::TasksCancel),
    ("POST", "/tasks/{task_id}/run", Permission::TasksCreate),
    ("POST", "/tasks/{task_id}/retry", Permission::TasksCreate),
    ("POST", "/tasks/{task_id}/review", Permission::TasksCancel),
    // Agents
    ("GET", "/agents", Permission::AgentsRead),
    ("POST", "/agents/spawn", Permission::AgentsSpawn),
    ("GET", "/agents/{project}", Permission::AgentsRead),
    ("POST", "/agents/{project}/stop", Permission::AgentsStop),
    ("POST", "/agents/{project}/retry", Permission::AgentsSpawn),
    ("GET", "/agents/{project}/logs", Permission::LogsRead),
    ("POST", "/agents/{project}/assign", Permission::AgentsSpawn),
    // Processes
    ("GET", "/processes", Permission::StatusRead),
    ("POST", "/processes", Permission::ProcessesManage),
    ("POST", "/processes/{process_id}/start", Permission::ProcessesManage),
    ("POST", "/processes/{process_id}/stop", Permission::ProcessesManage),
    ("POST", "/processes/{process_id}/restart", Permission::ProcessesManage),
    ("GET", "/processes/{process_id}/logs", Permission::LogsRead),
    (
        "POST",
        "/processes/{process_id}/create-fix-task",
        Permission::TasksCreate,
    ),
    (
        "POST",
        "/projects/{project}/detect-processes",
        Permission::ProcessesManage,
    ),
    // Ports
    ("GET", "/ports", Permission::StatusRead),
    ("POST", "/ports/assign", Permission::ProcessesManage),
    ("POST", "/ports/set", Permission::ProcessesManage),
    ("DELETE", "/ports/{project}/{service}", Permission::ProcessesManage),
    // Tokens / secrets / audit (admin)
    ("GET", "/tokens", Permission::TokensManage),
    ("POST", "/tokens", Permission::TokensManage),
    ("DELETE", "/tokens/{token_id}", Permission::TokensManage),
    ("GET", "/secrets", Permission::SecretsManage),
    ("POST", "/secrets", Permission::SecretsManage),
    ("DELETE", "/secrets/{key}", Permission::SecretsManage),
    ("GET", "/audit", Permission::AuditRead),
    // Events / orchestrator
    ("GET", "/events", Permission::LogsRead),
    ("GET", "/orchestrator/status", Permission::StatusRead),
    ("POST", "/orchestrator/start", Permission::AgentsSpawn),
    ("POST", "/orchestrator/stop", Permission::AgentsSpawn),
];

pub fn required_permission(method: &Method, pattern: &str) -> Option<Permission> {
    ENDPOINT_PERMISSIONS
        .iter()
        .find(|(m, p, _)| *m == method.as_str() && *p == pattern)
        .map(|(_, _, perm)| *perm)
}

/// Request-scoped context made available to handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: Option<String>,
    pub token: Option<TokenInfo>,
}

impl RequestContext {
    pub fn actor(&self) -> Actor {
        match &self.token {
            Some(token) => Actor::user(&token.id, self.client_ip.clone()),
            None => Actor {
                actor_type: "client".to_string(),
                actor_id: None,
                actor_ip: self.client_ip.clone(),
            },
        }
    }
}

fn unauthorized(detail: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        Json(json!({"error": detail})),
    )
        .into_response()
}

/// Composite client id: token prefix, forwarded-for, then peer IP.
fn client_id(request: &Request, peer: &SocketAddr) -> String {
    if let Some(auth) = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let prefix: String = token.chars().take(13).collect();
            return format!("token:{prefix}");
        }
    }
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            return format!("ip:{}", first.trim());
        }
    }
    format!("ip:{}", peer.ip())
}

fn client_ip(request: &Request, peer: &SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

pub async fn gateway_middleware(
    State(core): State<Arc<Core>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request,
    next: Next,
) -> Result<Response, Response> {
    let request_id = crate::models::short_id();
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let client = client_id(&request, &peer);
    let ip = client_ip(&request, &peer);

    // Rate limiting applies to every request, public or not.
    if let Err(reason) = core.rate_limiter.check(&client) {
        core.audit.record(
            AuditAction::SecurityRateLimit,
            &Actor::client(&client, Some(ip.clone())),
            AuditDetails::default()
                .request(&request_id, "api")
                .denied(&reason),
        );
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": reason})),
        )
            .into_response());
    }

    let mut context = RequestContext {
        request_id: request_id.clone(),
        client_ip: Some(ip.clone()),
        token: None,
    };

    if PUBLIC_PATHS.contains(&path.as_str()) {
        request.extensions_mut().insert(context);
        return Ok(next.run(request).await);
    }
    let optional_auth = OPTIONAL_AUTH_PATHS.contains(&path.as_str());

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match bearer {
        Some(bearer) => {
            let validated = core.auth.validate(&bearer).map_err(|e| {
                warn!("Token validation failed: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Internal server error"})),
                )
                    .into_response()
            })?;
            match validated {
                Some(token) => context.token = Some(token),
                None if optional_auth => {}
                None => {
                    core.audit.record(
                        AuditAction::AuthLoginFailed,
                        &Actor::client(&client, Some(ip.clone())),
                        AuditDetails::default()
                            .request(&request_id, "api")
                            .denied("Invalid or expired token"),
                    );
                    return Err(unauthorized("Invalid or expired token"));
                }
            }
        }
        None if optional_auth => {}
        None => return Err(unauthorized("Authentication required")),
    }

    // Authorization against the route pattern, not the literal path.
    let pattern = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    if let Some(permission) = required_permission(&method, &pattern) {
        let allowed = context
            .token
            .as_ref()
            .map(|t| t.role.has_permission(permission))
            .unwrap_or(false);
        if !allowed {
            core.audit.record(
                AuditAction::AuthDenied,
                &context.actor(),
                AuditDetails::default()
                    .resource("endpoint", &path)
                    .request(&request_id, "api")
                    .denied(&format!("Missing permission: {}", permission.as_str())),
            );
            return Err((
                StatusCode::FORBIDDEN,
                Json(json!({
                    "error": format!("Permission denied: {}", permission.as_str())
                })),
            )
                .into_response());
        }
    }

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}
