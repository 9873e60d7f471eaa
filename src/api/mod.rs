//! HTTP gateway: routing, error mapping, and the JSON endpoint surface.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::audit::{AuditAction, AuditDetails, AuditQuery};
use crate::auth::Role;
use crate::core::Core;
use crate::events::EventType;
use crate::models::{TaskPriority, TaskStatus};
use crate::processes::ProcessType;
use crate::store::{CreateTask, TaskFilter};
use crate::{AdtError, Result};

pub mod middleware;
mod ws;

#[cfg(test)]
mod tests;

pub use middleware::RequestContext;

const SERVICE_NAME: &str = "adt-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_STATUS: &str = "/status";
const ROUTE_PROJECTS: &str = "/projects";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_STATS: &str = "/tasks/stats";
const ROUTE_TASK_PENDING_REVIEW: &str = "/tasks/pending-review";
const ROUTE_TASK_CHAIN: &str = "/tasks/chain";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_OUTPUT: &str = "/tasks/{task_id}/output";
const ROUTE_TASK_CANCEL: &str = "/tasks/{task_id}/cancel";
const ROUTE_TASK_RUN: &str = "/tasks/{task_id}/run";
const ROUTE_TASK_RETRY: &str = "/tasks/{task_id}/retry";
const ROUTE_TASK_REVIEW: &str = "/tasks/{task_id}/review";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_AGENT_SPAWN: &str = "/agents/spawn";
const ROUTE_AGENT_BY_PROJECT: &str = "/agents/{project}";
const ROUTE_AGENT_STOP: &str = "/agents/{project}/stop";
const ROUTE_AGENT_RETRY: &str = "/agents/{project}/retry";
const ROUTE_AGENT_LOGS: &str = "/agents/{project}/logs";
const ROUTE_AGENT_ASSIGN: &str = "/agents/{project}/assign";
const ROUTE_PROCESSES: &str = "/processes";
const ROUTE_PROCESS_START: &str = "/processes/{process_id}/start";
const ROUTE_PROCESS_STOP: &str = "/processes/{process_id}/stop";
const ROUTE_PROCESS_RESTART: &str = "/processes/{process_id}/restart";
const ROUTE_PROCESS_LOGS: &str = "/processes/{process_id}/logs";
const ROUTE_PROCESS_FIX_TASK: &str = "/processes/{process_id}/create-fix-task";
const ROUTE_DETECT_PROCESSES: &str = "/projects/{project}/detect-processes";
const ROUTE_PORTS: &str = "/ports";
const ROUTE_PORT_ASSIGN: &str = "/ports/assign";
const ROUTE_PORT_SET: &str = "/ports/set";
const ROUTE_PORT_RELEASE: &str = "/ports/{project}/{service}";
const ROUTE_TOKENS: &str = "/tokens";
const ROUTE_TOKEN_BY_ID: &str = "/tokens/{token_id}";
const ROUTE_SECRETS: &str = "/secrets";
const ROUTE_SECRET_BY_KEY: &str = "/secrets/{key}";
const ROUTE_EVENTS: &str = "/events";
const ROUTE_AUDIT: &str = "/audit";
const ROUTE_ORCHESTRATOR_STATUS: &str = "/orchestrator/status";
const ROUTE_ORCHESTRATOR_START: &str = "/orchestrator/start";
const ROUTE_ORCHESTRATOR_STOP: &str = "/orchestrator/stop";
const ROUTE_WS: &str = "/ws";

/// Error wrapper mapping crate errors onto HTTP statuses. Internal detail
/// never reaches the response body.
pub struct ApiError(AdtError);

impl From<AdtError> for ApiError {
    fn from(err: AdtError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            AdtError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AdtError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AdtError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            AdtError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AdtError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AdtError::RateLimit(msg) => (StatusCode::TOO_MANY_REQUESTS, msg.clone()),
            other => {
                error!("Internal error surfaced at gateway: {other}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct ApiServer {
    core: Arc<Core>,
}

impl ApiServer {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub async fn run(&self) -> Result<()> {
        if self.core.config.server.tls.enabled {
            tracing::warn!(
                "TLS is configured but this build serves plain HTTP; terminate TLS in front"
            );
        }
        let app = self.build_router();
        let address = format!(
            "{}:{}",
            self.core.config.server.host, self.core.config.server.port
        );
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| AdtError::Configuration(format!("Cannot bind {address}: {e}")))?;
        info!("API server listening on {address}");
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .map_err(|e| AdtError::Internal(e.into()))?;
        Ok(())
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route(ROUTE_HEALTH, get(health))
            .route(ROUTE_STATUS, get(status))
            .route(ROUTE_PROJECTS, get(list_projects))
            .route(ROUTE_TASKS, get(list_tasks).post(create_task))
            .route(ROUTE_TASK_STATS, get(task_stats))
            .route(ROUTE_TASK_PENDING_REVIEW, get(pending_review))
            .route(ROUTE_TASK_CHAIN, post(chain_task))
            .route(ROUTE_TASK_BY_ID, get(get_task))
            .route(ROUTE_TASK_OUTPUT, get(task_output))
            .route(ROUTE_TASK_CANCEL, post(cancel_task))
            .route(ROUTE_TASK_RUN, post(run_task))
            .route(ROUTE_TASK_RETRY, post(retry_task))
            .route(ROUTE_TASK_REVIEW, post(review_task))
            .route(ROUTE_AGENTS, get(list_agents))
            .route(ROUTE_AGENT_SPAWN, post(spawn_agent))
            .route(ROUTE_AGENT_BY_PROJECT, get(get_agent))
            .route(ROUTE_AGENT_STOP, post(stop_agent))
            .route(ROUTE_AGENT_RETRY, post(retry_agent))
            .route(ROUTE_AGENT_LOGS, get(agent_logs))
            .route(ROUTE_AGENT_ASSIGN, post(assign_agent))
            .route(ROUTE_PROCESSES, get(list_processes).post(register_process))
            .route(ROUTE_PROCESS_START, post(start_process))
            .route(ROUTE_PROCESS_STOP, post(stop_process))
            .route(ROUTE_PROCESS_RESTART, post(restart_process))
            .route(ROUTE_PROCESS_LOGS, get(process_logs))
            .route(ROUTE_PROCESS_FIX_TASK, post(create_fix_task))
            .route(ROUTE_DETECT_PROCESSES, post(detect_processes))
            .route(ROUTE_PORTS, get(list_ports))
            .route(ROUTE_PORT_ASSIGN, post(assign_port))
            .route(ROUTE_PORT_SET, post(set_port))
            .route(ROUTE_PORT_RELEASE, delete(release_port))
            .route(ROUTE_TOKENS, get(list_tokens).post(create_token))
            .route(ROUTE_TOKEN_BY_ID, delete(revoke_token))
            .route(ROUTE_SECRETS, get(list_secrets).post(set_secret))
            .route(ROUTE_SECRET_BY_KEY, delete(delete_secret))
            .route(ROUTE_EVENTS, get(list_events))
            .route(ROUTE_AUDIT, get(query_audit))
            .route(ROUTE_ORCHESTRATOR_STATUS, get(orchestrator_status))
            .route(ROUTE_ORCHESTRATOR_START, post(orchestrator_start))
            .route(ROUTE_ORCHESTRATOR_STOP, post(orchestrator_stop))
            .route(ROUTE_WS, get(ws::ws_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(axum::middleware::from_fn_with_state(
                        Arc::clone(&self.core),
                        middleware::gateway_middleware,
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(Arc::clone(&self.core))
    }
}

// ---- request/response bodies ----

#[derive(Debug, Deserialize)]
struct TaskRequest {
    project: String,
    description: String,
    priority: Option<String>,
    metadata: Option<serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
    use_output_from: Option<String>,
    #[serde(default)]
    requires_review: bool,
    review_prompt: Option<String>,
    max_retries: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SpawnRequest {
    project: String,
    provider: Option<String>,
    task: Option<String>,
    worktree: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StopRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct AssignRequest {
    task: String,
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    approved: bool,
    edited_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisterProcessRequest {
    project: String,
    name: String,
    command: String,
    cwd: String,
    #[serde(rename = "type")]
    process_type: Option<ProcessType>,
    port: Option<u16>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PortAssignRequest {
    project: String,
    service: String,
    preferred: Option<u16>,
    #[serde(default)]
    force_new: bool,
}

#[derive(Debug, Deserialize)]
struct PortSetRequest {
    project: String,
    service: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct TokenCreateRequest {
    name: String,
    role: Option<String>,
    expires_in_days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TokenCreateResponse {
    token: String,
    info: crate::auth::TokenInfo,
}

#[derive(Debug, Deserialize)]
struct SecretSetRequest {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct TaskQueryParams {
    status: Option<String>,
    project: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LinesQuery {
    lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ProjectQuery {
    project: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventQueryParams {
    #[serde(rename = "type")]
    event_type: Option<String>,
    project: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct AuditQueryParams {
    action: Option<String>,
    actor_type: Option<String>,
    actor_id: Option<String>,
    resource_type: Option<String>,
    resource_id: Option<String>,
    status: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
    until: Option<chrono::DateTime<chrono::Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

fn parse_priority(priority: Option<&str>) -> Result<TaskPriority> {
    match priority {
        None => Ok(TaskPriority::Normal),
        Some(p) => TaskPriority::from_str(p).map_err(AdtError::Validation),
    }
}

// ---- handlers ----

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

async fn status(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    let sessions = core.agents.list();
    let running = sessions.iter().filter(|s| s.status.is_live()).count();
    Ok(Json(json!({
        "agents": {"total": sessions.len(), "running": running},
        "tasks": core.tasks.stats()?,
        "clients": core.ws_clients.load(Ordering::SeqCst),
        "orchestrator_running": core.orchestrator.is_running(),
        "uptime_secs": core.started_at.elapsed().as_secs(),
    })))
}

async fn list_projects(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!({"projects": core.registry.list()?})))
}

async fn list_tasks(
    State(core): State<Arc<Core>>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match params.status.as_deref() {
        Some(s) => Some(TaskStatus::from_str(s).map_err(AdtError::Validation)?),
        None => None,
    };
    let tasks = core.tasks.list(&TaskFilter {
        status,
        project: params.project,
        limit: params.limit.unwrap_or(100),
    })?;
    Ok(Json(json!({"tasks": tasks})))
}

async fn create_task(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Json<crate::models::Task>> {
    let task = core.tasks.create(CreateTask {
        project: request.project,
        description: request.description,
        priority: parse_priority(request.priority.as_deref())?,
        metadata: request.metadata,
        depends_on: request.depends_on,
        use_output_from: request.use_output_from,
        requires_review: request.requires_review,
        review_prompt: request.review_prompt,
        max_retries: request.max_retries,
    })?;

    core.events.emit(
        EventType::TaskCreated,
        Some(&task.project),
        json!({"task_id": task.id, "priority": task.priority, "status": task.status}),
    );
    let _ = core.history.log_event(
        "task.created",
        Some(&task.project),
        Some(&task.id),
        "info",
        None,
        None,
    );
    core.audit.record(
        AuditAction::TaskCreated,
        &ctx.actor(),
        AuditDetails::default()
            .resource("task", &task.id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(task))
}

/// Create a dependent task; `{{output}}` in the description is substituted
/// from the upstream task at promotion time.
async fn chain_task(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<TaskRequest>,
) -> ApiResult<Json<crate::models::Task>> {
    if request.depends_on.is_empty() && request.use_output_from.is_none() {
        return Err(AdtError::Validation(
            "chain requires depends_on or use_output_from".into(),
        )
        .into());
    }
    create_task(State(core), Extension(ctx), Json(request)).await
}

async fn task_stats(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!(core.tasks.stats()?)))
}

async fn pending_review(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!({"tasks": core.tasks.pending_review()?})))
}

async fn get_task(
    State(core): State<Arc<Core>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::models::Task>> {
    let task = core
        .tasks
        .get(&task_id)?
        .ok_or_else(|| AdtError::NotFound(format!("Task not found: {task_id}")))?;
    Ok(Json(task))
}

async fn task_output(
    State(core): State<Arc<Core>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let task = core
        .tasks
        .get(&task_id)?
        .ok_or_else(|| AdtError::NotFound(format!("Task not found: {task_id}")))?;
    Ok(Json(json!({
        "task_id": task.id,
        "status": task.status,
        "output": task.output,
        "error": task.error,
    })))
}

async fn cancel_task(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::models::Task>> {
    let task = core.tasks.cancel(&task_id)?;
    core.events.emit(
        EventType::TaskFailed,
        Some(&task.project),
        json!({"task_id": task.id, "status": task.status}),
    );
    core.audit.record(
        AuditAction::TaskCancelled,
        &ctx.actor(),
        AuditDetails::default()
            .resource("task", &task.id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(task))
}

/// Claim one specific pending task and launch its agent immediately.
async fn run_task(
    State(core): State<Arc<Core>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::models::Task>> {
    let task = core.tasks.claim_by_id(&task_id)?;
    if let Err(e) = core.orchestrator.launch(&task) {
        let failed = core.tasks.fail(&task.id, &e.to_string())?;
        return Ok(Json(failed));
    }
    Ok(Json(core.tasks.get(&task_id)?.unwrap_or(task)))
}

async fn retry_task(
    State(core): State<Arc<Core>>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<crate::models::Task>> {
    Ok(Json(core.tasks.retry(&task_id)?))
}

async fn review_task(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(task_id): Path<String>,
    Json(request): Json<ReviewRequest>,
) -> ApiResult<Json<crate::models::Task>> {
    let reviewer = ctx
        .token
        .as_ref()
        .map(|t| t.id.clone())
        .unwrap_or_else(|| "anonymous".to_string());
    let task = core.tasks.review(
        &task_id,
        request.approved,
        &reviewer,
        request.edited_description.as_deref(),
    )?;
    core.audit.record(
        AuditAction::TaskReviewed,
        &ctx.actor(),
        AuditDetails::default()
            .resource("task", &task.id)
            .request(&ctx.request_id, "api")
            .metadata(json!({"approved": request.approved})),
    );
    Ok(Json(task))
}

async fn list_agents(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    Json(json!({"agents": core.agents.list()}))
}

async fn spawn_agent(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<SpawnRequest>,
) -> ApiResult<Json<crate::agents::AgentSession>> {
    let session = core.agents.spawn(
        &request.project,
        request.provider.as_deref(),
        request.worktree.as_deref(),
        request.task.as_deref(),
    )?;
    core.audit.record(
        AuditAction::AgentSpawn,
        &ctx.actor(),
        AuditDetails::default()
            .resource("agent", &request.project)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(session))
}

async fn get_agent(
    State(core): State<Arc<Core>>,
    Path(project): Path<String>,
) -> ApiResult<Json<crate::agents::AgentSession>> {
    let session = core
        .agents
        .get(&project)
        .ok_or_else(|| AdtError::NotFound(format!("No agent for project: {project}")))?;
    Ok(Json(session))
}

async fn stop_agent(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(project): Path<String>,
    body: Option<Json<StopRequest>>,
) -> ApiResult<Json<serde_json::Value>> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let stopped = core.agents.stop(&project, force)?;
    core.audit.record(
        AuditAction::AgentStop,
        &ctx.actor(),
        AuditDetails::default()
            .resource("agent", &project)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(json!({"project": project, "stopped": stopped})))
}

async fn retry_agent(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(project): Path<String>,
) -> ApiResult<Json<crate::agents::AgentSession>> {
    let session = core.agents.retry(&project)?;
    core.audit.record(
        AuditAction::AgentRetry,
        &ctx.actor(),
        AuditDetails::default()
            .resource("agent", &project)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(session))
}

async fn agent_logs(
    State(core): State<Arc<Core>>,
    Path(project): Path<String>,
    Query(params): Query<LinesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let logs = core.agents.get_logs(&project, params.lines.unwrap_or(100))?;
    Ok(Json(json!({"project": project, "logs": logs})))
}

async fn assign_agent(
    State(core): State<Arc<Core>>,
    Path(project): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<Json<crate::agents::AgentSession>> {
    Ok(Json(core.agents.assign_task(&project, &request.task)?))
}

async fn list_processes(
    State(core): State<Arc<Core>>,
    Query(params): Query<ProjectQuery>,
) -> Json<serde_json::Value> {
    Json(json!({"processes": core.processes.list(params.project.as_deref())}))
}

async fn register_process(
    State(core): State<Arc<Core>>,
    Json(request): Json<RegisterProcessRequest>,
) -> ApiResult<Json<crate::processes::ProcessState>> {
    let state = core.processes.register(
        &request.project,
        &request.name,
        &request.command,
        &request.cwd,
        request.process_type.unwrap_or(ProcessType::DevServer),
        request.port,
        request.description.as_deref(),
    )?;
    Ok(Json(state))
}

async fn start_process(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(process_id): Path<String>,
) -> ApiResult<Json<crate::processes::ProcessState>> {
    let state = core.processes.start(&process_id)?;
    core.audit.record(
        AuditAction::ProcessStart,
        &ctx.actor(),
        AuditDetails::default()
            .resource("process", &process_id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(state))
}

async fn stop_process(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(process_id): Path<String>,
    body: Option<Json<StopRequest>>,
) -> ApiResult<Json<crate::processes::ProcessState>> {
    let force = body.map(|Json(b)| b.force).unwrap_or(false);
    let state = core.processes.stop(&process_id, force)?;
    core.audit.record(
        AuditAction::ProcessStop,
        &ctx.actor(),
        AuditDetails::default()
            .resource("process", &process_id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(state))
}

async fn restart_process(
    State(core): State<Arc<Core>>,
    Path(process_id): Path<String>,
) -> ApiResult<Json<crate::processes::ProcessState>> {
    Ok(Json(core.processes.restart(&process_id)?))
}

async fn process_logs(
    State(core): State<Arc<Core>>,
    Path(process_id): Path<String>,
    Query(params): Query<LinesQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let logs = core
        .processes
        .get_logs(&process_id, params.lines.unwrap_or(100))?;
    Ok(Json(json!({"process_id": process_id, "logs": logs})))
}

/// Turn a failed process into a high-priority repair task for an agent.
async fn create_fix_task(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(process_id): Path<String>,
) -> ApiResult<Json<crate::models::Task>> {
    let request = core.processes.fix_task_request(&process_id)?;
    let task = core.tasks.create(request)?;
    core.events.emit(
        EventType::TaskCreated,
        Some(&task.project),
        json!({"task_id": task.id, "source": "process-fix"}),
    );
    core.audit.record(
        AuditAction::TaskCreated,
        &ctx.actor(),
        AuditDetails::default()
            .resource("task", &task.id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(task))
}

async fn detect_processes(
    State(core): State<Arc<Core>>,
    Path(project): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let registered = core
        .registry
        .get(&project)?
        .ok_or_else(|| AdtError::NotFound(format!("Project not found: {project}")))?;
    let detected = core
        .processes
        .auto_detect(
            &project,
            &registered.path,
            core.config.discovery.llm_endpoint.as_deref(),
        )
        .await?;
    Ok(Json(json!({"detected": detected})))
}

async fn list_ports(
    State(core): State<Arc<Core>>,
    Query(params): Query<ProjectQuery>,
) -> Json<serde_json::Value> {
    Json(json!({"assignments": core.ports.list_assignments(params.project.as_deref())}))
}

async fn assign_port(
    State(core): State<Arc<Core>>,
    Json(request): Json<PortAssignRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let port = core.ports.assign_port(
        &request.project,
        &request.service,
        request.preferred,
        request.force_new,
    )?;
    Ok(Json(json!({
        "project": request.project,
        "service": request.service,
        "port": port,
    })))
}

async fn set_port(
    State(core): State<Arc<Core>>,
    Json(request): Json<PortSetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    core.ports
        .set_port(&request.project, &request.service, request.port)?;
    Ok(Json(json!({
        "project": request.project,
        "service": request.service,
        "port": request.port,
    })))
}

async fn release_port(
    State(core): State<Arc<Core>>,
    Path((project, service)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let released = core.ports.release_port(&project, &service)?;
    if !released {
        return Err(AdtError::NotFound(format!(
            "No assignment for {project}/{service}"
        ))
        .into());
    }
    Ok(Json(json!({"released": true})))
}

async fn list_tokens(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(json!({"tokens": core.auth.list_tokens()?})))
}

async fn create_token(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<TokenCreateRequest>,
) -> ApiResult<Json<TokenCreateResponse>> {
    let role = match request.role.as_deref() {
        None => Role::Operator,
        Some(r) => r.parse()?,
    };
    let created_by = ctx.token.as_ref().map(|t| t.id.clone());
    let (token, info) =
        core.auth
            .create_token(&request.name, role, request.expires_in_days, created_by.as_deref())?;
    core.audit.record(
        AuditAction::AuthTokenCreated,
        &ctx.actor(),
        AuditDetails::default()
            .resource("token", &info.id)
            .request(&ctx.request_id, "api")
            .metadata(json!({"name": info.name, "role": info.role})),
    );
    Ok(Json(TokenCreateResponse { token, info }))
}

async fn revoke_token(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(token_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !core.auth.revoke_token(&token_id)? {
        return Err(AdtError::NotFound(format!("Token not found: {token_id}")).into());
    }
    core.audit.record(
        AuditAction::AuthTokenRevoked,
        &ctx.actor(),
        AuditDetails::default()
            .resource("token", &token_id)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(json!({"revoked": true})))
}

/// Secret values never travel over HTTP; this lists keys only.
async fn list_secrets(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    Json(json!({"keys": core.vault.list_keys()}))
}

async fn set_secret(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Json(request): Json<SecretSetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    core.set_secret(&request.key, &request.value)?;
    core.audit.record(
        AuditAction::SecretWrite,
        &ctx.actor(),
        AuditDetails::default()
            .resource("secret", &request.key)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(json!({"key": request.key, "stored": true})))
}

async fn delete_secret(
    State(core): State<Arc<Core>>,
    Extension(ctx): Extension<RequestContext>,
    Path(key): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = core.vault.delete(&key)?;
    core.audit.record(
        AuditAction::SecretDelete,
        &ctx.actor(),
        AuditDetails::default()
            .resource("secret", &key)
            .request(&ctx.request_id, "api"),
    );
    Ok(Json(json!({"key": key, "deleted": deleted})))
}

async fn list_events(
    State(core): State<Arc<Core>>,
    Query(params): Query<EventQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let events = core.history.query_events(
        params.event_type.as_deref(),
        params.project.as_deref(),
        params.since,
        params.limit.unwrap_or(100),
    )?;
    Ok(Json(json!({"events": events})))
}

async fn query_audit(
    State(core): State<Arc<Core>>,
    Query(params): Query<AuditQueryParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = core.audit.query(&AuditQuery {
        action: params.action,
        actor_type: params.actor_type,
        actor_id: params.actor_id,
        resource_type: params.resource_type,
        resource_id: params.resource_id,
        status: params.status,
        since: params.since,
        until: params.until,
        limit: params.limit.unwrap_or(100),
        offset: params.offset.unwrap_or(0),
    })?;
    Ok(Json(json!({"entries": entries})))
}

async fn orchestrator_status(State(core): State<Arc<Core>>) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(core.orchestrator.stats()?))
}

async fn orchestrator_start(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    core.orchestrator.start();
    Json(json!({"running": true}))
}

async fn orchestrator_stop(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    core.orchestrator.stop();
    Json(json!({"running": false}))
}
