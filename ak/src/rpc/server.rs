//! HTTP server exposing the remote agent protocol

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures::Stream;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::messages::{AgentCard, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcMessage, TaskRecord};
use crate::domain::CancelToken;
use crate::gitproto::{self, GitService};
use crate::router::{SubmitError, SubmitOptions, TaskRouter};
use crate::session::{SessionEvent, SessionRegistry};
use crate::tools::ToolExecutor;
use crate::worktree::WorktreeManager;

/// Shared state behind every handler
pub struct RpcState {
    pub router: TaskRouter,
    pub sessions: SessionRegistry,
    pub executor: Arc<ToolExecutor>,
    pub broker: crate::approval::ApprovalBroker,
    pub worktrees: Arc<WorktreeManager>,
    /// Idle age a manual GC sweep uses when the request gives no override
    pub gc_idle_age: Duration,
    /// Base repository, for the optional git endpoints
    pub repo_root: PathBuf,
    pub serve_git: bool,
}

/// Build the axum router for the protocol surface
pub fn build_router(state: Arc<RpcState>) -> Router {
    let mut router = Router::new()
        .route("/.well-known/agent.json", get(agent_card))
        .route("/health", get(health))
        .route("/a2a/message", post(a2a_message))
        .route("/a2a/tasks", get(a2a_tasks))
        .route("/a2a/task/{id}", get(a2a_task))
        .route("/a2a/task/{id}/stream", get(a2a_task_stream))
        .route("/a2a/task/{id}/cancel", post(a2a_task_cancel))
        .route("/a2a/approvals", get(approvals_pending))
        .route("/a2a/approval/{id}", post(approval_resolve))
        .route("/a2a/gc", post(gc_sweep));

    if state.serve_git {
        router = router
            .route("/git/info/refs", get(git_info_refs))
            .route("/git/{service}", post(git_service_rpc));
    }

    router.with_state(state)
}

/// Serve until the cancel token fires
pub async fn serve(state: Arc<RpcState>, bind: &str, cancel: CancelToken) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "RPC surface listening");

    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("RPC surface stopped");
    Ok(())
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

async fn agent_card(State(state): State<Arc<RpcState>>) -> impl IntoResponse {
    let card = AgentCard {
        name: "agentkit".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: vec![
            "message/send".to_string(),
            "task/get".to_string(),
            "task/stream".to_string(),
            "task/cancel".to_string(),
        ],
        skills: state.executor.catalogue(),
    };
    axum::Json(card)
}

/// JSON-RPC endpoint; the only method is `message/send`
async fn a2a_message(State(state): State<Arc<RpcState>>, body: Bytes) -> Response {
    // Hand-parse so malformed bodies produce a proper -32700
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "a2a_message: parse error");
            let response = JsonRpcResponse::failure(
                Value::Null,
                JsonRpcError::new(JsonRpcError::PARSE_ERROR, format!("parse error: {}", e)),
            );
            return axum::Json(response).into_response();
        }
    };

    let id = request.id.clone();
    let response = match request.method.as_str() {
        "message/send" => handle_message_send(&state, request).await,
        other => {
            debug!(method = %other, "a2a_message: unknown method");
            JsonRpcResponse::failure(
                id,
                JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, format!("unknown method: {}", other)),
            )
        }
    };

    axum::Json(response).into_response()
}

async fn handle_message_send(state: &RpcState, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();

    let Some(message_value) = request.params.get("message") else {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "params.message is required"),
        );
    };
    let message: RpcMessage = match serde_json::from_value(message_value.clone()) {
        Ok(message) => message,
        Err(e) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("invalid message: {}", e)),
            );
        }
    };

    let prompt = message.text_content();
    if prompt.is_empty() {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::INVALID_PARAMS, "message has no text part"),
        );
    }

    // Optional routing hints alongside the message
    let mut options = SubmitOptions::default();
    if let Some(runner) = request.params.get("runner").and_then(|v| v.as_str()) {
        options.runner = match runner {
            "embedded" => crate::domain::RunnerSelection::Embedded,
            "external-cli" => crate::domain::RunnerSelection::ExternalCli,
            _ => crate::domain::RunnerSelection::Auto,
        };
    }
    if let Some(priority) = request.params.get("priority").and_then(|v| v.as_str())
        && let Ok(priority) = priority.parse()
    {
        options.priority = priority;
    }
    if let Some(workspace) = request.params.get("workspace").and_then(|v| v.as_str()) {
        options.workspace = Some(workspace.to_string());
    }

    let task_id = match state.router.submit(&prompt, options).await {
        Ok(task_id) => task_id,
        Err(SubmitError::InvalidWorkspace(reference)) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(
                    JsonRpcError::SUBMISSION_REJECTED,
                    format!("invalid workspace: {}", reference),
                ),
            );
        }
        Err(e) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(JsonRpcError::SUBMISSION_REJECTED, e.to_string()),
            );
        }
    };

    // Dispatch is immediate when a slot is free; give the driver a beat so
    // the common response state is WORKING rather than SUBMITTED.
    for _ in 0..10 {
        if let Some(task) = state.router.task(&task_id).await
            && task.status != crate::domain::TaskStatus::Pending
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    match state.router.task(&task_id).await {
        Some(task) => {
            let awaiting = state.router.awaiting_approval(&task_id).await;
            let record = TaskRecord::from_task(&task, awaiting, false);
            JsonRpcResponse::success(id, serde_json::to_value(record).unwrap_or(Value::Null))
        }
        None => JsonRpcResponse::failure(
            id,
            JsonRpcError::new(JsonRpcError::TASK_NOT_FOUND, "task vanished after submit"),
        ),
    }
}

/// Summary of every task, oldest first
async fn a2a_tasks(State(state): State<Arc<RpcState>>) -> impl IntoResponse {
    let tasks = state.router.list_tasks().await;
    let mut records = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let awaiting = state.router.awaiting_approval(&task.id).await;
        records.push(TaskRecord::from_task(task, awaiting, false));
    }
    axum::Json(json!({"tasks": records}))
}

/// Full task record with history. Plain JSON, not JSON-RPC wrapped.
async fn a2a_task(State(state): State<Arc<RpcState>>, Path(id): Path<String>) -> Response {
    match state.router.task(&id).await {
        Some(task) => {
            let awaiting = state.router.awaiting_approval(&id).await;
            axum::Json(TaskRecord::from_task(&task, awaiting, true)).into_response()
        }
        None => (StatusCode::NOT_FOUND, axum::Json(json!({"error": "task not found"}))).into_response(),
    }
}

async fn a2a_task_cancel(State(state): State<Arc<RpcState>>, Path(id): Path<String>) -> Response {
    if state.router.cancel(&id).await {
        axum::Json(json!({"cancelled": true})).into_response()
    } else {
        (StatusCode::NOT_FOUND, axum::Json(json!({"error": "task not found"}))).into_response()
    }
}

/// Server-sent events of a session's output
async fn a2a_task_stream(State(state): State<Arc<RpcState>>, Path(id): Path<String>) -> Response {
    let subscription = match state.sessions.subscribe(&id).await {
        Ok(subscription) => subscription,
        Err(e) => {
            return (StatusCode::NOT_FOUND, axum::Json(json!({"error": e.to_string()}))).into_response();
        }
    };

    let stream = session_event_stream(subscription);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn session_event_stream(
    subscription: crate::session::Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse_event = match event {
            SessionEvent::Replay { data, truncated } => Event::default().event("replay").data(
                json!({
                    "data": String::from_utf8_lossy(&data),
                    "truncated": truncated,
                })
                .to_string(),
            ),
            SessionEvent::Output { data } => Event::default()
                .event("output")
                .data(json!({"data": String::from_utf8_lossy(&data)}).to_string()),
            SessionEvent::Exit { code } => Event::default()
                .event("exit")
                .data(json!({"code": code}).to_string()),
            SessionEvent::Terminated { status } => Event::default()
                .event("terminated")
                .data(json!({"status": status}).to_string()),
        };
        Some((Ok(sse_event), subscription))
    })
}

async fn approvals_pending(State(state): State<Arc<RpcState>>) -> impl IntoResponse {
    let pending = state.broker.pending_snapshot().await;
    let entries: Vec<Value> = pending
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "task_id": r.task_id,
                "tool": r.tool,
                "action": r.action,
                "risk": r.risk,
                "requested_at": r.requested_at,
            })
        })
        .collect();
    axum::Json(json!({"pending": entries}))
}

#[derive(Debug, serde::Deserialize)]
struct ResolveBody {
    approved: bool,
    #[serde(default)]
    arguments: Option<Value>,
}

async fn approval_resolve(
    State(state): State<Arc<RpcState>>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<ResolveBody>,
) -> impl IntoResponse {
    let effective = state.broker.resolve(&id, body.approved, body.arguments).await;
    axum::Json(json!({"resolved": effective}))
}

#[derive(Debug, Default, serde::Deserialize)]
struct GcBody {
    /// Override the configured idle age for this sweep
    #[serde(default, rename = "older-than-secs")]
    older_than_secs: Option<u64>,
}

/// Manually trigger a worktree GC sweep
///
/// The body is optional; without an override the configured idle age
/// applies. Never removes the worktree of a running task.
async fn gc_sweep(State(state): State<Arc<RpcState>>, body: Bytes) -> Response {
    let request: GcBody = if body.is_empty() {
        GcBody::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    axum::Json(json!({"error": format!("invalid gc request: {}", e)})),
                )
                    .into_response();
            }
        }
    };

    let older_than = request
        .older_than_secs
        .map(Duration::from_secs)
        .unwrap_or(state.gc_idle_age);

    match state.worktrees.gc(older_than).await {
        Ok(cleaned) => {
            info!(cleaned, older_than_secs = older_than.as_secs(), "Manual worktree GC swept");
            axum::Json(json!({"cleaned": cleaned})).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Manual worktree GC failed");
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct InfoRefsParams {
    service: String,
}

async fn git_info_refs(State(state): State<Arc<RpcState>>, Query(params): Query<InfoRefsParams>) -> Response {
    let Some(service) = GitService::from_name(&params.service) else {
        return (StatusCode::BAD_REQUEST, "unknown service").into_response();
    };

    match gitproto::advertise_refs(&state.repo_root, service).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, service.advertisement_content_type())],
            body.freeze(),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "git advertisement failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn git_service_rpc(
    State(state): State<Arc<RpcState>>,
    Path(service): Path<String>,
    body: Bytes,
) -> Response {
    let Some(service) = GitService::from_name(&service) else {
        return (StatusCode::BAD_REQUEST, "unknown service").into_response();
    };

    match gitproto::serve_rpc(&state.repo_root, service, body).await {
        Ok(result) => ([(header::CONTENT_TYPE, service.result_content_type())], result).into_response(),
        Err(e) => {
            warn!(error = %e, "git rpc failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
