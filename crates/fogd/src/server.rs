//! HTTP control plane for fogd.
//!
//! JSON over HTTP under `/api`, CORS-open, consumed by the web UI, the
//! CLI, and the Slack transport. Submissions return 202 and clients
//! follow progress by polling the run's event log.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use fog_core::{
    generate_branch_name, validate_branch_name, FogConfig, Id, Run, RunEvent, Session,
    SessionStatus, ToolKind,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::ai;
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{Scheduler, SchedulerError, SubmitOptions};
use crate::storage::{Storage, StorageError};
use crate::worktree::WorktreeManager;

/// Shared state for HTTP handlers.
pub struct AppState {
    pub storage: Arc<Storage>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<Registry>,
    pub worktrees: Arc<WorktreeManager>,
    pub config: FogConfig,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/runs", post(create_run))
        .route("/api/sessions/{id}/runs/{rid}/events", get(list_events))
        .route("/api/sessions/{id}/runs/{rid}/cancel", post(cancel_run))
        .route("/api/sessions/{id}/archive", post(archive_session))
        .route("/api/repos", get(list_repos))
        .route("/api/repos/import", post(import_repo))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn err(status: StatusCode, message: impl Into<String>) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Request payload for POST /api/sessions.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub repo: String,
    pub prompt: String,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub autopr: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Response for POST /api/sessions.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Id,
    pub run_id: Id,
    pub status: &'static str,
}

/// Request payload for POST /api/sessions/{id}/runs.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub prompt: String,
    #[serde(default)]
    pub queue: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// Response for POST /api/sessions/{id}/runs.
#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub run_id: Id,
    pub session: Id,
    pub status: &'static str,
}

/// Response for GET /api/sessions/{id}.
#[derive(Debug, Serialize)]
pub struct SessionBundleResponse {
    pub session: Session,
    pub runs: Vec<Run>,
}

/// Query params for the events endpoint.
#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: i64,
}

/// Request payload for POST /api/repos/import.
#[derive(Debug, Deserialize)]
pub struct ImportRepoRequest {
    pub name: String,
    pub url: String,
}

// --- Handlers ---

/// Health check; 200 while the scheduler loop is live.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.scheduler.is_shutdown() {
        return err(StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// POST /api/sessions - Create a session and its first run.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    if req.prompt.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "prompt is required"));
    }

    let repo = state
        .registry
        .lookup(&req.repo)
        .await
        .map_err(internal)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, format!("repo not registered: {}", req.repo)))?;

    let tool = match &req.tool {
        Some(name) => ToolKind::parse(name)
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, format!("unknown tool: {name}")))?,
        None => default_tool(&state).await,
    };

    let branch = match &req.branch_name {
        Some(name) => {
            validate_branch_name(name)
                .map_err(|e| err(StatusCode::BAD_REQUEST, e.to_string()))?;
            name.clone()
        }
        None => {
            let prefix = branch_prefix(&state).await;
            generate_branch_name(&prefix, &req.prompt)
        }
    };

    let session_id = Id::new();
    // Two sessions on one repo cannot share a branch; disambiguate with
    // a session-id suffix.
    let branch = if branch_in_use(&state, &repo.name, &branch).await {
        let suffix: String = session_id.as_ref().chars().take(8).collect();
        format!("{branch}-{suffix}")
    } else {
        branch
    };

    let now = Utc::now();
    let session = Session {
        id: session_id,
        repo_name: repo.name.clone(),
        branch,
        tool,
        status: SessionStatus::Idle,
        busy: false,
        autopr: req.autopr,
        pr_url: None,
        worktree: None,
        continuation_id: None,
        created_at: now,
        updated_at: now,
    };
    state.storage.insert_session(&session).await.map_err(internal)?;

    let run_id = state
        .scheduler
        .submit_run(
            &session.id,
            &req.prompt,
            SubmitOptions {
                queue: false,
                nonce: req.nonce,
                model: req.model,
                title: req.title,
            },
        )
        .await
        .map_err(scheduler_error)?;

    info!(session_id = %session.id, run_id = %run_id, repo = %repo.name, "session created");
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateSessionResponse {
            session_id: session.id,
            run_id,
            status: "accepted",
        }),
    ))
}

/// POST /api/sessions/{id}/runs - Submit a follow-up run.
async fn create_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    if req.prompt.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "prompt is required"));
    }

    let session_id = Id::from_string(id);
    let run_id = state
        .scheduler
        .submit_run(
            &session_id,
            &req.prompt,
            SubmitOptions {
                queue: req.queue,
                nonce: req.nonce,
                model: req.model,
                title: req.title,
            },
        )
        .await
        .map_err(scheduler_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateRunResponse {
            run_id,
            session: session_id,
            status: "accepted",
        }),
    ))
}

/// GET /api/sessions - List sessions.
async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Session>>, HandlerError> {
    let sessions = state.storage.list_sessions().await.map_err(internal)?;
    Ok(Json(sessions))
}

/// GET /api/sessions/{id} - Session with its runs.
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionBundleResponse>, HandlerError> {
    let session_id = Id::from_string(id);
    let (session, runs) = state
        .storage
        .get_session_bundle(&session_id)
        .await
        .map_err(not_found)?;
    Ok(Json(SessionBundleResponse { session, runs }))
}

/// GET /api/sessions/{id}/runs/{rid}/events?since=N - Poll events.
async fn list_events(
    State(state): State<Arc<AppState>>,
    Path((id, rid)): Path<(String, String)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<RunEvent>>, HandlerError> {
    let run_id = Id::from_string(rid);
    let run = state.storage.get_run(&run_id).await.map_err(not_found)?;
    if run.session_id.as_ref() != id {
        return Err(err(StatusCode::NOT_FOUND, "run does not belong to session"));
    }

    let events = state
        .storage
        .list_events_since(&run_id, query.since)
        .await
        .map_err(internal)?;
    Ok(Json(events))
}

/// POST /api/sessions/{id}/runs/{rid}/cancel - Cancel a run.
async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path((_id, rid)): Path<(String, String)>,
) -> Result<impl IntoResponse, HandlerError> {
    let run_id = Id::from_string(rid);
    state
        .scheduler
        .cancel_run(&run_id)
        .await
        .map_err(scheduler_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/sessions/{id}/archive - Archive a session.
///
/// Removes the worktree; branch deletion follows configuration (default
/// is retain).
async fn archive_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let session_id = Id::from_string(id);
    let session = state
        .storage
        .get_session(&session_id)
        .await
        .map_err(not_found)?;
    if session.busy {
        return Err(err(StatusCode::CONFLICT, "session has an active run"));
    }

    state
        .storage
        .archive_session(&session_id)
        .await
        .map_err(internal)?;

    if let Ok(Some(repo)) = state.registry.lookup(&session.repo_name).await {
        if let Err(e) = state
            .worktrees
            .release(&repo, &session, state.config.delete_branch_on_archive)
            .await
        {
            warn!(session_id = %session_id, error = %e, "worktree release failed");
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/repos - List registered repos.
async fn list_repos(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<fog_core::RepoRecord>>, HandlerError> {
    let repos = state.registry.list().await.map_err(internal)?;
    Ok(Json(repos))
}

/// POST /api/repos/import - Register a repo by name and clone URL.
async fn import_repo(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ImportRepoRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    let record = state
        .registry
        .register(&req.name, &req.url)
        .await
        .map_err(|e| match &e {
            RegistryError::InvalidName(_) => err(StatusCode::BAD_REQUEST, e.to_string()),
            RegistryError::VcsUnavailable(_) => err(StatusCode::BAD_GATEWAY, e.to_string()),
            _ => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/settings - All settings as a flat map.
async fn get_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    let settings = state.storage.list_settings().await.map_err(internal)?;
    let map: serde_json::Map<String, serde_json::Value> = settings
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    Ok(Json(serde_json::Value::Object(map)))
}

/// PUT /api/settings - Upsert settings keys.
async fn put_settings(
    State(state): State<Arc<AppState>>,
    Json(body): Json<std::collections::HashMap<String, String>>,
) -> Result<impl IntoResponse, HandlerError> {
    for (key, value) in &body {
        state.storage.set_setting(key, value).await.map_err(internal)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

// --- Helpers ---

async fn default_tool(state: &AppState) -> ToolKind {
    if let Ok(Some(name)) = state.storage.get_setting("default_tool").await {
        if let Some(kind) = ToolKind::parse(&name) {
            return kind;
        }
    }
    if let Some(kind) = state.config.default_tool {
        return kind;
    }
    ai::detect_tool(None).unwrap_or(ToolKind::Claude)
}

async fn branch_prefix(state: &AppState) -> String {
    if let Ok(Some(prefix)) = state.storage.get_setting("branch_prefix").await {
        if !prefix.trim().is_empty() {
            return prefix;
        }
    }
    state.config.branch_prefix.clone()
}

async fn branch_in_use(state: &AppState, repo_name: &str, branch: &str) -> bool {
    match state.storage.list_sessions().await {
        Ok(sessions) => sessions
            .iter()
            .any(|s| s.repo_name == repo_name && s.branch == branch),
        Err(_) => false,
    }
}

fn internal(e: impl std::fmt::Display) -> HandlerError {
    error!("internal error: {e}");
    err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found(e: StorageError) -> HandlerError {
    match e {
        StorageError::SessionNotFound(_) | StorageError::RunNotFound(_) | StorageError::RepoNotFound(_) => {
            err(StatusCode::NOT_FOUND, e.to_string())
        }
        other => internal(other),
    }
}

fn scheduler_error(e: SchedulerError) -> HandlerError {
    match e {
        SchedulerError::Conflict(msg) => err(StatusCode::CONFLICT, msg),
        SchedulerError::NotFound(msg) => err(StatusCode::NOT_FOUND, msg),
        SchedulerError::Storage(e) => internal(e),
    }
}
