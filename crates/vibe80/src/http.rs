//! HTTP surface (§6). Thin adapters over the components: parse the
//! request, call a manager, map the result (or [`EngineError`]) to the
//! `{..}` / `{error, error_type}` envelope. Routing/validation/logging
//! glue is explicitly out of scope for the core's semantics, but the
//! wire contract still has to exist for the engine to be runnable.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::agent;
use crate::error::{EngineError, Result};
use crate::model::Workspace;
use crate::session::CreateSessionRequest;
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/session", post(create_session))
        .route("/api/session/:id", get(get_session))
        .route("/api/health", get(health))
        .route("/api/branches", get(list_branches))
        .route("/api/branches/fetch", post(fetch_branches))
        .route("/api/branches/switch", post(switch_branch))
        .route("/api/worktree/:id/diff", get(worktree_diff))
        .route("/api/worktree/:id/merge", post(worktree_merge))
        .route("/api/worktree/:id/abort-merge", post(worktree_abort_merge))
        .route("/api/models", get(list_models))
        .route("/api/attachments/upload", post(upload_attachment))
        .route("/api/attachments", get(list_attachments))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Maps an [`EngineError`] to the `{error, error_type}` envelope at the
/// exact status code `EngineError::status_code` names.
impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        if !self.is_routine() {
            warn!(error = %self, error_type = self.error_type(), "request failed");
        }
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({
            "error": self.to_string(),
            "error_type": self.error_type(),
        }));
        (status, body).into_response()
    }
}

/// `Authorization: Bearer {workspaceId}:{secret}` is the workspace token
/// scheme the external auth layer is documented (spec.md §1 Non-goals)
/// to issue; this is just the chokepoint that resolves it to a
/// [`Workspace`] record.
async fn resolve_workspace(state: &AppState, headers: &HeaderMap) -> Result<Workspace> {
    let raw = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(EngineError::Authorization)?;
    let (workspace_id, secret) = raw.split_once(':').ok_or(EngineError::Authorization)?;

    let workspace = state.workspaces.get(workspace_id).await?;
    if crate::workspace::WorkspaceRegistry::hash_secret(secret) != workspace.secret_hash {
        return Err(EngineError::Authorization);
    }
    Ok(workspace)
}

#[derive(Deserialize)]
struct CreateSessionBody {
    repo_url: String,
    ssh_key: Option<String>,
    http_user: Option<String>,
    http_password: Option<String>,
    name: Option<String>,
    #[serde(default)]
    default_internet_access: bool,
    #[serde(default)]
    default_deny_git_credentials_access: bool,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<serde_json::Value>> {
    let workspace = resolve_workspace(&state, &headers).await?;
    let session = state
        .sessions
        .create(
            &workspace,
            CreateSessionRequest {
                workspace_id: workspace.workspace_id.clone(),
                repo_url: body.repo_url,
                ssh_key: body.ssh_key,
                http_user: body.http_user,
                http_password: body.http_password,
                name: body.name,
                default_internet_access: body.default_internet_access,
                default_deny_git_credentials_access: body.default_deny_git_credentials_access,
            },
        )
        .await?;
    let messages = state.message_log.read(&session.session_id, "main", None, None).await?;
    Ok(Json(json!({
        "sessionId": session.session_id,
        "repoUrl": session.repo_url,
        "provider": session.active_provider,
        "providers": workspace.providers.keys().collect::<Vec<_>>(),
        "messages": messages,
    })))
}

#[derive(Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.get(&session_id, None).await?;
    let worktrees = state.worktrees.list(&session_id).await?;
    let messages = state.message_log.read(&session_id, "main", None, None).await?;
    Ok(Json(json!({
        "sessionId": session.session_id,
        "repoUrl": session.repo_url,
        "provider": session.active_provider,
        "worktrees": worktrees,
        "messages": messages,
    })))
}

async fn health(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> StatusCode {
    let Some(session_id) = query.session else {
        return StatusCode::OK;
    };
    match state.sessions.get(&session_id, None).await {
        Ok(_) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn list_branches(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<serde_json::Value>> {
    let session_id = query.session.ok_or_else(|| EngineError::Validation("session is required".into()))?;
    let session = state.sessions.get(&session_id, None).await?;
    let output = run_git(&state, &session, &["branch", "-a", "--format=%(refname:short)"]).await?;
    let branches: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    Ok(Json(json!({ "branches": branches })))
}

#[derive(Deserialize)]
struct SessionOnlyBody {
    session: String,
}

async fn fetch_branches(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SessionOnlyBody>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.get(&body.session, None).await?;
    run_git(&state, &session, &["fetch", "--all", "--prune"]).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct SwitchBranchBody {
    session: String,
    branch: String,
}

async fn switch_branch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SwitchBranchBody>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.get(&body.session, None).await?;
    run_git(&state, &session, &["checkout", &body.branch]).await?;
    Ok(Json(json!({ "ok": true, "branch": body.branch })))
}

async fn worktree_diff(
    State(state): State<Arc<AppState>>,
    Path(worktree_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<serde_json::Value>> {
    let session_id = query.session.ok_or_else(|| EngineError::Validation("session is required".into()))?;
    let session = state.sessions.get(&session_id, None).await?;
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );
    let (status, diff) = state
        .worktrees
        .get_diff(&session_id, &worktree_id, &session.layout.repo_dir, identity.uid, identity.gid, mono_user)
        .await?;
    Ok(Json(json!({ "status": status, "diff": diff })))
}

#[derive(Deserialize)]
struct MergeBody {
    session: String,
    #[serde(default)]
    target: Option<String>,
}

async fn worktree_merge(
    State(state): State<Arc<AppState>>,
    Path(worktree_id): Path<String>,
    Json(body): Json<MergeBody>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.get(&body.session, None).await?;
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );
    let target = body.target.unwrap_or_else(|| "main".to_string());
    let result = state
        .worktrees
        .merge(&body.session, &worktree_id, &target, &session.layout.repo_dir, identity.uid, identity.gid, mono_user)
        .await?;
    let envelope = json!({ "type": "worktree_merge_result", "worktreeId": worktree_id, "result": result });
    state.broadcast.broadcast(&body.session, envelope.clone());
    Ok(Json(envelope))
}

async fn worktree_abort_merge(
    State(state): State<Arc<AppState>>,
    Path(worktree_id): Path<String>,
    Json(body): Json<SessionOnlyBody>,
) -> Result<Json<serde_json::Value>> {
    let session = state.sessions.get(&body.session, None).await?;
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);
    let mono_user = matches!(
        state.config.workspace.deployment_mode,
        crate::config::DeploymentModeConfig::MonoUser
    );
    state
        .worktrees
        .abort_merge(&body.session, &worktree_id, &session.layout.repo_dir, identity.uid, identity.gid, mono_user)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct ModelsQuery {
    #[allow(dead_code)]
    session: Option<String>,
    provider: Option<String>,
}

/// Static per-provider model catalog. Querying a provider's live model
/// list would mean speaking its wire protocol, which spec.md §1
/// explicitly keeps opaque to the core.
async fn list_models(Query(query): Query<ModelsQuery>) -> Result<Json<serde_json::Value>> {
    let provider = query
        .provider
        .as_deref()
        .map(|p| p.parse::<agent::Provider>())
        .transpose()?
        .unwrap_or(agent::Provider::Codex);
    let models: &[&str] = match provider {
        agent::Provider::Codex => &["gpt-5-codex", "o4-mini"],
        agent::Provider::Claude => &["claude-sonnet-4-5", "claude-opus-4-1"],
    };
    Ok(Json(json!({ "models": models })))
}

/// Strips path separators and `.` components so an uploaded filename
/// can't escape `attachments_dir` via `../` or an absolute path — the
/// uuid prefix already guarantees uniqueness, this only guarantees
/// containment.
fn sanitize_attachment_filename(filename: &str) -> String {
    let cleaned: String = filename
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".." && *part != ".")
        .collect::<Vec<_>>()
        .join("_");
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

async fn upload_attachment(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let session_id = query.session.ok_or_else(|| EngineError::Validation("session is required".into()))?;
    let session = state.sessions.get(&session_id, None).await?;
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);

    let mut saved = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EngineError::Validation(format!("malformed multipart body: {e}")))?
    {
        let filename = sanitize_attachment_filename(field.file_name().unwrap_or("attachment"));
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| EngineError::Validation(format!("failed to read attachment body: {e}")))?;

        let dest = session.layout.attachments_dir.join(format!(
            "{}-{}",
            uuid::Uuid::new_v4().simple(),
            filename
        ));
        state
            .isolator
            .write_file(&identity, &session.layout.dir, &dest, &data, 0o640)
            .await
            .map_err(EngineError::Isolation)?;

        saved.push(crate::model::Attachment {
            filename,
            path: dest,
            content_type,
        });
    }

    Ok(Json(json!({ "attachments": saved })))
}

async fn list_attachments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<serde_json::Value>> {
    let session_id = query.session.ok_or_else(|| EngineError::Validation("session is required".into()))?;
    let session = state.sessions.get(&session_id, None).await?;
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);
    let entries = state
        .isolator
        .list_entries(&identity, &session.layout.dir, &session.layout.attachments_dir)
        .await
        .map_err(EngineError::Isolation)?;
    let names: Vec<&str> = entries.iter().filter(|e| !e.is_dir).map(|e| e.name.as_str()).collect();
    Ok(Json(json!({ "attachments": names })))
}

async fn run_git(state: &AppState, session: &crate::model::Session, args: &[&str]) -> Result<String> {
    let identity = state.sessions.workspace_identity(&state.workspaces.get(&session.workspace_id).await?);
    let argv: Vec<String> = std::iter::once("git".to_string())
        .chain(args.iter().map(|a| a.to_string()))
        .collect();
    let output = state
        .isolator
        .run_as_output(
            &identity,
            &argv,
            vibe80_session::isolator::RunOpts {
                cwd: Some(session.layout.repo_dir.clone()),
                ..Default::default()
            },
        )
        .await
        .map_err(EngineError::Isolation)?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}
