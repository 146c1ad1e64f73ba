use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::errors::FixError;
use crate::lifecycle::{AttemptId, Orchestrator, RepositoryRef};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Parent of every per-request token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ScanRequest {
    pub repository: RepositoryRef,
    pub log_text: String,
}

#[derive(Deserialize, Default)]
pub struct ApproveRequest {
    #[serde(default)]
    pub reviewer: Option<String>,
}

#[derive(Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub reviewer: Option<String>,
}

/// The parts of a GitHub push payload the webhook needs.
#[derive(Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub repository: PushRepository,
}

#[derive(Deserialize)]
pub struct PushRepository {
    pub clone_url: Option<String>,
    pub html_url: Option<String>,
    pub ssh_url: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Fix(FixError),
}

impl From<FixError> for ApiError {
    fn from(err: FixError) -> Self {
        ApiError::Fix(err)
    }
}

fn status_for(err: &FixError) -> StatusCode {
    match err {
        FixError::AttemptNotFound { .. } => StatusCode::NOT_FOUND,
        FixError::InvalidTransition { .. }
        | FixError::Cancelled { .. }
        | FixError::BranchAlreadyExists { .. }
        | FixError::NothingToCommit => StatusCode::CONFLICT,
        FixError::PathOutsideRepository { .. } => StatusCode::FORBIDDEN,
        FixError::RepositoryUnavailable { .. }
        | FixError::AnalysisUnavailable(_)
        | FixError::MalformedProposal(_)
        | FixError::PushRejected { .. }
        | FixError::AuthenticationFailed { .. } => StatusCode::BAD_GATEWAY,
        FixError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        FixError::WorkingCopyCorrupt { .. } | FixError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Fix(err) => (status_for(&err), err.kind(), err.to_string()),
        };
        (status, Json(json!({"error": message, "kind": kind}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/scan", post(scan))
        .route("/api/attempts", get(list_attempts))
        .route("/api/attempts/{id}", get(get_attempt))
        .route("/api/attempts/{id}/proposal", post(request_proposal))
        .route("/api/attempts/{id}/approve", post(approve))
        .route("/api/attempts/{id}/reject", post(reject))
        .route("/api/attempts/{id}/apply", post(apply))
        .route("/api/attempts/{id}/cancel", post(cancel))
        .route("/api/repositories", get(list_repositories).post(sync_repository))
        .route("/api/webhook", post(webhook))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn parse_id(raw: &str) -> Result<AttemptId, ApiError> {
    AttemptId::from_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid attempt id '{}'", raw)))
}

/// Parse an optional JSON body; an empty body means the defaults.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid body: {}", e)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Create attempts for every error in the log, then request their proposals
/// in the background.
async fn scan(
    State(state): State<SharedState>,
    Json(req): Json<ScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.repository.url.trim().is_empty() {
        return Err(ApiError::BadRequest("repository.url is required".into()));
    }
    let outcome = state.orchestrator.scan(&req.repository, &req.log_text).await?;

    for id in outcome.attempt_ids.iter().copied() {
        let orchestrator = state.orchestrator.clone();
        let token = state.shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.request_proposal(id, token).await {
                tracing::warn!(attempt_id = %id, error = %e, "background proposal request did not finish");
            }
        });
    }

    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn list_attempts(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.list_attempts().await?))
}

async fn get_attempt(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_attempt(id).await?))
}

async fn request_proposal(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let attempt = state
        .orchestrator
        .request_proposal(id, state.shutdown.child_token())
        .await?;
    Ok(Json(attempt))
}

async fn approve(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let req: ApproveRequest = optional_body(&body)?;
    let attempt = state.orchestrator.approve(id, req.reviewer).await?;
    Ok(Json(json!({"id": attempt.id, "status": attempt.status})))
}

async fn reject(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let attempt = state
        .orchestrator
        .reject(id, &req.reason, req.reviewer)
        .await?;
    Ok(Json(json!({"id": attempt.id, "status": attempt.status})))
}

/// A failed git step is not an HTTP error: the attempt is reported with
/// status `apply_failed` and the failure is in its history.
async fn apply(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    let attempt = state
        .orchestrator
        .apply(id, state.shutdown.child_token())
        .await?;
    let error = attempt.history.last().and_then(|entry| entry.error.clone());
    Ok(Json(json!({
        "id": attempt.id,
        "status": attempt.status,
        "branch_name": attempt.branch_name,
        "commit_id": attempt.commit_id,
        "error": error,
    })))
}

async fn cancel(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id)?;
    // Unknown ids are a 404 rather than a silent `false`.
    state.orchestrator.get_attempt(id).await?;
    Ok(Json(json!({"cancelled": state.orchestrator.cancel(id)})))
}

/// Normalized URLs of every repository that has a working-copy handle.
async fn list_repositories(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({"repositories": state.orchestrator.repositories().known_urls()}))
}

async fn sync_repository(
    State(state): State<SharedState>,
    Json(repository): Json<RepositoryRef>,
) -> Result<impl IntoResponse, ApiError> {
    if repository.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url is required".into()));
    }
    let local_path = state
        .orchestrator
        .sync_repository(&repository, state.shutdown.child_token())
        .await?;
    Ok(Json(json!({"url": repository.url, "local_path": local_path})))
}

/// GitHub push webhook: fast-forward the working copy of a repository we
/// already manage when its default branch moves.
async fn webhook(
    State(state): State<SharedState>,
    Json(event): Json<PushEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let repos = state.orchestrator.repositories();
    let candidates = [
        event.repository.clone_url,
        event.repository.html_url,
        event.repository.ssh_url,
    ];
    let Some((url, handle)) = candidates
        .into_iter()
        .flatten()
        .find_map(|url| repos.get(&url).map(|handle| (url, handle)))
    else {
        return Ok(Json(json!({"synced": false, "reason": "unknown repository"})));
    };

    let default_ref = format!("refs/heads/{}", handle.lock().await.default_branch());
    if let Some(pushed) = event.git_ref.as_deref()
        && pushed != default_ref
    {
        return Ok(Json(json!({"synced": false, "reason": "not the default branch"})));
    }

    let local_path = state
        .orchestrator
        .sync_repository(&RepositoryRef::new(url.clone()), state.shutdown.child_token())
        .await?;
    tracing::info!(repo = %url, "working copy synced from webhook");
    Ok(Json(json!({"synced": true, "url": url, "local_path": local_path})))
}

// ── Tests ─────────────────────────────────────────────────────────────
