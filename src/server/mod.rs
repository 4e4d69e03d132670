//! REST API for the front-end and automation.
//!
//! # Endpoints
//!
//! - `GET  /api/auth?access_token=…&user=…` - start a session
//! - `GET  /api/jobs`, `GET /api/jobs/{id}` - job queue and history
//! - `POST /api/pull-requests/{id}` - enqueue an evaluation
//! - `POST|DELETE /api/gwf/branches/{branch}` - create/delete a destination
//! - `POST /api/gwf/queues` - rebuild; `DELETE` - wipe; `PATCH` - force-merge
//! - `GET  /health` - liveness probe
//!
//! Mutating endpoints enqueue jobs on the repository's [`JobBoard`]; the
//! worker performs the actual git work. Queue and branch operations
//! require an admin session.

pub mod auth;

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

use crate::settings::RepositorySettings;
use crate::types::{JobId, PrId};
use crate::worker::{JobBoard, JobKind};

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    settings: RepositorySettings,
    board: JobBoard,
}

impl AppState {
    pub fn new(settings: RepositorySettings, board: JobBoard) -> Self {
        AppState {
            inner: Arc::new(AppStateInner { settings, board }),
        }
    }

    fn settings(&self) -> &RepositorySettings {
        &self.inner.settings
    }

    fn board(&self) -> &JobBoard {
        &self.inner.board
    }

    fn secret(&self) -> &[u8] {
        self.inner.settings.api_token.as_bytes()
    }

    /// The session user from the `Authorization: Bearer` header.
    fn session_user(&self, headers: &HeaderMap) -> Option<String> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;
        auth::verify_token(self.secret(), token)
    }

    fn is_admin(&self, user: &str) -> bool {
        self.settings().admins.iter().any(|a| a == user)
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/api/auth", get(auth_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/{id}", get(job_handler))
        .route("/api/pull-requests/{id}", post(enqueue_pr_handler))
        .route(
            "/api/gwf/branches/{*branch}",
            post(create_branch_handler).delete(delete_branch_handler),
        )
        .route(
            "/api/gwf/queues",
            post(rebuild_queues_handler)
                .patch(force_merge_handler)
                .delete(delete_queues_handler),
        )
        .route("/health", get(|| async { "OK" }))
        .layer(axum::middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    tracing::debug!(%method, %uri, status = %response.status(), "api request");
    response
}

#[derive(Deserialize)]
struct AuthQuery {
    access_token: String,
    user: Option<String>,
}

/// `GET /api/auth?access_token=…&user=…`
async fn auth_handler(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
) -> Response {
    let configured = &state.settings().api_token;
    if configured.is_empty() || query.access_token != *configured {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let user = query.user.unwrap_or_else(|| "api".to_string());
    let token = auth::issue_token(state.secret(), &user);
    (StatusCode::OK, Json(json!({ "user": user, "token": token }))).into_response()
}

/// `GET /api/jobs`
async fn jobs_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if state.session_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.board().jobs()).into_response()
}

/// `GET /api/jobs/{id}`
async fn job_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if state.session_user(&headers).is_none() {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.board().get(JobId(id)) {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST /api/pull-requests/{id}`
async fn enqueue_pr_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(user) = state.session_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let Ok(id) = id.parse::<u64>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    enqueue(&state, JobKind::PullRequest { pr: PrId(id) }, user)
}

#[derive(Deserialize, Default)]
struct CreateBranchBody {
    from: Option<String>,
}

/// `POST /api/gwf/branches/{branch}`
async fn create_branch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(branch): Path<String>,
    body: Option<Json<CreateBranchBody>>,
) -> Response {
    let Some(user) = state.session_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.is_admin(&user) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(from) = body.and_then(|Json(body)| body.from) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "body must name a `from` ref" })),
        )
            .into_response();
    };
    enqueue(&state, JobKind::CreateBranch { branch, from }, user)
}

/// `DELETE /api/gwf/branches/{branch}`
async fn delete_branch_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(branch): Path<String>,
) -> Response {
    let Some(user) = state.session_user(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.is_admin(&user) {
        return StatusCode::FORBIDDEN.into_response();
    }
    enqueue(&state, JobKind::DeleteBranch { branch }, user)
}

/// `POST /api/gwf/queues` - rebuild the queues.
async fn rebuild_queues_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_job(&state, &headers, JobKind::QueueRebuild)
}

/// `PATCH /api/gwf/queues` - force-merge everything queued.
async fn force_merge_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_job(&state, &headers, JobKind::ForceMerge)
}

/// `DELETE /api/gwf/queues` - wipe the queues.
async fn delete_queues_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_job(&state, &headers, JobKind::DeleteQueues)
}

fn admin_job(state: &AppState, headers: &HeaderMap, kind: JobKind) -> Response {
    let Some(user) = state.session_user(headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    if !state.is_admin(&user) {
        return StatusCode::FORBIDDEN.into_response();
    }
    enqueue(state, kind, user)
}

fn enqueue(state: &AppState, kind: JobKind, user: String) -> Response {
    match state.board().enqueue(kind, Some(user)) {
        Some(id) => (StatusCode::ACCEPTED, Json(json!({ "job": id }))).into_response(),
        // an identical job is already pending; report it as accepted
        None => (StatusCode::ACCEPTED, Json(json!({ "job": null }))).into_response(),
    }
}
