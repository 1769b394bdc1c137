//! HTTP routes.

use crate::auth::{extract_bearer_token, AuthenticatedDevice, TokenVerifier};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::notify::NotificationHub;
use crate::reconcile::ReconcileEngine;
use crate::ws::ws_handler;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use notesync_protocol::{
    Attachment, ChangesQuery, ChangesResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, UploadQuery,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared state of all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The reconciliation engine.
    pub engine: Arc<ReconcileEngine>,
    /// Bearer token verifier.
    pub verifier: Arc<TokenVerifier>,
    /// Registry of notification sockets.
    pub hub: Arc<NotificationHub>,
    /// Server clock.
    pub clock: Arc<dyn Clock>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Builds the state around `engine`, sharing its hub and clock.
    pub fn new(engine: Arc<ReconcileEngine>, config: Arc<ServerConfig>) -> Self {
        Self {
            verifier: Arc::new(TokenVerifier::new(&config.jwt_secret)),
            hub: Arc::clone(engine.hub()),
            clock: Arc::clone(engine.clock()),
            engine,
            config,
        }
    }
}

/// Builds the application router.
pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push))
        .route("/sync/changes", get(changes))
        .route("/sync/pull", post(pull))
        .route("/attachments/upload", post(upload))
        .route("/attachments/{id}/download", get(download))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    timestamp: i64,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count(),
        timestamp: state.clock.now_millis(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let token = extract_bearer_token(request.headers())?;
    let device = state.verifier.verify(token)?;
    request.extensions_mut().insert(device);
    Ok(next.run(request).await)
}

/// Runs an engine call on the blocking pool.
async fn run_blocking<T, F>(state: &AppState, call: F) -> ServerResult<T>
where
    F: FnOnce(&ReconcileEngine) -> ServerResult<T> + Send + 'static,
    T: Send + 'static,
{
    let engine = Arc::clone(&state.engine);
    tokio::task::spawn_blocking(move || call(&engine))
        .await
        .map_err(|e| ServerError::Internal(format!("engine task failed: {e}")))?
}

async fn push(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedDevice>,
    body: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>, ServerError> {
    let Json(request) = body.map_err(|r| ServerError::InvalidRequest(r.body_text()))?;
    let changes = request.changes.len();
    let response = run_blocking(&state, move |engine| engine.push(&auth, request)).await?;
    tracing::info!(
        endpoint = "sync_push",
        changes,
        applied = response.applied.len(),
        conflicts = response.conflicts.len(),
        "push handled"
    );
    Ok(Json(response))
}

async fn changes(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedDevice>,
    query: Result<Query<ChangesQuery>, QueryRejection>,
) -> Result<Json<ChangesResponse>, ServerError> {
    let Query(query) = query.map_err(|r| ServerError::InvalidRequest(r.body_text()))?;
    let response = run_blocking(&state, move |engine| engine.changes(&auth, &query)).await?;
    tracing::debug!(
        endpoint = "sync_changes",
        changes = response.changes.len(),
        has_more = response.has_more,
        resync = response.resync_required,
        "changes served"
    );
    Ok(Json(response))
}

async fn pull(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedDevice>,
    body: Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<PullResponse>, ServerError> {
    let Json(request) = body.map_err(|r| ServerError::InvalidRequest(r.body_text()))?;
    let response = run_blocking(&state, move |engine| engine.pull(&auth, request)).await?;
    Ok(Json(response))
}

async fn upload(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedDevice>,
    query: Result<Query<UploadQuery>, QueryRejection>,
    body: Bytes,
) -> Result<Json<Attachment>, ServerError> {
    let Query(query) = query.map_err(|r| ServerError::InvalidRequest(r.body_text()))?;
    let size = body.len();
    let attachment =
        run_blocking(&state, move |engine| engine.upload_attachment(&auth, &query, &body)).await?;
    tracing::info!(
        endpoint = "attachment_upload",
        attachment = %attachment.id,
        size,
        "attachment stored"
    );
    Ok(Json(attachment))
}

async fn download(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedDevice>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let (attachment, bytes) =
        run_blocking(&state, move |engine| engine.download_attachment(&auth, &id)).await?;
    let mime = attachment
        .mime_type
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}
