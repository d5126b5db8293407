//! HTTP surface: health check, WebSocket endpoint, and the CRUD routes over
//! the user/workspace directory.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::directory::{Share, User, Visibility, Workspace, WorkspaceKind};
use crate::error::Error;
use crate::files;
use crate::state::AppState;
use crate::ws;

pub fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Unauthorized(_) => StatusCode::FORBIDDEN,
        Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        Error::StorageIo(_) => StatusCode::BAD_GATEWAY,
        Error::ContainerProvisioning(_) => StatusCode::INTERNAL_SERVER_ERROR,
        Error::TerminalCapacity(_) => StatusCode::CONFLICT,
        Error::PartialMutation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = error_status(&self.0);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .route("/api/users", post(create_user))
        .route("/api/users/:id", get(get_user).delete(delete_user))
        .route("/api/users/:id/workspaces", get(list_workspaces))
        .route("/api/users/:id/shared", get(list_shared))
        .route("/api/workspaces", post(create_workspace))
        .route(
            "/api/workspaces/:id",
            get(get_workspace)
                .patch(update_workspace)
                .delete(delete_workspace),
        )
        .route("/api/workspaces/:id/share", post(share).delete(unshare))
        .route("/api/files/url", get(signed_url))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, router(state)).await.unwrap();
}

async fn health() -> &'static str {
    "OK"
}

// Request types

#[derive(Deserialize)]
struct CreateUserRequest {
    id: Option<String>,
    name: String,
    email: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkspaceRequest {
    name: String,
    kind: WorkspaceKind,
    visibility: Visibility,
    owner_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateWorkspaceRequest {
    owner_id: String,
    name: Option<String>,
    visibility: Option<Visibility>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerRequest {
    owner_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareRequest {
    shared_by: String,
    shared_to: String,
}

#[derive(Deserialize)]
struct SignedUrlQuery {
    path: String,
    #[serde(default = "default_ttl")]
    ttl: u64,
}

fn default_ttl() -> u64 {
    3600
}

// Handlers

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<User> {
    let user = state.directory.create_user(req.id, req.name, req.email)?;
    info!(user = %user.id, "created user");
    Ok(Json(user))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<User> {
    Ok(Json(state.directory.user(&id)?))
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.directory.delete_user(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_workspaces(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Workspace>> {
    Ok(Json(state.directory.workspaces_for(&id)))
}

async fn list_shared(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Workspace>> {
    Ok(Json(state.directory.shared_with(&id)))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> ApiResult<Workspace> {
    let workspace =
        state
            .directory
            .create_workspace(req.name, req.kind, req.visibility, req.owner_id)?;
    info!(workspace = %workspace.id, name = %workspace.name, "created workspace");
    Ok(Json(workspace))
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Workspace> {
    Ok(Json(state.directory.workspace(&id)?))
}

async fn update_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateWorkspaceRequest>,
) -> ApiResult<Workspace> {
    Ok(Json(state.directory.update_workspace(
        &id,
        &req.owner_id,
        req.name,
        req.visibility,
    )?))
}

/// Deleting a workspace also deletes its blobs. Removal is key-by-key over
/// the flat store; a failure partway leaves a partial deletion.
async fn delete_workspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<OwnerRequest>,
) -> Result<StatusCode, ApiError> {
    let workspace = state.directory.workspace(&id)?;
    state.directory.delete_workspace(&id, &req.owner_id)?;

    let store = state.store.as_ref();
    let leaves = files::collect_leaves(store, workspace.root_prefix()).await?;
    if !leaves.is_empty() {
        store.remove(&leaves).await?;
    }
    info!(workspace = %id, blobs = leaves.len(), "deleted workspace");
    Ok(StatusCode::NO_CONTENT)
}

async fn share(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ShareRequest>,
) -> ApiResult<Share> {
    Ok(Json(state.directory.share(&id, &req.shared_by, &req.shared_to)?))
}

async fn unshare(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ShareRequest>,
) -> Result<StatusCode, ApiError> {
    state.directory.unshare(&id, &req.shared_by, &req.shared_to)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn signed_url(
    State(state): State<AppState>,
    Query(query): Query<SignedUrlQuery>,
) -> ApiResult<serde_json::Value> {
    let url = state.store.signed_url(&query.path, query.ttl).await?;
    Ok(Json(json!({ "url": url })))
}
