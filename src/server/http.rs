//! HTTP API
//!
//! Client listener:
//! - `GET /client/conf` resolved configuration for one client
//! - `/op/*` listing and admin writes
//! - `GET /health`
//!
//! Node listener:
//! - `POST /node/req/:req_type` with `version`, `pull` or `register`

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result};
use crate::matcher::{ClientRequest, Matcher};
use crate::replication::{PeerRequestKind, ReplicationCoordinator};
use crate::server::admin::AdminService;
use crate::snapshot::SnapshotStore;
use crate::store::ValueType;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct ServerState {
    pub snapshots: Arc<SnapshotStore>,
    pub matcher: Matcher,
    pub admin: AdminService,
    pub coordinator: Arc<ReplicationCoordinator>,
}

impl ServerState {
    pub fn new(coordinator: Arc<ReplicationCoordinator>) -> Self {
        let snapshots = coordinator.snapshots().clone();
        Self {
            matcher: Matcher::new(snapshots.clone()),
            admin: AdminService::new(snapshots.clone(), coordinator.clone()),
            snapshots,
            coordinator,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        let body = match &self {
            Error::NotMaster(master) => json!({ "error": self.to_string(), "master": master }),
            _ => json!({ "error": self.to_string() }),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(body)).into_response()
    }
}

/// Router for the client listener
pub fn create_client_router(state: ServerState) -> Router {
    let router = Router::new()
        .route("/client/conf", get(client_conf))
        .route("/op/users", get(list_users))
        .route("/op/users/:page", get(list_users_page))
        .route("/op/user", post(new_user))
        .route("/op/apps/:user_key", get(list_apps))
        .route("/op/app", post(new_app))
        .route("/op/configs/:app_key", get(list_configs))
        .route("/op/config", post(new_config))
        .route("/op/config/:key", put(update_config).delete(delete_config))
        .route("/op/nodes", get(list_nodes))
        .route("/health", get(health))
        .with_state(state);
    with_layers(router)
}

/// Router for the node listener
pub fn create_node_router(state: ServerState) -> Router {
    let router = Router::new()
        .route("/node/req/:req_type", post(node_request))
        .with_state(state);
    with_layers(router)
}

/// Request id innermost, then tracing and the body limit around every route.
///
/// `from_fn` only accepts `Request<Body>`, so it is layered on its own before
/// the body limit rewraps request bodies.
fn with_layers(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
}

// ============================================================================
// Client API
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ClientQuery {
    app_key: Option<String>,
    os_type: Option<String>,
    os_version: Option<String>,
    app_version: Option<String>,
    ip: Option<String>,
    lang: Option<String>,
    device_id: Option<String>,
}

fn required(field: &str, value: Option<String>) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("missing client attribute {}", field)))
}

impl ClientQuery {
    fn into_request(self) -> Result<(String, ClientRequest)> {
        let app_key = required("app_key", self.app_key)?;
        let request = ClientRequest {
            os_type: required("os_type", self.os_type)?,
            os_version: required("os_version", self.os_version)?,
            app_version: required("app_version", self.app_version)?,
            ip: required("ip", self.ip)?,
            lang: required("lang", self.lang)?,
            device_id: self.device_id.filter(|d| !d.is_empty()),
        };
        Ok((app_key, request))
    }
}

async fn client_conf(
    State(state): State<ServerState>,
    Query(query): Query<ClientQuery>,
) -> Result<impl IntoResponse> {
    let (app_key, client) = query.into_request()?;
    let resolved = state
        .matcher
        .resolve(&app_key, &client)
        .ok_or_else(|| Error::NotFound(format!("app {}", app_key)))?;
    Ok(Json(resolved))
}

// ============================================================================
// Op API
// ============================================================================

/// Default page size of `/op/users`
const USERS_PER_PAGE: usize = 50;
/// Largest page size a caller may ask for
const MAX_USERS_PER_PAGE: usize = 500;

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    /// 1-based; every user when absent
    page: Option<usize>,
    per_page: Option<usize>,
}

async fn list_users(
    State(state): State<ServerState>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    users_page(&state, query)
}

async fn list_users_page(
    State(state): State<ServerState>,
    Path(page): Path<usize>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    users_page(
        &state,
        PageQuery {
            page: Some(page),
            ..query
        },
    )
}

fn users_page(state: &ServerState, query: PageQuery) -> Result<Json<serde_json::Value>> {
    let snapshot = state.snapshots.load();
    let all = snapshot.users();
    let Some(page) = query.page else {
        let users: Vec<_> = all.iter().map(|u| u.as_ref().clone()).collect();
        return Ok(Json(json!({ "data_version": snapshot.data_version(), "users": users })));
    };

    if page == 0 {
        return Err(Error::InvalidRequest("page starts at 1".into()));
    }
    let per_page = query.per_page.unwrap_or(USERS_PER_PAGE);
    if per_page == 0 || per_page > MAX_USERS_PER_PAGE {
        return Err(Error::InvalidRequest(format!(
            "per_page must be within 1..={}",
            MAX_USERS_PER_PAGE
        )));
    }
    let users: Vec<_> = all
        .iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(|u| u.as_ref().clone())
        .collect();
    Ok(Json(json!({
        "data_version": snapshot.data_version(),
        "page": page,
        "per_page": per_page,
        "total": all.len(),
        "users": users,
    })))
}

#[derive(Debug, Deserialize)]
struct NewUserRequest {
    name: String,
}

async fn new_user(
    State(state): State<ServerState>,
    Json(req): Json<NewUserRequest>,
) -> Result<impl IntoResponse> {
    let user = state.admin.new_user(&req.name)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn list_apps(
    State(state): State<ServerState>,
    Path(user_key): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.snapshots.load();
    if snapshot.user(&user_key).is_none() {
        return Err(Error::NotFound(format!("user {}", user_key)));
    }
    let apps: Vec<_> = snapshot
        .apps_of_user(&user_key)
        .iter()
        .map(|a| a.as_ref().clone())
        .collect();
    Ok(Json(json!({ "data_version": snapshot.data_version(), "apps": apps })))
}

#[derive(Debug, Deserialize)]
struct NewAppRequest {
    user_key: String,
    name: String,
}

async fn new_app(
    State(state): State<ServerState>,
    Json(req): Json<NewAppRequest>,
) -> Result<impl IntoResponse> {
    let app = state.admin.new_app(&req.user_key, &req.name)?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn list_configs(
    State(state): State<ServerState>,
    Path(app_key): Path<String>,
) -> Result<impl IntoResponse> {
    let snapshot = state.snapshots.load();
    if snapshot.app(&app_key).is_none() {
        return Err(Error::NotFound(format!("app {}", app_key)));
    }
    let configs: Vec<_> = snapshot
        .raw_configs_of_app(&app_key)
        .iter()
        .map(|c| c.as_ref().clone())
        .collect();
    Ok(Json(json!({ "data_version": snapshot.data_version(), "configs": configs })))
}

#[derive(Debug, Deserialize)]
struct NewConfigRequest {
    app_key: String,
    k: String,
    v: String,
    v_type: ValueType,
}

async fn new_config(
    State(state): State<ServerState>,
    Json(req): Json<NewConfigRequest>,
) -> Result<impl IntoResponse> {
    let entry = state
        .admin
        .new_config(&req.app_key, &req.k, &req.v, req.v_type)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Deserialize)]
struct UpdateConfigRequest {
    v: String,
    v_type: Option<ValueType>,
}

async fn update_config(
    State(state): State<ServerState>,
    Path(key): Path<String>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<impl IntoResponse> {
    let entry = state.admin.update_config(&key, &req.v, req.v_type)?;
    Ok(Json(entry))
}

async fn delete_config(
    State(state): State<ServerState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse> {
    state.admin.delete_config(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_nodes(State(state): State<ServerState>) -> impl IntoResponse {
    let snapshot = state.snapshots.load();
    Json(json!({ "data_version": snapshot.data_version(), "nodes": snapshot.nodes() }))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "node_type": state.coordinator.node_type(),
        "sync_state": format!("{:?}", state.coordinator.state()).to_lowercase(),
        "data_version": state.snapshots.current_version(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============================================================================
// Node API
// ============================================================================

async fn node_request(
    State(state): State<ServerState>,
    Path(req_type): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let kind: PeerRequestKind = req_type.parse()?;
    let response = state.coordinator.handle_peer_request(kind, &body)?;
    Ok(Json(response))
}
