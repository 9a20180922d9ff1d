use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use coedit_core::db::{Database, LibSqlActivityRepository, LibSqlVersionStore};
use coedit_core::presence::MemoryPresenceStore;
use coedit_core::{
    ActiveUser, Coordinator, FieldMap, HubStats, PresenceCache, PresenceHub, Resource,
    ResourceId, ResourceKind, UserId,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::identity::extract_user_id;
use crate::ws::presence_socket;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub coordinator: Coordinator,
}

impl AppState {
    /// Open the database and wire storage, presence and the hub together
    pub async fn from_config(config: Arc<AppConfig>) -> coedit_core::Result<Self> {
        let db = Arc::new(Database::open(&config.database_path, config.db_readers).await?);
        let presence = PresenceCache::new(
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(LibSqlActivityRepository::new(db.clone())),
            config.presence_ttl,
        );
        let hub = Arc::new(PresenceHub::new(presence));
        let coordinator = Coordinator::new(
            Arc::new(LibSqlVersionStore::new(db)),
            hub,
            config.update_max_attempts,
        );
        Ok(Self {
            config,
            coordinator,
        })
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        self.coordinator.hub()
    }
}

pub fn app_router(state: AppState) -> Router {
    let identified_routes = Router::new()
        .route("/resources", post(create_resource))
        .route(
            "/resources/{id}",
            get(open_resource).patch(update_resource),
        )
        .route("/resources/{id}/active-users", get(active_users))
        .route("/resources/{id}/release", post(release_resource))
        .route("/resources/{id}/presence", get(presence_socket))
        .route("/presence/resources", get(active_resources))
        .route_layer(middleware::from_fn(require_user));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", identified_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    presence: HubStats,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        presence: state.hub().stats(),
    })
}

async fn require_user(mut request: Request, next: Next) -> Result<Response, AppError> {
    let user = extract_user_id(request.headers())?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub fn parse_resource_id(raw: &str) -> Result<ResourceId, AppError> {
    raw.parse()
        .map_err(|_| AppError::bad_request(format!("`{raw}` is not a valid resource id")))
}

#[derive(Debug, Deserialize)]
struct CreateResourceRequest {
    kind: ResourceKind,
    #[serde(default)]
    fields: FieldMap,
}

async fn create_resource(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Json(request): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), AppError> {
    let resource = state
        .coordinator
        .create_resource(request.kind, request.fields)
        .await?;
    tracing::info!(
        endpoint = "create_resource",
        user = %user,
        resource = %resource.id,
        "Created resource"
    );
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn open_resource(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, AppError> {
    let id = parse_resource_id(&id)?;
    let resource = state.coordinator.open_resource(&id, &user).await?;
    Ok(Json(resource))
}

#[derive(Debug, Deserialize)]
struct UpdateResourceRequest {
    version: u64,
    fields: FieldMap,
}

#[derive(Debug, Serialize)]
struct UpdateResourceResponse {
    resource: Resource,
    merged: bool,
}

async fn update_resource(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
    Json(request): Json<UpdateResourceRequest>,
) -> Result<Json<UpdateResourceResponse>, AppError> {
    let id = parse_resource_id(&id)?;
    let outcome = state
        .coordinator
        .update_resource(&id, &user, request.version, request.fields)
        .await?;
    Ok(Json(UpdateResourceResponse {
        resource: outcome.resource,
        merged: outcome.merged,
    }))
}

#[derive(Debug, Serialize)]
struct ActiveUsersResponse {
    resource_id: ResourceId,
    active_users: Vec<ActiveUser>,
}

async fn active_users(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<Json<ActiveUsersResponse>, AppError> {
    let id = parse_resource_id(&id)?;
    let active_users = state.coordinator.active_users(&id, &user).await?;
    Ok(Json(ActiveUsersResponse {
        resource_id: id,
        active_users,
    }))
}

async fn release_resource(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_resource_id(&id)?;
    state.coordinator.release_resource(&id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct ActiveResourcesResponse {
    user_id: UserId,
    resources: Vec<ResourceId>,
}

async fn active_resources(
    State(state): State<AppState>,
    Extension(user): Extension<UserId>,
) -> Result<Json<ActiveResourcesResponse>, AppError> {
    let resources = state.coordinator.active_resources(&user).await?;
    Ok(Json(ActiveResourcesResponse {
        user_id: user,
        resources,
    }))
}
