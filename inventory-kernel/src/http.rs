/**
 * REST API - read access to the mirrored inventory
 *
 * ROLE:
 * Exposes every query of the inventory over JSON under `/v1`, plus the
 * service status and an on-demand refresh of one deployment.
 *
 * HOW IT WORKS:
 * - one `Inventory` per request, scoped to the `{deployment}` path segment
 * - a deployment must be configured, otherwise 404 with a message
 * - single-resource lookups answer 404 when the record does not exist
 * - the update route only triggers a background pass and returns at once
 *
 * SECURITY:
 * When an API key is configured, every route except `/v1/status` requires
 * it in the `x-api-key` header.
 */

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::InventoryConfig;
use crate::health::HealthTracker;
use crate::query::{Inventory, QueryError};
use crate::store::Store;

/// Starts a background update of one deployment.
pub type Updater = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<InventoryConfig>,
    pub store: Store,
    pub health: HealthTracker,
    pub updater: Updater,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "message": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn build_router(app_state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(status))
        .route("/deployments", get(deployments))
        .route("/deployment/{deployment}", get(deployment_summary))
        .route("/deployment/{deployment}/snapshots", get(snapshots))
        .route("/deployment/{deployment}/update", post(update_deployment))
        .route("/deployment/{deployment}/projects", get(projects))
        .route("/deployment/{deployment}/images", get(images))
        .route("/deployment/{deployment}/flavors", get(flavors))
        .route("/deployment/{deployment}/aggregates", get(aggregates))
        .route("/deployment/{deployment}/hypervisors", get(hypervisors))
        .route("/deployment/{deployment}/hypervisors/empty", get(empty_hypervisors))
        .route("/deployment/{deployment}/instances", get(instances))
        .route("/deployment/{deployment}/instances/clusters", get(clusters))
        .route("/deployment/{deployment}/instances/cluster/{cluster}", get(cluster))
        .route("/deployment/{deployment}/instances/filter/{name}", get(filter_instances))
        .route("/deployment/{deployment}/project/{project}", get(project))
        .route("/deployment/{deployment}/project/{project}/instances", get(project_instances))
        .route("/deployment/{deployment}/image/{name}", get(image))
        .route("/deployment/{deployment}/flavor/{name}", get(flavor))
        .route("/deployment/{deployment}/aggregate/{name}", get(aggregate))
        .route("/deployment/{deployment}/instance/{name}", get(instance))
        .route("/deployment/{deployment}/hypervisor/{hostname}", get(hypervisor));

    Router::new()
        .nest("/v1", api)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.cfg.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == "/v1/status" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

async fn not_found() -> ApiError {
    ApiError::NotFound("Path not found.".into())
}

/// Inventory of a configured deployment, 404 otherwise.
fn inventory(app: &AppState, deployment: &str) -> Result<Inventory, ApiError> {
    if !app.cfg.is_registered(deployment) {
        return Err(ApiError::NotFound(format!("Deployment {deployment} not found")));
    }
    Ok(Inventory::new(&app.store, deployment))
}

fn listing<T: Serialize>(deployment: &str, key: &str, items: T) -> ApiResult {
    let mut body = Map::new();
    body.insert("deployment".into(), Value::String(deployment.to_string()));
    body.insert(key.to_string(), to_value(items)?);
    Ok(Json(Value::Object(body)))
}

fn lookup<T: Serialize>(deployment: &str, label: &str, result: Result<T, QueryError>) -> ApiResult {
    match result {
        Ok(item) => listing(deployment, label, item),
        Err(QueryError::NotFound(what)) => {
            debug!(deployment, what = %what, "not found");
            let (kind, name) = label.split_once(':').unwrap_or((label, ""));
            Err(ApiError::NotFound(format!("{} {name} not found", capitalize(kind))))
        }
        Err(e) => {
            error!(deployment, error = %e, "lookup failed");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}

fn to_value<T: Serialize>(item: T) -> Result<Value, ApiError> {
    serde_json::to_value(item).map_err(|e| ApiError::Internal(e.to_string()))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// GET /v1/status
async fn status(State(app): State<AppState>) -> ApiResult {
    Ok(Json(to_value(app.health.get_health(&app.store))?))
}

// GET /v1/deployments
async fn deployments(State(app): State<AppState>) -> ApiResult {
    let names = app
        .store
        .namespaces()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "deployments": names })))
}

async fn deployment_summary(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    Ok(Json(to_value(inv.summary())?))
}

async fn snapshots(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "usage_snapshots", inv.snapshots())
}

async fn update_deployment(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    inventory(&app, &deployment)?;
    info!(deployment = %deployment, "on-demand update requested");
    (app.updater)(deployment.clone());
    Ok(Json(json!({ "message": format!("Triggered update for {deployment} deployment") })))
}

async fn projects(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "projects", inv.projects())
}

async fn images(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "images", inv.images())
}

async fn flavors(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "flavors", inv.flavors())
}

async fn aggregates(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "aggregates", inv.aggregates())
}

async fn hypervisors(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "hypervisors", inv.hypervisors())
}

async fn empty_hypervisors(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "hypervisors", inv.empty_hypervisors())
}

async fn instances(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "instances", inv.instances(None))
}

async fn filter_instances(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "instances", inv.instances(Some(&name)))
}

async fn clusters(State(app): State<AppState>, Path(deployment): Path<String>) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, "clusters", inv.cluster_counts())
}

async fn cluster(
    State(app): State<AppState>,
    Path((deployment, cluster)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    listing(&deployment, &format!("cluster:{cluster}"), inv.cluster_members(&cluster))
}

async fn project(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("project:{name}"), inv.project(&name))
}

async fn project_instances(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    if !inv.project_exists(&name) {
        return Err(ApiError::NotFound(format!("Project {name} not found")));
    }
    listing(&deployment, &format!("{name}:instances"), inv.instances_by_project(&name))
}

async fn image(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("image:{name}"), inv.image(&name))
}

async fn flavor(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("flavor:{name}"), inv.flavor(&name))
}

async fn aggregate(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("aggregate:{name}"), inv.aggregate(&name))
}

async fn instance(
    State(app): State<AppState>,
    Path((deployment, name)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("instance:{name}"), inv.instance(&name))
}

async fn hypervisor(
    State(app): State<AppState>,
    Path((deployment, hostname)): Path<(String, String)>,
) -> ApiResult {
    let inv = inventory(&app, &deployment)?;
    lookup(&deployment, &format!("hypervisor:{hostname}"), inv.hypervisor(&hostname))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("image"), "Image");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_lookup_not_found_message() {
        let result: Result<Value, QueryError> = Err(QueryError::NotFound("flavor m1 not found".into()));
        match lookup("lab", "flavor:m1", result) {
            Err(ApiError::NotFound(message)) => assert_eq!(message, "Flavor m1 not found"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
