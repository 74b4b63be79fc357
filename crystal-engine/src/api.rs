use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use crystal_core::config::CoreConfig;
use crystal_protocol::{ObjectTypeEntry, SloEntry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::EngineError;
use crate::service::PolicyService;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineServiceConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub metrics_bind: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0:9000".to_string()
}

impl Default for EngineServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_bind: None,
        }
    }
}

impl EngineServiceConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            bind_address: config.http_bind.clone(),
            metrics_bind: config.metrics_bind.clone(),
        }
    }
}

/// Builder for the HTTP boundary of the policy engine.
pub struct EngineApiBuilder {
    service: PolicyService,
}

impl EngineApiBuilder {
    pub fn new(service: PolicyService) -> Self {
        Self { service }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/policies", post(deploy_rules))
            .route("/policies/static", get(list_static))
            .route(
                "/policies/static/*policy",
                get(get_static).put(update_static).delete(delete_static),
            )
            .route("/policies/dynamic", get(list_dynamic))
            .route("/policies/dynamic/:id", get(get_dynamic).delete(delete_dynamic))
            .route("/policies/dynamic/:id/respawn", post(respawn_dynamic))
            .route("/metrics", post(ingest_metrics))
            .route("/object_types", get(list_object_types).post(create_object_type))
            .route(
                "/object_types/:name",
                get(get_object_type)
                    .put(replace_object_type)
                    .delete(delete_object_type),
            )
            .route("/object_types/:name/:item", delete(remove_object_type_item))
            .route("/slos", get(list_slos).post(put_slo))
            .route("/slos/*slo", get(get_slo).delete(delete_slo))
            .layer(TraceLayer::new_for_http())
            .with_state(self.service.clone())
    }

    /// Binds and serves in the background. Sending on (or dropping) the
    /// returned channel stops the server and every live monitor.
    pub async fn serve(self, config: EngineServiceConfig) -> anyhow::Result<oneshot::Sender<()>> {
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
        let address = listener.local_addr()?;
        let (tx, rx) = oneshot::channel();
        let service = self.service;

        tokio::spawn(async move {
            info!(%address, "starting crystal policy engine");
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = rx.await;
                })
                .await
                .ok();
            service.shutdown().await;
        });

        Ok(tx)
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    code: String,
    message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::ProjectNotFound(_)
        | EngineError::ProjectNotCrystalEnabled(_)
        | EngineError::FilterNotFound(_)
        | EngineError::PolicyNotFound(_)
        | EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::MalformedRule(_) | EngineError::MalformedSample(_) | EngineError::InvalidRequest(_) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::AlreadyExists(_) => StatusCode::CONFLICT,
        EngineError::StoreUnavailable(_) | EngineError::RemoteActionFailed(_) | EngineError::SpawnFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn map_error(err: EngineError) -> ApiError {
    (
        status_for(&err),
        Json(ErrorResponse {
            code: err.code().into(),
            message: err.to_string(),
        }),
    )
}

fn parse_static_key(raw: &str) -> Result<(String, u64), ApiError> {
    let raw = raw.trim_start_matches('/');
    raw.rsplit_once(':')
        .and_then(|(target, id)| Some((target.to_string(), id.parse::<u64>().ok()?)))
        .filter(|(target, _)| !target.is_empty())
        .ok_or_else(|| {
            map_error(EngineError::InvalidRequest(format!(
                "`{}` is not a <target>:<policy id> pair",
                raw
            )))
        })
}

/// Splits `<filter>/<slo name>/<target>`; the target may itself contain `/`.
fn parse_slo_key(raw: &str) -> Result<(String, String, String), ApiError> {
    let mut parts = raw.trim_start_matches('/').splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(filter), Some(name), Some(target))
            if !filter.is_empty() && !name.is_empty() && !target.is_empty() =>
        {
            Ok((filter.to_string(), name.to_string(), target.to_string()))
        }
        _ => Err(map_error(EngineError::InvalidRequest(format!(
            "`{}` is not a <filter>/<slo>/<target> path",
            raw
        )))),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn deploy_rules(State(service): State<PolicyService>, body: String) -> impl IntoResponse {
    let report = service.deploy(&body).await;
    let status = if report.lines.is_empty() {
        StatusCode::BAD_REQUEST
    } else if report.is_success() {
        StatusCode::CREATED
    } else if let Some(err) = report.first_error() {
        status_for(err)
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(report))
}

#[derive(Debug, Deserialize)]
struct StaticQuery {
    #[serde(default)]
    target: Option<String>,
}

async fn list_static(
    State(service): State<PolicyService>,
    Query(query): Query<StaticQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let views = service
        .list_static(query.target.as_deref())
        .await
        .map_err(map_error)?;
    Ok(Json(views))
}

async fn get_static(
    State(service): State<PolicyService>,
    Path(policy): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (target, id) = parse_static_key(&policy)?;
    let view = service.get_static(&target, id).await.map_err(map_error)?;
    Ok(Json(view))
}

async fn update_static(
    State(service): State<PolicyService>,
    Path(policy): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let (target, id) = parse_static_key(&policy)?;
    let view = service
        .update_static(&target, id, patch)
        .await
        .map_err(map_error)?;
    Ok(Json(view))
}

async fn delete_static(
    State(service): State<PolicyService>,
    Path(policy): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (target, id) = parse_static_key(&policy)?;
    service.delete_static(&target, id).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_dynamic(State(service): State<PolicyService>) -> Result<impl IntoResponse, ApiError> {
    let views = service.list_dynamic().await.map_err(map_error)?;
    Ok(Json(views))
}

async fn get_dynamic(
    State(service): State<PolicyService>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let view = service.get_dynamic(id).await.map_err(map_error)?;
    Ok(Json(view))
}

async fn delete_dynamic(
    State(service): State<PolicyService>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    service.delete_dynamic(id).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn respawn_dynamic(
    State(service): State<PolicyService>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    service.respawn(id).await.map_err(map_error)?;
    Ok(StatusCode::ACCEPTED)
}

async fn ingest_metrics(State(service): State<PolicyService>, body: String) -> impl IntoResponse {
    let report = service.ingest_metrics(&body);
    let status = if report.samples == 0 && !report.rejected.is_empty() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::ACCEPTED
    };
    (status, Json(report))
}

async fn list_object_types(State(service): State<PolicyService>) -> Result<impl IntoResponse, ApiError> {
    let entries = service.list_object_types().await.map_err(map_error)?;
    Ok(Json(entries))
}

async fn create_object_type(
    State(service): State<PolicyService>,
    Json(entry): Json<ObjectTypeEntry>,
) -> Result<StatusCode, ApiError> {
    service.create_object_type(&entry).await.map_err(map_error)?;
    Ok(StatusCode::CREATED)
}

async fn get_object_type(
    State(service): State<PolicyService>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let entry = service.get_object_type(&name).await.map_err(map_error)?;
    Ok(Json(entry))
}

async fn replace_object_type(
    State(service): State<PolicyService>,
    Path(name): Path<String>,
    Json(types_list): Json<Vec<String>>,
) -> Result<StatusCode, ApiError> {
    service
        .replace_object_type(&name, types_list)
        .await
        .map_err(map_error)?;
    Ok(StatusCode::CREATED)
}

async fn delete_object_type(
    State(service): State<PolicyService>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    service.delete_object_type(&name).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_object_type_item(
    State(service): State<PolicyService>,
    Path((name, item)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    service
        .remove_object_type_item(&name, &item)
        .await
        .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_slos(State(service): State<PolicyService>) -> Result<impl IntoResponse, ApiError> {
    let slos = service.list_slos().await.map_err(map_error)?;
    Ok(Json(slos))
}

async fn put_slo(
    State(service): State<PolicyService>,
    Json(slo): Json<SloEntry>,
) -> Result<StatusCode, ApiError> {
    service.put_slo(&slo).await.map_err(map_error)?;
    Ok(StatusCode::CREATED)
}

async fn get_slo(
    State(service): State<PolicyService>,
    Path(slo): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (filter, name, target) = parse_slo_key(&slo)?;
    let slo = service.get_slo(&filter, &name, &target).await.map_err(map_error)?;
    Ok(Json(slo))
}

async fn delete_slo(
    State(service): State<PolicyService>,
    Path(slo): Path<String>,
) -> Result<StatusCode, ApiError> {
    let (filter, name, target) = parse_slo_key(&slo)?;
    service.delete_slo(&filter, &name, &target).await.map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_keys_split_at_last_colon() {
        assert_eq!(parse_static_key("t1/photos:12").unwrap(), ("t1/photos".to_string(), 12));
        assert_eq!(parse_static_key("/global:3").unwrap(), ("global".to_string(), 3));
        assert!(parse_static_key("t1").is_err());
        assert!(parse_static_key(":4").is_err());
        assert!(parse_static_key("t1:x").is_err());
    }

    #[test]
    fn slo_keys_keep_container_targets() {
        assert_eq!(
            parse_slo_key("bandwidth/put_bw/t1/photos").unwrap(),
            ("bandwidth".to_string(), "put_bw".to_string(), "t1/photos".to_string())
        );
        assert_eq!(
            parse_slo_key("/bandwidth/put_bw/t1").unwrap().2,
            "t1".to_string()
        );
        assert!(parse_slo_key("bandwidth/put_bw").is_err());
        assert!(parse_slo_key("bandwidth//t1").is_err());
    }

    #[test]
    fn errors_map_to_boundary_statuses() {
        assert_eq!(
            status_for(&EngineError::ProjectNotCrystalEnabled("t3".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(status_for(&EngineError::MalformedRule("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&EngineError::AlreadyExists("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&EngineError::spawn_failed(1, "boom")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
