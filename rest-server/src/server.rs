use anyhow::{Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use axum_server::tls_rustls::RustlsConfig;
use feature_store_core::dataset::{Dataset, DatasetPayload, Record};
use feature_store_core::error::{FeatureStoreError, find_store_error};
use feature_store_core::feature_store::{FeatureStore, StatsLookup};
use feature_store_core::model::{
    DEFAULT_ENTITY_KEY, DEFAULT_OWNER, EntityId, Feature, FeatureDetails, FeatureSummary,
    FeatureVersion,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;

const ENTITY_NOT_FOUND: &str = "Entity not found in latest version";

#[derive(Clone)]
pub struct FeatureStoreServer {
    feature_store: Arc<FeatureStore>,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn default_entity_key() -> String {
    DEFAULT_ENTITY_KEY.to_string()
}

fn default_owner() -> String {
    DEFAULT_OWNER.to_string()
}

#[derive(Debug, Deserialize)]
pub struct OnlineFeatureRequest {
    pub feature_name: String,
    pub entity_id: EntityId,
    #[serde(default = "default_entity_key")]
    pub entity_key: String,
}

#[derive(Debug, Serialize)]
pub struct OnlineFeatureResponse {
    pub feature_name: String,
    pub entity_id: EntityId,
    pub data: Option<Record>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterFeatureRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_owner")]
    pub owner: String,
}

/// Column payload of the new version plus optional lineage.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    #[serde(flatten)]
    pub dataset: DatasetPayload,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    pub version: Option<String>,
}

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

fn status_for(error: &FeatureStoreError) -> StatusCode {
    match error {
        FeatureStoreError::FeatureNotFound { .. } | FeatureStoreError::VersionNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        FeatureStoreError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        FeatureStoreError::ConflictOrIntegrity { .. } => StatusCode::CONFLICT,
        FeatureStoreError::StorageFault { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn detail(err: &anyhow::Error) -> String {
    match find_store_error(err) {
        Some(store_error) => store_error.to_string(),
        None => format!("{:#}", err),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let status = find_store_error(&err)
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {:#}", err);
        }
        Self::new(status, detail(&err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            detail: self.message,
        });
        (status, body).into_response()
    }
}

/// All routes, without tracing or metrics layers.
pub fn router(feature_store: Arc<FeatureStore>) -> Router {
    let server = FeatureStoreServer { feature_store };
    Router::new()
        .route("/health", get(handle_health))
        .route("/features/online", post(handle_online_request))
        .route("/features", get(handle_list).post(handle_register))
        .route(
            "/features/{name}",
            get(handle_get_feature).delete(handle_delete_feature),
        )
        .route("/features/{name}/versions", post(handle_ingest))
        .route("/features/{name}/data", get(handle_get_data))
        .route(
            "/features/{name}/versions/{version}/stats",
            get(handle_get_stats),
        )
        .with_state(server)
}

pub async fn start_server(
    server_config: ServerConfig,
    feature_store: FeatureStore,
    metrics_enabled: bool,
    shutdown_handler: axum_server::Handle,
) -> Result<()> {
    let mut app = router(Arc::new(feature_store));
    let trace = tower_http::trace::TraceLayer::new_for_http();
    app = app.layer(trace);
    if metrics_enabled {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        app = app
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer)
    }

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .to_socket_addrs()?
        .next()
        .ok_or(anyhow!("Cannot resolve host"))?;

    tracing::info!(
        "Server listening on {}:{}",
        server_config.host,
        server_config.port
    );
    if server_config.tls_enabled {
        let cert_path = server_config
            .tls_cert_path
            .ok_or(anyhow!("TLS is enabled but cert path is not provided"))?;
        let key_path = server_config
            .tls_key_path
            .ok_or(anyhow!("TLS is enabled but key path is not provided"))?;
        let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| anyhow!("Failed to load TLS config: {}", e))?;
        axum_server::bind_rustls(addr, rustls_config)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Any manager failure is a 400 here; a miss is a 200 with `error` set.
async fn handle_online_request(
    State(server): State<FeatureStoreServer>,
    payload: Result<Json<OnlineFeatureRequest>, JsonRejection>,
) -> Result<Json<OnlineFeatureResponse>, AppError> {
    let Json(request) = payload?;
    let data = server
        .feature_store
        .get_online_value(
            &request.feature_name,
            &request.entity_id,
            &request.entity_key,
        )
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, detail(&err)))?;
    let error = data.is_none().then(|| ENTITY_NOT_FOUND.to_string());
    Ok(Json(OnlineFeatureResponse {
        feature_name: request.feature_name,
        entity_id: request.entity_id,
        data,
        error,
    }))
}

async fn handle_list(
    State(server): State<FeatureStoreServer>,
) -> Result<Json<Vec<FeatureSummary>>, AppError> {
    Ok(Json(server.feature_store.list_features().await?))
}

async fn handle_register(
    State(server): State<FeatureStoreServer>,
    payload: Result<Json<RegisterFeatureRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Feature>), AppError> {
    let Json(request) = payload?;
    let registration = server
        .feature_store
        .register_feature(&request.name, &request.description, &request.owner)
        .await?;
    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration.feature)))
}

async fn handle_get_feature(
    State(server): State<FeatureStoreServer>,
    Path(name): Path<String>,
) -> Result<Json<FeatureDetails>, AppError> {
    Ok(Json(server.feature_store.get_feature(&name).await?))
}

async fn handle_delete_feature(
    State(server): State<FeatureStoreServer>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    server.feature_store.delete_feature(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_ingest(
    State(server): State<FeatureStoreServer>,
    Path(name): Path<String>,
    payload: Result<Json<IngestRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<FeatureVersion>), AppError> {
    let Json(request) = payload?;
    let dataset = Dataset::try_from(request.dataset)?;
    let version = server
        .feature_store
        .ingest_feature_data(&name, &dataset, request.commit_hash.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn handle_get_data(
    State(server): State<FeatureStoreServer>,
    Path(name): Path<String>,
    Query(query): Query<DataQuery>,
) -> Result<Json<DatasetPayload>, AppError> {
    let dataset = server
        .feature_store
        .get_feature_data(&name, query.version.as_deref())
        .await?;
    Ok(Json(DatasetPayload::from(&dataset)))
}

async fn handle_get_stats(
    State(server): State<FeatureStoreServer>,
    Path((name, version)): Path<(String, String)>,
) -> Result<Json<StatsLookup>, AppError> {
    Ok(Json(
        server.feature_store.get_feature_stats(&name, &version).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use feature_store_core::artifact_store::get_artifact_store;
    use feature_store_core::config::{ArtifactFormat, ArtifactStoreConfig, RegistryConfig};
    use feature_store_core::registry::get_registry;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_app() -> Result<(TempDir, Router)> {
        let dir = tempfile::tempdir()?;
        let registry = get_registry(
            &RegistryConfig {
                path: format!("sqlite://{}", dir.path().join("registry.db").display()),
                ..Default::default()
            },
            None,
        )
        .await?;
        let artifacts = get_artifact_store(
            &ArtifactStoreConfig {
                path: dir.path().join("features").display().to_string(),
                format: ArtifactFormat::Parquet,
            },
            None,
        )?;
        let store = FeatureStore::new(registry, artifacts);
        Ok((dir, router(Arc::new(store))))
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };
        let response = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    fn logins_payload(user_ids: Value, counts: Value) -> Value {
        json!({
            "columns": [
                {"name": "user_id", "dtype": "int64", "values": user_ids},
                {"name": "count", "dtype": "int64", "values": counts},
            ]
        })
    }

    async fn seeded_app() -> Result<(TempDir, Router)> {
        let (dir, app) = test_app().await?;
        let (status, _) = send(
            &app,
            Method::POST,
            "/features",
            Some(json!({"name": "logins", "description": "Number of logins"})),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(
            &app,
            Method::POST,
            "/features/logins/versions",
            Some(logins_payload(json!([1, 2]), json!([5, 0]))),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        Ok((dir, app))
    }

    #[tokio::test]
    async fn health_is_ok() -> Result<()> {
        let (_dir, app) = test_app().await?;
        let (status, body) = send(&app, Method::GET, "/health", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
        Ok(())
    }

    #[tokio::test]
    async fn online_lookup_hit_and_miss() -> Result<()> {
        let (_dir, app) = seeded_app().await?;
        let (status, body) = send(
            &app,
            Method::POST,
            "/features/online",
            Some(json!({"feature_name": "logins", "entity_id": 2})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "feature_name": "logins",
                "entity_id": 2,
                "data": {"user_id": 2, "count": 0},
                "error": null,
            })
        );

        let (status, body) = send(
            &app,
            Method::POST,
            "/features/online",
            Some(json!({"feature_name": "logins", "entity_id": 9999, "entity_key": "user_id"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], Value::Null);
        assert_eq!(body["error"], json!(ENTITY_NOT_FOUND));
        Ok(())
    }

    #[tokio::test]
    async fn online_lookup_faults_are_bad_requests() -> Result<()> {
        let (_dir, app) = seeded_app().await?;
        let (status, body) = send(
            &app,
            Method::POST,
            "/features/online",
            Some(json!({"feature_name": "unknown", "entity_id": 1})),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            json!("Feature 'unknown' not found. Register it first.")
        );

        let (status, body) = send(
            &app,
            Method::POST,
            "/features/online",
            Some(json!({"feature_name": "logins", "entity_id": 1, "entity_key": "account"})),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["detail"]
                .as_str()
                .is_some_and(|d| d.contains("Entity key 'account' not found"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn lookup_route_name_cannot_be_registered() -> Result<()> {
        let (_dir, app) = test_app().await?;
        let (status, body) = send(
            &app,
            Method::POST,
            "/features",
            Some(json!({"name": "online"})),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            body["detail"]
                .as_str()
                .is_some_and(|d| d.contains("'online' is not a valid feature name"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn feature_crud_routes() -> Result<()> {
        let (_dir, app) = seeded_app().await?;
        let (status, body) = send(
            &app,
            Method::POST,
            "/features",
            Some(json!({"name": "logins", "description": "updated", "owner": "data-team"})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["owner"], json!("data-team"));

        let (status, body) = send(&app, Method::GET, "/features", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], json!("logins"));
        assert_eq!(body[0]["version_count"], json!(1));

        let (status, body) = send(&app, Method::GET, "/features/logins", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["description"], json!("updated"));
        assert_eq!(body["versions"][0]["version"], json!("v1"));
        assert_eq!(body["versions"][0]["drift_status"], json!("ok"));

        let (status, _) = send(&app, Method::DELETE, "/features/logins", None).await?;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, Method::GET, "/features/logins", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::DELETE, "/features/logins", None).await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_data_and_stats_routes() -> Result<()> {
        let (_dir, app) = seeded_app().await?;
        let (status, body) = send(
            &app,
            Method::POST,
            "/features/logins/versions",
            Some(json!({
                "columns": [
                    {"name": "user_id", "dtype": "int64", "values": [1, 2, 3]},
                    {"name": "count", "dtype": "int64", "values": [6, 1, 3]},
                ],
                "commit_hash": "abc123",
            })),
        )
        .await?;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["version"], json!("v2"));
        assert_eq!(body["commit_hash"], json!("abc123"));

        let (status, body) = send(&app, Method::GET, "/features/logins/data", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["columns"][1]["values"], json!([6, 1, 3]));

        let (status, body) =
            send(&app, Method::GET, "/features/logins/data?version=v1", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["columns"][0]["values"], json!([1, 2]));

        let (status, body) = send(
            &app,
            Method::GET,
            "/features/logins/versions/v1/stats",
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["row_count"], json!(2));
        assert_eq!(body["columns"]["count"]["mean"], json!(2.5));

        let (status, _) = send(
            &app,
            Method::GET,
            "/features/logins/versions/v7/stats",
            None,
        )
        .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn ingest_rejects_bad_payloads() -> Result<()> {
        let (_dir, app) = seeded_app().await?;
        let (status, _) = send(
            &app,
            Method::POST,
            "/features/logins/versions",
            Some(logins_payload(json!([1, 2]), json!([5]))),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Method::POST,
            "/features/logins/versions",
            Some(logins_payload(json!(["a"]), json!([5]))),
        )
        .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            Method::POST,
            "/features/missing/versions",
            Some(logins_payload(json!([1]), json!([5]))),
        )
        .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Method::POST,
            "/features/logins/versions",
            Some(json!({"rows": []})),
        )
        .await?;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        Ok(())
    }
}
