use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use axum_server::tls_rustls::RustlsConfig;
use rdrs_server_core::batch::parse_batch_request;
use rdrs_server_core::config::{RestConfig, TlsConfig};
use rdrs_server_core::error::{FeatureStoreError, RdrsError};
use rdrs_server_core::handler::{Handler, Handlers, handle};
use rdrs_server_core::model::{
    BatchFeatureStoreRequest, BatchOpRequest, FeatureStoreRequest, PkReadBody,
};
use rustls::RootCertStore;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use serde::Serialize;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;

pub const API_VERSION: &str = "0.1.0";
pub const API_KEY_HEADER: &str = "X-API-KEY";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Set when clients must present a certificate signed by this CA.
    pub client_ca_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5406,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            client_ca_path: None,
        }
    }
}

impl ServerConfig {
    pub fn new(rest: &RestConfig, tls: &TlsConfig) -> Self {
        let non_empty = |path: &str| (!path.is_empty()).then(|| path.to_string());
        Self {
            host: rest.server_ip.clone(),
            port: rest.server_port,
            tls_enabled: tls.enable_tls,
            tls_cert_path: non_empty(&tls.certificate_file),
            tls_key_path: non_empty(&tls.private_key_file),
            client_ca_path: if tls.require_and_verify_client_cert {
                non_empty(&tls.root_ca_cert_file)
            } else {
                None
            },
        }
    }
}

enum ErrorBody {
    Message(String),
    FeatureStore(FeatureStoreError),
}

pub struct AppError {
    status: StatusCode,
    body: ErrorBody,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody::Message(message.into()),
        }
    }
}

impl From<RdrsError> for AppError {
    fn from(err: RdrsError) -> Self {
        let status = status_code(err.status());
        match err {
            RdrsError::Message { message, .. } => Self::new(status, message),
            RdrsError::FeatureStore(fs_error) => Self {
                status,
                body: ErrorBody::FeatureStore(fs_error),
            },
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self.body {
            ErrorBody::Message(message) => (self.status, Json(message)).into_response(),
            ErrorBody::FeatureStore(err) => (self.status, Json(err)).into_response(),
        }
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

async fn run<H>(
    handler: Arc<H>,
    headers: &HeaderMap,
    request: H::Request,
) -> Result<(StatusCode, Json<H::Response>), AppError>
where
    H: Handler,
    H::Response: Serialize,
{
    let (status, response) = handle(handler, api_key(headers), request).await?;
    Ok((status_code(status), Json(response)))
}

/// All API routes below `/{API_VERSION}`, plus `/metrics` when enabled.
pub fn build_router(handlers: Handlers, metrics_enabled: bool) -> Router {
    let api = Router::new()
        .route("/ping", get(|| async { StatusCode::OK }))
        .route("/health", get(handle_health))
        .route("/stat", get(handle_stat))
        .route("/{db}/{table}/pk-read", post(handle_pk_read))
        .route("/batch", post(handle_batch))
        .route("/feature_store", post(handle_feature_store))
        .route("/batch_feature_store", post(handle_batch_feature_store))
        .with_state(handlers);
    let mut app = Router::new()
        .nest(&format!("/{}", API_VERSION), api)
        .layer(tower_http::trace::TraceLayer::new_for_http());
    if metrics_enabled {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        app = app
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer)
    }
    app
}

async fn rustls_config(server_config: &ServerConfig) -> Result<RustlsConfig> {
    let cert_path = server_config
        .tls_cert_path
        .as_deref()
        .ok_or(anyhow!("TLS is enabled but cert path is not provided"))?;
    let key_path = server_config
        .tls_key_path
        .as_deref()
        .ok_or(anyhow!("TLS is enabled but key path is not provided"))?;
    let Some(ca_path) = server_config.client_ca_path.as_deref() else {
        return RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| anyhow!("Failed to load TLS config: {}", e));
    };

    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("Failed to read certificate {}", cert_path))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .with_context(|| format!("Failed to read private key {}", key_path))?;
    let mut roots = RootCertStore::empty();
    for ca in CertificateDer::pem_file_iter(ca_path)
        .with_context(|| format!("Failed to read root CA {}", ca_path))?
    {
        roots.add(ca?)?;
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone()).build()?;
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

pub async fn start_server(
    server_config: ServerConfig,
    handlers: Handlers,
    metrics_enabled: bool,
    shutdown_handler: axum_server::Handle,
) -> Result<()> {
    let app = build_router(handlers, metrics_enabled);

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .to_socket_addrs()?
        .next()
        .ok_or(anyhow!("Cannot resolve host"))?;

    tracing::info!(
        "REST server listening on {}:{}",
        server_config.host,
        server_config.port
    );
    if server_config.tls_enabled {
        let rustls_config = rustls_config(&server_config).await?;
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
    tracing::info!("REST server closed");
    Ok(())
}

async fn handle_health(State(handlers): State<Handlers>) -> Result<impl IntoResponse, AppError> {
    let (status, body) = handle(handlers.health, None, ()).await?;
    Ok((status_code(status), body))
}

async fn handle_stat(
    State(handlers): State<Handlers>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    run(handlers.stat, &headers, ()).await
}

async fn handle_pk_read(
    State(handlers): State<Handlers>,
    Path((db, table)): Path<(String, String)>,
    headers: HeaderMap,
    payload: Result<Json<PkReadBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    run(handlers.pk_read, &headers, body.into_params(db, table)).await
}

async fn handle_batch(
    State(handlers): State<Handlers>,
    headers: HeaderMap,
    payload: Result<Json<BatchOpRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    let operations = parse_batch_request(body)?;
    run(handlers.batch, &headers, operations).await
}

async fn handle_feature_store(
    State(handlers): State<Handlers>,
    headers: HeaderMap,
    payload: Result<Json<FeatureStoreRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    run(handlers.feature_store, &headers, body).await
}

async fn handle_batch_feature_store(
    State(handlers): State<Handlers>,
    headers: HeaderMap,
    payload: Result<Json<BatchFeatureStoreRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    run(handlers.batch_feature_store, &headers, body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use rdrs_server_core::auth::ApiKeyCache;
    use rdrs_server_core::buffer_pool::BufferPool;
    use rdrs_server_core::catalog::Catalog;
    use rdrs_server_core::config::{ApiKeyConfig, Internal};
    use rdrs_server_core::feature_store::{CachedFeatureViewStore, FEATURE_VIEW_CACHE_TTL};
    use rdrs_server_core::native::NativeDispatch;
    use rdrs_server_core::native::memory::MemoryRonDb;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const API_KEY: &str =
        "bkYjEz6OTZyevbqT.ocfnG8qdpbgAo4qDk4ZBgSuiqBPcV1IWYJb5rlqUR2BAt4UH0y1gLXDNyg9p8bM5";

    fn app(auth_enabled: bool) -> Router {
        let catalog = Arc::new(
            Catalog::from_file(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../rdrs-server-core/test_data/catalog.json"
            ))
            .unwrap(),
        );
        let db = MemoryRonDb::from_tables(catalog.tables()).unwrap();
        let dispatch = Arc::new(NativeDispatch::new(
            BufferPool::new(4096, 4).unwrap(),
            Arc::new(db),
        ));
        let auth = ApiKeyCache::new(
            catalog.clone(),
            ApiKeyConfig {
                use_hopsworks_api_keys: auth_enabled,
                ..Default::default()
            },
        );
        let views = Arc::new(CachedFeatureViewStore::new(catalog, FEATURE_VIEW_CACHE_TTL));
        let handlers = Handlers::new(dispatch, views, auth, &Internal::default());
        build_router(handlers, false)
    }

    fn post(path: &str, body: Value) -> Request<Body> {
        Request::post(format!("/{}/{}", API_VERSION, path))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(format!("/{}/{}", API_VERSION, path))
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn pk_body(id: i64) -> Value {
        json!({
            "filters": [{"column": "id0", "value": id}],
            "readColumns": [{"column": "col0"}],
            "operationId": format!("op_{}", id)
        })
    }

    #[tokio::test]
    async fn ping_and_health() {
        let (status, _) = send(app(false), get("ping")).await;
        assert_eq!(status, StatusCode::OK);

        let response = app(false).oneshot(get("health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"0");
    }

    #[tokio::test]
    async fn stat_reports_counters() {
        let (status, body) = send(app(false), get("stat")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["memoryStats"]["buffersCount"], 4);
        assert!(body["ronDBStats"]["ndbObjectsFreeCount"].is_u64());
    }

    #[tokio::test]
    async fn pk_read_hit_and_miss() {
        let (status, body) = send(app(false), post("db001/table_1/pk-read", pk_body(7))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"operationId": "op_7", "data": {"col0": "hello"}}));

        let (status, body) = send(app(false), post("db001/table_1/pk-read", pk_body(999))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["operationId"], "op_999");
    }

    #[tokio::test]
    async fn pk_read_rejects_bad_input() {
        let request = Request::post(format!("/{}/db001/table_1/pk-read", API_VERSION))
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(app(false), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            app(false),
            post("db001/table_1/pk-read", json!({"filters": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.is_string());
    }

    #[tokio::test]
    async fn batch_keeps_order_and_per_row_codes() {
        let operations: Vec<Value> = [0, 999, 1]
            .iter()
            .map(|id| {
                json!({
                    "method": "POST",
                    "relative-url": "db001/table_1/pk-read",
                    "body": pk_body(*id)
                })
            })
            .collect();
        let (status, body) = send(app(false), post("batch", json!({"operations": operations}))).await;
        assert_eq!(status, StatusCode::OK);
        let result = body["result"].as_array().unwrap();
        let codes: Vec<_> = result.iter().map(|r| r["code"].as_u64().unwrap()).collect();
        assert_eq!(codes, vec![200, 404, 200]);
        assert_eq!(result[0]["body"]["data"]["col0"], "hello_0");
        assert_eq!(result[1]["body"]["operationId"], "op_999");
        assert_eq!(result[2]["body"]["data"]["col0"], "hello_1");
    }

    #[tokio::test]
    async fn batch_validation() {
        let (status, body) = send(app(false), post("batch", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!("operations is missing in payload"));

        let (status, _) = send(app(false), post("batch", json!({"operations": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bad_url = json!({"operations": [{
            "method": "POST", "relative-url": "db001/pk-read", "body": pk_body(1)
        }]});
        let (status, _) = send(app(false), post("batch", bad_url)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn feature_vector_is_assembled() {
        let request = json!({
            "featureStoreName": "test_fs",
            "featureViewName": "sample_view",
            "featureViewVersion": 1,
            "entries": {"id1": 1, "fg2_id1": 1},
            "passedFeatures": {"data1": "passed"}
        });
        let (status, body) = send(app(false), post("feature_store", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"], json!(["passed", 10, 0.5]));
        assert_eq!(body["status"], "COMPLETE");
        assert_eq!(
            body["metadata"],
            json!([
                {"name": "data1", "type": "string"},
                {"name": "data2", "type": "bigint"},
                {"name": "fg2_data2", "type": "double"}
            ])
        );
    }

    #[tokio::test]
    async fn complex_features_are_decoded() {
        let request = json!({
            "featureStoreName": "test_fs",
            "featureViewName": "complex_view",
            "featureViewVersion": 1,
            "entries": {"id1": 1},
            "metadataOptions": {"featureName": true, "featureType": false}
        });
        let (status, body) = send(app(false), post("feature_store", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["features"], json!([[1, 2]]));
        assert_eq!(body["metadata"], json!([{"name": "tags"}]));
    }

    #[tokio::test]
    async fn feature_store_errors_are_coded() {
        let request = json!({
            "featureStoreName": "test_fs",
            "featureViewName": "no_such_view",
            "featureViewVersion": 1,
            "entries": {"id1": 1}
        });
        let (status, body) = send(app(false), post("feature_store", request)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 1);
        assert_eq!(body["reason"], "Feature view does not exist.");
    }

    #[tokio::test]
    async fn batch_feature_store_reports_row_status() {
        let request = json!({
            "featureStoreName": "test_fs",
            "featureViewName": "sample_view",
            "featureViewVersion": 1,
            "entries": [{"id1": 1, "fg2_id1": 1}, {"id1": 2, "fg2_id1": 2}]
        });
        let (status, body) = send(app(false), post("batch_feature_store", request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!(["COMPLETE", "MISSING"]));
        assert_eq!(body["features"][0], json!(["a", 10, 0.5]));
        assert_eq!(body["features"][1][0], "b");
        assert_eq!(body["features"][1][2], Value::Null);
    }

    #[tokio::test]
    async fn api_key_is_required_when_enabled() {
        let (status, _) = send(app(true), post("db001/table_1/pk-read", pk_body(7))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let mut request = post("db001/table_1/pk-read", pk_body(7));
        request
            .headers_mut()
            .insert(API_KEY_HEADER, API_KEY.parse().unwrap());
        let (status, body) = send(app(true), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["col0"], "hello");
    }
}
