use crate::proto::rdrs::ron_db_rest_server::{RonDbRest, RonDbRestServer};
use crate::proto::rdrs::{
    BatchRequestProto, BatchResponseProto, ColumnValueProto, HealthRequestProto,
    HealthResponseProto, MemoryStatsProto, PingRequestProto, PingResponseProto,
    PkReadRequestProto, PkReadResponseProto, RonDbStatsProto, StatRequestProto,
    StatResponseProto,
};
use anyhow::{Result, anyhow};
use rdrs_server_core::config::{GrpcConfig, TlsConfig};
use rdrs_server_core::error::RdrsError;
use rdrs_server_core::handler::{Handlers, handle};
use rdrs_server_core::model::{
    Filter, PkReadParams, PkReadResponse, PkReadResult, RawJson, ReadColumn, StatResponse,
};
use serde_json::value::RawValue;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::fs;
use tonic::Status as TonicStatus;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Code, Request, Response};

pub const API_KEY_METADATA: &str = "authorization";

#[derive(Clone)]
pub struct RdrsGrpcService {
    handlers: Handlers,
}

impl RdrsGrpcService {
    pub fn new(handlers: Handlers) -> Self {
        Self { handlers }
    }
}

fn api_key<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(API_KEY_METADATA)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

pub fn grpc_code(status: u16) -> Code {
    match status {
        200 => Code::Ok,
        400 | 415 => Code::InvalidArgument,
        401 => Code::PermissionDenied,
        404 => Code::NotFound,
        503 => Code::Unavailable,
        _ => Code::Internal,
    }
}

fn to_status(err: RdrsError) -> TonicStatus {
    TonicStatus::new(grpc_code(err.status()), err.message().to_string())
}

fn params_from_proto(proto: PkReadRequestProto) -> Result<PkReadParams, TonicStatus> {
    let filters = proto
        .filters
        .into_iter()
        .map(|filter| {
            let value = RawValue::from_string(filter.value).map_err(|err| {
                TonicStatus::invalid_argument(format!(
                    "Invalid value of filter {}: {}",
                    filter.column, err
                ))
            })?;
            Ok(Filter {
                column: filter.column,
                value,
            })
        })
        .collect::<Result<Vec<_>, TonicStatus>>()?;
    let read_columns: Vec<ReadColumn> = proto
        .read_columns
        .into_iter()
        .map(|column| ReadColumn {
            column: column.column,
            data_return_type: column.data_return_type,
        })
        .collect();
    Ok(PkReadParams {
        db: proto.db,
        table: proto.table,
        filters,
        read_columns: (!read_columns.is_empty()).then_some(read_columns),
        operation_id: proto.operation_id,
    })
}

/// JSON strings travel unquoted; numbers keep their JSON text.
fn column_value(value: &RawJson) -> String {
    let text = value.get();
    if text.starts_with('"') {
        serde_json::from_str::<String>(text).unwrap_or_else(|_| text.to_string())
    } else {
        text.to_string()
    }
}

fn response_to_proto(code: u16, message: Option<String>, response: PkReadResponse) -> PkReadResponseProto {
    let data = response
        .data
        .into_iter()
        .map(|(column, value)| {
            (
                column,
                ColumnValueProto {
                    name: value.as_ref().map(column_value),
                },
            )
        })
        .collect();
    PkReadResponseProto {
        code: code as i32,
        operation_id: response.operation_id,
        data,
        message,
    }
}

fn stat_to_proto(stat: StatResponse) -> StatResponseProto {
    let memory = stat.memory_stats;
    let rondb = stat.rondb_stats;
    StatResponseProto {
        memory_stats: Some(MemoryStatsProto {
            allocations_count: memory.allocations_count as i64,
            deallocations_count: memory.deallocations_count as i64,
            buffers_count: memory.buffers_count as i64,
            free_buffers: memory.free_buffers as i64,
        }),
        rondb_stats: Some(RonDbStatsProto {
            ndb_objects_creation_count: rondb.ndb_objects_created as i64,
            ndb_objects_deletion_count: rondb.ndb_objects_deleted as i64,
            ndb_objects_total_count: rondb.ndb_objects_count as i64,
            ndb_objects_free_count: rondb.ndb_objects_available as i64,
        }),
    }
}

#[tonic::async_trait]
impl RonDbRest for RdrsGrpcService {
    async fn ping(
        &self,
        _request: Request<PingRequestProto>,
    ) -> Result<Response<PingResponseProto>, TonicStatus> {
        Ok(Response::new(PingResponseProto {}))
    }

    async fn health(
        &self,
        _request: Request<HealthRequestProto>,
    ) -> Result<Response<HealthResponseProto>, TonicStatus> {
        handle(self.handlers.health.clone(), None, ())
            .await
            .map_err(to_status)?;
        Ok(Response::new(HealthResponseProto { status: 0 }))
    }

    async fn stat(
        &self,
        request: Request<StatRequestProto>,
    ) -> Result<Response<StatResponseProto>, TonicStatus> {
        let (_, stat) = handle(self.handlers.stat.clone(), api_key(&request), ())
            .await
            .map_err(to_status)?;
        Ok(Response::new(stat_to_proto(stat)))
    }

    async fn pk_read(
        &self,
        request: Request<PkReadRequestProto>,
    ) -> Result<Response<PkReadResponseProto>, TonicStatus> {
        let key = api_key(&request);
        let params = params_from_proto(request.into_inner())?;
        let (code, response) = handle(self.handlers.pk_read.clone(), key, params)
            .await
            .map_err(to_status)?;
        Ok(Response::new(response_to_proto(code, None, response)))
    }

    async fn batch(
        &self,
        request: Request<BatchRequestProto>,
    ) -> Result<Response<BatchResponseProto>, TonicStatus> {
        let key = api_key(&request);
        let operations = request
            .into_inner()
            .operations
            .into_iter()
            .map(params_from_proto)
            .collect::<Result<Vec<_>, _>>()?;
        let (_, response) = handle(self.handlers.batch.clone(), key, operations)
            .await
            .map_err(to_status)?;
        let responses = response
            .result
            .into_iter()
            .map(|PkReadResult { code, body, message }| response_to_proto(code, message, body))
            .collect();
        Ok(Response::new(BatchResponseProto { responses }))
    }
}

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
            port: 4406,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
            client_ca_path: None,
        }
    }
}

impl ServerConfig {
    pub fn new(grpc: &GrpcConfig, tls: &TlsConfig) -> Self {
        let non_empty = |path: &str| (!path.is_empty()).then(|| path.to_string());
        Self {
            host: grpc.server_ip.clone(),
            port: grpc.server_port,
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

/// Serves until `shutdown` resolves, then lets in-flight calls finish.
pub async fn start_server(
    server_config: ServerConfig,
    handlers: Handlers,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("Cannot resolve host"))?;

    let service = RdrsGrpcService::new(handlers);
    let mut builder = Server::builder();

    if server_config.tls_enabled {
        let cert_path = server_config
            .tls_cert_path
            .ok_or_else(|| anyhow!("TLS is enabled but cert path is not provided"))?;
        let key_path = server_config
            .tls_key_path
            .ok_or_else(|| anyhow!("TLS is enabled but key path is not provided"))?;

        let (cert, key) = tokio::try_join!(fs::read(cert_path), fs::read(key_path))?;
        let mut tls = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
        if let Some(ca_path) = server_config.client_ca_path {
            let ca = fs::read(ca_path).await?;
            tls = tls.client_ca_root(Certificate::from_pem(ca));
        }
        builder = builder
            .tls_config(tls)
            .map_err(|err| anyhow!("Failed to configure TLS: {}", err))?;
    }

    tracing::info!(
        "gRPC server listening on {}:{}",
        server_config.host,
        server_config.port
    );

    builder
        .add_service(RonDbRestServer::new(service))
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(|err| anyhow!("Failed to start gRPC server: {}", err))?;
    tracing::info!("gRPC server closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::rdrs::{FilterProto, ReadColumnProto};
    use rdrs_server_core::auth::ApiKeyCache;
    use rdrs_server_core::buffer_pool::BufferPool;
    use rdrs_server_core::catalog::Catalog;
    use rdrs_server_core::config::{ApiKeyConfig, Internal};
    use rdrs_server_core::native::memory::MemoryRonDb;
    use rdrs_server_core::native::{ConnectionState, NativeDispatch};
    use std::sync::Arc;

    const API_KEY: &str =
        "bkYjEz6OTZyevbqT.ocfnG8qdpbgAo4qDk4ZBgSuiqBPcV1IWYJb5rlqUR2BAt4UH0y1gLXDNyg9p8bM5";

    fn service(auth_enabled: bool) -> (RdrsGrpcService, Arc<MemoryRonDb>) {
        let catalog = Arc::new(
            Catalog::from_file(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../rdrs-server-core/test_data/catalog.json"
            ))
            .unwrap(),
        );
        let db = Arc::new(MemoryRonDb::from_tables(catalog.tables()).unwrap());
        let dispatch = Arc::new(NativeDispatch::new(
            BufferPool::new(4096, 2).unwrap(),
            db.clone(),
        ));
        let auth = ApiKeyCache::new(
            catalog.clone(),
            ApiKeyConfig {
                use_hopsworks_api_keys: auth_enabled,
                ..Default::default()
            },
        );
        let handlers = Handlers::new(dispatch, catalog, auth, &Internal::default());
        (RdrsGrpcService::new(handlers), db)
    }

    fn pk_request(id: &str, op: &str) -> PkReadRequestProto {
        PkReadRequestProto {
            db: "db001".to_string(),
            table: "table_1".to_string(),
            filters: vec![FilterProto {
                column: "id0".to_string(),
                value: id.to_string(),
            }],
            read_columns: vec![
                ReadColumnProto {
                    column: "col0".to_string(),
                    data_return_type: None,
                },
                ReadColumnProto {
                    column: "col1".to_string(),
                    data_return_type: None,
                },
            ],
            operation_id: Some(op.to_string()),
        }
    }

    #[test]
    fn http_statuses_map_to_grpc_codes() {
        assert_eq!(grpc_code(200), Code::Ok);
        assert_eq!(grpc_code(400), Code::InvalidArgument);
        assert_eq!(grpc_code(401), Code::PermissionDenied);
        assert_eq!(grpc_code(404), Code::NotFound);
        assert_eq!(grpc_code(415), Code::InvalidArgument);
        assert_eq!(grpc_code(503), Code::Unavailable);
        assert_eq!(grpc_code(500), Code::Internal);
    }

    #[tokio::test]
    async fn pk_read_returns_unquoted_values() {
        let (service, _) = service(false);
        let response = service
            .pk_read(Request::new(pk_request("7", "op7")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.code, 200);
        assert_eq!(response.operation_id.as_deref(), Some("op7"));
        assert_eq!(response.data["col0"].name.as_deref(), Some("hello"));
        assert_eq!(response.data["col1"].name.as_deref(), Some("70"));

        let miss = service
            .pk_read(Request::new(pk_request("999", "op999")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(miss.code, 404);
        assert!(miss.data.is_empty());
    }

    #[tokio::test]
    async fn invalid_filter_json_is_rejected() {
        let (service, _) = service(false);
        let status = service
            .pk_read(Request::new(pk_request("{oops", "op")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn batch_keeps_request_order() {
        let (service, _) = service(false);
        let operations = (0..10)
            .map(|i| pk_request(&i.to_string(), &format!("op_{}", i)))
            .collect();
        let response = service
            .batch(Request::new(BatchRequestProto { operations }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.responses.len(), 10);
        for (i, item) in response.responses.iter().enumerate() {
            assert_eq!(item.operation_id.as_deref(), Some(format!("op_{}", i).as_str()));
        }
        assert_eq!(response.responses[1].code, 200);
        assert_eq!(response.responses[5].code, 404);
    }

    #[tokio::test]
    async fn authorization_metadata_carries_the_api_key() {
        let (service, _) = service(true);
        let status = service
            .pk_read(Request::new(pk_request("7", "op")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::PermissionDenied);

        let mut request = Request::new(pk_request("7", "op"));
        request
            .metadata_mut()
            .insert(API_KEY_METADATA, API_KEY.parse().unwrap());
        assert!(service.pk_read(request).await.is_ok());
    }

    #[tokio::test]
    async fn stat_and_health() {
        let (service, db) = service(false);
        let stat = service
            .stat(Request::new(StatRequestProto {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(stat.memory_stats.unwrap().buffers_count, 2);

        assert!(service.health(Request::new(HealthRequestProto {})).await.is_ok());
        db.set_connection_state(ConnectionState::Disconnected);
        let status = service
            .health(Request::new(HealthRequestProto {}))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
    }
}
