use crate::native::ADDRESS_SIZE;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_PATH_ENV_VAR: &str = "RDRS_CONFIG_FILE";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AllConfigs {
    pub internal: Internal,
    #[serde(rename = "REST")]
    pub rest: RestConfig,
    #[serde(rename = "GRPC")]
    pub grpc: GrpcConfig,
    #[serde(rename = "RonDB")]
    pub rondb: RonDbConfig,
    pub security: Security,
    pub log: LogConfig,
    pub catalog: CatalogConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Internal {
    pub buffer_size: u32,
    pub pre_allocated_buffers: u32,
    pub batch_max_size: u32,
    #[serde(rename = "OperationIDMaxSize")]
    pub operation_id_max_size: u32,
    pub num_threads: u32,
}

impl Default for Internal {
    fn default() -> Self {
        Self {
            buffer_size: 320 * 1024,
            pre_allocated_buffers: 1024,
            batch_max_size: 256,
            operation_id_max_size: 256,
            num_threads: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RestConfig {
    pub enable: bool,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    pub server_port: u16,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            enable: true,
            server_ip: "localhost".to_string(),
            server_port: 5406,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GrpcConfig {
    pub enable: bool,
    #[serde(rename = "ServerIP")]
    pub server_ip: String,
    pub server_port: u16,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            server_ip: "localhost".to_string(),
            server_port: 4406,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mgmd {
    #[serde(rename = "IP")]
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RonDbConfig {
    pub mgmds: Vec<Mgmd>,
    pub connection_pool_size: u32,
    #[serde(rename = "NodeIDs")]
    pub node_ids: Vec<u32>,
    pub connection_retries: u32,
    pub connection_retry_delay_in_sec: u32,
    pub op_retry_on_transient_errors_count: u32,
    #[serde(rename = "OpRetryInitialDelayInMS")]
    pub op_retry_initial_delay_in_ms: u32,
    #[serde(rename = "OpRetryJitterInMS")]
    pub op_retry_jitter_in_ms: u32,
}

impl Default for RonDbConfig {
    fn default() -> Self {
        Self {
            mgmds: vec![Mgmd {
                ip: "localhost".to_string(),
                port: 1186,
            }],
            connection_pool_size: 1,
            node_ids: vec![],
            connection_retries: 5,
            connection_retry_delay_in_sec: 5,
            op_retry_on_transient_errors_count: 3,
            op_retry_initial_delay_in_ms: 500,
            op_retry_jitter_in_ms: 100,
        }
    }
}

impl RonDbConfig {
    pub fn mgmd_connect_string(&self) -> Result<String> {
        let mgmd = self
            .mgmds
            .first()
            .ok_or_else(|| anyhow!("at least one Management server has to be defined"))?;
        Ok(format!("{}:{}", mgmd.ip, mgmd.port))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Security {
    #[serde(rename = "TLS")]
    pub tls: TlsConfig,
    #[serde(rename = "APIKey")]
    pub api_key: ApiKeyConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TlsConfig {
    #[serde(rename = "EnableTLS")]
    pub enable_tls: bool,
    pub require_and_verify_client_cert: bool,
    pub certificate_file: String,
    pub private_key_file: String,
    #[serde(rename = "RootCACertFile")]
    pub root_ca_cert_file: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enable_tls: true,
            require_and_verify_client_cert: false,
            certificate_file: String::new(),
            private_key_file: String::new(),
            root_ca_cert_file: String::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiKeyConfig {
    #[serde(rename = "UseHopsworksAPIKeys")]
    pub use_hopsworks_api_keys: bool,
    #[serde(rename = "CacheRefreshIntervalMS")]
    pub cache_refresh_interval_ms: u64,
    #[serde(rename = "CacheRefreshIntervalJitterMS")]
    pub cache_refresh_interval_jitter_ms: u64,
    #[serde(rename = "CacheUnusedEntriesEvictionMS")]
    pub cache_unused_entries_eviction_ms: u64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            use_hopsworks_api_keys: true,
            cache_refresh_interval_ms: 10_000,
            cache_refresh_interval_jitter_ms: 1_000,
            cache_unused_entries_eviction_ms: 60_000,
        }
    }
}

pub const LOG_LEVELS: [&str; 7] = ["panic", "fatal", "error", "warn", "info", "debug", "trace"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogConfig {
    pub level: String,
    pub file_path: String,
    #[serde(rename = "MaxSizeMB")]
    pub max_size_mb: u32,
    pub max_backups: u32,
    pub max_age: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file_path: String::new(),
            max_size_mb: 100,
            max_backups: 10,
            max_age: 30,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CatalogConfig {
    pub file_path: String,
}

impl AllConfigs {
    pub fn from_json_str(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Err(anyhow!("Empty configuration file"));
        }
        let config: AllConfigs =
            serde_json::from_str(json).map_err(|err| anyhow!("Invalid configuration: {}", err))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.internal.validate()?;
        if !self.rest.enable && !self.grpc.enable {
            return Err(anyhow!("at least one of REST or gRPC server has to be enabled"));
        }
        if self.rest.enable {
            validate_listener("REST", &self.rest.server_ip, self.rest.server_port)?;
        }
        if self.grpc.enable {
            validate_listener("gRPC", &self.grpc.server_ip, self.grpc.server_port)?;
        }
        self.rondb.validate()?;
        self.security.validate()?;
        self.log.validate()
    }
}

impl Internal {
    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 || self.buffer_size % ADDRESS_SIZE != 0 {
            return Err(anyhow!(
                "buffer size must be a positive multiple of {}",
                ADDRESS_SIZE
            ));
        }
        if self.pre_allocated_buffers == 0 {
            return Err(anyhow!("pre-allocated buffers cannot be zero"));
        }
        if self.batch_max_size == 0 {
            return Err(anyhow!("batch max size cannot be zero"));
        }
        if self.operation_id_max_size == 0 {
            return Err(anyhow!("operation id max size cannot be zero"));
        }
        if self.num_threads == 0 {
            return Err(anyhow!("number of threads cannot be zero"));
        }
        Ok(())
    }
}

fn validate_listener(name: &str, ip: &str, port: u16) -> Result<()> {
    if ip.is_empty() {
        return Err(anyhow!("the {} server IP cannot be empty", name));
    }
    if port == 0 {
        return Err(anyhow!("the {} server port cannot be empty", name));
    }
    Ok(())
}

impl RonDbConfig {
    fn validate(&self) -> Result<()> {
        if self.mgmds.is_empty() {
            return Err(anyhow!("at least one Management server has to be defined"));
        }
        if self.mgmds.len() > 1 {
            return Err(anyhow!(
                "we do not support specifying more than one Management server yet"
            ));
        }
        for mgmd in &self.mgmds {
            if mgmd.ip.is_empty() {
                return Err(anyhow!("the Management server IP cannot be empty"));
            }
            if mgmd.port == 0 {
                return Err(anyhow!("the Management server port cannot be empty"));
            }
        }
        if self.connection_pool_size != 1 {
            return Err(anyhow!(
                "wrong connection pool size. Currently only single RonDB connection is supported"
            ));
        }
        if !self.node_ids.is_empty() && self.node_ids.len() != self.connection_pool_size as usize {
            return Err(anyhow!(
                "wrong number of NodeIDs. The number of node ids must match the connection pool size"
            ));
        }
        Ok(())
    }
}

impl Security {
    fn validate(&self) -> Result<()> {
        let tls = &self.tls;
        if tls.enable_tls {
            if tls.certificate_file.is_empty() {
                return Err(anyhow!("cannot enable TLS if `CertificateFile` is not set"));
            }
            if tls.private_key_file.is_empty() {
                return Err(anyhow!("cannot enable TLS if `PrivateKeyFile` is not set"));
            }
        }
        if tls.require_and_verify_client_cert {
            if !tls.enable_tls {
                return Err(anyhow!(
                    "cannot require client certificates if TLS is not enabled"
                ));
            }
            if tls.root_ca_cert_file.is_empty() {
                return Err(anyhow!(
                    "cannot verify client certificates if `RootCACertFile` is not set"
                ));
            }
        }
        let api_key = &self.api_key;
        if api_key.cache_refresh_interval_ms == 0 {
            return Err(anyhow!("cache refresh interval cannot be 0"));
        }
        if api_key.cache_refresh_interval_jitter_ms >= api_key.cache_refresh_interval_ms {
            return Err(anyhow!(
                "cache refresh interval jitter must be smaller than the refresh interval"
            ));
        }
        Ok(())
    }
}

impl LogConfig {
    fn validate(&self) -> Result<()> {
        let level = self.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(anyhow!(
                "unknown log level '{}', expected one of {:?}",
                self.level,
                LOG_LEVELS
            ));
        }
        Ok(())
    }
}
