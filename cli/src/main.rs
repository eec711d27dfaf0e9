use crate::cli_options::{CliOptions, LogLevel};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use rdrs_server_core::auth::{ApiKeyCache, ApiKeyStore};
use rdrs_server_core::buffer_pool::BufferPool;
use rdrs_server_core::catalog::Catalog;
use rdrs_server_core::config::{AllConfigs, CONFIG_FILE_PATH_ENV_VAR, LogConfig};
use rdrs_server_core::feature_store::{CachedFeatureViewStore, FEATURE_VIEW_CACHE_TTL};
use rdrs_server_core::handler::Handlers;
use rdrs_server_core::native::{NativeDispatch, RonDbClient};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli_options;

const REST_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let CliOptions {
        config,
        log_level,
        no_metrics,
    } = CliOptions::parse();

    let config_path = config.or_else(|| std::env::var(CONFIG_FILE_PATH_ENV_VAR).ok());
    let configs = load_config(config_path.as_deref())?;
    configs.validate()?;
    init_logging(&configs.log, log_level)?;
    tracing::info!(
        "Starting RonDB data access server {}",
        env!("CARGO_PKG_VERSION")
    );

    let internal = &configs.internal;
    let pool = BufferPool::new(internal.buffer_size, internal.pre_allocated_buffers)?;
    let catalog = Arc::new(load_catalog(&configs, config_path.as_deref())?);
    let (client, api_keys) = connect(&configs, &catalog)?;
    let dispatch = Arc::new(NativeDispatch::new(pool, client));
    let auth = ApiKeyCache::new(api_keys, configs.security.api_key.clone());
    let views = Arc::new(CachedFeatureViewStore::new(catalog, FEATURE_VIEW_CACHE_TTL));
    let handlers = Handlers::new(dispatch.clone(), views, auth.clone(), internal);

    let served = serve(&configs, handlers, !no_metrics).await;

    auth.cleanup().await;
    if let Err(err) = dispatch.shutdown() {
        tracing::error!(error = %err, "Failed to release native resources");
    }
    tracing::info!("Shutdown complete");
    served
}

fn load_config(path: Option<&str>) -> Result<AllConfigs> {
    match path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("Failed to read configuration file {}", path))?;
            AllConfigs::from_json_str(&json)
        }
        None => Ok(AllConfigs::default()),
    }
}

fn init_logging(log: &LogConfig, cli_level: Option<LogLevel>) -> Result<()> {
    let level = match cli_level {
        Some(level) => level,
        None => LogLevel::from_config(&log.level)
            .ok_or_else(|| anyhow!("Unsupported log level {}", log.level))?,
    };
    // Rotation (MaxSizeMB, MaxBackups, MaxAge) is left to the host.
    let writer = if log.file_path.is_empty() {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log.file_path)
            .with_context(|| format!("Failed to open log file {}", log.file_path))?;
        BoxMakeWriter::new(Arc::new(file))
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::from(level).into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(log.file_path.is_empty())
                .with_writer(writer),
        )
        .init();
    Ok(())
}

/// A relative catalog path is resolved against the configuration file's directory.
fn load_catalog(configs: &AllConfigs, config_path: Option<&str>) -> Result<Catalog> {
    let path = &configs.catalog.file_path;
    if path.is_empty() {
        tracing::warn!("No metadata catalog configured, feature store lookups will fail");
        return Ok(Catalog::default());
    }
    let mut resolved = PathBuf::from(path);
    if resolved.is_relative()
        && let Some(parent) = config_path.and_then(|p| Path::new(p).parent())
    {
        resolved = parent.join(resolved);
    }
    let resolved = resolved
        .to_str()
        .ok_or_else(|| anyhow!("Catalog path contains invalid UTF-8"))?;
    let catalog = Catalog::from_file(resolved)?;
    tracing::info!(
        "Loaded metadata catalog {} with {} feature views",
        resolved,
        catalog.num_feature_views()
    );
    Ok(catalog)
}

#[cfg(not(feature = "rondb"))]
fn connect(
    _configs: &AllConfigs,
    catalog: &Arc<Catalog>,
) -> Result<(Arc<dyn RonDbClient>, Arc<dyn ApiKeyStore>)> {
    let db = rdrs_server_core::native::memory::MemoryRonDb::from_tables(catalog.tables())?;
    tracing::info!(
        "Serving {} tables from the in-memory store",
        catalog.tables().len()
    );
    let client: Arc<dyn RonDbClient> = Arc::new(db);
    let api_keys: Arc<dyn ApiKeyStore> = catalog.clone();
    Ok((client, api_keys))
}

#[cfg(feature = "rondb")]
fn connect(
    configs: &AllConfigs,
    _catalog: &Arc<Catalog>,
) -> Result<(Arc<dyn RonDbClient>, Arc<dyn ApiKeyStore>)> {
    let db = Arc::new(rdrs_server_core::native::ffi::NativeRonDb::connect(&configs.rondb)?);
    tracing::info!(
        "Connected to RonDB at {}",
        configs.rondb.mgmd_connect_string()?
    );
    let client: Arc<dyn RonDbClient> = db.clone();
    let api_keys: Arc<dyn ApiKeyStore> = db;
    Ok((client, api_keys))
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
            _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, shutting down...");
    }
    Ok(())
}

/// Runs the enabled listeners until a shutdown signal arrives or one of them fails.
async fn serve(configs: &AllConfigs, handlers: Handlers, metrics_enabled: bool) -> Result<()> {
    let rest_handle = axum_server::Handle::new();
    let (grpc_stop, grpc_stopped) = tokio::sync::watch::channel(false);
    let mut servers = JoinSet::new();

    if configs.rest.enable {
        let server_config =
            rest_server::server::ServerConfig::new(&configs.rest, &configs.security.tls);
        servers.spawn(rest_server::server::start_server(
            server_config,
            handlers.clone(),
            metrics_enabled,
            rest_handle.clone(),
        ));
    }
    if configs.grpc.enable {
        let server_config =
            grpc_server::server::ServerConfig::new(&configs.grpc, &configs.security.tls);
        let mut stopped = grpc_stopped.clone();
        servers.spawn(grpc_server::server::start_server(
            server_config,
            handlers.clone(),
            async move {
                let _ = stopped.changed().await;
            },
        ));
    }

    tokio::select! {
        Some(res) = servers.join_next() => {
            res??;
            return Err(anyhow!("Server stopped unexpectedly"));
        }
        res = shutdown_signal() => res?,
    }

    rest_handle.graceful_shutdown(Some(REST_SHUTDOWN_TIMEOUT));
    let _ = grpc_stop.send(true);
    while let Some(res) = servers.join_next().await {
        res??;
    }
    Ok(())
}
