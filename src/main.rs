use anyhow::{Context, Result};
use file_relay::{
    build_app,
    config::{AppConfig, StorageBackend},
    services::{
        file_repository::{self, SqliteFileRepository},
        object_storage::{BucketObjectStorage, ObjectStorage, S3Settings},
        relay_service::RelayService,
    },
};
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "file_relay=info,tower_http=info";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting file-relay with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if !db_path.starts_with(":memory:") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let db = Arc::new(
        file_repository::connect(db_url, 5)
            .await
            .with_context(|| format!("connecting to metadata store {}", db_url))?,
    );
    file_repository::run_migrations(&db)
        .await
        .context("applying metadata schema")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        db.close().await;
        return Ok(()); // exit after migration
    }

    // --- Initialize stores ---
    let objects: Arc<dyn ObjectStorage> = match cfg.storage_backend {
        StorageBackend::Local => {
            let storage = BucketObjectStorage::local(&cfg.storage_dir)
                .with_context(|| format!("opening storage directory {}", cfg.storage_dir))?;
            tracing::info!("Storing objects under {}", cfg.storage_dir);
            if !storage.supports_attributes() {
                tracing::warn!("Local storage backend does not keep upload content types");
            }
            Arc::new(storage)
        }
        StorageBackend::S3 => {
            let settings = S3Settings {
                endpoint: cfg.s3_endpoint.clone().unwrap_or_default(),
                access_key: cfg.s3_access_key.clone(),
                secret_key: cfg.s3_secret_key.clone(),
                region: cfg.s3_region.clone(),
            };
            tracing::info!("Storing objects in S3 at {}", settings.endpoint);
            Arc::new(BucketObjectStorage::s3(settings))
        }
    };
    objects
        .ready()
        .await
        .context("object store is not usable")?;

    let files = Arc::new(SqliteFileRepository::new(db.clone()));
    let service = RelayService::new(files, objects, cfg.store_timeout);

    // --- Build router ---
    let app = build_app(service, cfg.max_upload_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped, closing metadata store");
    db.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
