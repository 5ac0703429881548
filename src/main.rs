use anyhow::{Context, Result};
use axum::Router;
use object_gateway::{
    config::AppConfig,
    middleware::stages::install_panic_hook,
    routes,
    services::blob_store::{BlobStore, Namespace},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    install_panic_hook();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-gateway with config: {:?}", cfg);

    // --- Initialize blob-store connection ---
    prepare_sqlite_path(&cfg.dsn)?;
    tracing::info!("Connecting to {}", cfg.dsn);

    let options = SqliteConnectOptions::from_str(&cfg.dsn)
        .with_context(|| format!("parsing connection string `{}`", cfg.dsn))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to the blob store")?,
    );

    let namespace = Namespace::new(&cfg.database, &cfg.prefix)?;
    let store = BlobStore::new(db, namespace, cfg.chunk_size);

    // --- Handle migration mode ---
    if migrate {
        let statements = store.migrate().await?;
        tracing::info!(
            "Blob-store migration complete ({} statements, namespace `{}`).",
            statements,
            store.namespace().as_str()
        );
        return Ok(()); // exit after migration
    }

    // --- Build router ---
    let app: Router = routes::routes().with_state(store);

    // --- Start server ---
    let listener = match TcpListener::bind(&cfg.addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host(), "0.0.0.0" | "::" | "[::]") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port());
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                cfg.addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("RESTful API server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Finished - bye bye.");
    Ok(())
}

/// Create the parent directory of a file-backed SQLite database.
fn prepare_sqlite_path(dsn: &str) -> Result<()> {
    let path = dsn
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Caught interrupt, stopping the server..."),
        _ = terminate => tracing::info!("Caught terminate, stopping the server..."),
    }
}
