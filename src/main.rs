//! Chunkyard Server
//!
//! Resumable chunked upload server with content-addressed deduplication.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkyard_server::config::Config;
use chunkyard_server::db::{self, SessionRepository};
use chunkyard_server::routes;
use chunkyard_server::state::AppState;
use chunkyard_server::upload::{Collaborators, UploadService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chunkyard_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Chunkyard Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        chunk_dir = %config.upload.chunk_dir.display(),
        artifact_dir = %config.upload.artifact_dir.display(),
        max_sessions = config.upload.max_concurrent_sessions,
        auto_finalize = config.upload.auto_finalize,
        "Upload configuration"
    );

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    // Build the upload core and pick up where the last process left off
    let uploads = UploadService::new(
        &config.upload,
        &config.cache,
        Some(SessionRepository::new(db_pool.clone())),
        Collaborators::default(),
    )
    .context("Invalid upload configuration")?;

    let recovered = uploads
        .recover()
        .await
        .context("Failed to recover upload sessions")?;
    tracing::info!("Upload service ready ({} sessions recovered)", recovered);

    uploads.start_maintenance();

    let app_state = AppState::new(config.clone(), uploads.clone(), Some(db_pool));
    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid SERVER_HOST/SERVER_PORT")?;
    tracing::info!("Chunkyard Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    uploads.shutdown().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
