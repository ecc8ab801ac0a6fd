use std::sync::Arc;

use anyhow::{self, Error as AnyhowError};
use db::DBService;
use generation::{GenerationConfig, GenerationOrchestrator, ProviderRegistry};
use server::{
    AppState, routes,
    session_registry::{SESSION_SWEEP_INTERVAL, session_idle_timeout},
};
use services::services::blob_store::{BlobStoreError, LocalBlobStore};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, prelude::*};
use utils::assets::{asset_dir, blob_dir, ensure_asset_dirs};

const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Error)]
pub enum ReelStudioError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[tokio::main]
async fn main() -> Result<(), ReelStudioError> {
    // Load environment variables from `.env` if present so local development picks up API keys
    dotenv::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},db={level},generation={level},utils={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string)
        .map_err(|e| anyhow::anyhow!("Failed to create tracing filter: {e}"))?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    ensure_asset_dirs()?;
    tracing::info!("Using asset directory {}", asset_dir().display());

    let db = DBService::new().await?;
    let blobs = LocalBlobStore::new(blob_dir())?;

    let config = GenerationConfig::default();
    let registry = ProviderRegistry::from_config(&config);
    if registry.is_empty() {
        tracing::warn!("No generation providers enabled - check ENABLED_PROVIDERS");
    }
    let orchestrator = GenerationOrchestrator::new(Arc::new(registry));

    let state = AppState::new(db, Arc::new(blobs), orchestrator);

    // Abandoned sessions still hold their batch results until swept
    let session_idle = session_idle_timeout();
    state
        .sessions()
        .spawn_sweeper(session_idle, SESSION_SWEEP_INTERVAL.min(session_idle));
    tracing::info!("Idle editing sessions expire after {}s", session_idle.as_secs());

    let app_router = routes::router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("Server running on http://{host}:{actual_port}");

    axum::serve(listener, app_router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
