use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState};
use super::documents::FsDocumentSource;
use super::huggingface::HuggingFaceAdapter;
use super::orchestrator::ReviewOrchestrator;
use super::store::SqliteIssueStore;
use crate::config::Settings;

/// Build the application router with request tracing and, when enabled,
/// permissive CORS.
pub fn build_router(state: Arc<AppState>, cors_permissive: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Wire the production components from settings.
pub fn build_state(settings: &Settings) -> Result<Arc<AppState>> {
    if let Some(parent) = settings.database.path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = SqliteIssueStore::open(&settings.database.path)
        .context("Failed to initialize issue database")?;
    let documents = FsDocumentSource::new(&settings.documents.dir);
    let adapter = HuggingFaceAdapter::new(settings.backend.clone(), Arc::new(documents))
        .context("Failed to build inference adapter")?;
    let orchestrator = ReviewOrchestrator::new(Arc::new(store), Arc::new(adapter));
    Ok(Arc::new(AppState::new(orchestrator)))
}

pub async fn start_server(settings: Settings) -> Result<()> {
    let state = build_state(&settings)?;
    let app = build_router(state, settings.server.cors_permissive);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(
        addr = %local_addr,
        db = %settings.database.path.display(),
        model = %settings.backend.model_name,
        "Document review service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
