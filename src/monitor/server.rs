use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::installer::{HttpReleaseSource, Installer};
use super::registry::Registry;
use super::sessions::Sessions;
use super::store::StateStore;
use super::ws;
use crate::config::Settings;

/// Page served for `/` when a UI directory is configured.
pub const UI_INDEX: &str = "ui.html";

/// Shared state behind every route.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: Arc<Sessions>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the router: operator socket, health check and optional static UI.
pub fn build_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        .route("/socket", get(ws::ws_handler))
        .route("/health", get(health));

    let router = match state.settings.ui_dir() {
        Some(dir) => router
            .route_service("/", ServeFile::new(dir.join(UI_INDEX)))
            .fallback_service(ServeDir::new(dir)),
        None => router.fallback(not_found),
    };
    router.with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Load the monitor state, start a supervisor per server and serve
/// operators until Ctrl+C or `:kill monitor`.
pub async fn start_server(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let store = StateStore::new(settings.state_file());
    let persisted = store.load().context("Failed to load monitor state")?;
    let registry = Arc::new(Registry::from_state(persisted));

    let source = Arc::new(HttpReleaseSource::new(settings.releases.clone()));
    let installer = Arc::new(Installer::new(
        registry.clone(),
        source,
        settings.binaries_dir(),
    ));
    let sessions = Arc::new(Sessions::new(registry.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        sessions.clone(),
        installer,
        settings.clone(),
        shutdown_tx,
    ));

    let records = registry.servers()?;
    for record in &records {
        let supervisor = dispatcher.spawn_supervisor(record.clone());
        registry.attach_supervisor(record.id(), supervisor)?;
    }
    info!(servers = records.len(), state = %store.path().display(), "Loaded monitor state");

    let state = Arc::new(AppState {
        settings: settings.clone(),
        sessions,
        dispatcher: dispatcher.clone(),
    });
    let app = build_router(state).layer(CorsLayer::permissive());

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("Warden listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await
        .context("Server error")?;

    dispatcher
        .persist()
        .await
        .context("Failed to save monitor state")?;
    info!("Monitor shut down.");
    Ok(())
}

async fn shutdown_signal(mut exit: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = exit.wait_for(|stop| *stop) => info!("Exit requested by operator"),
    }
}
