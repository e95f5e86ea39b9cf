use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod auth;
mod broadcast;
mod config;
mod error;
mod extract;
mod middleware;
mod orchestrator;
mod routes;
mod state;
mod store;
mod upstream;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsdeck_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = config::ServerConfig::from_env();
    if !config.auth_enabled() {
        tracing::warn!("OPSDECK_TOKEN not set, API is unauthenticated");
    }

    let broadcaster = broadcast::EventBroadcaster::new(broadcast::SUBSCRIBER_BUFFER);
    let store = Arc::new(store::SnapshotStore::new(broadcaster));
    let upstream = Arc::new(upstream::HttpUpstream::new(config.jarvis.chat.clone()));
    let jarvis = orchestrator::RequestOrchestrator::new(
        upstream,
        config.jarvis.clone(),
        config.cooldown,
    );

    let heartbeat = store::spawn_heartbeat(store.clone(), config.heartbeat_interval);

    let addr = config.bind_addr();
    let shutdown_store = store.clone();
    let app_state = state::AppState {
        store,
        jarvis: Arc::new(jarvis),
        config: Arc::new(config),
    };
    let app = app::build_router(app_state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!("Opsdeck API listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_store))
        .await;
    heartbeat.abort();
    if let Err(err) = served {
        tracing::error!(error = %err, "server exited with error");
        std::process::exit(1);
    }
}

/// Resolves on Ctrl-C. Open push streams never finish on their own, so they
/// are closed here to let graceful shutdown complete.
async fn shutdown_signal(store: Arc<store::SnapshotStore>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    let closed = store.broadcaster().close_all();
    tracing::info!(closed_streams = closed, "shutdown requested");
}
