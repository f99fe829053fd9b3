use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use syncboard::Store;
use syncboard_replication::{NodeConfig, ReplicationManager};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{create_message, health, list_messages, sync_message, sync_status, AppState};
use crate::middleware::normalize_content_type;

/// Install the global subscriber: `RUST_LOG` filter (default `info`) and a fmt layer.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Peer-to-peer protocol
    let internal = Router::new()
        .route("/sync_message", post(sync_message))
        .route("/health", get(health));

    let api = Router::new()
        .route("/api/messages", get(list_messages).post(create_message))
        .route("/api/sync_status", get(sync_status));

    Router::new()
        .merge(internal)
        .merge(api)
        .with_state(state)
        .layer(middleware::from_fn(normalize_content_type))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
}

/// Serve an already bound listener until `shutdown` resolves, then stop replication.
pub async fn run<F>(
    listener: TcpListener,
    replication: Arc<ReplicationManager>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState {
        replication: Arc::clone(&replication),
    });
    let app = build_router(state);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    replication.shutdown();
    result
}

pub async fn serve(
    data_dir: &Path,
    node_config: NodeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    node_config.validate()?;

    let store = Store::open(data_dir, &node_config.node_id)?;
    tracing::info!(
        "Opened store at {:?} ({} messages, {} queued for delivery)",
        store.dir(),
        store.messages().count(),
        store.offline_queue().len()
    );

    let bind_addr = node_config.bind_addr.clone();
    let replication = ReplicationManager::new(node_config, store);
    if replication.peer_count() == 0 {
        tracing::info!("Replication disabled (no peers configured)");
    }
    replication.start();

    tracing::info!(
        "Starting syncboard {} node {} on {}",
        replication.role(),
        replication.node_id(),
        bind_addr
    );

    let listener = TcpListener::bind(&bind_addr).await?;
    run(listener, replication, shutdown_signal()).await?;

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
