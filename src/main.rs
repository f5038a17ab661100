use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use streamspace::config::{Config, HubBackend};
use streamspace::hub::registry::Registry;
use streamspace::hub::{self, AgentHub};
use streamspace::proxy::VncRouter;
use streamspace::store::{self, AppState};
use streamspace::{api, dispatch};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("STREAMSPACE_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let config = Config::load();
    let pool = store::pool::connect(&config.database_url, config.db_max_connections).await?;
    store::bootstrap::run(&pool, config.bootstrap_admin_token.as_deref()).await?;

    // Hub backend: in-process map alone, or valkey registry + relay for a
    // replicated fleet.
    let (registry, valkey) = match config.hub_backend {
        HubBackend::Memory => (Registry::Memory, None),
        HubBackend::Valkey => {
            let url = config.connection_registry_url.clone().ok_or_else(|| {
                anyhow::anyhow!("STREAMSPACE_CONNECTION_REGISTRY_URL required for valkey backend")
            })?;
            let valkey = store::valkey::connect(&url, config.valkey_pool_size).await?;
            let registry = Registry::Valkey {
                pool: valkey.clone(),
                replica_id: config.replica_id.clone(),
                ttl_secs: i64::try_from(config.heartbeat_timeout.as_secs() * 2).unwrap_or(60),
            };
            (registry, Some(valkey))
        }
    };

    let state = AppState {
        pool: pool.clone(),
        hub: Arc::new(AgentHub::new(pool, registry)),
        vnc: Arc::new(VncRouter::new()),
        config: Arc::new(config),
    };

    // Background tasks, all cancelled by the shutdown watch.
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(dispatch::run_sweeper(state.clone(), shutdown_rx.clone()));
    tokio::spawn(hub::run_heartbeat_scanner(state.clone(), shutdown_rx.clone()));
    if let Some(valkey) = valkey {
        tokio::spawn(hub::run_relay_consumer(
            state.clone(),
            valkey,
            shutdown_rx.clone(),
        ));
    }

    let app = axum::Router::new()
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .merge(api::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = state.config.listen.parse()?;
    tracing::info!(%addr, replica_id = %state.config.replica_id, "starting control plane");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful_shutdown(state, shutdown_tx))
        .await?;

    tracing::info!("control plane stopped");
    Ok(())
}

/// Orderly shutdown: stop the background tasks, close every agent channel,
/// and leave a short window for in-flight acks to land.
async fn graceful_shutdown(state: AppState, shutdown_tx: watch::Sender<()>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    state.hub.shutdown().await;
    tokio::time::sleep(Duration::from_secs(2)).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
