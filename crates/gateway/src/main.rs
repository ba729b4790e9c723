//! Gateway service entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use auth::TokenKeys;
use gateway::{
    create_router, AppState, BootstrapConfig, BusConfig, FanoutConfig, FanoutEngine, UpdateCache,
};
use grid_store::GridStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting gateway");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let grid_key = std::env::var("GRID_KEY").unwrap_or_else(|_| "grid".to_string());
    let bus_channel =
        std::env::var("BUS_CHANNEL").unwrap_or_else(|_| format!("{grid_key}:broadcast"));
    let http_port: u16 = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9092".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let cache_retention: i64 = std::env::var("CACHE_RETENTION_EPOCHS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()
        .expect("CACHE_RETENTION_EPOCHS must be a number");

    let mut fanout_config = FanoutConfig::default();
    if let Ok(workers) = std::env::var("FANOUT_WORKERS") {
        fanout_config.workers = workers.parse().expect("FANOUT_WORKERS must be a number");
    }

    let Ok(jwt_secret) = std::env::var("JWT_SECRET") else {
        bail!("JWT_SECRET is not set; refusing to serve");
    };

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics on port {}", metrics_port);

    let store = GridStore::connect(&redis_url).await?;
    let engine = FanoutEngine::new(fanout_config);
    let cache = Arc::new(UpdateCache::new(cache_retention));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let bus_handle = tokio::spawn(gateway::bus::run(
        store.clone(),
        engine.clone(),
        cache.clone(),
        BusConfig {
            channel: bus_channel,
            ..BusConfig::default()
        },
        shutdown_tx.subscribe(),
    ));

    let cleanup_cache = cache.clone();
    let cleanup_rx = shutdown_tx.subscribe();
    let cache_handle = tokio::spawn(async move {
        cleanup_cache
            .run_cleanup(Duration::from_secs(60), cleanup_rx)
            .await;
    });

    let state = Arc::new(AppState {
        engine: engine.clone(),
        store,
        cache,
        keys: Arc::new(TokenKeys::from_secret(jwt_secret.as_bytes())),
        grid_key,
        bootstrap: BootstrapConfig::default(),
    });

    let app = create_router(state);

    let listener = TcpListener::bind(("0.0.0.0", http_port)).await?;
    info!("Gateway listening on 0.0.0.0:{}", http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down gateway");
    let _ = shutdown_tx.send(());
    engine.shutdown().await;
    let _ = bus_handle.await;
    let _ = cache_handle.await;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
