//! Grid service entry point.

use anyhow::Result;
use grid_service::{GridSynchronizer, SyncConfig};
use grid_store::GridStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting grid service");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let grid_key = std::env::var("GRID_KEY").unwrap_or_else(|_| "grid".to_string());
    let grid_size: u16 = std::env::var("GRID_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .expect("GRID_SIZE must be a number");
    let stream_key =
        std::env::var("STREAM_KEY").unwrap_or_else(|_| format!("{grid_key}:events"));
    let bus_channel =
        std::env::var("BUS_CHANNEL").unwrap_or_else(|_| format!("{grid_key}:broadcast"));
    let group = std::env::var("CONSUMER_GROUP").unwrap_or_else(|_| "grid-sync".to_string());
    let consumer = std::env::var("CONSUMER_NAME")
        .unwrap_or_else(|_| format!("grid-sync-{}", Uuid::new_v4()));
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9091".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics on port {}", metrics_port);

    let store = GridStore::connect(&redis_url).await?;

    let config = SyncConfig {
        stream_key,
        group,
        consumer,
        grid_key,
        grid_size,
        bus_channel,
        ..SyncConfig::default()
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let synchronizer = GridSynchronizer::new(store, config, shutdown_tx.clone());
    let handle = tokio::spawn(async move {
        if let Err(err) = synchronizer.run().await {
            error!("Synchronizer error: {:?}", err);
        }
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());
    let _ = handle.await;

    info!("Grid service stopped");
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
