//! Draw service entry point.

use std::sync::Arc;

use anyhow::{bail, Result};
use auth::{AuthState, GithubProvider, GoogleProvider, ProviderRegistry, TokenKeys};
use draw_service::{create_router, AppState};
use grid_store::GridStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
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

    info!("Starting draw service");

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let grid_key = std::env::var("GRID_KEY").unwrap_or_else(|_| "grid".to_string());
    let grid_size: u16 = std::env::var("GRID_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .expect("GRID_SIZE must be a number");
    let stream_key =
        std::env::var("STREAM_KEY").unwrap_or_else(|_| format!("{grid_key}:events"));
    let http_port: u16 = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .expect("HTTP_PORT must be a number");
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");

    let Ok(jwt_secret) = std::env::var("JWT_SECRET") else {
        bail!("JWT_SECRET is not set; refusing to serve");
    };

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics on port {}", metrics_port);

    let store = GridStore::connect(&redis_url).await?;

    let keys = TokenKeys::from_secret(jwt_secret.as_bytes());
    let mut providers = ProviderRegistry::new().register(Arc::new(GithubProvider::new()));
    if let Ok(google_client_id) = std::env::var("GOOGLE_CLIENT_ID") {
        providers = providers.register(Arc::new(GoogleProvider::new(google_client_id)));
    }
    let auth_state = Arc::new(AuthState {
        keys: keys.clone(),
        providers,
    });

    let state = Arc::new(AppState {
        store,
        stream_key,
        grid_size,
    });

    let app = create_router(state, auth_state, Arc::new(keys));

    let listener = TcpListener::bind(("0.0.0.0", http_port)).await?;
    info!("Draw service listening on 0.0.0.0:{}", http_port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Draw service stopped");
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
