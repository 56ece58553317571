//! SmartSRT Web Server - upload endpoint in front of the conversion queue.
//!
//! This binary accepts media uploads, publishes each one as a conversion job
//! and waits a bounded time for the worker's result. Jobs that take longer
//! are answered with 202 and finish in the background.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use srt_dispatch::web::{convert, health, AppState};
use srt_dispatch::{Broker, Config, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        queue = %config.work_queue,
        rpc_timeout_ms = config.rpc_timeout_ms,
        max_upload_bytes = config.max_upload_bytes,
        "config_loaded"
    );

    let broker = Broker::connect(Arc::clone(&config))
        .await
        .context("Failed to connect to RabbitMQ")?;
    let publisher = Publisher::new(broker.clone());
    info!("rabbitmq_publisher_created");

    let shutdown = CancellationToken::new();
    let state = AppState::new(publisher, shutdown.clone());

    // Build the router
    let app = Router::new()
        .route("/health", get(health))
        .route("/convert", post(convert))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // In-flight waits are released as soon as the signal arrives so the
    // graceful drain does not sit out their timeouts.
    let drain = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            drain.cancel();
        })
        .await
        .context("Server error")?;

    broker.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
