//! SmartSRT Worker - RabbitMQ worker pool for subtitle conversions.
//!
//! This worker consumes conversion jobs from the work queue, runs each one
//! through the conversion endpoint, replies to waiting publishers and mails
//! the requester when a conversion succeeds.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use srt_dispatch::{
    Broker, Config, HttpProcessor, LogNotifier, Notifier, NotifyingProcessor, ResendNotifier,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        amqp_url_set = !config.amqp_url.is_empty(),
        queue = %config.work_queue,
        worker_pool_size = config.worker_pool_size,
        channel_pool_size = config.channel_pool_size,
        notifications_enabled = config.resend_api_key.is_some(),
        "config_loaded"
    );

    let endpoint = config
        .conversion_endpoint
        .clone()
        .context("CONVERSION_ENDPOINT_URL must be set to a valid http(s) URL")?;

    // Shared HTTP client for conversion and notification calls
    let client = Client::builder()
        .pool_max_idle_per_host(config.worker_pool_size)
        .build()
        .context("Failed to create HTTP client")?;

    let notifier: Arc<dyn Notifier> = match &config.resend_api_key {
        Some(api_key) => Arc::new(ResendNotifier::new(
            client.clone(),
            api_key.clone(),
            config.notify_from.clone(),
            config.request_timeout(),
        )),
        None => Arc::new(LogNotifier),
    };

    let processor = Arc::new(NotifyingProcessor::new(
        HttpProcessor::new(client, endpoint, config.request_timeout()),
        notifier,
    ));

    let config = Arc::new(config);
    let broker = Broker::connect(Arc::clone(&config))
        .await
        .context("Failed to connect to RabbitMQ")?;

    broker
        .start_worker_pool(config.worker_pool_size, processor.clone())
        .await
        .context("Failed to start worker pool")?;

    info!("worker_ready");

    shutdown_signal().await;

    info!("worker_stopping");
    broker.close().await;
    processor.drain().await;

    info!("worker_shutdown_complete");
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
}
