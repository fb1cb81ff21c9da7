//! Courier Worker - hosts an `MqServer` against the configured broker.
//!
//! Registers a `Hello` greeter that replies with `HelloResponse`, runs until
//! SIGINT/SIGTERM, then drains its workers and disconnects.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use courier::{Failure, Message, MqConfig, MqServer, QueueMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Hello {
    name: String,
}

impl QueueMessage for Hello {
    const TYPE_NAME: &'static str = "Hello";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelloResponse {
    result: String,
}

impl QueueMessage for HelloResponse {
    const TYPE_NAME: &'static str = "HelloResponse";
}

async fn greet(message: Message<Hello>) -> Result<Option<HelloResponse>, Failure> {
    let name = message.body.name.trim();
    if name.is_empty() {
        return Err(Failure::unretryable("ArgumentException", "Name"));
    }

    Ok(Some(HelloResponse {
        result: format!("Hello, {}!", name),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("worker_starting");

    let config = MqConfig::from_env();
    info!(
        mq_url_set = !config.url.is_empty(),
        retry_count = config.retry_count,
        worker_threads = config.worker_threads,
        queue_prefix = %config.queue_prefix,
        "config_loaded"
    );

    let server = MqServer::connect(&config)
        .await
        .context("Failed to connect to message broker")?;

    server
        .register_handler(greet)
        .context("Failed to register Hello handler")?;

    server.start().await.context("Failed to start server")?;
    info!("worker_ready");

    shutdown_signal().await;

    info!("worker_stopping");
    server.dispose().await.context("Failed to dispose server")?;
    info!(stats = %server.stats(), "worker_stopped");

    Ok(())
}
