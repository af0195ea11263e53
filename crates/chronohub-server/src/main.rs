//! Chronohub Storage Server
//!
//! Runs one storage node: the fast tier on local disk, long-term storage on S3 (or a local
//! directory), and the background write queue, verifier and batch archiver.
//!
//! ## Configuration
//!
//! - `CHRONOHUB_CONFIG`: TOML file with the `[spoke]`, `[s3]`, `[write_queue]`, `[verifier]`,
//!   `[batch]`, `[content]` and `[cluster]` sections (optional, defaults otherwise)
//! - `CHRONOHUB_CHANNELS`: JSON file holding an array of channel configs to serve
//! - `CHRONOHUB_METRICS_ADDR`: Prometheus endpoint bind address (default: 0.0.0.0:9102)
//! - `CHRONOHUB_*`: individual overrides, see `HubConfig::apply_env`
//!
//! ## Example Usage
//! ```bash
//! # Local development
//! export CHRONOHUB_LOCAL_STORAGE_PATH=./data/long-term
//! export CHRONOHUB_CHANNELS=./channels.json
//! cargo run -p chronohub-server
//!
//! # S3
//! export CHRONOHUB_S3_BUCKET=my-hub
//! export CHRONOHUB_S3_REGION=us-west-2
//! cargo run -p chronohub-server --release
//! ```
//!
//! Logging is controlled via `RUST_LOG` (default: info).

use anyhow::Context;
use std::sync::Arc;

use chronohub_cluster::InMemoryLock;
use chronohub_core::ChannelConfig;
use chronohub_storage::{object_store_from_config, HubConfig, InMemoryChannelRegistry, StorageRuntime};

fn load_config() -> anyhow::Result<HubConfig> {
    let mut config = match std::env::var("CHRONOHUB_CONFIG") {
        Ok(path) => HubConfig::from_file(&path).with_context(|| format!("reading config {path}"))?,
        Err(_) => HubConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

fn load_channels() -> anyhow::Result<Arc<InMemoryChannelRegistry>> {
    let registry = Arc::new(InMemoryChannelRegistry::new());
    if let Ok(path) = std::env::var("CHRONOHUB_CHANNELS") {
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("reading channels {path}"))?;
        let channels: Vec<ChannelConfig> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing channels {path}"))?;
        for channel in channels {
            tracing::info!(channel = %channel.name, storage = ?channel.storage, "Serving channel");
            registry.upsert(channel);
        }
    }
    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    chronohub_observability::init();

    let config = load_config()?;
    let channels = load_channels()?;
    let object_store = object_store_from_config(&config.s3)?;

    tracing::info!("Configuration:");
    tracing::info!("  Server id: {}", config.cluster.server_id);
    tracing::info!("  Fast tier: {} ({} min)", config.spoke.write_path.display(), config.spoke.write_ttl_minutes);
    tracing::info!("  Read cache: {} ({} min)", config.spoke.read_path.display(), config.spoke.read_ttl_minutes);
    tracing::info!("  Bucket: {}", config.s3.bucket);
    tracing::info!("  Write queue: {} slots, {} workers", config.write_queue.queue_size, config.write_queue.threads);

    let runtime = Arc::new(StorageRuntime::new(
        config,
        object_store,
        channels,
        Arc::new(InMemoryLock::new()),
    ));
    runtime.start().await?;

    let metrics_addr =
        std::env::var("CHRONOHUB_METRICS_ADDR").unwrap_or_else(|_| "0.0.0.0:9102".to_string());
    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("binding metrics endpoint {metrics_addr}"))?;
    tracing::info!("Metrics available at http://{}/metrics", metrics_addr);

    axum::serve(listener, chronohub_observability::exporter::create_metrics_router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining write queue and stopping background tasks...");
    runtime.shutdown().await;
    tracing::info!("Chronohub server shut down gracefully");

    Ok(())
}
