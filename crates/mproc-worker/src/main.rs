//! Media processing worker binary.

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mproc_media::{check_ffmpeg, check_ffprobe};
use mproc_queue::{transport_from_config, QueueConfig};
use mproc_storage::store_from_env;
use mproc_worker::{JobExecutor, WorkerConfig};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Worker failed: {:#}", e);
        std::process::exit(1);
    }
    info!("Worker shutdown complete");
}

async fn run() -> anyhow::Result<()> {
    // Install rustls crypto provider (required for TLS)
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting mproc-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    for warning in config.upload.validate().context("invalid upload config")? {
        warn!("{}", warning);
    }

    if let Some(port) = config.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics exporter")?;
        info!("Metrics exporter listening on {}", addr);
    }

    if let Err(e) = check_ffmpeg() {
        warn!("ffmpeg unavailable, video jobs will fail: {}", e);
    }
    if let Err(e) = check_ffprobe() {
        warn!("ffprobe unavailable, video jobs will fail: {}", e);
    }

    let store = store_from_env().context("failed to create object store")?;
    let queue_config = QueueConfig::from_env().context("invalid queue config")?;
    let batch_size = queue_config.batch_size;
    let transport = transport_from_config(queue_config).context("failed to create queue transport")?;

    let executor = JobExecutor::new(config, store, transport).with_batch_size(batch_size);

    let shutdown = executor.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.cancel();
    });

    executor.run().await.context("executor error")?;
    Ok(())
}

/// Colored output for dev, JSON when `LOG_FORMAT=json`.
fn init_tracing() -> anyhow::Result<()> {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("mproc=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
    Ok(())
}
