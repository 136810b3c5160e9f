//! Streaming HTTP reverse proxy.
//!
//! Forwards every inbound request to a single HTTP/1.1 backend and relays
//! both bodies chunk by chunk, never buffering a whole payload.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request      ┌──────────┐   ┌────────────┐   ┌────────────┐
//!     ───────────────────▶│   http   │──▶│   proxy    │──▶│    pool    │──────▶ Backend
//!                         │  server  │   │ dispatcher │   │   leases   │
//!     Client Response     └──────────┘   └────────────┘   └────────────┘
//!     ◀────────────────── chunks relayed as they arrive ◀──────────────────────
//!
//!     Cross-cutting: config (TOML + hot reload), observability (tracing,
//!     Prometheus), lifecycle (signals, bounded graceful shutdown)
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use streaming_proxy::config::{load_config, validate_config, ConfigError, ConfigWatcher, ProxyConfig};
use streaming_proxy::http::HttpServer;
use streaming_proxy::lifecycle::{wait_for_signal, Shutdown};
use streaming_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "streaming-proxy")]
#[command(about = "Streaming HTTP reverse proxy", long_about = None)]
struct Cli {
    /// TOML configuration file; watched for backend URL changes.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,

    /// Override `backend.url`.
    #[arg(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Some(backend) = cli.backend {
        config.backend.url = backend;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;

    logging::init(&config.observability);
    tracing::info!("streaming-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backend = %config.backend.url,
        max_connections_per_authority = config.pool.max_connections_per_authority,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(config)?;

    // Keep the watcher handle alive for the lifetime of the server.
    let _watcher = match &cli.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            let upstream = server.upstream().clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    if let Err(e) = upstream.reload(&new_config.backend) {
                        tracing::error!(error = %e, "Rejected reloaded backend URL");
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.trigger();
    });

    server.run(listener, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
