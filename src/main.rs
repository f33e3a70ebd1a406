//! Rate-limit-aware webhook proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────────────┐
//!                        │                      WEBHOOK PROXY                        │
//!                        │                                                           │
//!  POST /api/webhooks/…  │  ┌─────────┐    ┌───────────┐  immediate  ┌────────────┐   │
//!  ──────────────────────┼─▶│  http   │───▶│  routing  │────────────▶│ forwarder  │───┼──▶ Upstream
//!                        │  │ server  │    │  router   │             └─────┬──────┘   │    webhook API
//!                        │  └─────────┘    └─────┬─────┘                   │ headers  │
//!                        │                       │ queued                  ▼          │
//!                        │                 ┌─────▼─────┐           ┌────────────┐    │
//!                        │                 │ security  │           │ ratelimit  │    │
//!                        │                 │  guard    │           │  tracker   │    │
//!                        │                 └─────┬─────┘           └─────▲──────┘    │
//!                        │                       ▼                         │          │
//!                        │                 ┌───────────┐  one worker ┌────┴───────┐  │
//!                        │                 │   queue   │────────────▶│   worker   │──┼──▶ Upstream
//!                        │                 │  manager  │ per webhook │ + retries  │  │
//!                        │                 └───────────┘             └────────────┘  │
//!                        │                                                           │
//!                        │  config · observability · lifecycle · admin               │
//!                        └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;

use webhook_proxy::admin::{setup_admin_router, AdminState};
use webhook_proxy::config::loader::load_config;
use webhook_proxy::config::watcher::ConfigWatcher;
use webhook_proxy::config::ProxyConfig;
use webhook_proxy::lifecycle::{signals, Shutdown};
use webhook_proxy::observability::{logging, metrics};
use webhook_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "webhook-proxy", version, about = "Rate-limit-aware webhook proxy")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "WEBHOOK_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if args.check {
        println!("Configuration OK");
        return Ok(());
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "webhook-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.base_url,
        max_backlog = config.limits.max_backlog,
        upstream_timeout_secs = config.upstream.timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher handle must outlive the server.
    let (_watcher, limit_updates) = match &args.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path, config.clone());
            match watcher.run() {
                Ok(handle) => (Some(handle), Some(updates)),
                Err(e) => {
                    tracing::warn!(error = %e, "Config hot reload disabled");
                    (None, None)
                }
            }
        }
        None => (None, None),
    };

    let shutdown = Shutdown::new();
    tokio::spawn(signals::trigger_on_signal(shutdown.clone()));

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(config.clone())?;

    if config.admin.enabled {
        let admin_listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %admin_listener.local_addr()?, "Admin API listening");
        let admin = setup_admin_router(AdminState::new(
            server.queues(),
            server.tracker(),
            &config.admin.api_key,
        ));
        let mut admin_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(admin_listener, admin)
                .with_graceful_shutdown(async move { admin_shutdown.recv().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    server
        .run(listener, limit_updates, shutdown.subscribe())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
