//! Music worker (vcmw-worker) - Main entry point
//!
//! Loads configuration, recovers tasks interrupted by a previous run, then
//! runs the poll loop and the HTTP control surface until shutdown or a
//! Task Store failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vcmw_common::config::{load_config, CONFIG_ENV_VAR};
use vcmw_common::{DestinationId, TaskStore};
use vcmw_worker::api;
use vcmw_worker::collaborators::{bridge, BridgeClient, YtDlpFetcher};
use vcmw_worker::config::{default_filter, ConfigOverrides};
use vcmw_worker::{notify, Collaborators, Orchestrator};

/// How long stopped pipelines get to record their final status
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Command-line arguments for vcmw-worker
#[derive(Parser, Debug)]
#[command(name = "vcmw-worker")]
#[command(about = "Voice-chat music worker")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "VCMW_PORT")]
    port: Option<u16>,

    /// Shared task database
    #[arg(long, env = "VCMW_DATABASE")]
    database: Option<PathBuf>,

    /// Base URL of the chat/voice bridge
    #[arg(long, env = "VCMW_BRIDGE_URL")]
    bridge_url: Option<String>,

    /// Chat that receives operational messages
    #[arg(long, env = "VCMW_LOG_CHAT_ID", allow_hyphen_values = true)]
    log_chat_id: Option<i64>,

    /// Log level or filter directive (RUST_LOG wins when set)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file_config = load_config(args.config.as_deref(), CONFIG_ENV_VAR)
        .context("Failed to load configuration")?;
    let config = ConfigOverrides {
        port: args.port,
        database_path: args.database,
        bridge_url: args.bridge_url,
        log_chat_id: args.log_chat_id,
        log_level: args.log_level,
    }
    .apply(file_config)
    .context("Invalid configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(&config.logging.level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting VCMW music worker v{} on port {}", env!("CARGO_PKG_VERSION"), config.port);
    info!("Task database: {}", config.database_path.display());
    info!("Bridge: {}", config.bridge_url);

    let store = TaskStore::open(&config.database_path)
        .await
        .context("Failed to open task database")?;

    let recovered = store
        .recover_interrupted()
        .await
        .context("Failed to recover interrupted tasks")?;
    if recovered > 0 {
        warn!("Marked {} task(s) interrupted by the previous run as error", recovered);
    }

    let bridge = Arc::new(BridgeClient::new(&config.bridge_url).context("Failed to build bridge client")?);
    if !bridge::probe(&bridge, Duration::from_secs(2)).await {
        warn!("Bridge at {} is not answering yet; tasks will fail until it does", config.bridge_url);
    }

    let fetcher = YtDlpFetcher::new(config.fetcher.clone());
    let cookies_found = fetcher.cookies_available();
    info!(
        "Downloads: {} (cookies {})",
        fetcher.download_dir().display(),
        if cookies_found { "found" } else { "not found" }
    );

    let orchestrator = Orchestrator::new(
        store,
        Collaborators {
            chat: bridge.clone(),
            voice: bridge,
            fetcher: Arc::new(fetcher),
        },
        config.worker.clone(),
        config.log_chat_id.map(DestinationId),
    );

    orchestrator
        .notifier()
        .log(&notify::startup(env!("CARGO_PKG_VERSION"), cookies_found))
        .await;

    let poll_loop = tokio::spawn(Arc::clone(&orchestrator).run());

    // Build the application router
    let app = api::create_router(api::AppState::new(Arc::clone(&orchestrator), config.port));
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let shutdown = orchestrator.shutdown_token();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        tokio::select! {
            _ = shutdown_signal() => {}
            _ = shutdown.cancelled() => {}
        }
    });

    let server_result = server.await;

    // Server is down: either a signal arrived or the poll loop halted
    orchestrator.stop_all();
    let loop_result = poll_loop.await.context("Poll loop panicked")?;
    orchestrator.drain(SHUTDOWN_GRACE).await;

    if let Err(e) = loop_result {
        error!("Worker halted: {}", e);
        orchestrator.notifier().log(&notify::fatal(&e)).await;
        return Err(e).context("Task Store failure");
    }
    server_result.context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
