//! mtag-tagger - image tagging submission service
//!
//! Accepts items over HTTP, batches them toward the remote inference
//! service, and tracks asynchronous jobs until they complete.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mtag_common::events::EventBus;
use mtag_tagger::config::TomlConfig;
use mtag_tagger::invoker::{HttpTagService, TagService};
use mtag_tagger::poller::CompletionPoller;
use mtag_tagger::scheduler::TagScheduler;
use mtag_tagger::store::{init_database_pool, ItemStore, SqliteItemStore};
use mtag_tagger::AppState;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "mtag-tagger")]
#[command(about = "Image tagging submission scheduler", long_about = None)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "MTAG_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the config file)
    #[arg(short, long, env = "MTAG_DATABASE")]
    database: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(short, long, env = "MTAG_BIND")]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        TomlConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = args.database {
        config.database_path = Some(database);
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    // RUST_LOG wins over the config file level
    let default_filter = format!(
        "mtag_tagger={level},mtag_common={level},tower_http=info",
        level = config.logging.level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mtag-tagger");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Missing endpoint or API key is fatal here
    let service: Arc<dyn TagService> = Arc::new(
        HttpTagService::new(&config.service)
            .context("Failed to configure inference service client")?,
    );

    let db_path = config.database_path();
    info!("Database: {}", db_path.display());
    let pool = init_database_pool(&db_path)
        .await
        .context("Failed to open item store")?;
    let store: Arc<dyn ItemStore> = Arc::new(SqliteItemStore::new(pool));

    let event_bus = EventBus::new(256);

    let poller = CompletionPoller::new(
        service.clone(),
        store.clone(),
        event_bus.clone(),
        &config.poller,
    );
    match poller.recover().await {
        Ok(0) => {}
        Ok(jobs) => info!(jobs, "Resumed polling for outstanding jobs"),
        Err(e) => warn!(error = %e, "Failed to recover outstanding jobs"),
    }

    let scheduler = TagScheduler::new(
        service,
        store.clone(),
        poller,
        event_bus.clone(),
        &config.scheduler,
        &config.retry,
    );

    let app = mtag_tagger::build_router(AppState::new(scheduler, store, event_bus));

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_address))?;
    info!("Listening on http://{}", config.bind_address);
    info!("Health check: http://{}/health", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
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
