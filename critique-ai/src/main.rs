//! critique-ai - design review analysis service
//!
//! Accepts analysis jobs over HTTP, runs them through the stage pipeline on
//! an in-process worker pool, and streams progress over SSE.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use critique_ai::config::TomlConfig;
use critique_ai::services::{PipelineContext, StageOrchestrator};
use critique_ai::{db, providers, AppState};
use critique_common::events::EventBus;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "critique-ai";

/// Sweep for abandoned stages and purge old events on this cadence
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Command-line arguments for critique-ai
#[derive(Parser, Debug)]
#[command(name = "critique-ai")]
#[command(about = "Design review analysis pipeline service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the TOML value)
    #[arg(short, long, env = "CRITIQUE_AI_PORT")]
    port: Option<u16>,

    /// Root folder holding the database
    #[arg(short, long, env = "CRITIQUE_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML config (default: ~/.config/critique/critique-ai.toml)
    #[arg(short, long, env = "CRITIQUE_AI_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config.clone() {
        Some(path) => path,
        None => critique_common::config::default_config_path(SERVICE_NAME)?,
    };
    let config = TomlConfig::load(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    // RUST_LOG wins over the TOML level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config_path.display());

    let root_folder = critique_common::config::resolve_root_folder(
        args.root_folder.as_deref(),
        "CRITIQUE_ROOT_FOLDER",
        config.root_folder.as_deref(),
    );
    std::fs::create_dir_all(&root_folder)
        .with_context(|| format!("Failed to create root folder {}", root_folder.display()))?;
    let db_path = root_folder.join(db::DB_FILE_NAME);
    info!("Database: {}", db_path.display());

    let db_pool = db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    let gateway = providers::gateway_from_config(&db_pool, &config)
        .await
        .context("Failed to configure providers")?;
    let event_bus = EventBus::new(config.pipeline.event_bus_capacity);

    let shutdown = CancellationToken::new();
    let (orchestrator, workers) = critique_ai::start_pipeline(
        PipelineContext {
            db: db_pool.clone(),
            event_bus: event_bus.clone(),
            gateway: Arc::new(gateway),
            pipeline: config.pipeline.clone(),
            scoring: config.scoring.clone(),
        },
        shutdown.clone(),
    );

    // Anything mid-stage at boot was abandoned by the previous process
    match orchestrator.resume_abandoned(Duration::ZERO).await {
        Ok(resumed) => info!(count = resumed.len(), "Startup resume complete"),
        Err(e) => error!("Startup resume failed: {}", e),
    }
    let maintenance = tokio::spawn(maintenance_loop(
        Arc::clone(&orchestrator),
        shutdown.clone(),
    ));

    let state = AppState::new(db_pool, event_bus, orchestrator);
    let app = critique_ai::build_router(state);

    let port = args.port.unwrap_or(config.port);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    workers.shutdown().await;
    if let Err(e) = maintenance.await {
        error!("Maintenance task panicked: {}", e);
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Periodic abandoned-stage sweep and event purge
async fn maintenance_loop(orchestrator: Arc<StageOrchestrator>, shutdown: CancellationToken) {
    let mut sweep = tokio::time::interval(MAINTENANCE_INTERVAL);
    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    // Both intervals fire immediately; startup already resumed
    sweep.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sweep.tick() => {
                let stale_after = orchestrator.config().stale_stage_after();
                if let Err(e) = orchestrator.resume_abandoned(stale_after).await {
                    error!("Abandoned stage sweep failed: {}", e);
                }
            }
            _ = purge.tick() => {
                if let Err(e) = orchestrator.purge_events(None).await {
                    error!("Event purge failed: {}", e);
                }
            }
        }
    }
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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
