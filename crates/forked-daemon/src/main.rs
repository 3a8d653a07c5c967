//! # forked-daemon
//!
//! The Forked daemon binary — wires the store, engines, and listeners
//! together and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use forked_gateway::GatewayClient;
use forked_identity::Identity;
use forked_runtime::{
    spawn_reaper, spawn_sweeper, ForkEngine, ForkRegistry, IngestPipeline, LineageTracker,
    RewindEngine, DEFAULT_PROMOTION_THRESHOLD,
};
use forked_server::{ApiState, IngestState, ShutdownCoordinator};
use forked_settings::{load_settings, state_dir};
use forked_store::TraceStore;

/// Forked — time-travel debugger daemon for LLM agent hosts.
#[derive(Parser, Debug)]
#[command(name = "forked", about = "Forked trace daemon")]
struct Cli {
    /// Bind address for the tracer push channel.
    #[arg(long, default_value = forked_server::DEFAULT_INGEST_ADDR)]
    ingest_addr: String,

    /// Bind address for the HTTP API.
    #[arg(long, default_value = forked_server::DEFAULT_API_ADDR)]
    api_addr: String,

    /// Path to the trace database (default `~/.forked/trace.db`).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Fork promotion heuristic: a run with at most this many recorded
    /// events may be adopted into a session's explicit fork head.
    #[arg(long, default_value_t = DEFAULT_PROMOTION_THRESHOLD)]
    promotion_threshold: i64,

    /// Minimum log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Initialize the global tracing subscriber with stderr output.
fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();
    let _ = subscriber.try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_subscriber(&cli.log_level);

    let settings = Arc::new(load_settings());
    info!(
        gateway = %settings.gateway_url,
        retention = ?settings.retention,
        channels = settings.configured_channels.len(),
        "settings loaded"
    );
    if let Some(error) = &settings.host_config_error {
        warn!(%error, "host config unavailable, running with defaults");
    }

    let state_dir = state_dir();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;

    let db_path = cli
        .db_path
        .unwrap_or_else(|| state_dir.join("trace.db"));
    let store = Arc::new(
        TraceStore::open(&db_path.to_string_lossy())
            .with_context(|| format!("failed to open store at {}", db_path.display()))?,
    );
    info!(db = %db_path.display(), "store opened");

    let identity = Arc::new(
        Identity::load_or_generate(&state_dir.join("identity.json"))
            .context("failed to load device identity")?,
    );
    info!(device_id = identity.device_id(), "identity ready");

    let lineage = Arc::new(LineageTracker::new(cli.promotion_threshold));
    if let Err(e) = lineage.hydrate_from(&store) {
        warn!(error = %e, "lineage hydration failed, starting empty");
    }

    let registry = Arc::new(ForkRegistry::new());
    let rewind = Arc::new(RewindEngine::new(store.clone()));
    let gateway = Arc::new(GatewayClient::new(
        settings.gateway_url.clone(),
        settings.gateway_token.clone(),
        identity,
    ));
    let fork = Arc::new(ForkEngine::new(
        store.clone(),
        lineage.clone(),
        registry.clone(),
        rewind.clone(),
        gateway,
        settings.clone(),
    ));

    let coordinator = ShutdownCoordinator::new();

    // Ingest pipeline worker.
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        lineage.clone(),
        registry.clone(),
    ));
    let (frame_tx, pipeline_handle) = pipeline.spawn(coordinator.token());
    coordinator.register_task(pipeline_handle);

    // Tracer push channel.
    let ingest_state = IngestState::new(frame_tx);
    let (_ingest_addr, ingest_handle) =
        forked_server::ingest_ws::serve(ingest_state, &cli.ingest_addr, coordinator.token())
            .await
            .with_context(|| format!("failed to bind ingest channel on {}", cli.ingest_addr))?;
    coordinator.register_task(ingest_handle);

    // HTTP API.
    let api_state = ApiState {
        store: store.clone(),
        lineage,
        rewind,
        fork,
        settings: settings.clone(),
        start_time: Instant::now(),
    };
    let (_api_addr, api_handle) =
        forked_server::api::serve(api_state, &cli.api_addr, coordinator.token())
            .await
            .with_context(|| format!("failed to bind api on {}", cli.api_addr))?;
    coordinator.register_task(api_handle);

    // Periodic maintenance.
    coordinator.register_task(spawn_sweeper(
        store,
        settings.retention,
        coordinator.token(),
    ));
    coordinator.register_task(spawn_reaper(registry, coordinator.token()));

    wait_for_signal().await;
    info!("shutting down");
    coordinator.graceful_shutdown(None).await;
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
