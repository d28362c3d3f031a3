//! sourcegridd: the SourceGrid daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Worker membership and dead-node reaper
//! - Orchestrator with its reconcile loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! sourcegridd run --config /etc/sourcegrid/sourcegrid.toml --port 8080
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sourcegrid_api::{ApiState, build_router};
use sourcegrid_cluster::MembershipManager;
use sourcegrid_dispatch::HttpTransport;
use sourcegrid_orchestrator::{Orchestrator, StaticCatalog};
use sourcegrid_state::StateStore;

use crate::config::DaemonConfig;

const DEFAULT_FILTER: &str = "info,sourcegridd=debug,sourcegrid=debug";

#[derive(Parser)]
#[command(name = "sourcegridd", about = "SourceGrid control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Run {
        /// Path to the TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on. Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state. Overrides `server.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log as JSON lines.
        #[arg(long)]
        json_logs: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            json_logs,
        } => {
            let mut config = DaemonConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            config.server.json_logs |= json_logs;

            init_tracing(config.server.json_logs);
            run(config).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!("SourceGrid daemon starting");

    // ── State store ────────────────────────────────────────────
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("sourcegrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Cluster membership ─────────────────────────────────────
    let membership = MembershipManager::new(store.clone())
        .with_heartbeat_interval(config.heartbeat_interval()?)
        .with_dead_timeout(config.dead_timeout()?);
    info!(
        heartbeat_interval_secs = membership.heartbeat_interval_secs(),
        "membership manager initialized"
    );

    // ── Orchestrator ───────────────────────────────────────────
    let catalog = StaticCatalog::new(config.connectors.clone());
    info!(types = config.connectors.len(), "connector catalog loaded");

    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        store,
        Arc::new(HttpTransport::new()),
        Arc::new(membership.clone()),
        Arc::new(catalog),
        config.orchestrator_config()?,
    )
    .with_shutdown(shutdown.child_token());
    info!("orchestrator initialized");

    // ── Background tasks ───────────────────────────────────────
    let reconciler = orchestrator.clone();
    let reconcile_interval = config.reconcile_interval()?;
    let reconcile_shutdown = shutdown.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(reconcile_interval, reconcile_shutdown).await;
    });

    let reaper = membership.clone();
    let reap_interval = config.reap_interval()?;
    let reaper_shutdown = shutdown.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper.run_reaper(reap_interval, reaper_shutdown).await;
    });

    // ── REST API server ────────────────────────────────────────
    let router = build_router(ApiState {
        orchestrator,
        membership,
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            signal.cancel();
        })
        .await?;

    // In-flight work observes the token; wait for the loops to wind down.
    shutdown.cancel();
    let _ = reconcile_handle.await;
    let _ = reaper_handle.await;

    info!("SourceGrid daemon stopped");
    Ok(())
}

async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
