//! switchyardd — the Switchyard daemon.
//!
//! Single binary that assembles the blue/green orchestrator:
//! - State store (redb)
//! - Compute platform + replica set controller
//! - Health gate
//! - Traffic switcher + pipeline sequencer per service
//! - REST API
//!
//! # Usage
//!
//! ```text
//! switchyardd run --config switchyard.toml --data-dir /var/lib/switchyard
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use switchyard_cutover::TrafficSwitcher;
use switchyard_health::{HealthGate, HttpProber};
use switchyard_pipeline::{CommitTaggedBuilder, Orchestrator, PipelineSequencer};
use switchyard_platform::{ComputePlatform, DevPlatform, ReplicaSetController};
use switchyard_state::StateStore;

use crate::config::SwitchyardConfig;

#[derive(Parser)]
#[command(name = "switchyardd", about = "Switchyard blue/green deployment daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to switchyard.toml.
        #[arg(long, default_value = "switchyard.toml")]
        config: PathBuf,

        /// Override the API port from the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Override the data directory from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,switchyardd=debug,switchyard=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => run(config, port, data_dir).await,
    }
}

async fn run(
    config_path: PathBuf,
    port_override: Option<u16>,
    data_dir_override: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("Switchyard daemon starting");

    let config = SwitchyardConfig::from_file(&config_path)?;
    let port = port_override.unwrap_or(config.daemon.port);
    let data_dir = data_dir_override.unwrap_or_else(|| PathBuf::from(&config.daemon.data_dir));

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("switchyard.redb");

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // In-process platform. Replica sets are simulated; the pipeline,
    // routing state machine, and health gating run for real.
    let platform: Arc<dyn ComputePlatform> = Arc::new(DevPlatform::new());
    info!("dev compute platform initialized");

    let mut orchestrator = Orchestrator::new(store.clone());
    for section in &config.services {
        let service_config = section.to_service_config();
        let controller = ReplicaSetController::new(platform.clone(), store.clone());
        let switcher = TrafficSwitcher::new(
            &service_config.name,
            store.clone(),
            controller,
            platform.clone(),
        );
        let gate = HealthGate::new(Arc::new(HttpProber));
        let builder = Arc::new(CommitTaggedBuilder::new(&section.image_repository));

        info!(
            service = %service_config.name,
            instances = service_config.instance_count,
            entry_point = %service_config.entry_point,
            "service configured"
        );
        orchestrator.register(PipelineSequencer::new(
            service_config,
            store.clone(),
            switcher,
            gate,
            orchestrator.approval_gate().clone(),
            builder,
        ));
    }
    let orchestrator = Arc::new(orchestrator);

    // Close out anything a previous process left in flight before the
    // API starts accepting triggers.
    orchestrator.resume_incomplete().await?;

    let router = switchyard_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    info!("Switchyard daemon stopped");
    Ok(())
}
