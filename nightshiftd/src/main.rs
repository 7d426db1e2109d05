mod config;
mod events;
mod http;
mod pool;
mod provision;
mod run;
#[cfg(test)]
mod testutil;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use machine::{AgentDescriptor, VmLauncher};
use machine_fc::{HostConfig, NetworkAllocator};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::events::EventBuffer;
use crate::http::AppState;
use crate::pool::VmPool;
use crate::provision::FirecrackerLauncher;
use crate::run::LogCompletion;

#[derive(Parser)]
#[command(name = "nightshiftd", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the control plane and serve the run API
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Path to the configuration file
    #[arg(long, default_value = "/etc/nightshift/nightshiftd.yaml")]
    config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Host(#[from] machine::VmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "nightshiftd exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), ServeError> {
    let config = config::load(&args.config).await?;

    let host = HostConfig {
        firecracker_bin: config.firecracker.binary.clone(),
        kernel_path: config.firecracker.kernel.clone(),
        base_image_path: config.firecracker.rootfs.clone(),
        base_dir: config.base_dir.clone(),
    };
    machine_fc::check_host(&host).await?;

    // Sweep leftovers from an unclean shutdown before the first allocation,
    // or fresh leases could collide with stale devices.
    let allocator = Arc::new(NetworkAllocator::new());
    allocator.cleanup_stale().await;

    let launcher: Arc<dyn VmLauncher> =
        Arc::new(FirecrackerLauncher::new(host, Arc::clone(&allocator)));
    let pool = VmPool::new(
        launcher,
        config.pool.idle_timeout(),
        config.pool.default_max_vms,
    );

    let agents: HashMap<String, AgentDescriptor> = config
        .agents
        .iter()
        .map(|agent| (agent.id.clone(), agent.to_descriptor()))
        .collect();
    info!(agents = agents.len(), "agent catalog loaded");

    let state = AppState {
        pool: Arc::clone(&pool),
        buffer: Arc::new(EventBuffer::new()),
        agents: Arc::new(agents),
        hook: Arc::new(LogCompletion),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "nightshiftd listening");
    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the pool last so stateful agents get their workspaces written
    // back before the process exits.
    pool.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received");
}
