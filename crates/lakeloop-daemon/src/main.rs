//! lakeloop - local development loop for a lakehouse data platform

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lakeloop_core::config::{ConfigOverrides, resolve_config};
use lakeloop_daemon::daemon::{ControlPlaneOwner, LocalDriver, Orchestrator};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// lakeloop - local development loop for a lakehouse data platform
#[derive(Parser, Debug)]
#[command(name = "lakeloop")]
#[command(about = "Watches your data directories and keeps the stack in sync")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to lakeloop.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Watched data root (default: <project>/data)
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Local port for the API (default: 8000)
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Stack name (default: dev)
    #[arg(long, value_name = "NAME")]
    stack: Option<String>,

    /// Skip the initial stack materialization
    #[arg(long)]
    skip_provision: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the development loop: watcher, control plane and local API
    Dev,
    /// Materialize the stack and register existing data directories
    Up,
    /// Show data directories not yet registered with the stack
    Preview,
    /// Re-read provisioned stack state
    Refresh,
    /// Tear down every provisioned resource
    Destroy,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    lakeloop_core::logging::init(args.verbose);

    let current_dir = std::env::current_dir().context("Failed to get current directory")?;

    let overrides = ConfigOverrides {
        config_path: args.config.clone(),
        data_dir: args.data_dir.clone(),
        port: args.port,
        stack: args.stack.clone(),
    };
    let config = resolve_config(&overrides, &current_dir).context("Failed to resolve configuration")?;

    info!(
        "Project {} (stack {}), data root: {}",
        config.project_name,
        config.stack_name,
        config.data_dir.display()
    );

    let driver = LocalDriver::new(&config).context("Failed to initialize infra driver")?;

    match args.command.unwrap_or(Command::Dev) {
        Command::Dev => {
            let cancel = CancellationToken::new();
            install_signal_handlers(cancel.clone());

            let orchestrator = Orchestrator::new(config, args.skip_provision);
            orchestrator
                .run(Box::new(driver), cancel)
                .await
                .context("Development loop failed")?;

            info!("lakeloop shutdown complete");
        }
        Command::Up => {
            let mut owner = ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone());
            owner.materialize().context("Stack materialization failed")?;
            let outputs = owner.stack_outputs();
            info!(
                "Stack {} up: {} resource(s), {} table(s)",
                outputs.stack_name,
                outputs.resources.len(),
                outputs.tables.len()
            );
        }
        Command::Preview => {
            let owner = ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone());
            let pending = owner.pending_resources().context("Preview failed")?;
            if pending.is_empty() {
                info!("Stack is in sync with the data directory");
            } else {
                for name in pending {
                    info!("Would register resource: {name}");
                }
            }
        }
        Command::Refresh => {
            let mut owner = ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone());
            owner.refresh().context("Stack refresh failed")?;
            info!(
                "Refreshed stack: {} resource(s)",
                owner.stack_outputs().resources.len()
            );
        }
        Command::Destroy => {
            let mut owner = ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone());
            owner.destroy().context("Stack destroy failed")?;
            info!("Stack destroyed");
        }
    }

    Ok(())
}

/// Map SIGINT/SIGTERM to cancellation of the shared token.
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to create SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C)");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.expect("Failed to listen for Ctrl+C");
            info!("Received Ctrl+C");
        }

        cancel.cancel();
    });
}
