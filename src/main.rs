//! Catnip supervisor entry point.
//!
//! A thin composition layer: parse flags, initialize logging, wire the
//! supervisor, and run until interrupted. The HTTP/RPC façade attaches to
//! the same supervisor object out of tree.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use catnip::config::SupervisorConfig;
use catnip::subprocess::SubprocessManager;
use catnip::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "catnip", version, about = "Per-workspace agent supervisor")]
struct Cli {
    /// Directory holding persistent state.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Directory new worktrees are created under.
    #[arg(long)]
    worktree_dir: Option<PathBuf>,

    /// Automatically commit dirty agent work when a session goes quiet.
    #[arg(long)]
    auto_commit: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("catnip={default_level}"))),
        )
        .init();

    let mut config = SupervisorConfig::default();
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }
    if let Some(worktree_dir) = cli.worktree_dir {
        config.worktree_base_dir = worktree_dir;
    }
    config.auto_commit = cli.auto_commit;

    let supervisor = match Supervisor::new(config, SubprocessManager::production()) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("failed to initialize supervisor: {e}");
            std::process::exit(1);
        }
    };

    match supervisor.run().await {
        Ok(report) => info!(
            "restore complete: {} restored, {} skipped, {} failed",
            report.restored, report.skipped, report.failed
        ),
        Err(e) => {
            error!("supervisor failed to start: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handling failed: {e}");
    }
    info!("shutting down");
    supervisor.shutdown().await;
}
