mod accounts;
mod cmd;
mod config;
mod error;
mod managed_file;
mod metadata;
mod network;
mod oslogin;
mod scripts;
mod state;
mod watcher;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use common::ScriptEvent;

#[derive(Debug, Parser)]
#[command(name = "guest-agent")]
#[command(about = "Keeps a cloud VM in sync with its instance metadata", version, author)]
struct Cli {
    /// Configuration file (defaults to agent.toml in the agent data directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch metadata and apply changes (default when no subcommand is given)
    Agent,
    /// Run the scripts of one lifecycle event and exit
    Script {
        /// specialize, startup or shutdown
        #[arg(value_name = "EVENT")]
        event: ScriptEvent,
    },
    /// Reconcile local routes once and exit
    Routes,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command.unwrap_or(Commands::Agent) {
        Commands::Agent => cmd::agent(config, shutdown_signal()).await,
        Commands::Script { event } => cmd::script(config, event, shutdown_signal()).await,
        Commands::Routes => cmd::routes(config).await,
    }
}

/// Resolves on Ctrl+C or SIGTERM. A signal that cannot be listened for is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
