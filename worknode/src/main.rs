mod config;
mod mcp;
mod permission;
mod session;
mod workspace;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::mcp::ToolServerManager;
use crate::permission::Checker;
use crate::session::{Outbound, SessionClient, TaskHandler};
use crate::workspace::Workspace;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long graceful shutdown waits for in-flight tasks before cancelling
/// them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period after cancelling stragglers.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "worknode", version = VERSION, about = "Execute workspace operations on behalf of the control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the control plane and start processing tasks.
    Run {
        /// Authentication token (env: WORKNODE_TOKEN).
        #[arg(long)]
        token: Option<String>,
        /// WebSocket endpoint URL (env: WORKNODE_URL).
        #[arg(long)]
        url: Option<String>,
        /// Workspace root directory (env: WORKNODE_WORKSPACE).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Path to config file (TOML, default: ~/.worknode/config.toml).
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Log level: debug, info, warn, error (env: WORKNODE_LOG_LEVEL).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Print version information.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("worknode {}", VERSION);
            Ok(())
        }
        Commands::Run {
            token,
            url,
            workspace,
            config,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(token) = token {
                config.token = token;
            }
            if let Some(url) = url {
                config.url = url;
            }
            if let Some(workspace) = workspace {
                config.workspace_root = workspace;
            }
            if let Some(log_level) = log_level {
                config.log.level = log_level;
            }
            config.validate()?;

            init_logging(&config.log);
            run(config).await
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        version = VERSION,
        workspace = %config.workspace_root.display(),
        "starting worknode"
    );

    let checker = Checker::new(&config.permission.bash);
    let servers = Arc::new(ToolServerManager::new());
    let workspace = Arc::new(
        Workspace::with_tool_servers(&config.workspace_root, checker, servers.clone())
            .context("failed to create workspace")?,
    );
    info!(root = %workspace.root().display(), "workspace initialized");

    // The handler and the client both hold the outbound handle; neither
    // needs a pointer to the other.
    let outbound = Outbound::new();
    let handler = TaskHandler::new(workspace.clone(), outbound.clone());
    let client = Arc::new(SessionClient::new(
        &config.token,
        &config.url,
        workspace.root(),
        VERSION,
        handler.clone(),
        outbound,
    ));

    spawn_shutdown_handler(client.clone(), handler, servers);

    match client.run_with_reconnect().await {
        Ok(()) => {
            info!("worknode stopped gracefully");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// On SIGINT/SIGTERM: stop accepting new tasks, drain in-flight ones (up
/// to [`DRAIN_TIMEOUT`]), cancel stragglers, then close the session.
fn spawn_shutdown_handler(
    client: Arc<SessionClient>,
    handler: Arc<TaskHandler>,
    servers: Arc<ToolServerManager>,
) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received signal, initiating graceful shutdown");

        client.begin_drain();

        let running = handler.running_task_count();
        if running > 0 {
            info!(count = running, "waiting for running tasks to complete");
            if handler.wait_for_tasks(DRAIN_TIMEOUT).await {
                info!("all tasks completed");
            } else {
                warn!("task wait timeout, cancelling remaining tasks");
                handler.cancel_all_tasks();
                handler.wait_for_tasks(CANCEL_GRACE).await;
            }
        }

        servers.close().await;
        client.close();
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(log: &config::LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log.level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);

    if log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
