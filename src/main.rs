use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dispatch::config::DispatchConfig;
use dispatch::workspace::WorkspaceId;

mod cmd;

#[derive(Parser)]
#[command(name = "dispatch")]
#[command(version, about = "Webhook-driven job runner with sandboxed agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to dispatch.toml (defaults to DISPATCH_CONFIG, then ./dispatch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Queue backend: file, sqlite or redis. Overrides the config file.
    #[arg(long, global = true)]
    pub queue: Option<String>,

    /// Directory holding workspace directories. Overrides the config file.
    #[arg(long, global = true)]
    pub workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook intake server
    Serve {
        /// Address to bind, e.g. 0.0.0.0:8080
        #[arg(long)]
        bind: Option<String>,

        /// Also run a worker for every enabled workspace in this process
        #[arg(long)]
        with_workers: bool,
    },
    /// Process jobs for one workspace
    Worker {
        /// Workspace id (defaults to the configured default workspace)
        #[arg(short, long)]
        workspace: Option<String>,

        /// Process at most one job and exit
        #[arg(long)]
        once: bool,
    },
    /// Manage workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Delete finished jobs older than the retention window
    Cleanup {
        #[arg(short, long)]
        workspace: Option<String>,

        /// Retention in days (defaults to orchestrator.retention_days)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Return jobs stuck in PROCESSING to PENDING
    Recover {
        #[arg(short, long)]
        workspace: Option<String>,

        /// Claim age threshold (defaults to orchestrator.stale_after_secs)
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
    /// Print queue metrics as JSON
    Metrics {
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorkspaceCommands {
    /// Create (or repair) a workspace
    Init {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List registered workspaces
    List,
    /// Allow requests and workers for a workspace
    Enable { id: String },
    /// Reject requests for a workspace without deleting its data
    Disable { id: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

impl Cli {
    /// Configuration file and environment, then command-line flags.
    fn load_config(&self) -> Result<DispatchConfig> {
        let mut config = DispatchConfig::load(self.config.as_deref())?;
        if let Some(queue) = &self.queue {
            config.queue.provider = queue.parse()?;
        }
        if let Some(root) = &self.workspace_root {
            config.workspaces.root = root.clone();
        }
        Ok(config)
    }

    /// Workers log to a file in their workspace as well as stderr.
    fn log_dir(&self, config: &DispatchConfig) -> Option<PathBuf> {
        match &self.command {
            Commands::Worker { workspace, .. } => {
                let id = workspace.as_deref().unwrap_or(&config.workspaces.default_id);
                // An invalid id fails later with a proper error; log to stderr only.
                let id = WorkspaceId::parse(id).ok()?;
                Some(config.workspaces.root.join(id.as_str()).join("logs"))
            }
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = cli.load_config().context("Failed to load configuration")?;
    let _log_guard =
        dispatch::logging::init(&config.logging, cli.log_dir(&config).as_deref(), cli.verbose)?;

    match &cli.command {
        Commands::Serve { bind, with_workers } => {
            cmd::cmd_serve(config, bind.clone(), *with_workers).await?
        }
        Commands::Worker { workspace, once } => {
            cmd::cmd_worker(&config, workspace.as_deref(), *once).await?
        }
        Commands::Workspace { command } => cmd::cmd_workspace(&config, command.clone()).await?,
        Commands::Cleanup { workspace, days } => {
            cmd::cmd_cleanup(&config, workspace.as_deref(), *days).await?
        }
        Commands::Recover {
            workspace,
            older_than_secs,
        } => cmd::cmd_recover(&config, workspace.as_deref(), *older_than_secs).await?,
        Commands::Metrics { workspace } => cmd::cmd_metrics(&config, workspace.as_deref()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
