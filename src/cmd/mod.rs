//! CLI command implementations.
//!
//! | Module        | Commands handled                     |
//! |---------------|--------------------------------------|
//! | `serve`       | `Serve`                              |
//! | `worker`      | `Worker`                             |
//! | `workspace`   | `Workspace`                          |
//! | `maintenance` | `Cleanup`, `Recover`, `Metrics`      |
//! | `config`      | `Config`                             |

pub mod config;
pub mod maintenance;
pub mod serve;
pub mod worker;
pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use dispatch::config::DispatchConfig;
use dispatch::queue::{self, JobQueue};
use dispatch::workspace::{Workspace, WorkspaceService};

pub use config::cmd_config;
pub use maintenance::{cmd_cleanup, cmd_metrics, cmd_recover};
pub use serve::cmd_serve;
pub use worker::cmd_worker;
pub use workspace::cmd_workspace;

/// Open the workspace service with the default workspace provisioned.
async fn workspace_service(config: &DispatchConfig) -> Result<WorkspaceService> {
    let service = WorkspaceService::open(config).context("Failed to open workspaces")?;
    service
        .bootstrap()
        .await
        .context("Failed to bootstrap workspaces")?;
    Ok(service)
}

/// Resolve a workspace (or the default) and open its queue.
async fn open_workspace(
    config: &DispatchConfig,
    id: Option<&str>,
) -> Result<(Workspace, Arc<dyn JobQueue>)> {
    let service = workspace_service(config).await?;
    let id = id.unwrap_or(service.default_id()).to_string();
    let workspace = service
        .resolve(&id)
        .await
        .with_context(|| format!("Unknown or disabled workspace '{}'", id))?;
    let queue = queue::open(&config.queue, &workspace.data_dir(), workspace.id.as_str())
        .await
        .with_context(|| format!("Failed to open queue for workspace '{}'", id))?;
    Ok((workspace, queue))
}
