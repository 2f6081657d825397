//! Workspace management commands: `dispatch workspace`.

use anyhow::Result;
use dispatch::config::DispatchConfig;

use super::super::WorkspaceCommands;
use super::workspace_service;

pub async fn cmd_workspace(config: &DispatchConfig, command: WorkspaceCommands) -> Result<()> {
    let service = workspace_service(config).await?;
    match command {
        WorkspaceCommands::Init {
            id,
            name,
            description,
        } => {
            let workspace = service
                .provision(&id, name.as_deref(), description.as_deref())
                .await?;
            println!("Workspace '{}' ready at {}", workspace.id, workspace.dir.display());
        }
        WorkspaceCommands::List => {
            let records = service.list().await?;
            if records.is_empty() {
                println!("No workspaces registered.");
                return Ok(());
            }
            println!("{:<24} {:<8} {:<24} CREATED", "ID", "ENABLED", "NAME");
            for record in records {
                println!(
                    "{:<24} {:<8} {:<24} {}",
                    record.id,
                    if record.enabled { "yes" } else { "no" },
                    record.name,
                    record.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        WorkspaceCommands::Enable { id } => {
            service.set_enabled(&id, true).await?;
            println!("Workspace '{}' enabled", id);
        }
        WorkspaceCommands::Disable { id } => {
            service.set_enabled(&id, false).await?;
            println!("Workspace '{}' disabled", id);
        }
    }
    Ok(())
}
