//! Queue maintenance commands: `dispatch cleanup`, `recover` and `metrics`.

use std::time::Duration;

use anyhow::Result;
use dispatch::config::DispatchConfig;

use super::open_workspace;

pub async fn cmd_cleanup(config: &DispatchConfig, workspace: Option<&str>, days: Option<u32>) -> Result<()> {
    let (workspace, queue) = open_workspace(config, workspace).await?;
    let days = days.unwrap_or(config.orchestrator.retention_days);
    let removed = queue.cleanup_old_jobs(days).await?;
    queue.vacuum().await?;
    println!(
        "Removed {} job(s) older than {} day(s) from workspace '{}'",
        removed, days, workspace.id
    );
    Ok(())
}

pub async fn cmd_recover(
    config: &DispatchConfig,
    workspace: Option<&str>,
    older_than_secs: Option<u64>,
) -> Result<()> {
    let (workspace, queue) = open_workspace(config, workspace).await?;
    let secs = older_than_secs.unwrap_or(config.orchestrator.stale_after_secs);
    let requeued = queue.requeue_stale(Duration::from_secs(secs)).await?;
    println!(
        "Requeued {} stale job(s) in workspace '{}'",
        requeued, workspace.id
    );
    Ok(())
}

pub async fn cmd_metrics(config: &DispatchConfig, workspace: Option<&str>) -> Result<()> {
    let (_, queue) = open_workspace(config, workspace).await?;
    let metrics = queue.get_metrics().await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
