//! Job worker command: `dispatch worker`.

use std::sync::Arc;

use anyhow::Result;
use dispatch::config::DispatchConfig;
use dispatch::orchestrator::JobOrchestrator;
use tokio_util::sync::CancellationToken;

use super::open_workspace;

pub async fn cmd_worker(config: &DispatchConfig, workspace: Option<&str>, once: bool) -> Result<()> {
    let (workspace, queue) = open_workspace(config, workspace).await?;
    let events = dispatch::server::event_bus(config)?;
    let orchestrator = JobOrchestrator::from_config(workspace, config, queue, events)?;
    let cancel = CancellationToken::new();

    if once {
        match orchestrator.run_once(&cancel).await? {
            Some(status) => println!("Job finished: {}", status),
            None => println!("No pending jobs"),
        }
        return Ok(());
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        dispatch::server::shutdown_signal().await;
        shutdown.cancel();
    });

    // A queue backend failure ends the process so a supervisor can restart it.
    let summary = Arc::new(orchestrator).run(cancel).await?;
    println!(
        "Processed {} job(s): {} completed, {} failed, {} timed out",
        summary.processed(),
        summary.completed,
        summary.failed,
        summary.timed_out
    );
    Ok(())
}
