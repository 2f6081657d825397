use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{self, AppState, SharedState};
use crate::board::{BoardListMapping, BoardNotifier};
use crate::config::DispatchConfig;
use crate::events::{EventBus, LoggingObserver};
use crate::orchestrator::JobOrchestrator;
use crate::workspace::{QueueRegistry, WorkspaceService};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    let cors = state.config.server.cors_permissive;
    let mut app = api::api_router(&state)
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Event bus with the log observer and, when configured, the board notifier.
pub fn event_bus(config: &DispatchConfig) -> Result<EventBus> {
    let mut events = EventBus::new().with_observer(Arc::new(LoggingObserver));
    if let Some(notifier) = BoardNotifier::from_config(&config.board)? {
        events = events.with_observer(Arc::new(notifier));
    }
    Ok(events)
}

/// Provision workspaces and assemble the shared state.
pub async fn build_state(config: DispatchConfig) -> Result<SharedState> {
    let workspaces = Arc::new(WorkspaceService::open(&config).context("Failed to open workspaces")?);
    workspaces
        .bootstrap()
        .await
        .context("Failed to bootstrap workspaces")?;
    Ok(Arc::new(AppState {
        queues: Arc::new(QueueRegistry::new(config.queue.clone())),
        events: event_bus(&config)?,
        board: BoardListMapping::from_config(&config.board),
        workspaces,
        config,
    }))
}

/// Start one orchestrator per enabled workspace inside the server process.
async fn spawn_workers(
    state: &SharedState,
    cancel: &CancellationToken,
    workers: &mut JoinSet<(String, Result<(), String>)>,
) -> Result<()> {
    for record in state.workspaces.list().await?.into_iter().filter(|r| r.enabled) {
        let workspace = state.workspaces.resolve(&record.id).await?;
        let queue = state.queues.get(&workspace).await?;
        let orchestrator = Arc::new(JobOrchestrator::from_config(
            workspace,
            &state.config,
            queue,
            state.events.clone(),
        )?);
        let token = cancel.clone();
        workers.spawn(async move {
            let result = orchestrator.run(token).await.map(|_| ()).map_err(|e| e.to_string());
            (record.id, result)
        });
    }
    Ok(())
}

/// Start the intake server, optionally with in-process workers.
pub async fn start_server(config: DispatchConfig, with_workers: bool) -> Result<()> {
    let bind = config.server.bind.clone();
    let state = build_state(config).await?;
    let cancel = CancellationToken::new();

    let mut workers = JoinSet::new();
    if with_workers {
        spawn_workers(&state, &cancel, &mut workers).await?;
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, workers = workers.len(), "Dispatch listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((workspace, Ok(()))) => tracing::debug!(workspace = %workspace, "Worker finished"),
            Ok((workspace, Err(e))) => tracing::error!(workspace = %workspace, error = %e, "Worker failed"),
            Err(e) => tracing::error!(error = %e, "Worker task aborted"),
        }
    }
    tracing::info!("Server shut down gracefully");
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
