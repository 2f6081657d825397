//! Job execution: sandbox, snapshot, agent, validation, finalize.
//!
//! A [`JobOrchestrator`] drains one workspace's queue with a bounded pool of
//! concurrent jobs. Every job that is claimed ends in exactly one terminal
//! status, and its sandbox is released on every path, including panics
//! inside the pipeline.

pub mod agent;
pub mod finalize;
pub mod sandbox;
pub mod snapshot;
pub mod validation;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dispatch_common::{Job, JobEvent, JobEventKind, JobId, JobPhase, JobStatus};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub use agent::{AgentExecutor, AgentOutput, CommandAgent};
pub use finalize::{CommitFinalizer, Finalizer, NoopFinalizer, PullRequestFinalizer};
pub use sandbox::{Sandbox, SandboxProvider, WorktreeSandbox};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use validation::Validator;

use crate::config::{DispatchConfig, OrchestratorConfig};
use crate::errors::{OrchestratorError, QueueError};
use crate::events::EventBus;
use crate::queue::{Completion, JobQueue};
use crate::workspace::{Workspace, context};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_workers: usize,
    pub agent_timeout: Duration,
    /// How long one `dequeue` call may block; bounds shutdown latency.
    pub dequeue_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(1),
            agent_timeout: Duration::from_secs(config.agent_timeout_secs),
            dequeue_timeout: Duration::from_secs(config.dequeue_timeout_secs),
        }
    }
}

/// Terminal statuses reached during one [`JobOrchestrator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl RunSummary {
    pub fn processed(&self) -> u64 {
        self.completed + self.failed + self.timed_out
    }

    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::TimedOut => self.timed_out += 1,
            JobStatus::Pending | JobStatus::Processing => {}
        }
    }
}

pub struct JobOrchestrator {
    workspace: Workspace,
    queue: Arc<dyn JobQueue>,
    sandboxes: Arc<dyn SandboxProvider>,
    agent: Arc<dyn AgentExecutor>,
    validator: Validator,
    finalizer: Arc<dyn Finalizer>,
    events: EventBus,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        workspace: Workspace,
        queue: Arc<dyn JobQueue>,
        sandboxes: Arc<dyn SandboxProvider>,
        agent: Arc<dyn AgentExecutor>,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            workspace,
            queue,
            sandboxes,
            agent,
            validator: Validator::default(),
            finalizer: Arc::new(NoopFinalizer),
            events,
            settings,
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Wire the default components from configuration, with the
    /// workspace's own `config.toml` layered over the global values.
    pub fn from_config(
        workspace: Workspace,
        config: &DispatchConfig,
        queue: Arc<dyn JobQueue>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        let effective = config.for_workspace(&workspace.dir)?;
        let sandboxes = WorktreeSandbox::new(
            &effective.repository.path,
            &workspace.sandboxes_dir(),
            &effective.repository.base_branch,
        );
        let finalizer: Arc<dyn Finalizer> = Arc::from(finalize::from_config(
            effective.finalize.mode,
            &effective.repository.remote,
        ));
        Ok(Self::new(
            workspace,
            queue,
            Arc::new(sandboxes),
            Arc::new(CommandAgent::from_config(&effective.agent)),
            events,
            OrchestratorSettings::from_config(&effective.orchestrator),
        )
        .with_validator(Validator::new(effective.validation.commands))
        .with_finalizer(finalizer))
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Dequeue and process jobs until `cancel` fires or the queue backend
    /// fails. In-flight jobs are always drained before returning.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<RunSummary, OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_workers));
        let mut tasks: JoinSet<Result<JobStatus, QueueError>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<QueueError> = None;

        tracing::info!(
            workspace = %self.workspace.id,
            backend = self.queue.backend(),
            max_workers = self.settings.max_workers,
            "Worker started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Some(e) = record_joined(&mut summary, joined) {
                    fatal = Some(e);
                }
            }
            if fatal.is_some() {
                break;
            }

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    permit.map_err(anyhow::Error::from)?
                }
            };
            if cancel.is_cancelled() {
                break;
            }

            let job = match self.queue.dequeue(self.settings.dequeue_timeout).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) if e.is_fatal() => {
                    tracing::error!(workspace = %self.workspace.id, error = %e, "Dequeue failed");
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(workspace = %self.workspace.id, error = %e, "Skipped unusable job record");
                    continue;
                }
            };

            let this = Arc::clone(&self);
            let token = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.process_job(job, &token).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Some(e) = record_joined(&mut summary, joined) {
                fatal.get_or_insert(e);
            }
        }

        tracing::info!(
            workspace = %self.workspace.id,
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Worker stopped"
        );
        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }

    /// Process at most one job. `Ok(None)` means nothing was pending
    /// within the dequeue timeout.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Option<JobStatus>, OrchestratorError> {
        match self.queue.dequeue(self.settings.dequeue_timeout).await? {
            Some(job) => Ok(Some(self.process_job(job, cancel).await?)),
            None => Ok(None),
        }
    }

    /// Drive one claimed job to a terminal status and persist it.
    pub async fn process_job(&self, job: Job, cancel: &CancellationToken) -> Result<JobStatus, QueueError> {
        context::scope(self.workspace.clone(), self.process_scoped(job, cancel)).await
    }

    async fn process_scoped(&self, job: Job, cancel: &CancellationToken) -> Result<JobStatus, QueueError> {
        tracing::info!(
            workspace = %self.workspace.id,
            job_id = %job.id,
            source = %job.source,
            event_type = %job.event_type,
            "Job started"
        );
        self.emit(&job, JobEventKind::Started);

        let (outcome, sandbox_path) = self.execute(&job, cancel).await;
        let (completion, kind) = match outcome {
            Ok(result) => (Completion::completed(result), JobEventKind::Completed),
            Err(e @ OrchestratorError::AgentTimeout { .. }) => {
                let error = e.to_string();
                (Completion::timed_out(&error), JobEventKind::TimedOut { error })
            }
            Err(e) => {
                let error = e.to_string();
                (Completion::failed(&error), JobEventKind::Failed { error })
            }
        };
        let status = completion.status;
        self.queue
            .finish(job.id, completion.with_sandbox(sandbox_path))
            .await?;

        match &kind {
            JobEventKind::Completed => {
                tracing::info!(job_id = %job.id, "Job completed")
            }
            JobEventKind::Failed { error } | JobEventKind::TimedOut { error } => {
                tracing::warn!(job_id = %job.id, status = %status, error = %error, "Job did not complete")
            }
            _ => {}
        }
        self.emit(&job, kind);
        Ok(status)
    }

    /// Acquire a sandbox, run the pipeline in it and release it whatever
    /// the pipeline did.
    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> (Result<Value, OrchestratorError>, Option<String>) {
        if let Err(e) = checkpoint(cancel, "sandbox acquisition") {
            return (Err(e), None);
        }
        let sandbox = match self.sandboxes.acquire(job).await {
            Ok(sandbox) => sandbox,
            Err(e) => return (Err(e.into()), None),
        };
        let sandbox_path = Some(sandbox.path.display().to_string());
        self.emit(job, JobEventKind::Phase { phase: JobPhase::SandboxAcquired });

        let outcome = AssertUnwindSafe(self.pipeline(job, &sandbox, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(OrchestratorError::Other(anyhow::anyhow!(
                    "Job pipeline panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let keep_branch = outcome.is_ok() && self.finalizer.keeps_branch();
        if let Err(e) = self.sandboxes.release(&sandbox, keep_branch).await {
            tracing::error!(job_id = %job.id, sandbox = %sandbox.name, error = %e, "Sandbox release failed");
        }
        (outcome, sandbox_path)
    }

    async fn pipeline(
        &self,
        job: &Job,
        sandbox: &Sandbox,
        cancel: &CancellationToken,
    ) -> Result<Value, OrchestratorError> {
        let before = self.snapshot(job.id, "before", sandbox.path.clone()).await?;
        self.emit(job, JobEventKind::Phase { phase: JobPhase::SnapshotCaptured });

        checkpoint(cancel, "agent invocation")?;
        self.emit(job, JobEventKind::Phase { phase: JobPhase::AgentInvoked });
        let timeout = self.settings.agent_timeout;
        let output = match tokio::time::timeout(timeout, self.agent.run(job, &sandbox.path)).await {
            Err(_) => return Err(OrchestratorError::AgentTimeout { timeout }),
            Ok(result) => result?,
        };
        if !output.success {
            return Err(OrchestratorError::AgentFailed {
                exit_code: output.exit_code,
                output: output.diagnostics(),
            });
        }

        let after = self.snapshot(job.id, "after", sandbox.path.clone()).await?;
        let changes = before.diff(&after);
        tracing::debug!(
            job_id = %job.id,
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            "Sandbox changes"
        );

        checkpoint(cancel, "validation")?;
        self.validator.validate(&sandbox.path).await?;
        self.emit(job, JobEventKind::Phase { phase: JobPhase::Validated });

        checkpoint(cancel, "finalization")?;
        let finalized = self.finalizer.finalize(job, sandbox, &changes).await?;
        self.emit(job, JobEventKind::Phase { phase: JobPhase::Finalized });

        Ok(json!({
            "exit_code": output.exit_code,
            "changes": changes,
            "finalize": finalized,
        }))
    }

    async fn snapshot(&self, job_id: JobId, label: &'static str, root: PathBuf) -> Result<Snapshot, OrchestratorError> {
        let dir = self.workspace.snapshots_dir();
        let snapshot = tokio::task::spawn_blocking(move || -> anyhow::Result<Snapshot> {
            let snapshot = Snapshot::capture(job_id, label, &root)?;
            snapshot.save(&dir)?;
            Ok(snapshot)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(snapshot)
    }

    fn emit(&self, job: &Job, kind: JobEventKind) {
        let event = JobEvent::new(self.workspace.id.as_str(), job.id, kind)
            .with_card_ref(job.board_card_ref().map(str::to_string));
        self.events.publish(event);
    }
}

fn checkpoint(cancel: &CancellationToken, phase: &'static str) -> Result<(), OrchestratorError> {
    if cancel.is_cancelled() {
        return Err(OrchestratorError::Cancelled { phase });
    }
    Ok(())
}

fn record_joined(
    summary: &mut RunSummary,
    joined: Result<Result<JobStatus, QueueError>, tokio::task::JoinError>,
) -> Option<QueueError> {
    match joined {
        Ok(Ok(status)) => {
            summary.record(status);
            None
        }
        Ok(Err(e)) if e.is_fatal() => Some(e),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to record job outcome");
            None
        }
        Err(e) => {
            tracing::error!(error = %e, "Job task aborted");
            None
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
