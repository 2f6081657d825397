//! Durable job queue port and its backends.
//!
//! | Backend  | Claim primitive                                | State location            |
//! |----------|------------------------------------------------|---------------------------|
//! | `file`   | `rename(pending/<id>, processing/<id>)`        | `<ws>/data/queue/`        |
//! | `sqlite` | conditional `UPDATE ... WHERE status='PENDING'`| `<ws>/data/jobs.db`       |
//! | `redis`  | `BLMOVE pending -> claimed`                    | keys `dispatch:<ws>:*`    |
//!
//! Producers and consumers never talk to each other directly; they only
//! share the backend. The file backend's claim is atomic within a single
//! filesystem volume only.

pub mod file;
pub mod redis;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dispatch_common::{Job, JobId, JobStatus, QueueMetrics, now};
use serde_json::Value;

use crate::config::{QueueConfig, QueueProvider};
use crate::errors::QueueError;

pub use self::file::FileQueue;
pub use self::redis::RedisQueue;
pub use self::sqlite::SqliteQueue;

/// Terminal outcome written back by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub sandbox_path: Option<String>,
}

impl Completion {
    pub fn completed(result: Value) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(result),
            error_message: None,
            sandbox_path: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            error_message: Some(error.into()),
            sandbox_path: None,
        }
    }

    pub fn timed_out(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::TimedOut,
            result: None,
            error_message: Some(error.into()),
            sandbox_path: None,
        }
    }

    pub fn with_sandbox(mut self, path: Option<String>) -> Self {
        self.sandbox_path = path;
        self
    }
}

/// Persistence port for jobs and delivery tracking.
///
/// Implementations must guarantee that a PENDING job is handed to at most
/// one `dequeue` caller across every process sharing the backend, and that
/// a delivery id maps to at most one job.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Durably store a PENDING job. A job whose delivery id is already
    /// known is not stored again; the existing job's id is returned.
    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError>;

    /// Claim the oldest PENDING job, waiting up to `timeout`.
    /// An empty queue yields `Ok(None)`.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Move a PROCESSING job to a terminal state. Finishing an already
    /// terminal job is a no-op.
    async fn finish(&self, id: JobId, completion: Completion) -> Result<(), QueueError>;

    async fn complete(&self, id: JobId, result: Value) -> Result<(), QueueError> {
        self.finish(id, Completion::completed(result)).await
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        self.finish(id, Completion::failed(error)).await
    }

    async fn time_out(&self, id: JobId, error: &str) -> Result<(), QueueError> {
        self.finish(id, Completion::timed_out(error)).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError>;

    /// Number of PENDING jobs.
    async fn queue_size(&self) -> Result<u64, QueueError>;

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError>;

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), QueueError>;

    async fn get_metrics(&self) -> Result<QueueMetrics, QueueError>;

    /// Return PROCESSING jobs claimed longer than `older_than` ago to PENDING.
    /// This is the only path that moves a job backwards.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Delete terminal jobs finished more than `days` ago.
    async fn cleanup_old_jobs(&self, days: u32) -> Result<u64, QueueError>;

    async fn vacuum(&self) -> Result<(), QueueError>;
}

/// Decide whether `completion` applies to `job`. Returns `false` when the
/// job is already terminal (idempotent finish).
pub(crate) fn check_finish(job: &Job, completion: &Completion) -> Result<bool, QueueError> {
    if job.status.is_terminal() {
        return Ok(false);
    }
    if !job.status.can_transition_to(completion.status) {
        return Err(QueueError::InvalidTransition {
            id: job.id,
            from: job.status,
            to: completion.status,
        });
    }
    Ok(true)
}

pub(crate) fn apply_completion(job: &mut Job, completion: Completion) {
    job.status = completion.status;
    job.completed_at = Some(now());
    job.result = completion.result;
    job.error_message = completion.error_message;
    if completion.sandbox_path.is_some() {
        job.sandbox_path = completion.sandbox_path;
    }
}

/// Open the configured backend for one workspace. `data_dir` holds the
/// file and SQLite state; `namespace` scopes Redis keys.
pub async fn open(
    config: &QueueConfig,
    data_dir: &Path,
    namespace: &str,
) -> Result<Arc<dyn JobQueue>, QueueError> {
    let poll = Duration::from_millis(config.poll_interval_ms.max(10));
    let queue: Arc<dyn JobQueue> = match config.provider {
        QueueProvider::File => Arc::new(FileQueue::open(data_dir.join("queue"), poll)?),
        QueueProvider::Sqlite => {
            Arc::new(SqliteQueue::open(&data_dir.join("jobs.db"), poll)?)
        }
        QueueProvider::Redis => {
            Arc::new(RedisQueue::connect(&config.redis.url(), namespace).await?)
        }
    };
    tracing::debug!(backend = queue.backend(), namespace, "Opened job queue");
    Ok(queue)
}
