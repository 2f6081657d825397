use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_common::{Job, JobId, JobPayload, JobStatus, LatencySummary, QueueMetrics, now};
use rusqlite::{Connection, OptionalExtension, params};

use super::{Completion, JobQueue, apply_completion, check_finish};
use crate::errors::QueueError;

const BACKEND: &str = "sqlite";

/// Completed-job samples considered for latency percentiles.
const LATENCY_WINDOW: i64 = 1000;

fn unavailable(e: impl Into<anyhow::Error>) -> QueueError {
    QueueError::unavailable(BACKEND, e)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite-backed queue in WAL mode.
///
/// Each instance owns one connection; independent processes coordinate
/// through SQLite's own locking. All statements run on tokio's blocking
/// pool.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    poll_interval: Duration,
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path` and run migrations.
    pub fn open(path: &Path, poll_interval: Duration) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
            poll_interval,
        };
        queue.init()?;
        Ok(queue)
    }

    /// In-memory queue (for testing). Not shareable across instances.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            poll_interval: Duration::from_millis(10),
        };
        queue.init()?;
        Ok(queue)
    }

    fn init(&self) -> Result<(), QueueError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| unavailable(anyhow::anyhow!("Queue lock poisoned: {}", e)))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(unavailable)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(unavailable)?;
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                delivery_id TEXT UNIQUE,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                result TEXT,
                error_message TEXT,
                sandbox_path TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS delivery_tracking (
                delivery_id TEXT PRIMARY KEY,
                processed_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_completed ON jobs(completed_at);
            ",
        )
        .map_err(unavailable)?;
        Ok(())
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| unavailable(anyhow::anyhow!("Queue lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await
        .map_err(unavailable)?
    }

    fn try_claim(conn: &mut Connection) -> Result<Option<Job>, QueueError> {
        loop {
            let candidate: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs WHERE status = 'PENDING' ORDER BY created_at, id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)?;
            let Some(id) = candidate else {
                return Ok(None);
            };

            let claimed = conn
                .execute(
                    "UPDATE jobs SET status = 'PROCESSING', started_at = ?1
                     WHERE id = ?2 AND status = 'PENDING'",
                    params![to_millis(now()), id],
                )
                .map_err(unavailable)?;
            if claimed == 1 {
                return match load_job(conn, &id) {
                    Err(e @ QueueError::Corrupt { .. }) => {
                        fail_corrupt(conn, &id, &e)?;
                        Err(e)
                    }
                    other => other,
                };
            }
            // Another process won this row; look again.
        }
    }
}

const JOB_COLUMNS: &str = "id, delivery_id, status, source, event_type, payload, metadata, \
     result, error_message, sandbox_path, created_at, started_at, completed_at";

struct JobRow {
    id: String,
    delivery_id: Option<String>,
    status: String,
    source: String,
    event_type: String,
    payload: String,
    metadata: String,
    result: Option<String>,
    error_message: Option<String>,
    sandbox_path: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            delivery_id: row.get(1)?,
            status: row.get(2)?,
            source: row.get(3)?,
            event_type: row.get(4)?,
            payload: row.get(5)?,
            metadata: row.get(6)?,
            result: row.get(7)?,
            error_message: row.get(8)?,
            sandbox_path: row.get(9)?,
            created_at: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, QueueError> {
        let corrupt = |message: String| QueueError::Corrupt {
            id: self.id.clone(),
            message,
        };
        let id = JobId::from_str(&self.id).map_err(&corrupt)?;
        let status = JobStatus::from_str(&self.status).map_err(&corrupt)?;
        let payload: JobPayload =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;
        let metadata =
            serde_json::from_str(&self.metadata).map_err(|e| corrupt(e.to_string()))?;
        let result = match &self.result {
            Some(text) => Some(serde_json::from_str(text).map_err(|e| corrupt(e.to_string()))?),
            None => None,
        };
        Ok(Job {
            id,
            delivery_id: self.delivery_id,
            source: self.source,
            event_type: self.event_type,
            payload,
            status,
            created_at: from_millis(self.created_at),
            started_at: self.started_at.map(from_millis),
            completed_at: self.completed_at.map(from_millis),
            sandbox_path: self.sandbox_path,
            metadata,
            result,
            error_message: self.error_message,
        })
    }
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<Job>, QueueError> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![id],
            JobRow::from_row,
        )
        .optional()
        .map_err(unavailable)?;
    row.map(JobRow::into_job).transpose()
}

/// Terminally fail a claimed row that cannot be decoded.
fn fail_corrupt(conn: &Connection, id: &str, error: &QueueError) -> Result<(), QueueError> {
    conn.execute(
        "UPDATE jobs SET status = 'FAILED', completed_at = ?1, error_message = ?2
         WHERE id = ?3 AND status = 'PROCESSING'",
        params![to_millis(now()), error.to_string(), id],
    )
    .map_err(unavailable)?;
    tracing::warn!(job_id = %id, error = %error, "Failed corrupt job record");
    Ok(())
}

fn count(conn: &Connection, sql: &str) -> Result<u64, QueueError> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0)).map_err(unavailable)?;
    Ok(n.max(0) as u64)
}

#[async_trait]
impl JobQueue for SqliteQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let payload = serde_json::to_string(&job.payload).map_err(unavailable)?;
        let metadata = serde_json::to_string(&job.metadata).map_err(unavailable)?;
        self.call(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO jobs (id, delivery_id, status, source, event_type, payload, metadata, created_at)
                     VALUES (?1, ?2, 'PENDING', ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(delivery_id) DO NOTHING",
                    params![
                        job.id.to_string(),
                        job.delivery_id,
                        job.source,
                        job.event_type,
                        payload,
                        metadata,
                        to_millis(job.created_at),
                    ],
                )
                .map_err(unavailable)?;
            if inserted == 1 {
                return Ok(job.id);
            }

            let existing: String = conn
                .query_row(
                    "SELECT id FROM jobs WHERE delivery_id = ?1",
                    params![job.delivery_id],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;
            JobId::from_str(&existing).map_err(|message| QueueError::Corrupt {
                id: existing.clone(),
                message,
            })
        })
        .await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.call(Self::try_claim).await? {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn finish(&self, id: JobId, completion: Completion) -> Result<(), QueueError> {
        self.call(move |conn| {
            let tx = conn.transaction().map_err(unavailable)?;
            let Some(mut job) = load_job(&tx, &id.to_string())? else {
                return Err(QueueError::NotFound(id));
            };
            if !check_finish(&job, &completion)? {
                return Ok(());
            }
            apply_completion(&mut job, completion);
            let result = job
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(unavailable)?;
            tx.execute(
                "UPDATE jobs SET status = ?1, completed_at = ?2, result = ?3,
                        error_message = ?4, sandbox_path = ?5
                 WHERE id = ?6 AND status = 'PROCESSING'",
                params![
                    job.status.as_str(),
                    job.completed_at.map(to_millis),
                    result,
                    job.error_message,
                    job.sandbox_path,
                    id.to_string(),
                ],
            )
            .map_err(unavailable)?;
            tx.commit().map_err(unavailable)
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.call(move |conn| load_job(conn, &id.to_string())).await
    }

    async fn queue_size(&self) -> Result<u64, QueueError> {
        self.call(|conn| count(conn, "SELECT COUNT(*) FROM jobs WHERE status = 'PENDING'"))
            .await
    }

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError> {
        let delivery_id = delivery_id.to_string();
        self.call(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM delivery_tracking WHERE delivery_id = ?1",
                    params![delivery_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)?;
            Ok(found.is_some())
        })
        .await
    }

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), QueueError> {
        let delivery_id = delivery_id.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO delivery_tracking (delivery_id, processed_at) VALUES (?1, ?2)",
                params![delivery_id, to_millis(now())],
            )
            .map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn get_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let path = self.path.clone();
        self.call(move |conn| {
            let mut metrics = QueueMetrics {
                backend: BACKEND.to_string(),
                ..QueueMetrics::default()
            };
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .map_err(unavailable)?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(unavailable)?;
            for row in rows {
                let (status, n) = row.map_err(unavailable)?;
                let n = n.max(0) as u64;
                metrics.total_enqueued += n;
                match JobStatus::from_str(&status) {
                    Ok(JobStatus::Pending) => metrics.queue_size = n,
                    Ok(JobStatus::Processing) => metrics.processing = n,
                    Ok(JobStatus::Completed) => metrics.total_completed = n,
                    Ok(JobStatus::Failed) => metrics.total_failed = n,
                    Ok(JobStatus::TimedOut) => metrics.total_timed_out = n,
                    Err(message) => {
                        return Err(QueueError::Corrupt {
                            id: status,
                            message,
                        });
                    }
                }
            }
            drop(stmt);

            let mut stmt = conn
                .prepare(
                    "SELECT completed_at - created_at FROM jobs
                     WHERE completed_at IS NOT NULL
                     ORDER BY completed_at DESC LIMIT ?1",
                )
                .map_err(unavailable)?;
            let samples = stmt
                .query_map(params![LATENCY_WINDOW], |row| row.get::<_, i64>(0))
                .map_err(unavailable)?
                .map(|r| r.map(|ms| ms.max(0) as f64 / 1000.0))
                .collect::<rusqlite::Result<Vec<f64>>>()
                .map_err(unavailable)?;
            drop(stmt);
            metrics.latency = LatencySummary::from_samples(samples);

            let oldest: Option<i64> = conn
                .query_row(
                    "SELECT MIN(created_at) FROM jobs WHERE status = 'PENDING'",
                    [],
                    |row| row.get(0),
                )
                .map_err(unavailable)?;
            metrics.oldest_pending_age_secs =
                oldest.map(|ms| (to_millis(now()) - ms).max(0) as f64 / 1000.0);

            metrics.disk_usage_bytes = path.map(|p| {
                ["", "-wal", "-shm"]
                    .iter()
                    .filter_map(|suffix| {
                        let mut file = p.clone().into_os_string();
                        file.push(suffix);
                        std::fs::metadata(PathBuf::from(file)).ok()
                    })
                    .map(|m| m.len())
                    .sum()
            });
            metrics.compute_success_rate();
            Ok(metrics)
        })
        .await
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = to_millis(now()) - older_than.as_millis() as i64;
        self.call(move |conn| {
            let n = conn
                .execute(
                    "UPDATE jobs SET status = 'PENDING', started_at = NULL
                     WHERE status = 'PROCESSING' AND started_at < ?1",
                    params![cutoff],
                )
                .map_err(unavailable)?;
            Ok(n as u64)
        })
        .await
    }

    async fn cleanup_old_jobs(&self, days: u32) -> Result<u64, QueueError> {
        let cutoff = to_millis(now() - chrono::Duration::days(i64::from(days)));
        self.call(move |conn| {
            let removed = conn
                .execute(
                    "DELETE FROM jobs
                     WHERE status IN ('COMPLETED', 'FAILED', 'TIMED_OUT') AND completed_at <= ?1",
                    params![cutoff],
                )
                .map_err(unavailable)?;
            conn.execute(
                "DELETE FROM delivery_tracking WHERE processed_at <= ?1
                 AND delivery_id NOT IN (SELECT delivery_id FROM jobs WHERE delivery_id IS NOT NULL)",
                params![cutoff],
            )
            .map_err(unavailable)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn vacuum(&self) -> Result<(), QueueError> {
        self.call(|conn| {
            conn.execute_batch("VACUUM;").map_err(unavailable)?;
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(unavailable)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::conformance;
    use tempfile::tempdir;

    fn temp_queue(dir: &Path) -> SqliteQueue {
        SqliteQueue::open(&dir.join("jobs.db"), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_migrations_create_tables() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let conn = queue.conn.lock().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('jobs', 'delivery_tracking')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn test_wal_mode_enabled_on_disk() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        let conn = queue.conn.lock().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_complete() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::enqueue_dequeue_complete(&queue).await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_single_job() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::duplicate_delivery_is_single_job(&queue).await;
    }

    #[tokio::test]
    async fn test_empty_dequeue_returns_none() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::empty_dequeue_returns_none(&queue).await;
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::fifo_order(&queue).await;
    }

    #[tokio::test]
    async fn test_finish_rules() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::finish_rules(&queue).await;
    }

    #[tokio::test]
    async fn test_delivery_tracking() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::delivery_tracking(&queue).await;
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        conformance::requeue_stale_returns_jobs(&queue).await;
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_job() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let bad = queue.enqueue(conformance::job(None, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3)).await;
        let good = queue.enqueue(conformance::job(None, 2)).await.unwrap();
        queue
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE jobs SET payload = '{not json' WHERE id = ?1",
                params![bad.to_string()],
            )
            .unwrap();

        conformance::corrupt_record_is_failed(&queue, good).await;
        let status: String = queue
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![bad.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "FAILED");
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        conformance::cleanup_removes_only_old_terminal(&queue).await;
    }

    #[tokio::test]
    async fn test_concurrent_instances_claim_distinct_jobs() {
        let dir = tempdir().unwrap();
        let queues: Vec<Arc<dyn JobQueue>> = (0..3)
            .map(|_| Arc::new(temp_queue(dir.path())) as Arc<dyn JobQueue>)
            .collect();
        conformance::concurrent_claims_are_distinct(queues, 3).await;
    }

    #[tokio::test]
    async fn test_reopen_preserves_pending_jobs() {
        let dir = tempdir().unwrap();
        let id = {
            let queue = temp_queue(dir.path());
            queue.enqueue(conformance::job(Some("durable"), 1)).await.unwrap()
        };
        let reopened = temp_queue(dir.path());
        let job = reopened.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.delivery_id.as_deref(), Some("durable"));
    }

    #[tokio::test]
    async fn test_corrupt_payload_reported() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let id = queue.enqueue(conformance::job(None, 1)).await.unwrap();
        {
            let conn = queue.conn.lock().unwrap();
            conn.execute("UPDATE jobs SET payload = 'not json'", []).unwrap();
        }
        let err = queue.get_job(id).await.unwrap_err();
        assert!(matches!(err, QueueError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_metrics_report_disk_usage_and_backlog() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        queue.enqueue(conformance::job(None, 1)).await.unwrap();
        let metrics = queue.get_metrics().await.unwrap();
        assert_eq!(metrics.backend, "sqlite");
        assert_eq!(metrics.queue_size, 1);
        assert_eq!(metrics.total_enqueued, 1);
        assert!(metrics.disk_usage_bytes.unwrap() > 0);
        assert!(metrics.oldest_pending_age_secs.is_some());
        assert_eq!(metrics.success_rate, None);
    }
}
