use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_common::{Job, JobId, JobStatus, LatencySummary, QueueMetrics, now};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::{Completion, JobQueue, apply_completion, check_finish};
use crate::errors::QueueError;

const BACKEND: &str = "file";
const LOCK_FILE: &str = ".queue.lock";
const DELIVERIES_DIR: &str = "deliveries";
const PROCESSED_DIR: &str = "processed";
const QUARANTINE_DIR: &str = "quarantine";
const LATENCY_WINDOW: usize = 1000;
const TERMINAL: [JobStatus; 3] = [JobStatus::Completed, JobStatus::Failed, JobStatus::TimedOut];

fn unavailable(e: impl Into<anyhow::Error>) -> QueueError {
    QueueError::unavailable(BACKEND, e)
}

fn job_file(id: &JobId) -> String {
    format!("{}.json", id)
}

fn delivery_key(delivery_id: &str) -> String {
    hex::encode(Sha256::digest(delivery_id.as_bytes()))
}

/// Write `bytes` to `dir/name` via a hidden temp file, fsync and rename.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4().simple()));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(name))
}

fn is_job_entry(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(".json")
}

/// Synchronous directory store. Every method runs on the blocking pool.
struct FileStore {
    root: PathBuf,
}

impl FileStore {
    fn bucket(&self, status: JobStatus) -> PathBuf {
        self.root.join(status.bucket())
    }

    fn ensure_layout(&self) -> io::Result<()> {
        for status in JobStatus::ALL {
            fs::create_dir_all(self.bucket(status))?;
        }
        fs::create_dir_all(self.root.join(DELIVERIES_DIR))?;
        fs::create_dir_all(self.root.join(PROCESSED_DIR))?;
        fs::create_dir_all(self.root.join(QUARANTINE_DIR))?;
        Ok(())
    }

    /// Exclusive advisory lock shared by every process using this directory.
    fn lock(&self) -> Result<File, QueueError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(LOCK_FILE))
            .map_err(unavailable)?;
        file.lock_exclusive().map_err(unavailable)?;
        Ok(file)
    }

    fn read_job(&self, path: &Path) -> Result<Option<Job>, QueueError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| QueueError::Corrupt {
                id: path.display().to_string(),
                message: e.to_string(),
            })
    }

    fn write_job(&self, job: &Job) -> Result<(), QueueError> {
        let bytes = serde_json::to_vec_pretty(job).map_err(unavailable)?;
        write_atomic(&self.bucket(job.status), &job_file(&job.id), &bytes).map_err(unavailable)
    }

    /// Sorted job file names in a bucket; names sort in creation order.
    fn list(&self, status: JobStatus) -> Result<Vec<String>, QueueError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.bucket(status)).map_err(unavailable)? {
            let name = entry.map_err(unavailable)?.file_name();
            if let Some(name) = name.to_str().filter(|n| is_job_entry(n)) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Locate a job; terminal buckets win over leftovers from an interrupted finish.
    fn find(&self, id: &JobId) -> Result<Option<(JobStatus, Job)>, QueueError> {
        let name = job_file(id);
        for status in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Processing,
            JobStatus::Pending,
        ] {
            if let Some(mut job) = self.read_job(&self.bucket(status).join(&name))? {
                // A claim renames before it rewrites; the bucket is authoritative.
                job.status = status;
                return Ok(Some((status, job)));
            }
        }
        Ok(None)
    }

    fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let lock = self.lock()?;
        let result = self.enqueue_locked(job);
        FileExt::unlock(&lock).map_err(unavailable)?;
        result
    }

    fn enqueue_locked(&self, job: Job) -> Result<JobId, QueueError> {
        if let Some(delivery_id) = &job.delivery_id {
            let index_dir = self.root.join(DELIVERIES_DIR);
            let key = delivery_key(delivery_id);
            match fs::read_to_string(index_dir.join(&key)) {
                Ok(existing) => {
                    if let Ok(existing) = JobId::from_str(existing.trim())
                        && self.find(&existing)?.is_some()
                    {
                        return Ok(existing);
                    }
                    // Index points at a job that never landed; overwrite it.
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(unavailable(e)),
            }
            write_atomic(&index_dir, &key, job.id.to_string().as_bytes()).map_err(unavailable)?;
        }
        let mut job = job;
        job.status = JobStatus::Pending;
        self.write_job(&job)?;
        Ok(job.id)
    }

    /// Rename and rewrite happen under the store lock so `requeue_stale`
    /// never sees a claimed file without its `started_at`.
    fn try_claim(&self) -> Result<Option<Job>, QueueError> {
        let lock = self.lock()?;
        let result = self.try_claim_locked();
        FileExt::unlock(&lock).map_err(unavailable)?;
        result
    }

    fn try_claim_locked(&self) -> Result<Option<Job>, QueueError> {
        let pending = self.bucket(JobStatus::Pending);
        let processing = self.bucket(JobStatus::Processing);
        for name in self.list(JobStatus::Pending)? {
            match fs::rename(pending.join(&name), processing.join(&name)) {
                Ok(()) => {}
                // Another worker claimed it first.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(unavailable(e)),
            }
            let mut job = match self.read_job(&processing.join(&name)) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e @ QueueError::Corrupt { .. }) => {
                    self.quarantine(&processing.join(&name), &name)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            job.status = JobStatus::Processing;
            job.started_at = Some(now());
            self.write_job(&job)?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Park an unreadable record outside the job buckets so it is never
    /// claimed again. Quarantined records count as failed.
    fn quarantine(&self, path: &Path, name: &str) -> Result<(), QueueError> {
        let target = self.root.join(QUARANTINE_DIR).join(name);
        fs::rename(path, &target).map_err(unavailable)?;
        tracing::warn!(record = %target.display(), "Quarantined corrupt job record");
        Ok(())
    }

    fn finish(&self, id: JobId, completion: Completion) -> Result<(), QueueError> {
        let lock = self.lock()?;
        let result = self.finish_locked(id, completion);
        FileExt::unlock(&lock).map_err(unavailable)?;
        result
    }

    fn finish_locked(&self, id: JobId, completion: Completion) -> Result<(), QueueError> {
        let Some((_, mut job)) = self.find(&id)? else {
            return Err(QueueError::NotFound(id));
        };
        if !check_finish(&job, &completion)? {
            return Ok(());
        }
        apply_completion(&mut job, completion);
        self.write_job(&job)?;
        match fs::remove_file(self.bucket(JobStatus::Processing).join(job_file(&id))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let lock = self.lock()?;
        let cutoff = now() - chrono::Duration::from_std(older_than).map_err(unavailable)?;
        let processing = self.bucket(JobStatus::Processing);
        let mut requeued = 0;
        for name in self.list(JobStatus::Processing)? {
            let path = processing.join(&name);
            let Some(mut job) = self.read_job(&path)? else {
                continue;
            };
            if TERMINAL
                .iter()
                .any(|s| self.bucket(*s).join(&name).exists())
            {
                fs::remove_file(&path).map_err(unavailable)?;
                continue;
            }
            let claimed_at = match job.started_at {
                Some(ts) => ts,
                None => fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .map_err(unavailable)?,
            };
            if claimed_at >= cutoff {
                continue;
            }
            job.status = JobStatus::Pending;
            job.started_at = None;
            self.write_job(&job)?;
            fs::remove_file(&path).map_err(unavailable)?;
            requeued += 1;
        }
        FileExt::unlock(&lock).map_err(unavailable)?;
        Ok(requeued)
    }

    fn cleanup(&self, days: u32) -> Result<u64, QueueError> {
        let cutoff = now() - chrono::Duration::days(i64::from(days));
        let mut removed = 0;
        for status in TERMINAL {
            let dir = self.bucket(status);
            for name in self.list(status)? {
                let path = dir.join(&name);
                let Some(job) = self.read_job(&path)? else {
                    continue;
                };
                if job.completed_at.is_some_and(|ts| ts <= cutoff) {
                    fs::remove_file(&path).map_err(unavailable)?;
                    if let Some(delivery_id) = &job.delivery_id {
                        let key = delivery_key(delivery_id);
                        for dir in [DELIVERIES_DIR, PROCESSED_DIR] {
                            let entry = self.root.join(dir).join(&key);
                            match fs::remove_file(&entry) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => tracing::warn!(
                                    path = %entry.display(),
                                    error = %e,
                                    "Failed to remove delivery entry"
                                ),
                            }
                        }
                    }
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Remove abandoned temp files and delivery index entries without a job.
    fn vacuum(&self) -> Result<(), QueueError> {
        let abandoned = SystemTime::now() - Duration::from_secs(60);
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(unavailable)?;
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') && name.contains(".tmp-") {
                let modified = entry
                    .metadata()
                    .map_err(unavailable)?
                    .modified()
                    .map_err(unavailable)?;
                if modified < abandoned {
                    fs::remove_file(entry.path()).map_err(unavailable)?;
                }
            }
        }

        let lock = self.lock()?;
        let index_dir = self.root.join(DELIVERIES_DIR);
        for entry in fs::read_dir(&index_dir).map_err(unavailable)? {
            let path = entry.map_err(unavailable)?.path();
            let target = fs::read_to_string(&path).map_err(unavailable)?;
            let live = match JobId::from_str(target.trim()) {
                Ok(id) => self.find(&id)?.is_some(),
                Err(_) => false,
            };
            if !live {
                fs::remove_file(&path).map_err(unavailable)?;
            }
        }
        FileExt::unlock(&lock).map_err(unavailable)?;
        Ok(())
    }

    fn metrics(&self) -> Result<QueueMetrics, QueueError> {
        let mut metrics = QueueMetrics {
            backend: BACKEND.to_string(),
            ..QueueMetrics::default()
        };
        let pending = self.list(JobStatus::Pending)?;
        metrics.queue_size = pending.len() as u64;
        metrics.processing = self.list(JobStatus::Processing)?.len() as u64;

        let mut samples = Vec::new();
        for status in TERMINAL {
            let names = self.list(status)?;
            let count = names.len() as u64;
            match status {
                JobStatus::Completed => metrics.total_completed = count,
                JobStatus::Failed => metrics.total_failed = count,
                _ => metrics.total_timed_out = count,
            }
            for name in names.iter().rev().take(LATENCY_WINDOW) {
                if let Some(job) = self.read_job(&self.bucket(status).join(name))? {
                    samples.extend(job.latency_secs());
                }
            }
        }
        metrics.total_failed += fs::read_dir(self.root.join(QUARANTINE_DIR))
            .map_err(unavailable)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_job_entry(&entry.file_name().to_string_lossy()))
            .count() as u64;
        metrics.total_enqueued = metrics.queue_size
            + metrics.processing
            + metrics.total_completed
            + metrics.total_failed
            + metrics.total_timed_out;
        metrics.latency = LatencySummary::from_samples(samples);

        if let Some(oldest) = pending.first()
            && let Some(job) = self.read_job(&self.bucket(JobStatus::Pending).join(oldest))?
        {
            let age = (now() - job.created_at).num_milliseconds().max(0);
            metrics.oldest_pending_age_secs = Some(age as f64 / 1000.0);
        }

        let mut disk = 0;
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(unavailable)?;
            if entry.file_type().is_file() {
                disk += entry.metadata().map_err(unavailable)?.len();
            }
        }
        metrics.disk_usage_bytes = Some(disk);
        metrics.compute_success_rate();
        Ok(metrics)
    }
}

/// Directory-backed queue. Job state is the directory a job file lives in;
/// claims are `rename(2)` from `pending/` to `processing/`, which is only
/// atomic when the whole tree sits on a single volume.
#[derive(Clone)]
pub struct FileQueue {
    store: Arc<FileStore>,
    poll_interval: Duration,
}

impl FileQueue {
    pub fn open(root: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, QueueError> {
        let store = FileStore { root: root.into() };
        store.ensure_layout().map_err(unavailable)?;
        Ok(Self {
            store: Arc::new(store),
            poll_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.store.root
    }

    async fn call<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&FileStore) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(unavailable)?
    }
}

#[async_trait]
impl JobQueue for FileQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        self.call(move |store| store.enqueue(job)).await
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.call(FileStore::try_claim).await? {
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
        self.call(move |store| store.finish(id, completion)).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.call(move |store| Ok(store.find(&id)?.map(|(_, job)| job)))
            .await
    }

    async fn queue_size(&self) -> Result<u64, QueueError> {
        self.call(|store| Ok(store.list(JobStatus::Pending)?.len() as u64))
            .await
    }

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError> {
        let path = self
            .store
            .root
            .join(PROCESSED_DIR)
            .join(delivery_key(delivery_id));
        self.call(move |_| Ok(path.exists())).await
    }

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), QueueError> {
        let key = delivery_key(delivery_id);
        let stamp = now().to_rfc3339();
        self.call(move |store| {
            write_atomic(&store.root.join(PROCESSED_DIR), &key, stamp.as_bytes())
                .map_err(unavailable)
        })
        .await
    }

    async fn get_metrics(&self) -> Result<QueueMetrics, QueueError> {
        self.call(FileStore::metrics).await
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        self.call(move |store| store.requeue_stale(older_than)).await
    }

    async fn cleanup_old_jobs(&self, days: u32) -> Result<u64, QueueError> {
        self.call(move |store| store.cleanup(days)).await
    }

    async fn vacuum(&self) -> Result<(), QueueError> {
        self.call(FileStore::vacuum).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::conformance;
    use tempfile::tempdir;

    fn temp_queue(dir: &Path) -> FileQueue {
        FileQueue::open(dir.join("queue"), Duration::from_millis(10)).unwrap()
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        for name in [
            "pending",
            "processing",
            "completed",
            "failed",
            "timed_out",
            "deliveries",
            "processed",
            "quarantine",
        ] {
            assert!(queue.root().join(name).is_dir(), "missing {}", name);
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_complete() {
        let dir = tempdir().unwrap();
        conformance::enqueue_dequeue_complete(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_single_job() {
        let dir = tempdir().unwrap();
        conformance::duplicate_delivery_is_single_job(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_empty_dequeue_returns_none() {
        let dir = tempdir().unwrap();
        conformance::empty_dequeue_returns_none(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let dir = tempdir().unwrap();
        conformance::fifo_order(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_finish_rules() {
        let dir = tempdir().unwrap();
        conformance::finish_rules(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_delivery_tracking() {
        let dir = tempdir().unwrap();
        conformance::delivery_tracking(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let dir = tempdir().unwrap();
        conformance::requeue_stale_returns_jobs(&temp_queue(dir.path())).await;
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs() {
        let dir = tempdir().unwrap();
        conformance::cleanup_removes_only_old_terminal(&temp_queue(dir.path())).await;
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
    async fn test_stale_delivery_index_is_overwritten() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        // Simulate a crash between writing the index and the job file.
        let ghost = JobId::new();
        fs::write(
            queue.root().join(DELIVERIES_DIR).join(delivery_key("d-crash")),
            ghost.to_string(),
        )
        .unwrap();

        let id = queue
            .enqueue(conformance::job(Some("d-crash"), 1))
            .await
            .unwrap();
        assert_ne!(id, ghost);
        assert_eq!(queue.queue_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_finish_prefers_terminal_copy() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        let id = queue.enqueue(conformance::job(None, 1)).await.unwrap();
        let mut job = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        // Terminal copy written, processing copy not yet removed.
        job.status = JobStatus::Completed;
        job.completed_at = Some(now());
        queue.store.write_job(&job).unwrap();

        let stored = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(queue.requeue_stale(Duration::ZERO).await.unwrap(), 0);
        assert!(!queue.root().join("processing").join(job_file(&id)).exists());
    }

    #[tokio::test]
    async fn test_vacuum_removes_orphan_index_entries() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        let index = queue.root().join(DELIVERIES_DIR).join(delivery_key("orphan"));
        fs::write(&index, JobId::new().to_string()).unwrap();
        queue.vacuum().await.unwrap();
        assert!(!index.exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_quarantined() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        // Sorts ahead of every v7 job id.
        fs::write(queue.root().join("pending").join("0000-bad.json"), "{not json").unwrap();
        let good = queue.enqueue(conformance::job(None, 1)).await.unwrap();

        conformance::corrupt_record_is_failed(&queue, good).await;
        assert!(queue.root().join(QUARANTINE_DIR).join("0000-bad.json").exists());
        assert!(!queue.root().join("processing").join("0000-bad.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requeue_during_claims_never_duplicates() {
        let dir = tempdir().unwrap();
        let queue = temp_queue(dir.path());
        let mut ids = Vec::new();
        for n in 0..20 {
            ids.push(queue.enqueue(conformance::job(None, n)).await.unwrap());
        }
        // Enqueue mtimes are now older than the stale cutoff; fresh claims are not.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let sweeper = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    queue.requeue_stale(Duration::from_millis(100)).await.unwrap();
                }
            })
        };
        let mut claimers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            claimers.push(tokio::spawn(async move {
                while queue.dequeue(Duration::ZERO).await.unwrap().is_some() {}
            }));
        }
        for claimer in claimers {
            claimer.await.unwrap();
        }
        sweeper.await.unwrap();

        for id in ids {
            let copies = JobStatus::ALL
                .iter()
                .filter(|s| queue.root().join(s.bucket()).join(job_file(&id)).exists())
                .count();
            assert_eq!(copies, 1, "job {} present in {} buckets", id, copies);
        }
    }

    #[tokio::test]
    async fn test_reopen_preserves_pending_jobs() {
        let dir = tempdir().unwrap();
        let id = temp_queue(dir.path())
            .enqueue(conformance::job(Some("durable"), 1))
            .await
            .unwrap();
        let job = temp_queue(dir.path())
            .dequeue(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
    }
}
