use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dispatch_common::{Job, JobId, JobStatus, LatencySummary, QueueMetrics, now};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;

use super::{Completion, JobQueue};
use crate::errors::QueueError;

const BACKEND: &str = "redis";
const LATENCY_CAP: i64 = 1000;

fn unavailable(e: impl Into<anyhow::Error>) -> QueueError {
    QueueError::unavailable(BACKEND, e)
}

fn from_millis(text: &str) -> Option<DateTime<Utc>> {
    text.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

/// Stores the job and its delivery index entry, or returns the id already
/// indexed for the delivery.
const ENQUEUE_LUA: &str = r#"
if ARGV[1] ~= '' then
  local existing = redis.call('HGET', KEYS[1], ARGV[1])
  if existing then
    return existing
  end
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
end
redis.call('HSET', KEYS[2], 'data', ARGV[3], 'status', 'PENDING')
redis.call('RPUSH', KEYS[3], ARGV[2])
return ARGV[2]
"#;

/// Second half of a claim: the id already sits in the claimed list.
const CLAIM_LUA: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
redis.call('LREM', KEYS[3], 1, ARGV[1])
if status ~= 'PENDING' then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'PROCESSING', 'started_at', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

const FINISH_LUA: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return 'missing'
end
if status == 'COMPLETED' or status == 'FAILED' or status == 'TIMED_OUT' then
  return 'terminal'
end
if status ~= 'PROCESSING' then
  return status
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'completed_at', ARGV[3])
if ARGV[4] ~= '' then redis.call('HSET', KEYS[1], 'result', ARGV[4]) end
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'error_message', ARGV[5]) end
if ARGV[6] ~= '' then redis.call('HSET', KEYS[1], 'sandbox_path', ARGV[6]) end
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('LPUSH', KEYS[4], ARGV[7])
redis.call('LTRIM', KEYS[4], 0, tonumber(ARGV[8]) - 1)
return 'ok'
"#;

/// Return a job to the front of the pending list if it still has the
/// expected status.
const REQUEUE_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[2] then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'PENDING')
redis.call('HDEL', KEYS[1], 'started_at')
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[4], 0, ARGV[1])
redis.call('LREM', KEYS[3], 0, ARGV[1])
redis.call('LPUSH', KEYS[3], ARGV[1])
return 1
"#;

struct Scripts {
    enqueue: Script,
    claim: Script,
    finish: Script,
    requeue: Script,
}

/// Redis / Dragonfly queue.
///
/// Keys live under `dispatch:<namespace>:`. Claims move an id from the
/// `pending` list into `claimed` with `BLMOVE`, then a script flips the
/// job hash to PROCESSING. Only scripts touch more than one key, so every
/// multi-key change is atomic.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    blocking: Arc<Mutex<MultiplexedConnection>>,
    prefix: String,
    scripts: Arc<Scripts>,
}

impl RedisQueue {
    pub async fn connect(url: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        // Blocking pops get their own connection so they never stall other commands.
        let blocking = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self {
            conn,
            blocking: Arc::new(Mutex::new(blocking)),
            prefix: format!("dispatch:{}:", namespace),
            scripts: Arc::new(Scripts {
                enqueue: Script::new(ENQUEUE_LUA),
                claim: Script::new(CLAIM_LUA),
                finish: Script::new(FINISH_LUA),
                requeue: Script::new(REQUEUE_LUA),
            }),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}job:{}", self.prefix, id)
    }

    fn status_key(&self, status: JobStatus) -> String {
        format!("{}status:{}", self.prefix, status.bucket())
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> =
            conn.hgetall(self.job_key(id)).await.map_err(unavailable)?;
        if fields.is_empty() {
            return Ok(None);
        }
        let corrupt = |message: String| QueueError::Corrupt {
            id: id.to_string(),
            message,
        };
        let data = fields
            .get("data")
            .ok_or_else(|| corrupt("missing data field".to_string()))?;
        let mut job: Job = serde_json::from_str(data).map_err(|e| corrupt(e.to_string()))?;
        if let Some(status) = fields.get("status") {
            job.status = JobStatus::from_str(status).map_err(&corrupt)?;
        }
        job.started_at = fields.get("started_at").and_then(|v| from_millis(v));
        job.completed_at = fields.get("completed_at").and_then(|v| from_millis(v));
        if let Some(result) = fields.get("result") {
            job.result = Some(serde_json::from_str(result).map_err(|e| corrupt(e.to_string()))?);
        }
        if let Some(error) = fields.get("error_message") {
            job.error_message = Some(error.clone());
        }
        if let Some(path) = fields.get("sandbox_path") {
            job.sandbox_path = Some(path.clone());
        }
        Ok(Some(job))
    }

    /// Pop one id from `pending` into `claimed`, blocking up to `timeout`.
    async fn pop_claimed(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let pending = self.key("pending");
        let claimed = self.key("claimed");
        let mut conn = self.blocking.lock().await;
        let id: Option<String> = if timeout.is_zero() {
            redis::cmd("LMOVE")
                .arg(&pending)
                .arg(&claimed)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut *conn)
                .await
                .map_err(unavailable)?
        } else {
            let mut cmd = redis::cmd("BLMOVE");
            let call = cmd
                .arg(&pending)
                .arg(&claimed)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout.as_secs_f64())
                .query_async(&mut *conn);
            match tokio::time::timeout(timeout + Duration::from_secs(2), call).await {
                Ok(result) => result.map_err(unavailable)?,
                Err(_) => {
                    return Err(unavailable(anyhow::anyhow!(
                        "BLMOVE did not return within {:?}",
                        timeout
                    )));
                }
            }
        };
        Ok(id)
    }

    /// Terminally fail a claimed job whose hash cannot be decoded.
    async fn fail_corrupt(&self, id: &str, error: &QueueError) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let completed_at = now().timestamp_millis().to_string();
        let message = error.to_string();
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(
                self.job_key(id),
                &[
                    ("status", JobStatus::Failed.as_str()),
                    ("completed_at", completed_at.as_str()),
                    ("error_message", message.as_str()),
                ],
            )
            .ignore()
            .srem(self.status_key(JobStatus::Processing), id)
            .ignore()
            .sadd(self.status_key(JobStatus::Failed), id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        tracing::warn!(job_id = %id, error = %error, "Failed corrupt job record");
        Ok(())
    }

    async fn requeue(&self, id: &str, expected: JobStatus) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .requeue
            .key(self.job_key(id))
            .key(self.status_key(JobStatus::Processing))
            .key(self.key("pending"))
            .key(self.key("claimed"))
            .arg(id)
            .arg(expected.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(moved == 1)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut job = job;
        job.status = JobStatus::Pending;
        let data = serde_json::to_string(&job).map_err(unavailable)?;
        let id = job.id.to_string();
        let mut conn = self.conn.clone();
        let stored: String = self
            .scripts
            .enqueue
            .key(self.key("deliveries"))
            .key(self.job_key(&id))
            .key(self.key("pending"))
            .arg(job.delivery_id.as_deref().unwrap_or(""))
            .arg(&id)
            .arg(data)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        JobId::from_str(&stored).map_err(|message| QueueError::Corrupt {
            id: stored.clone(),
            message,
        })
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(id) = self.pop_claimed(remaining).await? else {
                return Ok(None);
            };
            let mut conn = self.conn.clone();
            let claimed: i64 = self
                .scripts
                .claim
                .key(self.job_key(&id))
                .key(self.status_key(JobStatus::Processing))
                .key(self.key("claimed"))
                .arg(&id)
                .arg(now().timestamp_millis())
                .invoke_async(&mut conn)
                .await
                .map_err(unavailable)?;
            if claimed == 1 {
                return match self.load(&id).await {
                    Err(e @ QueueError::Corrupt { .. }) => {
                        self.fail_corrupt(&id, &e).await?;
                        Err(e)
                    }
                    other => other,
                };
            }
            tracing::debug!(job_id = %id, "Skipped stale pending entry");
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    async fn finish(&self, id: JobId, completion: Completion) -> Result<(), QueueError> {
        let key = id.to_string();
        let Some(job) = self.load(&key).await? else {
            return Err(QueueError::NotFound(id));
        };
        let completed_at = now();
        let latency = (completed_at - job.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        let result = completion
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(unavailable)?
            .unwrap_or_default();

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .finish
            .key(self.job_key(&key))
            .key(self.status_key(JobStatus::Processing))
            .key(self.status_key(completion.status))
            .key(self.key("latencies"))
            .arg(&key)
            .arg(completion.status.as_str())
            .arg(completed_at.timestamp_millis())
            .arg(result)
            .arg(completion.error_message.unwrap_or_default())
            .arg(completion.sandbox_path.unwrap_or_default())
            .arg(latency)
            .arg(LATENCY_CAP)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        match outcome.as_str() {
            "ok" | "terminal" => Ok(()),
            "missing" => Err(QueueError::NotFound(id)),
            other => Err(QueueError::InvalidTransition {
                id,
                from: JobStatus::from_str(other).unwrap_or(job.status),
                to: completion.status,
            }),
        }
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.load(&id.to_string()).await
    }

    async fn queue_size(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.llen(self.key("pending")).await.map_err(unavailable)?;
        Ok(n)
    }

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let found: bool = conn
            .hexists(self.key("processed"), delivery_id)
            .await
            .map_err(unavailable)?;
        Ok(found)
    }

    async fn mark_delivery_processed(&self, delivery_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .hset_nx(
                self.key("processed"),
                delivery_id,
                now().timestamp_millis(),
            )
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get_metrics(&self) -> Result<QueueMetrics, QueueError> {
        let mut conn = self.conn.clone();
        let (pending, claimed, processing, completed, failed, timed_out, latencies): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            Vec<f64>,
        ) = redis::pipe()
            .llen(self.key("pending"))
            .llen(self.key("claimed"))
            .scard(self.status_key(JobStatus::Processing))
            .scard(self.status_key(JobStatus::Completed))
            .scard(self.status_key(JobStatus::Failed))
            .scard(self.status_key(JobStatus::TimedOut))
            .lrange(self.key("latencies"), 0, -1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let mut metrics = QueueMetrics {
            backend: BACKEND.to_string(),
            queue_size: pending,
            processing: processing + claimed,
            total_completed: completed,
            total_failed: failed,
            total_timed_out: timed_out,
            total_enqueued: pending + claimed + processing + completed + failed + timed_out,
            latency: LatencySummary::from_samples(latencies),
            ..QueueMetrics::default()
        };

        let oldest: Option<String> = conn
            .lindex(self.key("pending"), 0)
            .await
            .map_err(unavailable)?;
        if let Some(id) = oldest
            && let Some(job) = self.load(&id).await?
        {
            let age = (now() - job.created_at).num_milliseconds().max(0);
            metrics.oldest_pending_age_secs = Some(age as f64 / 1000.0);
        }
        metrics.compute_success_rate();
        Ok(metrics)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = now().timestamp_millis() - older_than.as_millis() as i64;
        let mut conn = self.conn.clone();
        let mut requeued = 0;

        let processing: Vec<String> = conn
            .smembers(self.status_key(JobStatus::Processing))
            .await
            .map_err(unavailable)?;
        for id in processing {
            let started: Option<String> = conn
                .hget(self.job_key(&id), "started_at")
                .await
                .map_err(unavailable)?;
            let started = started.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
            if started < cutoff && self.requeue(&id, JobStatus::Processing).await? {
                requeued += 1;
            }
        }

        // Ids moved by BLMOVE whose claim script never ran.
        let orphans: Vec<String> = conn
            .lrange(self.key("claimed"), 0, -1)
            .await
            .map_err(unavailable)?;
        for id in orphans {
            if self.requeue(&id, JobStatus::Pending).await? {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn cleanup_old_jobs(&self, days: u32) -> Result<u64, QueueError> {
        let cutoff = (now() - chrono::Duration::days(i64::from(days))).timestamp_millis();
        let mut conn = self.conn.clone();
        let mut removed = 0;
        for status in [JobStatus::Completed, JobStatus::Failed, JobStatus::TimedOut] {
            let set = self.status_key(status);
            let ids: Vec<String> = conn.smembers(&set).await.map_err(unavailable)?;
            for id in ids {
                let Some(job) = self.load(&id).await? else {
                    let _: i64 = conn.srem(&set, &id).await.map_err(unavailable)?;
                    continue;
                };
                if !job
                    .completed_at
                    .is_some_and(|ts| ts.timestamp_millis() <= cutoff)
                {
                    continue;
                }
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .del(self.job_key(&id))
                    .ignore()
                    .srem(&set, &id)
                    .ignore();
                if let Some(delivery_id) = &job.delivery_id {
                    pipe.hdel(self.key("deliveries"), delivery_id)
                        .ignore()
                        .hdel(self.key("processed"), delivery_id)
                        .ignore();
                }
                let _: () = pipe.query_async(&mut conn).await.map_err(unavailable)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop status-set members whose job hash no longer exists.
    async fn vacuum(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        for status in [
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::TimedOut,
        ] {
            let set = self.status_key(status);
            let ids: Vec<String> = conn.smembers(&set).await.map_err(unavailable)?;
            for id in ids {
                let exists: bool = conn.exists(self.job_key(&id)).await.map_err(unavailable)?;
                if !exists {
                    let _: i64 = conn.srem(&set, &id).await.map_err(unavailable)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::conformance;

    /// Redis tests run only when `DISPATCH_TEST_REDIS_URL` is set.
    async fn test_queue() -> Option<RedisQueue> {
        let url = std::env::var("DISPATCH_TEST_REDIS_URL").ok()?;
        let namespace = format!("test-{}", uuid::Uuid::new_v4().simple());
        Some(RedisQueue::connect(&url, &namespace).await.unwrap())
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_complete() {
        let Some(queue) = test_queue().await else { return };
        conformance::enqueue_dequeue_complete(&queue).await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_single_job() {
        let Some(queue) = test_queue().await else { return };
        conformance::duplicate_delivery_is_single_job(&queue).await;
    }

    #[tokio::test]
    async fn test_empty_dequeue_returns_none() {
        let Some(queue) = test_queue().await else { return };
        conformance::empty_dequeue_returns_none(&queue).await;
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let Some(queue) = test_queue().await else { return };
        conformance::fifo_order(&queue).await;
    }

    #[tokio::test]
    async fn test_finish_rules() {
        let Some(queue) = test_queue().await else { return };
        conformance::finish_rules(&queue).await;
    }

    #[tokio::test]
    async fn test_delivery_tracking() {
        let Some(queue) = test_queue().await else { return };
        conformance::delivery_tracking(&queue).await;
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let Some(queue) = test_queue().await else { return };
        conformance::requeue_stale_returns_jobs(&queue).await;
    }

    #[tokio::test]
    async fn test_corrupt_job_hash_fails_job() {
        let Some(queue) = test_queue().await else { return };
        let bad = queue.enqueue(conformance::job(None, 1)).await.unwrap();
        let good = queue.enqueue(conformance::job(None, 2)).await.unwrap();
        let mut conn = queue.conn.clone();
        let _: () = conn
            .hset(queue.job_key(&bad.to_string()), "data", "{not json")
            .await
            .unwrap();

        conformance::corrupt_record_is_failed(&queue, good).await;
        let status: String = conn
            .hget(queue.job_key(&bad.to_string()), "status")
            .await
            .unwrap();
        assert_eq!(status, "FAILED");
    }

    #[tokio::test]
    async fn test_cleanup_old_jobs() {
        let Some(queue) = test_queue().await else { return };
        conformance::cleanup_removes_only_old_terminal(&queue).await;
    }

    #[tokio::test]
    async fn test_concurrent_instances_claim_distinct_jobs() {
        let Ok(url) = std::env::var("DISPATCH_TEST_REDIS_URL") else { return };
        let namespace = format!("test-{}", uuid::Uuid::new_v4().simple());
        let mut queues: Vec<Arc<dyn JobQueue>> = Vec::new();
        for _ in 0..3 {
            queues.push(Arc::new(RedisQueue::connect(&url, &namespace).await.unwrap()));
        }
        conformance::concurrent_claims_are_distinct(queues, 3).await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let err = match RedisQueue::connect("redis://127.0.0.1:1/0", "x").await {
            Ok(_) => return,
            Err(e) => e,
        };
        assert!(err.is_fatal());
    }
}
