//! Redis-backed durable priority queue.
//!
//! Layout per queue prefix:
//! - `{p}:waiting`   ZSET, score = priority rank * stride + enqueue sequence,
//!   so ZPOPMIN yields strict priority order with FIFO inside a priority
//! - `{p}:delayed`   ZSET, score = eligibility time in epoch millis
//! - `{p}:data`      HASH job_id -> JSON payload, covers every live job
//! - `{p}:active`    HASH of jobs currently held by a consumer
//! - `{p}:ids`       SET of every job id ever enqueued, backs dedup
//! - `{p}:failed`    LIST of JSON `FailedJob` entries, newest first
//! - `{p}:completed` counter
//! - `{p}:paused`    flag key
//!
//! ZPOPMIN is atomic, which is what gives single-delivery: two consumers can
//! never pop the same member. The move into `active` is a separate command;
//! a crash in that window is recovered by the stall sweeper, which is the
//! system-wide crash recovery path anyway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::domain::notification::Priority;
use crate::infrastructure::redis::{BrokerPoolError, RedisPool};

use super::backend::{
    priority_rank, DeliveryJob, EnqueueOptions, FailedJob, JobOutcome, JobQueue, QueueCounts,
    QueueError,
};

/// Spread between priority ranks in the waiting ZSET score. Leaves room for
/// ~10^12 FIFO sequence numbers per rank before ranks could collide.
const RANK_STRIDE: i64 = 1_000_000_000_000;

/// How many due delayed jobs are promoted per pop.
const PROMOTE_BATCH: isize = 100;

impl From<BrokerPoolError> for QueueError {
    fn from(err: BrokerPoolError) -> Self {
        match err {
            BrokerPoolError::Redis(e) => QueueError::Redis(e),
            BrokerPoolError::ConnectionUnavailable(msg) => QueueError::Unavailable(msg),
        }
    }
}

/// Durable notification queue on Redis.
pub struct RedisQueue {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl RedisQueue {
    pub fn new(pool: Arc<RedisPool>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Next waiting-set score for a job at the given priority.
    async fn waiting_score(
        &self,
        conn: &mut MultiplexedConnection,
        priority: Priority,
    ) -> Result<i64, QueueError> {
        let seq: i64 = conn.incr(self.key("seq"), 1).await?;
        Ok(priority_rank(priority) * RANK_STRIDE + seq)
    }

    /// Place a job payload into the waiting or delayed set. Does not consult
    /// the dedup set; callers decide whether dedup applies.
    async fn push(
        &self,
        conn: &mut MultiplexedConnection,
        job: &DeliveryJob,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let _: () = conn.hset(self.key("data"), &job.job_id, &payload).await?;

        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let eligible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                let _: () = conn.zadd(self.key("delayed"), &job.job_id, eligible_at).await?;
            }
            _ => {
                let score = self.waiting_score(conn, job.priority).await?;
                let _: () = conn.zadd(self.key("waiting"), &job.job_id, score).await?;
            }
        }

        Ok(())
    }

    /// Move delayed jobs whose delay has elapsed into the waiting set at
    /// their priority.
    async fn promote_due(&self, conn: &mut MultiplexedConnection) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(self.key("delayed"), 0i64, now_ms, 0, PROMOTE_BATCH)
            .await?;

        for job_id in due {
            let payload: Option<String> = conn.hget(self.key("data"), &job_id).await?;
            match payload {
                Some(payload) => {
                    let job: DeliveryJob = serde_json::from_str(&payload)?;
                    let score = self.waiting_score(conn, job.priority).await?;
                    let _: () = redis::pipe()
                        .atomic()
                        .zadd(self.key("waiting"), &job_id, score)
                        .zrem(self.key("delayed"), &job_id)
                        .query_async(conn)
                        .await?;
                }
                None => {
                    tracing::warn!(job_id = %job_id, "Delayed job has no payload, dropping");
                    let _: () = conn.zrem(self.key("delayed"), &job_id).await?;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: DeliveryJob, opts: EnqueueOptions) -> Result<bool, QueueError> {
        let mut conn = self.pool.get_connection().await?;

        let added: i64 = conn.sadd(self.key("ids"), &job.job_id).await?;
        if added == 0 {
            tracing::debug!(job_id = %job.job_id, "Duplicate enqueue deduplicated");
            return Ok(false);
        }

        self.push(&mut conn, &job, opts).await?;

        tracing::trace!(
            job_id = %job.job_id,
            notification_id = job.notification_id,
            priority = %job.priority,
            delayed = opts.delay.is_some(),
            "Job enqueued"
        );

        Ok(true)
    }

    async fn enqueue_bulk(
        &self,
        jobs: Vec<(DeliveryJob, EnqueueOptions)>,
    ) -> Result<usize, QueueError> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get_connection().await?;

        // One pipelined round trip for dedup.
        let mut dedup = redis::pipe();
        for (job, _) in &jobs {
            dedup.sadd(self.key("ids"), &job.job_id);
        }
        let added: Vec<i64> = dedup.query_async(&mut conn).await?;

        let mut accepted: Vec<(&DeliveryJob, EnqueueOptions)> = Vec::new();
        for ((job, opts), added) in jobs.iter().zip(added) {
            if added == 1 {
                accepted.push((job, *opts));
            }
        }
        if accepted.is_empty() {
            return Ok(0);
        }

        // Reserve a contiguous block of FIFO sequence numbers, then land all
        // payloads and set members in one atomic pipeline.
        let seq_end: i64 = conn
            .incr(self.key("seq"), accepted.len() as i64)
            .await?;
        let mut seq = seq_end - accepted.len() as i64;
        let now_ms = Utc::now().timestamp_millis();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (job, opts) in &accepted {
            let payload = serde_json::to_string(job)?;
            pipe.hset(self.key("data"), &job.job_id, payload).ignore();
            match opts.delay {
                Some(delay) if !delay.is_zero() => {
                    pipe.zadd(
                        self.key("delayed"),
                        &job.job_id,
                        now_ms + delay.as_millis() as i64,
                    )
                    .ignore();
                }
                _ => {
                    seq += 1;
                    pipe.zadd(
                        self.key("waiting"),
                        &job.job_id,
                        priority_rank(job.priority) * RANK_STRIDE + seq,
                    )
                    .ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::debug!(enqueued = accepted.len(), "Bulk enqueue completed");
        Ok(accepted.len())
    }

    async fn pop(&self) -> Result<Option<DeliveryJob>, QueueError> {
        let mut conn = self.pool.get_connection().await?;

        let paused: bool = conn.exists(self.key("paused")).await?;
        if paused {
            return Ok(None);
        }

        self.promote_due(&mut conn).await?;

        let popped: Vec<(String, f64)> = conn.zpopmin(self.key("waiting"), 1).await?;
        let Some((job_id, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };

        let payload: Option<String> = conn.hget(self.key("data"), &job_id).await?;
        let Some(payload) = payload else {
            tracing::warn!(job_id = %job_id, "Popped job has no payload, skipping");
            return Ok(None);
        };

        let job: DeliveryJob = serde_json::from_str(&payload)?;
        let _: () = conn.hset(self.key("active"), &job_id, &payload).await?;

        Ok(Some(job))
    }

    async fn ack(&self, job: &DeliveryJob, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut conn = self.pool.get_connection().await?;

        let _: () = redis::pipe()
            .atomic()
            .hdel(self.key("active"), &job.job_id)
            .hdel(self.key("data"), &job.job_id)
            .query_async(&mut conn)
            .await?;

        match outcome {
            JobOutcome::Completed => {
                let _: i64 = conn.incr(self.key("completed"), 1).await?;
            }
            JobOutcome::Failed { reason } => {
                let entry = FailedJob {
                    job: job.clone(),
                    reason,
                    failed_at: Utc::now(),
                };
                let _: () = conn
                    .lpush(self.key("failed"), serde_json::to_string(&entry)?)
                    .await?;
            }
        }

        Ok(())
    }

    async fn has_live_job(&self, notification_id: i64) -> Result<bool, QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let ids: Vec<String> = conn.hkeys(self.key("data")).await?;
        Ok(ids
            .iter()
            .any(|id| DeliveryJob::belongs_to(id, notification_id)))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.pool.get_connection().await?;

        let waiting: u64 = conn.zcard(self.key("waiting")).await?;
        let delayed: u64 = conn.zcard(self.key("delayed")).await?;
        let active: u64 = conn.hlen(self.key("active")).await?;
        let completed: Option<u64> = conn.get(self.key("completed")).await?;
        let failed: u64 = conn.llen(self.key("failed")).await?;
        let paused: bool = conn.exists(self.key("paused")).await?;

        Ok(QueueCounts {
            waiting,
            active,
            completed: completed.unwrap_or(0),
            failed,
            delayed,
            paused,
        })
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let entries: Vec<String> = conn.lrange(self.key("failed"), 0, -1).await?;

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_str::<FailedJob>(&entry) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unparseable failed-job entry");
                }
            }
        }

        Ok(jobs)
    }

    async fn pause(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let _: () = conn.set(self.key("paused"), 1).await?;
        tracing::info!(queue = %self.prefix, "Queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let _: () = conn.del(self.key("paused")).await?;
        tracing::info!(queue = %self.prefix, "Queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let paused: bool = conn.exists(self.key("paused")).await?;
        Ok(paused)
    }

    async fn clean_failed(&self, older_than: Duration) -> Result<usize, QueueError> {
        let mut conn = self.pool.get_connection().await?;
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let entries: Vec<String> = conn.lrange(self.key("failed"), 0, -1).await?;
        let mut kept = Vec::new();
        let mut removed = 0;

        for entry in &entries {
            match serde_json::from_str::<FailedJob>(entry) {
                Ok(job) if job.failed_at < cutoff => removed += 1,
                Ok(_) => kept.push(entry.clone()),
                // Unparseable entries are garbage either way
                Err(_) => removed += 1,
            }
        }

        let _: () = conn.del(self.key("failed")).await?;
        for entry in &kept {
            let _: () = conn.rpush(self.key("failed"), entry).await?;
        }

        tracing::info!(removed = removed, kept = kept.len(), "Cleaned failed jobs");
        Ok(removed)
    }

    async fn retry_failed(&self) -> Result<usize, QueueError> {
        let mut conn = self.pool.get_connection().await?;

        let entries: Vec<String> = conn.lrange(self.key("failed"), 0, -1).await?;
        let _: () = conn.del(self.key("failed")).await?;

        let mut retried = 0;
        for entry in entries {
            match serde_json::from_str::<FailedJob>(&entry) {
                Ok(failed) => {
                    self.push(&mut conn, &failed.job, EnqueueOptions::default())
                        .await?;
                    retried += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unparseable failed-job entry on retry");
                }
            }
        }

        tracing::info!(retried = retried, "Re-enqueued failed jobs");
        Ok(retried)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.pool.ping().await?;
        Ok(())
    }
}
