//! Backend trait for the durable notification job queue.
//!
//! The queue holds broker-level jobs, one per pending or in-flight delivery
//! attempt. The broker is authoritative for "what is in flight"; the
//! relational store is authoritative for business state. Jobs are popped in
//! strict priority order (urgent before high before normal before low), FIFO
//! within a priority, and delayed jobs stay invisible until their delay
//! elapses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::notification::{Channel, Priority};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Broker operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Job payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Broker is temporarily unavailable
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// A broker-level unit representing one delivery attempt for one notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Caller-provided stable identity; replays of the same logical enqueue
    /// are deduplicated on this id.
    pub job_id: String,
    pub notification_id: i64,
    pub channel: Channel,
    pub priority: Priority,
}

impl DeliveryJob {
    /// Job for delivery attempt `attempt` of a notification. Attempt 0 is the
    /// initial send; each dispatcher-driven retry gets a fresh identity.
    pub fn attempt(notification_id: i64, channel: Channel, priority: Priority, attempt: i32) -> Self {
        Self {
            job_id: format!("notification-{}-{}", notification_id, attempt),
            notification_id,
            channel,
            priority,
        }
    }

    /// Job re-enqueued by the stall sweeper. The nonce keeps recovery ids
    /// unique across sweep ticks so dedup never blocks a later recovery.
    pub fn recovery(notification_id: i64, channel: Channel, priority: Priority, nonce: i64) -> Self {
        Self {
            job_id: format!("notification-{}-stall-{}", notification_id, nonce),
            notification_id,
            channel,
            priority,
        }
    }

    /// Job created by an operator-initiated retry; always a fresh identity
    /// so dedup never blocks a deliberate re-delivery.
    pub fn manual(notification_id: i64, channel: Channel, priority: Priority, nonce: i64) -> Self {
        Self {
            job_id: format!("notification-{}-manual-{}", notification_id, nonce),
            notification_id,
            channel,
            priority,
        }
    }

    /// True when this job belongs to the given notification row.
    pub fn belongs_to(job_id: &str, notification_id: i64) -> bool {
        job_id.starts_with(&format!("notification-{}-", notification_id))
    }
}

/// Options for a single enqueue.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Job stays invisible for this long, then joins the eligible set at its
    /// priority.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

/// How a consumer settles a popped job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
}

/// A job parked on the broker's failed set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub job: DeliveryJob,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Introspection counts for the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

/// Durable priority queue contract.
///
/// Implementations must guarantee single-delivery: while a job is held by a
/// consumer it is not handed to another. Crash recovery of jobs lost
/// mid-flight is the stall sweeper's responsibility, not the queue's.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue one job. Returns `false` when the job id was already seen and
    /// the enqueue was deduplicated.
    async fn enqueue(&self, job: DeliveryJob, opts: EnqueueOptions) -> Result<bool, QueueError>;

    /// Enqueue many jobs in one round trip. Returns the number actually
    /// enqueued after dedup.
    async fn enqueue_bulk(
        &self,
        jobs: Vec<(DeliveryJob, EnqueueOptions)>,
    ) -> Result<usize, QueueError>;

    /// Pop the highest-priority eligible job, or `None` when the queue is
    /// empty or paused. The popped job is held by this consumer until `ack`.
    async fn pop(&self) -> Result<Option<DeliveryJob>, QueueError>;

    /// Settle a popped job. `Failed` parks it on the broker's failed set for
    /// operator inspection; the notification row is untouched either way.
    async fn ack(&self, job: &DeliveryJob, outcome: JobOutcome) -> Result<(), QueueError>;

    /// Whether any live job (waiting, delayed, or active) exists for the
    /// notification. Used by the stall sweeper before re-enqueueing.
    async fn has_live_job(&self, notification_id: i64) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, QueueError>;

    /// Stop handing out new jobs. In-flight jobs are unaffected.
    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> Result<bool, QueueError>;

    /// Remove failed jobs older than the cutoff. Returns how many were
    /// removed.
    async fn clean_failed(&self, older_than: Duration) -> Result<usize, QueueError>;

    /// Re-enqueue every failed job at its original priority, bypassing dedup
    /// (this is the broker's own retry primitive). Returns how many moved.
    async fn retry_failed(&self) -> Result<usize, QueueError>;

    /// Broker connectivity probe.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Rank used to order the eligible set: lower rank pops first, so the rank
/// inverts the priority weight. FIFO within a rank comes from the enqueue
/// sequence number.
pub(crate) fn priority_rank(priority: Priority) -> i64 {
    (10 - priority.queue_weight()) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_identity_is_stable_per_attempt() {
        let a = DeliveryJob::attempt(7, Channel::Email, Priority::Normal, 0);
        let b = DeliveryJob::attempt(7, Channel::Email, Priority::Normal, 0);
        let c = DeliveryJob::attempt(7, Channel::Email, Priority::Normal, 1);

        assert_eq!(a.job_id, b.job_id);
        assert_ne!(a.job_id, c.job_id);
    }

    #[test]
    fn test_job_prefix_matches_notification() {
        let job = DeliveryJob::attempt(42, Channel::Sms, Priority::High, 2);
        assert!(DeliveryJob::belongs_to(&job.job_id, 42));
        assert!(!DeliveryJob::belongs_to(&job.job_id, 4));
    }

    #[test]
    fn test_priority_rank_orders_urgent_first() {
        assert!(priority_rank(Priority::Urgent) < priority_rank(Priority::High));
        assert!(priority_rank(Priority::High) < priority_rank(Priority::Normal));
        assert!(priority_rank(Priority::Normal) < priority_rank(Priority::Low));
    }
}
