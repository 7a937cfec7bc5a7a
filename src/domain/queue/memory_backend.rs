//! In-memory queue backend.
//!
//! Implements the full `JobQueue` contract against process-local state. Used
//! by the integration tests and available as a broker-less development mode;
//! durability is obviously not provided.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::backend::{
    priority_rank, DeliveryJob, EnqueueOptions, FailedJob, JobOutcome, JobQueue, QueueCounts,
    QueueError,
};

#[derive(Default)]
struct MemoryQueueState {
    seq: u64,
    /// (priority rank, enqueue seq) -> job_id; iteration order is pop order.
    waiting: BTreeMap<(i64, u64), String>,
    /// (eligible-at millis, enqueue seq) -> job_id
    delayed: BTreeMap<(i64, u64), String>,
    data: HashMap<String, DeliveryJob>,
    seen: HashSet<String>,
    active: HashMap<String, DeliveryJob>,
    failed: Vec<FailedJob>,
    completed: u64,
    paused: bool,
}

impl MemoryQueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn push(&mut self, job: DeliveryJob, opts: EnqueueOptions) {
        let seq = self.next_seq();
        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let eligible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
                self.delayed.insert((eligible_at, seq), job.job_id.clone());
            }
            _ => {
                self.waiting
                    .insert((priority_rank(job.priority), seq), job.job_id.clone());
            }
        }
        self.data.insert(job.job_id.clone(), job);
    }

    fn promote_due(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<(i64, u64)> = self
            .delayed
            .range(..(now_ms + 1, 0))
            .map(|(k, _)| *k)
            .collect();

        for key in due {
            if let Some(job_id) = self.delayed.remove(&key) {
                if let Some(job) = self.data.get(&job_id) {
                    let seq = self.seq + 1;
                    self.seq = seq;
                    self.waiting
                        .insert((priority_rank(job.priority), seq), job_id);
                }
            }
        }
    }
}

/// Process-local `JobQueue` implementation.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: DeliveryJob, opts: EnqueueOptions) -> Result<bool, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");

        if !state.seen.insert(job.job_id.clone()) {
            tracing::debug!(job_id = %job.job_id, "Duplicate enqueue deduplicated");
            return Ok(false);
        }

        state.push(job, opts);
        Ok(true)
    }

    async fn enqueue_bulk(
        &self,
        jobs: Vec<(DeliveryJob, EnqueueOptions)>,
    ) -> Result<usize, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let mut enqueued = 0;

        for (job, opts) in jobs {
            if !state.seen.insert(job.job_id.clone()) {
                continue;
            }
            state.push(job, opts);
            enqueued += 1;
        }

        Ok(enqueued)
    }

    async fn pop(&self) -> Result<Option<DeliveryJob>, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");

        if state.paused {
            return Ok(None);
        }

        state.promote_due();

        let Some((&key, _)) = state.waiting.iter().next() else {
            return Ok(None);
        };
        let job_id = state.waiting.remove(&key).expect("key just observed");

        let Some(job) = state.data.get(&job_id).cloned() else {
            return Ok(None);
        };
        state.active.insert(job_id, job.clone());

        Ok(Some(job))
    }

    async fn ack(&self, job: &DeliveryJob, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");

        state.active.remove(&job.job_id);
        state.data.remove(&job.job_id);

        match outcome {
            JobOutcome::Completed => state.completed += 1,
            JobOutcome::Failed { reason } => state.failed.push(FailedJob {
                job: job.clone(),
                reason,
                failed_at: Utc::now(),
            }),
        }

        Ok(())
    }

    async fn has_live_job(&self, notification_id: i64) -> Result<bool, QueueError> {
        let state = self.state.lock().expect("queue state poisoned");
        Ok(state
            .data
            .keys()
            .any(|id| DeliveryJob::belongs_to(id, notification_id)))
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().expect("queue state poisoned");
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
            paused: state.paused,
        })
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, QueueError> {
        let state = self.state.lock().expect("queue state poisoned");
        Ok(state.failed.clone())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.state.lock().expect("queue state poisoned").paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.state.lock().expect("queue state poisoned").paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().expect("queue state poisoned").paused)
    }

    async fn clean_failed(&self, older_than: Duration) -> Result<usize, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();

        let before = state.failed.len();
        state.failed.retain(|f| f.failed_at >= cutoff);
        Ok(before - state.failed.len())
    }

    async fn retry_failed(&self) -> Result<usize, QueueError> {
        let mut state = self.state.lock().expect("queue state poisoned");

        let failed = std::mem::take(&mut state.failed);
        let retried = failed.len();
        for entry in failed {
            state.push(entry.job, EnqueueOptions::default());
        }

        Ok(retried)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{Channel, Priority};

    fn job(id: i64, priority: Priority, attempt: i32) -> DeliveryJob {
        DeliveryJob::attempt(id, Channel::Email, priority, attempt)
    }

    #[tokio::test]
    async fn test_pop_respects_priority_then_fifo() {
        let queue = MemoryQueue::new();

        for id in 1..=3 {
            queue
                .enqueue(job(id, Priority::Normal, 0), EnqueueOptions::default())
                .await
                .unwrap();
        }
        queue
            .enqueue(job(99, Priority::Urgent, 0), EnqueueOptions::default())
            .await
            .unwrap();

        let order: Vec<i64> = {
            let mut out = Vec::new();
            while let Some(j) = queue.pop().await.unwrap() {
                out.push(j.notification_id);
                queue.ack(&j, JobOutcome::Completed).await.unwrap();
            }
            out
        };

        assert_eq!(order, vec![99, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_duplicate_job_id_deduplicated() {
        let queue = MemoryQueue::new();

        assert!(queue
            .enqueue(job(1, Priority::Normal, 0), EnqueueOptions::default())
            .await
            .unwrap());
        assert!(!queue
            .enqueue(job(1, Priority::Normal, 0), EnqueueOptions::default())
            .await
            .unwrap());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_invisible_until_expiry() {
        let queue = MemoryQueue::new();

        queue
            .enqueue(
                job(1, Priority::Urgent, 0),
                EnqueueOptions::delayed(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert!(queue.pop().await.unwrap().is_none());
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_paused_queue_hands_out_nothing() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(job(1, Priority::Normal, 0), EnqueueOptions::default())
            .await
            .unwrap();

        queue.pause().await.unwrap();
        assert!(queue.is_paused().await.unwrap());
        assert!(queue.pop().await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(!queue.is_paused().await.unwrap());
        assert!(queue.pop().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_jobs_park_and_retry() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(job(1, Priority::Normal, 0), EnqueueOptions::default())
            .await
            .unwrap();

        let popped = queue.pop().await.unwrap().unwrap();
        queue
            .ack(
                &popped,
                JobOutcome::Failed {
                    reason: "smtp 550".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(queue.counts().await.unwrap().failed, 1);
        let failed = queue.failed_jobs().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, "smtp 550");

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        assert_eq!(queue.counts().await.unwrap().failed, 0);

        // The retried job is poppable again despite the seen dedup set.
        assert!(queue.pop().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_live_job_tracking() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(job(5, Priority::Normal, 0), EnqueueOptions::default())
            .await
            .unwrap();

        assert!(queue.has_live_job(5).await.unwrap());
        assert!(!queue.has_live_job(6).await.unwrap());

        let popped = queue.pop().await.unwrap().unwrap();
        // Held by a consumer still counts as live.
        assert!(queue.has_live_job(5).await.unwrap());

        queue.ack(&popped, JobOutcome::Completed).await.unwrap();
        assert!(!queue.has_live_job(5).await.unwrap());
    }
}
