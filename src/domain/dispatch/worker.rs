//! Concurrent worker pool over the notifications queue.
//!
//! Up to N workers pop and process jobs in parallel; a pool-wide token
//! bucket caps throughput at R jobs per window. Each worker is
//! single-threaded with respect to its own job: its only suspension points
//! are the queue pop, store writes, the adapter call and the re-enqueue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;
use crate::domain::queue::JobQueue;
use crate::metrics::{RATE_LIMITED_TOTAL, WORKER_POOL_RUNNING};
use crate::ratelimit::TokenBucket;

use super::JobProcessor;

/// Worker pool bound to one queue.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    config: WorkerConfig,
    limiter: TokenBucket,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let limiter = TokenBucket::new(config.rate_limit_max, config.rate_limit_window_ms);

        Self {
            queue,
            processor,
            config,
            limiter,
            running: AtomicBool::new(false),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks. Idempotent: a running pool is left alone.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        WORKER_POOL_RUNNING.set(1);

        let mut handles = self.handles.lock().expect("worker handles poisoned");
        for worker_id in 0..self.config.concurrency {
            let pool = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown_rx).await;
            }));
        }

        tracing::info!(
            workers = self.config.concurrency,
            rate_limit_max = self.config.rate_limit_max,
            rate_limit_window_ms = self.config.rate_limit_window_ms,
            "Worker pool started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::debug!(worker_id, "Worker started");

        loop {
            if !self.is_running() {
                break;
            }

            if !self.limiter.try_consume() {
                RATE_LIMITED_TOTAL.inc();
                if self.idle_wait(&mut shutdown_rx).await {
                    break;
                }
                continue;
            }

            match self.queue.pop().await {
                Ok(Some(job)) => {
                    // Runs to completion; shutdown waits for this in the
                    // grace period rather than cancelling mid-send.
                    self.processor.process(job).await;
                }
                Ok(None) => {
                    if self.idle_wait(&mut shutdown_rx).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Queue pop failed");
                    if self.idle_wait(&mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Sleep one poll interval (with a little jitter so idle workers do not
    /// hammer the broker in lockstep); returns true when shutdown arrived
    /// instead.
    async fn idle_wait(&self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        let jitter = rand::thread_rng().gen_range(0..=self.config.poll_interval_ms / 4);
        tokio::select! {
            _ = shutdown_rx.recv() => true,
            _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms + jitter)) => false,
        }
    }

    /// Stop accepting jobs, then wait up to the grace period for in-flight
    /// jobs to drain. Jobs that do not drain are left for the stall sweeper
    /// on the next boot.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        WORKER_POOL_RUNNING.set(0);
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().expect("worker handles poisoned"));

        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        match tokio::time::timeout(grace, join_all(handles)).await {
            Ok(_) => tracing::info!("Worker pool drained"),
            Err(_) => tracing::warn!(
                grace_seconds = self.config.shutdown_grace_seconds,
                "Worker pool did not drain in time; in-flight jobs are left for the stall sweeper"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::channel::AdapterRegistry;
    use crate::domain::notification::{Channel, NewNotification, Priority};
    use crate::domain::queue::{DeliveryJob, EnqueueOptions, MemoryQueue};
    use crate::domain::retry::RetryPolicySet;
    use crate::domain::store::{MemoryStore, NotificationStore};
    use chrono::Utc;

    fn test_pool(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn NotificationStore>,
    ) -> Arc<WorkerPool> {
        let processor = Arc::new(JobProcessor::new(
            store,
            queue.clone(),
            Arc::new(AdapterRegistry::new()),
            RetryPolicySet::default(),
            Duration::from_secs(1),
        ));
        let config = WorkerConfig {
            concurrency: 2,
            poll_interval_ms: 10,
            shutdown_grace_seconds: 1,
            ..WorkerConfig::default()
        };
        Arc::new(WorkerPool::new(queue, processor, config))
    }

    #[tokio::test]
    async fn test_pool_starts_and_shuts_down() {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
        let store: Arc<dyn NotificationStore> = Arc::new(MemoryStore::new());
        let pool = test_pool(queue, store);

        pool.start();
        assert!(pool.is_running());

        pool.shutdown().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new());
        let store: Arc<dyn NotificationStore> = Arc::new(MemoryStore::new());

        // A row without a registered adapter fails terminally, which is
        // enough to observe the pool consuming jobs.
        let n = store
            .create(NewNotification {
                user_id: None,
                channel: Channel::Email,
                recipient: "a@b.c".to_string(),
                subject: None,
                content: "hi".to_string(),
                priority: Priority::Normal,
                max_retries: 0,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();
        queue
            .enqueue(
                DeliveryJob::attempt(n.id, Channel::Email, Priority::Normal, 0),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let pool = test_pool(queue.clone(), store.clone());
        pool.start();

        let mut drained = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let counts = queue.counts().await.unwrap();
            if counts.waiting == 0 && counts.active == 0 {
                drained = true;
                break;
            }
        }
        pool.shutdown().await;

        assert!(drained, "pool never consumed the enqueued job");
    }
}
