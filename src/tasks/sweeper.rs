//! Stall recovery sweeper.
//!
//! The sole mechanism for recovering jobs held by dead workers: a row stuck
//! in `processing` past the stall threshold, with no live broker job, is
//! re-enqueued at its current priority. Because the worker may have hit the
//! provider before dying, delivery is at-least-once; adapters set provider
//! deduplication keys where they can.
//!
//! The sweeper also repairs `pending` rows whose enqueue never reached the
//! broker (for example a broker outage right after submission); dedup on the
//! attempt job id makes that repair idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::WorkerConfig;
use crate::domain::notification::{LogStatus, NewLog};
use crate::domain::queue::{DeliveryJob, EnqueueOptions, JobQueue};
use crate::domain::store::NotificationStore;
use crate::metrics::STALLS_RECOVERED_TOTAL;

/// How many pending rows one repair pass will look at.
const PENDING_REPAIR_BATCH: i64 = 100;

/// Background task that reclaims stalled and orphaned rows.
pub struct StallSweeper {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn JobQueue>,
    config: WorkerConfig,
    shutdown: broadcast::Receiver<()>,
}

impl StallSweeper {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn JobQueue>,
        config: WorkerConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_seconds));
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            sweep_interval_seconds = self.config.sweep_interval_seconds,
            stall_threshold_minutes = self.config.stall_threshold_minutes,
            "Stall sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Stall sweeper received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Stall sweeper stopped");
    }

    /// One sweep tick: each stalled row is re-enqueued at most once.
    pub async fn sweep(&self) {
        self.recover_stalled().await;
        self.repair_pending().await;
    }

    async fn recover_stalled(&self) {
        let stale = match self
            .store
            .list_stale(self.config.stall_threshold_minutes)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Stall sweep could not list stale rows");
                return;
            }
        };

        for row in stale {
            match self.queue.has_live_job(row.id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(notification_id = row.id, error = %e, "Broker probe failed during sweep");
                    continue;
                }
            }

            let job = DeliveryJob::recovery(
                row.id,
                row.channel,
                row.priority,
                Utc::now().timestamp_millis(),
            );
            if let Err(e) = self.queue.enqueue(job, EnqueueOptions::default()).await {
                tracing::error!(notification_id = row.id, error = %e, "Failed to re-enqueue stalled row");
                continue;
            }

            if let Err(e) = self
                .store
                .append_log(NewLog::new(
                    row.id,
                    LogStatus::StallRecovered,
                    format!(
                        "Re-enqueued after stalling in processing for over {} minutes",
                        self.config.stall_threshold_minutes
                    ),
                ))
                .await
            {
                tracing::warn!(notification_id = row.id, error = %e, "Failed to log stall recovery");
            }

            STALLS_RECOVERED_TOTAL.inc();
            tracing::warn!(
                notification_id = row.id,
                channel = %row.channel,
                "Stalled notification re-enqueued"
            );
        }
    }

    /// Re-enqueue eligible `pending` rows with no broker job. Dedup on the
    /// stable attempt id means a row that already has its job is untouched.
    async fn repair_pending(&self) {
        let pending = match self.store.list_pending(PENDING_REPAIR_BATCH).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Pending repair could not list rows");
                return;
            }
        };

        for row in pending {
            let job = DeliveryJob::attempt(row.id, row.channel, row.priority, row.retry_count);
            match self.queue.enqueue(job, EnqueueOptions::default()).await {
                Ok(true) => {
                    if let Err(e) = self.store.mark_queued_bulk(&[row.id]).await {
                        tracing::warn!(notification_id = row.id, error = %e, "Failed to mark repaired row queued");
                    }
                    tracing::info!(
                        notification_id = row.id,
                        "Pending row re-enqueued after lost broker state"
                    );
                }
                Ok(false) => {
                    // Job already exists; the row just has not been claimed yet.
                }
                Err(e) => {
                    tracing::error!(notification_id = row.id, error = %e, "Failed to repair pending row");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{
        Channel, NewNotification, NotificationStatus, Priority,
    };
    use crate::domain::queue::MemoryQueue;
    use crate::domain::store::MemoryStore;

    fn sweeper(
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
    ) -> (StallSweeper, broadcast::Sender<()>) {
        let (tx, rx) = broadcast::channel(1);
        let sweeper = StallSweeper::new(
            store as Arc<dyn NotificationStore>,
            queue as Arc<dyn JobQueue>,
            WorkerConfig::default(),
            rx,
        );
        (sweeper, tx)
    }

    async fn processing_row(store: &MemoryStore) -> i64 {
        let n = store
            .create(NewNotification {
                user_id: None,
                channel: Channel::Email,
                recipient: "a@b.c".to_string(),
                subject: None,
                content: "hi".to_string(),
                priority: Priority::High,
                max_retries: 3,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .update_status(
                n.id,
                NotificationStatus::Processing,
                None,
                NewLog::new(n.id, LogStatus::Processing, "claimed"),
            )
            .await
            .unwrap();
        n.id
    }

    #[tokio::test]
    async fn test_stalled_row_re_enqueued_once_per_sweep() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let (sweeper, _tx) = sweeper(store.clone(), queue.clone());

        let id = processing_row(&store).await;
        store.backdate_last_processed(id, 45);

        sweeper.sweep().await;
        assert_eq!(queue.counts().await.unwrap().waiting, 1);

        let logs = store.logs_for(id).await.unwrap();
        assert!(logs
            .iter()
            .any(|l| l.status == LogStatus::StallRecovered));

        // The recovery job is live now, so a second sweep does nothing.
        sweeper.sweep().await;
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_fresh_processing_row_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let (sweeper, _tx) = sweeper(store.clone(), queue.clone());

        let _id = processing_row(&store).await;

        sweeper.sweep().await;
        assert_eq!(queue.counts().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_pending_row_with_lost_broker_state_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let (sweeper, _tx) = sweeper(store.clone(), queue.clone());

        let n = store
            .create(NewNotification {
                user_id: None,
                channel: Channel::Sms,
                recipient: "+15551234567".to_string(),
                subject: None,
                content: "hi".to_string(),
                priority: Priority::Normal,
                max_retries: 3,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();

        sweeper.sweep().await;

        assert_eq!(queue.counts().await.unwrap().waiting, 1);
        let row = store.find_by_id(n.id).await.unwrap().unwrap();
        assert_eq!(row.status, NotificationStatus::Queued);
    }
}
