//! Self-health probe for the standalone worker process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::domain::queue::JobQueue;
use crate::domain::store::NotificationStore;

/// Probe cadence in seconds.
const PROBE_INTERVAL_SECONDS: u64 = 30;

/// Periodically checks store and broker connectivity and logs when either
/// side is unhealthy.
pub struct HealthProbe {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn JobQueue>,
    shutdown: broadcast::Receiver<()>,
}

impl HealthProbe {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn JobQueue>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            store,
            queue,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(Duration::from_secs(PROBE_INTERVAL_SECONDS));
        timer.tick().await;

        tracing::info!(
            interval_seconds = PROBE_INTERVAL_SECONDS,
            "Worker health probe started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,
                _ = timer.tick() => self.probe().await,
            }
        }

        tracing::info!("Worker health probe stopped");
    }

    async fn probe(&self) {
        let database_ok = self.store.ping().await.is_ok();
        let broker_ok = self.queue.ping().await.is_ok();

        if database_ok && broker_ok {
            tracing::debug!("Worker health probe passed");
        } else {
            tracing::error!(
                database = database_ok,
                broker = broker_ok,
                "Worker unhealthy"
            );
        }
    }
}
