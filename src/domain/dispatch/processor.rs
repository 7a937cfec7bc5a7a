//! Claim-and-process protocol for one popped job.
//!
//! The only interlock between concurrent workers is the broker's
//! single-consumer guarantee, so everything here operates on one
//! notification row at a time:
//!
//! 1. claim: row -> `processing`, touch `last_processed_at`, log `processing`
//! 2. dispatch by channel to the matching adapter under a hard timeout
//! 3. success: row -> `sent` (stamping `sent_at` once), log `delivered`
//!    with the provider response, ack the job
//! 4. failure: log `error`; permanent or exhausted -> `failed` + failed ack;
//!    otherwise increment `retry_count`, log `retry_scheduled`, enqueue a
//!    NEW delayed job at the same priority and ack the original. The broker
//!    never sees more than one attempt per job; retry is dispatcher-driven.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::domain::channel::{AdapterError, AdapterRegistry, DeliveryRequest};
use crate::domain::notification::{LogStatus, NewLog, Notification, NotificationStatus};
use crate::domain::queue::{DeliveryJob, EnqueueOptions, JobOutcome, JobQueue};
use crate::domain::retry::RetryPolicySet;
use crate::domain::store::NotificationStore;
use crate::metrics::{ADAPTER_SEND_SECONDS, JOBS_PROCESSED_TOTAL, RETRIES_SCHEDULED_TOTAL};

use super::DispatchError;

/// Processes one delivery job end to end.
pub struct JobProcessor {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn JobQueue>,
    adapters: Arc<AdapterRegistry>,
    policies: RetryPolicySet,
    adapter_timeout: Duration,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn JobQueue>,
        adapters: Arc<AdapterRegistry>,
        policies: RetryPolicySet,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            adapters,
            policies,
            adapter_timeout,
        }
    }

    /// Process a popped job. Failures are logged and settled against the
    /// broker; nothing propagates to the worker loop.
    #[tracing::instrument(
        name = "dispatch.process",
        skip(self, job),
        fields(job_id = %job.job_id, notification_id = job.notification_id, channel = %job.channel)
    )]
    pub async fn process(&self, job: DeliveryJob) {
        if let Err(e) = self.process_inner(&job).await {
            tracing::error!(
                job_id = %job.job_id,
                notification_id = job.notification_id,
                error = %e,
                "Job processing aborted"
            );
        }
    }

    async fn process_inner(&self, job: &DeliveryJob) -> Result<(), DispatchError> {
        let Some(notification) = self.store.find_by_id(job.notification_id).await? else {
            tracing::warn!(
                notification_id = job.notification_id,
                "Job references a missing notification, discarding"
            );
            self.queue.ack(job, JobOutcome::Completed).await?;
            return Ok(());
        };

        if notification.status.is_terminal() {
            tracing::debug!(
                notification_id = notification.id,
                status = %notification.status,
                "Row already terminal, discarding job"
            );
            self.queue.ack(job, JobOutcome::Completed).await?;
            return Ok(());
        }

        let claimed = self
            .store
            .update_status(
                notification.id,
                NotificationStatus::Processing,
                None,
                NewLog::new(
                    notification.id,
                    LogStatus::Processing,
                    format!("Delivery attempt {} started", notification.retry_count + 1),
                ),
            )
            .await?;
        if !claimed {
            // Lost a race against a terminal transition; nothing to do.
            self.queue.ack(job, JobOutcome::Completed).await?;
            return Ok(());
        }

        let Some(adapter) = self.adapters.get(notification.channel) else {
            let reason = format!("no adapter registered for channel {}", notification.channel);
            self.fail(job, &notification, &AdapterError::misconfigured(reason))
                .await?;
            return Ok(());
        };

        let request = DeliveryRequest::from_notification(&notification);
        let timer = ADAPTER_SEND_SECONDS
            .with_label_values(&[notification.channel.as_str()])
            .start_timer();
        let result = match tokio::time::timeout(self.adapter_timeout, adapter.send(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(AdapterError::transient(format!(
                "adapter call exceeded {}s timeout",
                self.adapter_timeout.as_secs()
            ))),
        };
        timer.observe_duration();

        match result {
            Ok(response) => {
                let provider_response = serde_json::to_value(&response)?;
                self.store
                    .update_status(
                        notification.id,
                        NotificationStatus::Sent,
                        None,
                        NewLog::new(
                            notification.id,
                            LogStatus::Delivered,
                            format!("Delivered via {}", notification.channel),
                        )
                        .with_provider_response(provider_response),
                    )
                    .await?;
                self.queue.ack(job, JobOutcome::Completed).await?;

                JOBS_PROCESSED_TOTAL
                    .with_label_values(&[notification.channel.as_str(), "delivered"])
                    .inc();
                tracing::info!(
                    notification_id = notification.id,
                    channel = %notification.channel,
                    message_id = ?response.message_id,
                    "Notification delivered"
                );
                Ok(())
            }
            Err(e) => self.handle_failure(job, &notification, e).await,
        }
    }

    async fn handle_failure(
        &self,
        job: &DeliveryJob,
        notification: &Notification,
        error: AdapterError,
    ) -> Result<(), DispatchError> {
        self.store
            .append_log(
                NewLog::new(notification.id, LogStatus::Error, error.message.clone())
                    .with_error_details(json!({
                        "message": error.message,
                        "kind": error.kind,
                        "timestamp": chrono::Utc::now(),
                    })),
            )
            .await?;

        let exhausted = notification.retry_count + 1 > notification.max_retries;
        if !error.is_retryable() || exhausted {
            return self.fail(job, notification, &error).await;
        }

        let policy = self.policies.for_channel(notification.channel);
        let new_count = self.store.increment_retry_count(notification.id).await?;
        let delay = policy.delay_for_attempt(new_count);

        self.store
            .update_status(
                notification.id,
                NotificationStatus::Retrying,
                Some(error.message.clone()),
                NewLog::new(
                    notification.id,
                    LogStatus::RetryScheduled,
                    format!(
                        "Retry {}/{} scheduled in {}ms",
                        new_count,
                        notification.max_retries,
                        delay.as_millis()
                    ),
                )
                .with_error_details(json!({
                    "last_error": error.message,
                    "delay_ms": delay.as_millis() as u64,
                })),
            )
            .await?;

        // A NEW job carries the retry; priority is preserved and the original
        // job is settled so the broker's own attempt counter stays at 1.
        let retry_job = DeliveryJob::attempt(
            notification.id,
            notification.channel,
            notification.priority,
            new_count,
        );
        self.queue
            .enqueue(retry_job, EnqueueOptions::delayed(delay))
            .await?;
        self.queue.ack(job, JobOutcome::Completed).await?;

        JOBS_PROCESSED_TOTAL
            .with_label_values(&[notification.channel.as_str(), "retried"])
            .inc();
        RETRIES_SCHEDULED_TOTAL
            .with_label_values(&[notification.channel.as_str()])
            .inc();
        tracing::warn!(
            notification_id = notification.id,
            channel = %notification.channel,
            retry = new_count,
            max_retries = notification.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error.message,
            "Delivery failed, retry scheduled"
        );

        Ok(())
    }

    async fn fail(
        &self,
        job: &DeliveryJob,
        notification: &Notification,
        error: &AdapterError,
    ) -> Result<(), DispatchError> {
        let reason = format!(
            "{} failure after {} retries: {}",
            error.kind, notification.retry_count, error.message
        );

        self.store
            .update_status(
                notification.id,
                NotificationStatus::Failed,
                Some(error.message.clone()),
                NewLog::new(notification.id, LogStatus::Failed, reason.clone()),
            )
            .await?;
        self.queue
            .ack(
                job,
                JobOutcome::Failed {
                    reason: error.message.clone(),
                },
            )
            .await?;

        JOBS_PROCESSED_TOTAL
            .with_label_values(&[notification.channel.as_str(), "failed"])
            .inc();
        tracing::error!(
            notification_id = notification.id,
            channel = %notification.channel,
            retry_count = notification.retry_count,
            kind = %error.kind,
            error = %error.message,
            "Notification failed"
        );

        Ok(())
    }
}
