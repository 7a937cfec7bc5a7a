//! Submission path and admin operations.
//!
//! A submission fans out into one row per channel, one bulk enqueue, and one
//! batched move to `queued`. Admin operations reconcile the dual source of
//! truth: broker-side primitives (pause, resume, clean, retry) proxy to the
//! queue, and a separate store-driven retry re-enqueues rows whose broker
//! state was lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domain::notification::{
    Channel, LogStatus, NewLog, NewNotification, Notification, Priority,
};
use crate::domain::queue::{DeliveryJob, EnqueueOptions, JobQueue, QueueCounts};
use crate::domain::retry::RetryPolicySet;
use crate::domain::store::NotificationStore;
use crate::domain::template::substitute_variables;
use crate::metrics::NOTIFICATIONS_SUBMITTED_TOTAL;

use super::DispatchError;

/// One channel target inside a submission. The recipient may be omitted when
/// the submission names a user with a stored address for the channel.
#[derive(Debug, Clone)]
pub struct SubmitChannel {
    pub channel: Channel,
    pub recipient: Option<String>,
}

/// A validated logical notification submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub user_id: Option<i64>,
    pub subject: Option<String>,
    pub message: String,
    pub channels: Vec<SubmitChannel>,
    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

/// What a submission produced.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitOutcome {
    /// All created row ids, in channel order
    pub notification_ids: Vec<i64>,
    /// The id reported back to the caller (first created row)
    pub first_id: i64,
}

/// Snapshot reported by the health surface.
#[derive(Debug, Serialize)]
pub struct SystemHealth {
    pub healthy: bool,
    pub broker: &'static str,
    pub worker_pool_running: bool,
    pub queue: Option<QueueCounts>,
    pub database: bool,
}

/// Submission and admin facade over the store and the queue.
pub struct DispatchService {
    store: Arc<dyn NotificationStore>,
    queue: Arc<dyn JobQueue>,
    policies: RetryPolicySet,
}

impl DispatchService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        queue: Arc<dyn JobQueue>,
        policies: RetryPolicySet,
    ) -> Self {
        Self {
            store,
            queue,
            policies,
        }
    }

    /// Create one row per channel, bulk-enqueue their jobs, and move the
    /// batch to `queued`.
    ///
    /// Recipient resolution happens before anything is persisted, so a
    /// validation failure leaves no partial state. A broker failure after row
    /// creation propagates; the rows stay `pending` and the sweeper
    /// re-enqueues them once the broker recovers.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, DispatchError> {
        if submission.channels.is_empty() {
            return Err(DispatchError::Validation(
                "at least one channel is required".to_string(),
            ));
        }

        let (subject, content) = self.render(&submission);
        let scheduled_at = submission.scheduled_at.unwrap_or_else(Utc::now);
        let max_retries_override = submission
            .metadata
            .as_ref()
            .and_then(|m| m.get("max_retries"))
            .and_then(|v| v.as_i64())
            .map(|v| v as i32);

        let mut rows = Vec::with_capacity(submission.channels.len());
        for target in &submission.channels {
            let Some(recipient) = self.resolve_recipient(&submission, target).await? else {
                // Explicitly opted out; skip this channel without a row.
                continue;
            };

            let max_retries = max_retries_override
                .unwrap_or_else(|| self.policies.for_channel(target.channel).max_retries);

            rows.push(NewNotification {
                user_id: submission.user_id,
                channel: target.channel,
                recipient,
                subject: subject.clone(),
                content: content.clone(),
                priority: submission.priority,
                max_retries,
                scheduled_at,
            });
        }

        if rows.is_empty() {
            return Err(DispatchError::Validation(
                "no deliverable channels after preference filtering".to_string(),
            ));
        }

        let created = self.store.create_many(rows).await?;
        for notification in &created {
            NOTIFICATIONS_SUBMITTED_TOTAL
                .with_label_values(&[notification.channel.as_str()])
                .inc();
        }

        self.enqueue_rows(&created).await?;

        let ids: Vec<i64> = created.iter().map(|n| n.id).collect();
        let first_id = ids[0];
        tracing::info!(
            notification_ids = ?ids,
            priority = %submission.priority,
            "Submission accepted"
        );

        Ok(SubmitOutcome {
            notification_ids: ids,
            first_id,
        })
    }

    /// Bulk-enqueue jobs for freshly created rows and mark them queued.
    pub async fn enqueue_rows(&self, rows: &[Notification]) -> Result<(), DispatchError> {
        let now = Utc::now();
        let jobs: Vec<(DeliveryJob, EnqueueOptions)> = rows
            .iter()
            .map(|n| {
                let job = DeliveryJob::attempt(n.id, n.channel, n.priority, n.retry_count);
                let delay = (n.scheduled_at - now).to_std().ok().filter(|d| !d.is_zero());
                (job, EnqueueOptions { delay })
            })
            .collect();

        self.queue.enqueue_bulk(jobs).await?;

        let ids: Vec<i64> = rows.iter().map(|n| n.id).collect();
        self.store.mark_queued_bulk(&ids).await?;
        Ok(())
    }

    fn render(&self, submission: &Submission) -> (Option<String>, String) {
        let variables = submission
            .metadata
            .as_ref()
            .and_then(|m| m.get("variables"))
            .and_then(|v| v.as_object());

        match variables {
            Some(vars) => (
                submission
                    .subject
                    .as_deref()
                    .map(|s| substitute_variables(s, vars)),
                substitute_variables(&submission.message, vars),
            ),
            None => (submission.subject.clone(), submission.message.clone()),
        }
    }

    /// Resolve the delivery address for one channel target.
    ///
    /// Returns `Ok(None)` when the owning user opted out of the channel;
    /// errors when no address can be determined at all.
    async fn resolve_recipient(
        &self,
        submission: &Submission,
        target: &SubmitChannel,
    ) -> Result<Option<String>, DispatchError> {
        if let Some(recipient) = &target.recipient {
            if !recipient.is_empty() {
                return Ok(Some(recipient.clone()));
            }
        }

        let Some(user_id) = submission.user_id else {
            return Err(DispatchError::Validation(format!(
                "channel {} has no recipient and no user to resolve one from",
                target.channel
            )));
        };
        let Some(user) = self.store.find_user(user_id).await? else {
            return Err(DispatchError::Validation(format!(
                "user {} not found for recipient resolution",
                user_id
            )));
        };

        if !user.opted_in(target.channel) {
            tracing::debug!(
                user_id = user.id,
                channel = %target.channel,
                "User opted out, skipping channel"
            );
            return Ok(None);
        }

        match user.contact_for(target.channel) {
            Some(contact) if !contact.is_empty() => Ok(Some(contact.to_string())),
            _ => Err(DispatchError::Validation(format!(
                "user {} has no {} address on file",
                user_id, target.channel
            ))),
        }
    }

    /// Operator retry of one row, regardless of broker state. Refuses rows
    /// already delivered.
    pub async fn retry_notification(
        &self,
        id: i64,
        reset_retry_count: bool,
    ) -> Result<(), DispatchError> {
        let Some(notification) = self.store.find_by_id(id).await? else {
            return Err(DispatchError::NotFound(format!("notification {}", id)));
        };

        let requeued = self
            .store
            .requeue(
                id,
                reset_retry_count,
                NewLog::new(id, LogStatus::Queued, "Re-enqueued by operator"),
            )
            .await?;
        if !requeued {
            return Err(DispatchError::Validation(format!(
                "notification {} was already delivered",
                id
            )));
        }

        let job = DeliveryJob::manual(
            id,
            notification.channel,
            notification.priority,
            Utc::now().timestamp_millis(),
        );
        self.queue.enqueue(job, EnqueueOptions::default()).await?;
        Ok(())
    }

    /// Store-driven retry for failed rows with remaining budget whose broker
    /// state was lost. Returns how many rows were re-enqueued.
    pub async fn retry_failed_from_store(&self) -> Result<usize, DispatchError> {
        let retryable = self.store.list_retryable().await?;
        let mut retried = 0;

        for notification in retryable {
            let requeued = self
                .store
                .requeue(
                    notification.id,
                    false,
                    NewLog::new(
                        notification.id,
                        LogStatus::Queued,
                        "Re-enqueued from store-driven retry",
                    ),
                )
                .await?;
            if !requeued {
                continue;
            }

            let job = DeliveryJob::manual(
                notification.id,
                notification.channel,
                notification.priority,
                Utc::now().timestamp_millis() + retried as i64,
            );
            self.queue.enqueue(job, EnqueueOptions::default()).await?;
            retried += 1;
        }

        Ok(retried)
    }

    pub async fn queue_stats(&self) -> Result<QueueCounts, DispatchError> {
        Ok(self.queue.counts().await?)
    }

    pub async fn pause(&self) -> Result<(), DispatchError> {
        Ok(self.queue.pause().await?)
    }

    pub async fn resume(&self) -> Result<(), DispatchError> {
        Ok(self.queue.resume().await?)
    }

    /// Remove all broker-side failed jobs; the rows stay for auditing.
    pub async fn clear_failed(&self) -> Result<usize, DispatchError> {
        Ok(self.queue.clean_failed(Duration::ZERO).await?)
    }

    /// Broker-side retry primitive for parked failed jobs.
    pub async fn retry_failed_jobs(&self) -> Result<usize, DispatchError> {
        Ok(self.queue.retry_failed().await?)
    }

    /// Health snapshot: healthy iff the broker answers its ping.
    pub async fn system_health(&self, worker_pool_running: bool) -> SystemHealth {
        let broker_ok = self.queue.ping().await.is_ok();
        let database_ok = self.store.ping().await.is_ok();
        let queue = if broker_ok {
            self.queue.counts().await.ok()
        } else {
            None
        };

        SystemHealth {
            healthy: broker_ok,
            broker: if broker_ok { "ready" } else { "unavailable" },
            worker_pool_running,
            queue,
            database: database_ok,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{NotificationStatus, UserRecord};
    use crate::domain::queue::MemoryQueue;
    use crate::domain::store::MemoryStore;
    use serde_json::json;

    fn service() -> (DispatchService, Arc<MemoryStore>, Arc<MemoryQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let service = DispatchService::new(
            store.clone() as Arc<dyn NotificationStore>,
            queue.clone() as Arc<dyn JobQueue>,
            RetryPolicySet::default(),
        );
        (service, store, queue)
    }

    fn submission(channels: Vec<SubmitChannel>) -> Submission {
        Submission {
            user_id: None,
            subject: Some("Hi".to_string()),
            message: "Hello".to_string(),
            channels,
            priority: Priority::Normal,
            scheduled_at: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_row_per_channel_and_enqueues() {
        let (service, store, queue) = service();

        let outcome = service
            .submit(submission(vec![
                SubmitChannel {
                    channel: Channel::Email,
                    recipient: Some("a@b.c".to_string()),
                },
                SubmitChannel {
                    channel: Channel::Slack,
                    recipient: Some("https://hooks.slack.example/x".to_string()),
                },
            ]))
            .await
            .unwrap();

        assert_eq!(outcome.notification_ids.len(), 2);
        assert_eq!(outcome.first_id, outcome.notification_ids[0]);

        for id in &outcome.notification_ids {
            let row = store.find_by_id(*id).await.unwrap().unwrap();
            assert_eq!(row.status, NotificationStatus::Queued);
        }
        assert_eq!(queue.counts().await.unwrap().waiting, 2);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_channel_list() {
        let (service, _, _) = service();
        let err = service.submit(submission(vec![])).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn test_future_schedule_lands_in_delayed_set() {
        let (service, _, queue) = service();

        let mut s = submission(vec![SubmitChannel {
            channel: Channel::Email,
            recipient: Some("a@b.c".to_string()),
        }]);
        s.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));

        service.submit(s).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_past_schedule_is_eligible_immediately() {
        let (service, _, queue) = service();

        let mut s = submission(vec![SubmitChannel {
            channel: Channel::Email,
            recipient: Some("a@b.c".to_string()),
        }]);
        s.scheduled_at = Some(Utc::now() - chrono::Duration::minutes(5));

        service.submit(s).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.delayed, 0);
    }

    #[tokio::test]
    async fn test_recipient_resolved_from_user_record() {
        let (service, store, _) = service();
        store.insert_user(UserRecord {
            id: 7,
            email: "stored@example.com".to_string(),
            name: None,
            phone: None,
            push_token: None,
            slack_webhook_url: None,
            telegram_chat_id: None,
            preferences: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let mut s = submission(vec![SubmitChannel {
            channel: Channel::Email,
            recipient: None,
        }]);
        s.user_id = Some(7);

        let outcome = service.submit(s).await.unwrap();
        let row = store
            .find_by_id(outcome.first_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.recipient, "stored@example.com");
    }

    #[tokio::test]
    async fn test_opted_out_channel_is_skipped() {
        let (service, store, _) = service();
        store.insert_user(UserRecord {
            id: 7,
            email: "stored@example.com".to_string(),
            name: None,
            phone: Some("+15551234567".to_string()),
            push_token: None,
            slack_webhook_url: None,
            telegram_chat_id: None,
            preferences: json!({"sms": false}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let mut s = submission(vec![
            SubmitChannel {
                channel: Channel::Email,
                recipient: None,
            },
            SubmitChannel {
                channel: Channel::Sms,
                recipient: None,
            },
        ]);
        s.user_id = Some(7);

        let outcome = service.submit(s).await.unwrap();
        assert_eq!(outcome.notification_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_template_variables_substituted_at_submission() {
        let (service, store, _) = service();

        let mut s = submission(vec![SubmitChannel {
            channel: Channel::Email,
            recipient: Some("a@b.c".to_string()),
        }]);
        s.subject = Some("Hello {{name}}".to_string());
        s.message = "Order {{order_id}} shipped".to_string();
        s.metadata = Some(json!({"variables": {"name": "Ada", "order_id": 42}}));

        let outcome = service.submit(s).await.unwrap();
        let row = store
            .find_by_id(outcome.first_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.subject.as_deref(), Some("Hello Ada"));
        assert_eq!(row.content, "Order 42 shipped");
    }

    #[tokio::test]
    async fn test_retry_refuses_sent_rows() {
        let (service, store, _) = service();
        let outcome = service
            .submit(submission(vec![SubmitChannel {
                channel: Channel::Email,
                recipient: Some("a@b.c".to_string()),
            }]))
            .await
            .unwrap();

        store
            .update_status(
                outcome.first_id,
                NotificationStatus::Sent,
                None,
                NewLog::new(outcome.first_id, LogStatus::Delivered, "ok"),
            )
            .await
            .unwrap();

        let err = service
            .retry_notification(outcome.first_id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }
}
