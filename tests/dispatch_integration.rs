//! End-to-end dispatch engine tests.
//!
//! These drive the real submission path, processor and queue against the
//! in-memory backends, with scripted adapters standing in for providers.
//! No Redis or Postgres required.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use courier_dispatcher::channel::{
    AdapterError, AdapterRegistry, AdapterStatus, ChannelAdapter, DeliveryRequest,
    ProviderResponse,
};
use courier_dispatcher::dispatch::{
    DispatchService, JobProcessor, SubmitChannel, Submission,
};
use courier_dispatcher::notification::{Channel, LogStatus, NotificationStatus, Priority};
use courier_dispatcher::queue::{DeliveryJob, EnqueueOptions, JobQueue, MemoryQueue};
use courier_dispatcher::retry::{Backoff, RetryPolicy, RetryPolicySet};
use courier_dispatcher::store::{MemoryStore, NotificationStore};

/// Adapter that replays a script of outcomes, then succeeds.
struct ScriptedAdapter {
    channel: Channel,
    script: Mutex<VecDeque<Result<ProviderResponse, AdapterError>>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(channel: Channel, script: Vec<Result<ProviderResponse, AdapterError>>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn always_ok(channel: Channel) -> Arc<Self> {
        Self::new(channel, Vec::new())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn ok_response() -> ProviderResponse {
        ProviderResponse {
            message_id: Some("provider-msg-1".to_string()),
            raw: json!({"accepted": true}),
        }
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, _request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Self::ok_response()))
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: self.channel,
            configured: true,
            detail: json!({}),
        }
    }
}

/// Retry policies shrunk to test scale; shapes and budgets match production.
fn fast_policies() -> RetryPolicySet {
    let mut set = RetryPolicySet::default();
    set.set(
        Channel::Email,
        RetryPolicy {
            max_retries: 5,
            backoff: Backoff::Exponential {
                base_ms: 5,
                max_ms: 50,
            },
        },
    );
    set.set(
        Channel::Sms,
        RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Exponential {
                base_ms: 5,
                max_ms: 50,
            },
        },
    );
    set.set(
        Channel::Push,
        RetryPolicy {
            max_retries: 4,
            backoff: Backoff::Exponential {
                base_ms: 5,
                max_ms: 20,
            },
        },
    );
    set.set(
        Channel::Slack,
        RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed { delay_ms: 5 },
        },
    );
    set
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    service: DispatchService,
    processor: JobProcessor,
}

fn harness(adapters: Vec<Arc<ScriptedAdapter>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let policies = fast_policies();

    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry = registry.register(adapter);
    }

    let processor = JobProcessor::new(
        store.clone() as Arc<dyn NotificationStore>,
        queue.clone() as Arc<dyn JobQueue>,
        Arc::new(registry),
        policies.clone(),
        Duration::from_secs(5),
    );
    let service = DispatchService::new(
        store.clone() as Arc<dyn NotificationStore>,
        queue.clone() as Arc<dyn JobQueue>,
        policies,
    );

    Harness {
        store,
        queue,
        service,
        processor,
    }
}

fn single_channel(channel: Channel, recipient: &str) -> Submission {
    Submission {
        user_id: None,
        subject: Some("Hi".to_string()),
        message: "Hello".to_string(),
        channels: vec![SubmitChannel {
            channel,
            recipient: Some(recipient.to_string()),
        }],
        priority: Priority::Normal,
        scheduled_at: None,
        metadata: None,
    }
}

/// Pop-and-process until the row reaches a terminal state, waiting out
/// retry delays.
async fn pump_until_terminal(h: &Harness, id: i64) -> NotificationStatus {
    for _ in 0..500 {
        match h.queue.pop().await.unwrap() {
            Some(job) => h.processor.process(job).await,
            None => tokio::time::sleep(Duration::from_millis(2)).await,
        }

        let n = h.store.find_by_id(id).await.unwrap().unwrap();
        if n.status.is_terminal() {
            return n.status;
        }
    }
    panic!("notification {} never reached a terminal state", id);
}

fn log_statuses(logs: &[courier_dispatcher::notification::NotificationLog]) -> Vec<LogStatus> {
    logs.iter().map(|l| l.status).collect()
}

#[tokio::test]
async fn happy_path_single_channel() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();
    let id = outcome.first_id;

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Sent);
    assert_eq!(email.calls(), 1);

    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);
    assert!(row.sent_at.is_some());

    let statuses = log_statuses(&h.store.logs_for(id).await.unwrap());
    assert_eq!(
        statuses,
        vec![
            LogStatus::Created,
            LogStatus::Queued,
            LogStatus::Processing,
            LogStatus::Delivered,
        ]
    );
}

#[tokio::test]
async fn transient_failure_then_success() {
    let email = ScriptedAdapter::new(
        Channel::Email,
        vec![Err(AdapterError::transient("upstream returned 502"))],
    );
    let h = harness(vec![email.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();
    let id = outcome.first_id;

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Sent);
    assert_eq!(email.calls(), 2);

    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 1);
    assert!(row.sent_at.is_some());

    let statuses = log_statuses(&h.store.logs_for(id).await.unwrap());
    assert_eq!(
        statuses,
        vec![
            LogStatus::Created,
            LogStatus::Queued,
            LogStatus::Processing,
            LogStatus::Error,
            LogStatus::RetryScheduled,
            LogStatus::Processing,
            LogStatus::Delivered,
        ]
    );
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let sms = ScriptedAdapter::new(
        Channel::Sms,
        vec![Err(AdapterError::permanent("invalid phone number"))],
    );
    let h = harness(vec![sms.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Sms, "+15551234567"))
        .await
        .unwrap();
    let id = outcome.first_id;

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Failed);
    assert_eq!(sms.calls(), 1);

    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);
    assert!(row.sent_at.is_none());
    assert!(row.error_message.as_deref().unwrap().contains("invalid phone"));

    let statuses = log_statuses(&h.store.logs_for(id).await.unwrap());
    assert_eq!(
        &statuses[statuses.len() - 2..],
        &[LogStatus::Error, LogStatus::Failed]
    );
}

#[tokio::test]
async fn exhausted_retries_fail_terminally() {
    // Transient forever: one initial attempt plus max_retries retries.
    let failures: Vec<Result<ProviderResponse, AdapterError>> = (0..10)
        .map(|_| Err(AdapterError::transient("503 from push service")))
        .collect();
    let push = ScriptedAdapter::new(Channel::Push, failures);
    let h = harness(vec![push.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Push, "device-token"))
        .await
        .unwrap();
    let id = outcome.first_id;

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Failed);

    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 4);
    assert_eq!(push.calls(), 5);

    let logs = h.store.logs_for(id).await.unwrap();
    let error_count = logs
        .iter()
        .filter(|l| l.status == LogStatus::Error)
        .count();
    assert_eq!(error_count, 5);
}

#[tokio::test]
async fn zero_max_retries_means_single_attempt() {
    let slack = ScriptedAdapter::new(
        Channel::Slack,
        vec![Err(AdapterError::transient("webhook 500"))],
    );
    let h = harness(vec![slack.clone()]);

    let mut submission = single_channel(Channel::Slack, "https://hooks.example/x");
    submission.metadata = Some(json!({"max_retries": 0}));

    let outcome = h.service.submit(submission).await.unwrap();
    let status = pump_until_terminal(&h, outcome.first_id).await;

    assert_eq!(status, NotificationStatus::Failed);
    assert_eq!(slack.calls(), 1);
    let row = h.store.find_by_id(outcome.first_id).await.unwrap().unwrap();
    assert_eq!(row.retry_count, 0);
}

#[tokio::test]
async fn urgent_jobs_overtake_queued_normal_jobs() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email]);

    let mut normal_ids = Vec::new();
    for i in 0..20 {
        let outcome = h
            .service
            .submit(single_channel(Channel::Email, &format!("u{}@example.com", i)))
            .await
            .unwrap();
        normal_ids.push(outcome.first_id);
    }

    let mut urgent = single_channel(Channel::Email, "vip@example.com");
    urgent.priority = Priority::Urgent;
    let urgent_id = h.service.submit(urgent).await.unwrap().first_id;

    // Single worker: pop strictly one job at a time.
    let first = h.queue.pop().await.unwrap().unwrap();
    assert_eq!(first.notification_id, urgent_id);
    h.processor.process(first).await;

    let urgent_row = h.store.find_by_id(urgent_id).await.unwrap().unwrap();
    assert_eq!(urgent_row.status, NotificationStatus::Sent);

    // The normal jobs are still waiting, in FIFO order.
    let second = h.queue.pop().await.unwrap().unwrap();
    assert_eq!(second.notification_id, normal_ids[0]);
}

#[tokio::test]
async fn fan_out_produces_independent_rows() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let sms = ScriptedAdapter::always_ok(Channel::Sms);
    let slack = ScriptedAdapter::always_ok(Channel::Slack);
    let h = harness(vec![email, sms, slack]);

    let submission = Submission {
        user_id: None,
        subject: Some("Hi".to_string()),
        message: "Hello".to_string(),
        channels: vec![
            SubmitChannel {
                channel: Channel::Email,
                recipient: Some("a@b.c".to_string()),
            },
            SubmitChannel {
                channel: Channel::Sms,
                recipient: Some("+15551234567".to_string()),
            },
            SubmitChannel {
                channel: Channel::Slack,
                recipient: Some("https://hooks.example/x".to_string()),
            },
        ],
        priority: Priority::Normal,
        scheduled_at: None,
        metadata: None,
    };

    let outcome = h.service.submit(submission).await.unwrap();
    assert_eq!(outcome.notification_ids.len(), 3);
    assert_eq!(outcome.first_id, outcome.notification_ids[0]);

    for &id in &outcome.notification_ids {
        let status = pump_until_terminal(&h, id).await;
        assert_eq!(status, NotificationStatus::Sent);

        let statuses = log_statuses(&h.store.logs_for(id).await.unwrap());
        assert_eq!(
            statuses,
            vec![
                LogStatus::Created,
                LogStatus::Queued,
                LogStatus::Processing,
                LogStatus::Delivered,
            ]
        );
    }
}

#[tokio::test]
async fn replayed_enqueue_deduplicates_to_one_delivery() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();
    let id = outcome.first_id;

    // Replay the same logical enqueue.
    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    let replay = DeliveryJob::attempt(id, row.channel, row.priority, row.retry_count);
    let enqueued = h
        .queue
        .enqueue(replay, EnqueueOptions::default())
        .await
        .unwrap();
    assert!(!enqueued, "replayed job id must be deduplicated");

    pump_until_terminal(&h, id).await;
    assert_eq!(email.calls(), 1);

    // Nothing left on the broker.
    let counts = h.queue.counts().await.unwrap();
    assert_eq!(counts.waiting + counts.active + counts.delayed, 0);
}

#[tokio::test]
async fn past_schedule_is_immediately_eligible() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email]);

    let mut submission = single_channel(Channel::Email, "a@b.c");
    submission.scheduled_at = Some(Utc::now() - chrono::Duration::hours(1));

    let outcome = h.service.submit(submission).await.unwrap();
    let job = h.queue.pop().await.unwrap();
    assert!(job.is_some(), "past-scheduled job must be eligible at once");
    assert_eq!(job.unwrap().notification_id, outcome.first_id);
}

#[tokio::test]
async fn operator_retry_after_failure_delivers() {
    let email = ScriptedAdapter::new(
        Channel::Email,
        vec![Err(AdapterError::permanent("mailbox does not exist"))],
    );
    let h = harness(vec![email.clone()]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();
    let id = outcome.first_id;

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Failed);

    // Operator retries with a reset budget; the adapter now succeeds.
    h.service.retry_notification(id, true).await.unwrap();
    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, NotificationStatus::Queued);
    assert_eq!(row.retry_count, 0);

    let status = pump_until_terminal(&h, id).await;
    assert_eq!(status, NotificationStatus::Sent);
    assert_eq!(email.calls(), 2);
}

#[tokio::test]
async fn terminal_rows_never_transition_again() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email]);

    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();
    let id = outcome.first_id;
    pump_until_terminal(&h, id).await;

    // A stray duplicate job for a sent row is discarded without effect.
    let row = h.store.find_by_id(id).await.unwrap().unwrap();
    let sent_at = row.sent_at;
    let stray = DeliveryJob::manual(id, row.channel, row.priority, 424242);
    h.queue
        .enqueue(stray, EnqueueOptions::default())
        .await
        .unwrap();

    let job = h.queue.pop().await.unwrap().unwrap();
    h.processor.process(job).await;

    let after = h.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(after.status, NotificationStatus::Sent);
    assert_eq!(after.sent_at, sent_at);
}

#[tokio::test]
async fn paused_queue_defers_delivery_until_resume() {
    let email = ScriptedAdapter::always_ok(Channel::Email);
    let h = harness(vec![email]);

    h.queue.pause().await.unwrap();
    let outcome = h
        .service
        .submit(single_channel(Channel::Email, "a@b.c"))
        .await
        .unwrap();

    assert!(h.queue.pop().await.unwrap().is_none());

    h.queue.resume().await.unwrap();
    let status = pump_until_terminal(&h, outcome.first_id).await;
    assert_eq!(status, NotificationStatus::Sent);
}
