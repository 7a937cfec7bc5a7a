//! In-memory implementation of the notification store.
//!
//! Mirrors the Postgres semantics, including the terminal-state guard and
//! the single `sent_at` stamp. Backs the integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Timelike, Utc};

use crate::domain::notification::{
    LogStatus, NewLog, NewNotification, Notification, NotificationLog, NotificationStatus,
    UserRecord,
};

use super::backend::{
    DispatchStats, HourlyBucket, LogWithContext, NotificationStore, StoreError,
};

#[derive(Default)]
struct MemoryStoreState {
    next_id: i64,
    next_log_id: i64,
    notifications: BTreeMap<i64, Notification>,
    logs: Vec<NotificationLog>,
    users: HashMap<i64, UserRecord>,
}

impl MemoryStoreState {
    fn append_log(&mut self, log: NewLog) {
        self.next_log_id += 1;
        self.logs.push(NotificationLog {
            id: self.next_log_id,
            notification_id: log.notification_id,
            status: log.status,
            message: log.message,
            error_details: log.error_details,
            provider_response: log.provider_response,
            metadata: log.metadata,
            created_at: Utc::now(),
        });
    }

    fn insert(&mut self, new: NewNotification) -> Notification {
        self.next_id += 1;
        let now = Utc::now();
        let notification = Notification {
            id: self.next_id,
            user_id: new.user_id,
            channel: new.channel,
            recipient: new.recipient,
            subject: new.subject,
            content: new.content,
            status: NotificationStatus::Pending,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries,
            priority: new.priority,
            scheduled_at: new.scheduled_at,
            sent_at: None,
            last_processed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.notifications
            .insert(notification.id, notification.clone());
        self.append_log(NewLog::new(
            notification.id,
            LogStatus::Created,
            "Notification created",
        ));
        notification
    }
}

/// Process-local `NotificationStore` implementation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a user record.
    pub fn insert_user(&self, user: UserRecord) {
        let mut state = self.state.lock().expect("store state poisoned");
        state.users.insert(user.id, user);
    }

    /// Test helper: backdate a row's `last_processed_at` to simulate a stall.
    pub fn backdate_last_processed(&self, id: i64, minutes: i64) {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Some(n) = state.notifications.get_mut(&id) {
            n.last_processed_at = Some(Utc::now() - Duration::minutes(minutes));
        }
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(&self, new: NewNotification) -> Result<Notification, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        Ok(state.insert(new))
    }

    async fn create_many(
        &self,
        new: Vec<NewNotification>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        Ok(new.into_iter().map(|n| state.insert(n)).collect())
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state.notifications.get(&id).cloned())
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        let mut rows: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.user_id == Some(user_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<String>,
        log: NewLog,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");

        let updated = match state.notifications.get_mut(&id) {
            Some(n) if !n.status.is_terminal() => {
                n.status = status;
                if let Some(message) = error_message {
                    n.error_message = Some(message);
                }
                if status == NotificationStatus::Sent && n.sent_at.is_none() {
                    n.sent_at = Some(Utc::now());
                }
                if status == NotificationStatus::Processing {
                    n.last_processed_at = Some(Utc::now());
                }
                n.updated_at = Utc::now();
                true
            }
            _ => false,
        };

        if updated {
            state.append_log(log);
        }
        Ok(updated)
    }

    async fn mark_queued_bulk(&self, ids: &[i64]) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");

        for &id in ids {
            if let Some(n) = state.notifications.get_mut(&id) {
                if n.status == NotificationStatus::Pending {
                    n.status = NotificationStatus::Queued;
                    n.updated_at = Utc::now();
                }
            }
            state.append_log(NewLog::new(id, LogStatus::Queued, "Job enqueued"));
        }
        Ok(())
    }

    async fn requeue(
        &self,
        id: i64,
        reset_retry_count: bool,
        log: NewLog,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");

        let updated = match state.notifications.get_mut(&id) {
            Some(n) if n.status != NotificationStatus::Sent => {
                n.status = NotificationStatus::Queued;
                if reset_retry_count {
                    n.retry_count = 0;
                }
                n.updated_at = Utc::now();
                true
            }
            _ => false,
        };

        if updated {
            state.append_log(log);
        }
        Ok(updated)
    }

    async fn update_last_processed(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        if let Some(n) = state.notifications.get_mut(&id) {
            n.last_processed_at = Some(Utc::now());
            n.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: i64) -> Result<i32, StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        match state.notifications.get_mut(&id) {
            Some(n) => {
                n.retry_count += 1;
                n.updated_at = Utc::now();
                Ok(n.retry_count)
            }
            None => Err(StoreError::Corrupt(format!("no notification {}", id))),
        }
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        let now = Utc::now();
        let mut rows: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| n.status == NotificationStatus::Pending && n.scheduled_at <= now)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn list_retryable(&self) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        let now = Utc::now();
        let mut rows: Vec<Notification> = state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Failed
                    && n.retry_count < n.max_retries
                    && n.scheduled_at <= now
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn list_stale(&self, minutes: i64) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        let cutoff = Utc::now() - Duration::minutes(minutes);
        Ok(state
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Processing
                    && n.last_processed_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn append_log(&self, log: NewLog) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store state poisoned");
        state.append_log(log);
        Ok(())
    }

    async fn logs_for(&self, notification_id: i64) -> Result<Vec<NotificationLog>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state
            .logs
            .iter()
            .filter(|l| l.notification_id == notification_id)
            .cloned()
            .collect())
    }

    async fn recent_logs(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError> {
        self.logs_with_context(limit, false)
    }

    async fn recent_errors(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError> {
        self.logs_with_context(limit, true)
    }

    async fn stats_last_24h(&self) -> Result<DispatchStats, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        let cutoff = Utc::now() - Duration::hours(24);

        let mut stats = DispatchStats::default();
        let mut hourly: BTreeMap<chrono::DateTime<Utc>, (i64, i64)> = BTreeMap::new();

        for n in state.notifications.values().filter(|n| n.created_at >= cutoff) {
            stats.total += 1;
            *stats
                .by_status
                .entry(n.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_channel
                .entry(n.channel.as_str().to_string())
                .or_insert(0) += 1;

            let hour = n
                .created_at
                .date_naive()
                .and_hms_opt(n.created_at.time().hour(), 0, 0)
                .map(|dt| dt.and_utc())
                .unwrap_or(n.created_at);
            let bucket = hourly.entry(hour).or_insert((0, 0));
            match n.status {
                NotificationStatus::Sent => bucket.0 += 1,
                NotificationStatus::Failed => bucket.1 += 1,
                _ => {}
            }
        }

        stats.hourly = hourly
            .into_iter()
            .map(|(hour, (sent, failed))| HourlyBucket { hour, sent, failed })
            .collect();
        Ok(stats)
    }

    async fn find_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");
        Ok(state.users.get(&id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl MemoryStore {
    fn logs_with_context(
        &self,
        limit: i64,
        errors_only: bool,
    ) -> Result<Vec<LogWithContext>, StoreError> {
        let state = self.state.lock().expect("store state poisoned");

        let entries: Vec<LogWithContext> = state
            .logs
            .iter()
            .rev()
            .filter(|l| !errors_only || l.status.is_error())
            .filter_map(|l| {
                state.notifications.get(&l.notification_id).map(|n| LogWithContext {
                    log: l.clone(),
                    channel: n.channel,
                    recipient: n.recipient.clone(),
                })
            })
            .take(limit.max(0) as usize)
            .collect();

        Ok(entries)
    }
}
