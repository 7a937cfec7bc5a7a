//! PostgreSQL implementation of the notification store.
//!
//! All queries are runtime-checked `sqlx` queries against the schema in
//! `migrations/`. Status updates and their log appends share one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::domain::notification::{
    Channel, LogStatus, NewLog, NewNotification, Notification, NotificationLog,
    NotificationStatus, Priority, UserRecord,
};
use crate::infrastructure::postgres::PostgresPool;

use super::backend::{
    DispatchStats, HourlyBucket, LogWithContext, NotificationStore, StoreError,
};

const NOTIFICATION_COLUMNS: &str = "id, user_id, channel, recipient, subject, content, status, \
     error_message, retry_count, max_retries, priority, scheduled_at, sent_at, \
     last_processed_at, created_at, updated_at";

/// Store backed by PostgreSQL.
pub struct PostgresStore {
    pool: PostgresPool,
}

impl PostgresStore {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }

    fn pg(&self) -> &PgPool {
        self.pool.pool()
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: i64,
    user_id: Option<i64>,
    channel: String,
    recipient: String,
    subject: Option<String>,
    content: String,
    status: String,
    error_message: Option<String>,
    retry_count: i32,
    max_retries: i32,
    priority: String,
    scheduled_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    last_processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NotificationRow {
    fn into_notification(self) -> Result<Notification, StoreError> {
        let channel = Channel::parse(&self.channel)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown channel '{}'", self.channel)))?;
        let status = NotificationStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", self.status)))?;

        Ok(Notification {
            id: self.id,
            user_id: self.user_id,
            channel,
            recipient: self.recipient,
            subject: self.subject,
            content: self.content,
            status,
            error_message: self.error_message,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            priority: Priority::parse_or_default(&self.priority),
            scheduled_at: self.scheduled_at,
            sent_at: self.sent_at,
            last_processed_at: self.last_processed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    notification_id: i64,
    status: String,
    message: String,
    error_details: Option<serde_json::Value>,
    provider_response: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl LogRow {
    fn into_log(self) -> Result<NotificationLog, StoreError> {
        let status = LogStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log status '{}'", self.status)))?;

        Ok(NotificationLog {
            id: self.id,
            notification_id: self.notification_id,
            status,
            message: self.message,
            error_details: self.error_details,
            provider_response: self.provider_response,
            metadata: self.metadata,
            created_at: self.created_at,
        })
    }
}

async fn insert_log<'e, E>(executor: E, log: &NewLog) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(
        "INSERT INTO notification_logs \
         (notification_id, status, message, error_details, provider_response, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(log.notification_id)
    .bind(log.status.as_str())
    .bind(&log.message)
    .bind(&log.error_details)
    .bind(&log.provider_response)
    .bind(&log.metadata)
    .execute(executor)
    .await?;

    Ok(())
}

async fn insert_notification<'e, E>(
    executor: E,
    new: &NewNotification,
) -> Result<NotificationRow, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query_as::<_, NotificationRow>(&format!(
        "INSERT INTO notifications \
         (user_id, channel, recipient, subject, content, priority, max_retries, scheduled_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING {}",
        NOTIFICATION_COLUMNS
    ))
    .bind(new.user_id)
    .bind(new.channel.as_str())
    .bind(&new.recipient)
    .bind(&new.subject)
    .bind(&new.content)
    .bind(new.priority.as_str())
    .bind(new.max_retries)
    .bind(new.scheduled_at)
    .fetch_one(executor)
    .await
}

#[async_trait]
impl NotificationStore for PostgresStore {
    async fn create(&self, new: NewNotification) -> Result<Notification, StoreError> {
        let mut tx = self.pg().begin().await?;

        let row = insert_notification(&mut *tx, &new).await?;
        let log = NewLog::new(row.id, LogStatus::Created, "Notification created");
        insert_log(&mut *tx, &log).await?;

        tx.commit().await?;
        row.into_notification()
    }

    async fn create_many(
        &self,
        new: Vec<NewNotification>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut tx = self.pg().begin().await?;
        let mut created = Vec::with_capacity(new.len());

        for item in &new {
            let row = insert_notification(&mut *tx, item).await?;
            let log = NewLog::new(row.id, LogStatus::Created, "Notification created");
            insert_log(&mut *tx, &log).await?;
            created.push(row.into_notification()?);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Notification>, StoreError> {
        let row = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pg())
        .await?;

        row.map(NotificationRow::into_notification).transpose()
    }

    async fn list_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications WHERE user_id = $1 \
             ORDER BY created_at DESC OFFSET $2 LIMIT $3",
            NOTIFICATION_COLUMNS
        ))
        .bind(user_id)
        .bind(offset)
        .bind(limit)
        .fetch_all(self.pg())
        .await?;

        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<String>,
        log: NewLog,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pg().begin().await?;

        let result = sqlx::query(
            "UPDATE notifications SET \
                 status = $2, \
                 error_message = COALESCE($3, error_message), \
                 sent_at = CASE WHEN $2 = 'sent' AND sent_at IS NULL THEN now() ELSE sent_at END, \
                 last_processed_at = CASE WHEN $2 = 'processing' THEN now() ELSE last_processed_at END, \
                 updated_at = now() \
             WHERE id = $1 AND status NOT IN ('sent', 'failed')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&error_message)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_log(&mut *tx, &log).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn mark_queued_bulk(&self, ids: &[i64]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pg().begin().await?;

        sqlx::query(
            "UPDATE notifications SET status = 'queued', updated_at = now() \
             WHERE id = ANY($1) AND status = 'pending'",
        )
        .bind(ids)
        .execute(&mut *tx)
        .await?;

        for &id in ids {
            let log = NewLog::new(id, LogStatus::Queued, "Job enqueued");
            insert_log(&mut *tx, &log).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn requeue(
        &self,
        id: i64,
        reset_retry_count: bool,
        log: NewLog,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pg().begin().await?;

        let result = sqlx::query(
            "UPDATE notifications SET \
                 status = 'queued', \
                 retry_count = CASE WHEN $2 THEN 0 ELSE retry_count END, \
                 updated_at = now() \
             WHERE id = $1 AND status <> 'sent'",
        )
        .bind(id)
        .bind(reset_retry_count)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_log(&mut *tx, &log).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn update_last_processed(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE notifications SET last_processed_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(self.pg())
        .await?;
        Ok(())
    }

    async fn increment_retry_count(&self, id: i64) -> Result<i32, StoreError> {
        let row = sqlx::query(
            "UPDATE notifications SET retry_count = retry_count + 1, updated_at = now() \
             WHERE id = $1 RETURNING retry_count",
        )
        .bind(id)
        .fetch_one(self.pg())
        .await?;

        Ok(row.get::<i32, _>("retry_count"))
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications \
             WHERE status = 'pending' AND scheduled_at <= now() \
             ORDER BY scheduled_at ASC LIMIT $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(self.pg())
        .await?;

        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    async fn list_retryable(&self) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications \
             WHERE status = 'failed' AND retry_count < max_retries AND scheduled_at <= now() \
             ORDER BY CASE priority \
                 WHEN 'urgent' THEN 4 WHEN 'high' THEN 3 WHEN 'normal' THEN 2 ELSE 1 END DESC, \
                 created_at ASC",
            NOTIFICATION_COLUMNS
        ))
        .fetch_all(self.pg())
        .await?;

        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    async fn list_stale(&self, minutes: i64) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(&format!(
            "SELECT {} FROM notifications \
             WHERE status = 'processing' \
               AND last_processed_at < now() - make_interval(mins => $1)",
            NOTIFICATION_COLUMNS
        ))
        .bind(minutes as i32)
        .fetch_all(self.pg())
        .await?;

        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    async fn append_log(&self, log: NewLog) -> Result<(), StoreError> {
        insert_log(self.pg(), &log).await?;
        Ok(())
    }

    async fn logs_for(&self, notification_id: i64) -> Result<Vec<NotificationLog>, StoreError> {
        let rows = sqlx::query_as::<_, LogRow>(
            "SELECT id, notification_id, status, message, error_details, provider_response, \
                    metadata, created_at \
             FROM notification_logs WHERE notification_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(notification_id)
        .fetch_all(self.pg())
        .await?;

        rows.into_iter().map(LogRow::into_log).collect()
    }

    async fn recent_logs(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError> {
        self.fetch_logs_with_context(limit, false).await
    }

    async fn recent_errors(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError> {
        self.fetch_logs_with_context(limit, true).await
    }

    async fn stats_last_24h(&self) -> Result<DispatchStats, StoreError> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notifications \
             WHERE created_at >= now() - interval '24 hours' GROUP BY status",
        )
        .fetch_all(self.pg())
        .await?;

        let by_channel: Vec<(String, i64)> = sqlx::query_as(
            "SELECT channel, COUNT(*) FROM notifications \
             WHERE created_at >= now() - interval '24 hours' GROUP BY channel",
        )
        .fetch_all(self.pg())
        .await?;

        let hourly: Vec<(DateTime<Utc>, i64, i64)> = sqlx::query_as(
            "SELECT date_trunc('hour', created_at) AS hour, \
                    COUNT(*) FILTER (WHERE status = 'sent'), \
                    COUNT(*) FILTER (WHERE status = 'failed') \
             FROM notifications \
             WHERE created_at >= now() - interval '24 hours' \
             GROUP BY 1 ORDER BY 1",
        )
        .fetch_all(self.pg())
        .await?;

        let total = by_status.iter().map(|(_, count)| count).sum();

        Ok(DispatchStats {
            total,
            by_status: by_status.into_iter().collect(),
            by_channel: by_channel.into_iter().collect(),
            hourly: hourly
                .into_iter()
                .map(|(hour, sent, failed)| HourlyBucket { hour, sent, failed })
                .collect(),
        })
    }

    async fn find_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, email, name, phone, push_token, slack_webhook_url, telegram_chat_id, \
                    preferences, created_at, updated_at \
             FROM notification_users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pg())
        .await?;

        Ok(row.map(UserRow::into_user))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(self.pg()).await?;
        Ok(())
    }
}

impl PostgresStore {
    async fn fetch_logs_with_context(
        &self,
        limit: i64,
        errors_only: bool,
    ) -> Result<Vec<LogWithContext>, StoreError> {
        let filter = if errors_only {
            "WHERE l.status IN ('error', 'failed')"
        } else {
            ""
        };

        let rows: Vec<LogContextRow> = sqlx::query_as(&format!(
            "SELECT l.id, l.notification_id, l.status, l.message, l.error_details, \
                    l.provider_response, l.metadata, l.created_at, n.channel, n.recipient \
             FROM notification_logs l \
             JOIN notifications n ON n.id = l.notification_id \
             {} ORDER BY l.created_at DESC, l.id DESC LIMIT $1",
            filter
        ))
        .bind(limit)
        .fetch_all(self.pg())
        .await?;

        rows.into_iter().map(LogContextRow::into_entry).collect()
    }
}

#[derive(sqlx::FromRow)]
struct LogContextRow {
    id: i64,
    notification_id: i64,
    status: String,
    message: String,
    error_details: Option<serde_json::Value>,
    provider_response: Option<serde_json::Value>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    channel: String,
    recipient: String,
}

impl LogContextRow {
    fn into_entry(self) -> Result<LogWithContext, StoreError> {
        let channel = Channel::parse(&self.channel)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown channel '{}'", self.channel)))?;
        let status = LogStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown log status '{}'", self.status)))?;

        Ok(LogWithContext {
            log: NotificationLog {
                id: self.id,
                notification_id: self.notification_id,
                status,
                message: self.message,
                error_details: self.error_details,
                provider_response: self.provider_response,
                metadata: self.metadata,
                created_at: self.created_at,
            },
            channel,
            recipient: self.recipient,
        })
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    name: Option<String>,
    phone: Option<String>,
    push_token: Option<String>,
    slack_webhook_url: Option<String>,
    telegram_chat_id: Option<String>,
    preferences: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_user(self) -> UserRecord {
        UserRecord {
            id: self.id,
            email: self.email,
            name: self.name,
            phone: self.phone,
            push_token: self.push_token,
            slack_webhook_url: self.slack_webhook_url,
            telegram_chat_id: self.telegram_chat_id,
            preferences: self.preferences,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
