//! Backend trait for the notification store.
//!
//! The store is the business source of truth: one row per delivery, plus the
//! append-only transition log. Every status-updating operation is atomic
//! with its log append so invariant checking can rely on the log trail.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::domain::notification::{
    Channel, NewLog, NewNotification, Notification, NotificationLog, NotificationStatus,
    UserRecord,
};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Relational store operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Row exists but cannot be interpreted
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Serialization error for a JSON column
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A log row joined with its notification's channel and recipient, for the
/// operator-facing log feeds.
#[derive(Debug, Clone, Serialize)]
pub struct LogWithContext {
    #[serde(flatten)]
    pub log: NotificationLog,
    pub channel: Channel,
    pub recipient: String,
}

/// One hour of delivery outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub sent: i64,
    pub failed: i64,
}

/// Raw 24-hour rollups; the analytics module derives rates from these.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub by_channel: HashMap<String, i64>,
    pub hourly: Vec<HourlyBucket>,
}

/// Typed repository over the relational store.
///
/// Guards enforced by every implementation:
/// - a row in a terminal state (`sent`, `failed`) is never transitioned by
///   `update_status`; only `requeue` may move a failed row back to queued
/// - `sent_at` is stamped exactly once, when the row first reaches `sent`
/// - `update_status` to `processing` also touches `last_processed_at`
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Create one row and append its `created` log entry.
    async fn create(&self, new: NewNotification) -> Result<Notification, StoreError>;

    /// Create a fan-out of rows in one transaction.
    async fn create_many(&self, new: Vec<NewNotification>) -> Result<Vec<Notification>, StoreError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Notification>, StoreError>;

    async fn list_by_user(
        &self,
        user_id: i64,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Transition a row and append the log entry atomically. Returns `false`
    /// when the row was missing or already terminal (nothing happens then).
    async fn update_status(
        &self,
        id: i64,
        status: NotificationStatus,
        error_message: Option<String>,
        log: NewLog,
    ) -> Result<bool, StoreError>;

    /// Move a batch of freshly-created rows to `queued`, appending one
    /// `queued` log per row.
    async fn mark_queued_bulk(&self, ids: &[i64]) -> Result<(), StoreError>;

    /// Admin path: move a non-sent row back to `queued` for re-delivery,
    /// optionally resetting its retry budget. Returns `false` for sent or
    /// missing rows.
    async fn requeue(
        &self,
        id: i64,
        reset_retry_count: bool,
        log: NewLog,
    ) -> Result<bool, StoreError>;

    async fn update_last_processed(&self, id: i64) -> Result<(), StoreError>;

    /// Atomic increment; returns the new count.
    async fn increment_retry_count(&self, id: i64) -> Result<i32, StoreError>;

    /// `status = pending AND scheduled_at <= now`, oldest schedule first.
    async fn list_pending(&self, limit: i64) -> Result<Vec<Notification>, StoreError>;

    /// `status = failed AND retry_count < max_retries AND scheduled_at <=
    /// now`, highest priority first, then oldest.
    async fn list_retryable(&self) -> Result<Vec<Notification>, StoreError>;

    /// `status = processing AND last_processed_at` older than the threshold.
    async fn list_stale(&self, minutes: i64) -> Result<Vec<Notification>, StoreError>;

    async fn append_log(&self, log: NewLog) -> Result<(), StoreError>;

    async fn logs_for(&self, notification_id: i64) -> Result<Vec<NotificationLog>, StoreError>;

    async fn recent_logs(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError>;

    /// Error-feed entries only (`error` and `failed` tags).
    async fn recent_errors(&self, limit: i64) -> Result<Vec<LogWithContext>, StoreError>;

    async fn stats_last_24h(&self) -> Result<DispatchStats, StoreError>;

    async fn find_user(&self, id: i64) -> Result<Option<UserRecord>, StoreError>;

    /// Store connectivity probe.
    async fn ping(&self) -> Result<(), StoreError>;
}
