//! Core notification types shared across the dispatch engine.
//!
//! A `Notification` is one persistent delivery record: one row per
//! (submission x channel). The broker-level `DeliveryJob` that workers pop
//! references a row by id; the row is the business source of truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A delivery mechanism the dispatcher can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Slack,
    Telegram,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Sms,
        Channel::Push,
        Channel::Slack,
        Channel::Telegram,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
            Channel::Slack => "slack",
            Channel::Telegram => "telegram",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(Channel::Email),
            "sms" => Some(Channel::Sms),
            "push" => Some(Channel::Push),
            "slack" => Some(Channel::Slack),
            "telegram" => Some(Channel::Telegram),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Broker priority encoding: higher is served earlier.
    pub fn queue_weight(&self) -> i32 {
        match self {
            Priority::Urgent => 10,
            Priority::High => 5,
            Priority::Normal => 0,
            Priority::Low => -5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Unknown strings fall back to normal, matching the broker encoding rule.
    pub fn parse_or_default(value: &str) -> Self {
        match value {
            "low" => Priority::Low,
            "high" => Priority::High,
            "urgent" => Priority::Urgent,
            _ => Priority::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.queue_weight().cmp(&other.queue_weight())
    }
}

/// Lifecycle state of a notification row.
///
/// `pending` is the initial state at row creation; `queued` once a broker job
/// exists; `retrying` is the book-keeping state held while a delayed retry
/// job sits in the broker. `sent` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Queued,
    Processing,
    Retrying,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "pending",
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Retrying => "retrying",
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(NotificationStatus::Pending),
            "queued" => Some(NotificationStatus::Queued),
            "processing" => Some(NotificationStatus::Processing),
            "retrying" => Some(NotificationStatus::Retrying),
            "sent" => Some(NotificationStatus::Sent),
            "failed" => Some(NotificationStatus::Failed),
            _ => None,
        }
    }

    /// Terminal rows never transition again through the worker path.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persistent delivery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: Option<i64>,
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    pub content: String,
    pub status: NotificationStatus,
    pub error_message: Option<String>,
    /// Count of completed delivery attempts that failed.
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: Priority,
    /// Earliest time the job becomes eligible.
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a notification row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Option<i64>,
    pub channel: Channel,
    pub recipient: String,
    pub subject: Option<String>,
    pub content: String,
    pub priority: Priority,
    pub max_retries: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Status tag on an append-only log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Created,
    Queued,
    Processing,
    Delivered,
    Error,
    RetryScheduled,
    Failed,
    StallRecovered,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Created => "created",
            LogStatus::Queued => "queued",
            LogStatus::Processing => "processing",
            LogStatus::Delivered => "delivered",
            LogStatus::Error => "error",
            LogStatus::RetryScheduled => "retry_scheduled",
            LogStatus::Failed => "failed",
            LogStatus::StallRecovered => "stall_recovered",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(LogStatus::Created),
            "queued" => Some(LogStatus::Queued),
            "processing" => Some(LogStatus::Processing),
            "delivered" => Some(LogStatus::Delivered),
            "error" => Some(LogStatus::Error),
            "retry_scheduled" => Some(LogStatus::RetryScheduled),
            "failed" => Some(LogStatus::Failed),
            "stall_recovered" => Some(LogStatus::StallRecovered),
            _ => None,
        }
    }

    /// Tags that surface on the error feed.
    pub fn is_error(&self) -> bool {
        matches!(self, LogStatus::Error | LogStatus::Failed)
    }
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only log row: a state transition or provider interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationLog {
    pub id: i64,
    pub notification_id: i64,
    pub status: LogStatus,
    pub message: String,
    pub error_details: Option<serde_json::Value>,
    pub provider_response: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a log row.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub notification_id: i64,
    pub status: LogStatus,
    pub message: String,
    pub error_details: Option<serde_json::Value>,
    pub provider_response: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl NewLog {
    pub fn new(notification_id: i64, status: LogStatus, message: impl Into<String>) -> Self {
        Self {
            notification_id,
            status,
            message: message.into(),
            error_details: None,
            provider_response: None,
            metadata: None,
        }
    }

    pub fn with_error_details(mut self, details: serde_json::Value) -> Self {
        self.error_details = Some(details);
        self
    }

    pub fn with_provider_response(mut self, response: serde_json::Value) -> Self {
        self.provider_response = Some(response);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Owning principal with per-channel contact addresses and opt-in flags.
///
/// Dispatch reads these only when a submission omits the explicit recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub push_token: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub preferences: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    /// The stored contact address for a channel, if any.
    pub fn contact_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => Some(self.email.as_str()),
            Channel::Sms => self.phone.as_deref(),
            Channel::Push => self.push_token.as_deref(),
            Channel::Slack => self.slack_webhook_url.as_deref(),
            Channel::Telegram => self.telegram_chat_id.as_deref(),
        }
    }

    /// Per-channel opt-in flag from the preferences blob; absent means opted in.
    pub fn opted_in(&self, channel: Channel) -> bool {
        self.preferences
            .get(channel.as_str())
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering_matches_queue_weight() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::Urgent.queue_weight(), 10);
        assert_eq!(Priority::High.queue_weight(), 5);
        assert_eq!(Priority::Normal.queue_weight(), 0);
        assert_eq!(Priority::Low.queue_weight(), -5);
    }

    #[test]
    fn test_priority_unknown_falls_back_to_normal() {
        assert_eq!(Priority::parse_or_default("critical"), Priority::Normal);
        assert_eq!(Priority::parse_or_default("urgent"), Priority::Urgent);
    }

    #[test]
    fn test_status_terminal_states() {
        assert!(NotificationStatus::Sent.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
        assert!(!NotificationStatus::Retrying.is_terminal());
        assert!(!NotificationStatus::Processing.is_terminal());
    }

    #[test]
    fn test_channel_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(Channel::parse("fax"), None);
    }

    #[test]
    fn test_log_status_error_feed() {
        assert!(LogStatus::Error.is_error());
        assert!(LogStatus::Failed.is_error());
        assert!(!LogStatus::Delivered.is_error());
        assert!(!LogStatus::RetryScheduled.is_error());
    }

    #[test]
    fn test_user_contact_resolution() {
        let user = UserRecord {
            id: 1,
            email: "a@b.c".to_string(),
            name: None,
            phone: Some("+15551234567".to_string()),
            push_token: None,
            slack_webhook_url: None,
            telegram_chat_id: None,
            preferences: json!({"sms": false}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(user.contact_for(Channel::Email), Some("a@b.c"));
        assert_eq!(user.contact_for(Channel::Push), None);
        assert!(!user.opted_in(Channel::Sms));
        assert!(user.opted_in(Channel::Email));
    }
}
