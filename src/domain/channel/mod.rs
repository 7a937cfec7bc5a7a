//! Channel adapter contract and registry.
//!
//! Every adapter sends one message via one channel and reports either the
//! provider response or a typed error. Error classification is part of the
//! contract, not dispatcher discretion:
//!
//! - `Misconfigured`: missing credentials or unparseable key material; the
//!   adapter fails every call with this class and reports `configured: false`
//! - `Permanent`: provider rejected the payload or recipient; never retried
//! - `Transient`: network error, 5xx, or rate limit (429); retried per policy

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::notification::{Channel, Notification};

mod email;
mod push;
mod slack;
mod sms;
mod telegram;

pub use email::EmailAdapter;
pub use push::{MulticastSummary, PushAdapter};
pub use slack::SlackAdapter;
pub use sms::{normalize_phone, SmsAdapter};
pub use telegram::TelegramAdapter;

/// Classification of an adapter failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterErrorKind {
    Transient,
    Permanent,
    Misconfigured,
}

impl std::fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterErrorKind::Transient => "transient",
            AdapterErrorKind::Permanent => "permanent",
            AdapterErrorKind::Misconfigured => "misconfigured",
        };
        f.write_str(s)
    }
}

/// A classified adapter failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} adapter failure: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Misconfigured,
            message: message.into(),
        }
    }

    /// Only transient failures go back through the retry policy.
    pub fn is_retryable(&self) -> bool {
        self.kind == AdapterErrorKind::Transient
    }

    /// Shared HTTP status classification: 429 and 5xx are transient, any
    /// other non-success status is permanent.
    pub fn from_http_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("provider returned {}: {}", status.as_u16(), body);
        if status.as_u16() == 429 || status.is_server_error() {
            Self::transient(message)
        } else {
            Self::permanent(message)
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        // Connection-level failures are always worth retrying.
        Self::transient(format!("http error: {}", err))
    }
}

/// Successful provider interaction.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub message_id: Option<String>,
    pub raw: serde_json::Value,
}

/// Read-only adapter introspection for health surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub channel: Channel,
    pub configured: bool,
    pub detail: serde_json::Value,
}

/// What an adapter needs to deliver one message.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub recipient: String,
    pub subject: Option<String>,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl DeliveryRequest {
    pub fn new(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            subject: None,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            recipient: notification.recipient.clone(),
            subject: notification.subject.clone(),
            content: notification.content.clone(),
            metadata: None,
        }
    }

    /// A metadata field, if metadata was supplied.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Contract every channel adapter satisfies.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Send one message; errors carry the mandatory classification.
    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError>;

    /// Credentials/connectivity probe used by verify endpoints and startup.
    async fn verify(&self) -> Result<bool, AdapterError>;

    /// Read-only introspection.
    fn status(&self) -> AdapterStatus;
}

/// Registry mapping channels to their adapters.
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub fn statuses(&self) -> Vec<AdapterStatus> {
        let mut statuses: Vec<AdapterStatus> =
            self.adapters.values().map(|a| a.status()).collect();
        statuses.sort_by_key(|s| s.channel.as_str());
        statuses
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        let rate_limited =
            AdapterError::from_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(rate_limited.kind, AdapterErrorKind::Transient);

        let server_error =
            AdapterError::from_http_status(reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert_eq!(server_error.kind, AdapterErrorKind::Transient);

        let rejected =
            AdapterError::from_http_status(reqwest::StatusCode::BAD_REQUEST, "bad number");
        assert_eq!(rejected.kind, AdapterErrorKind::Permanent);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(AdapterError::transient("x").is_retryable());
        assert!(!AdapterError::permanent("x").is_retryable());
        assert!(!AdapterError::misconfigured("x").is_retryable());
    }
}
