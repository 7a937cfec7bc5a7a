//! Telegram bot adapter.
//!
//! Posts `sendMessage` to the Bot API with HTML parse mode. The API signals
//! rejection in the response body (`ok: false`), which maps to a permanent
//! failure carrying the description.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::TelegramConfig;
use crate::domain::notification::Channel;

use super::{AdapterError, AdapterStatus, ChannelAdapter, DeliveryRequest, ProviderResponse};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    description: Option<String>,
    result: Option<serde_json::Value>,
}

/// Telegram Bot API adapter.
pub struct TelegramAdapter {
    client: reqwest::Client,
    bot_token: Option<String>,
}

impl TelegramAdapter {
    pub fn new(client: reqwest::Client, config: &TelegramConfig) -> Self {
        if config.bot_token.is_none() {
            tracing::warn!("Telegram bot token not configured, telegram channel disabled");
        }
        Self {
            client,
            bot_token: config.bot_token.clone(),
        }
    }

    fn token(&self) -> Result<&str, AdapterError> {
        self.bot_token
            .as_deref()
            .ok_or_else(|| AdapterError::misconfigured("Telegram bot token not configured"))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        let token = self.token()?;

        let response = self
            .client
            .post(format!("{}/bot{}/sendMessage", API_BASE, token))
            .json(&json!({
                "chat_id": request.recipient,
                "text": request.content,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(AdapterError::transient(format!(
                "telegram returned {}: {}",
                status.as_u16(),
                text
            )));
        }

        let reply: TelegramReply = serde_json::from_str(&text)
            .map_err(|e| AdapterError::transient(format!("unparseable telegram reply: {}", e)))?;

        if !reply.ok {
            return Err(AdapterError::permanent(
                reply
                    .description
                    .unwrap_or_else(|| "telegram rejected the message".to_string()),
            ));
        }

        let message_id = reply
            .result
            .as_ref()
            .and_then(|r| r.get("message_id"))
            .and_then(|v| v.as_i64())
            .map(|id| id.to_string());

        Ok(ProviderResponse {
            message_id,
            raw: reply.result.unwrap_or(json!({})),
        })
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        let token = self.token()?;

        let response = self
            .client
            .get(format!("{}/bot{}/getMe", API_BASE, token))
            .send()
            .await?;

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: Channel::Telegram,
            configured: self.bot_token.is_some(),
            detail: json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_token_is_misconfigured() {
        let adapter = TelegramAdapter::new(reqwest::Client::new(), &TelegramConfig::default());
        let err = adapter
            .send(&DeliveryRequest::new("12345", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Misconfigured);
        assert!(!adapter.status().configured);
    }

    #[test]
    fn test_reply_parsing() {
        let reply: TelegramReply =
            serde_json::from_str(r#"{"ok":false,"description":"chat not found"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.description.as_deref(), Some("chat not found"));
    }
}
