//! Slack adapter.
//!
//! Delivery posts to the incoming-webhook URL stored as the recipient, so
//! sending needs no credentials. The optional bot token only backs the
//! verify probe.

use async_trait::async_trait;
use serde_json::json;

use crate::config::SlackConfig;
use crate::domain::notification::Channel;

use super::{AdapterError, AdapterStatus, ChannelAdapter, DeliveryRequest, ProviderResponse};

/// Slack incoming-webhook adapter.
pub struct SlackAdapter {
    client: reqwest::Client,
    bot_token: Option<String>,
}

impl SlackAdapter {
    pub fn new(client: reqwest::Client, config: &SlackConfig) -> Self {
        Self {
            client,
            bot_token: config.bot_token.clone(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn channel(&self) -> Channel {
        Channel::Slack
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        if !request.recipient.starts_with("https://") {
            return Err(AdapterError::permanent(format!(
                "recipient is not a webhook URL: {}",
                request.recipient
            )));
        }

        // Body is { text, ...metadata }: extra keys pass straight through to
        // the webhook (blocks, channel overrides, and so on).
        let mut body = serde_json::Map::new();
        body.insert("text".to_string(), json!(request.content));
        if let Some(serde_json::Value::Object(extra)) = request.metadata.as_ref() {
            for (key, value) in extra {
                body.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let response = self
            .client
            .post(&request.recipient)
            .json(&serde_json::Value::Object(body))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            // Webhook failures are worth retrying regardless of status class.
            return Err(AdapterError::transient(format!(
                "webhook returned {}: {}",
                status.as_u16(),
                text
            )));
        }

        Ok(ProviderResponse {
            message_id: None,
            raw: json!({ "status": status.as_u16(), "body": text }),
        })
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        let Some(token) = &self.bot_token else {
            // Webhook delivery needs no credentials; nothing to probe.
            return Ok(true);
        };

        let response = self
            .client
            .post("https://slack.com/api/auth.test")
            .bearer_auth(token)
            .send()
            .await?;

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(body.get("ok").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: Channel::Slack,
            configured: true,
            detail: json!({
                "bot_token_present": self.bot_token.is_some(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_non_url_recipient_is_permanent() {
        let adapter = SlackAdapter::new(reqwest::Client::new(), &SlackConfig::default());
        let err = adapter
            .send(&DeliveryRequest::new("#general", "hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Permanent);
    }

    #[test]
    fn test_webhook_adapter_is_always_configured() {
        let adapter = SlackAdapter::new(reqwest::Client::new(), &SlackConfig::default());
        assert!(adapter.status().configured);
    }
}
