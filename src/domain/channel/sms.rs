//! SMS gateway adapter.
//!
//! HTTPS POST to a Twilio-compatible messaging API. Recipient numbers are
//! normalized to E.164 before submission.

use async_trait::async_trait;
use serde_json::json;

use crate::config::SmsConfig;
use crate::domain::notification::Channel;

use super::{AdapterError, AdapterStatus, ChannelAdapter, DeliveryRequest, ProviderResponse};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Normalize a phone number to E.164.
///
/// Exactly 10 digits get the `+1` country prefix; anything else keeps its
/// digits and gains a leading `+` when missing. Idempotent by construction:
/// a `+`-prefixed input is returned unchanged.
pub fn normalize_phone(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('+') {
        return format!("+{}", rest);
    }

    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 10 {
        format!("+1{}", digits)
    } else {
        format!("+{}", digits)
    }
}

/// SMS delivery adapter.
pub struct SmsAdapter {
    client: reqwest::Client,
    config: SmsConfig,
}

impl SmsAdapter {
    pub fn new(client: reqwest::Client, config: SmsConfig) -> Self {
        if config.account_sid.is_none() || config.auth_token.is_none() {
            tracing::warn!("SMS gateway credentials not configured, sms channel disabled");
        }
        Self { client, config }
    }

    fn credentials(&self) -> Result<(&str, &str, &str), AdapterError> {
        match (
            self.config.account_sid.as_deref(),
            self.config.auth_token.as_deref(),
            self.config.phone_number.as_deref(),
        ) {
            (Some(sid), Some(token), Some(from)) => Ok((sid, token, from)),
            _ => Err(AdapterError::misconfigured(
                "SMS gateway credentials not configured",
            )),
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        let (sid, token, from) = self.credentials()?;
        let to = normalize_phone(&request.recipient);

        let mut form: Vec<(&str, String)> = vec![
            ("To", to),
            ("From", from.to_string()),
            ("Body", request.content.clone()),
        ];
        if let Some(media_url) = request.meta("media_url").and_then(|v| v.as_str()) {
            form.push(("MediaUrl", media_url.to_string()));
        }
        if let Some(callback) = request.meta("status_callback").and_then(|v| v.as_str()) {
            form.push(("StatusCallback", callback.to_string()));
        }
        if let Some(max_price) = request.meta("max_price").and_then(|v| v.as_f64()) {
            form.push(("MaxPrice", max_price.to_string()));
        }
        if let Some(feedback) = request.meta("provide_feedback").and_then(|v| v.as_bool()) {
            form.push(("ProvideFeedback", feedback.to_string()));
        }

        let response = self
            .client
            .post(format!("{}/Accounts/{}/Messages.json", API_BASE, sid))
            .basic_auth(sid, Some(token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(AdapterError::from_http_status(status, &body));
        }

        let raw: serde_json::Value = serde_json::from_str(&body).unwrap_or(json!({ "body": body }));
        let message_id = raw
            .get("sid")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(ProviderResponse { message_id, raw })
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        let (sid, token, _) = self.credentials()?;

        let response = self
            .client
            .get(format!("{}/Accounts/{}.json", API_BASE, sid))
            .basic_auth(sid, Some(token))
            .send()
            .await?;

        Ok(response.status().is_success())
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: Channel::Sms,
            configured: self.credentials().is_ok(),
            detail: json!({
                "from_number": self.config.phone_number,
            }),
        }
    }
}
