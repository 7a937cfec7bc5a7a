//! SMTP email adapter.
//!
//! Connection-pooled async SMTP via lettre. Messages are MIME multipart with
//! an HTML part and a plain-text fallback; cc/bcc, reply-to, attachments and
//! a priority header come from the request metadata.

use async_trait::async_trait;
use base64::Engine;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::PoolConfig;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::domain::notification::Channel;

use super::{AdapterError, AdapterStatus, ChannelAdapter, DeliveryRequest, ProviderResponse};

/// X-Priority header carried when the submission marks the mail urgent.
#[derive(Debug, Clone, PartialEq)]
struct XPriority(String);

impl Header for XPriority {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Priority")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(s.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// SMTP delivery adapter.
pub struct EmailAdapter {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    from: Option<Mailbox>,
    host: Option<String>,
}

impl EmailAdapter {
    pub fn new(config: &SmtpConfig) -> Self {
        let from = config
            .from
            .as_deref()
            .or(config.user.as_deref())
            .and_then(|addr| addr.parse::<Mailbox>().ok());

        let transport = Self::build_transport(config);
        if transport.is_none() {
            tracing::warn!("SMTP transport not configured, email channel disabled");
        }

        Self {
            transport,
            from,
            host: config.host.clone(),
        }
    }

    fn build_transport(config: &SmtpConfig) -> Option<AsyncSmtpTransport<Tokio1Executor>> {
        let host = config.host.as_deref()?;

        let builder = if config.secure {
            AsyncSmtpTransport::<Tokio1Executor>::relay(host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        };

        let mut builder = match builder {
            Ok(builder) => builder.port(config.port),
            Err(e) => {
                tracing::error!(error = %e, "Invalid SMTP relay configuration");
                return None;
            }
        };

        if let (Some(user), Some(pass)) = (&config.user, &config.pass) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Some(builder.pool_config(PoolConfig::new().max_size(5)).build())
    }

    fn build_message(
        &self,
        request: &DeliveryRequest,
        from: &Mailbox,
        message_id: &str,
    ) -> Result<Message, AdapterError> {
        let to: Mailbox = request
            .recipient
            .parse()
            .map_err(|_| AdapterError::permanent(format!("invalid recipient address: {}", request.recipient)))?;

        let mut builder = Message::builder()
            .from(from.clone())
            .to(to)
            .subject(request.subject.clone().unwrap_or_default())
            .message_id(Some(message_id.to_string()));

        for cc in meta_addresses(request, "cc") {
            let mailbox: Mailbox = cc
                .parse()
                .map_err(|_| AdapterError::permanent(format!("invalid cc address: {}", cc)))?;
            builder = builder.cc(mailbox);
        }
        for bcc in meta_addresses(request, "bcc") {
            let mailbox: Mailbox = bcc
                .parse()
                .map_err(|_| AdapterError::permanent(format!("invalid bcc address: {}", bcc)))?;
            builder = builder.bcc(mailbox);
        }
        if let Some(reply_to) = request.meta("reply_to").and_then(|v| v.as_str()) {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|_| AdapterError::permanent(format!("invalid reply-to address: {}", reply_to)))?;
            builder = builder.reply_to(mailbox);
        }
        if let Some(priority) = request.meta("priority").and_then(|v| v.as_str()) {
            let value = match priority {
                "urgent" | "high" => "1 (Highest)",
                "low" => "5 (Lowest)",
                _ => "3 (Normal)",
            };
            builder = builder.header(XPriority(value.to_string()));
        }

        let text = request.content.clone();
        let html = request.meta("html").and_then(|v| v.as_str()).map(String::from);

        let body = match html {
            Some(html) => MultiPart::alternative_plain_html(text, html),
            None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
        };

        let attachments = decode_attachments(request)?;
        let message = if attachments.is_empty() {
            builder.multipart(body)
        } else {
            let mut mixed = MultiPart::mixed().multipart(body);
            for part in attachments {
                mixed = mixed.singlepart(part);
            }
            builder.multipart(mixed)
        };

        message.map_err(|e| AdapterError::permanent(format!("message build failed: {}", e)))
    }
}

fn meta_addresses(request: &DeliveryRequest, key: &str) -> Vec<String> {
    match request.meta(key) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_attachments(request: &DeliveryRequest) -> Result<Vec<SinglePart>, AdapterError> {
    let Some(items) = request.meta("attachments").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };

    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        let filename = item
            .get("filename")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::permanent("attachment missing filename"))?;
        let content = item
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AdapterError::permanent("attachment missing content"))?;
        let content_type = item
            .get("content_type")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream");

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|e| AdapterError::permanent(format!("attachment not valid base64: {}", e)))?;
        let content_type = ContentType::parse(content_type)
            .map_err(|e| AdapterError::permanent(format!("bad attachment content type: {}", e)))?;

        parts.push(Attachment::new(filename.to_string()).body(bytes, content_type));
    }

    Ok(parts)
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        let (Some(transport), Some(from)) = (&self.transport, &self.from) else {
            return Err(AdapterError::misconfigured("SMTP transport not configured"));
        };

        let message_id = format!("<{}@courier>", Uuid::new_v4());
        let message = self.build_message(request, from, &message_id)?;

        match transport.send(message).await {
            Ok(response) => Ok(ProviderResponse {
                message_id: Some(message_id),
                raw: json!({
                    "code": format!("{:?}", response.code()),
                }),
            }),
            Err(e) if e.is_permanent() => {
                Err(AdapterError::permanent(format!("smtp rejected message: {}", e)))
            }
            Err(e) => Err(AdapterError::transient(format!("smtp send failed: {}", e))),
        }
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        let Some(transport) = &self.transport else {
            return Err(AdapterError::misconfigured("SMTP transport not configured"));
        };

        transport
            .test_connection()
            .await
            .map_err(|e| AdapterError::transient(format!("smtp connection test failed: {}", e)))
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: Channel::Email,
            configured: self.transport.is_some() && self.from.is_some(),
            detail: json!({
                "host": self.host,
                "from": self.from.as_ref().map(|m| m.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configured_adapter() -> EmailAdapter {
        EmailAdapter::new(&SmtpConfig {
            host: Some("smtp.example.com".to_string()),
            port: 587,
            secure: false,
            user: Some("mailer".to_string()),
            pass: Some("secret".to_string()),
            from: Some("Courier <noreply@example.com>".to_string()),
        })
    }

    #[test]
    fn test_unconfigured_adapter_reports_not_configured() {
        let adapter = EmailAdapter::new(&SmtpConfig::default());
        assert!(!adapter.status().configured);
    }

    #[tokio::test]
    async fn test_unconfigured_send_is_misconfigured() {
        let adapter = EmailAdapter::new(&SmtpConfig::default());
        let err = adapter
            .send(&DeliveryRequest::new("a@b.c", "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Misconfigured);
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let adapter = configured_adapter();
        let from: Mailbox = "noreply@example.com".parse().unwrap();
        let err = adapter
            .build_message(
                &DeliveryRequest::new("not an address", "hello"),
                &from,
                "<id@courier>",
            )
            .unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_message_builds_with_full_metadata() {
        let adapter = configured_adapter();
        let from: Mailbox = "noreply@example.com".parse().unwrap();
        let request = DeliveryRequest::new("a@b.c", "plain body")
            .with_subject("Hi")
            .with_metadata(json!({
                "html": "<p>rich body</p>",
                "cc": ["cc@example.com"],
                "bcc": "bcc@example.com",
                "reply_to": "replies@example.com",
                "priority": "urgent",
                "attachments": [{
                    "filename": "report.txt",
                    "content_type": "text/plain",
                    "content": "aGVsbG8=",
                }],
            }));

        let message = adapter.build_message(&request, &from, "<id@courier>");
        assert!(message.is_ok());
    }

    #[test]
    fn test_bad_attachment_base64_is_permanent() {
        let request = DeliveryRequest::new("a@b.c", "body").with_metadata(json!({
            "attachments": [{"filename": "x", "content": "%%%not base64%%%"}],
        }));
        let err = decode_attachments(&request).unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Permanent);
    }
}
