//! Mobile push adapter (FCM HTTP v1).
//!
//! Authenticates with a service-account key: a short-lived RS256 assertion is
//! exchanged for an OAuth access token, cached until shortly before expiry.
//! Single-token send is the dispatch path; multicast, topic send and topic
//! subscription management are admin-API operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::PushConfig;
use crate::domain::notification::Channel;

use super::{AdapterError, AdapterStatus, ChannelAdapter, DeliveryRequest, ProviderResponse};

const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const FCM_BASE: &str = "https://fcm.googleapis.com/v1";
const TOPIC_BASE: &str = "https://iid.googleapis.com/iid/v1";

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Outcome of a multicast send, one entry per target token.
#[derive(Debug, Serialize)]
pub struct MulticastSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub responses: Vec<Value>,
}

/// FCM push adapter.
pub struct PushAdapter {
    client: reqwest::Client,
    project_id: Option<String>,
    key: Option<ServiceAccountKey>,
    token: RwLock<Option<CachedToken>>,
}

impl PushAdapter {
    pub fn new(client: reqwest::Client, config: &PushConfig) -> Self {
        let key = config.service_account_key.as_deref().and_then(|raw| {
            match serde_json::from_str::<ServiceAccountKey>(raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!(error = %e, "Service account key is not valid JSON");
                    None
                }
            }
        });

        if key.is_none() || config.project_id.is_none() {
            tracing::warn!("Push service not configured, push channel disabled");
        }

        Self {
            client,
            project_id: config.project_id.clone(),
            key,
            token: RwLock::new(None),
        }
    }

    fn configured(&self) -> Result<(&str, &ServiceAccountKey), AdapterError> {
        match (self.project_id.as_deref(), self.key.as_ref()) {
            (Some(project), Some(key)) => Ok((project, key)),
            _ => Err(AdapterError::misconfigured(
                "push service account not configured",
            )),
        }
    }

    /// Get a cached access token, exchanging a fresh assertion when expired.
    async fn access_token(&self) -> Result<String, AdapterError> {
        let (_, key) = self.configured()?;

        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if token.expires_at > Utc::now() {
                    return Ok(token.token.clone());
                }
            }
        }

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &key.client_email,
            scope: OAUTH_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AdapterError::misconfigured(format!("unparseable private key: {}", e)))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .map_err(|e| AdapterError::misconfigured(format!("assertion signing failed: {}", e)))?;

        let response = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AdapterError::from_http_status(status, &body));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: i64,
        }
        let parsed: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| AdapterError::transient(format!("bad token response: {}", e)))?;

        let token = parsed.access_token.clone();
        let mut cached = self.token.write().await;
        *cached = Some(CachedToken {
            token: parsed.access_token,
            // Refresh a minute early so in-flight sends never race expiry
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in - 60),
        });

        Ok(token)
    }

    /// Assemble the v1 message body for one target.
    fn build_message(target: (&str, &str), request: &DeliveryRequest) -> Value {
        let (target_key, target_value) = target;
        let title = request
            .subject
            .clone()
            .unwrap_or_else(|| "Notification".to_string());

        let mut fields = serde_json::Map::new();
        fields.insert(target_key.to_string(), json!(target_value));
        fields.insert(
            "notification".to_string(),
            json!({
                "title": title,
                "body": request.content,
            }),
        );
        let mut message = Value::Object(fields);

        if let Some(android) = request.meta("android") {
            let mut config = serde_json::Map::new();
            if let Some(priority) = android.get("priority").and_then(|v| v.as_str()) {
                config.insert("priority".to_string(), json!(priority));
            }
            if let Some(ttl) = android.get("ttl").and_then(|v| v.as_i64()) {
                config.insert("ttl".to_string(), json!(format!("{}s", ttl)));
            }
            if let Some(key) = android.get("collapse_key").and_then(|v| v.as_str()) {
                config.insert("collapse_key".to_string(), json!(key));
            }
            message["android"] = Value::Object(config);
        }

        if let Some(ios) = request.meta("ios") {
            let mut aps = serde_json::Map::new();
            if let Some(badge) = ios.get("badge").and_then(|v| v.as_i64()) {
                aps.insert("badge".to_string(), json!(badge));
            }
            if let Some(sound) = ios.get("sound").and_then(|v| v.as_str()) {
                aps.insert("sound".to_string(), json!(sound));
            }
            if let Some(category) = ios.get("category").and_then(|v| v.as_str()) {
                aps.insert("category".to_string(), json!(category));
            }
            message["apns"] = json!({ "payload": { "aps": Value::Object(aps) } });
        }

        if let Some(web) = request.meta("web") {
            if let Some(icon) = web.get("icon").and_then(|v| v.as_str()) {
                message["webpush"] = json!({ "notification": { "icon": icon } });
            }
        }

        json!({ "message": message })
    }

    async fn post_message(&self, body: Value) -> Result<ProviderResponse, AdapterError> {
        let (project, _) = self.configured()?;
        let token = self.access_token().await?;

        let response = self
            .client
            .post(format!("{}/projects/{}/messages:send", FCM_BASE, project))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AdapterError::from_http_status(status, &text));
        }

        let raw: Value = serde_json::from_str(&text).unwrap_or(json!({ "body": text }));
        // v1 replies with "projects/{project}/messages/{id}"
        let message_id = raw
            .get("name")
            .and_then(|v| v.as_str())
            .and_then(|name| name.rsplit('/').next())
            .map(String::from);

        Ok(ProviderResponse { message_id, raw })
    }

    /// Admin operation: send the same payload to many device tokens.
    pub async fn send_multicast(
        &self,
        tokens: &[String],
        request: &DeliveryRequest,
    ) -> Result<MulticastSummary, AdapterError> {
        self.configured()?;

        let mut summary = MulticastSummary {
            success_count: 0,
            failure_count: 0,
            responses: Vec::with_capacity(tokens.len()),
        };

        for token in tokens {
            let body = Self::build_message(("token", token), request);
            match self.post_message(body).await {
                Ok(response) => {
                    summary.success_count += 1;
                    summary.responses.push(json!({
                        "token": token,
                        "success": true,
                        "message_id": response.message_id,
                    }));
                }
                Err(e) => {
                    summary.failure_count += 1;
                    summary.responses.push(json!({
                        "token": token,
                        "success": false,
                        "error": e.to_string(),
                    }));
                }
            }
        }

        Ok(summary)
    }

    /// Admin operation: send to a topic.
    pub async fn send_topic(
        &self,
        topic: &str,
        request: &DeliveryRequest,
    ) -> Result<ProviderResponse, AdapterError> {
        let body = Self::build_message(("topic", topic), request);
        self.post_message(body).await
    }

    /// Admin operation: subscribe device tokens to a topic.
    pub async fn subscribe_topic(
        &self,
        topic: &str,
        tokens: &[String],
    ) -> Result<ProviderResponse, AdapterError> {
        self.topic_membership(topic, tokens, "batchAdd").await
    }

    /// Admin operation: unsubscribe device tokens from a topic.
    pub async fn unsubscribe_topic(
        &self,
        topic: &str,
        tokens: &[String],
    ) -> Result<ProviderResponse, AdapterError> {
        self.topic_membership(topic, tokens, "batchRemove").await
    }

    async fn topic_membership(
        &self,
        topic: &str,
        tokens: &[String],
        action: &str,
    ) -> Result<ProviderResponse, AdapterError> {
        self.configured()?;
        let token = self.access_token().await?;

        let response = self
            .client
            .post(format!("{}:{}", TOPIC_BASE, action))
            .bearer_auth(token)
            .header("access_token_auth", "true")
            .json(&json!({
                "to": format!("/topics/{}", topic),
                "registration_tokens": tokens,
            }))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AdapterError::from_http_status(status, &text));
        }

        let raw: Value = serde_json::from_str(&text).unwrap_or(json!({ "body": text }));
        Ok(ProviderResponse {
            message_id: None,
            raw,
        })
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<ProviderResponse, AdapterError> {
        let body = Self::build_message(("token", &request.recipient), request);
        self.post_message(body).await
    }

    async fn verify(&self) -> Result<bool, AdapterError> {
        self.access_token().await.map(|_| true)
    }

    fn status(&self) -> AdapterStatus {
        AdapterStatus {
            channel: Channel::Push,
            configured: self.configured().is_ok(),
            detail: json!({
                "project_id": self.project_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_key_is_misconfigured() {
        let adapter = PushAdapter::new(reqwest::Client::new(), &PushConfig::default());
        let err = adapter
            .send(&DeliveryRequest::new("device-token", "body"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, super::super::AdapterErrorKind::Misconfigured);
        assert!(!adapter.status().configured);
    }

    #[test]
    fn test_unparseable_key_material_reports_unconfigured() {
        let adapter = PushAdapter::new(
            reqwest::Client::new(),
            &PushConfig {
                project_id: Some("demo".to_string()),
                service_account_key: Some("not json".to_string()),
            },
        );
        assert!(!adapter.status().configured);
    }

    #[test]
    fn test_message_includes_platform_payloads() {
        let request = DeliveryRequest::new("tok", "body")
            .with_subject("Title")
            .with_metadata(json!({
                "android": {"priority": "high", "ttl": 60, "collapse_key": "k"},
                "ios": {"badge": 3, "sound": "ping", "category": "alerts"},
                "web": {"icon": "https://example.com/icon.png"},
            }));

        let body = PushAdapter::build_message(("token", "tok"), &request);
        let message = &body["message"];

        assert_eq!(message["token"], "tok");
        assert_eq!(message["notification"]["title"], "Title");
        assert_eq!(message["android"]["ttl"], "60s");
        assert_eq!(message["apns"]["payload"]["aps"]["badge"], 3);
        assert_eq!(
            message["webpush"]["notification"]["icon"],
            "https://example.com/icon.png"
        );
    }

    #[test]
    fn test_topic_message_targets_topic() {
        let request = DeliveryRequest::new("ignored", "body");
        let body = PushAdapter::build_message(("topic", "releases"), &request);
        assert_eq!(body["message"]["topic"], "releases");
        assert!(body["message"].get("token").is_none());
    }
}
