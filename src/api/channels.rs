//! Per-channel direct endpoints.
//!
//! These bypass the queue entirely and invoke adapters synchronously, so
//! adapter errors surface to the HTTP caller here (unlike the dispatch path,
//! where they only appear on the row and its log).

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::channel::{AdapterStatus, DeliveryRequest, MulticastSummary, ProviderResponse};
use crate::domain::notification::Channel;
use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct DirectSendRequest {
    pub recipient: String,
    pub subject: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSendResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub provider_response: serde_json::Value,
}

impl From<ProviderResponse> for DirectSendResponse {
    fn from(response: ProviderResponse) -> Self {
        Self {
            success: true,
            message_id: response.message_id,
            provider_response: response.raw,
        }
    }
}

async fn direct_send(
    state: &AppState,
    channel: Channel,
    request: DirectSendRequest,
) -> Result<Json<DirectSendResponse>> {
    let Some(adapter) = state.adapters.get(channel) else {
        return Err(AppError::Internal(format!(
            "no adapter registered for {}",
            channel
        )));
    };

    let mut delivery = DeliveryRequest::new(request.recipient, request.message);
    if let Some(subject) = request.subject {
        delivery = delivery.with_subject(subject);
    }
    if let Some(metadata) = request.metadata {
        delivery = delivery.with_metadata(metadata);
    }

    let response = adapter.send(&delivery).await?;
    Ok(Json(response.into()))
}

pub async fn send_email(
    State(state): State<AppState>,
    Json(request): Json<DirectSendRequest>,
) -> Result<Json<DirectSendResponse>> {
    direct_send(&state, Channel::Email, request).await
}

pub async fn send_sms(
    State(state): State<AppState>,
    Json(request): Json<DirectSendRequest>,
) -> Result<Json<DirectSendResponse>> {
    direct_send(&state, Channel::Sms, request).await
}

#[derive(Debug, Deserialize)]
pub struct MulticastRequest {
    pub tokens: Vec<String>,
    pub subject: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

pub async fn push_multicast(
    State(state): State<AppState>,
    Json(request): Json<MulticastRequest>,
) -> Result<Json<MulticastSummary>> {
    if request.tokens.is_empty() {
        return Err(AppError::Validation("tokens must be non-empty".to_string()));
    }

    let mut delivery = DeliveryRequest::new("", request.message);
    if let Some(subject) = request.subject {
        delivery = delivery.with_subject(subject);
    }
    if let Some(metadata) = request.metadata {
        delivery = delivery.with_metadata(metadata);
    }

    let summary = state.push.send_multicast(&request.tokens, &delivery).await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
pub struct TopicSendRequest {
    pub topic: String,
    pub subject: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

pub async fn push_topic(
    State(state): State<AppState>,
    Json(request): Json<TopicSendRequest>,
) -> Result<Json<DirectSendResponse>> {
    let mut delivery = DeliveryRequest::new("", request.message);
    if let Some(subject) = request.subject {
        delivery = delivery.with_subject(subject);
    }
    if let Some(metadata) = request.metadata {
        delivery = delivery.with_metadata(metadata);
    }

    let response = state.push.send_topic(&request.topic, &delivery).await?;
    Ok(Json(response.into()))
}

#[derive(Debug, Deserialize)]
pub struct TopicMembershipRequest {
    pub topic: String,
    pub tokens: Vec<String>,
}

pub async fn subscribe_topic(
    State(state): State<AppState>,
    Json(request): Json<TopicMembershipRequest>,
) -> Result<Json<DirectSendResponse>> {
    let response = state
        .push
        .subscribe_topic(&request.topic, &request.tokens)
        .await?;
    Ok(Json(response.into()))
}

pub async fn unsubscribe_topic(
    State(state): State<AppState>,
    Json(request): Json<TopicMembershipRequest>,
) -> Result<Json<DirectSendResponse>> {
    let response = state
        .push
        .unsubscribe_topic(&request.topic, &request.tokens)
        .await?;
    Ok(Json(response.into()))
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub channel: Channel,
    pub ok: bool,
    pub status: AdapterStatus,
}

pub async fn verify(
    State(state): State<AppState>,
    Path(channel): Path<String>,
) -> Result<Json<VerifyResponse>> {
    let Some(channel) = Channel::parse(&channel) else {
        return Err(AppError::Validation(format!(
            "unrecognized channel '{}'",
            channel
        )));
    };
    let Some(adapter) = state.adapters.get(channel) else {
        return Err(AppError::Internal(format!(
            "no adapter registered for {}",
            channel
        )));
    };

    let ok = adapter.verify().await.unwrap_or(false);
    Ok(Json(VerifyResponse {
        channel,
        ok,
        status: adapter.status(),
    }))
}
