//! Notification submission and status endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::dispatch::{SubmitChannel, Submission};
use crate::domain::notification::{Channel, Notification, Priority};
use crate::error::{AppError, Result};
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub user_id: Option<i64>,
    pub subject: Option<String>,
    pub message: String,
    #[serde(default)]
    pub channels: Vec<ChannelTarget>,
    pub priority: Option<String>,
    pub scheduled_at: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelTarget {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub recipient: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub success: bool,
    pub notification_id: i64,
    pub message: String,
}

pub async fn send(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<(StatusCode, Json<SendResponse>)> {
    let submission = validate(request)?;
    let outcome = state.dispatch.submit(submission).await?;

    Ok((
        StatusCode::CREATED,
        Json(SendResponse {
            success: true,
            notification_id: outcome.first_id,
            message: "Notification queued for delivery".to_string(),
        }),
    ))
}

fn validate(request: SendRequest) -> Result<Submission> {
    if request.channels.is_empty() {
        return Err(AppError::Validation(
            "channels must be a non-empty array".to_string(),
        ));
    }
    if request.message.trim().is_empty() {
        return Err(AppError::Validation("message is required".to_string()));
    }

    let mut channels = Vec::with_capacity(request.channels.len());
    for target in &request.channels {
        let Some(channel) = Channel::parse(&target.channel_type) else {
            return Err(AppError::Validation(format!(
                "unrecognized channel type '{}'",
                target.channel_type
            )));
        };
        let recipient = target.recipient.as_deref().unwrap_or_default();
        if recipient.is_empty() && request.user_id.is_none() {
            return Err(AppError::Validation(format!(
                "channel '{}' requires a recipient",
                target.channel_type
            )));
        }
        channels.push(SubmitChannel {
            channel,
            recipient: target.recipient.clone().filter(|r| !r.is_empty()),
        });
    }

    let priority = match request.priority.as_deref() {
        None => Priority::default(),
        Some("low") => Priority::Low,
        Some("normal") => Priority::Normal,
        Some("high") => Priority::High,
        Some("urgent") => Priority::Urgent,
        Some(other) => {
            return Err(AppError::Validation(format!(
                "priority must be one of low, normal, high, urgent (got '{}')",
                other
            )))
        }
    };

    let scheduled_at = match request.scheduled_at.as_deref() {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    AppError::Validation(format!("scheduledAt is not ISO 8601: '{}'", raw))
                })?,
        ),
    };

    Ok(Submission {
        user_id: request.user_id,
        subject: request.subject,
        message: request.message,
        channels,
        priority,
        scheduled_at,
        metadata: request.metadata,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub status: String,
    pub channels: Vec<ChannelStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

#[derive(Debug, Serialize)]
pub struct ChannelStatus {
    #[serde(rename = "type")]
    pub channel_type: String,
    pub status: String,
}

impl StatusResponse {
    fn from_notification(n: &Notification) -> Self {
        Self {
            id: n.id,
            user_id: n.user_id,
            status: n.status.to_string(),
            channels: vec![ChannelStatus {
                channel_type: n.channel.to_string(),
                status: n.status.to_string(),
            }],
            created_at: n.created_at,
            updated_at: n.updated_at,
            scheduled_at: Some(n.scheduled_at),
            retry_count: n.retry_count,
        }
    }
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>> {
    let Some(notification) = state.store.find_by_id(id).await? else {
        return Err(AppError::NotFound(format!("notification {}", id)));
    };
    Ok(Json(StatusResponse::from_notification(&notification)))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserNotificationsResponse {
    pub notifications: Vec<StatusResponse>,
    pub page: i64,
    pub limit: i64,
}

pub async fn list_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<PageQuery>,
) -> Result<Json<UserNotificationsResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page - 1) * limit;

    let rows = state.store.list_by_user(user_id, offset, limit).await?;

    Ok(Json(UserNotificationsResponse {
        notifications: rows.iter().map(StatusResponse::from_notification).collect(),
        page,
        limit,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    #[serde(default)]
    pub reset_retry_count: bool,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub success: bool,
    pub message: String,
}

pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    request: Option<Json<RetryRequest>>,
) -> Result<Json<RetryResponse>> {
    let reset = request.map(|Json(r)| r.reset_retry_count).unwrap_or(false);
    state.dispatch.retry_notification(id, reset).await?;

    Ok(Json(RetryResponse {
        success: true,
        message: format!("notification {} re-enqueued", id),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_request() -> SendRequest {
        SendRequest {
            user_id: None,
            subject: Some("Hi".to_string()),
            message: "Hello".to_string(),
            channels: vec![ChannelTarget {
                channel_type: "email".to_string(),
                recipient: Some("a@b.c".to_string()),
            }],
            priority: None,
            scheduled_at: None,
            metadata: None,
        }
    }

    #[test]
    fn test_validate_accepts_well_formed_request() {
        let submission = validate(base_request()).unwrap();
        assert_eq!(submission.channels.len(), 1);
        assert_eq!(submission.priority, Priority::Normal);
    }

    #[test]
    fn test_validate_rejects_empty_channels() {
        let mut request = base_request();
        request.channels.clear();
        assert!(validate(request).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_channel() {
        let mut request = base_request();
        request.channels[0].channel_type = "fax".to_string();
        assert!(validate(request).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_priority() {
        let mut request = base_request();
        request.priority = Some("critical".to_string());
        assert!(validate(request).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_schedule() {
        let mut request = base_request();
        request.scheduled_at = Some("next tuesday".to_string());
        assert!(validate(request).is_err());
    }

    #[test]
    fn test_validate_allows_missing_recipient_with_user() {
        let mut request = base_request();
        request.user_id = Some(1);
        request.channels[0].recipient = None;
        let submission = validate(request).unwrap();
        assert!(submission.channels[0].recipient.is_none());
    }

    #[test]
    fn test_validate_parses_iso_schedule() {
        let mut request = base_request();
        request.scheduled_at = Some("2026-01-01T10:00:00Z".to_string());
        let submission = validate(request).unwrap();
        assert!(submission.scheduled_at.is_some());
    }
}
