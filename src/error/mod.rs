//! API-facing error type.
//!
//! Error responses carry `{error, message, details?}`. Adapter failures only
//! reach HTTP callers through the synchronous per-channel endpoints; the
//! queued dispatch path records them on the row and its log instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::channel::{AdapterError, AdapterErrorKind};
use crate::domain::dispatch::DispatchError;
use crate::domain::queue::QueueError;
use crate::domain::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] QueueError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Validation(msg) => AppError::Validation(msg),
            DispatchError::NotFound(msg) => AppError::NotFound(msg),
            DispatchError::Store(e) => AppError::Persistence(e),
            DispatchError::Queue(e) => AppError::Broker(e),
            DispatchError::Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), None),
            AppError::Persistence(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "persistence_error",
                e.to_string(),
                None,
            ),
            AppError::Broker(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "broker_error",
                e.to_string(),
                None,
            ),
            AppError::Adapter(e) => {
                let status = match e.kind {
                    AdapterErrorKind::Misconfigured => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_GATEWAY,
                };
                (
                    status,
                    "adapter_error",
                    e.message.clone(),
                    Some(serde_json::json!({ "kind": e.kind })),
                )
            }
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                e.to_string(),
                None,
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
                None,
            ),
        };

        // Always log the detailed error server-side
        tracing::error!(
            code = %code,
            status = %status.as_u16(),
            message = %message,
            "API error"
        );

        let body = ErrorResponse {
            error: code.to_string(),
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
