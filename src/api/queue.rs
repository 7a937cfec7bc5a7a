//! Queue control and health endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::dispatch::SystemHealth;
use crate::domain::queue::QueueCounts;
use crate::error::Result;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue: QueueCounts,
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<QueueStatsResponse>> {
    let counts = state.dispatch.queue_stats().await?;
    Ok(Json(QueueStatsResponse { queue: counts }))
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
}

pub async fn pause(State(state): State<AppState>) -> Result<Json<ControlResponse>> {
    state.dispatch.pause().await?;
    Ok(Json(ControlResponse {
        success: true,
        message: "queue paused".to_string(),
    }))
}

pub async fn resume(State(state): State<AppState>) -> Result<Json<ControlResponse>> {
    state.dispatch.resume().await?;
    Ok(Json(ControlResponse {
        success: true,
        message: "queue resumed".to_string(),
    }))
}

/// Failed broker jobs are cleaned; notification rows are untouched so
/// operators can still audit them.
pub async fn clear_failed(State(state): State<AppState>) -> Result<Json<ControlResponse>> {
    let removed = state.dispatch.clear_failed().await?;
    Ok(Json(ControlResponse {
        success: true,
        message: format!("removed {} failed jobs", removed),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryFailedQuery {
    /// `broker` (default) replays the broker's failed set; `store` re-enqueues
    /// failed rows with remaining retry budget from the database.
    pub source: Option<String>,
}

pub async fn retry_failed(
    State(state): State<AppState>,
    Query(query): Query<RetryFailedQuery>,
) -> Result<Json<ControlResponse>> {
    let retried = match query.source.as_deref() {
        Some("store") => state.dispatch.retry_failed_from_store().await?,
        _ => state.dispatch.retry_failed_jobs().await?,
    };

    Ok(Json(ControlResponse {
        success: true,
        message: format!("re-enqueued {} jobs", retried),
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<SystemHealth> {
    let health = state
        .dispatch
        .system_health(state.worker_pool.is_running())
        .await;
    Json(health)
}
