//! Process-level health and metrics endpoints.

use axum::Json;
use serde::Serialize;

use crate::metrics;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn prometheus_metrics() -> String {
    metrics::render()
}
