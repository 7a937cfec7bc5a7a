//! Analytics and log-feed endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::domain::analytics::{self, AnalyticsReport};
use crate::domain::store::LogWithContext;
use crate::error::Result;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

impl LimitQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }
}

pub async fn report(State(state): State<AppState>) -> Result<Json<AnalyticsReport>> {
    let report = analytics::report(state.store.as_ref()).await?;
    Ok(Json(report))
}

pub async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LogWithContext>>> {
    let logs = state.store.recent_logs(query.limit()).await?;
    Ok(Json(logs))
}

pub async fn recent_errors(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<LogWithContext>>> {
    let errors = state.store.recent_errors(query.limit()).await?;
    Ok(Json(errors))
}
