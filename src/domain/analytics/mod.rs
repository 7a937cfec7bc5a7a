//! Read-side analytics over the notifications table.

use serde::Serialize;
use std::collections::HashMap;

use crate::domain::store::{HourlyBucket, NotificationStore, StoreError};

/// 24-hour delivery rollup served by the analytics endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub total_24h: i64,
    /// sent / total * 100, zero when nothing was submitted
    pub success_rate: f64,
    pub by_channel: HashMap<String, i64>,
    pub by_status: HashMap<String, i64>,
    pub hourly: Vec<HourlyBucket>,
}

/// Build the report from the store's raw rollups.
pub async fn report(store: &dyn NotificationStore) -> Result<AnalyticsReport, StoreError> {
    let stats = store.stats_last_24h().await?;

    let sent = stats.by_status.get("sent").copied().unwrap_or(0);
    let success_rate = if stats.total > 0 {
        (sent as f64 / stats.total as f64) * 100.0
    } else {
        0.0
    };

    Ok(AnalyticsReport {
        total_24h: stats.total,
        success_rate,
        by_channel: stats.by_channel,
        by_status: stats.by_status,
        hourly: stats.hourly,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{
        Channel, LogStatus, NewLog, NewNotification, NotificationStatus, Priority,
    };
    use crate::domain::store::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_success_rate_over_24h_window() {
        let store = MemoryStore::new();

        for i in 0..4 {
            let n = store
                .create(NewNotification {
                    user_id: None,
                    channel: Channel::Email,
                    recipient: format!("u{}@example.com", i),
                    subject: None,
                    content: "hi".to_string(),
                    priority: Priority::Normal,
                    max_retries: 3,
                    scheduled_at: Utc::now(),
                })
                .await
                .unwrap();
            let status = if i < 3 {
                NotificationStatus::Sent
            } else {
                NotificationStatus::Failed
            };
            store
                .update_status(n.id, status, None, NewLog::new(n.id, LogStatus::Delivered, "x"))
                .await
                .unwrap();
        }

        let report = report(&store).await.unwrap();
        assert_eq!(report.total_24h, 4);
        assert!((report.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(report.by_channel.get("email"), Some(&4));
    }

    #[tokio::test]
    async fn test_empty_window_has_zero_rate() {
        let store = MemoryStore::new();
        let report = report(&store).await.unwrap();
        assert_eq!(report.total_24h, 0);
        assert_eq!(report.success_rate, 0.0);
    }
}
