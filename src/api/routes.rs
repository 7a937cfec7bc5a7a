//! Route table for the control plane.

use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::{analytics, channels, health, notifications, queue};

pub fn api_routes() -> Router<AppState> {
    let notification_routes = Router::new()
        .route("/notifications/send", post(notifications::send))
        .route("/notifications/{id}/status", get(notifications::status))
        .route("/notifications/{id}/retry", post(notifications::retry))
        .route(
            "/notifications/user/{user_id}",
            get(notifications::list_for_user),
        );

    let queue_routes = Router::new()
        .route("/queue/stats", get(queue::stats))
        .route("/queue/pause", post(queue::pause))
        .route("/queue/resume", post(queue::resume))
        .route("/queue/clear-failed", post(queue::clear_failed))
        .route("/queue/retry-failed", post(queue::retry_failed))
        .route("/queue/health", get(queue::health));

    let analytics_routes = Router::new()
        .route("/analytics", get(analytics::report))
        .route("/analytics/errors", get(analytics::recent_errors))
        .route("/analytics/logs", get(analytics::recent_logs));

    // Direct adapter endpoints bypass the queue entirely
    let channel_routes = Router::new()
        .route("/email/send", post(channels::send_email))
        .route("/sms/send", post(channels::send_sms))
        .route("/push/send-multicast", post(channels::push_multicast))
        .route("/push/send-topic", post(channels::push_topic))
        .route("/push/subscribe-topic", post(channels::subscribe_topic))
        .route("/push/unsubscribe-topic", post(channels::unsubscribe_topic))
        .route("/{channel}/verify", get(channels::verify));

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(health::prometheus_metrics))
        .nest(
            "/api",
            notification_routes
                .merge(queue_routes)
                .merge(analytics_routes)
                .merge(channel_routes),
        )
}
