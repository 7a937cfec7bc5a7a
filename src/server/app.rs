//! Axum application assembly.

use axum::Router;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::api_routes;

use super::AppState;

/// Maximum request body size (1 MB covers bulk fan-outs and attachments)
const MAX_BODY_SIZE: usize = 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    let cors = build_cors_layer(state.settings.server.frontend_url.as_deref());

    api_routes()
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// CORS restricted to the configured dashboard origin, open in development.
fn build_cors_layer(frontend_url: Option<&str>) -> CorsLayer {
    use tower_http::cors::AllowOrigin;

    match frontend_url.and_then(|url| url.parse().ok()) {
        Some(origin) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE]),
        None => {
            tracing::warn!(
                "CORS: FRONTEND_URL not configured, allowing any origin. Set it for production."
            );
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}
