// src/api/http/mod.rs
// Router assembly (spec.md §6): wires every handler onto its route and
// attaches the cross-cutting tower layers.

pub mod analysis;
pub mod health;
pub mod messages;
pub mod token_stats;

use std::time::Duration;

use axum::error_handling::HandleErrorLayer;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::state::AppState;

/// Resolve the logical domain a request targets from its `Host` header,
/// stripping a trailing port. Every credential, rate limit, and client-auth
/// lookup is keyed by this value (spec.md §4.4, §4.8, §6).
pub(crate) fn domain_from_host(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
        .ok_or_else(|| AppError::Validation("missing Host header".to_string()))
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::GATEWAY_TIMEOUT, "request deadline exceeded".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    }
}

/// Overall server-side request deadline (spec.md §4.5 Timeouts, §5
/// Cancellation and timeouts): the teacher's router wraps its whole stack
/// in a `TimeoutLayer`; here it enforces `PROXY_SERVER_TIMEOUT` across
/// every route, not just `/v1/messages`, since the pipeline and the
/// analysis API share the same overall-deadline contract.
pub fn router(state: AppState) -> Router {
    let server_timeout = Duration::from_millis(state.config.proxy.server_timeout_ms);

    Router::new()
        .route("/v1/messages", post(messages::handle))
        .route("/health", get(health::handle))
        .route("/metrics", get(crate::metrics::handle))
        .route("/token-stats", get(token_stats::handle))
        .route("/api/analyses", post(analysis::create))
        .route(
            "/api/analyses/{conversation_id}/{branch_id}",
            get(analysis::get),
        )
        .route(
            "/api/analyses/{conversation_id}/{branch_id}/regenerate",
            post(analysis::regenerate),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(server_timeout)),
        )
        .with_state(state)
}
