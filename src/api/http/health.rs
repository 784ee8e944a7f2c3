// src/api/http/health.rs
// GET /health (spec.md §6): liveness probe, 200 with minimal JSON when the
// pool is reachable.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn handle(State(state): State<AppState>) -> Response {
    match sqlx::query("SELECT 1").fetch_one(state.storage.writer().pool()).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": e.to_string() })),
        )
            .into_response(),
    }
}
