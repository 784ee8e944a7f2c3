// src/api/http/token_stats.rs
// GET /token-stats (spec.md §6): aggregate usage snapshot for an account.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TokenStatsQuery {
    account_id: String,
    #[serde(default = "default_window_minutes")]
    window_minutes: i64,
    #[serde(default = "default_days")]
    days: i64,
}

fn default_window_minutes() -> i64 {
    300
}

fn default_days() -> i64 {
    7
}

pub async fn handle(State(state): State<AppState>, Query(query): Query<TokenStatsQuery>) -> AppResult<Json<Value>> {
    let current_window = state.usage.current_window(&query.account_id, query.window_minutes).await?;
    let daily = state.usage.daily_usage(&query.account_id, query.days).await?;

    Ok(Json(json!({
        "accountId": query.account_id,
        "currentWindow": current_window,
        "daily": daily,
    })))
}
