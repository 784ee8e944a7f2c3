// src/usage/mod.rs
// Token Usage Tracker (spec.md §4.6): rolling-window and daily token
// aggregates, plus rate-limit event ingestion.
//
// Grounded on the teacher's `budget::BudgetTracker`: a struct wrapping a
// `SqlitePool`, `get_usage_since`/day-and-month boundary helpers, aggregate
// queries via `sqlx::query` + `Row::get`. Generalized here from USD cost
// aggregation to token aggregation, since all of it is derived from the
// persisted `api_requests` rows rather than a dedicated counters table
// (spec.md §4.6 "Derivation").

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Usage {
    pub total_requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl Usage {
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyUsage {
    pub day: String,
    pub usage: Usage,
}

/// Upstream rate-limit kind, parsed from the error text (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitType {
    TokensPerMinute,
    RequestsPerMinute,
    TokensPerDay,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSummary {
    pub account_id: String,
    pub limit_type: RateLimitType,
    pub total_hits: i64,
    pub first_hit_at: DateTime<Utc>,
    pub last_hit_at: DateTime<Utc>,
    pub retry_until: Option<DateTime<Utc>>,
}

pub struct TokenUsageTracker {
    db: SqlitePool,
}

impl TokenUsageTracker {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Record that a request's token usage has been persisted. The request
    /// row itself carries the counters (Storage Writer's job); this call
    /// exists to keep a stable entry point per the tracker contract and to
    /// emit the usage metrics series.
    pub fn record(
        &self,
        account_id: &str,
        domain: &str,
        model: &str,
        input_tokens: i64,
        output_tokens: i64,
        cache_creation_tokens: i64,
        cache_read_tokens: i64,
    ) {
        metrics::counter!("threadwire_tokens_input_total", "domain" => domain.to_string(), "model" => model.to_string())
            .increment(input_tokens.max(0) as u64);
        metrics::counter!("threadwire_tokens_output_total", "domain" => domain.to_string(), "model" => model.to_string())
            .increment(output_tokens.max(0) as u64);
        debug!(
            account_id,
            domain, model, input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens,
            "token usage recorded"
        );
    }

    /// Sum of token counters over the trailing `window_minutes` (default
    /// 300 = 5 hours) ending now.
    pub async fn current_window(&self, account_id: &str, window_minutes: i64) -> anyhow::Result<Usage> {
        let since = Utc::now() - Duration::minutes(window_minutes);
        self.usage_since(account_id, since).await
    }

    /// Per-day aggregates over the trailing `days` days.
    pub async fn daily_usage(&self, account_id: &str, days: i64) -> anyhow::Result<Vec<DailyUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                date(timestamp) as day,
                COUNT(*) as total_requests,
                COALESCE(SUM(input_tokens), 0) as input_tokens,
                COALESCE(SUM(output_tokens), 0) as output_tokens,
                COALESCE(SUM(cache_creation_input_tokens), 0) as cache_creation_tokens,
                COALESCE(SUM(cache_read_input_tokens), 0) as cache_read_tokens
            FROM api_requests
            WHERE account_id = ? AND timestamp >= datetime('now', ? || ' days')
            GROUP BY day
            ORDER BY day DESC
            "#,
        )
        .bind(account_id)
        .bind(format!("-{days}"))
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DailyUsage {
                day: row.get("day"),
                usage: Usage {
                    total_requests: row.get("total_requests"),
                    input_tokens: row.get("input_tokens"),
                    output_tokens: row.get("output_tokens"),
                    cache_creation_tokens: row.get("cache_creation_tokens"),
                    cache_read_tokens: row.get("cache_read_tokens"),
                },
            })
            .collect())
    }

    async fn usage_since(&self, account_id: &str, since: DateTime<Utc>) -> anyhow::Result<Usage> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as total_requests,
                COALESCE(SUM(input_tokens), 0) as input_tokens,
                COALESCE(SUM(output_tokens), 0) as output_tokens,
                COALESCE(SUM(cache_creation_input_tokens), 0) as cache_creation_tokens,
                COALESCE(SUM(cache_read_input_tokens), 0) as cache_read_tokens
            FROM api_requests
            WHERE account_id = ? AND timestamp >= ?
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_one(&self.db)
        .await?;

        Ok(Usage {
            total_requests: row.get("total_requests"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            cache_creation_tokens: row.get("cache_creation_tokens"),
            cache_read_tokens: row.get("cache_read_tokens"),
        })
    }

    /// Ingest an upstream rate-limit error observed by the Proxy Pipeline,
    /// bumping the per-account summary's `total_hits`.
    pub async fn ingest_rate_limit_event(
        &self,
        account_id: &str,
        limit_type: RateLimitType,
        retry_until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        let limit_type_str = rate_limit_type_str(limit_type);
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO rate_limit_summary (account_id, limit_type, total_hits, first_hit_at, last_hit_at, retry_until)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(account_id, limit_type) DO UPDATE SET
                total_hits = total_hits + 1,
                last_hit_at = excluded.last_hit_at,
                retry_until = excluded.retry_until
            "#,
        )
        .bind(account_id)
        .bind(limit_type_str)
        .bind(now)
        .bind(now)
        .bind(retry_until)
        .execute(&self.db)
        .await?;

        metrics::counter!(
            "threadwire_rate_limit_hits_total",
            "account_id" => account_id.to_string(),
            "limit_type" => limit_type_str.to_string()
        )
        .increment(1);

        Ok(())
    }
}

fn rate_limit_type_str(t: RateLimitType) -> &'static str {
    match t {
        RateLimitType::TokensPerMinute => "tokens_per_minute",
        RateLimitType::RequestsPerMinute => "requests_per_minute",
        RateLimitType::TokensPerDay => "tokens_per_day",
        RateLimitType::Unknown => "unknown",
    }
}

/// Parse an upstream rate-limit error body/text into a limit type and,
/// where present, the timestamp after which retrying is expected to
/// succeed.
pub fn parse_rate_limit_error(text: &str) -> (RateLimitType, Option<DateTime<Utc>>) {
    let lower = text.to_lowercase();
    let limit_type = if lower.contains("tokens per day") || lower.contains("tokens_per_day") {
        RateLimitType::TokensPerDay
    } else if lower.contains("token") {
        RateLimitType::TokensPerMinute
    } else if lower.contains("request") {
        RateLimitType::RequestsPerMinute
    } else {
        RateLimitType::Unknown
    };

    let retry_until = extract_retry_after_seconds(&lower)
        .map(|secs| Utc::now() + Duration::seconds(secs));

    (limit_type, retry_until)
}

fn extract_retry_after_seconds(lower: &str) -> Option<i64> {
    let marker = "retry after ";
    let idx = lower.find(marker)? + marker.len();
    let digits: String = lower[idx..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_token_rate_limit() {
        let (limit_type, _) = parse_rate_limit_error("Number of tokens per minute exceeded");
        assert_eq!(limit_type, RateLimitType::TokensPerMinute);
    }

    #[test]
    fn classifies_daily_token_rate_limit() {
        let (limit_type, _) = parse_rate_limit_error("tokens per day limit exceeded");
        assert_eq!(limit_type, RateLimitType::TokensPerDay);
    }

    #[test]
    fn classifies_request_rate_limit() {
        let (limit_type, _) = parse_rate_limit_error("too many requests, slow down");
        assert_eq!(limit_type, RateLimitType::RequestsPerMinute);
    }

    #[test]
    fn unrecognized_text_is_unknown() {
        let (limit_type, _) = parse_rate_limit_error("something went wrong");
        assert_eq!(limit_type, RateLimitType::Unknown);
    }

    #[test]
    fn extracts_retry_after_seconds() {
        let (_, retry_until) = parse_rate_limit_error("rate limited, retry after 42 seconds");
        assert!(retry_until.is_some());
    }
}
