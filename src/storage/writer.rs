// src/storage/writer.rs
// Storage Writer (spec.md §4.3): direct, parameterized persistence of
// request/response/chunk/linkage data, plus the query helpers the
// Conversation Linker needs (parent lookup, compact search, max-subtask
// sequence, Task-invocation extraction).
//
// Grounded on the teacher's data-access style throughout `checkpoint/`,
// `project/tasks/service.rs`: a struct wrapping a `SqlitePool`, one method
// per statement, `sqlx::query`/`query_as` with positional binds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::linker::{LinkQueries, RequestSummary};
use crate::model::{RequestClassification, TaskToolInvocation, TokenUsage};

/// Everything known about a request at the moment it is first persisted
/// (step 5 of the Proxy Pipeline sequence, before the upstream call).
pub struct NewRequestRecord {
    pub request_id: Uuid,
    pub domain: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub request_headers: Value,
    pub request_body: Value,
    pub model: Option<String>,
    pub classification: RequestClassification,
    pub is_streaming: bool,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub parent_request_id: Option<Uuid>,
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<Uuid>,
}

/// The update applied once the upstream response is fully known (either at
/// the end of a non-streaming call, or after the terminal streaming event).
#[derive(Default)]
pub struct ResponseUpdate {
    pub status: u16,
    pub response_headers: Value,
    pub response_body: Option<Value>,
    pub usage: TokenUsage,
    pub tool_call_count: i64,
    pub first_token_latency_ms: Option<i64>,
    pub duration_ms: i64,
    pub error_text: Option<String>,
}

pub struct StorageWriter {
    pool: SqlitePool,
}

impl StorageWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_request(&self, record: &NewRequestRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_requests (
                request_id, domain, account_id, timestamp, method, path,
                request_headers, request_body, model, classification,
                is_streaming, conversation_id, branch_id, parent_request_id,
                current_message_hash, parent_message_hash, system_hash,
                is_subtask, parent_task_request_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.request_id.to_string())
        .bind(&record.domain)
        .bind(&record.account_id)
        .bind(record.timestamp)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.request_headers.to_string())
        .bind(record.request_body.to_string())
        .bind(&record.model)
        .bind(classification_str(record.classification))
        .bind(record.is_streaming)
        .bind(record.conversation_id.to_string())
        .bind(&record.branch_id)
        .bind(record.parent_request_id.map(|id| id.to_string()))
        .bind(&record.current_message_hash)
        .bind(&record.parent_message_hash)
        .bind(&record.system_hash)
        .bind(record.is_subtask)
        .bind(record.parent_task_request_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_response(&self, request_id: Uuid, update: &ResponseUpdate) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE api_requests SET
                response_status = ?,
                response_headers = ?,
                response_body = ?,
                input_tokens = ?,
                output_tokens = ?,
                cache_creation_input_tokens = ?,
                cache_read_input_tokens = ?,
                tool_call_count = ?,
                first_token_latency_ms = ?,
                duration_ms = ?,
                error_text = ?
            WHERE request_id = ?
            "#,
        )
        .bind(update.status as i64)
        .bind(update.response_headers.to_string())
        .bind(update.response_body.as_ref().map(|v| v.to_string()))
        .bind(update.usage.input_tokens)
        .bind(update.usage.output_tokens)
        .bind(update.usage.cache_creation_input_tokens)
        .bind(update.usage.cache_read_input_tokens)
        .bind(update.tool_call_count)
        .bind(update.first_token_latency_ms)
        .bind(update.duration_ms)
        .bind(&update.error_text)
        .bind(request_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_streaming_chunk(
        &self,
        request_id: Uuid,
        sequence: i64,
        chunk: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO streaming_chunks (request_id, sequence, chunk, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(request_id.to_string())
        .bind(sequence)
        .bind(chunk)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_task_tool_invocations(
        &self,
        request_id: Uuid,
        invocations: &[TaskToolInvocation],
    ) -> anyhow::Result<()> {
        if invocations.is_empty() {
            return Ok(());
        }
        let json = serde_json::to_string(invocations)?;
        sqlx::query("UPDATE api_requests SET task_tool_invocation = ? WHERE request_id = ?")
            .bind(json)
            .bind(request_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn request_exists(&self, request_id: Uuid) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM api_requests WHERE request_id = ?")
            .bind(request_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Messages for `(conversation_id, branch_id)` in chronological order,
    /// as `(request_body, response_body)` JSON pairs, consulted by the
    /// Analysis Worker.
    pub async fn conversation_messages(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
    ) -> anyhow::Result<Vec<(Value, Option<Value>)>> {
        let rows = sqlx::query(
            r#"
            SELECT request_body, response_body FROM api_requests
            WHERE conversation_id = ? AND branch_id = ?
            ORDER BY timestamp ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .bind(branch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let request_body: String = row.get("request_body");
                let response_body: Option<String> = row.get("response_body");
                (
                    serde_json::from_str(&request_body).unwrap_or(Value::Null),
                    response_body.and_then(|s| serde_json::from_str(&s).ok()),
                )
            })
            .collect())
    }
}

fn classification_str(c: RequestClassification) -> &'static str {
    match c {
        RequestClassification::Inference => "inference",
        RequestClassification::QueryEvaluation => "query_evaluation",
        RequestClassification::Quota => "quota",
    }
}

fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

fn row_to_summary(row: &sqlx::sqlite::SqliteRow) -> RequestSummary {
    RequestSummary {
        request_id: parse_uuid(&row.get::<String, _>("request_id")).unwrap_or_default(),
        conversation_id: parse_uuid(&row.get::<String, _>("conversation_id")).unwrap_or_default(),
        branch_id: row.get("branch_id"),
        system_hash: row.get("system_hash"),
        timestamp: row.get("timestamp"),
    }
}

#[async_trait]
impl LinkQueries for StorageWriter {
    async fn find_by_current_hash(
        &self,
        domain: &str,
        parent_hash: &str,
    ) -> anyhow::Result<Vec<RequestSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, conversation_id, branch_id, system_hash, timestamp
            FROM api_requests WHERE domain = ? AND current_message_hash = ?
            "#,
        )
        .bind(domain)
        .bind(parent_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_summary).collect())
    }

    async fn find_task_invocation_match(
        &self,
        domain: &str,
        prompt: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RequestSummary>> {
        let query_window_start = at - chrono::Duration::hours(24);
        let match_window_start = at - chrono::Duration::seconds(30);

        let rows = sqlx::query(
            r#"
            SELECT request_id, conversation_id, branch_id, system_hash, timestamp, task_tool_invocation
            FROM api_requests
            WHERE domain = ? AND task_tool_invocation IS NOT NULL
              AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp DESC
            "#,
        )
        .bind(domain)
        .bind(query_window_start)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let timestamp: DateTime<Utc> = row.get("timestamp");
            if timestamp < match_window_start {
                continue;
            }
            let raw: String = row.get("task_tool_invocation");
            let invocations: Vec<TaskToolInvocation> = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if invocations.iter().any(|inv| inv.prompt == prompt) {
                return Ok(Some(row_to_summary(&row)));
            }
        }
        Ok(None)
    }

    async fn find_compact_continuation(
        &self,
        domain: &str,
        summary_text: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RequestSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT request_id, conversation_id, branch_id, system_hash, timestamp, response_body
            FROM api_requests
            WHERE domain = ? AND timestamp < ? AND response_body IS NOT NULL
            ORDER BY timestamp DESC
            LIMIT 500
            "#,
        )
        .bind(domain)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let response_body: String = row.get("response_body");
            if response_body.contains(summary_text) {
                return Ok(Some(row_to_summary(&row)));
            }
        }
        Ok(None)
    }

    async fn parent_has_children(&self, parent_request_id: Uuid) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM api_requests WHERE parent_request_id = ? LIMIT 1")
            .bind(parent_request_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn max_branch_sequence(
        &self,
        conversation_id: Uuid,
        prefix: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<u32> {
        let rows = sqlx::query(
            "SELECT branch_id FROM api_requests WHERE conversation_id = ? AND branch_id LIKE ? AND timestamp < ?",
        )
        .bind(conversation_id.to_string())
        .bind(format!("{prefix}%"))
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let branch_id: String = row.get("branch_id");
                branch_id.strip_prefix(prefix)?.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0))
    }

    async fn branch_exists(&self, conversation_id: Uuid, branch_id: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM api_requests WHERE conversation_id = ? AND branch_id = ? LIMIT 1")
            .bind(conversation_id.to_string())
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}
