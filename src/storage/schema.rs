// src/storage/schema.rs
// Schema bootstrap. Grounded on the teacher's inline
// `CREATE TABLE IF NOT EXISTS` pattern (e.g. `checkpoint/mod.rs`) rather
// than a separate migrations crate, since the teacher never carried one
// either.

use sqlx::SqlitePool;

pub async fn init_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_requests (
            request_id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            account_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            request_headers TEXT NOT NULL DEFAULT '{}',
            request_body TEXT NOT NULL,
            model TEXT,
            classification TEXT NOT NULL,
            response_status INTEGER,
            response_headers TEXT,
            response_body TEXT,
            is_streaming INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_input_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_input_tokens INTEGER NOT NULL DEFAULT 0,
            tool_call_count INTEGER NOT NULL DEFAULT 0,
            first_token_latency_ms INTEGER,
            duration_ms INTEGER,
            error_text TEXT,
            conversation_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            parent_request_id TEXT,
            current_message_hash TEXT NOT NULL,
            parent_message_hash TEXT,
            system_hash TEXT,
            is_subtask INTEGER NOT NULL DEFAULT 0,
            parent_task_request_id TEXT,
            task_tool_invocation TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_api_requests_domain ON api_requests(domain);
        CREATE INDEX IF NOT EXISTS idx_api_requests_timestamp ON api_requests(timestamp);
        CREATE INDEX IF NOT EXISTS idx_api_requests_account_timestamp ON api_requests(account_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_api_requests_conversation_timestamp ON api_requests(conversation_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_api_requests_current_hash ON api_requests(current_message_hash);
        CREATE INDEX IF NOT EXISTS idx_api_requests_parent_hash ON api_requests(parent_message_hash);
        CREATE INDEX IF NOT EXISTS idx_api_requests_is_subtask ON api_requests(is_subtask);

        CREATE TABLE IF NOT EXISTS streaming_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            chunk TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_streaming_chunks_request ON streaming_chunks(request_id, sequence);

        CREATE TABLE IF NOT EXISTS analysis_jobs (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            custom_prompt TEXT,
            analysis_result TEXT,
            model_used TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            error_text TEXT,
            processing_started_at TEXT,
            completed_at TEXT,
            duration_ms INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(conversation_id, branch_id)
        );
        CREATE INDEX IF NOT EXISTS idx_analysis_jobs_status ON analysis_jobs(status);

        CREATE TABLE IF NOT EXISTS rate_limit_summary (
            account_id TEXT NOT NULL,
            limit_type TEXT NOT NULL,
            total_hits INTEGER NOT NULL DEFAULT 0,
            first_hit_at TEXT NOT NULL,
            last_hit_at TEXT NOT NULL,
            retry_until TEXT,
            PRIMARY KEY (account_id, limit_type)
        );
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
