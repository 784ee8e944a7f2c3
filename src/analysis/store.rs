// src/analysis/store.rs
// Analysis job persistence and claim protocol (spec.md §4.7 Claim
// protocol): row-level locking within a single transaction so concurrent
// worker processes never claim the same row.
//
// Grounded on the teacher's `checkpoint`/`project/tasks` data-access style:
// a struct wrapping a `SqlitePool`, one method per statement.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::model::{AnalysisJob, JobStatus};

pub struct AnalysisStore {
    pool: SqlitePool,
}

/// Returned by `create` when a row already exists for the
/// `(conversation_id, branch_id)` pair (spec.md §6 `POST /api/analyses`
/// "409 if an analysis already exists").
pub enum CreateOutcome {
    Created(AnalysisJob),
    AlreadyExists(AnalysisJob),
}

impl AnalysisStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
        custom_prompt: Option<String>,
    ) -> anyhow::Result<CreateOutcome> {
        if let Some(existing) = self.get(conversation_id, branch_id).await? {
            return Ok(CreateOutcome::AlreadyExists(existing));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let inserted = sqlx::query(
            r#"
            INSERT INTO analysis_jobs (
                id, conversation_id, branch_id, status, attempts, custom_prompt,
                created_at, updated_at
            ) VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(conversation_id, branch_id) DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(conversation_id.to_string())
        .bind(branch_id)
        .bind(&custom_prompt)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost the race against a concurrent creator.
            let existing = self
                .get(conversation_id, branch_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("analysis job vanished after insert race"))?;
            return Ok(CreateOutcome::AlreadyExists(existing));
        }

        Ok(CreateOutcome::Created(
            self.get(conversation_id, branch_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("analysis job missing immediately after insert"))?,
        ))
    }

    pub async fn get(&self, conversation_id: Uuid, branch_id: &str) -> anyhow::Result<Option<AnalysisJob>> {
        let row = sqlx::query("SELECT * FROM analysis_jobs WHERE conversation_id = ? AND branch_id = ?")
            .bind(conversation_id.to_string())
            .bind(branch_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_job))
    }

    pub async fn get_by_id(&self, id: Uuid) -> anyhow::Result<Option<AnalysisJob>> {
        let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_job))
    }

    /// Reset an existing job to `pending` with `attempts = 0` (spec.md §4.7
    /// "regenerate"). No-op semantics are the caller's responsibility: this
    /// assumes the row exists.
    pub async fn regenerate(
        &self,
        conversation_id: Uuid,
        branch_id: &str,
        custom_prompt: Option<String>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE analysis_jobs SET
                status = 'pending', attempts = 0, error_text = NULL,
                analysis_result = NULL, custom_prompt = ?, updated_at = ?
            WHERE conversation_id = ? AND branch_id = ?
            "#,
        )
        .bind(&custom_prompt)
        .bind(Utc::now())
        .bind(conversation_id.to_string())
        .bind(branch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Claim up to `n` pending rows, transitioning them to `processing`
    /// within a single transaction. Also reclaims rows stuck in
    /// `processing` past `stuck_timeout`.
    pub async fn claim_pending(&self, n: u32, stuck_timeout: chrono::Duration) -> anyhow::Result<Vec<AnalysisJob>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let stuck_cutoff = now - stuck_timeout;

        sqlx::query(
            "UPDATE analysis_jobs SET status = 'pending' WHERE status = 'processing' AND processing_started_at < ?",
        )
        .bind(stuck_cutoff)
        .execute(&mut *tx)
        .await?;

        let candidates: Vec<String> = sqlx::query(
            "SELECT id FROM analysis_jobs WHERE status = 'pending' ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("id"))
        .collect();

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        for id in &candidates {
            sqlx::query(
                "UPDATE analysis_jobs SET status = 'processing', processing_started_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        let mut jobs = Vec::with_capacity(candidates.len());
        for id in &candidates {
            let row = sqlx::query("SELECT * FROM analysis_jobs WHERE id = ?")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            jobs.push(row_to_job(&row));
        }

        tx.commit().await?;
        Ok(jobs)
    }

    pub async fn mark_completed(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        model_used: &str,
        input_tokens: i64,
        output_tokens: i64,
        duration_ms: i64,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE analysis_jobs SET
                status = 'completed', analysis_result = ?, model_used = ?,
                input_tokens = ?, output_tokens = ?, completed_at = ?,
                duration_ms = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result.to_string())
        .bind(model_used)
        .bind(input_tokens)
        .bind(output_tokens)
        .bind(now)
        .bind(duration_ms)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. Transitions to `pending` (for a later
    /// retry) unless `attempts` has reached `max_retries`, in which case the
    /// job is marked `failed` with the error stored verbatim (spec.md §4.7
    /// step 4 / §7 propagation policy).
    pub async fn record_failure(&self, id: Uuid, error_text: &str, max_retries: u32) -> anyhow::Result<JobStatus> {
        let row = sqlx::query("SELECT attempts FROM analysis_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        let attempts: i64 = row.get("attempts");
        let attempts = attempts as u32 + 1;

        let status = if attempts >= max_retries {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };

        sqlx::query(
            "UPDATE analysis_jobs SET status = ?, attempts = ?, error_text = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(error_text)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(status)
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> AnalysisJob {
    let status: String = row.get("status");
    let analysis_result: Option<String> = row.get("analysis_result");
    AnalysisJob {
        id: Uuid::parse_str(&row.get::<String, _>("id")).unwrap_or_default(),
        conversation_id: Uuid::parse_str(&row.get::<String, _>("conversation_id")).unwrap_or_default(),
        branch_id: row.get("branch_id"),
        status: JobStatus::parse(&status),
        attempts: row.get::<i64, _>("attempts") as u32,
        custom_prompt: row.get("custom_prompt"),
        analysis_result: analysis_result.and_then(|s| serde_json::from_str(&s).ok()),
        model_used: row.get("model_used"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        error_text: row.get("error_text"),
        processing_started_at: row.get::<Option<DateTime<Utc>>, _>("processing_started_at"),
        completed_at: row.get::<Option<DateTime<Utc>>, _>("completed_at"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
