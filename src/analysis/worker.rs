// src/analysis/worker.rs
// Background AI Analysis Worker (spec.md §4.7): polls the job queue,
// truncates conversation history under a token budget, calls the external
// analysis model, validates structured output, and persists the result
// with retry/back-off.
//
// Grounded on the teacher's `tasks::TaskManager`: a struct holding
// `JoinHandle`s spawned from a polling loop built on `tokio::time::interval`,
// reporting through a small metrics struct.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::analysis::AnalysisWorkerConfig;
use crate::storage::StorageWriter;

use super::client::{AnalysisClientError, AnalysisModelClient};
use super::model::{validate_result, AnalysisResult, ConversationTurn, JobStatus};
use super::prompt::{build_prompt, strip_json_fence};
use super::store::AnalysisStore;
use super::truncate::truncate_to_budget;

/// Model identifier reported on completed jobs. The external analysis API
/// surface (spec.md §6) is otherwise model-agnostic; this is the only
/// model this worker is wired to call.
const ANALYSIS_MODEL: &str = "gemini-2.0-flash";

pub struct AnalysisWorker {
    config: AnalysisWorkerConfig,
    store: Arc<AnalysisStore>,
    writer: Arc<StorageWriter>,
    client: Arc<AnalysisModelClient>,
}

impl AnalysisWorker {
    pub fn new(
        config: AnalysisWorkerConfig,
        store: Arc<AnalysisStore>,
        writer: Arc<StorageWriter>,
    ) -> anyhow::Result<Self> {
        let client = Arc::new(AnalysisModelClient::new(&config)?);
        Ok(Self {
            config,
            store,
            writer,
            client,
        })
    }

    /// Spawn the polling loop (spec.md §4.7 Polling). Returns the handle so
    /// the caller can abort it on shutdown.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.enabled {
                info!("analysis worker disabled, not starting poll loop");
                return;
            }
            info!(
                poll_interval_ms = self.config.poll_interval_ms,
                max_concurrent = self.config.max_concurrent_jobs,
                "analysis worker started"
            );

            loop {
                match self.poll_once().await {
                    Ok(claimed) if claimed > 0 => {
                        debug!(claimed, "analysis worker processed a batch");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "analysis worker poll failed"),
                }
                tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            }
        })
    }

    async fn poll_once(&self) -> anyhow::Result<usize> {
        let jobs = self
            .store
            .claim_pending(
                self.config.max_concurrent_jobs as u32,
                chrono::Duration::minutes(self.config.job_timeout_minutes as i64),
            )
            .await?;

        if jobs.is_empty() {
            return Ok(0);
        }

        let claimed = jobs.len();
        let mut in_flight: FuturesUnordered<_> = jobs.into_iter().map(|job| self.process_job(job.id)).collect();
        while let Some(result) = in_flight.next().await {
            if let Err(e) = result {
                error!(error = %e, "analysis job processing failed unexpectedly");
            }
        }
        Ok(claimed)
    }

    async fn process_job(&self, job_id: Uuid) -> anyhow::Result<()> {
        let job = self
            .store
            .get_by_id(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("claimed job {job_id} vanished"))?;

        let started = std::time::Instant::now();
        let turns = self
            .load_conversation(job.conversation_id, &job.branch_id)
            .await?;
        let truncated = truncate_to_budget(
            turns,
            self.config.max_prompt_tokens,
            self.config.head_messages,
            self.config.tail_messages,
        );
        let prompt = build_prompt(&truncated, job.custom_prompt.as_deref());

        match self.client.generate(ANALYSIS_MODEL, &prompt).await {
            Ok(call) => match parse_and_validate(&call.text) {
                Ok(result) => {
                    let result_json = serde_json::to_value(&result)?;
                    let elapsed = started.elapsed();
                    self.store
                        .mark_completed(
                            job_id,
                            &result_json,
                            ANALYSIS_MODEL,
                            call.input_tokens,
                            call.output_tokens,
                            elapsed.as_millis() as i64,
                        )
                        .await?;
                    metrics::counter!("threadwire_analysis_jobs_total", "outcome" => "completed").increment(1);
                    metrics::histogram!("threadwire_analysis_job_duration_seconds").record(elapsed.as_secs_f64());
                    info!(%job_id, "analysis job completed");
                }
                Err(parse_err) => {
                    self.fail_or_retry(job_id, &parse_err).await?;
                }
            },
            Err(AnalysisClientError::Timeout) => {
                self.fail_or_retry(job_id, "request to analysis model timed out").await?;
            }
            Err(AnalysisClientError::Http(msg)) => {
                self.fail_or_retry(job_id, &msg).await?;
            }
        }
        Ok(())
    }

    async fn fail_or_retry(&self, job_id: Uuid, error_text: &str) -> anyhow::Result<()> {
        let status = self
            .store
            .record_failure(job_id, error_text, self.config.max_retries)
            .await?;
        match status {
            JobStatus::Failed => {
                metrics::counter!("threadwire_analysis_jobs_total", "outcome" => "failed").increment(1);
                warn!(%job_id, error = error_text, "analysis job failed permanently");
            }
            _ => {
                metrics::counter!("threadwire_analysis_jobs_total", "outcome" => "retrying").increment(1);
                debug!(%job_id, error = error_text, "analysis job will retry");
            }
        }
        Ok(())
    }

    /// Load `(conversation_id, branch_id)`'s messages in chronological
    /// order, merging request and response bodies into a single
    /// `[{role, content}]` sequence (spec.md §4.7 step 1).
    async fn load_conversation(&self, conversation_id: Uuid, branch_id: &str) -> anyhow::Result<Vec<ConversationTurn>> {
        let rows = self.writer.conversation_messages(conversation_id, branch_id).await?;
        let mut turns = Vec::new();

        for (request_body, response_body) in rows {
            if let Some(messages) = request_body.get("messages").and_then(|m| m.as_array()) {
                if turns.is_empty() {
                    // First row in the conversation: each client resends the
                    // full running history, so take it all.
                    for m in messages {
                        if let Some(turn) = value_to_turn(m) {
                            turns.push(turn);
                        }
                    }
                } else if let Some(last) = messages.last() {
                    // Later rows only contribute their newest message; the
                    // rest duplicates what earlier rows already emitted.
                    if let Some(turn) = value_to_turn(last) {
                        turns.push(turn);
                    }
                }
            }

            if let Some(response) = response_body {
                if let Some(text) = response_text(&response) {
                    turns.push(ConversationTurn {
                        role: "assistant".to_string(),
                        content: text,
                    });
                }
            }
        }

        Ok(turns)
    }
}

fn value_to_turn(message: &Value) -> Option<ConversationTurn> {
    let role = message.get("role")?.as_str()?.to_string();
    let content = match message.get("content")? {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };
    if content.is_empty() {
        return None;
    }
    Some(ConversationTurn { role, content })
}

fn response_text(response: &Value) -> Option<String> {
    let content = response.get("content")?.as_array()?;
    let text = content
        .iter()
        .filter_map(|b| {
            if b.get("type").and_then(|t| t.as_str()) == Some("text") {
                b.get("text").and_then(|t| t.as_str())
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Strip the JSON fence, parse, and validate against the declared schema
/// (spec.md §4.7 steps 5-6).
fn parse_and_validate(raw: &str) -> Result<AnalysisResult, String> {
    let stripped = strip_json_fence(raw);
    let result: AnalysisResult =
        serde_json::from_str(stripped).map_err(|e| format!("failed to parse model output as JSON: {e}"))?;
    validate_result(&result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_request_and_response_into_turns() {
        let body = serde_json::json!({"messages": [{"role": "user", "content": "hi"}]});
        let turn = value_to_turn(body.get("messages").unwrap().get(0).unwrap()).unwrap();
        assert_eq!(turn.role, "user");
        assert_eq!(turn.content, "hi");
    }

    #[test]
    fn extracts_response_text_blocks() {
        let response = serde_json::json!({"content": [{"type": "text", "text": "hello there"}]});
        assert_eq!(response_text(&response), Some("hello there".to_string()));
    }

    #[test]
    fn parse_and_validate_rejects_malformed_json() {
        assert!(parse_and_validate("not json").is_err());
    }
}
