// src/config/analysis.rs
// Background AI Analysis Worker configuration

use serde::{Deserialize, Serialize};

use super::helpers::{env_bool, env_or, env_u64, env_usize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisWorkerConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    pub job_timeout_minutes: u64,
    pub max_retries: u32,
    pub request_timeout_ms: u64,
    pub max_prompt_tokens: usize,
    pub head_messages: usize,
    pub tail_messages: usize,
    /// Base URL of the external analysis model API.
    pub model_base_url: String,
    /// Bearer token the analysis worker presents to the model API, if any.
    pub model_api_key: Option<String>,
    /// Bearer token clients must present to the `/api/analyses` surface.
    /// Absence puts the analysis API in read-only mode.
    pub dashboard_api_key: Option<String>,
}

impl AnalysisWorkerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("AI_WORKER_ENABLED", true),
            poll_interval_ms: env_u64("AI_WORKER_POLL_INTERVAL_MS", 5_000),
            max_concurrent_jobs: env_usize("AI_WORKER_MAX_CONCURRENT_JOBS", 3),
            job_timeout_minutes: env_u64("AI_WORKER_JOB_TIMEOUT_MINUTES", 5),
            max_retries: env_usize("AI_ANALYSIS_MAX_RETRIES", 3) as u32,
            request_timeout_ms: env_u64("AI_ANALYSIS_GEMINI_REQUEST_TIMEOUT_MS", 60_000),
            max_prompt_tokens: env_usize("AI_MAX_PROMPT_TOKENS", 855_000),
            head_messages: env_usize("AI_HEAD_MESSAGES", 5),
            tail_messages: env_usize("AI_TAIL_MESSAGES", 20),
            model_base_url: env_or(
                "AI_ANALYSIS_MODEL_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            ),
            model_api_key: std::env::var("AI_ANALYSIS_MODEL_API_KEY").ok(),
            dashboard_api_key: std::env::var("DASHBOARD_API_KEY").ok(),
        }
    }

    pub fn read_only(&self) -> bool {
        self.dashboard_api_key.is_none()
    }
}
