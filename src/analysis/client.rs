// src/analysis/client.rs
// HTTP client to the external analysis model (spec.md §4.7 step 4).
//
// Grounded on `proxy::upstream::UpstreamClient`: a `reqwest::Client` plus a
// base URL and bearer token, one POST per call, a bounded timeout.

use std::time::Duration;

use serde_json::json;

use crate::config::analysis::AnalysisWorkerConfig;

pub struct AnalysisModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

pub struct ModelCallResult {
    pub text: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisClientError {
    #[error("request to analysis model timed out")]
    Timeout,
    #[error("analysis model returned an error: {0}")]
    Http(String),
}

impl AnalysisModelClient {
    pub fn new(config: &AnalysisWorkerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.model_base_url.clone(),
            api_key: config.model_api_key.clone(),
        })
    }

    /// POST `prompt` to the external model's generation endpoint, returning
    /// the raw text output and the token counts it reports.
    pub async fn generate(&self, model: &str, prompt: &str) -> Result<ModelCallResult, AnalysisClientError> {
        let url = format!(
            "{}/models/{model}:generateContent",
            self.base_url.trim_end_matches('/')
        );

        let mut request = self.http.post(&url).json(&json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "responseMimeType": "application/json" }
        }));
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AnalysisClientError::Timeout
            } else {
                AnalysisClientError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalysisClientError::Http(format!("invalid model response: {e}")))?;

        if !status.is_success() {
            return Err(AnalysisClientError::Http(format!(
                "model API returned {status}: {body}"
            )));
        }

        let text = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| AnalysisClientError::Http("missing candidate text in model response".into()))?
            .to_string();

        let usage = body.get("usageMetadata");
        let input_tokens = usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let output_tokens = usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);

        Ok(ModelCallResult {
            text,
            input_tokens,
            output_tokens,
        })
    }
}
