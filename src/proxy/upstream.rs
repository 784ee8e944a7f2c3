// src/proxy/upstream.rs
// HTTP client to the upstream LLM API (spec.md §4.5, §6). Wraps both the
// non-streaming and streaming call shapes and the usage-block extraction
// both paths need.
//
// Grounded on the teacher's `reqwest`-based provider clients in
// `llm/provider.rs`: a struct wrapping a `reqwest::Client` and a base URL,
// one method per call shape, `bytes_stream()` for the streaming path.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::config::proxy::ProxyConfig;
use crate::credentials::store::Credential;
use crate::error::AppError;
use crate::model::TokenUsage;

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
}

/// Outcome of a non-streaming upstream call.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Value,
    pub body: Value,
    pub usage: TokenUsage,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.upstream_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            base_url: config.upstream_base_url.clone(),
        })
    }

    fn request(&self, path: &str, credential: &Credential, body: &Value) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let (header_name, header_value) = credential.upstream_header();
        self.http
            .post(url)
            .header(header_name, header_value)
            .header("content-type", "application/json")
            .json(body)
    }

    /// Non-streaming call: wait for the full response, parse JSON, and
    /// extract the `usage` block (spec.md §4.5 step 6).
    pub async fn send(&self, path: &str, credential: &Credential, body: &Value) -> Result<UpstreamResponse, AppError> {
        let response = self
            .request(path, credential, body)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status().as_u16();
        let headers = headers_to_value(response.headers());
        let body: Value = response.json().await.map_err(|e| AppError::Upstream {
            status,
            message: format!("invalid upstream response body: {e}"),
        })?;

        if status >= 400 {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("upstream error")
                .to_string();
            return Err(AppError::Upstream { status, message });
        }

        let usage = extract_usage(&body);
        Ok(UpstreamResponse {
            status,
            headers,
            body,
            usage,
        })
    }

    /// Streaming call: returns the raw SSE byte stream for the pipeline to
    /// pipe to the client byte-for-byte while also appending to storage.
    pub async fn stream(
        &self,
        path: &str,
        credential: &Credential,
        body: &Value,
    ) -> Result<(u16, impl Stream<Item = reqwest::Result<Bytes>>), AppError> {
        let response = self
            .request(path, credential, body)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                status,
                message: text,
            });
        }

        Ok((status, response.bytes_stream()))
    }
}

fn map_reqwest_err(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout
    } else {
        AppError::Upstream {
            status: 502,
            message: e.to_string(),
        }
    }
}

fn headers_to_value(headers: &reqwest::header::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(map)
}

/// Extract the `{input_tokens, output_tokens, cache_creation_input_tokens,
/// cache_read_input_tokens}` block from a non-streaming response body.
pub fn extract_usage(body: &Value) -> TokenUsage {
    let usage = body.get("usage");
    TokenUsage {
        input_tokens: field_i64(usage, "input_tokens"),
        output_tokens: field_i64(usage, "output_tokens"),
        cache_creation_input_tokens: field_i64(usage, "cache_creation_input_tokens"),
        cache_read_input_tokens: field_i64(usage, "cache_read_input_tokens"),
    }
}

fn field_i64(usage: Option<&Value>, field: &str) -> i64 {
    usage
        .and_then(|u| u.get(field))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
}

/// Parse an SSE stream's buffered text for `message_delta`/`message_stop`
/// events and derive the terminal usage block (spec.md §4.5 step 6,
/// streaming path).
pub fn extract_streaming_usage(sse_text: &str) -> TokenUsage {
    let mut usage = TokenUsage::default();
    for line in sse_text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if event_type == "message_delta" || event_type == "message_stop" {
            if let Some(u) = event.get("usage") {
                if let Some(v) = u.get("output_tokens").and_then(|v| v.as_i64()) {
                    usage.output_tokens = v;
                }
                if let Some(v) = u.get("input_tokens").and_then(|v| v.as_i64()) {
                    usage.input_tokens = v;
                }
                if let Some(v) = u.get("cache_creation_input_tokens").and_then(|v| v.as_i64()) {
                    usage.cache_creation_input_tokens = v;
                }
                if let Some(v) = u.get("cache_read_input_tokens").and_then(|v| v.as_i64()) {
                    usage.cache_read_input_tokens = v;
                }
            }
        }
        if event_type == "message_start" {
            if let Some(v) = event
                .get("message")
                .and_then(|m| m.get("usage"))
                .and_then(|u| u.get("input_tokens"))
                .and_then(|v| v.as_i64())
            {
                usage.input_tokens = v;
            }
        }
    }
    usage
}

/// Whether the given chunk is the first content-bearing SSE event, used to
/// mark first-token latency.
pub fn chunk_contains_content(chunk: &str) -> bool {
    chunk.contains("\"type\":\"content_block_delta\"") || chunk.contains("\"type\": \"content_block_delta\"")
}

/// Replay a buffered streaming response's `content_block_start` /
/// `content_block_delta` / `content_block_stop` events into the same
/// `{"content": [...]}` shape a non-streaming response body would have, so
/// Task-invocation scanning (spec.md §4.3) and `tool_call_count` work
/// identically regardless of which path served the request.
pub fn assemble_response_body(sse_text: &str) -> Value {
    let mut content: Vec<Value> = Vec::new();
    let mut text_acc: HashMap<usize, String> = HashMap::new();
    let mut partial_json_acc: HashMap<usize, String> = HashMap::new();

    for line in sse_text.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("content_block_start") => {
                let Some(idx) = event.get("index").and_then(|i| i.as_u64()) else {
                    continue;
                };
                let idx = idx as usize;
                let block = event.get("content_block").cloned().unwrap_or(Value::Null);
                while content.len() <= idx {
                    content.push(Value::Null);
                }
                content[idx] = block;
            }
            Some("content_block_delta") => {
                let Some(idx) = event.get("index").and_then(|i| i.as_u64()) else {
                    continue;
                };
                let idx = idx as usize;
                let Some(delta) = event.get("delta") else { continue };
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                            text_acc.entry(idx).or_default().push_str(text);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(|t| t.as_str()) {
                            partial_json_acc.entry(idx).or_default().push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            Some("content_block_stop") => {
                let Some(idx) = event.get("index").and_then(|i| i.as_u64()) else {
                    continue;
                };
                let idx = idx as usize;
                if idx >= content.len() {
                    continue;
                }
                if let Some(obj) = content[idx].as_object_mut() {
                    if let Some(text) = text_acc.remove(&idx) {
                        obj.insert("text".to_string(), Value::String(text));
                    }
                    if let Some(raw) = partial_json_acc.remove(&idx) {
                        let input = serde_json::from_str(&raw).unwrap_or(Value::Object(Default::default()));
                        obj.insert("input".to_string(), input);
                    }
                }
            }
            _ => {}
        }
    }

    serde_json::json!({ "content": content })
}

#[allow(dead_code)]
fn _assert_stream_is_send<S: Stream + Send>(_s: S) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_non_streaming_body() {
        let body = serde_json::json!({
            "usage": {
                "input_tokens": 10,
                "output_tokens": 20,
                "cache_creation_input_tokens": 1,
                "cache_read_input_tokens": 2
            }
        });
        let usage = extract_usage(&body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.total(), 33);
    }

    #[test]
    fn extracts_usage_from_streaming_events() {
        let sse = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\nevent: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\n";
        let usage = extract_streaming_usage(sse);
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 42);
    }

    #[test]
    fn detects_content_chunk() {
        assert!(chunk_contains_content("data: {\"type\":\"content_block_delta\"}"));
        assert!(!chunk_contains_content("data: {\"type\":\"ping\"}"));
    }

    #[test]
    fn assembles_text_block_from_deltas() {
        let sse = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"hel\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        );
        let body = assemble_response_body(sse);
        assert_eq!(body["content"][0]["type"], "text");
        assert_eq!(body["content"][0]["text"], "hello");
    }

    #[test]
    fn assembles_tool_use_block_from_partial_json() {
        let sse = concat!(
            "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"t1\",\"name\":\"Task\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"prompt\\\"\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\":\\\"hi\\\"}\"}}\n\n",
            "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        );
        let body = assemble_response_body(sse);
        assert_eq!(body["content"][0]["name"], "Task");
        assert_eq!(body["content"][0]["input"]["prompt"], "hi");
    }
}
