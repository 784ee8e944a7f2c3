// src/api/http/messages.rs
// POST /v1/messages (spec.md §4.5): the Streaming Proxy Pipeline entry
// point. Validates and persists the request, forwards it to the upstream
// LLM API, persists the response, and runs a handful of post-response tasks
// without blocking the client.

use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use bytes::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use super::domain_from_host;
use crate::credentials::{Credential, CredentialError};
use crate::error::AppError;
use crate::model::{classify_request, count_tool_use_blocks, SystemPrompt};
use crate::proxy::upstream::assemble_response_body;
use crate::proxy::validation::{validate_body_bytes, validate_parsed, MessagesRequest};
use crate::state::AppState;
use crate::storage::writer::ResponseUpdate;

const UPSTREAM_PATH: &str = "/v1/messages";

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let short_id = state.storage.new_short_id(request_id);
    let timestamp = Utc::now();
    let request_start = Instant::now();

    let domain = domain_from_host(&headers)?;

    if state.config.credentials.client_auth_enabled {
        let expected = state
            .credentials
            .client_api_key(&domain)
            .await
            .map_err(AppError::Internal)?;
        crate::auth::authenticate(&headers, expected.as_deref())?;
    }

    validate_body_bytes(&body, &state.config.proxy)?;

    let parsed: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::Validation(format!("invalid JSON body: {e}")))?;
    let req: MessagesRequest = serde_json::from_value(parsed.clone())
        .map_err(|e| AppError::Validation(format!("request does not match expected shape: {e}")))?;
    validate_parsed(&req, &state.config.proxy)?;

    let credential = state
        .credentials
        .get_credential(&domain)
        .await
        .map_err(map_credential_err)?;

    let system_prompt_count = system_prompt_count(req.system.as_ref());
    let classification = classify_request(&req.messages, system_prompt_count);

    state
        .storage
        .store_request(
            &short_id,
            &domain,
            credential.account_id(),
            timestamp,
            "POST",
            UPSTREAM_PATH,
            headers_to_value(&headers),
            parsed.clone(),
            req.model.clone(),
            req.stream,
            &req.messages,
            req.system.as_ref(),
            classification,
        )
        .await
        .map_err(AppError::Internal)?;

    if req.stream {
        handle_streaming(state, short_id, domain, credential, req.model, parsed, request_start).await
    } else {
        handle_non_streaming(state, short_id, domain, credential, req.model, parsed, request_start).await
    }
}

/// Normalization rule 5 derives a single concatenated text; classification
/// needs the count of distinct segments supplied, before concatenation.
fn system_prompt_count(system: Option<&SystemPrompt>) -> usize {
    match system {
        None => 0,
        Some(SystemPrompt::Text(text)) => {
            if text.is_empty() {
                0
            } else {
                1
            }
        }
        Some(SystemPrompt::Blocks(blocks)) => blocks.len(),
    }
}

fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            map.insert(name.as_str().to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(map)
}

fn map_credential_err(e: CredentialError) -> AppError {
    match e {
        CredentialError::NotFound(domain) => {
            AppError::Configuration(format!("no credential configured for domain {domain}"))
        }
        CredentialError::ReauthRequired(msg) => {
            AppError::Configuration(format!("credential requires re-authentication: {msg}"))
        }
        CredentialError::Transient(msg) => AppError::Upstream { status: 502, message: msg },
        CredentialError::Other(e) => AppError::Internal(e),
    }
}

async fn handle_non_streaming(
    state: AppState,
    short_id: String,
    domain: String,
    credential: Credential,
    model: Option<String>,
    body: Value,
    request_start: Instant,
) -> Result<Response, AppError> {
    let upstream_result = state.upstream.send(UPSTREAM_PATH, &credential, &body).await;

    let response = match upstream_result {
        Ok(response) => response,
        Err(AppError::Upstream { status, message }) => {
            metrics::counter!("threadwire_upstream_errors_total", "domain" => domain.clone(), "status" => status.to_string())
                .increment(1);
            if status == 429 {
                let (limit_type, retry_until) = crate::usage::parse_rate_limit_error(&message);
                if let Err(e) = state
                    .usage
                    .ingest_rate_limit_event(credential.account_id(), limit_type, retry_until)
                    .await
                {
                    warn!(error = %e, "failed to ingest rate limit event");
                }
            }
            let update = ResponseUpdate {
                status,
                error_text: Some(message.clone()),
                duration_ms: request_start.elapsed().as_millis() as i64,
                ..Default::default()
            };
            if let Err(e) = state.storage.store_response(&short_id, update).await {
                warn!(error = %e, "failed to persist upstream error response");
            }
            return Err(AppError::Upstream { status, message });
        }
        Err(e) => return Err(e),
    };

    let duration_ms = request_start.elapsed().as_millis() as i64;
    let tool_call_count = count_tool_use_blocks(&response.body);
    metrics::counter!("threadwire_requests_total", "domain" => domain.clone(), "classification" => "non_streaming")
        .increment(1);
    metrics::histogram!("threadwire_request_duration_seconds", "domain" => domain.clone())
        .record(duration_ms as f64 / 1000.0);

    let update = ResponseUpdate {
        status: response.status,
        response_headers: response.headers.clone(),
        response_body: Some(response.body.clone()),
        usage: response.usage,
        tool_call_count,
        first_token_latency_ms: None,
        duration_ms,
        error_text: None,
    };
    state
        .storage
        .store_response(&short_id, update)
        .await
        .map_err(AppError::Internal)?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let body_json = response.body.clone();

    spawn_post_response_tasks(state, short_id, domain, credential, model, response.body, response.usage);

    Ok((status, axum::Json(body_json)).into_response())
}

async fn handle_streaming(
    state: AppState,
    short_id: String,
    domain: String,
    credential: Credential,
    model: Option<String>,
    body: Value,
    request_start: Instant,
) -> Result<Response, AppError> {
    let (status, upstream_stream) = match state.upstream.stream(UPSTREAM_PATH, &credential, &body).await {
        Ok(v) => v,
        Err(AppError::Upstream { status, message }) => {
            metrics::counter!("threadwire_upstream_errors_total", "domain" => domain.clone(), "status" => status.to_string())
                .increment(1);
            return Err(AppError::Upstream { status, message });
        }
        Err(e) => return Err(e),
    };

    let (client_tx, client_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let (storage_tx, mut storage_rx) = mpsc::channel::<(i64, String)>(256);

    let persist_state = state.clone();
    let persist_short_id = short_id.clone();
    tokio::spawn(async move {
        while let Some((sequence, chunk)) = storage_rx.recv().await {
            if let Err(e) = persist_state.storage.store_streaming_chunk(&persist_short_id, sequence, &chunk).await {
                warn!(error = %e, "failed to persist streaming chunk");
            }
        }
    });

    tokio::spawn(async move {
        let mut upstream_stream = Box::pin(upstream_stream);
        let mut sequence: i64 = -1;
        let mut sse_text = String::new();
        let mut first_token_at: Option<Instant> = None;
        let mut client_disconnected = false;
        let mut stream_error: Option<String> = None;

        while let Some(item) = upstream_stream.next().await {
            match item {
                Ok(bytes) => {
                    let chunk_str = String::from_utf8_lossy(&bytes).into_owned();
                    if first_token_at.is_none() && crate::proxy::upstream::chunk_contains_content(&chunk_str) {
                        first_token_at = Some(Instant::now());
                    }
                    sse_text.push_str(&chunk_str);

                    sequence += 1;
                    if storage_tx.send((sequence, chunk_str)).await.is_err() {
                        warn!("streaming chunk persistence task is gone, continuing to forward to client");
                    }

                    if client_tx.send(Ok(bytes)).await.is_err() {
                        client_disconnected = true;
                        break;
                    }
                }
                Err(e) => {
                    stream_error = Some(e.to_string());
                    let _ = client_tx
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    break;
                }
            }
        }
        drop(storage_tx);

        let usage = crate::proxy::upstream::extract_streaming_usage(&sse_text);
        let duration_ms = request_start.elapsed().as_millis() as i64;
        let first_token_latency_ms = first_token_at.map(|t| t.duration_since(request_start).as_millis() as i64);
        let response_body = assemble_response_body(&sse_text);
        let tool_call_count = count_tool_use_blocks(&response_body);

        let error_text = if client_disconnected {
            Some("client disconnected mid-stream".to_string())
        } else {
            stream_error
        };

        let update = ResponseUpdate {
            status,
            response_headers: Value::Null,
            response_body: Some(response_body.clone()),
            usage,
            tool_call_count,
            first_token_latency_ms,
            duration_ms,
            error_text,
        };
        if let Err(e) = state.storage.store_response(&short_id, update).await {
            warn!(error = %e, "failed to persist streaming response update");
        }

        metrics::counter!("threadwire_requests_total", "domain" => domain.clone(), "classification" => "streaming")
            .increment(1);
        metrics::histogram!("threadwire_request_duration_seconds", "domain" => domain.clone())
            .record(duration_ms as f64 / 1000.0);

        if !client_disconnected {
            spawn_post_response_tasks(state, short_id, domain, credential, model, response_body, usage);
        }
    });

    let body = Body::from_stream(ReceiverStream::new(client_rx));
    let response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", "text/event-stream")
        .body(body)
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    Ok(response)
}

/// Proxy Pipeline step 7 (spec.md §4.5): runs after the response is on its
/// way to the client and MUST NOT block it. Scans for Task-tool invocations
/// and updates token usage aggregates. Analysis jobs and error
/// notifications are created explicitly via the dashboard API rather than
/// auto-enqueued here (see DESIGN.md).
fn spawn_post_response_tasks(
    state: AppState,
    short_id: String,
    domain: String,
    credential: Credential,
    model: Option<String>,
    response_body: Value,
    usage: crate::model::TokenUsage,
) {
    tokio::spawn(async move {
        if let Err(e) = state.storage.process_task_tool_invocations(&short_id, &response_body).await {
            warn!(error = %e, "failed to persist task tool invocations");
        }

        state.usage.record(
            credential.account_id(),
            &domain,
            model.as_deref().unwrap_or("unknown"),
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_creation_input_tokens,
            usage.cache_read_input_tokens,
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SystemBlock;

    #[test]
    fn counts_no_system_prompt() {
        assert_eq!(system_prompt_count(None), 0);
    }

    #[test]
    fn counts_single_text_system_prompt() {
        assert_eq!(
            system_prompt_count(Some(&SystemPrompt::Text("be helpful".to_string()))),
            1
        );
    }

    #[test]
    fn counts_empty_text_system_prompt_as_zero() {
        assert_eq!(system_prompt_count(Some(&SystemPrompt::Text(String::new()))), 0);
    }

    #[test]
    fn counts_multiple_system_blocks() {
        let blocks = vec![
            SystemBlock {
                block_type: "text".to_string(),
                text: "a".to_string(),
                cache_control: None,
            },
            SystemBlock {
                block_type: "text".to_string(),
                text: "b".to_string(),
                cache_control: None,
            },
        ];
        assert_eq!(system_prompt_count(Some(&SystemPrompt::Blocks(blocks))), 2);
    }
}
