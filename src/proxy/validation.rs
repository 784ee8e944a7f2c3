// src/proxy/validation.rs
// Proxy Pipeline step 3 (spec.md §4.5): bounded validation of the inbound
// request body before any credential or storage work happens.

use crate::config::proxy::ProxyConfig;
use crate::error::AppError;
use crate::model::Message;

/// The subset of the upstream request schema the pipeline needs to parse
/// out in order to validate, classify, hash, and link a request. Unknown
/// top-level fields are preserved by re-serializing the original
/// `serde_json::Value` onward to the upstream, never this struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct MessagesRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<crate::model::SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
}

/// Validate body size, message count, and total text length (spec.md §4.5
/// step 3). 400 on violation.
pub fn validate_body_bytes(body: &[u8], config: &ProxyConfig) -> Result<(), AppError> {
    if body.len() > config.max_body_bytes {
        return Err(AppError::Validation(format!(
            "request body of {} bytes exceeds the {} byte limit",
            body.len(),
            config.max_body_bytes
        )));
    }
    Ok(())
}

pub fn validate_parsed(req: &MessagesRequest, config: &ProxyConfig) -> Result<(), AppError> {
    if req.messages.len() > config.max_message_count {
        return Err(AppError::Validation(format!(
            "request has {} messages, exceeding the limit of {}",
            req.messages.len(),
            config.max_message_count
        )));
    }

    let total_chars: usize = req
        .messages
        .iter()
        .map(|m| m.text_content().chars().count())
        .sum();
    if total_chars > config.max_total_text_chars {
        return Err(AppError::Validation(format!(
            "request text totals {total_chars} characters, exceeding the limit of {}",
            config.max_total_text_chars
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig {
            upstream_base_url: "https://api.upstream.example".into(),
            upstream_timeout_ms: 600_000,
            server_timeout_ms: 660_000,
            max_body_bytes: 100,
            max_message_count: 2,
            max_total_text_chars: 20,
            oauth_token_path: "/oauth/token".into(),
        }
    }

    #[test]
    fn rejects_oversize_body() {
        let body = vec![b'a'; 200];
        assert!(validate_body_bytes(&body, &config()).is_err());
    }

    #[test]
    fn accepts_body_within_limit() {
        let body = vec![b'a'; 10];
        assert!(validate_body_bytes(&body, &config()).is_ok());
    }

    #[test]
    fn rejects_too_many_messages() {
        let req = MessagesRequest {
            model: None,
            messages: vec![
                Message {
                    role: "user".into(),
                    content: crate::model::MessageContent::Text("a".into()),
                };
                3
            ],
            system: None,
            stream: false,
        };
        assert!(validate_parsed(&req, &config()).is_err());
    }
}
