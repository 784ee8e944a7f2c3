// src/auth/mod.rs
// Client Authentication (spec.md §4.8): compare the presented bearer token
// to the domain's stored client token using constant-time comparison. On
// mismatch: 401, no timing signal.

use subtle::ConstantTimeEq;

use crate::error::AppError;

/// Extract the bearer credential from either `Authorization: Bearer <token>`
/// or `x-api-key: <token>` (spec.md §6).
pub fn extract_client_token(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Constant-time comparison on equal-length buffers. Unequal lengths are
/// treated as a mismatch without attempting a byte-wise comparison (there
/// is no secret-dependent length to protect here, just no valid reason to
/// run `ct_eq` against mismatched sizes).
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Authenticate a client request against `domain`'s configured client
/// token, when client auth is enabled. A domain with no `client_api_key`
/// configured is treated as open (no client auth material to check
/// against).
pub fn authenticate(
    headers: &axum::http::HeaderMap,
    expected: Option<&str>,
) -> Result<(), AppError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = extract_client_token(headers).ok_or(AppError::Authentication)?;
    if tokens_match(&presented, expected) {
        Ok(())
    } else {
        Err(AppError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn matches_equal_tokens() {
        assert!(tokens_match("sk-abc123", "sk-abc123"));
    }

    #[test]
    fn rejects_different_tokens_same_length() {
        assert!(!tokens_match("sk-abc123", "sk-abc124"));
    }

    #[test]
    fn rejects_different_length_tokens() {
        assert!(!tokens_match("sk-abc", "sk-abc123"));
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-test"),
        );
        assert_eq!(extract_client_token(&headers), Some("sk-test".to_string()));
    }

    #[test]
    fn extracts_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-test"));
        assert_eq!(extract_client_token(&headers), Some("sk-test".to_string()));
    }

    #[test]
    fn disabled_when_no_expected_token() {
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, None).is_ok());
    }

    #[test]
    fn rejects_missing_credential_when_enabled() {
        let headers = HeaderMap::new();
        assert!(authenticate(&headers, Some("sk-test")).is_err());
    }
}
