// src/config/proxy.rs
// Proxy Pipeline configuration: upstream address, timeouts, body limits

use serde::{Deserialize, Serialize};

use super::helpers::{env_or, env_u64, env_usize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Base URL of the upstream LLM API, e.g. `https://api.upstream.example`.
    pub upstream_base_url: String,
    /// Upstream request timeout (ms). Default 10 minutes.
    pub upstream_timeout_ms: u64,
    /// Overall server-side request deadline (ms). MUST exceed
    /// `upstream_timeout_ms`. Default 11 minutes.
    pub server_timeout_ms: u64,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Maximum accepted message count per request.
    pub max_message_count: usize,
    /// Maximum accepted total text length (characters) across all messages.
    pub max_total_text_chars: usize,
    /// Path appended to `upstream_base_url` for the OAuth refresh-grant
    /// endpoint used by the Credential Store.
    pub oauth_token_path: String,
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        Self {
            upstream_base_url: env_or("UPSTREAM_BASE_URL", "https://api.upstream.example"),
            upstream_timeout_ms: env_u64("CLAUDE_API_TIMEOUT", 10 * 60 * 1000),
            server_timeout_ms: env_u64("PROXY_SERVER_TIMEOUT", 11 * 60 * 1000),
            max_body_bytes: env_usize("PROXY_MAX_BODY_BYTES", 20 * 1024 * 1024),
            max_message_count: env_usize("PROXY_MAX_MESSAGE_COUNT", 1000),
            max_total_text_chars: env_usize("PROXY_MAX_TOTAL_TEXT_CHARS", 10_000_000),
            oauth_token_path: env_or("UPSTREAM_OAUTH_TOKEN_PATH", "/oauth/token"),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server_timeout_ms <= self.upstream_timeout_ms {
            anyhow::bail!(
                "PROXY_SERVER_TIMEOUT ({} ms) must exceed CLAUDE_API_TIMEOUT ({} ms)",
                self.server_timeout_ms,
                self.upstream_timeout_ms
            );
        }
        Ok(())
    }
}
