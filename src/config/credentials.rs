// src/config/credentials.rs
// Credential Store configuration

use serde::{Deserialize, Serialize};

use super::helpers::{env_bool, env_or};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// Directory of per-domain credential records (`<domain>.credentials.json`).
    pub credentials_dir: String,
    /// Whether client requests must present a bearer token matching the
    /// domain's `client_api_key`.
    pub client_auth_enabled: bool,
}

impl CredentialConfig {
    pub fn from_env() -> Self {
        Self {
            credentials_dir: env_or("CREDENTIALS_DIR", "./credentials"),
            client_auth_enabled: env_bool("ENABLE_CLIENT_AUTH", false),
        }
    }
}
