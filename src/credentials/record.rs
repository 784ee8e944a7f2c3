// src/credentials/record.rs
// On-disk shape of a per-domain credential record (spec.md §6):
// `<domain>.credentials.json`, holding either an API key or an OAuth token
// set plus the client-facing bearer token and the account id used to
// aggregate usage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRecord {
    ApiKey {
        api_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_api_key: Option<String>,
        account_id: String,
    },
    Oauth {
        oauth: OAuthTokens,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_api_key: Option<String>,
        account_id: String,
    },
}

impl CredentialRecord {
    pub fn account_id(&self) -> &str {
        match self {
            CredentialRecord::ApiKey { account_id, .. } => account_id,
            CredentialRecord::Oauth { account_id, .. } => account_id,
        }
    }

    pub fn client_api_key(&self) -> Option<&str> {
        match self {
            CredentialRecord::ApiKey { client_api_key, .. } => client_api_key.as_deref(),
            CredentialRecord::Oauth { client_api_key, .. } => client_api_key.as_deref(),
        }
    }
}

pub fn record_path(dir: &Path, domain: &str) -> PathBuf {
    dir.join(format!("{domain}.credentials.json"))
}

pub async fn load(dir: &Path, domain: &str) -> anyhow::Result<CredentialRecord> {
    let path = record_path(dir, domain);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| anyhow::anyhow!("reading credential record {}: {e}", path.display()))?;
    let record = serde_json::from_slice(&bytes)
        .map_err(|e| anyhow::anyhow!("parsing credential record {}: {e}", path.display()))?;
    Ok(record)
}

pub async fn save(dir: &Path, domain: &str, record: &CredentialRecord) -> anyhow::Result<()> {
    let path = record_path(dir, domain);
    let bytes = serde_json::to_vec_pretty(record)?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| anyhow::anyhow!("writing credential record {}: {e}", path.display()))?;
    Ok(())
}
