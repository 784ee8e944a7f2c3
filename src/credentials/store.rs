// src/credentials/store.rs
// Credential Store (spec.md §4.4): per-domain credential lookup with
// transparent, single-flight-coalesced OAuth refresh.
//
// Grounded on the teacher's `AuthService` (`auth/service.rs`): a small
// service struct wrapping a backing store, exposing a handful of async
// methods that return `anyhow::Result`. Generalized here from a
// per-user/password login flow to a per-domain, per-variant (api_key/oauth)
// credential record backed by files on disk instead of a users table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::proxy::ProxyConfig;

use super::record::{CredentialRecord, OAuthTokens, load, save};

/// A credential resolved for use against the upstream, stripped of refresh
/// plumbing. Borrowed by the Proxy Pipeline to build the outbound request.
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey { api_key: String, account_id: String },
    OAuth { access_token: String, account_id: String },
}

impl Credential {
    pub fn account_id(&self) -> &str {
        match self {
            Credential::ApiKey { account_id, .. } => account_id,
            Credential::OAuth { account_id, .. } => account_id,
        }
    }

    /// The `(header name, header value)` pair to attach to the upstream
    /// request.
    pub fn upstream_header(&self) -> (&'static str, String) {
        match self {
            Credential::ApiKey { api_key, .. } => ("x-api-key", api_key.clone()),
            Credential::OAuth { access_token, .. } => {
                ("authorization", format!("Bearer {access_token}"))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential configured for domain {0}")]
    NotFound(String),
    #[error("oauth refresh requires re-authentication: {0}")]
    ReauthRequired(String),
    #[error("oauth refresh failed: {0}")]
    Transient(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

const REFRESH_SKEW_SECS: i64 = 60;
const MAX_REFRESH_ATTEMPTS: u32 = 3;

pub struct CredentialStore {
    dir: PathBuf,
    http: reqwest::Client,
    token_endpoint_path: String,
    upstream_base_url: String,
    cache: RwLock<HashMap<String, CredentialRecord>>,
    refresh_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CredentialStore {
    pub fn new(credentials_dir: impl Into<PathBuf>, proxy: &ProxyConfig) -> Self {
        Self {
            dir: credentials_dir.into(),
            http: reqwest::Client::new(),
            token_endpoint_path: proxy.oauth_token_path.clone(),
            upstream_base_url: proxy.upstream_base_url.clone(),
            cache: RwLock::new(HashMap::new()),
            refresh_locks: AsyncMutex::new(HashMap::new()),
        }
    }

    /// The client-facing bearer token expected from requests to `domain`,
    /// if client auth is configured for it (spec.md §4.8).
    pub async fn client_api_key(&self, domain: &str) -> anyhow::Result<Option<String>> {
        let record = self.record_for(domain).await?;
        Ok(record.client_api_key().map(str::to_string))
    }

    /// Return a usable credential for `domain`, refreshing an expiring OAuth
    /// token synchronously when needed.
    pub async fn get_credential(&self, domain: &str) -> Result<Credential, CredentialError> {
        let record = self
            .record_for(domain)
            .await
            .map_err(|_| CredentialError::NotFound(domain.to_string()))?;

        match record {
            CredentialRecord::ApiKey {
                api_key,
                account_id,
                ..
            } => Ok(Credential::ApiKey { api_key, account_id }),
            CredentialRecord::Oauth { oauth, account_id, .. } => {
                let needs_refresh =
                    (oauth.expires_at - Utc::now()).num_seconds() < REFRESH_SKEW_SECS;
                if !needs_refresh {
                    return Ok(Credential::OAuth {
                        access_token: oauth.access_token,
                        account_id,
                    });
                }
                self.refresh_oauth(domain, oauth, account_id).await
            }
        }
    }

    async fn record_for(&self, domain: &str) -> anyhow::Result<CredentialRecord> {
        if let Some(record) = self.cache.read().get(domain).cloned() {
            return Ok(record);
        }
        let record = load(&self.dir, domain).await?;
        self.cache.write().insert(domain.to_string(), record.clone());
        Ok(record)
    }

    async fn domain_lock(&self, domain: &str) -> Arc<AsyncMutex<()>> {
        self.refresh_locks
            .lock()
            .await
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Refresh `domain`'s OAuth token, coalescing concurrent callers behind
    /// a per-domain lock so the upstream refresh endpoint is called at most
    /// once in flight.
    async fn refresh_oauth(
        &self,
        domain: &str,
        stale: OAuthTokens,
        account_id: String,
    ) -> Result<Credential, CredentialError> {
        let lock = self.domain_lock(domain).await;
        let _guard = lock.lock().await;

        // Another waiter may have already refreshed while we queued for the
        // lock; re-check the cache before calling out again.
        if let Ok(CredentialRecord::Oauth { oauth, .. }) = self.record_for(domain).await {
            if (oauth.expires_at - Utc::now()).num_seconds() >= REFRESH_SKEW_SECS {
                return Ok(Credential::OAuth {
                    access_token: oauth.access_token,
                    account_id,
                });
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.call_refresh_endpoint(&stale.refresh_token).await {
                Ok(refreshed) => {
                    let new_record = CredentialRecord::Oauth {
                        oauth: refreshed.clone(),
                        client_api_key: self.client_api_key(domain).await.ok().flatten(),
                        account_id: account_id.clone(),
                    };
                    if let Err(e) = save(&self.dir, domain, &new_record).await {
                        warn!(domain, error = %e, "failed to persist refreshed oauth credential");
                    }
                    self.cache.write().insert(domain.to_string(), new_record);
                    info!(domain, "oauth credential refreshed");
                    return Ok(Credential::OAuth {
                        access_token: refreshed.access_token,
                        account_id,
                    });
                }
                Err(CredentialError::ReauthRequired(msg)) => {
                    warn!(domain, error = %msg, "oauth refresh requires re-authentication");
                    return Err(CredentialError::ReauthRequired(msg));
                }
                Err(e) if attempt >= MAX_REFRESH_ATTEMPTS => {
                    warn!(domain, error = %e, attempt, "oauth refresh exhausted retries, using stale token");
                    return Ok(Credential::OAuth {
                        access_token: stale.access_token,
                        account_id,
                    });
                }
                Err(e) => {
                    warn!(domain, error = %e, attempt, "oauth refresh failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
                }
            }
        }
    }

    async fn call_refresh_endpoint(&self, refresh_token: &str) -> Result<OAuthTokens, CredentialError> {
        let url = format!(
            "{}{}",
            self.upstream_base_url.trim_end_matches('/'),
            self.token_endpoint_path
        );

        let response = self
            .http
            .post(&url)
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(|e| CredentialError::Transient(e.to_string()))?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CredentialError::Transient(format!("invalid refresh response: {e}")))?;

        if !status.is_success() {
            let error_code = body.get("error").and_then(|v| v.as_str()).unwrap_or("");
            if status.as_u16() == 400 || status.as_u16() == 401 || error_code == "invalid_grant" {
                return Err(CredentialError::ReauthRequired(format!(
                    "refresh endpoint returned {status}: {body}"
                )));
            }
            return Err(CredentialError::Transient(format!(
                "refresh endpoint returned {status}"
            )));
        }

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CredentialError::Transient("missing access_token in refresh response".into()))?
            .to_string();
        let refresh_token = body
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .unwrap_or(refresh_token)
            .to_string();
        let expires_in = body.get("expires_in").and_then(|v| v.as_i64()).unwrap_or(3600);
        let scopes = body
            .get("scope")
            .and_then(|v| v.as_str())
            .map(|s| s.split(' ').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(OAuthTokens {
            access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_credential_uses_x_api_key_header() {
        let cred = Credential::ApiKey {
            api_key: "sk-test".to_string(),
            account_id: "acct-1".to_string(),
        };
        assert_eq!(cred.upstream_header(), ("x-api-key", "sk-test".to_string()));
    }

    #[test]
    fn oauth_credential_uses_bearer_header() {
        let cred = Credential::OAuth {
            access_token: "tok".to_string(),
            account_id: "acct-1".to_string(),
        };
        assert_eq!(
            cred.upstream_header(),
            ("authorization", "Bearer tok".to_string())
        );
    }
}
