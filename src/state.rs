// src/state.rs
// Shared application state handed to every axum handler.

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::analysis::{AnalysisStore, AnalysisWorker};
use crate::api::http::analysis::AnalysisRateLimiters;
use crate::config::AppConfig;
use crate::credentials::CredentialStore;
use crate::proxy::UpstreamClient;
use crate::storage::StorageAdapter;
use crate::usage::TokenUsageTracker;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<StorageAdapter>,
    pub credentials: Arc<CredentialStore>,
    pub usage: Arc<TokenUsageTracker>,
    pub upstream: Arc<UpstreamClient>,
    pub analysis_store: Arc<AnalysisStore>,
    pub analysis_rate_limiters: Arc<AnalysisRateLimiters>,
}

impl AppState {
    pub async fn build(config: AppConfig) -> anyhow::Result<(Self, Arc<AnalysisWorker>)> {
        let config = Arc::new(config);

        let storage = StorageAdapter::connect(
            &config.database.url,
            config.storage_adapter.retention_ms,
            config.storage_adapter.cleanup_ms,
        )
        .await?;

        let credentials = Arc::new(CredentialStore::new(
            config.credentials.credentials_dir.clone(),
            &config.proxy,
        ));

        let pool = SqlitePool::connect(&config.database.url).await?;
        let usage = Arc::new(TokenUsageTracker::new(pool.clone()));
        let analysis_store = Arc::new(AnalysisStore::new(pool));

        let upstream = Arc::new(UpstreamClient::new(&config.proxy)?);
        let analysis_rate_limiters = Arc::new(AnalysisRateLimiters::new());

        let worker = Arc::new(AnalysisWorker::new(
            config.analysis.clone(),
            analysis_store.clone(),
            storage.writer().clone(),
        )?);

        Ok((
            Self {
                config,
                storage,
                credentials,
                usage,
                upstream,
                analysis_store,
                analysis_rate_limiters,
            },
            worker,
        ))
    }
}
