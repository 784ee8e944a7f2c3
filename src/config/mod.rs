// src/config/mod.rs
// Central configuration for the proxy

pub mod analysis;
pub mod credentials;
pub mod helpers;
pub mod proxy;
pub mod server;
pub mod storage_adapter;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref CONFIG: AppConfig = AppConfig::from_env();
}

/// Top-level configuration, composed of one struct per subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: server::ServerConfig,
    pub database: server::DatabaseConfig,
    pub logging: server::LoggingConfig,
    pub credentials: credentials::CredentialConfig,
    pub proxy: proxy::ProxyConfig,
    pub storage_adapter: storage_adapter::StorageAdapterConfig,
    pub analysis: analysis::AnalysisWorkerConfig,
    pub metrics_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        // Don't panic if .env doesn't exist; production deployments rely on
        // the environment being set directly.
        dotenvy::dotenv().ok();

        Self {
            server: server::ServerConfig::from_env(),
            database: server::DatabaseConfig::from_env(),
            logging: server::LoggingConfig::from_env(),
            credentials: credentials::CredentialConfig::from_env(),
            proxy: proxy::ProxyConfig::from_env(),
            storage_adapter: storage_adapter::StorageAdapterConfig::from_env(),
            analysis: analysis::AnalysisWorkerConfig::from_env(),
            metrics_enabled: helpers::env_bool("METRICS_ENABLED", true),
        }
    }

    /// Validate config on startup; misconfiguration here is a
    /// `ConfigurationError` per the error taxonomy and fails the process
    /// before it binds a listener.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.proxy.validate()?;
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        self.server.bind_address()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
