// src/config/server.rs
// Server and database configuration

use serde::{Deserialize, Serialize};

use super::helpers::{env_bool, env_or, env_u16, env_u64};

/// Listen address configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_u16("PORT", 3000),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Relational store connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub storage_enabled: bool,
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_or("DATABASE_URL", "sqlite://threadwire.db"),
            storage_enabled: env_bool("STORAGE_ENABLED", true),
        }
    }
}

/// Logging configuration, separate from `tracing_subscriber`'s own
/// `RUST_LOG` so slow-query thresholds and SQL tracing can be toggled
/// independently of the general log level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub debug: bool,
    pub debug_sql: bool,
    pub slow_query_threshold_ms: u64,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        Self {
            debug: env_bool("DEBUG", false),
            debug_sql: env_bool("DEBUG_SQL", false),
            slow_query_threshold_ms: env_u64("SLOW_QUERY_THRESHOLD_MS", 500),
        }
    }
}
