// src/config/storage_adapter.rs
// Short-ID -> UUID map retention and cleanup configuration

use serde::{Deserialize, Serialize};

use super::helpers::env_u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageAdapterConfig {
    /// How often the recursive cleanup timer fires. Default 5 minutes.
    pub cleanup_ms: u64,
    /// How long a short-id -> UUID mapping is kept before it expires.
    /// Default 1 hour.
    pub retention_ms: u64,
}

impl StorageAdapterConfig {
    pub fn from_env() -> Self {
        Self {
            cleanup_ms: env_u64("STORAGE_ADAPTER_CLEANUP_MS", 5 * 60 * 1000),
            retention_ms: env_u64("STORAGE_ADAPTER_RETENTION_MS", 60 * 60 * 1000),
        }
    }
}
