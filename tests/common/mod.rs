// tests/common/mod.rs
// Shared helpers for integration tests: an in-memory storage adapter and a
// few message-construction shortcuts mirroring the ones in unit test
// modules throughout src/.

use std::sync::Arc;

use threadwire::model::{Message, MessageContent};
use threadwire::storage::StorageAdapter;

/// A freshly-migrated, in-memory SQLite-backed storage adapter. Retention
/// and cleanup intervals are generous by default; tests that exercise the
/// short-id TTL use `connect_with_retention` instead.
pub async fn in_memory_storage() -> Arc<StorageAdapter> {
    connect_with_retention(60_000, 60_000).await
}

pub async fn connect_with_retention(retention_ms: u64, cleanup_ms: u64) -> Arc<StorageAdapter> {
    StorageAdapter::connect("sqlite::memory:", retention_ms, cleanup_ms)
        .await
        .expect("in-memory storage adapter should connect")
}

pub fn user(text: &str) -> Message {
    Message {
        role: "user".to_string(),
        content: MessageContent::Text(text.to_string()),
    }
}

pub fn assistant(text: &str) -> Message {
    Message {
        role: "assistant".to_string(),
        content: MessageContent::Text(text.to_string()),
    }
}
