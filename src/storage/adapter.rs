// src/storage/adapter.rs
// Storage Adapter (spec.md §4.3): owns the transient short-id -> UUID map
// and exposes the high-level operations the Proxy Pipeline calls. Hands the
// Conversation Linker its query executors (the Storage Writer) so the
// linker stays free of storage details.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::linker::{link_conversation, LinkContext, Linkage};
use crate::model::{extract_task_invocations, Message, SystemPrompt};

use super::schema::init_schema;
use super::writer::{NewRequestRecord, ResponseUpdate, StorageWriter};

struct ShortIdEntry {
    request_id: Uuid,
    inserted_at: DateTime<Utc>,
}

pub struct StorageAdapter {
    writer: Arc<StorageWriter>,
    short_ids: RwLock<HashMap<String, ShortIdEntry>>,
    retention: chrono::Duration,
    cleanup_interval: StdDuration,
    closed: Arc<Notify>,
}

impl StorageAdapter {
    pub async fn connect(
        database_url: &str,
        retention_ms: u64,
        cleanup_ms: u64,
    ) -> anyhow::Result<Arc<Self>> {
        let pool = SqlitePool::connect(database_url).await?;
        init_schema(&pool).await?;

        let adapter = Arc::new(Self {
            writer: Arc::new(StorageWriter::new(pool)),
            short_ids: RwLock::new(HashMap::new()),
            retention: chrono::Duration::milliseconds(retention_ms as i64),
            cleanup_interval: StdDuration::from_millis(cleanup_ms),
            closed: Arc::new(Notify::new()),
        });

        adapter.clone().spawn_cleanup();
        Ok(adapter)
    }

    pub fn writer(&self) -> &Arc<StorageWriter> {
        &self.writer
    }

    /// Assign a fresh short request id, mapping it to `request_id`. A
    /// repeat call with the same short id overwrites the mapping; callers
    /// must not call this twice for the same short id.
    pub fn new_short_id(&self, request_id: Uuid) -> String {
        let short_id = nanoid::nanoid!(12);
        self.short_ids.write().insert(
            short_id.clone(),
            ShortIdEntry {
                request_id,
                inserted_at: Utc::now(),
            },
        );
        short_id
    }

    fn resolve(&self, short_id: &str) -> Option<Uuid> {
        self.short_ids.read().get(short_id).map(|e| e.request_id)
    }

    /// Compute linkage and persist the request record immediately (Proxy
    /// Pipeline step 5).
    #[allow(clippy::too_many_arguments)]
    pub async fn store_request(
        &self,
        short_id: &str,
        domain: &str,
        account_id: &str,
        timestamp: DateTime<Utc>,
        method: &str,
        path: &str,
        request_headers: Value,
        request_body: Value,
        model: Option<String>,
        is_streaming: bool,
        messages: &[Message],
        system: Option<&SystemPrompt>,
        classification: crate::model::RequestClassification,
    ) -> anyhow::Result<Linkage> {
        let request_id = self
            .resolve(short_id)
            .ok_or_else(|| anyhow::anyhow!("unknown short id {short_id}"))?;

        let ctx = LinkContext {
            domain,
            messages,
            system,
            request_id,
            timestamp,
        };
        let linkage = link_conversation(&ctx, self.writer.as_ref()).await?;

        let record = NewRequestRecord {
            request_id,
            domain: domain.to_string(),
            account_id: account_id.to_string(),
            timestamp,
            method: method.to_string(),
            path: path.to_string(),
            request_headers,
            request_body,
            model,
            classification,
            is_streaming,
            conversation_id: linkage.conversation_id,
            branch_id: linkage.branch_id.clone(),
            parent_request_id: linkage.parent_request_id,
            current_message_hash: linkage.current_message_hash.clone(),
            parent_message_hash: linkage.parent_message_hash.clone(),
            system_hash: linkage.system_hash.clone(),
            is_subtask: linkage.is_subtask,
            parent_task_request_id: linkage.parent_task_request_id,
        };
        self.writer.insert_request(&record).await?;
        Ok(linkage)
    }

    /// No-op if `short_id` has no mapping (request too old, or never
    /// stored): logged at debug level, not an error.
    pub async fn store_response(&self, short_id: &str, update: ResponseUpdate) -> anyhow::Result<()> {
        let Some(request_id) = self.resolve(short_id) else {
            debug!(short_id, "store_response: no mapping, dropping");
            return Ok(());
        };
        self.writer.update_response(request_id, &update).await
    }

    pub async fn store_streaming_chunk(&self, short_id: &str, sequence: i64, chunk: &str) -> anyhow::Result<()> {
        let Some(request_id) = self.resolve(short_id) else {
            debug!(short_id, "store_streaming_chunk: no mapping, dropping");
            return Ok(());
        };
        self.writer.append_streaming_chunk(request_id, sequence, chunk).await
    }

    /// Scan a response body for Task invocations and persist them on the
    /// parent request row (spec.md §4.3 Task-invocation extraction).
    pub async fn process_task_tool_invocations(&self, short_id: &str, response_body: &Value) -> anyhow::Result<()> {
        let Some(request_id) = self.resolve(short_id) else {
            debug!(short_id, "process_task_tool_invocations: no mapping, dropping");
            return Ok(());
        };
        let invocations = extract_task_invocations(response_body);
        self.writer.set_task_tool_invocations(request_id, &invocations).await
    }

    fn spawn_cleanup(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.cleanup_interval) => {}
                    _ = self.closed.notified() => break,
                }
                self.run_cleanup_cycle();
            }
        });
    }

    fn run_cleanup_cycle(&self) {
        let start = std::time::Instant::now();
        let cutoff = Utc::now() - self.retention;
        let mut map = self.short_ids.write();
        let before = map.len();
        map.retain(|_, entry| entry.inserted_at >= cutoff);
        let removed = before - map.len();
        drop(map);

        metrics::counter!("threadwire_short_id_cleanup_removed_total").increment(removed as u64);
        let elapsed = start.elapsed();
        if elapsed > StdDuration::from_millis(500) {
            warn!(?elapsed, removed, "short id cleanup cycle exceeded threshold");
        }
    }

    /// Stop scheduling further cleanup, clear the mapping, and close the
    /// underlying connection. All operations are forbidden afterward.
    pub async fn close(&self) {
        self.closed.notify_waiters();
        self.short_ids.write().clear();
        self.writer.pool().close().await;
    }
}
