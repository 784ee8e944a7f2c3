// src/linker.rs
// Conversation Linker (spec.md §4.2): a pure algorithm mapping
// (messages, system, domain, timestamp) -> (conversationId, branchId,
// parent, sub-task info). Storage access is expressed as a trait so the
// linker itself carries no SQL or connection-pool details -- the Storage
// Adapter hands it query executors backed by the Storage Writer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::hash::{hash_messages, hash_system_prompt};
use crate::model::{Message, SystemPrompt};

/// The marker a compact-continuation request's first user message begins
/// with. Resolved Open Question (spec.md §9): treated as a discrete,
/// configurable constant; this is the literal value emitted by the
/// reference client when it compacts a long-running session.
pub const CONVERSATION_SUMMARY_MARKER: &str =
    "This session is being continued from a previous conversation that ran out of context.";

/// Minimal view of a prior request row the linker needs to reason about.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub system_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Storage-backed queries the linker needs. Implemented by the Storage
/// Adapter; the linker never issues SQL itself.
#[async_trait]
pub trait LinkQueries: Send + Sync {
    /// All prior requests in `domain` whose `current_message_hash` equals
    /// `parent_hash`.
    async fn find_by_current_hash(
        &self,
        domain: &str,
        parent_hash: &str,
    ) -> anyhow::Result<Vec<RequestSummary>>;

    /// The request whose response contained a `Task` invocation with
    /// `input.prompt == prompt`, created within the preceding 24 hours of
    /// `at` (query window) and within 30 seconds before `at` (match
    /// window). Resolved Open Question (spec.md §9): ties bind to the most
    /// recently created invocation.
    async fn find_task_invocation_match(
        &self,
        domain: &str,
        prompt: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RequestSummary>>;

    /// A prior request in `domain`, created before `at`, whose response
    /// body text contains `summary_text` as an exact substring.
    async fn find_compact_continuation(
        &self,
        domain: &str,
        summary_text: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Option<RequestSummary>>;

    /// Whether `parent_request_id` already has at least one child request
    /// (a request whose `parent_request_id` equals it).
    async fn parent_has_children(&self, parent_request_id: Uuid) -> anyhow::Result<bool>;

    /// Highest numeric suffix among existing `{prefix}N` branch ids in
    /// `conversation_id` created before `at` (0 if none).
    async fn max_branch_sequence(
        &self,
        conversation_id: Uuid,
        prefix: &str,
        at: DateTime<Utc>,
    ) -> anyhow::Result<u32>;

    /// Whether `branch_id` is already in use within `conversation_id`, used
    /// to keep `branch_HHMMSS` ids unique.
    async fn branch_exists(&self, conversation_id: Uuid, branch_id: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct LinkContext<'a> {
    pub domain: &'a str,
    pub messages: &'a [Message],
    pub system: Option<&'a SystemPrompt>,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Linkage {
    pub current_message_hash: String,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub parent_request_id: Option<Uuid>,
    pub parent_task_request_id: Option<Uuid>,
    pub is_subtask: bool,
    pub message_count: usize,
}

/// Run the full linking algorithm against `ctx`, using `queries` for every
/// storage lookup. Storage query errors propagate as fatal (spec.md §4.2
/// Failure semantics); a query that simply returns nothing is not an error.
pub async fn link_conversation(
    ctx: &LinkContext<'_>,
    queries: &dyn LinkQueries,
) -> anyhow::Result<Linkage> {
    let current_message_hash = hash_messages(ctx.messages);
    // Each continuation resends the full history: the parent's own
    // `current_message_hash` was computed over its request body alone,
    // which did not yet include the assistant reply that prompted this
    // request. So the parent's state is this array with the trailing
    // assistant-reply + new-user-message pair dropped, not just the last
    // message.
    let parent_message_hash = if ctx.messages.len() < 2 {
        None
    } else {
        Some(hash_messages(&ctx.messages[..ctx.messages.len() - 2]))
    };
    let system_hash = hash_system_prompt(ctx.system);
    let message_count = ctx.messages.len();

    // Step 2: sub-task detection.
    if ctx.messages.len() == 1 && ctx.messages[0].role == "user" {
        let prompt = ctx.messages[0].text_content();
        if let Some(parent) = queries
            .find_task_invocation_match(ctx.domain, &prompt, ctx.timestamp)
            .await?
        {
            let sequence = queries
                .max_branch_sequence(parent.conversation_id, "subtask_", ctx.timestamp)
                .await?
                + 1;
            return Ok(Linkage {
                current_message_hash,
                parent_message_hash,
                system_hash,
                conversation_id: parent.conversation_id,
                branch_id: format!("subtask_{sequence}"),
                parent_request_id: None,
                parent_task_request_id: Some(parent.request_id),
                is_subtask: true,
                message_count,
            });
        }
    }

    // Step 3: compact-continuation detection.
    let is_compact_candidate = ctx.messages.len() == 1
        || ctx
            .messages
            .first()
            .map(|m| m.text_content().starts_with(CONVERSATION_SUMMARY_MARKER))
            .unwrap_or(false);

    if is_compact_candidate {
        let first_text = ctx.messages.first().map(|m| m.text_content()).unwrap_or_default();
        let summary_content = first_text
            .strip_prefix(CONVERSATION_SUMMARY_MARKER)
            .map(str::trim_start)
            .unwrap_or(first_text.as_str());

        if !summary_content.is_empty() {
            if let Some(prior) = queries
                .find_compact_continuation(ctx.domain, summary_content, ctx.timestamp)
                .await?
            {
                let sequence = queries
                    .max_branch_sequence(prior.conversation_id, "compact_", ctx.timestamp)
                    .await?
                    + 1;
                return Ok(Linkage {
                    current_message_hash,
                    parent_message_hash,
                    system_hash,
                    conversation_id: prior.conversation_id,
                    branch_id: format!("compact_{sequence}"),
                    parent_request_id: None,
                    parent_task_request_id: None,
                    is_subtask: false,
                    message_count,
                });
            }
        }
    }

    // Step 4: normal parent match.
    let Some(ref parent_hash) = parent_message_hash else {
        // messages.len() <= 1 and neither sub-task nor compact matched:
        // a genuinely new conversation.
        return Ok(Linkage {
            current_message_hash,
            parent_message_hash,
            system_hash,
            conversation_id: Uuid::new_v4(),
            branch_id: "main".to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            message_count,
        });
    };

    let candidates = queries.find_by_current_hash(ctx.domain, parent_hash).await?;

    match candidates.len() {
        0 => Ok(Linkage {
            current_message_hash,
            parent_message_hash,
            system_hash,
            conversation_id: Uuid::new_v4(),
            branch_id: "main".to_string(),
            parent_request_id: None,
            parent_task_request_id: None,
            is_subtask: false,
            message_count,
        }),
        1 => {
            let parent = &candidates[0];
            let has_children = queries.parent_has_children(parent.request_id).await?;
            let system_differs = system_hash != parent.system_hash;

            let branch_id = if has_children || system_differs {
                new_unique_timestamp_branch(queries, parent.conversation_id, ctx.timestamp).await?
            } else {
                parent.branch_id.clone()
            };

            Ok(Linkage {
                current_message_hash,
                parent_message_hash,
                system_hash,
                conversation_id: parent.conversation_id,
                branch_id,
                parent_request_id: Some(parent.request_id),
                parent_task_request_id: None,
                is_subtask: false,
                message_count,
            })
        }
        _ => {
            // Divergent branch: multiple prior requests share this parent
            // hash. Reuse the conversation of the earliest match; use the
            // tie-break rule (same system_hash preferred, then most recent
            // timestamp) only to pick which candidate is attributed as the
            // immediate parent.
            let earliest = candidates
                .iter()
                .min_by_key(|c| c.timestamp)
                .expect("non-empty candidates");

            let chosen_parent = candidates
                .iter()
                .min_by_key(|c| {
                    let system_matches = c.system_hash == system_hash;
                    (!system_matches, std::cmp::Reverse(c.timestamp))
                })
                .expect("non-empty candidates");

            let branch_id =
                new_unique_timestamp_branch(queries, earliest.conversation_id, ctx.timestamp).await?;

            Ok(Linkage {
                current_message_hash,
                parent_message_hash,
                system_hash,
                conversation_id: earliest.conversation_id,
                branch_id,
                parent_request_id: Some(chosen_parent.request_id),
                parent_task_request_id: None,
                is_subtask: false,
                message_count,
            })
        }
    }
}

/// Build a `branch_HHMMSS` id from `at`, appending `_k` until unique within
/// `conversation_id`.
async fn new_unique_timestamp_branch(
    queries: &dyn LinkQueries,
    conversation_id: Uuid,
    at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let base = format!("branch_{}", at.format("%H%M%S"));
    if !queries.branch_exists(conversation_id, &base).await? {
        return Ok(base);
    }
    let mut k = 2;
    loop {
        let candidate = format!("{base}_{k}");
        if !queries.branch_exists(conversation_id, &candidate).await? {
            return Ok(candidate);
        }
        k += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageContent;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn user(text: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn assistant(text: &str) -> Message {
        Message {
            role: "assistant".to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[derive(Default)]
    struct FakeStore {
        by_hash: Mutex<HashMap<String, Vec<RequestSummary>>>,
        task_match: Mutex<Option<RequestSummary>>,
        children: Mutex<HashMap<Uuid, bool>>,
        branch_ids: Mutex<Vec<(Uuid, String)>>,
    }

    #[async_trait]
    impl LinkQueries for FakeStore {
        async fn find_by_current_hash(
            &self,
            _domain: &str,
            parent_hash: &str,
        ) -> anyhow::Result<Vec<RequestSummary>> {
            Ok(self
                .by_hash
                .lock()
                .unwrap()
                .get(parent_hash)
                .cloned()
                .unwrap_or_default())
        }

        async fn find_task_invocation_match(
            &self,
            _domain: &str,
            _prompt: &str,
            _at: DateTime<Utc>,
        ) -> anyhow::Result<Option<RequestSummary>> {
            Ok(self.task_match.lock().unwrap().clone())
        }

        async fn find_compact_continuation(
            &self,
            _domain: &str,
            _summary_text: &str,
            _at: DateTime<Utc>,
        ) -> anyhow::Result<Option<RequestSummary>> {
            Ok(None)
        }

        async fn parent_has_children(&self, parent_request_id: Uuid) -> anyhow::Result<bool> {
            Ok(*self
                .children
                .lock()
                .unwrap()
                .get(&parent_request_id)
                .unwrap_or(&false))
        }

        async fn max_branch_sequence(
            &self,
            conversation_id: Uuid,
            prefix: &str,
            _at: DateTime<Utc>,
        ) -> anyhow::Result<u32> {
            Ok(self
                .branch_ids
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, b)| *c == conversation_id && b.starts_with(prefix))
                .filter_map(|(_, b)| b[prefix.len()..].parse::<u32>().ok())
                .max()
                .unwrap_or(0))
        }

        async fn branch_exists(&self, conversation_id: Uuid, branch_id: &str) -> anyhow::Result<bool> {
            Ok(self
                .branch_ids
                .lock()
                .unwrap()
                .iter()
                .any(|(c, b)| *c == conversation_id && b == branch_id))
        }
    }

    #[tokio::test]
    async fn new_conversation_when_no_parent_match() {
        let store = FakeStore::default();
        let messages = vec![user("hi")];
        let ctx = LinkContext {
            domain: "a.test",
            messages: &messages,
            system: None,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let linkage = link_conversation(&ctx, &store).await.unwrap();
        assert_eq!(linkage.branch_id, "main");
        assert!(linkage.parent_request_id.is_none());
        assert!(!linkage.is_subtask);
    }

    #[tokio::test]
    async fn continuation_inherits_conversation_and_branch() {
        let store = FakeStore::default();
        let parent_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let parent_messages = vec![user("hi")];
        let parent_hash = hash_messages(&parent_messages);

        store.by_hash.lock().unwrap().insert(
            parent_hash,
            vec![RequestSummary {
                request_id: parent_id,
                conversation_id,
                branch_id: "main".to_string(),
                system_hash: None,
                timestamp: Utc::now() - chrono::Duration::seconds(5),
            }],
        );

        let messages = vec![user("hi"), assistant("hello"), user("more")];
        let ctx = LinkContext {
            domain: "a.test",
            messages: &messages,
            system: None,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let linkage = link_conversation(&ctx, &store).await.unwrap();
        assert_eq!(linkage.conversation_id, conversation_id);
        assert_eq!(linkage.branch_id, "main");
        assert_eq!(linkage.parent_request_id, Some(parent_id));
    }

    #[tokio::test]
    async fn second_child_of_same_parent_gets_new_branch() {
        let store = FakeStore::default();
        let parent_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        let parent_messages = vec![user("hi"), assistant("hello"), user("more")];
        let parent_hash = hash_messages(&parent_messages);

        store.by_hash.lock().unwrap().insert(
            parent_hash,
            vec![RequestSummary {
                request_id: parent_id,
                conversation_id,
                branch_id: "main".to_string(),
                system_hash: None,
                timestamp: Utc::now() - chrono::Duration::seconds(5),
            }],
        );
        // Parent already has a child on "main" (B1 already processed).
        store.children.lock().unwrap().insert(parent_id, true);

        let messages = vec![
            user("hi"),
            assistant("hello"),
            user("more"),
            assistant("ok"),
            user("different"),
        ];
        let ctx = LinkContext {
            domain: "a.test",
            messages: &messages,
            system: None,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let linkage = link_conversation(&ctx, &store).await.unwrap();
        assert_eq!(linkage.conversation_id, conversation_id);
        assert!(linkage.branch_id.starts_with("branch_"));
        assert_eq!(linkage.parent_request_id, Some(parent_id));
    }

    #[tokio::test]
    async fn subtask_detection_links_to_task_invocation() {
        let store = FakeStore::default();
        let parent_id = Uuid::new_v4();
        let conversation_id = Uuid::new_v4();
        *store.task_match.lock().unwrap() = Some(RequestSummary {
            request_id: parent_id,
            conversation_id,
            branch_id: "main".to_string(),
            system_hash: None,
            timestamp: Utc::now() - chrono::Duration::seconds(10),
        });

        let messages = vec![user("Summarize X")];
        let ctx = LinkContext {
            domain: "a.test",
            messages: &messages,
            system: None,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        };
        let linkage = link_conversation(&ctx, &store).await.unwrap();
        assert!(linkage.is_subtask);
        assert_eq!(linkage.conversation_id, conversation_id);
        assert_eq!(linkage.parent_task_request_id, Some(parent_id));
        assert_eq!(linkage.branch_id, "subtask_1");
        assert!(linkage.parent_request_id.is_none());
    }
}
