// src/hash.rs
// Message Hasher (spec.md §4.1): deterministic content fingerprint of a
// conversation prefix, resilient to format variance.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{ContentBlock, Message, SystemPrompt};

/// Canonical, order-preserving serialization of a single content block used
/// for hashing. Only the fields relevant to identity are kept.
#[derive(Serialize)]
struct CanonicalBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CanonicalMessage {
    role: String,
    blocks: Vec<CanonicalBlock>,
}

/// Strip every substring enclosed in `<system-reminder>...</system-reminder>`
/// markers (normalization rule 2). Markers are paired and non-nested.
fn strip_system_reminders(text: &str) -> String {
    const OPEN: &str = "<system-reminder>";
    const CLOSE: &str = "</system-reminder>";

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find(OPEN) {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find(CLOSE) {
                    Some(end_rel) => {
                        let end = start + end_rel + CLOSE.len();
                        rest = &rest[end..];
                    }
                    None => {
                        // Unpaired marker: drop the rest of the block.
                        rest = "";
                    }
                }
            }
            None => {
                out.push_str(rest);
                break;
            }
        }
    }
    out
}

fn canonicalize_block(block: &ContentBlock) -> Option<CanonicalBlock> {
    match block {
        ContentBlock::Text { text, .. } => {
            let stripped = strip_system_reminders(text);
            if stripped.is_empty() {
                None
            } else {
                Some(CanonicalBlock {
                    block_type: "text",
                    text: Some(stripped),
                    id: None,
                    name: None,
                    input: None,
                    tool_use_id: None,
                    content: None,
                })
            }
        }
        ContentBlock::Image { source } => Some(CanonicalBlock {
            block_type: "image",
            text: None,
            id: None,
            name: None,
            input: Some(source.clone()),
            tool_use_id: None,
            content: None,
        }),
        ContentBlock::ToolUse { id, name, input } => Some(CanonicalBlock {
            block_type: "tool_use",
            text: None,
            id: Some(id.clone()),
            name: Some(name.clone()),
            input: Some(input.clone()),
            tool_use_id: None,
            content: None,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => Some(CanonicalBlock {
            block_type: "tool_result",
            text: None,
            id: None,
            name: None,
            input: None,
            tool_use_id: Some(tool_use_id.clone()),
            content: content.clone(),
        }),
        ContentBlock::Unknown(value) => Some(CanonicalBlock {
            block_type: "unknown",
            text: None,
            id: None,
            name: None,
            input: Some(value.clone()),
            tool_use_id: None,
            content: None,
        }),
    }
}

/// Deduplicate immediately adjacent identical `tool_result` blocks within
/// the same message (normalization rule 3).
fn dedup_adjacent_tool_results(blocks: Vec<CanonicalBlock>) -> Vec<CanonicalBlock> {
    let mut out: Vec<CanonicalBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        let is_dup_tool_result = block.block_type == "tool_result"
            && out
                .last()
                .map(|prev| {
                    prev.block_type == "tool_result"
                        && prev.tool_use_id == block.tool_use_id
                        && prev.content == block.content
                })
                .unwrap_or(false);
        if !is_dup_tool_result {
            out.push(block);
        }
    }
    out
}

fn canonicalize_message(message: &Message) -> CanonicalMessage {
    let blocks = message
        .blocks()
        .iter()
        .filter_map(canonicalize_block)
        .collect();
    CanonicalMessage {
        role: message.role.clone(),
        blocks: dedup_adjacent_tool_results(blocks),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 over a canonical serialization of each message's role and
/// normalized content.
pub fn hash_messages(messages: &[Message]) -> String {
    let canonical: Vec<CanonicalMessage> = messages.iter().map(canonicalize_message).collect();
    let serialized =
        serde_json::to_vec(&canonical).expect("canonical message serialization cannot fail");
    sha256_hex(&serialized)
}

/// SHA-256 over the normalized system prompt, or `None` if absent/empty.
pub fn hash_system_prompt(system: Option<&SystemPrompt>) -> Option<String> {
    let text = system.and_then(SystemPrompt::normalized_text)?;
    let stripped = strip_system_reminders(&text);
    if stripped.is_empty() {
        return None;
    }
    Some(sha256_hex(stripped.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageContent;

    fn user(text: &str) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    fn user_blocks(blocks: Vec<ContentBlock>) -> Message {
        Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }

    #[test]
    fn stable_under_string_vs_block_form() {
        let a = vec![user("hello there")];
        let b = vec![user_blocks(vec![ContentBlock::Text {
            text: "hello there".to_string(),
            cache_control: None,
        }])];
        assert_eq!(hash_messages(&a), hash_messages(&b));
    }

    #[test]
    fn stable_under_system_reminder_injection() {
        let a = vec![user("hello there")];
        let b = vec![user(
            "hello <system-reminder>ephemeral instructions</system-reminder>there",
        )];
        assert_eq!(hash_messages(&a), hash_messages(&b));
    }

    #[test]
    fn different_content_hashes_differ() {
        let a = vec![user("hello")];
        let b = vec![user("goodbye")];
        assert_ne!(hash_messages(&a), hash_messages(&b));
    }

    #[test]
    fn dedups_adjacent_identical_tool_results() {
        let block = ContentBlock::ToolResult {
            tool_use_id: "t1".to_string(),
            content: Some(serde_json::json!("output")),
            is_error: None,
        };
        let with_dup = vec![user_blocks(vec![block.clone(), block.clone()])];
        let without_dup = vec![user_blocks(vec![block])];
        assert_eq!(hash_messages(&with_dup), hash_messages(&without_dup));
    }

    #[test]
    fn empty_system_prompt_hashes_to_none() {
        assert_eq!(hash_system_prompt(None), None);
        assert_eq!(
            hash_system_prompt(Some(&SystemPrompt::Text(String::new()))),
            None
        );
    }

    #[test]
    fn system_prompt_strips_cache_control_and_concatenates() {
        let a = SystemPrompt::Blocks(vec![
            crate::model::SystemBlock {
                block_type: "text".to_string(),
                text: "part one ".to_string(),
                cache_control: Some(serde_json::json!({"type": "ephemeral"})),
            },
            crate::model::SystemBlock {
                block_type: "text".to_string(),
                text: "part two".to_string(),
                cache_control: None,
            },
        ]);
        let b = SystemPrompt::Text("part one part two".to_string());
        assert_eq!(hash_system_prompt(Some(&a)), hash_system_prompt(Some(&b)));
    }
}
