// src/model.rs
// Shared domain types: message content blocks, classification, token usage.
//
// The upstream schema is open-ended (polymorphic content blocks). Per the
// redesign guidance in spec.md §9, this is modeled as a tagged variant over
// a finite block set with a catch-all `Unknown` variant that preserves raw
// bytes so unrecognized blocks serialize back unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<Value>,
    },
    Image {
        source: Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(untagged)]
    Unknown(Value),
}

/// Message content as received: either a bare string or an array of blocks.
/// Normalized to the array form by [`Message::blocks`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    /// Normalization rule 1: a string content is treated as
    /// `[{type:"text", text:<string>}]`.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        match &self.content {
            MessageContent::Text(text) => vec![ContentBlock::Text {
                text: text.clone(),
                cache_control: None,
            }],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Concatenated text content of a message, ignoring non-text blocks.
    /// Used by the linker's single-user-message checks (quota, sub-task
    /// prompt matching, compact-continuation markers).
    pub fn text_content(&self) -> String {
        self.blocks()
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// System prompt as received: a bare string or an array of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<Value>,
}

impl SystemPrompt {
    /// Normalization rule 5: concatenate text fields in order, stripping
    /// `cache_control`, producing `None` for an absent/empty prompt.
    pub fn normalized_text(&self) -> Option<String> {
        let text = match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join(""),
        };
        if text.is_empty() { None } else { Some(text) }
    }
}

/// Request classification rule (spec.md §3): exactly one of these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClassification {
    Inference,
    QueryEvaluation,
    Quota,
}

/// Classify a request per the exact rule in spec.md §3:
/// single user message with literal content "quota" => quota;
/// system-prompt count <= 1 => query_evaluation; otherwise inference.
///
/// `system_prompt_count` is the number of distinct system-prompt text
/// segments supplied with the request (0 or 1 in the common case; some
/// upstream clients can pass more than one consecutive system block).
pub fn classify_request(
    messages: &[Message],
    system_prompt_count: usize,
) -> RequestClassification {
    if messages.len() == 1 && messages[0].role == "user" && messages[0].text_content() == "quota" {
        return RequestClassification::Quota;
    }
    if system_prompt_count <= 1 {
        return RequestClassification::QueryEvaluation;
    }
    RequestClassification::Inference
}

/// The `{input_tokens, output_tokens, cache_creation_input_tokens,
/// cache_read_input_tokens}` block returned by the upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// A `Task` tool invocation extracted from a response body, recorded on the
/// parent request row and later consulted by sub-task detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskToolInvocation {
    pub id: String,
    pub prompt: String,
}

/// Extract every `{type:"tool_use", name:"Task"}` block from a response
/// body's content array (spec.md §4.3).
pub fn extract_task_invocations(response_body: &Value) -> Vec<TaskToolInvocation> {
    let Some(content) = response_body.get("content").and_then(|c| c.as_array()) else {
        return Vec::new();
    };

    content
        .iter()
        .filter(|block| {
            block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                && block.get("name").and_then(|n| n.as_str()) == Some("Task")
        })
        .filter_map(|block| {
            let id = block.get("id")?.as_str()?.to_string();
            let prompt = block.get("input")?.get("prompt")?.as_str()?.to_string();
            Some(TaskToolInvocation { id, prompt })
        })
        .collect()
}

/// Count every `{type:"tool_use"}` block in a response body's content array,
/// used for the `tool_call_count` persisted alongside a response (spec.md
/// §4.3).
pub fn count_tool_use_blocks(response_body: &Value) -> i64 {
    let Some(content) = response_body.get("content").and_then(|c| c.as_array()) else {
        return 0;
    };
    content
        .iter()
        .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .count() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quota_request() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: MessageContent::Text("quota".to_string()),
        }];
        assert_eq!(classify_request(&messages, 0), RequestClassification::Quota);
    }

    #[test]
    fn classifies_query_evaluation_with_no_system_prompt() {
        let messages = vec![Message {
            role: "user".to_string(),
            content: MessageContent::Text("hi".to_string()),
        }];
        assert_eq!(
            classify_request(&messages, 0),
            RequestClassification::QueryEvaluation
        );
    }

    #[test]
    fn classifies_inference_with_multiple_system_prompts() {
        let messages = vec![
            Message {
                role: "user".to_string(),
                content: MessageContent::Text("hi".to_string()),
            },
            Message {
                role: "assistant".to_string(),
                content: MessageContent::Text("hello".to_string()),
            },
        ];
        assert_eq!(classify_request(&messages, 2), RequestClassification::Inference);
    }

    #[test]
    fn counts_tool_use_blocks() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "working"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
                {"type": "tool_use", "id": "t2", "name": "Task", "input": {"prompt": "x"}},
            ]
        });
        assert_eq!(count_tool_use_blocks(&body), 2);
    }

    #[test]
    fn extracts_task_invocation_from_response_body() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "working on it"},
                {"type": "tool_use", "id": "t1", "name": "Task", "input": {"prompt": "Summarize X"}},
            ]
        });
        let invocations = extract_task_invocations(&body);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].id, "t1");
        assert_eq!(invocations[0].prompt, "Summarize X");
    }
}
