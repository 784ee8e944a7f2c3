// src/analysis/prompt.rs
// Build the analysis model prompt: the truncated, redacted conversation
// followed by a fixed instruction asking for the declared JSON schema
// (spec.md §4.7 step 3).

use super::model::ConversationTurn;
use super::redact::{delimit_untrusted_content, redact_pii};

pub const SCHEMA_INSTRUCTION: &str = r#"Analyze the conversation above and respond with a single JSON object only, no prose before or after, matching exactly this shape:
{
  "summary": string,
  "key_topics": string[],
  "sentiment": "positive" | "neutral" | "negative" | "mixed",
  "user_intent": string,
  "outcomes": string[],
  "action_items": [{"type": string, "description": string, "priority"?: string}],
  "prompting_tips": [{"category": string, "issue": string, "suggestion": string, "example"?: string}],
  "interaction_patterns": {
    "prompt_clarity": number (0-10),
    "context_completeness": number (0-10),
    "follow_up_effectiveness": number (0-10),
    "common_issues": string[],
    "strengths": string[]
  },
  "technical_details": {
    "frameworks": string[],
    "issues": string[],
    "solutions": string[],
    "tool_usage_efficiency"?: string,
    "context_window_management"?: string
  },
  "conversation_quality": {
    "clarity": number (0-10),
    "completeness": number (0-10),
    "effectiveness": number (0-10),
    "improvement": string[]
  }
}"#;

/// Build the multi-turn prompt text sent to the analysis model: each turn
/// redacted and wrapped as untrusted content, followed by an optional
/// custom prompt and the fixed schema instruction.
pub fn build_prompt(turns: &[ConversationTurn], custom_prompt: Option<&str>) -> String {
    let mut out = String::new();
    for turn in turns {
        let redacted = redact_pii(&turn.content);
        out.push_str(&format!("[{}]\n{}\n\n", turn.role, delimit_untrusted_content(&redacted)));
    }

    if let Some(custom) = custom_prompt {
        out.push_str("Additional instructions from the requester (apply on top of the default analysis):\n");
        out.push_str(custom);
        out.push_str("\n\n");
    }

    out.push_str(SCHEMA_INSTRUCTION);
    out
}

/// Strip a leading/trailing triple-backtick fence (optionally with a `json`
/// language tag) before parsing the model's output (spec.md §4.7 step 5).
pub fn strip_json_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\n', '\r']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_prompt_with_schema_instruction() {
        let turns = vec![ConversationTurn {
            role: "user".into(),
            content: "hello".into(),
        }];
        let prompt = build_prompt(&turns, None);
        assert!(prompt.contains("hello"));
        assert!(prompt.contains("\"summary\""));
    }

    #[test]
    fn includes_custom_prompt_when_present() {
        let prompt = build_prompt(&[], Some("focus on tone"));
        assert!(prompt.contains("focus on tone"));
    }

    #[test]
    fn strips_json_fence_with_language_tag() {
        let text = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_json_fence(text), "{\"a\":1}");
    }

    #[test]
    fn strips_bare_fence() {
        let text = "```\n{\"a\":1}\n```";
        assert_eq!(strip_json_fence(text), "{\"a\":1}");
    }

    #[test]
    fn leaves_unfenced_text_unchanged() {
        let text = "{\"a\":1}";
        assert_eq!(strip_json_fence(text), "{\"a\":1}");
    }
}
