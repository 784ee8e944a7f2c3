// src/analysis/truncate.rs
// Truncate a conversation to fit the analysis model's token budget
// (spec.md §4.7 step 2). A local heuristic stands in for a real tokenizer
// since the budget only needs to be approximately respected.

use super::model::ConversationTurn;

/// General-purpose token estimate: ~4 characters per token, the common
/// rule-of-thumb ratio for English text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn turns_tokens(turns: &[ConversationTurn]) -> usize {
    turns.iter().map(|t| estimate_tokens(&t.content)).sum()
}

pub const TRUNCATION_BOUNDARY_MARKER: &str = "[…conversation truncated…]";
const SINGLE_MESSAGE_TRUNCATION_SUFFIX: &str = "…[CONTENT TRUNCATED]…";
/// Literal heuristic from spec.md §4.7 step 2 for truncating a single
/// surviving message's text character-wise: ~12 chars/token.
const CHARS_PER_TOKEN_FOR_SINGLE_MESSAGE: usize = 12;

/// Truncate `turns` to fit within `budget_tokens`, keeping `head` messages
/// from the start and `tail` messages from the end (spec.md §4.7 step 2).
pub fn truncate_to_budget(
    turns: Vec<ConversationTurn>,
    budget_tokens: usize,
    head: usize,
    tail: usize,
) -> Vec<ConversationTurn> {
    if turns_tokens(&turns) <= budget_tokens {
        return turns;
    }

    if turns.len() <= head + tail {
        // Nothing to drop; fall through to the tail-fitting logic below with
        // the full set treated as "tail".
        return fit_tail(turns, budget_tokens);
    }

    let head_msgs: Vec<ConversationTurn> = turns[..head].to_vec();
    let tail_msgs: Vec<ConversationTurn> = turns[turns.len() - tail..].to_vec();

    let mut fitted_tail = fit_tail(tail_msgs, budget_tokens.saturating_sub(turns_tokens(&head_msgs)));

    let mut result = head_msgs;
    result.push(ConversationTurn {
        role: "user".to_string(),
        content: TRUNCATION_BOUNDARY_MARKER.to_string(),
    });
    result.append(&mut fitted_tail);
    result
}

/// Drop messages from the start of `tail` until it fits `budget`; if a
/// single surviving message still exceeds budget, truncate its text
/// character-wise.
fn fit_tail(mut tail: Vec<ConversationTurn>, budget: usize) -> Vec<ConversationTurn> {
    while tail.len() > 1 && turns_tokens(&tail) > budget {
        tail.remove(0);
    }

    if let Some(last) = tail.first_mut() {
        if estimate_tokens(&last.content) > budget {
            let max_chars = budget.saturating_mul(CHARS_PER_TOKEN_FOR_SINGLE_MESSAGE);
            let truncated: String = last.content.chars().take(max_chars).collect();
            last.content = format!("{truncated}{SINGLE_MESSAGE_TRUNCATION_SUFFIX}");
        }
    }

    tail
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ConversationTurn {
        ConversationTurn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn passes_through_when_within_budget() {
        let turns = vec![turn("user", "hi"), turn("assistant", "hello")];
        let out = truncate_to_budget(turns.clone(), 1_000, 5, 20);
        assert_eq!(out.len(), turns.len());
    }

    #[test]
    fn inserts_boundary_marker_when_truncating() {
        let mut turns = Vec::new();
        for i in 0..50 {
            turns.push(turn("user", &"x".repeat(1000).replace('x', &i.to_string())));
        }
        let budget = 50; // tiny budget forces truncation
        let out = truncate_to_budget(turns, budget, 2, 5);
        assert!(out.iter().any(|t| t.content == TRUNCATION_BOUNDARY_MARKER));
    }

    #[test]
    fn truncates_oversized_single_message_with_suffix() {
        let huge = turn("user", &"a".repeat(10_000));
        let out = fit_tail(vec![huge], 10);
        assert!(out[0].content.ends_with(SINGLE_MESSAGE_TRUNCATION_SUFFIX));
    }
}
