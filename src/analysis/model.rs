// src/analysis/model.rs
// Analysis job and structured-output schema types (spec.md §3 Analysis job,
// §4.7 step 3 output schema).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub custom_prompt: Option<String>,
    pub analysis_result: Option<serde_json::Value>,
    pub model_used: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub error_text: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single message handed to the analysis worker after merging request
/// bodies with their responses (spec.md §4.7 step 1).
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// The declared output schema for the analysis model (spec.md §4.7 step
/// 3). Deserialized from the model's JSON output and validated before
/// being persisted as `analysis_result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub summary: String,
    pub key_topics: Vec<String>,
    pub sentiment: Sentiment,
    pub user_intent: String,
    pub outcomes: Vec<String>,
    pub action_items: Vec<ActionItem>,
    pub prompting_tips: Vec<PromptingTip>,
    pub interaction_patterns: InteractionPatterns,
    pub technical_details: TechnicalDetails,
    pub conversation_quality: ConversationQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptingTip {
    pub category: String,
    pub issue: String,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionPatterns {
    pub prompt_clarity: u8,
    pub context_completeness: u8,
    pub follow_up_effectiveness: u8,
    #[serde(default)]
    pub common_issues: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalDetails {
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub solutions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_usage_efficiency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_management: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationQuality {
    pub clarity: u8,
    pub completeness: u8,
    pub effectiveness: u8,
    #[serde(default)]
    pub improvement: Vec<String>,
}

/// Validate the `0..=10` rating fields the schema declares (spec.md §4.7
/// step 3 / step 5 "validate against the declared schema").
pub fn validate_result(result: &AnalysisResult) -> Result<(), String> {
    let ratings = [
        ("interaction_patterns.prompt_clarity", result.interaction_patterns.prompt_clarity),
        (
            "interaction_patterns.context_completeness",
            result.interaction_patterns.context_completeness,
        ),
        (
            "interaction_patterns.follow_up_effectiveness",
            result.interaction_patterns.follow_up_effectiveness,
        ),
        ("conversation_quality.clarity", result.conversation_quality.clarity),
        ("conversation_quality.completeness", result.conversation_quality.completeness),
        ("conversation_quality.effectiveness", result.conversation_quality.effectiveness),
    ];
    for (field, value) in ratings {
        if value > 10 {
            return Err(format!("{field} must be within 0..=10, got {value}"));
        }
    }
    if result.summary.trim().is_empty() {
        return Err("summary must not be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_result() -> AnalysisResult {
        AnalysisResult {
            summary: "discussed a refactor".into(),
            key_topics: vec!["rust".into()],
            sentiment: Sentiment::Neutral,
            user_intent: "refactor a module".into(),
            outcomes: vec!["completed".into()],
            action_items: vec![],
            prompting_tips: vec![],
            interaction_patterns: InteractionPatterns {
                prompt_clarity: 8,
                context_completeness: 7,
                follow_up_effectiveness: 9,
                common_issues: vec![],
                strengths: vec![],
            },
            technical_details: TechnicalDetails {
                frameworks: vec![],
                issues: vec![],
                solutions: vec![],
                tool_usage_efficiency: None,
                context_window_management: None,
            },
            conversation_quality: ConversationQuality {
                clarity: 8,
                completeness: 8,
                effectiveness: 8,
                improvement: vec![],
            },
        }
    }

    #[test]
    fn accepts_well_formed_result() {
        assert!(validate_result(&valid_result()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_rating() {
        let mut result = valid_result();
        result.interaction_patterns.prompt_clarity = 11;
        assert!(validate_result(&result).is_err());
    }

    #[test]
    fn rejects_empty_summary() {
        let mut result = valid_result();
        result.summary = "  ".into();
        assert!(validate_result(&result).is_err());
    }
}
