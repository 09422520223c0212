use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::bson_time;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    SingleChoice,
    MultiChoice,
    TrueFalse,
    FillBlank,
    ShortAnswer,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::SingleChoice => "single_choice",
            QuestionType::MultiChoice => "multi_choice",
            QuestionType::TrueFalse => "true_false",
            QuestionType::FillBlank => "fill_blank",
            QuestionType::ShortAnswer => "short_answer",
        }
    }

    pub fn is_choice(&self) -> bool {
        matches!(self, QuestionType::SingleChoice | QuestionType::MultiChoice)
    }

    pub fn requires_manual_grading(&self) -> bool {
        matches!(self, QuestionType::ShortAnswer)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionOption {
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}

/// Question document stored in the "questions" collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    #[serde(rename = "_id")]
    pub id: String,
    pub quiz_id: String,
    pub text: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub explanation: String,
    /// Score weight, must be positive
    pub score: f64,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

impl Question {
    /// Checks the per-type shape rules a question must satisfy before its quiz can be published.
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.score.is_finite() && self.score > 0.0) {
            return Err(CoreError::validation(format!(
                "question {} must have a positive score weight",
                self.id
            )));
        }

        if self.question_type.is_choice() {
            if self.options.len() < 2 {
                return Err(CoreError::validation(format!(
                    "question {} needs at least two options",
                    self.id
                )));
            }
            if !self.options.iter().any(|o| o.is_correct) {
                return Err(CoreError::validation(format!(
                    "question {} needs at least one correct option",
                    self.id
                )));
            }
        }

        if matches!(
            self.question_type,
            QuestionType::TrueFalse | QuestionType::FillBlank
        ) && self
            .correct_answer
            .as_deref()
            .map(|a| a.trim().is_empty())
            .unwrap_or(true)
        {
            return Err(CoreError::validation(format!(
                "question {} needs a non-empty correct answer",
                self.id
            )));
        }

        Ok(())
    }

    /// Index of the first option flagged correct.
    pub fn correct_option_index(&self) -> Option<u32> {
        self.options
            .iter()
            .position(|o| o.is_correct)
            .map(|idx| idx as u32)
    }

    pub fn correct_option_set(&self) -> BTreeSet<u32> {
        self.options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_correct)
            .map(|(idx, _)| idx as u32)
            .collect()
    }
}

/// Answer value after it has been checked against the shape its question type expects.
///
/// Raw payloads that do not fit are kept as `Malformed` so the attempt still records
/// what was sent, and the evaluator scores them as incorrect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SubmittedAnswer {
    Choice(u32),
    Choices(Vec<u32>),
    Text(String),
    Malformed(serde_json::Value),
}

impl SubmittedAnswer {
    pub fn from_json(question_type: QuestionType, raw: &serde_json::Value) -> Self {
        let parsed = match question_type {
            QuestionType::SingleChoice => as_index(raw).map(SubmittedAnswer::Choice),
            QuestionType::MultiChoice => raw.as_array().and_then(|items| {
                let indices: Option<Vec<u32>> = items.iter().map(as_index).collect();
                // repeated indices are not a set
                indices.filter(|idx| idx.iter().collect::<BTreeSet<_>>().len() == idx.len())
            })
            .map(SubmittedAnswer::Choices),
            QuestionType::TrueFalse | QuestionType::FillBlank | QuestionType::ShortAnswer => raw
                .as_str()
                .map(|text| SubmittedAnswer::Text(text.to_string())),
        };

        parsed.unwrap_or_else(|| SubmittedAnswer::Malformed(raw.clone()))
    }
}

fn as_index(value: &serde_json::Value) -> Option<u32> {
    value.as_u64().and_then(|v| u32::try_from(v).ok())
}
