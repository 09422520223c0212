use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::bson_time;
use super::question::SubmittedAnswer;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Completed,
    TimedOut,
    ManuallyGraded,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Completed => "completed",
            AttemptStatus::TimedOut => "timed_out",
            AttemptStatus::ManuallyGraded => "manually_graded",
        }
    }
}

/// One answer slot of an attempt. `answer` stays `None` until the student submits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerRecord {
    pub question_id: String,
    #[serde(default)]
    pub answer: Option<SubmittedAnswer>,
    /// `None` while a short answer waits for a grader
    #[serde(default)]
    pub is_correct: Option<bool>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub graded_by: Option<String>,
    #[serde(default)]
    pub feedback: String,
}

impl AnswerRecord {
    pub fn placeholder(question_id: &str) -> Self {
        Self {
            question_id: question_id.to_string(),
            answer: None,
            is_correct: None,
            score: 0.0,
            graded_by: None,
            feedback: String::new(),
        }
    }
}

/// Attempt document stored in the "quiz_attempts" collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub user_id: String,
    pub quiz_id: String,
    #[serde(with = "bson_time::required")]
    pub start_time: DateTime<Utc>,
    #[serde(default, with = "bson_time::optional")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: i64,
    pub answers: Vec<AnswerRecord>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default)]
    pub passed: bool,
    pub status: AttemptStatus,
    /// 1-based, per user and quiz
    pub attempt_number: u32,
    /// Bumped on every persisted change; guards compare-and-swap writes
    #[serde(default)]
    pub revision: i64,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub percentage: f64,
    pub passed: bool,
    pub correct_count: u32,
    pub total_questions: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AnswerSubmission {
    #[validate(length(min = 1, message = "question_id must not be empty"))]
    pub question_id: String,
    pub answer: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitAttemptRequest {
    #[validate(nested)]
    pub answers: Vec<AnswerSubmission>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct GradeAnswerRequest {
    #[validate(range(min = 0.0, message = "score must not be negative"))]
    pub score: f64,
    pub correct: bool,
    #[validate(length(max = 2000, message = "feedback is limited to 2000 characters"))]
    pub feedback: Option<String>,
}

/// Attempt as returned to API clients
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub id: String,
    pub user_id: String,
    pub quiz_id: String,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub score: f64,
    pub percentage: f64,
    pub passed: bool,
    pub answers: Vec<AnswerRecord>,
}

impl From<Attempt> for AttemptView {
    fn from(attempt: Attempt) -> Self {
        AttemptView {
            id: attempt.id,
            user_id: attempt.user_id,
            quiz_id: attempt.quiz_id,
            attempt_number: attempt.attempt_number,
            status: attempt.status,
            start_time: attempt.start_time,
            end_time: attempt.end_time,
            duration_seconds: attempt.duration_seconds,
            score: attempt.score,
            percentage: attempt.percentage,
            passed: attempt.passed,
            answers: attempt.answers,
        }
    }
}
