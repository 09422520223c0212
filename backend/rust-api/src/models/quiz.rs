use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::bson_time;
use crate::error::{CoreError, CoreResult};
use super::question::Difficulty;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuizStatus {
    #[default]
    Draft,
    Pending,
    Published,
    Unpublished,
}

impl QuizStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuizStatus::Draft => "draft",
            QuizStatus::Pending => "pending",
            QuizStatus::Published => "published",
            QuizStatus::Unpublished => "unpublished",
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Quiz document stored in the "quizzes" collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quiz {
    #[serde(rename = "_id")]
    pub id: String,
    pub course_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub time_limit_minutes: u32,
    /// Percentage (0-100) needed to pass
    pub passing_score: f64,
    /// Ordered question ids
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub status: QuizStatus,
    #[serde(default = "default_true")]
    pub allow_reattempt: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub show_answers: bool,
    #[serde(with = "bson_time::required")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_time::required")]
    pub updated_at: DateTime<Utc>,
}

impl Quiz {
    pub fn time_limit(&self) -> Duration {
        Duration::minutes(i64::from(self.time_limit_minutes))
    }

    pub fn accepts_attempts(&self) -> bool {
        self.status == QuizStatus::Published
    }

    /// Settings a quiz needs before students can take it.
    pub fn validate(&self) -> CoreResult<()> {
        if self.time_limit_minutes == 0 {
            return Err(CoreError::validation(format!(
                "quiz {} must have a positive time limit",
                self.id
            )));
        }
        if !(self.passing_score.is_finite() && (0.0..=100.0).contains(&self.passing_score)) {
            return Err(CoreError::validation(format!(
                "quiz {} passing score must be between 0 and 100",
                self.id
            )));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::validation(format!(
                "quiz {} must allow at least one attempt",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiz() -> Quiz {
        Quiz {
            id: "quiz-1".to_string(),
            course_id: "course-1".to_string(),
            title: "Lifetimes".to_string(),
            description: String::new(),
            time_limit_minutes: 15,
            passing_score: 60.0,
            questions: vec!["q1".to_string()],
            difficulty: Difficulty::Beginner,
            status: QuizStatus::Draft,
            allow_reattempt: true,
            max_attempts: 1,
            show_answers: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn settings_must_be_usable() {
        assert!(quiz().validate().is_ok());

        let mut q = quiz();
        q.time_limit_minutes = 0;
        assert!(q.validate().is_err());

        let mut q = quiz();
        q.passing_score = 250.0;
        assert!(q.validate().is_err());

        let mut q = quiz();
        q.passing_score = f64::NAN;
        assert!(q.validate().is_err());

        let mut q = quiz();
        q.max_attempts = 0;
        assert!(q.validate().is_err());
    }
}
