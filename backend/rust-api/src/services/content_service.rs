use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use super::{with_conflict_retry, AppState};
use crate::error::{CoreError, CoreResult, PolicyCode};
use crate::models::{Quiz, QuizStatus};
use crate::stores::QuizStore;

const PUBLISHABLE: [QuizStatus; 2] = [QuizStatus::Draft, QuizStatus::Pending];

pub struct ContentService {
    quizzes: Arc<dyn QuizStore>,
}

impl ContentService {
    pub fn new(state: &AppState) -> Self {
        Self {
            quizzes: state.quizzes.clone(),
        }
    }

    pub async fn publish_quiz(&self, quiz_id: &str) -> CoreResult<Quiz> {
        self.publish_quiz_at(quiz_id, Utc::now()).await
    }

    /// Moves a draft or pending quiz to `published` once every question passes validation.
    pub async fn publish_quiz_at(&self, quiz_id: &str, now: DateTime<Utc>) -> CoreResult<Quiz> {
        let quiz = with_conflict_retry("quiz", quiz_id, move || self.try_publish(quiz_id, now))
            .await?;

        tracing::info!(
            "Quiz published: id={}, questions={}",
            quiz.id,
            quiz.questions.len()
        );
        Ok(quiz)
    }

    async fn try_publish(&self, quiz_id: &str, now: DateTime<Utc>) -> CoreResult<Option<Quiz>> {
        let mut quiz = self
            .quizzes
            .find_quiz(quiz_id)
            .await?
            .ok_or_else(|| CoreError::not_found("quiz", quiz_id))?;

        if !PUBLISHABLE.contains(&quiz.status) {
            return Err(CoreError::policy(
                PolicyCode::QuizNotPublishable,
                format!(
                    "Quiz {} is {}, only draft or pending quizzes can be published",
                    quiz_id,
                    quiz.status.as_str()
                ),
            ));
        }
        quiz.validate()?;
        self.check_questions(&quiz).await?;

        if !self
            .quizzes
            .set_quiz_status(quiz_id, &PUBLISHABLE, QuizStatus::Published, now)
            .await?
        {
            return Ok(None);
        }

        quiz.status = QuizStatus::Published;
        quiz.updated_at = now;
        Ok(Some(quiz))
    }

    async fn check_questions(&self, quiz: &Quiz) -> CoreResult<()> {
        if quiz.questions.is_empty() {
            return Err(CoreError::validation(format!(
                "quiz {} has no questions",
                quiz.id
            )));
        }

        let questions = self.quizzes.find_questions(&quiz.questions).await?;
        let found: HashSet<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        if let Some(missing) = quiz.questions.iter().find(|id| !found.contains(id.as_str())) {
            return Err(CoreError::validation(format!(
                "quiz {} references missing question {}",
                quiz.id, missing
            )));
        }

        questions.iter().try_for_each(|q| q.validate())
    }
}
