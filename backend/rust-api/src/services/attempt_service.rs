use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::notifier::Notifier;
use super::{with_conflict_retry, AppState};
use crate::error::{CoreError, CoreResult, PolicyCode};
use crate::grading::lifecycle::{self, Deadline};
use crate::grading::scorer;
use crate::metrics::{self, ATTEMPTS_FINISHED_TOTAL, ATTEMPTS_STARTED_TOTAL};
use crate::models::attempt::{AnswerSubmission, GradeAnswerRequest};
use crate::models::{
    Attempt, AttemptStatus, NotificationEvent, NotifyTarget, Question, Quiz, ScoreResult,
    UserRole,
};
use crate::stores::{AttemptStore, InsertOutcome, QuizStore};

/// Drives attempts through start, submit and manual grading.
pub struct QuizAttemptService {
    quizzes: Arc<dyn QuizStore>,
    attempts: Arc<dyn AttemptStore>,
    notifier: Arc<dyn Notifier>,
}

impl QuizAttemptService {
    pub fn new(state: &AppState) -> Self {
        Self {
            quizzes: state.quizzes.clone(),
            attempts: state.attempts.clone(),
            notifier: state.notifier.clone(),
        }
    }

    pub async fn start_attempt(&self, user_id: &str, quiz_id: &str) -> CoreResult<Attempt> {
        self.start_attempt_at(user_id, quiz_id, Utc::now()).await
    }

    pub async fn start_attempt_at(
        &self,
        user_id: &str,
        quiz_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Attempt> {
        let quiz = self.load_quiz(quiz_id).await?;
        let quiz = &quiz;

        let attempt = with_conflict_retry("attempt", quiz_id, move || {
            self.try_start(user_id, quiz, now)
        })
        .await?;

        ATTEMPTS_STARTED_TOTAL.inc();
        tracing::info!(
            "Attempt started: id={}, user={}, quiz={}, number={}",
            attempt.id,
            user_id,
            quiz_id,
            attempt.attempt_number
        );
        Ok(attempt)
    }

    async fn try_start(
        &self,
        user_id: &str,
        quiz: &Quiz,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Attempt>> {
        let existing = self.attempts.count_attempts(user_id, &quiz.id).await?;
        let number = lifecycle::check_start(quiz, existing)?;
        let attempt = lifecycle::open_attempt(user_id, quiz, number, now);

        match self.attempts.insert_attempt(&attempt).await? {
            InsertOutcome::Inserted => Ok(Some(attempt)),
            InsertOutcome::Duplicate => Ok(None),
        }
    }

    pub async fn submit_attempt(
        &self,
        attempt_id: &str,
        user_id: &str,
        submissions: &[AnswerSubmission],
    ) -> CoreResult<ScoreResult> {
        self.submit_attempt_at(attempt_id, user_id, submissions, Utc::now())
            .await
    }

    pub async fn submit_attempt_at(
        &self,
        attempt_id: &str,
        user_id: &str,
        submissions: &[AnswerSubmission],
        now: DateTime<Utc>,
    ) -> CoreResult<ScoreResult> {
        let outcome = with_conflict_retry("attempt", attempt_id, move || {
            self.try_submit(attempt_id, user_id, submissions, now)
        })
        .await?;

        match outcome {
            Submission::Scored(attempt, result) => {
                ATTEMPTS_FINISHED_TOTAL
                    .with_label_values(&[attempt.status.as_str()])
                    .inc();
                for record in &attempt.answers {
                    metrics::record_answer_graded(record.is_correct);
                }
                tracing::info!(
                    "Attempt submitted: id={}, score={}, percentage={:.1}, passed={}",
                    attempt.id,
                    result.score,
                    result.percentage,
                    result.passed
                );
                Ok(result)
            }
            Submission::TimedOut(attempt) => {
                ATTEMPTS_FINISHED_TOTAL
                    .with_label_values(&[attempt.status.as_str()])
                    .inc();
                tracing::info!(
                    "Attempt timed out on submit: id={}, duration={}s",
                    attempt.id,
                    attempt.duration_seconds
                );
                self.notifier
                    .notify(
                        NotifyTarget::User(attempt.user_id.clone()),
                        NotificationEvent::AttemptTimedOut {
                            attempt_id: attempt.id.clone(),
                            quiz_id: attempt.quiz_id.clone(),
                        },
                    )
                    .await;
                Err(CoreError::policy(
                    PolicyCode::AttemptTimedOut,
                    format!("Time limit exceeded for attempt {}", attempt.id),
                ))
            }
        }
    }

    async fn try_submit(
        &self,
        attempt_id: &str,
        user_id: &str,
        submissions: &[AnswerSubmission],
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Submission>> {
        let mut attempt = self.load_attempt(attempt_id).await?;
        lifecycle::ensure_owner(&attempt, user_id)?;
        lifecycle::ensure_in_progress(&attempt)?;

        let quiz = self.load_quiz(&attempt.quiz_id).await?;
        let expected_revision = attempt.revision;

        if lifecycle::check_deadline(&attempt, &quiz, now) == Deadline::Expired {
            lifecycle::expire(&mut attempt, now);
            attempt.revision += 1;
            attempt.updated_at = now;
            let stored = self
                .attempts
                .replace_attempt_if(&attempt, AttemptStatus::InProgress, expected_revision)
                .await?;
            return Ok(stored.then_some(Submission::TimedOut(attempt)));
        }

        let questions = self.load_questions(&quiz).await?;
        lifecycle::merge_answers(&mut attempt, submissions, &questions);
        let result = scorer::score(&mut attempt, &quiz, &questions, now);
        attempt.revision += 1;
        attempt.updated_at = now;

        let stored = self
            .attempts
            .replace_attempt_if(&attempt, AttemptStatus::InProgress, expected_revision)
            .await?;
        Ok(stored.then_some(Submission::Scored(attempt, result)))
    }

    /// Grader correction of one short-answer item.
    pub async fn grade_answer(
        &self,
        attempt_id: &str,
        grader_id: &str,
        question_id: &str,
        request: &GradeAnswerRequest,
    ) -> CoreResult<Attempt> {
        self.grade_answer_at(attempt_id, grader_id, question_id, request, Utc::now())
            .await
    }

    pub async fn grade_answer_at(
        &self,
        attempt_id: &str,
        grader_id: &str,
        question_id: &str,
        request: &GradeAnswerRequest,
        now: DateTime<Utc>,
    ) -> CoreResult<Attempt> {
        let attempt = with_conflict_retry("attempt", attempt_id, move || {
            self.try_grade(attempt_id, grader_id, question_id, request, now)
        })
        .await?;

        metrics::record_answer_graded(Some(request.correct));
        tracing::info!(
            "Answer graded: attempt={}, question={}, grader={}, score={}",
            attempt_id,
            question_id,
            grader_id,
            request.score
        );

        self.notifier
            .notify(
                NotifyTarget::User(attempt.user_id.clone()),
                NotificationEvent::AttemptGraded {
                    attempt_id: attempt.id.clone(),
                    score: attempt.score,
                    passed: attempt.passed,
                },
            )
            .await;

        Ok(attempt)
    }

    async fn try_grade(
        &self,
        attempt_id: &str,
        grader_id: &str,
        question_id: &str,
        request: &GradeAnswerRequest,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Attempt>> {
        let mut attempt = self.load_attempt(attempt_id).await?;
        let expected_status = attempt.status;
        let expected_revision = attempt.revision;

        if !matches!(
            expected_status,
            AttemptStatus::Completed | AttemptStatus::ManuallyGraded
        ) {
            return Err(CoreError::policy(
                PolicyCode::AttemptNotGradable,
                format!(
                    "Attempt {} cannot be graded while {}",
                    attempt.id,
                    expected_status.as_str()
                ),
            ));
        }

        let question = self
            .quizzes
            .find_question(question_id)
            .await?
            .ok_or_else(|| CoreError::not_found("question", question_id))?;
        if !question.question_type.requires_manual_grading() {
            return Err(CoreError::policy(
                PolicyCode::QuestionNotManuallyGraded,
                format!(
                    "Question {} is {} and graded automatically",
                    question_id,
                    question.question_type.as_str()
                ),
            ));
        }
        if request.score < 0.0 || request.score > question.score {
            return Err(CoreError::validation(format!(
                "score must be between 0 and {}",
                question.score
            )));
        }

        let record = attempt
            .answers
            .iter_mut()
            .find(|r| r.question_id == question_id)
            .ok_or_else(|| CoreError::not_found("answer", format!("{}/{}", attempt_id, question_id)))?;
        record.score = request.score;
        record.is_correct = Some(request.correct);
        record.graded_by = Some(grader_id.to_string());
        if let Some(feedback) = &request.feedback {
            record.feedback = feedback.clone();
        }

        let quiz = self.load_quiz(&attempt.quiz_id).await?;
        let questions = self.load_questions(&quiz).await?;
        scorer::score(&mut attempt, &quiz, &questions, now);
        lifecycle::mark_manually_graded(&mut attempt)?;
        attempt.revision += 1;
        attempt.updated_at = now;

        let stored = self
            .attempts
            .replace_attempt_if(&attempt, expected_status, expected_revision)
            .await?;
        Ok(stored.then_some(attempt))
    }

    /// Owner or grader read.
    pub async fn get_attempt(
        &self,
        attempt_id: &str,
        user_id: &str,
        role: UserRole,
    ) -> CoreResult<Attempt> {
        let attempt = self.load_attempt(attempt_id).await?;
        if !role.can_grade() {
            lifecycle::ensure_owner(&attempt, user_id)?;
        }
        Ok(attempt)
    }

    async fn load_attempt(&self, attempt_id: &str) -> CoreResult<Attempt> {
        self.attempts
            .find_attempt(attempt_id)
            .await?
            .ok_or_else(|| CoreError::not_found("attempt", attempt_id))
    }

    async fn load_quiz(&self, quiz_id: &str) -> CoreResult<Quiz> {
        self.quizzes
            .find_quiz(quiz_id)
            .await?
            .ok_or_else(|| CoreError::not_found("quiz", quiz_id))
    }

    async fn load_questions(&self, quiz: &Quiz) -> CoreResult<HashMap<String, Question>> {
        let questions = self.quizzes.find_questions(&quiz.questions).await?;
        Ok(questions.into_iter().map(|q| (q.id.clone(), q)).collect())
    }
}

enum Submission {
    Scored(Attempt, ScoreResult),
    TimedOut(Attempt),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Difficulty, QuestionOption, QuestionType, QuizStatus};
    use crate::services::test_support;
    use crate::stores::MemoryStore;
    use chrono::Duration;
    use serde_json::json;

    fn quiz(max_attempts: u32, allow_reattempt: bool) -> Quiz {
        Quiz {
            id: "quiz-1".to_string(),
            course_id: "course-1".to_string(),
            title: "Ownership basics".to_string(),
            description: String::new(),
            time_limit_minutes: 30,
            passing_score: 60.0,
            questions: vec!["q1".to_string(), "q2".to_string(), "q3".to_string()],
            difficulty: Difficulty::Beginner,
            status: QuizStatus::Published,
            allow_reattempt,
            max_attempts,
            show_answers: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn single_choice(id: &str, correct: usize) -> Question {
        Question {
            id: id.to_string(),
            quiz_id: "quiz-1".to_string(),
            text: id.to_string(),
            question_type: QuestionType::SingleChoice,
            options: (0..3)
                .map(|i| QuestionOption {
                    text: format!("option {}", i),
                    is_correct: i == correct,
                })
                .collect(),
            correct_answer: None,
            explanation: String::new(),
            score: 1.0,
            difficulty: Difficulty::Beginner,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn short_answer(id: &str, score: f64) -> Question {
        Question {
            question_type: QuestionType::ShortAnswer,
            options: vec![],
            score,
            ..single_choice(id, 0)
        }
    }

    async fn seeded(max_attempts: u32, allow_reattempt: bool) -> (QuizAttemptService, Arc<MemoryStore>) {
        let (state, store) = test_support::state();
        store.insert_quiz(quiz(max_attempts, allow_reattempt)).await;
        store.insert_question(single_choice("q1", 0)).await;
        store.insert_question(single_choice("q2", 1)).await;
        store.insert_question(short_answer("q3", 2.0)).await;
        (QuizAttemptService::new(&state), store)
    }

    fn answers(pairs: &[(&str, serde_json::Value)]) -> Vec<AnswerSubmission> {
        pairs
            .iter()
            .map(|(q, a)| AnswerSubmission {
                question_id: q.to_string(),
                answer: a.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn attempts_are_numbered_until_the_limit() {
        let (service, _) = seeded(2, true).await;

        let first = service.start_attempt("u1", "quiz-1").await.unwrap();
        let second = service.start_attempt("u1", "quiz-1").await.unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(second.attempt_number, 2);

        let err = service.start_attempt("u1", "quiz-1").await.unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::MaxAttemptsReached));
    }

    #[tokio::test]
    async fn unknown_quiz_is_not_found() {
        let (service, _) = seeded(2, true).await;
        let err = service.start_attempt("u1", "missing").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "quiz", .. }));
    }

    #[tokio::test]
    async fn submission_scores_and_completes() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();

        let result = service
            .submit_attempt(
                &attempt.id,
                "u1",
                &answers(&[("q1", json!(0)), ("q2", json!(1)), ("q3", json!("an essay"))]),
            )
            .await
            .unwrap();

        assert_eq!(result.score, 2.0);
        assert_eq!(result.percentage, 50.0);
        assert!(!result.passed);
        assert_eq!(result.correct_count, 2);

        let stored = service
            .get_attempt(&attempt.id, "u1", UserRole::Student)
            .await
            .unwrap();
        assert_eq!(stored.status, AttemptStatus::Completed);
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn second_submission_is_rejected() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();
        let payload = answers(&[("q1", json!(0))]);

        service.submit_attempt(&attempt.id, "u1", &payload).await.unwrap();
        let err = service
            .submit_attempt(&attempt.id, "u1", &payload)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptNotInProgress));
    }

    #[tokio::test]
    async fn concurrent_submissions_score_once() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();
        let payload = answers(&[("q1", json!(0)), ("q2", json!(1))]);

        let (a, b) = tokio::join!(
            service.submit_attempt(&attempt.id, "u1", &payload),
            service.submit_attempt(&attempt.id, "u1", &payload)
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let stored = service
            .get_attempt(&attempt.id, "u1", UserRole::Student)
            .await
            .unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.score, 2.0);
    }

    #[tokio::test]
    async fn submission_at_exact_time_limit_is_scored() {
        let (service, _) = seeded(3, true).await;
        let start = Utc::now() - Duration::hours(1);
        let attempt = service.start_attempt_at("u1", "quiz-1", start).await.unwrap();

        let result = service
            .submit_attempt_at(
                &attempt.id,
                "u1",
                &answers(&[("q1", json!(0))]),
                start + Duration::minutes(30),
            )
            .await
            .unwrap();
        assert_eq!(result.score, 1.0);
    }

    #[tokio::test]
    async fn late_submission_times_out_without_scoring() {
        let (service, _) = seeded(3, true).await;
        let start = Utc::now() - Duration::hours(1);
        let attempt = service.start_attempt_at("u1", "quiz-1", start).await.unwrap();

        let err = service
            .submit_attempt_at(
                &attempt.id,
                "u1",
                &answers(&[("q1", json!(0)), ("q2", json!(1))]),
                start + Duration::minutes(30) + Duration::milliseconds(1),
            )
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptTimedOut));

        let stored = service
            .get_attempt(&attempt.id, "u1", UserRole::Student)
            .await
            .unwrap();
        assert_eq!(stored.status, AttemptStatus::TimedOut);
        assert_eq!(stored.score, 0.0);
        assert!(stored.answers.iter().all(|a| a.answer.is_none()));
        assert!(stored.end_time.is_some());
    }

    #[tokio::test]
    async fn other_users_cannot_submit_or_read() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();

        let err = service
            .submit_attempt(&attempt.id, "u2", &[])
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptNotOwned));

        let err = service
            .get_attempt(&attempt.id, "u2", UserRole::Student)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptNotOwned));

        assert!(service
            .get_attempt(&attempt.id, "t1", UserRole::Teacher)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn grading_short_answer_rescores_attempt() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();
        service
            .submit_attempt(
                &attempt.id,
                "u1",
                &answers(&[("q1", json!(0)), ("q2", json!(1)), ("q3", json!("essay"))]),
            )
            .await
            .unwrap();

        let graded = service
            .grade_answer(
                &attempt.id,
                "teacher-1",
                "q3",
                &GradeAnswerRequest {
                    score: 1.5,
                    correct: true,
                    feedback: Some("Good argument".to_string()),
                },
            )
            .await
            .unwrap();

        assert_eq!(graded.status, AttemptStatus::ManuallyGraded);
        assert_eq!(graded.score, 3.5);
        assert_eq!(graded.percentage, 87.5);
        assert!(graded.passed);
        let record = graded.answers.iter().find(|r| r.question_id == "q3").unwrap();
        assert_eq!(record.graded_by.as_deref(), Some("teacher-1"));
        assert_eq!(record.feedback, "Good argument");
    }

    #[tokio::test]
    async fn grading_rejects_auto_graded_and_out_of_range() {
        let (service, _) = seeded(3, true).await;
        let attempt = service.start_attempt("u1", "quiz-1").await.unwrap();

        let request = GradeAnswerRequest {
            score: 1.0,
            correct: true,
            feedback: None,
        };
        let err = service
            .grade_answer(&attempt.id, "t1", "q3", &request)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptNotGradable));

        service
            .submit_attempt(&attempt.id, "u1", &answers(&[("q3", json!("x"))]))
            .await
            .unwrap();

        let err = service
            .grade_answer(&attempt.id, "t1", "q1", &request)
            .await
            .unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::QuestionNotManuallyGraded));

        let too_high = GradeAnswerRequest {
            score: 5.0,
            correct: true,
            feedback: None,
        };
        let err = service
            .grade_answer(&attempt.id, "t1", "q3", &too_high)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
