//! Attempt state machine: `in_progress -> completed | timed_out`,
//! `completed -> manually_graded` (score corrections on short answers).

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult, PolicyCode};
use crate::models::attempt::AnswerSubmission;
use crate::models::{
    AnswerRecord, Attempt, AttemptStatus, Question, Quiz, SubmittedAnswer,
};

pub fn can_transition(from: AttemptStatus, to: AttemptStatus) -> bool {
    matches!(
        (from, to),
        (AttemptStatus::InProgress, AttemptStatus::Completed)
            | (AttemptStatus::InProgress, AttemptStatus::TimedOut)
            | (AttemptStatus::Completed, AttemptStatus::ManuallyGraded)
            | (AttemptStatus::ManuallyGraded, AttemptStatus::ManuallyGraded)
    )
}

/// Decides whether a user may open another attempt and returns its number.
pub fn check_start(quiz: &Quiz, existing_attempts: u32) -> CoreResult<u32> {
    if !quiz.accepts_attempts() {
        return Err(CoreError::policy(
            PolicyCode::QuizNotPublished,
            format!("Quiz {} is not published", quiz.id),
        ));
    }

    if existing_attempts > 0 && !quiz.allow_reattempt {
        return Err(CoreError::policy(
            PolicyCode::ReattemptNotAllowed,
            format!("Quiz {} does not allow another attempt", quiz.id),
        ));
    }

    if existing_attempts >= quiz.max_attempts {
        return Err(CoreError::policy(
            PolicyCode::MaxAttemptsReached,
            format!(
                "Maximum of {} attempts reached for quiz {}",
                quiz.max_attempts, quiz.id
            ),
        ));
    }

    Ok(existing_attempts + 1)
}

/// New attempt with one empty answer slot per quiz question, in quiz order.
pub fn open_attempt(
    user_id: &str,
    quiz: &Quiz,
    attempt_number: u32,
    now: DateTime<Utc>,
) -> Attempt {
    Attempt {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        quiz_id: quiz.id.clone(),
        start_time: now,
        end_time: None,
        duration_seconds: 0,
        answers: quiz
            .questions
            .iter()
            .map(|question_id| AnswerRecord::placeholder(question_id))
            .collect(),
        score: 0.0,
        percentage: 0.0,
        passed: false,
        status: AttemptStatus::InProgress,
        attempt_number,
        revision: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn ensure_owner(attempt: &Attempt, user_id: &str) -> CoreResult<()> {
    if attempt.user_id != user_id {
        return Err(CoreError::policy(
            PolicyCode::AttemptNotOwned,
            format!("Attempt {} belongs to another user", attempt.id),
        ));
    }
    Ok(())
}

pub fn ensure_in_progress(attempt: &Attempt) -> CoreResult<()> {
    if attempt.status != AttemptStatus::InProgress {
        return Err(CoreError::policy(
            PolicyCode::AttemptNotInProgress,
            format!(
                "Attempt {} is already {}",
                attempt.id,
                attempt.status.as_str()
            ),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Open,
    Expired,
}

/// Hard cutoff: submitting at exactly the limit is still on time.
pub fn check_deadline(attempt: &Attempt, quiz: &Quiz, now: DateTime<Utc>) -> Deadline {
    if now - attempt.start_time > quiz.time_limit() {
        Deadline::Expired
    } else {
        Deadline::Open
    }
}

/// Sets end time and duration once; later calls keep the first end time.
pub fn finish_timing(attempt: &mut Attempt, now: DateTime<Utc>) {
    if attempt.end_time.is_some() {
        return;
    }
    attempt.end_time = Some(now);
    let millis = (now - attempt.start_time).num_milliseconds().max(0);
    attempt.duration_seconds = (millis as f64 / 1000.0).round() as i64;
}

/// Moves an in-progress attempt to `timed_out` without touching its answers.
pub fn expire(attempt: &mut Attempt, now: DateTime<Utc>) {
    debug_assert!(can_transition(attempt.status, AttemptStatus::TimedOut));
    attempt.status = AttemptStatus::TimedOut;
    finish_timing(attempt, now);
}

/// Copies submitted answers into the matching slots. Unknown question ids are ignored.
pub fn merge_answers(
    attempt: &mut Attempt,
    submissions: &[AnswerSubmission],
    questions: &HashMap<String, Question>,
) -> usize {
    let mut merged = 0;
    for submission in submissions {
        let Some(record) = attempt
            .answers
            .iter_mut()
            .find(|r| r.question_id == submission.question_id)
        else {
            tracing::debug!(
                "Ignoring answer for question outside attempt: attempt={}, question={}",
                attempt.id,
                submission.question_id
            );
            continue;
        };

        record.answer = Some(match questions.get(&submission.question_id) {
            Some(question) => SubmittedAnswer::from_json(question.question_type, &submission.answer),
            None => SubmittedAnswer::Malformed(submission.answer.clone()),
        });
        merged += 1;
    }
    merged
}

/// Marks an attempt as corrected by a grader.
pub fn mark_manually_graded(attempt: &mut Attempt) -> CoreResult<()> {
    if !can_transition(attempt.status, AttemptStatus::ManuallyGraded) {
        return Err(CoreError::policy(
            PolicyCode::AttemptNotGradable,
            format!(
                "Attempt {} cannot be graded while {}",
                attempt.id,
                attempt.status.as_str()
            ),
        ));
    }
    attempt.status = AttemptStatus::ManuallyGraded;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Difficulty, QuizStatus};
    use chrono::Duration;
    use serde_json::json;

    fn quiz(status: QuizStatus, allow_reattempt: bool, max_attempts: u32) -> Quiz {
        Quiz {
            id: "quiz".to_string(),
            course_id: "course".to_string(),
            title: "Quiz".to_string(),
            description: String::new(),
            time_limit_minutes: 10,
            passing_score: 60.0,
            questions: vec!["q1".to_string(), "q2".to_string()],
            difficulty: Difficulty::Beginner,
            status,
            allow_reattempt,
            max_attempts,
            show_answers: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn start_requires_published_quiz() {
        let err = check_start(&quiz(QuizStatus::Draft, true, 3), 0).unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::QuizNotPublished));
    }

    #[test]
    fn start_numbers_attempts_from_one() {
        let q = quiz(QuizStatus::Published, true, 3);
        assert_eq!(check_start(&q, 0).unwrap(), 1);
        assert_eq!(check_start(&q, 2).unwrap(), 3);
        let err = check_start(&q, 3).unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::MaxAttemptsReached));
    }

    #[test]
    fn start_refuses_second_attempt_when_reattempt_disabled() {
        let q = quiz(QuizStatus::Published, false, 5);
        assert_eq!(check_start(&q, 0).unwrap(), 1);
        let err = check_start(&q, 1).unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::ReattemptNotAllowed));
    }

    #[test]
    fn open_attempt_has_one_placeholder_per_question() {
        let q = quiz(QuizStatus::Published, true, 3);
        let attempt = open_attempt("u1", &q, 1, Utc::now());
        assert_eq!(attempt.status, AttemptStatus::InProgress);
        assert_eq!(attempt.answers.len(), 2);
        assert!(attempt.answers.iter().all(|a| a.answer.is_none()));
        assert_eq!(attempt.answers[0].question_id, "q1");
    }

    #[test]
    fn deadline_is_inclusive_at_the_limit() {
        let q = quiz(QuizStatus::Published, true, 3);
        let start = Utc::now();
        let attempt = open_attempt("u1", &q, 1, start);

        assert_eq!(
            check_deadline(&attempt, &q, start + Duration::minutes(10)),
            Deadline::Open
        );
        assert_eq!(
            check_deadline(&attempt, &q, start + Duration::minutes(10) + Duration::milliseconds(1)),
            Deadline::Expired
        );
    }

    #[test]
    fn expire_sets_timing_and_status() {
        let q = quiz(QuizStatus::Published, true, 3);
        let start = Utc::now();
        let mut attempt = open_attempt("u1", &q, 1, start);
        expire(&mut attempt, start + Duration::minutes(11));
        assert_eq!(attempt.status, AttemptStatus::TimedOut);
        assert_eq!(attempt.duration_seconds, 660);
    }

    #[test]
    fn merge_ignores_unknown_questions() {
        let q = quiz(QuizStatus::Published, true, 3);
        let mut attempt = open_attempt("u1", &q, 1, Utc::now());
        let questions: HashMap<String, Question> = HashMap::new();
        let submissions = vec![
            AnswerSubmission {
                question_id: "q1".to_string(),
                answer: json!(0),
            },
            AnswerSubmission {
                question_id: "other".to_string(),
                answer: json!(1),
            },
        ];

        let merged = merge_answers(&mut attempt, &submissions, &questions);

        assert_eq!(merged, 1);
        assert!(attempt.answers[0].answer.is_some());
        assert!(attempt.answers[1].answer.is_none());
    }

    #[test]
    fn transitions_only_move_forward() {
        assert!(can_transition(AttemptStatus::InProgress, AttemptStatus::Completed));
        assert!(can_transition(AttemptStatus::InProgress, AttemptStatus::TimedOut));
        assert!(can_transition(AttemptStatus::Completed, AttemptStatus::ManuallyGraded));
        assert!(!can_transition(AttemptStatus::Completed, AttemptStatus::InProgress));
        assert!(!can_transition(AttemptStatus::TimedOut, AttemptStatus::Completed));
        assert!(!can_transition(AttemptStatus::TimedOut, AttemptStatus::ManuallyGraded));
    }

    #[test]
    fn grading_a_timed_out_attempt_is_refused() {
        let q = quiz(QuizStatus::Published, true, 3);
        let mut attempt = open_attempt("u1", &q, 1, Utc::now());
        attempt.status = AttemptStatus::TimedOut;
        let err = mark_manually_graded(&mut attempt).unwrap_err();
        assert_eq!(err.policy_code(), Some(PolicyCode::AttemptNotGradable));
    }
}
