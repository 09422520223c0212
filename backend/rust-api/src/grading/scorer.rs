use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::evaluator::evaluate;
use super::lifecycle::finish_timing;
use crate::models::{Attempt, AttemptStatus, Question, Quiz, ScoreResult};

/// Scores every answer slot of `attempt` and writes the aggregates back.
///
/// Recomputes from the recorded answers each time, so calling it again on the
/// same answers yields the same totals. Short answers that carry a grader keep
/// the grader's score.
pub fn score(
    attempt: &mut Attempt,
    quiz: &Quiz,
    questions: &HashMap<String, Question>,
    now: DateTime<Utc>,
) -> ScoreResult {
    let mut total_possible = 0.0;
    let mut earned = 0.0;
    let mut correct_count = 0u32;

    for record in attempt.answers.iter_mut() {
        let Some(question) = questions.get(&record.question_id) else {
            tracing::warn!(
                "Skipping answer for missing question: attempt={}, question={}",
                attempt.id,
                record.question_id
            );
            continue;
        };

        total_possible += question.score;

        if question.question_type.requires_manual_grading() && record.graded_by.is_some() {
            earned += record.score;
            if record.is_correct == Some(true) {
                correct_count += 1;
            }
            continue;
        }

        let evaluation = evaluate(question, record.answer.as_ref());
        record.is_correct = evaluation.correct;
        record.score = evaluation.score_awarded;
        earned += evaluation.score_awarded;
        if evaluation.correct == Some(true) {
            correct_count += 1;
        }
    }

    let percentage = if total_possible > 0.0 {
        earned / total_possible * 100.0
    } else {
        0.0
    };
    let passed = percentage >= quiz.passing_score;

    attempt.score = earned;
    attempt.percentage = percentage;
    attempt.passed = passed;
    finish_timing(attempt, now);

    if attempt.status == AttemptStatus::InProgress {
        attempt.status = AttemptStatus::Completed;
    }

    ScoreResult {
        score: earned,
        percentage,
        passed,
        correct_count,
        total_questions: attempt.answers.len() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AnswerRecord, Difficulty, QuestionOption, QuestionType, QuizStatus, SubmittedAnswer,
    };
    use chrono::Duration;

    fn quiz(passing_score: f64) -> Quiz {
        Quiz {
            id: "quiz".to_string(),
            course_id: "course".to_string(),
            title: "Quiz".to_string(),
            description: String::new(),
            time_limit_minutes: 30,
            passing_score,
            questions: vec![],
            difficulty: Difficulty::Beginner,
            status: QuizStatus::Published,
            allow_reattempt: true,
            max_attempts: 3,
            show_answers: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn choice_question(id: &str, correct_index: usize, score: f64) -> Question {
        Question {
            id: id.to_string(),
            quiz_id: "quiz".to_string(),
            text: id.to_string(),
            question_type: QuestionType::SingleChoice,
            options: (0..3)
                .map(|i| QuestionOption {
                    text: format!("o{}", i),
                    is_correct: i == correct_index,
                })
                .collect(),
            correct_answer: None,
            explanation: String::new(),
            score,
            difficulty: Difficulty::Beginner,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn essay(id: &str, score: f64) -> Question {
        Question {
            question_type: QuestionType::ShortAnswer,
            options: vec![],
            ..choice_question(id, 0, score)
        }
    }

    fn attempt(answers: Vec<AnswerRecord>, started: DateTime<Utc>) -> Attempt {
        Attempt {
            id: "a1".to_string(),
            user_id: "u1".to_string(),
            quiz_id: "quiz".to_string(),
            start_time: started,
            end_time: None,
            duration_seconds: 0,
            answers,
            score: 0.0,
            percentage: 0.0,
            passed: false,
            status: AttemptStatus::InProgress,
            attempt_number: 1,
            revision: 0,
            created_at: started,
            updated_at: started,
        }
    }

    fn answered(question_id: &str, answer: SubmittedAnswer) -> AnswerRecord {
        AnswerRecord {
            answer: Some(answer),
            ..AnswerRecord::placeholder(question_id)
        }
    }

    fn index(questions: Vec<Question>) -> HashMap<String, Question> {
        questions.into_iter().map(|q| (q.id.clone(), q)).collect()
    }

    #[test]
    fn two_correct_single_choice_answers_pass() {
        let now = Utc::now();
        let questions = index(vec![
            choice_question("q1", 0, 1.0),
            choice_question("q2", 1, 1.0),
        ]);
        let mut a = attempt(
            vec![
                answered("q1", SubmittedAnswer::Choice(0)),
                answered("q2", SubmittedAnswer::Choice(1)),
            ],
            now - Duration::minutes(5),
        );

        let result = score(&mut a, &quiz(60.0), &questions, now);

        assert_eq!(result.score, 2.0);
        assert_eq!(result.percentage, 100.0);
        assert!(result.passed);
        assert_eq!(result.correct_count, 2);
        assert_eq!(result.total_questions, 2);
        assert_eq!(a.status, AttemptStatus::Completed);
        assert_eq!(a.end_time, Some(now));
        assert_eq!(a.duration_seconds, 300);
    }

    #[test]
    fn score_equals_sum_of_correct_weights() {
        let now = Utc::now();
        let questions = index(vec![
            choice_question("q1", 0, 3.0),
            choice_question("q2", 1, 2.0),
            choice_question("q3", 2, 5.0),
        ]);
        let mut a = attempt(
            vec![
                answered("q1", SubmittedAnswer::Choice(0)),
                answered("q2", SubmittedAnswer::Choice(0)),
                answered("q3", SubmittedAnswer::Choice(2)),
            ],
            now,
        );

        let result = score(&mut a, &quiz(80.0), &questions, now);

        assert_eq!(result.score, 8.0);
        assert_eq!(result.percentage, 80.0);
        assert!(result.passed);
        assert_eq!(a.answers[1].score, 0.0);
        assert_eq!(a.answers[1].is_correct, Some(false));
    }

    #[test]
    fn zero_possible_score_gives_zero_percentage() {
        let now = Utc::now();
        let mut a = attempt(
            vec![answered("ghost", SubmittedAnswer::Choice(0))],
            now,
        );

        let result = score(&mut a, &quiz(0.0), &HashMap::new(), now);

        assert_eq!(result.score, 0.0);
        assert_eq!(result.percentage, 0.0);
        assert!(result.passed);
        assert_eq!(result.total_questions, 1);
    }

    #[test]
    fn graded_short_answer_keeps_grader_score() {
        let now = Utc::now();
        let questions = index(vec![choice_question("q1", 0, 1.0), essay("q2", 4.0)]);
        let mut graded = answered("q2", SubmittedAnswer::Text("essay".into()));
        graded.graded_by = Some("teacher".to_string());
        graded.score = 3.0;
        graded.is_correct = Some(true);
        let mut a = attempt(
            vec![answered("q1", SubmittedAnswer::Choice(0)), graded],
            now,
        );

        let result = score(&mut a, &quiz(50.0), &questions, now);

        assert_eq!(result.score, 4.0);
        assert_eq!(result.percentage, 80.0);
        assert_eq!(result.correct_count, 2);
        assert_eq!(a.answers[1].score, 3.0);
    }

    #[test]
    fn ungraded_short_answer_counts_nothing_yet() {
        let now = Utc::now();
        let questions = index(vec![essay("q1", 2.0)]);
        let mut a = attempt(vec![answered("q1", SubmittedAnswer::Text("x".into()))], now);

        let result = score(&mut a, &quiz(50.0), &questions, now);

        assert_eq!(result.score, 0.0);
        assert_eq!(a.answers[0].is_correct, None);
        assert!(!result.passed);
    }

    #[test]
    fn rescoring_does_not_double_count() {
        let now = Utc::now();
        let questions = index(vec![choice_question("q1", 0, 1.0)]);
        let mut a = attempt(vec![answered("q1", SubmittedAnswer::Choice(0))], now);

        let first = score(&mut a, &quiz(60.0), &questions, now);
        let later = now + Duration::minutes(10);
        let second = score(&mut a, &quiz(60.0), &questions, later);

        assert_eq!(first, second);
        assert_eq!(a.end_time, Some(now));
    }

    #[test]
    fn timed_out_status_is_preserved() {
        let now = Utc::now();
        let mut a = attempt(vec![], now);
        a.status = AttemptStatus::TimedOut;

        score(&mut a, &quiz(60.0), &HashMap::new(), now);

        assert_eq!(a.status, AttemptStatus::TimedOut);
    }

    #[test]
    fn clock_skew_clamps_duration_to_zero() {
        let now = Utc::now();
        let mut a = attempt(vec![], now + Duration::seconds(30));

        score(&mut a, &quiz(60.0), &HashMap::new(), now);

        assert_eq!(a.duration_seconds, 0);
    }
}
