use std::collections::BTreeSet;

use crate::models::{Question, QuestionType, SubmittedAnswer};

/// Outcome of checking one answer. `correct` is `None` when a grader has to decide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub correct: Option<bool>,
    pub score_awarded: f64,
}

impl Evaluation {
    fn decided(correct: bool, weight: f64) -> Self {
        Evaluation {
            correct: Some(correct),
            score_awarded: if correct { weight } else { 0.0 },
        }
    }

    fn needs_grader() -> Self {
        Evaluation {
            correct: None,
            score_awarded: 0.0,
        }
    }
}

/// Checks a submitted answer against its question. Never fails: a missing or
/// mis-shaped answer is simply incorrect.
pub fn evaluate(question: &Question, answer: Option<&SubmittedAnswer>) -> Evaluation {
    if question.question_type.requires_manual_grading() {
        return Evaluation::needs_grader();
    }

    let correct = match (question.question_type, answer) {
        (QuestionType::SingleChoice, Some(SubmittedAnswer::Choice(index))) => {
            question.correct_option_index() == Some(*index)
        }
        (QuestionType::MultiChoice, Some(SubmittedAnswer::Choices(indices))) => {
            let submitted: BTreeSet<u32> = indices.iter().copied().collect();
            submitted.len() == indices.len() && submitted == question.correct_option_set()
        }
        (QuestionType::TrueFalse, Some(SubmittedAnswer::Text(text))) => {
            question.correct_answer.as_deref() == Some(text.as_str())
        }
        (QuestionType::FillBlank, Some(SubmittedAnswer::Text(text))) => question
            .correct_answer
            .as_deref()
            .map(|expected| fold(expected) == fold(text))
            .unwrap_or(false),
        _ => false,
    };

    Evaluation::decided(correct, question.score)
}

fn fold(text: &str) -> String {
    text.trim().to_lowercase()
}
