use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Submitted choices keyed by question id.
pub type QuizAnswers = BTreeMap<String, String>;

/// Correct choices keyed by question id.
pub type AnswerKey = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct QuizScore {
    pub correct_count: u32,
    pub total_questions: u32,
    pub percentage: f64,
}

impl QuizScore {
    #[must_use]
    pub fn is_perfect(&self) -> bool {
        self.total_questions > 0 && self.correct_count == self.total_questions
    }
}

/// Score submitted answers against an answer key.
///
/// Every question in the key counts towards the total. Answers to questions
/// that are not in the key are ignored. Choices are compared after trimming,
/// ignoring ASCII case.
#[must_use]
pub fn score_quiz(answers: &QuizAnswers, answer_key: &AnswerKey) -> QuizScore {
    let correct = answer_key
        .iter()
        .filter(|(question_id, expected)| {
            answers
                .get(*question_id)
                .is_some_and(|choice| choice.trim().eq_ignore_ascii_case(expected.trim()))
        })
        .count();

    let correct_count = u32::try_from(correct).unwrap_or(u32::MAX);
    let total_questions = u32::try_from(answer_key.len()).unwrap_or(u32::MAX);
    let percentage = if total_questions == 0 {
        0.0
    } else {
        f64::from(correct_count) / f64::from(total_questions) * 100.0
    };

    QuizScore { correct_count, total_questions, percentage }
}
