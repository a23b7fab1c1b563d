//! Turns one participant's answers into a score and an analytics record.
//!
//! Rules:
//! - `mcq`: the single selected option (a string, or an array holding exactly
//!   one string) must equal the correct option.
//! - `msq`: all-or-nothing. The selected set must equal the correct set;
//!   order and duplicates are ignored.
//! - `numeric`: exact equality with the correct value. Numeric strings are
//!   accepted.
//! - Missing, `null` or empty answers count as wrong.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use super::session::SubmittedAnswer;
use crate::storage::{Question, QuestionKind, QuizDefinition};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analytics {
    pub answers: BTreeMap<u32, SubmittedAnswer>,
    pub correct_answers: u32,
    pub wrong_answers: u32,
    /// Milliseconds spent on each answered question, measured from the
    /// previous answer (or the event start for the first one).
    pub time_stats: BTreeMap<u32, i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scorecard {
    pub score: i64,
    pub analytics: Analytics,
}

pub fn score(answers: &BTreeMap<u32, SubmittedAnswer>, quiz: &QuizDefinition) -> Scorecard {
    let mut score = 0;
    let mut correct_answers = 0;
    let mut wrong_answers = 0;

    for question in &quiz.questions {
        let correct = answers
            .get(&question.id)
            .map(|submitted| is_correct(question, &submitted.answer))
            .unwrap_or(false);

        if correct {
            score += question.points;
            correct_answers += 1;
        } else {
            wrong_answers += 1;
        }
    }

    Scorecard {
        score,
        analytics: Analytics {
            answers: answers.clone(),
            correct_answers,
            wrong_answers,
            time_stats: time_stats(answers, quiz),
        },
    }
}

pub fn is_correct(question: &Question, answer: &Value) -> bool {
    match &question.kind {
        QuestionKind::Mcq { correct_answer, .. } => {
            single_selection(answer).is_some_and(|selected| selected == correct_answer.as_str())
        }
        QuestionKind::Msq { correct_answers, .. } => match selections(answer) {
            Some(selected) if !selected.is_empty() => {
                let expected: BTreeSet<&str> = correct_answers.iter().map(String::as_str).collect();
                selected == expected
            }
            _ => false,
        },
        QuestionKind::Numeric { correct_answer } => {
            numeric_value(answer).is_some_and(|value| value == *correct_answer)
        }
    }
}

fn single_selection(answer: &Value) -> Option<&str> {
    match answer {
        Value::String(s) if !s.is_empty() => Some(s.as_str()),
        Value::Array(items) if items.len() == 1 => items[0].as_str().filter(|s| !s.is_empty()),
        _ => None,
    }
}

fn selections(answer: &Value) -> Option<BTreeSet<&str>> {
    match answer {
        Value::Array(items) => items.iter().map(Value::as_str).collect(),
        Value::String(s) if !s.is_empty() => Some(BTreeSet::from([s.as_str()])),
        _ => None,
    }
}

fn numeric_value(answer: &Value) -> Option<f64> {
    match answer {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Orders answers by submission time and charges each one the time since the
/// previous submission. Answers without a known event start are skipped.
fn time_stats(answers: &BTreeMap<u32, SubmittedAnswer>, quiz: &QuizDefinition) -> BTreeMap<u32, i64> {
    let Some(start) = quiz.start_time else {
        return BTreeMap::new();
    };

    let mut ordered: Vec<&SubmittedAnswer> = answers.values().collect();
    ordered.sort_by_key(|a| (a.timestamp, a.question_id));

    let mut stats = BTreeMap::new();
    let mut previous_elapsed = 0;
    for answer in ordered {
        let elapsed = (answer.timestamp - start).max(0);
        stats.insert(answer.question_id, elapsed - previous_elapsed);
        previous_elapsed = elapsed;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quiz() -> QuizDefinition {
        serde_json::from_value(json!({
            "duration": 60,
            "start_time": 1_000,
            "questions": [
                {"id": 1, "type": "mcq", "points": 5, "options": ["Paris", "Rome"], "correct_answer": "Paris"},
                {"id": 3, "type": "numeric", "points": 5, "correct_answer": 27}
            ]
        }))
        .unwrap()
    }

    fn answer(question_id: u32, answer: Value, timestamp: i64) -> (u32, SubmittedAnswer) {
        (
            question_id,
            SubmittedAnswer {
                question_id,
                answer,
                timestamp,
            },
        )
    }

    #[test]
    fn test_all_correct() {
        let answers = BTreeMap::from([
            answer(3, json!(27), 4_000),
            answer(1, json!(["Paris"]), 6_000),
        ]);

        let card = score(&answers, &quiz());
        assert_eq!(card.score, 10);
        assert_eq!(card.analytics.correct_answers, 2);
        assert_eq!(card.analytics.wrong_answers, 0);
    }

    #[test]
    fn test_missing_question_counts_wrong() {
        let answers = BTreeMap::from([answer(3, json!(27), 4_000)]);

        let card = score(&answers, &quiz());
        assert_eq!(card.score, 5);
        assert_eq!(card.analytics.correct_answers, 1);
        assert_eq!(card.analytics.wrong_answers, 1);
    }

    #[test]
    fn test_null_and_empty_answers_are_wrong() {
        let answers = BTreeMap::from([answer(1, json!([]), 2_000), answer(3, Value::Null, 3_000)]);

        let card = score(&answers, &quiz());
        assert_eq!(card.score, 0);
        assert_eq!(card.analytics.wrong_answers, 2);
    }

    #[test]
    fn test_mcq_rejects_multiple_selections() {
        let quiz = quiz();
        let q = &quiz.questions[0];
        assert!(is_correct(q, &json!("Paris")));
        assert!(!is_correct(q, &json!(["Paris", "Rome"])));
        assert!(!is_correct(q, &json!("Rome")));
    }

    #[test]
    fn test_msq_is_all_or_nothing() {
        let q: Question = serde_json::from_value(json!({
            "id": 2, "type": "msq", "points": 4, "options": ["a", "b", "c"], "correct_answers": ["a", "c"]
        }))
        .unwrap();

        assert!(is_correct(&q, &json!(["c", "a"])));
        assert!(is_correct(&q, &json!(["a", "c", "a"])));
        assert!(!is_correct(&q, &json!(["a"])));
        assert!(!is_correct(&q, &json!(["a", "b", "c"])));
        assert!(!is_correct(&q, &json!(["a", 3])));
    }

    #[test]
    fn test_numeric_is_exact() {
        let quiz = quiz();
        let q = &quiz.questions[1];
        assert!(is_correct(q, &json!(27)));
        assert!(is_correct(q, &json!(27.0)));
        assert!(is_correct(q, &json!("27")));
        assert!(!is_correct(q, &json!(27.0001)));
        assert!(!is_correct(q, &json!(true)));
    }

    #[test]
    fn test_time_stats_are_deltas_between_answers() {
        let answers = BTreeMap::from([
            answer(1, json!("Paris"), 9_000),
            answer(3, json!(27), 4_000),
        ]);

        let card = score(&answers, &quiz());
        assert_eq!(card.analytics.time_stats[&3], 3_000);
        assert_eq!(card.analytics.time_stats[&1], 5_000);
    }

    #[test]
    fn test_no_start_time_means_no_timing() {
        let mut quiz = quiz();
        quiz.start_time = None;
        let answers = BTreeMap::from([answer(3, json!(27), 4_000)]);

        assert!(score(&answers, &quiz).analytics.time_stats.is_empty());
    }
}
