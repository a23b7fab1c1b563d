use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type UserId = u64;
pub type QuizEventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
    Admin,
}

impl Role {
    /// Teachers and admins may create quiz events.
    pub fn can_moderate(&self) -> bool {
        matches!(self, Role::Teacher | Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(rename = "user_type")]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizEvent {
    pub id: QuizEventId,
    #[serde(rename = "quiz_event_name")]
    pub name: String,
    pub channel_code: String,
    #[serde(rename = "user_id")]
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewQuizEvent {
    pub name: String,
    pub channel_code: String,
    pub owner_id: UserId,
}

/// One scored participant of one quiz event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResult {
    pub user_id: UserId,
    pub quiz_event_id: QuizEventId,
    #[serde(rename = "exp_score")]
    pub score: i64,
    #[serde(rename = "extra_json_info")]
    pub analytics: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuizStatus {
    #[default]
    Pending,
    Active,
    Completed,
}

impl QuizStatus {
    /// Status only ever moves forward: pending → active → completed.
    pub fn can_advance_to(self, next: QuizStatus) -> bool {
        matches!(
            (self, next),
            (QuizStatus::Pending, QuizStatus::Active)
                | (QuizStatus::Active, QuizStatus::Completed)
                | (QuizStatus::Pending, QuizStatus::Completed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QuestionKind {
    Mcq {
        #[serde(default)]
        options: Vec<String>,
        correct_answer: String,
    },
    Msq {
        #[serde(default)]
        options: Vec<String>,
        correct_answers: Vec<String>,
    },
    Numeric {
        correct_answer: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: u32,
    #[serde(default)]
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

/// A quiz as authored by its moderator, plus the timestamps observed while it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizDefinition {
    #[serde(default)]
    pub status: QuizStatus,
    /// Seconds the event runs once started.
    pub duration: u64,
    #[serde(default)]
    pub questions: Vec<Question>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QuizDefinition {
    /// The definition as participants see it: correctness fields removed.
    pub fn public_view(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(questions) = value.get_mut("questions").and_then(Value::as_array_mut) {
            for question in questions.iter_mut().filter_map(Value::as_object_mut) {
                question.remove("correct_answer");
                question.remove("correct_answers");
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> QuizDefinition {
        serde_json::from_value(json!({
            "status": "pending",
            "duration": 90,
            "title": "Geography",
            "questions": [
                {"id": 1, "type": "mcq", "points": 5, "options": ["Paris", "Rome"], "correct_answer": "Paris"},
                {"id": 2, "type": "msq", "points": 4, "options": ["a", "b", "c"], "correct_answers": ["a", "c"]},
                {"id": 3, "type": "numeric", "points": 5, "correct_answer": 27}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_definition_deserialization() {
        let quiz = sample();
        assert_eq!(quiz.status, QuizStatus::Pending);
        assert_eq!(quiz.duration, 90);
        assert_eq!(quiz.questions.len(), 3);
        assert_eq!(quiz.questions.iter().map(|q| q.points).sum::<i64>(), 14);
        assert!(matches!(
            quiz.questions.iter().find(|q| q.id == 3).map(|q| &q.kind),
            Some(QuestionKind::Numeric { correct_answer }) if *correct_answer == 27.0
        ));
        assert_eq!(quiz.extra.get("title"), Some(&json!("Geography")));
    }

    #[test]
    fn test_unknown_keys_survive_round_trip() {
        let quiz = sample();
        let value = serde_json::to_value(&quiz).unwrap();
        assert_eq!(value["title"], "Geography");
        assert_eq!(value["questions"][0]["type"], "mcq");
    }

    #[test]
    fn test_public_view_hides_answers() {
        let view = sample().public_view();
        let questions = view["questions"].as_array().unwrap();
        assert_eq!(questions.len(), 3);
        for question in questions {
            assert!(question.get("correct_answer").is_none());
            assert!(question.get("correct_answers").is_none());
        }
        assert_eq!(questions[0]["options"], json!(["Paris", "Rome"]));
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(QuizStatus::Pending.can_advance_to(QuizStatus::Active));
        assert!(QuizStatus::Active.can_advance_to(QuizStatus::Completed));
        assert!(!QuizStatus::Completed.can_advance_to(QuizStatus::Active));
        assert!(!QuizStatus::Active.can_advance_to(QuizStatus::Pending));
        assert!(!QuizStatus::Active.can_advance_to(QuizStatus::Active));
    }

    #[test]
    fn test_role_can_moderate() {
        assert!(Role::Teacher.can_moderate());
        assert!(Role::Admin.can_moderate());
        assert!(!Role::Student.can_moderate());
        assert_eq!(serde_json::to_string(&Role::Student).unwrap(), "\"student\"");
    }
}
