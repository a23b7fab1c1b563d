use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::storage::{QuizEventId, UserId};

/// One submission, as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedAnswer {
    pub question_id: u32,
    pub answer: Value,
    /// Unix milliseconds, assigned by the server on receipt.
    pub timestamp: i64,
}

/// All answers of one quiz event: participant → question → latest answer.
#[derive(Debug, Default)]
pub struct AnswerSession {
    answers: HashMap<UserId, BTreeMap<u32, SubmittedAnswer>>,
}

impl AnswerSession {
    /// Keeps whichever submission for the question carries the later timestamp.
    fn record(&mut self, user_id: UserId, answer: SubmittedAnswer) {
        let per_user = self.answers.entry(user_id).or_default();
        match per_user.get(&answer.question_id) {
            Some(existing) if existing.timestamp > answer.timestamp => {}
            _ => {
                per_user.insert(answer.question_id, answer);
            }
        }
    }

    pub fn participants(&self) -> impl Iterator<Item = (&UserId, &BTreeMap<u32, SubmittedAnswer>)> {
        self.answers.iter().filter(|(_, answers)| !answers.is_empty())
    }

    pub fn answers_of(&self, user_id: UserId) -> Option<&BTreeMap<u32, SubmittedAnswer>> {
        self.answers.get(&user_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants().count()
    }
}

type SharedSession = Arc<Mutex<AnswerSession>>;

#[derive(Default)]
struct Sessions {
    live: HashMap<QuizEventId, SharedSession>,
    /// Events whose session was taken for scoring. They never get a new one.
    finalized: HashSet<QuizEventId>,
}

/// Live answer sessions, one per running quiz event.
///
/// The outer map and each session are locked separately; a session lock is
/// held only for a single record or read.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<Sessions>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a session exists for the event. Called when the event starts.
    pub async fn open(&self, quiz_event_id: QuizEventId) {
        if self.session_for(quiz_event_id).await.is_none() {
            tracing::warn!(quiz_event_id, "Quiz event already finalized, not opening a session");
        }
    }

    /// Stores one answer, creating the session on first use. False when the
    /// event was already finalized and the answer was dropped.
    pub async fn record_answer(
        &self,
        quiz_event_id: QuizEventId,
        user_id: UserId,
        question_id: u32,
        answer: Value,
        timestamp: i64,
    ) -> bool {
        let Some(session) = self.session_for(quiz_event_id).await else {
            return false;
        };
        let mut session = session.lock().await;
        session.record(
            user_id,
            SubmittedAnswer {
                question_id,
                answer,
                timestamp,
            },
        );
        true
    }

    pub async fn contains(&self, quiz_event_id: QuizEventId) -> bool {
        self.sessions.read().await.live.contains_key(&quiz_event_id)
    }

    /// Copy of one participant's answers.
    pub async fn answers_of(
        &self,
        quiz_event_id: QuizEventId,
        user_id: UserId,
    ) -> Option<BTreeMap<u32, SubmittedAnswer>> {
        let session = self.sessions.read().await.live.get(&quiz_event_id).cloned()?;
        let session = session.lock().await;
        session.answers_of(user_id).cloned()
    }

    /// Removes the session and hands it over. Only one caller ever gets it,
    /// and later answers for the event are refused.
    pub async fn take(&self, quiz_event_id: QuizEventId) -> Option<AnswerSession> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.finalized.insert(quiz_event_id);
            sessions.live.remove(&quiz_event_id)?
        };
        let mut session = session.lock().await;
        Some(std::mem::take(&mut *session))
    }

    /// Puts a taken session back so the event can be scored again.
    pub async fn restore(&self, quiz_event_id: QuizEventId, restored: AnswerSession) {
        self.sessions.write().await.finalized.remove(&quiz_event_id);
        let Some(session) = self.session_for(quiz_event_id).await else {
            return;
        };
        let mut session = session.lock().await;
        for (user_id, answers) in restored.answers {
            for answer in answers.into_values() {
                session.record(user_id, answer);
            }
        }
    }

    async fn session_for(&self, quiz_event_id: QuizEventId) -> Option<SharedSession> {
        if let Some(session) = self.sessions.read().await.live.get(&quiz_event_id) {
            return Some(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        if sessions.finalized.contains(&quiz_event_id) {
            return None;
        }
        let session = sessions.live.entry(quiz_event_id).or_insert_with(|| {
            tracing::debug!(quiz_event_id, "Opening answer session");
            Arc::default()
        });
        Some(session.clone())
    }
}
