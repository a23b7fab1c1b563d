use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{
    EventResult, IdentityProvider, NewQuizEvent, QuizDefinition, QuizEvent, QuizEventId,
    QuizEventStore, QuizStore, ResultStore, User, UserId,
};
use crate::error::{QuizError, Result};

/// A user plus the bearer token it authenticates with.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    #[serde(flatten)]
    pub user: User,
    pub token: String,
}

impl UserRecord {
    /// Reads a JSON array of user records from disk.
    pub fn load_file(path: &Path) -> Result<Vec<UserRecord>> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Process-memory backing for every collaborator trait.
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, User>>,
    tokens: RwLock<HashMap<String, UserId>>,
    events: RwLock<HashMap<QuizEventId, QuizEvent>>,
    quizzes: RwLock<HashMap<QuizEventId, QuizDefinition>>,
    results: RwLock<HashMap<(UserId, QuizEventId), EventResult>>,
    next_event_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            quizzes: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
        }
    }

    pub fn with_users(records: Vec<UserRecord>) -> Self {
        let mut users = HashMap::new();
        let mut tokens = HashMap::new();
        for record in records {
            tokens.insert(record.token, record.user.id);
            users.insert(record.user.id, record.user);
        }

        Self {
            users: RwLock::new(users),
            tokens: RwLock::new(tokens),
            ..Self::new()
        }
    }

    pub async fn add_user(&self, user: User, token: impl Into<String>) {
        self.tokens.write().await.insert(token.into(), user.id);
        self.users.write().await.insert(user.id, user);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for MemoryStore {
    async fn authenticate(&self, token: &str) -> Result<User> {
        let user_id = self
            .tokens
            .read()
            .await
            .get(token)
            .copied()
            .ok_or_else(|| QuizError::Unauthenticated("invalid token".to_string()))?;
        self.user(user_id).await
    }

    async fn user(&self, id: UserId) -> Result<User> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(QuizError::UserNotFound(id))
    }
}

#[async_trait]
impl QuizEventStore for MemoryStore {
    async fn create_event(&self, event: NewQuizEvent) -> Result<QuizEvent> {
        let mut events = self.events.write().await;
        if events.values().any(|e| e.channel_code == event.channel_code) {
            return Err(QuizError::RoomAlreadyExists(event.channel_code));
        }

        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let record = QuizEvent {
            id,
            name: event.name,
            channel_code: event.channel_code,
            owner_id: event.owner_id,
            created_at: Utc::now(),
        };
        events.insert(id, record.clone());
        Ok(record)
    }

    async fn event(&self, id: QuizEventId) -> Result<QuizEvent> {
        self.events
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| QuizError::EventNotFound(id.to_string()))
    }

    async fn event_by_channel(&self, channel_code: &str) -> Result<QuizEvent> {
        self.events
            .read()
            .await
            .values()
            .find(|e| e.channel_code == channel_code)
            .cloned()
            .ok_or_else(|| QuizError::EventNotFound(channel_code.to_string()))
    }
}

#[async_trait]
impl QuizStore for MemoryStore {
    async fn load(&self, event_id: QuizEventId) -> Result<QuizDefinition> {
        self.quizzes
            .read()
            .await
            .get(&event_id)
            .cloned()
            .ok_or(QuizError::QuizNotFound(event_id))
    }

    async fn save(&self, event_id: QuizEventId, quiz: &QuizDefinition) -> Result<()> {
        self.quizzes.write().await.insert(event_id, quiz.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_result(&self, result: EventResult) -> Result<()> {
        let key = (result.user_id, result.quiz_event_id);
        let mut results = self.results.write().await;
        if results.contains_key(&key) {
            return Err(QuizError::DuplicateResult {
                user_id: result.user_id,
                quiz_event_id: result.quiz_event_id,
            });
        }
        results.insert(key, result);
        Ok(())
    }

    async fn results_for_event(&self, event_id: QuizEventId) -> Result<Vec<EventResult>> {
        let mut results: Vec<EventResult> = self
            .results
            .read()
            .await
            .values()
            .filter(|r| r.quiz_event_id == event_id)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.user_id);
        Ok(results)
    }
}
