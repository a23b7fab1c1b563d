//! Collaborator contracts consumed by the session engine.
//!
//! Identity resolution, quiz event records, quiz definitions and results all
//! live outside the engine. The engine reaches them only through the traits
//! below, so the backing store can be swapped without touching room or
//! finalize logic.
//!
//! - `memory`: everything kept in process memory (default, and used by tests)
//! - `json_file`: quiz definitions kept as one JSON file per event

mod json_file;
mod memory;
pub mod model;

pub use json_file::JsonFileQuizStore;
pub use memory::{MemoryStore, UserRecord};
pub use model::{
    EventResult, NewQuizEvent, Question, QuestionKind, QuizDefinition, QuizEvent, QuizEventId,
    QuizStatus, Role, User, UserId,
};

use async_trait::async_trait;

use crate::error::Result;

/// Resolves callers to user records.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Resolve a bearer token. Fails with `Unauthenticated` for unknown tokens.
    async fn authenticate(&self, token: &str) -> Result<User>;

    /// Look up a user by id. Fails with `UserNotFound`.
    async fn user(&self, id: UserId) -> Result<User>;
}

#[async_trait]
pub trait QuizEventStore: Send + Sync + 'static {
    async fn create_event(&self, event: NewQuizEvent) -> Result<QuizEvent>;

    async fn event(&self, id: QuizEventId) -> Result<QuizEvent>;

    async fn event_by_channel(&self, channel_code: &str) -> Result<QuizEvent>;
}

/// Read/write access to quiz definitions, keyed by quiz event.
#[async_trait]
pub trait QuizStore: Send + Sync + 'static {
    /// Fails with `QuizNotFound` when nothing was saved for the event.
    async fn load(&self, event_id: QuizEventId) -> Result<QuizDefinition>;

    async fn save(&self, event_id: QuizEventId, quiz: &QuizDefinition) -> Result<()>;
}

#[async_trait]
pub trait ResultStore: Send + Sync + 'static {
    /// Persist one result. Fails with `DuplicateResult` if the
    /// (user, quiz event) pair already has one.
    async fn create_result(&self, result: EventResult) -> Result<()>;

    async fn results_for_event(&self, event_id: QuizEventId) -> Result<Vec<EventResult>>;
}
