use thiserror::Error;
use warp::http::StatusCode;

/// Custom error types for the quiz room server
#[derive(Debug, Error)]
pub enum QuizError {
    /// Admission errors
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("User {0} not found")]
    UserNotFound(u64),

    #[error("User {0} is not a participant of this quiz event")]
    NotAParticipant(u64),

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Quiz event {0} not found")]
    EventNotFound(String),

    /// Room and quiz event state errors
    #[error("Room {0} already exists")]
    RoomAlreadyExists(String),

    #[error("Invalid quiz event state: {0}")]
    InvalidState(String),

    #[error("Not allowed: {0}")]
    Forbidden(String),

    /// Protocol errors
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage collaborator errors
    #[error("Invalid quiz definition: {0}")]
    InvalidQuiz(String),

    #[error("Quiz definition for event {0} not found")]
    QuizNotFound(u64),

    #[error("Result for user {user_id} in quiz event {quiz_event_id} already exists")]
    DuplicateResult { user_id: u64, quiz_event_id: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic errors
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using QuizError
pub type Result<T> = std::result::Result<T, QuizError>;

impl QuizError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        QuizError::Internal(msg.into())
    }

    /// Helper to create storage errors
    pub fn storage(msg: impl Into<String>) -> Self {
        QuizError::Storage(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        QuizError::InvalidState(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        QuizError::Forbidden(msg.into())
    }

    /// HTTP status reported when this error ends a request
    pub fn status_code(&self) -> StatusCode {
        match self {
            QuizError::Unauthenticated(_) | QuizError::UserNotFound(_) => StatusCode::UNAUTHORIZED,
            QuizError::NotAParticipant(_) | QuizError::Forbidden(_) => StatusCode::FORBIDDEN,
            QuizError::RoomNotFound(_) | QuizError::EventNotFound(_) | QuizError::QuizNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            QuizError::RoomAlreadyExists(_)
            | QuizError::InvalidState(_)
            | QuizError::DuplicateResult { .. } => StatusCode::CONFLICT,
            QuizError::InvalidMessage(_) | QuizError::InvalidQuiz(_) | QuizError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            QuizError::Storage(_)
            | QuizError::Io(_)
            | QuizError::InvalidConfiguration(_)
            | QuizError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl warp::reject::Reject for QuizError {}
