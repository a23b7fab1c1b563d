use serde::{Deserialize, Serialize};
use serde_json::Value;
use warp::ws::Message;

use crate::error::{QuizError, Result};
use crate::storage::{QuizEventId, UserId};

/// Raw `{type, payload}` frame as it arrives on the socket.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoveClientsPayload {
    pub client_list: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnswerPayload {
    pub question_id: u32,
    #[serde(default)]
    pub answer: Value,
}

/// Messages a moderator or participant may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    GetClients,
    RemoveClients(RemoveClientsPayload),
    Answer(AnswerPayload),
}

impl ClientMessage {
    pub const GET_CLIENTS: &'static str = "get_clients";
    pub const REMOVE_CLIENTS: &'static str = "remove_clients";
    pub const ANSWER: &'static str = "answer";

    /// Decodes one text frame. Unknown types and malformed payloads are both
    /// `InvalidMessage`; callers log and move on.
    pub fn parse(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| QuizError::InvalidMessage(format!("malformed envelope: {e}")))?;

        let decode_err =
            |e: serde_json::Error| QuizError::InvalidMessage(format!("{}: {e}", envelope.kind));

        match envelope.kind.as_str() {
            Self::GET_CLIENTS => Ok(ClientMessage::GetClients),
            Self::REMOVE_CLIENTS => serde_json::from_value(envelope.payload.clone())
                .map(ClientMessage::RemoveClients)
                .map_err(decode_err),
            Self::ANSWER => serde_json::from_value(envelope.payload.clone())
                .map(ClientMessage::Answer)
                .map_err(decode_err),
            other => Err(QuizError::InvalidMessage(format!("unknown message type: {other}"))),
        }
    }

    pub fn is_moderator_only(&self) -> bool {
        matches!(self, ClientMessage::GetClients | ClientMessage::RemoveClients(_))
    }
}

/// Messages the server sends into a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    StartQuizEvent {
        quiz_id: QuizEventId,
        start_time: i64,
        end_time: i64,
        quiz_json: Value,
    },
    EndQuizEvent {
        results: bool,
    },
    Clients {
        clients: Vec<UserId>,
    },
    RemoveClient {},
    AnswerUpdate {
        user_id: UserId,
        question_id: u32,
        timestamp: i64,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_ws_message(&self) -> Result<Message> {
        Ok(Message::text(serde_json::to_string(self)?))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::StartQuizEvent { .. } => "start_quiz_event",
            ServerMessage::EndQuizEvent { .. } => "end_quiz_event",
            ServerMessage::Clients { .. } => "clients",
            ServerMessage::RemoveClient {} => "remove_client",
            ServerMessage::AnswerUpdate { .. } => "answer_update",
            ServerMessage::Error { .. } => "error",
        }
    }
}
