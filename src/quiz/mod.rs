//! Live quiz session engine.
//!
//! A quiz event gets one [`RoomHandle`] (registered in the [`RoomRegistry`]
//! under its channel code) and, once started, one answer session in the
//! [`SessionStore`]. Connections enter through [`ConnectionHandler`]; the
//! event ends through the [`Finalizer`], either on the moderator's request or
//! when the auto-end timer fires.

mod finalizer;
mod handler;
mod protocol;
mod registry;
mod room;
mod scorer;
mod service;
mod session;

pub use finalizer::{FinalizeOutcome, Finalizer};
pub use handler::ConnectionHandler;
pub use protocol::{AnswerPayload, ClientMessage, RemoveClientsPayload, ServerMessage};
pub use registry::RoomRegistry;
pub use room::{Client, ClientSender, RoomEvent, RoomHandle, Schedule};
pub use scorer::{is_correct, score, Analytics, Scorecard};
pub use service::QuizService;
pub use session::{AnswerSession, SessionStore, SubmittedAnswer};
