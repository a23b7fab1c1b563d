use std::sync::Arc;

use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::finalizer::{FinalizeOutcome, Finalizer};
use super::protocol::ServerMessage;
use super::registry::RoomRegistry;
use super::room::{RoomHandle, Schedule};
use super::session::SessionStore;
use crate::error::{QuizError, Result};
use crate::storage::{
    EventResult, IdentityProvider, NewQuizEvent, QuizDefinition, QuizEvent, QuizEventId,
    QuizEventStore, QuizStatus, QuizStore, ResultStore, User,
};

const CHANNEL_CODE_LEN: usize = 8;
const CHANNEL_CODE_ATTEMPTS: usize = 5;
/// Longest a quiz event may run: one day.
pub const MAX_QUIZ_DURATION_SECS: u64 = 24 * 60 * 60;

/// Everything the session engine needs, wired once at startup.
pub struct QuizService {
    identities: Arc<dyn IdentityProvider>,
    events: Arc<dyn QuizEventStore>,
    quizzes: Arc<dyn QuizStore>,
    results: Arc<dyn ResultStore>,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionStore>,
    finalizer: Finalizer,
}

impl QuizService {
    pub fn new(
        identities: Arc<dyn IdentityProvider>,
        events: Arc<dyn QuizEventStore>,
        quizzes: Arc<dyn QuizStore>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let sessions = Arc::new(SessionStore::new());
        let finalizer = Finalizer::new(
            events.clone(),
            quizzes.clone(),
            results.clone(),
            sessions.clone(),
            registry.clone(),
        );

        Self {
            identities,
            events,
            quizzes,
            results,
            registry,
            sessions,
            finalizer,
        }
    }

    pub fn identities(&self) -> &dyn IdentityProvider {
        self.identities.as_ref()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn authenticate(&self, token: &str) -> Result<User> {
        self.identities.authenticate(token).await
    }

    /// Persists a new pending quiz event under a fresh channel code and opens
    /// its room. Only teachers and admins may create events.
    pub async fn create_event(
        &self,
        owner: &User,
        name: String,
        mut quiz: QuizDefinition,
    ) -> Result<QuizEvent> {
        if !owner.role.can_moderate() {
            return Err(QuizError::forbidden("only teachers can create quiz events"));
        }

        if quiz.duration > MAX_QUIZ_DURATION_SECS {
            return Err(QuizError::InvalidQuiz(format!(
                "duration {}s exceeds the {}s limit",
                quiz.duration, MAX_QUIZ_DURATION_SECS
            )));
        }

        quiz.status = QuizStatus::Pending;
        quiz.start_time = None;
        quiz.end_time = None;

        let event = self.create_event_record(owner, name).await?;
        self.quizzes.save(event.id, &quiz).await?;
        self.registry
            .create_room(event.id, &event.channel_code, owner.id)
            .await?;

        tracing::info!(
            quiz_event_id = event.id,
            room_id = %event.channel_code,
            owner_id = owner.id,
            questions = quiz.questions.len(),
            "Quiz event created"
        );
        Ok(event)
    }

    async fn create_event_record(&self, owner: &User, name: String) -> Result<QuizEvent> {
        for _ in 0..CHANNEL_CODE_ATTEMPTS {
            let request = NewQuizEvent {
                name: name.clone(),
                channel_code: generate_channel_code(),
                owner_id: owner.id,
            };
            match self.events.create_event(request).await {
                Err(QuizError::RoomAlreadyExists(code)) => {
                    tracing::debug!(room_id = %code, "Channel code taken, retrying");
                }
                other => return other,
            }
        }
        Err(QuizError::internal("could not allocate a channel code"))
    }

    /// Pre-registers `user` for the event behind `channel_code`.
    pub async fn join_event(&self, user: &User, channel_code: &str) -> Result<QuizEvent> {
        let event = self.events.event_by_channel(channel_code).await?;
        let quiz = self.quizzes.load(event.id).await?;
        if quiz.status != QuizStatus::Pending {
            return Err(QuizError::invalid_state("quiz event is no longer joinable"));
        }

        let room = self.registry.room(channel_code).await?;
        room.allow(user.id).await;

        tracing::info!(room_id = %channel_code, user_id = user.id, "Participant pre-registered");
        Ok(event)
    }

    pub async fn start_event(&self, user: &User, quiz_event_id: QuizEventId) -> Result<Schedule> {
        let event = self.owned_event(user, quiz_event_id).await?;
        let mut quiz = self.quizzes.load(quiz_event_id).await?;
        if !quiz.status.can_advance_to(QuizStatus::Active) {
            return Err(QuizError::invalid_state(format!(
                "cannot start a quiz event that is {:?}",
                quiz.status
            )));
        }

        let room = self.registry.room(&event.channel_code).await?;
        let start_time = Utc::now().timestamp_millis();
        let end_time = i64::try_from(quiz.duration)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .and_then(|millis| start_time.checked_add(millis))
            .ok_or_else(|| {
                QuizError::InvalidQuiz(format!("duration {}s is out of range", quiz.duration))
            })?;
        let schedule = Schedule {
            start_time,
            end_time,
        };
        if !room.start(schedule).await {
            return Err(QuizError::invalid_state("quiz event already started"));
        }

        quiz.status = QuizStatus::Active;
        quiz.start_time = Some(schedule.start_time);
        quiz.end_time = Some(schedule.end_time);
        if let Err(e) = self.quizzes.save(quiz_event_id, &quiz).await {
            tracing::error!(quiz_event_id, error = %e, "Failed to persist quiz start, rolling back");
            room.cancel_start().await;
            return Err(e);
        }
        self.sessions.open(quiz_event_id).await;

        room.broadcast_all(ServerMessage::StartQuizEvent {
            quiz_id: quiz_event_id,
            start_time: schedule.start_time,
            end_time: schedule.end_time,
            quiz_json: quiz.public_view(),
        });

        tracing::info!(
            quiz_event_id,
            room_id = %event.channel_code,
            start_time = schedule.start_time,
            end_time = schedule.end_time,
            "Quiz event started"
        );
        Ok(schedule)
    }

    /// Manual end by the owner. Ends the event through the same path as the
    /// timer.
    pub async fn end_event(&self, user: &User, quiz_event_id: QuizEventId) -> Result<FinalizeOutcome> {
        let event = self.owned_event(user, quiz_event_id).await?;
        let started = match self.registry.get_room(&event.channel_code).await {
            Some(room) => room.is_started(),
            None => self.quizzes.load(quiz_event_id).await?.status != QuizStatus::Pending,
        };
        if !started {
            return Err(QuizError::invalid_state("quiz event has not started"));
        }

        tracing::info!(quiz_event_id, user_id = user.id, "Quiz event ended by moderator");
        self.finalize(quiz_event_id).await
    }

    pub async fn finalize(&self, quiz_event_id: QuizEventId) -> Result<FinalizeOutcome> {
        self.finalizer.finalize(quiz_event_id).await
    }

    pub async fn results(&self, user: &User, quiz_event_id: QuizEventId) -> Result<Vec<EventResult>> {
        self.owned_event(user, quiz_event_id).await?;
        self.results.results_for_event(quiz_event_id).await
    }

    /// End-of-event bookkeeping: stop the room and forget it.
    pub async fn close_room(&self, room: &RoomHandle) {
        if !self.registry.close_room(room.channel_code()).await {
            tracing::debug!(room_id = %room.channel_code(), "Room already closed");
        }
    }

    async fn owned_event(&self, user: &User, quiz_event_id: QuizEventId) -> Result<QuizEvent> {
        let event = self.events.event(quiz_event_id).await?;
        if event.owner_id != user.id {
            return Err(QuizError::forbidden(format!(
                "user {} does not own quiz event {}",
                user.id, quiz_event_id
            )));
        }
        Ok(event)
    }
}

fn generate_channel_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CHANNEL_CODE_LEN)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}
