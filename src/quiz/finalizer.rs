use std::sync::Arc;

use chrono::Utc;

use super::protocol::ServerMessage;
use super::registry::RoomRegistry;
use super::scorer;
use super::session::SessionStore;
use crate::error::Result;
use crate::storage::{EventResult, QuizEventId, QuizEventStore, QuizStatus, QuizStore, ResultStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// No session was left to score; an earlier call already finished.
    AlreadyFinalized,
    Finalized { scored: usize, failed: usize },
}

/// Scores a finished quiz event and persists its results.
///
/// Safe to call any number of times per event: the answer session is taken out
/// of the store before scoring, so exactly one call gets to score it.
pub struct Finalizer {
    events: Arc<dyn QuizEventStore>,
    quizzes: Arc<dyn QuizStore>,
    results: Arc<dyn ResultStore>,
    sessions: Arc<SessionStore>,
    registry: Arc<RoomRegistry>,
}

impl Finalizer {
    pub fn new(
        events: Arc<dyn QuizEventStore>,
        quizzes: Arc<dyn QuizStore>,
        results: Arc<dyn ResultStore>,
        sessions: Arc<SessionStore>,
        registry: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            events,
            quizzes,
            results,
            sessions,
            registry,
        }
    }

    pub async fn finalize(&self, quiz_event_id: QuizEventId) -> Result<FinalizeOutcome> {
        let event = self.events.event(quiz_event_id).await?;
        let mut quiz = self.quizzes.load(quiz_event_id).await?;

        let room = self.registry.get_room(&event.channel_code).await;
        if let Some(room) = &room {
            room.mark_ended();
        }

        let Some(session) = self.sessions.take(quiz_event_id).await else {
            tracing::debug!(quiz_event_id, "No answer session left, nothing to finalize");
            return Ok(FinalizeOutcome::AlreadyFinalized);
        };

        if let Some(room) = &room {
            if let Some(schedule) = room.schedule().await {
                quiz.start_time = Some(schedule.start_time);
            }
        }
        quiz.end_time = Some(Utc::now().timestamp_millis());
        tracing::debug!(
            quiz_event_id,
            participants = session.participant_count(),
            "Scoring answer session"
        );

        if let Err(e) = self.quizzes.save(quiz_event_id, &quiz).await {
            tracing::error!(quiz_event_id, error = %e, "Failed to stamp quiz definition, keeping answers");
            self.sessions.restore(quiz_event_id, session).await;
            return Err(e);
        }

        let mut scored = 0;
        let mut failed = 0;
        for (&user_id, answers) in session.participants() {
            let card = scorer::score(answers, &quiz);
            let analytics = match serde_json::to_value(&card.analytics) {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!(quiz_event_id, user_id, error = %e, "Failed to serialize analytics");
                    failed += 1;
                    continue;
                }
            };

            let result = EventResult {
                user_id,
                quiz_event_id,
                score: card.score,
                analytics,
                created_at: Utc::now(),
            };
            match self.results.create_result(result).await {
                Ok(()) => {
                    scored += 1;
                    tracing::debug!(quiz_event_id, user_id, score = card.score, "Saved result");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(quiz_event_id, user_id, error = %e, "Failed to save result");
                }
            }
        }

        if !quiz.status.can_advance_to(QuizStatus::Completed) {
            tracing::warn!(quiz_event_id, status = ?quiz.status, "Finalizing quiz that was not active");
        }
        quiz.status = QuizStatus::Completed;
        let completed = self.quizzes.save(quiz_event_id, &quiz).await;
        if let Err(e) = &completed {
            tracing::error!(quiz_event_id, error = %e, "Failed to mark quiz completed");
        }

        // Results are written either way, so the room still learns the event is over.
        if let Some(room) = &room {
            room.broadcast_all(ServerMessage::EndQuizEvent { results: true });
        }
        completed?;

        tracing::info!(quiz_event_id, scored, failed, "Quiz event finalized");
        Ok(FinalizeOutcome::Finalized { scored, failed })
    }
}
