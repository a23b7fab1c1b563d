use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::finalizer::FinalizeOutcome;
use super::protocol::{AnswerPayload, ClientMessage, ServerMessage};
use super::room::{Client, ClientSender, RoomEvent, RoomHandle};
use super::service::QuizService;
use crate::error::{QuizError, Result};
use crate::storage::{QuizEventId, User, UserId};

/// Per-connection state for one admitted socket.
pub struct ConnectionHandler {
    service: Arc<QuizService>,
    room: RoomHandle,
    client: Client,
    user: User,
}

impl ConnectionHandler {
    /// Resolves the user, checks they may enter the room, and registers the
    /// socket. Fails closed: any lookup error rejects the connection.
    pub async fn admit(
        service: Arc<QuizService>,
        channel_code: &str,
        user_id: UserId,
        sender: ClientSender,
    ) -> Result<Self> {
        let user = service.identities().user(user_id).await?;
        let room = service.registry().room(channel_code).await?;
        if !room.admits(user.id).await {
            return Err(QuizError::NotAParticipant(user.id));
        }

        let client = Client::new(user.id, sender);
        if room.is_moderator(user.id) {
            // Subscribe before registering so no start broadcast slips past.
            let feed = room.subscribe();
            tokio::spawn(moderator_listener(
                service.clone(),
                room.clone(),
                feed,
                client.connection_id,
            ));
        }
        room.register(client.clone());

        tracing::info!(
            room_id = %channel_code,
            user_id = user.id,
            moderator = room.is_moderator(user.id),
            "Connection admitted"
        );
        Ok(Self {
            service,
            room,
            client,
            user,
        })
    }

    pub fn is_moderator(&self) -> bool {
        self.room.is_moderator(self.user.id)
    }

    /// Decodes and dispatches one text frame. Bad frames are logged and dropped.
    pub async fn handle_text(&self, text: &str) {
        tracing::debug!(user_id = self.user.id, "Received message: {}", text);

        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                tracing::warn!(
                    room_id = %self.room.channel_code(),
                    user_id = self.user.id,
                    error = %e,
                    raw_message = %text,
                    "Failed to parse client message"
                );
            }
        }
    }

    pub async fn handle_message(&self, message: ClientMessage) {
        if message.is_moderator_only() && !self.is_moderator() {
            tracing::warn!(
                room_id = %self.room.channel_code(),
                user_id = self.user.id,
                "Ignoring moderator message from participant"
            );
            return;
        }

        match message {
            ClientMessage::GetClients => self.room.send_roster_to_moderator(),
            ClientMessage::RemoveClients(payload) => {
                tracing::info!(
                    room_id = %self.room.channel_code(),
                    clients = ?payload.client_list,
                    "Moderator removing clients"
                );
                self.room.remove_participants(payload.client_list);
            }
            ClientMessage::Answer(answer) => self.submit_answer(answer).await,
        }
    }

    async fn submit_answer(&self, answer: AnswerPayload) {
        if self.is_moderator() {
            tracing::debug!(room_id = %self.room.channel_code(), "Ignoring answer from moderator");
            return;
        }
        if !self.room.accepts_answers() {
            tracing::debug!(
                room_id = %self.room.channel_code(),
                user_id = self.user.id,
                question_id = answer.question_id,
                "Quiz event not running, dropping answer"
            );
            return;
        }

        let timestamp = Utc::now().timestamp_millis();
        let recorded = self
            .service
            .sessions()
            .record_answer(
                self.room.quiz_event_id(),
                self.user.id,
                answer.question_id,
                answer.answer,
                timestamp,
            )
            .await;
        if !recorded {
            tracing::debug!(
                room_id = %self.room.channel_code(),
                user_id = self.user.id,
                question_id = answer.question_id,
                "Quiz event already finalized, dropping answer"
            );
            return;
        }

        self.room.send_to_moderator(ServerMessage::AnswerUpdate {
            user_id: self.user.id,
            question_id: answer.question_id,
            timestamp,
        });
    }

    /// Deregisters this connection. A newer connection of the same user is
    /// left untouched.
    pub fn cleanup(&self) {
        self.room.unregister(&self.client);
        tracing::info!(
            room_id = %self.room.channel_code(),
            user_id = self.user.id,
            "Connection closed"
        );
    }
}

/// Watches the room on behalf of one moderator connection. Arms the auto-end
/// timer when the event starts and closes the room once the end broadcast went
/// out. Hands over to the newer listener when the moderator reconnects.
async fn moderator_listener(
    service: Arc<QuizService>,
    room: RoomHandle,
    mut feed: broadcast::Receiver<RoomEvent>,
    connection_id: u64,
) {
    let mut timer: Option<JoinHandle<()>> = None;
    if let Some(schedule) = room.schedule().await {
        if !room.is_ended() {
            timer = Some(arm_end_timer(service.clone(), room.quiz_event_id(), schedule.end_time));
        }
    }

    loop {
        match feed.recv().await {
            Ok(RoomEvent::Broadcast(ServerMessage::StartQuizEvent { quiz_id, end_time, .. })) => {
                if timer.is_none() {
                    timer = Some(arm_end_timer(service.clone(), quiz_id, end_time));
                }
            }
            Ok(RoomEvent::Broadcast(ServerMessage::EndQuizEvent { .. })) => {
                service.close_room(&room).await;
                break;
            }
            Ok(RoomEvent::Replaced {
                connection_id: replaced,
                ..
            }) if replaced == connection_id => {
                // The newer connection's listener arms its own timer.
                if let Some(timer) = timer.take() {
                    timer.abort();
                }
                tracing::debug!(room_id = %room.channel_code(), "Moderator reconnected");
                break;
            }
            Ok(RoomEvent::Removed(user_id)) if room.is_moderator(user_id) => break,
            Ok(RoomEvent::Stopped) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(room_id = %room.channel_code(), skipped, "Moderator listener lagged");
            }
        }
    }

    tracing::debug!(room_id = %room.channel_code(), connection_id, "Moderator listener finished");
}

fn arm_end_timer(service: Arc<QuizService>, quiz_event_id: QuizEventId, end_time: i64) -> JoinHandle<()> {
    let delay = end_time.saturating_sub(Utc::now().timestamp_millis()).max(0) as u64;
    tracing::info!(quiz_event_id, delay_ms = delay, "Auto-end timer armed");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        // Detached, so aborting the timer never interrupts a finalize in flight.
        tokio::spawn(auto_end(service, quiz_event_id));
    })
}

async fn auto_end(service: Arc<QuizService>, quiz_event_id: QuizEventId) {
    match service.finalize(quiz_event_id).await {
        Ok(FinalizeOutcome::AlreadyFinalized) => {
            tracing::debug!(quiz_event_id, "Auto-end fired after event was finalized");
        }
        Ok(FinalizeOutcome::Finalized { scored, failed }) => {
            tracing::info!(quiz_event_id, scored, failed, "Quiz event auto-ended");
        }
        Err(e) => {
            tracing::error!(quiz_event_id, error = %e, "Auto-end failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, QuizDefinition, QuizStatus, QuizStore, ResultStore, Role};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use warp::ws::Message;

    const TEACHER: u64 = 1;
    const ALICE: u64 = 2;
    const BOB: u64 = 3;

    struct Fixture {
        service: Arc<QuizService>,
        store: Arc<MemoryStore>,
        teacher: User,
        event_id: QuizEventId,
        channel_code: String,
    }

    async fn fixture(duration: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        for (id, role) in [(TEACHER, Role::Teacher), (ALICE, Role::Student), (BOB, Role::Student)] {
            let user = User {
                id,
                email: format!("{id}@example.com"),
                role,
            };
            store.add_user(user, format!("token-{id}")).await;
        }
        let service = Arc::new(QuizService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        ));

        let teacher = service.authenticate("token-1").await.unwrap();
        let quiz: QuizDefinition = serde_json::from_value(json!({
            "duration": duration,
            "questions": [
                {"id": 1, "type": "mcq", "points": 5, "options": ["Paris", "Rome"], "correct_answer": "Paris"},
                {"id": 3, "type": "numeric", "points": 5, "correct_answer": 27}
            ]
        }))
        .unwrap();
        let event = service
            .create_event(&teacher, "Capitals".to_string(), quiz)
            .await
            .unwrap();
        let alice = service.authenticate("token-2").await.unwrap();
        service.join_event(&alice, &event.channel_code).await.unwrap();

        Fixture {
            service,
            store,
            teacher,
            event_id: event.id,
            channel_code: event.channel_code,
        }
    }

    async fn connect(
        fx: &Fixture,
        user_id: UserId,
    ) -> Result<(ConnectionHandler, mpsc::UnboundedReceiver<Message>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::admit(fx.service.clone(), &fx.channel_code, user_id, tx).await?;
        Ok((handler, rx))
    }

    async fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        serde_json::from_str(message.to_str().unwrap()).unwrap()
    }

    fn answer(question_id: u32, answer: Value) -> String {
        json!({"type": "answer", "payload": {"question_id": question_id, "answer": answer}}).to_string()
    }

    #[tokio::test]
    async fn test_admission_rules() {
        let fx = fixture(60).await;

        assert!(connect(&fx, TEACHER).await.is_ok());
        assert!(connect(&fx, ALICE).await.is_ok());
        assert!(matches!(
            connect(&fx, BOB).await,
            Err(QuizError::NotAParticipant(BOB))
        ));
        assert!(matches!(
            connect(&fx, 99).await,
            Err(QuizError::UserNotFound(99))
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        let unknown_room = ConnectionHandler::admit(fx.service.clone(), "nope", ALICE, tx).await;
        assert!(matches!(unknown_room, Err(QuizError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_answer_before_start_is_dropped() {
        let fx = fixture(60).await;
        let (alice, _rx) = connect(&fx, ALICE).await.unwrap();

        alice.handle_text(&answer(1, json!("Paris"))).await;

        assert!(fx.service.sessions().answers_of(fx.event_id, ALICE).await.is_none());
    }

    #[tokio::test]
    async fn test_answers_reach_session_and_moderator() {
        let fx = fixture(60).await;
        let (_teacher, mut teacher_rx) = connect(&fx, TEACHER).await.unwrap();
        let (alice, mut alice_rx) = connect(&fx, ALICE).await.unwrap();

        fx.service.start_event(&fx.teacher, fx.event_id).await.unwrap();
        assert_eq!(next_json(&mut teacher_rx).await["type"], "start_quiz_event");
        let start = next_json(&mut alice_rx).await;
        assert_eq!(start["payload"]["quiz_id"], fx.event_id);
        assert!(start["payload"]["quiz_json"]["questions"][0]
            .get("correct_answer")
            .is_none());

        alice.handle_text(&answer(3, json!(20))).await;
        alice.handle_text(&answer(3, json!(27))).await;

        let update = next_json(&mut teacher_rx).await;
        assert_eq!(update["type"], "answer_update");
        assert_eq!(update["payload"]["user_id"], ALICE);
        assert_eq!(update["payload"]["question_id"], 3);

        let answers = fx
            .service
            .sessions()
            .answers_of(fx.event_id, ALICE)
            .await
            .unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[&3].answer, json!(27));
    }

    #[tokio::test]
    async fn test_participant_cannot_use_moderator_messages() {
        let fx = fixture(60).await;
        let (_teacher, mut teacher_rx) = connect(&fx, TEACHER).await.unwrap();
        let (alice, _alice_rx) = connect(&fx, ALICE).await.unwrap();

        alice
            .handle_text(r#"{"type":"remove_clients","payload":{"client_list":[1]}}"#)
            .await;
        alice.handle_text(r#"{"type":"get_clients","payload":{}}"#).await;
        alice.handle_text("not json").await;
        alice.handle_text(r#"{"type":"dance"}"#).await;

        let room = fx.service.registry().room(&fx.channel_code).await.unwrap();
        assert_eq!(room.connected_clients().await, vec![TEACHER, ALICE]);
        assert!(teacher_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_moderator_roster_and_removal() {
        let fx = fixture(60).await;
        let (teacher, mut teacher_rx) = connect(&fx, TEACHER).await.unwrap();
        let (_alice, mut alice_rx) = connect(&fx, ALICE).await.unwrap();

        teacher.handle_text(r#"{"type":"get_clients","payload":{}}"#).await;
        let roster = next_json(&mut teacher_rx).await;
        assert_eq!(roster["type"], "clients");
        assert_eq!(roster["payload"]["clients"], json!([ALICE]));

        teacher
            .handle_text(r#"{"type":"remove_clients","payload":{"client_list":[2, 77]}}"#)
            .await;
        assert_eq!(next_json(&mut alice_rx).await["type"], "remove_client");

        let room = fx.service.registry().room(&fx.channel_code).await.unwrap();
        assert_eq!(room.connected_clients().await, vec![TEACHER]);
    }

    #[tokio::test]
    async fn test_stale_cleanup_keeps_new_connection() {
        let fx = fixture(60).await;
        let (old, _old_rx) = connect(&fx, ALICE).await.unwrap();
        let (_new, _new_rx) = connect(&fx, ALICE).await.unwrap();

        old.cleanup();

        let room = fx.service.registry().room(&fx.channel_code).await.unwrap();
        assert_eq!(room.connected_clients().await, vec![ALICE]);
    }

    #[tokio::test]
    async fn test_manual_end_closes_room() {
        let fx = fixture(60).await;
        let (_teacher, mut teacher_rx) = connect(&fx, TEACHER).await.unwrap();
        let (alice, mut alice_rx) = connect(&fx, ALICE).await.unwrap();

        fx.service.start_event(&fx.teacher, fx.event_id).await.unwrap();
        next_json(&mut alice_rx).await;
        alice.handle_text(&answer(1, json!(["Paris"]))).await;
        alice.handle_text(&answer(3, json!(27))).await;

        fx.service.end_event(&fx.teacher, fx.event_id).await.unwrap();

        let mut saw_end = false;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_secs(2), teacher_rx.recv()).await
        {
            if frame.is_close() {
                break;
            }
            let value: Value = serde_json::from_str(frame.to_str().unwrap()).unwrap();
            if value["type"] == "end_quiz_event" {
                assert_eq!(value["payload"]["results"], true);
                saw_end = true;
            }
        }
        assert!(saw_end);

        let results = fx.store.results_for_event(fx.event_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 10);

        // Late answers are ignored once the event ended.
        alice.handle_text(&answer(1, json!("Rome"))).await;
        assert!(fx.service.sessions().answers_of(fx.event_id, ALICE).await.is_none());

        for _ in 0..50 {
            if fx.service.registry().get_room(&fx.channel_code).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.service.registry().get_room(&fx.channel_code).await.is_none());
    }

    #[tokio::test]
    async fn test_reconnecting_moderator_retires_old_listener() {
        let fx = fixture(60).await;
        let room = fx.service.registry().room(&fx.channel_code).await.unwrap();
        fx.service.start_event(&fx.teacher, fx.event_id).await.unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let first = Client::new(TEACHER, tx);
        let listener = tokio::spawn(moderator_listener(
            fx.service.clone(),
            room.clone(),
            room.subscribe(),
            first.connection_id,
        ));
        room.register(first);

        let (_second, _second_rx) = connect(&fx, TEACHER).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("old listener kept running")
            .unwrap();

        // The newer listener still closes the room at the end.
        fx.service.end_event(&fx.teacher, fx.event_id).await.unwrap();
        for _ in 0..50 {
            if fx.service.registry().get_room(&fx.channel_code).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fx.service.registry().get_room(&fx.channel_code).await.is_none());
    }

    #[tokio::test]
    async fn test_timer_ends_event() {
        let fx = fixture(1).await;
        let (_teacher, _teacher_rx) = connect(&fx, TEACHER).await.unwrap();
        let (alice, _alice_rx) = connect(&fx, ALICE).await.unwrap();

        fx.service.start_event(&fx.teacher, fx.event_id).await.unwrap();
        alice.handle_text(&answer(3, json!(27))).await;

        let mut completed = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if fx.store.load(fx.event_id).await.unwrap().status == QuizStatus::Completed {
                completed = true;
                break;
            }
        }
        assert!(completed);
        assert_eq!(fx.store.results_for_event(fx.event_id).await.unwrap().len(), 1);
    }
}
