use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use warp::ws::Message;

use super::protocol::ServerMessage;
use crate::storage::{QuizEventId, UserId};

/// Capacity of the per-room event feed observed by moderator listeners.
const EVENT_FEED_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub type ClientSender = mpsc::UnboundedSender<Message>;

/// One live socket, as seen by the room.
#[derive(Debug, Clone)]
pub struct Client {
    pub user_id: UserId,
    pub connection_id: u64,
    sender: ClientSender,
}

impl Client {
    pub fn new(user_id: UserId, sender: ClientSender) -> Self {
        Self {
            user_id,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    /// Queues a frame for the socket writer. False once the writer is gone.
    fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    fn close(&self) {
        let _ = self.sender.send(Message::close());
    }
}

/// What the room tells its observers after it acted.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Broadcast(ServerMessage),
    Removed(UserId),
    /// A newer socket of the same user took over this connection.
    Replaced { user_id: UserId, connection_id: u64 },
    Stopped,
}

enum RoomCommand {
    Register(Client),
    Unregister { user_id: UserId, connection_id: u64 },
    BroadcastAll(ServerMessage),
    SendToModerator(ServerMessage),
    SendToParticipant(UserId, ServerMessage),
    Remove(Vec<UserId>),
    SendRoster,
    Connected(oneshot::Sender<Vec<UserId>>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Unix milliseconds.
    pub start_time: i64,
    /// Unix milliseconds.
    pub end_time: i64,
}

struct RoomInner {
    channel_code: String,
    quiz_event_id: QuizEventId,
    moderator_id: UserId,
    allowed: RwLock<HashSet<UserId>>,
    schedule: RwLock<Option<Schedule>>,
    started: AtomicBool,
    ended: AtomicBool,
    commands: mpsc::UnboundedSender<RoomCommand>,
    events: broadcast::Sender<RoomEvent>,
}

/// Cheap, cloneable handle to a running room.
///
/// The client map belongs to the room's own task. Every membership change and
/// every send goes through the command queue, so operations on one room are
/// applied in arrival order. All senders below return immediately.
#[derive(Clone)]
pub struct RoomHandle {
    inner: Arc<RoomInner>,
}

impl RoomHandle {
    /// Creates the room and starts its processing task.
    pub fn spawn(quiz_event_id: QuizEventId, channel_code: String, moderator_id: UserId) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_FEED_CAPACITY);

        let actor = RoomActor {
            channel_code: channel_code.clone(),
            moderator_id,
            clients: HashMap::new(),
            events: events.clone(),
        };
        tokio::spawn(actor.run(receiver));

        Self {
            inner: Arc::new(RoomInner {
                channel_code,
                quiz_event_id,
                moderator_id,
                allowed: RwLock::new(HashSet::new()),
                schedule: RwLock::new(None),
                started: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                commands,
                events,
            }),
        }
    }

    pub fn channel_code(&self) -> &str {
        &self.inner.channel_code
    }

    pub fn quiz_event_id(&self) -> QuizEventId {
        self.inner.quiz_event_id
    }

    pub fn moderator_id(&self) -> UserId {
        self.inner.moderator_id
    }

    pub fn is_moderator(&self, user_id: UserId) -> bool {
        self.inner.moderator_id == user_id
    }

    /// False once the processing task has stopped.
    pub fn is_running(&self) -> bool {
        !self.inner.commands.is_closed()
    }

    pub fn register(&self, client: Client) {
        self.dispatch(RoomCommand::Register(client));
    }

    /// Removes the client if it is still the registered connection for its user.
    pub fn unregister(&self, client: &Client) {
        self.dispatch(RoomCommand::Unregister {
            user_id: client.user_id,
            connection_id: client.connection_id,
        });
    }

    pub fn broadcast_all(&self, message: ServerMessage) {
        self.dispatch(RoomCommand::BroadcastAll(message));
    }

    pub fn send_to_moderator(&self, message: ServerMessage) {
        self.dispatch(RoomCommand::SendToModerator(message));
    }

    pub fn send_to_participant(&self, user_id: UserId, message: ServerMessage) {
        self.dispatch(RoomCommand::SendToParticipant(user_id, message));
    }

    /// Notifies, disconnects and drops each listed user that is connected.
    pub fn remove_participants(&self, user_ids: Vec<UserId>) {
        self.dispatch(RoomCommand::Remove(user_ids));
    }

    /// Sends the connected participants to the moderator.
    pub fn send_roster_to_moderator(&self) {
        self.dispatch(RoomCommand::SendRoster);
    }

    pub fn stop(&self) {
        self.dispatch(RoomCommand::Stop);
    }

    /// Ids of every connected client, moderator included. Empty once stopped.
    pub async fn connected_clients(&self) -> Vec<UserId> {
        let (reply, response) = oneshot::channel();
        self.dispatch(RoomCommand::Connected(reply));
        response.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.events.subscribe()
    }

    /// Adds a pre-registered participant to the allow-list.
    pub async fn allow(&self, user_id: UserId) {
        self.inner.allowed.write().await.insert(user_id);
    }

    pub async fn is_allowed(&self, user_id: UserId) -> bool {
        self.inner.allowed.read().await.contains(&user_id)
    }

    /// The moderator, or anyone on the allow-list, may connect.
    pub async fn admits(&self, user_id: UserId) -> bool {
        self.is_moderator(user_id) || self.is_allowed(user_id).await
    }

    /// Records the schedule and flips `started`. Only the first call wins.
    pub async fn start(&self, schedule: Schedule) -> bool {
        let mut current = self.inner.schedule.write().await;
        if self.inner.started.load(Ordering::Acquire) {
            return false;
        }
        *current = Some(schedule);
        self.inner.started.store(true, Ordering::Release);
        true
    }

    /// Undoes a `start` whose state could not be persisted.
    pub async fn cancel_start(&self) {
        let mut current = self.inner.schedule.write().await;
        *current = None;
        self.inner.started.store(false, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub async fn schedule(&self) -> Option<Schedule> {
        *self.inner.schedule.read().await
    }

    /// Closes the room to further answers. True for the first caller only.
    pub fn mark_ended(&self) -> bool {
        !self.inner.ended.swap(true, Ordering::AcqRel)
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    pub fn accepts_answers(&self) -> bool {
        self.is_started() && !self.is_ended()
    }

    fn dispatch(&self, command: RoomCommand) {
        if self.inner.commands.send(command).is_err() {
            tracing::debug!(room_id = %self.inner.channel_code, "Room stopped, dropping operation");
        }
    }
}

/// Single writer over the client map.
struct RoomActor {
    channel_code: String,
    moderator_id: UserId,
    clients: HashMap<UserId, Client>,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomActor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<RoomCommand>) {
        tracing::info!(room_id = %self.channel_code, "Room is running");

        while let Some(command) = receiver.recv().await {
            match command {
                RoomCommand::Register(client) => self.register(client),
                RoomCommand::Unregister {
                    user_id,
                    connection_id,
                } => self.unregister(user_id, connection_id),
                RoomCommand::BroadcastAll(message) => self.broadcast_all(message),
                RoomCommand::SendToModerator(message) => {
                    let moderator_id = self.moderator_id;
                    self.send_to(moderator_id, &message);
                }
                RoomCommand::SendToParticipant(user_id, message) => self.send_to(user_id, &message),
                RoomCommand::Remove(user_ids) => self.remove(user_ids),
                RoomCommand::SendRoster => {
                    let mut clients: Vec<UserId> = self
                        .clients
                        .keys()
                        .copied()
                        .filter(|id| *id != self.moderator_id)
                        .collect();
                    clients.sort_unstable();
                    let moderator_id = self.moderator_id;
                    self.send_to(moderator_id, &ServerMessage::Clients { clients });
                }
                RoomCommand::Connected(reply) => {
                    let mut ids: Vec<UserId> = self.clients.keys().copied().collect();
                    ids.sort_unstable();
                    let _ = reply.send(ids);
                }
                RoomCommand::Stop => break,
            }
        }

        receiver.close();
        for client in self.clients.values() {
            client.close();
        }
        self.clients.clear();
        let _ = self.events.send(RoomEvent::Stopped);
        tracing::info!(room_id = %self.channel_code, "Room stopped");
    }

    fn register(&mut self, client: Client) {
        let user_id = client.user_id;
        if let Some(previous) = self.clients.insert(user_id, client) {
            tracing::info!(room_id = %self.channel_code, user_id, "Replacing older connection");
            previous.close();
            let _ = self.events.send(RoomEvent::Replaced {
                user_id,
                connection_id: previous.connection_id,
            });
        }
        tracing::info!(room_id = %self.channel_code, user_id, "Client joined room");
    }

    fn unregister(&mut self, user_id: UserId, connection_id: u64) {
        let current = self
            .clients
            .get(&user_id)
            .is_some_and(|c| c.connection_id == connection_id);
        if !current {
            return;
        }
        if let Some(client) = self.clients.remove(&user_id) {
            client.close();
            tracing::info!(room_id = %self.channel_code, user_id, "Client left room");
        }
    }

    fn broadcast_all(&mut self, message: ServerMessage) {
        match message.to_ws_message() {
            Ok(frame) => {
                let failed: Vec<UserId> = self
                    .clients
                    .values()
                    .filter(|client| !client.send(frame.clone()))
                    .map(|client| client.user_id)
                    .collect();
                for user_id in failed {
                    tracing::warn!(room_id = %self.channel_code, user_id, "Broadcast failed, evicting client");
                    self.clients.remove(&user_id);
                }
                tracing::debug!(
                    room_id = %self.channel_code,
                    kind = message.kind(),
                    recipients = self.clients.len(),
                    "Broadcast message"
                );
            }
            Err(e) => {
                tracing::error!(room_id = %self.channel_code, error = %e, "Failed to serialize broadcast");
            }
        }
        let _ = self.events.send(RoomEvent::Broadcast(message));
    }

    fn send_to(&mut self, user_id: UserId, message: &ServerMessage) {
        let Some(client) = self.clients.get(&user_id) else {
            tracing::debug!(room_id = %self.channel_code, user_id, kind = message.kind(), "Recipient not connected");
            return;
        };
        let delivered = match message.to_ws_message() {
            Ok(frame) => client.send(frame),
            Err(e) => {
                tracing::error!(room_id = %self.channel_code, error = %e, "Failed to serialize message");
                return;
            }
        };
        if !delivered {
            tracing::warn!(room_id = %self.channel_code, user_id, "Send failed, evicting client");
            self.clients.remove(&user_id);
        }
    }

    fn remove(&mut self, user_ids: Vec<UserId>) {
        for user_id in user_ids {
            match self.clients.remove(&user_id) {
                Some(client) => {
                    if let Ok(frame) = (ServerMessage::RemoveClient {}).to_ws_message() {
                        client.send(frame);
                    }
                    client.close();
                    let _ = self.events.send(RoomEvent::Removed(user_id));
                    tracing::info!(room_id = %self.channel_code, user_id, "Client removed by moderator");
                }
                None => {
                    tracing::debug!(room_id = %self.channel_code, user_id, "Remove ignored, client not connected");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn client(user_id: UserId) -> (Client, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Client::new(user_id, tx), rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let (moderator, _mrx) = client(100);
        let (student, mut srx) = client(7);

        room.register(moderator);
        room.register(student.clone());
        assert_eq!(room.connected_clients().await, vec![7, 100]);

        room.unregister(&student);
        room.unregister(&student);
        assert_eq!(room.connected_clients().await, vec![100]);
        assert!(frames(&mut srx).iter().any(Message::is_close));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let (first, mut first_rx) = client(7);
        let (second, _second_rx) = client(7);

        let mut feed = room.subscribe();

        room.register(first.clone());
        room.register(second);
        room.unregister(&first);

        assert_eq!(
            feed.recv().await.unwrap(),
            RoomEvent::Replaced {
                user_id: 7,
                connection_id: first.connection_id
            }
        );

        assert_eq!(room.connected_clients().await, vec![7]);
        assert!(frames(&mut first_rx).iter().any(Message::is_close));
    }

    #[tokio::test]
    async fn test_broadcast_evicts_broken_clients() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let (alive, mut alive_rx) = client(1);
        let (broken, broken_rx) = client(2);
        drop(broken_rx);

        room.register(alive);
        room.register(broken);
        room.broadcast_all(ServerMessage::EndQuizEvent { results: true });

        assert_eq!(room.connected_clients().await, vec![1]);
        let received = frames(&mut alive_rx);
        assert_eq!(received.len(), 1);
        assert!(received[0].to_str().unwrap().contains("end_quiz_event"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let mut feed = room.subscribe();

        room.broadcast_all(ServerMessage::EndQuizEvent { results: true });
        assert_eq!(
            feed.recv().await.unwrap(),
            RoomEvent::Broadcast(ServerMessage::EndQuizEvent { results: true })
        );
    }

    #[tokio::test]
    async fn test_addressed_sends() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let (moderator, mut mrx) = client(100);
        let (student, mut srx) = client(7);
        room.register(moderator);
        room.register(student);

        room.send_to_participant(7, ServerMessage::error("hello"));
        room.send_roster_to_moderator();
        room.connected_clients().await;

        let to_student = frames(&mut srx);
        assert_eq!(to_student.len(), 1);
        let to_moderator = frames(&mut mrx);
        assert_eq!(to_moderator.len(), 1);
        let roster: serde_json::Value =
            serde_json::from_str(to_moderator[0].to_str().unwrap()).unwrap();
        assert_eq!(roster["type"], "clients");
        assert_eq!(roster["payload"]["clients"], serde_json::json!([7]));
    }

    #[tokio::test]
    async fn test_remove_participants() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let mut feed = room.subscribe();
        let (student, mut srx) = client(7);
        room.register(student);

        room.remove_participants(vec![7, 8]);
        assert!(room.connected_clients().await.is_empty());

        let received = frames(&mut srx);
        assert!(received[0].to_str().unwrap().contains("remove_client"));
        assert!(received[1].is_close());
        assert_eq!(feed.recv().await.unwrap(), RoomEvent::Removed(7));
    }

    #[tokio::test]
    async fn test_stop_closes_everyone() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        let mut feed = room.subscribe();
        let (student, mut srx) = client(7);
        room.register(student);

        room.stop();
        assert_eq!(feed.recv().await.unwrap(), RoomEvent::Stopped);
        assert!(frames(&mut srx).iter().any(Message::is_close));
        assert!(!room.is_running());

        let (late, _late_rx) = client(8);
        room.register(late);
        assert!(room.connected_clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_is_monotonic() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        assert!(!room.accepts_answers());

        let first = Schedule { start_time: 10, end_time: 20 };
        assert!(room.start(first).await);
        assert!(!room.start(Schedule { start_time: 30, end_time: 40 }).await);
        assert_eq!(room.schedule().await, Some(first));
        assert!(room.accepts_answers());

        room.cancel_start().await;
        assert!(!room.accepts_answers());
        assert_eq!(room.schedule().await, None);
        assert!(room.start(first).await);

        assert!(room.mark_ended());
        assert!(!room.mark_ended());
        assert!(room.is_started());
        assert!(!room.accepts_answers());
    }

    #[tokio::test]
    async fn test_admission_allow_list() {
        let room = RoomHandle::spawn(1, "abc".to_string(), 100);
        room.allow(7).await;

        assert!(room.admits(100).await);
        assert!(room.admits(7).await);
        assert!(!room.admits(8).await);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(UserId),
        Unregister(UserId),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..6).prop_map(Op::Register),
            (0u64..6).prop_map(Op::Unregister),
        ]
    }

    proptest! {
        #[test]
        fn membership_matches_total_order(ops in proptest::collection::vec(op(), 0..60)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let (actual, expected) = rt.block_on(async {
                let room = RoomHandle::spawn(1, "prop".to_string(), 1_000);

                // One task per user; tasks interleave freely, each user's ops stay ordered.
                let mut per_user: HashMap<UserId, Vec<Op>> = HashMap::new();
                for op in &ops {
                    let user = match op { Op::Register(u) | Op::Unregister(u) => *u };
                    per_user.entry(user).or_default().push(op.clone());
                }

                let mut expected = BTreeSet::new();
                let mut tasks = Vec::new();
                for (user, user_ops) in per_user {
                    // Unregister always targets the latest connection, so the
                    // last operation alone decides membership.
                    if matches!(user_ops.last(), Some(Op::Register(_))) {
                        expected.insert(user);
                    }

                    let room = room.clone();
                    tasks.push(tokio::spawn(async move {
                        let mut receivers = Vec::new();
                        let mut latest: Option<Client> = None;
                        for op in user_ops {
                            match op {
                                Op::Register(u) => {
                                    let (c, rx) = client(u);
                                    receivers.push(rx);
                                    room.register(c.clone());
                                    latest = Some(c);
                                }
                                Op::Unregister(_) => {
                                    if let Some(c) = &latest {
                                        room.unregister(c);
                                    }
                                }
                            }
                            tokio::task::yield_now().await;
                        }
                        receivers
                    }));
                }

                let mut keep_alive = Vec::new();
                for task in tasks {
                    keep_alive.push(task.await.unwrap());
                }
                let actual: BTreeSet<UserId> = room.connected_clients().await.into_iter().collect();
                (actual, expected)
            });
            prop_assert_eq!(actual, expected);
        }
    }
}
