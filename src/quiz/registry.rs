use std::collections::HashMap;

use tokio::sync::RwLock;

use super::room::RoomHandle;
use crate::error::{QuizError, Result};
use crate::storage::{QuizEventId, UserId};

/// Process-wide lookup from channel code to live room.
///
/// Rooms are never dropped implicitly; `close_room` stops one and forgets it.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room, start its task and register it under `channel_code`.
    pub async fn create_room(
        &self,
        quiz_event_id: QuizEventId,
        channel_code: &str,
        moderator_id: UserId,
    ) -> Result<RoomHandle> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(channel_code) {
            return Err(QuizError::RoomAlreadyExists(channel_code.to_string()));
        }

        let room = RoomHandle::spawn(quiz_event_id, channel_code.to_string(), moderator_id);
        rooms.insert(channel_code.to_string(), room.clone());

        tracing::info!(
            room_id = %channel_code,
            quiz_event_id,
            moderator_id,
            "Room created"
        );
        Ok(room)
    }

    pub async fn get_room(&self, channel_code: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(channel_code).cloned()
    }

    pub async fn room(&self, channel_code: &str) -> Result<RoomHandle> {
        self.get_room(channel_code)
            .await
            .ok_or_else(|| QuizError::RoomNotFound(channel_code.to_string()))
    }

    /// Stop the room and remove it. False if it was not registered.
    pub async fn close_room(&self, channel_code: &str) -> bool {
        let room = self.rooms.write().await.remove(channel_code);
        match room {
            Some(room) => {
                room.stop();
                tracing::info!(room_id = %channel_code, "Room closed");
                true
            }
            None => false,
        }
    }
}
