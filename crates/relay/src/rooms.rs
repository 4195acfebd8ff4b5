// Room registry for chat pairing and notification fan-out.
//
// Rooms are independent of view sessions: they are created lazily on the
// first subscribe and pruned as soon as their connection set empties, so
// the registry never accumulates dead rooms.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::presence::ConnId;

/// Room carrying a user's live notification stream.
pub fn notification_room(user_id: &str) -> String {
    format!("notifications:{user_id}")
}

/// The two symmetric room names for a direct-message pair. Each side
/// subscribes to the ordering named from its own perspective; senders
/// publish to both, so delivery works regardless of who initiated the chat.
pub fn chat_room_names(user_a: &str, user_b: &str) -> [String; 2] {
    [format!("chat:{user_a}:{user_b}"), format!("chat:{user_b}:{user_a}")]
}

/// Named delivery groups: room name -> subscribed connection ids.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, HashSet<ConnId>>>>,
}

impl RoomRegistry {
    pub async fn join(&self, room: &str, conn_id: ConnId) {
        let mut guard = self.rooms.write().await;
        guard.entry(room.to_string()).or_default().insert(conn_id);
    }

    pub async fn leave(&self, room: &str, conn_id: ConnId) {
        let mut guard = self.rooms.write().await;
        if let Some(members) = guard.get_mut(room) {
            members.remove(&conn_id);
            if members.is_empty() {
                guard.remove(room);
            }
        }
    }

    /// Remove a connection from every room it joined (disconnect cleanup).
    pub async fn leave_all(&self, conn_id: ConnId) {
        let mut guard = self.rooms.write().await;
        guard.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    pub async fn members(&self, room: &str) -> Vec<ConnId> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn contains(&self, room: &str) -> bool {
        self.rooms.read().await.contains_key(room)
    }
}
