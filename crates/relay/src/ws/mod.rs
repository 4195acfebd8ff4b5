pub mod handler;
pub mod protocol;

use axum::{routing::get, Router};

use crate::broadcast::ConnectionRegistry;
use crate::bus::EventBus;
use crate::presence::ViewSessionStore;
use crate::rooms::RoomRegistry;
use crate::stores::{MessageStore, NotificationStore, UserDirectory};

/// Shared state for the collaboration gateway.
#[derive(Clone)]
pub struct CollabState {
    pub sessions: ViewSessionStore,
    pub rooms: RoomRegistry,
    pub conns: ConnectionRegistry,
    pub bus: EventBus,
    pub directory: UserDirectory,
    pub messages: MessageStore,
    pub notifications: NotificationStore,
}

impl CollabState {
    /// State with in-memory stores, used when no database is configured.
    pub fn in_memory() -> Self {
        Self {
            sessions: ViewSessionStore::default(),
            rooms: RoomRegistry::default(),
            conns: ConnectionRegistry::default(),
            bus: EventBus::default(),
            directory: UserDirectory::in_memory(),
            messages: MessageStore::in_memory(),
            notifications: NotificationStore::in_memory(),
        }
    }
}

pub fn router(state: CollabState) -> Router {
    Router::new().route("/v1/ws", get(handler::ws_upgrade)).with_state(state)
}
