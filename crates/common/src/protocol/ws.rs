// WebSocket message types for the atelier-collab.v1 protocol.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CursorPosition, NotificationRecord, PresenceUser, UserCandidate};

/// All message types in the atelier-collab.v1 WebSocket protocol.
///
/// Client -> Server messages mirror user actions on the canvas; Server ->
/// Client messages are either a private reply to the origin connection or a
/// session/room broadcast. Broadcast payloads are tagged with the acting
/// user's durable id so receivers can suppress their own echo.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Client -> Server: join a view session with a user descriptor.
    JoinView {
        view_id: String,
        user: UserCandidate,
    },

    /// Client -> Server: leave a view session explicitly.
    LeaveView {
        view_id: String,
    },

    /// Client -> Server: cursor moved on the canvas.
    CursorMove {
        view_id: String,
        position: CursorPosition,
    },

    /// Client -> Server: a node was created or modified.
    NodeUpdate {
        view_id: String,
        node: serde_json::Value,
    },

    /// Client -> Server: an edge was created or modified.
    EdgeUpdate {
        view_id: String,
        edge: serde_json::Value,
    },

    /// Client -> Server: a node was deleted.
    NodeDelete {
        view_id: String,
        node_id: String,
    },

    /// Client -> Server: an edge was deleted.
    EdgeDelete {
        view_id: String,
        edge_id: String,
    },

    /// Client -> Server: the local selection changed.
    SelectionChange {
        view_id: String,
        selected_nodes: Vec<String>,
    },

    /// Client -> Server: subscribe to the direct-message room with another
    /// user. Messages for the pair are delivered to both orderings of the
    /// room name, so each side subscribes from its own perspective.
    JoinChat {
        user_id: String,
        target_user_id: String,
    },

    /// Bidirectional: a direct chat message. The server fills `sender_name`
    /// and `message_id` before fan-out.
    ChatMessage {
        from: String,
        to: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<Uuid>,
    },

    /// Client -> Server: subscribe to a user's live notification stream.
    JoinNotifications {
        user_id: String,
    },

    /// Bidirectional: a view was saved. The server resolves `saved_by` to a
    /// display name before fan-out.
    ViewSaved {
        view_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        saved_by: Option<String>,
    },

    /// Server -> Client (origin only): session snapshot after a join.
    /// Cursors are keyed by durable user id, not connection id.
    SessionState {
        view_id: String,
        users: Vec<PresenceUser>,
        cursors: HashMap<String, CursorPosition>,
        conn_id_to_user_id: HashMap<Uuid, String>,
    },

    /// Server -> Client (whole session): a user joined.
    UserJoined {
        view_id: String,
        user_id: String,
        user: PresenceUser,
        users: Vec<PresenceUser>,
        conn_id_to_user_id: HashMap<Uuid, String>,
    },

    /// Server -> Client (whole session): a user left.
    UserLeft {
        view_id: String,
        user_id: String,
        users: Vec<PresenceUser>,
    },

    /// Server -> Client: a remote cursor moved.
    CursorUpdate {
        view_id: String,
        user_id: String,
        position: CursorPosition,
    },

    /// Server -> Client: a node changed. Receivers discard events whose
    /// `user_id` equals their own.
    NodeChanged {
        view_id: String,
        user_id: String,
        node: serde_json::Value,
    },

    /// Server -> Client: an edge changed.
    EdgeChanged {
        view_id: String,
        user_id: String,
        edge: serde_json::Value,
    },

    /// Server -> Client: a node was deleted.
    NodeDeleted {
        view_id: String,
        user_id: String,
        node_id: String,
    },

    /// Server -> Client: an edge was deleted.
    EdgeDeleted {
        view_id: String,
        user_id: String,
        edge_id: String,
    },

    /// Server -> Client: a remote selection changed.
    SelectionChanged {
        view_id: String,
        user_id: String,
        selected_nodes: Vec<String>,
    },

    /// Server -> Client: a persisted notification for `user_id`.
    Notification {
        user_id: String,
        notification: NotificationRecord,
    },

    /// Server -> Client (origin only): error.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}
