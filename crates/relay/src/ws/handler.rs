use super::protocol as ws_protocol;
use super::CollabState;
use crate::bus::{view_topic, CollabEvent, EventKind, Recipient};
use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
};
use crate::identity::{self, is_placeholder_name, PLACEHOLDER_NAME};
use crate::presence::ConnId;
use crate::rooms::{chat_room_names, notification_room};
use atelier_common::protocol::ws::WsMessage;
use atelier_common::types::{
    ChatMessageRecord, CursorPosition, NotificationRecord, NotificationSeverity, PresenceUser,
    UserCandidate,
};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

pub const HEARTBEAT_INTERVAL_MS: u32 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: u32 = 262_144;

pub async fn ws_upgrade(
    State(state): State<CollabState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let conn_id: ConnId = Uuid::new_v4();
    ws.max_frame_size(MAX_FRAME_BYTES as usize).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, conn_id, socket)).await;
    })
}

fn frame_size_exceeded_reason() -> String {
    format!("websocket frame exceeds maximum size of {MAX_FRAME_BYTES} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason().into(),
        })))
        .await;
}

fn error_frame(code: ErrorCode, message: impl Into<String>) -> WsMessage {
    WsMessage::Error {
        code: code.as_str().to_string(),
        message: message.into(),
        retryable: code.retryable(),
    }
}

async fn handle_socket(state: CollabState, conn_id: ConnId, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let mut outbound_receiver = state.conns.register(conn_id).await;

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval =
        tokio::time::interval(std::time::Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64));
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = std::time::Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(
                        conn_id = %conn_id,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if ws_protocol::send_ws_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            close_frame_too_large(&mut socket).await;
                            break;
                        }

                        let inbound = match ws_protocol::decode_message(&raw_message) {
                            Ok(message) => message,
                            Err(_) => {
                                let invalid = error_frame(
                                    ErrorCode::InvalidMessage,
                                    ErrorCode::InvalidMessage.default_message(),
                                );
                                if ws_protocol::send_ws_message(&mut socket, &invalid)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                continue;
                            }
                        };

                        if let Some(reply) = dispatch(&state, conn_id, inbound).await {
                            if ws_protocol::send_ws_message(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    cleanup_connection(&state, conn_id).await;
}

/// Route one inbound client message. Returns the direct reply to send on
/// this socket, if any; broadcasts go through the event bus.
async fn dispatch(state: &CollabState, conn_id: ConnId, inbound: WsMessage) -> Option<WsMessage> {
    match inbound {
        WsMessage::JoinView { view_id, user } => {
            Some(match handle_join_view(state, conn_id, &view_id, user).await {
                Ok(session_state) => session_state,
                Err(rejection) => rejection,
            })
        }
        WsMessage::LeaveView { view_id } => {
            handle_leave_view(state, conn_id, &view_id).await;
            None
        }
        WsMessage::CursorMove { view_id, position } => {
            handle_cursor_move(state, conn_id, &view_id, position).await;
            None
        }
        WsMessage::NodeUpdate { view_id, node } => {
            handle_node_update(state, conn_id, &view_id, node).await.err()
        }
        WsMessage::EdgeUpdate { view_id, edge } => {
            handle_edge_update(state, conn_id, &view_id, edge).await.err()
        }
        WsMessage::NodeDelete { view_id, node_id } => {
            handle_node_delete(state, conn_id, &view_id, node_id).await.err()
        }
        WsMessage::EdgeDelete { view_id, edge_id } => {
            handle_edge_delete(state, conn_id, &view_id, edge_id).await.err()
        }
        WsMessage::SelectionChange { view_id, selected_nodes } => {
            handle_selection_change(state, conn_id, &view_id, selected_nodes).await.err()
        }
        WsMessage::JoinChat { user_id, target_user_id } => {
            handle_join_chat(state, conn_id, &user_id, &target_user_id).await;
            None
        }
        WsMessage::ChatMessage { from, to, message, timestamp, sender_name, message_id } => {
            handle_chat_message(state, conn_id, from, to, message, timestamp, sender_name, message_id)
                .await;
            None
        }
        WsMessage::JoinNotifications { user_id } => {
            handle_join_notifications(state, conn_id, &user_id).await;
            None
        }
        WsMessage::ViewSaved { view_id, saved_by } => {
            handle_view_saved(state, conn_id, &view_id, saved_by).await.err()
        }
        _ => Some(error_frame(
            ErrorCode::InvalidMessage,
            "message type is not accepted from clients",
        )),
    }
}

/// The current members of a view, captured at publish time so delivery
/// matches the session state this handler saw.
async fn view_audience(state: &CollabState, view_id: &str) -> Vec<Recipient> {
    state
        .sessions
        .members(view_id)
        .await
        .into_iter()
        .map(|(conn_id, user)| Recipient { conn_id, user_id: Some(user.id) })
        .collect()
}

/// The current subscribers of a room. Room members carry no per-member
/// identity.
async fn room_audience(state: &CollabState, room: &str) -> Vec<Recipient> {
    state
        .rooms
        .members(room)
        .await
        .into_iter()
        .map(|conn_id| Recipient { conn_id, user_id: None })
        .collect()
}

/// Validate the joining identity, re-validate existing members, admit the
/// connection, and broadcast `user_joined`. Returns the `session_state`
/// reply for the joiner.
pub(crate) async fn handle_join_view(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    candidate: UserCandidate,
) -> Result<WsMessage, WsMessage> {
    let user = match identity::enrich(&state.directory, &candidate).await {
        Ok(user) => user,
        Err(rejection) => {
            warn!(
                user_id = %candidate.id,
                view_id = %view_id,
                reason = %rejection.reason,
                "rejected join_view identity"
            );
            return Err(error_frame(ErrorCode::IdentityRejected, rejection.reason));
        }
    };

    revalidate_members(state, view_id).await;

    state.sessions.insert_member(view_id, conn_id, user.clone()).await;
    let snapshot = state
        .sessions
        .snapshot(view_id)
        .await
        .ok_or_else(|| error_frame(ErrorCode::InternalError, "view session vanished during join"))?;

    // The snapshot's connection map doubles as the broadcast audience.
    let audience = snapshot
        .conn_id_to_user_id
        .iter()
        .map(|(member_conn, user_id)| Recipient {
            conn_id: *member_conn,
            user_id: Some(user_id.clone()),
        })
        .collect();

    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::UserJoined,
        message: WsMessage::UserJoined {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            user: user.clone(),
            users: snapshot.users.clone(),
            conn_id_to_user_id: snapshot.conn_id_to_user_id.clone(),
        },
        origin_user_id: Some(user.id.clone()),
        origin_conn_id: Some(conn_id),
        audience,
    });

    Ok(WsMessage::SessionState {
        view_id: view_id.to_string(),
        users: snapshot.users,
        cursors: snapshot.cursors,
        conn_id_to_user_id: snapshot.conn_id_to_user_id,
    })
}

/// Re-run enrichment for every current member from its stored descriptor.
/// Members whose identity no longer resolves are evicted without a
/// broadcast; the refreshed roster reaches clients in the next
/// `user_joined` payload.
async fn revalidate_members(state: &CollabState, view_id: &str) {
    let mut evicted = Vec::new();
    for (member_conn, member) in state.sessions.members(view_id).await {
        let descriptor = UserCandidate {
            id: member.id.clone(),
            name: Some(member.name.clone()),
            color: Some(member.color.clone()),
        };
        if let Err(rejection) = identity::enrich(&state.directory, &descriptor).await {
            warn!(
                user_id = %member.id,
                view_id = %view_id,
                reason = %rejection.reason,
                "evicting session member that no longer passes validation"
            );
            evicted.push(member_conn);
        }
    }
    if !evicted.is_empty() {
        state.sessions.remove_members(view_id, &evicted).await;
    }
}

/// Leaving a view the connection never joined is a no-op.
pub(crate) async fn handle_leave_view(state: &CollabState, conn_id: ConnId, view_id: &str) {
    let Some(user) = state.sessions.remove_member(view_id, conn_id).await else {
        return;
    };
    publish_user_left(state, view_id, &user.id, conn_id).await;
}

async fn publish_user_left(state: &CollabState, view_id: &str, user_id: &str, conn_id: ConnId) {
    let users = state.sessions.valid_users(view_id).await;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::UserLeft,
        message: WsMessage::UserLeft {
            view_id: view_id.to_string(),
            user_id: user_id.to_string(),
            users,
        },
        origin_user_id: Some(user_id.to_string()),
        origin_conn_id: Some(conn_id),
        audience,
    });
}

/// Cursor moves from non-members are discarded silently; cursor traffic is
/// too frequent to answer each stray update with an error frame.
pub(crate) async fn handle_cursor_move(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    position: CursorPosition,
) {
    let Some(user_id) = state.sessions.set_cursor(view_id, conn_id, position).await else {
        return;
    };
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::CursorUpdate,
        message: WsMessage::CursorUpdate {
            view_id: view_id.to_string(),
            user_id: user_id.clone(),
            position,
        },
        origin_user_id: Some(user_id),
        origin_conn_id: Some(conn_id),
        audience,
    });
}

async fn require_member(
    state: &CollabState,
    view_id: &str,
    conn_id: ConnId,
) -> Result<PresenceUser, WsMessage> {
    state
        .sessions
        .member(view_id, conn_id)
        .await
        .ok_or_else(|| error_frame(ErrorCode::ViewNotJoined, ErrorCode::ViewNotJoined.default_message()))
}

pub(crate) async fn handle_node_update(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    node: serde_json::Value,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::NodeChanged,
        message: WsMessage::NodeChanged {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            node,
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

pub(crate) async fn handle_edge_update(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    edge: serde_json::Value,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::EdgeChanged,
        message: WsMessage::EdgeChanged {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            edge,
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

pub(crate) async fn handle_node_delete(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    node_id: String,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::NodeDeleted,
        message: WsMessage::NodeDeleted {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            node_id,
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

pub(crate) async fn handle_edge_delete(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    edge_id: String,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::EdgeDeleted,
        message: WsMessage::EdgeDeleted {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            edge_id,
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

pub(crate) async fn handle_selection_change(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    selected_nodes: Vec<String>,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let audience = view_audience(state, view_id).await;
    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::SelectionChanged,
        message: WsMessage::SelectionChanged {
            view_id: view_id.to_string(),
            user_id: user.id.clone(),
            selected_nodes,
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

/// Subscribe this connection to its side of the direct-message pair. The
/// sender publishes to both orderings, so each participant only needs the
/// room named from its own perspective.
pub(crate) async fn handle_join_chat(
    state: &CollabState,
    conn_id: ConnId,
    user_id: &str,
    target_user_id: &str,
) {
    let [own_room, _] = chat_room_names(user_id, target_user_id);
    state.rooms.join(&own_room, conn_id).await;
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn handle_chat_message(
    state: &CollabState,
    conn_id: ConnId,
    from: String,
    to: String,
    message: String,
    timestamp: Option<DateTime<Utc>>,
    sender_name: Option<String>,
    message_id: Option<Uuid>,
) {
    let record = ChatMessageRecord {
        id: message_id.unwrap_or_else(Uuid::new_v4),
        from_id: from.clone(),
        to_id: to.clone(),
        message: message.clone(),
        created_at: timestamp.unwrap_or_else(Utc::now),
    };

    // Persistence failures must not interrupt live delivery.
    if let Err(persist_error) = state.messages.insert_message(&record).await {
        error!(
            from = %from,
            to = %to,
            message_id = %record.id,
            error = ?persist_error,
            "failed to persist chat message, delivering live anyway"
        );
    }

    // Display name: hint, else any active session presence, else the
    // placeholder. The wire frame always carries a name.
    let sender_name = match sender_name.filter(|name| !is_placeholder_name(name)) {
        Some(name) => name,
        None => state
            .sessions
            .display_name_for(&from)
            .await
            .unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
    };

    let outbound = WsMessage::ChatMessage {
        from: from.clone(),
        to,
        message,
        timestamp: Some(record.created_at),
        sender_name: Some(sender_name.clone()),
        message_id: Some(record.id),
    };

    // Both orderings of the pair, so each side's subscription hears it.
    // Self-chat collapses to a single room.
    let [own_room, peer_room] = chat_room_names(&record.from_id, &record.to_id);
    let mut delivery_rooms = vec![own_room];
    if peer_room != delivery_rooms[0] {
        delivery_rooms.push(peer_room);
    }
    for room in delivery_rooms {
        let audience = room_audience(state, &room).await;
        state.bus.publish(CollabEvent {
            topic: room,
            kind: EventKind::ChatMessage,
            message: outbound.clone(),
            origin_user_id: Some(from.clone()),
            origin_conn_id: Some(conn_id),
            audience,
        });
    }

    notify_chat_recipient(state, &record, &sender_name).await;
}

/// Create the recipient's notification for an incoming chat message. Failures
/// here never affect the already-delivered message.
async fn notify_chat_recipient(
    state: &CollabState,
    record: &ChatMessageRecord,
    sender_name: &str,
) {
    let notification = NotificationRecord {
        id: Uuid::new_v4(),
        user_id: record.to_id.clone(),
        kind: "chat_message".to_string(),
        severity: NotificationSeverity::Info,
        title: format!("New message from {sender_name}"),
        message: record.message.clone(),
        metadata: serde_json::json!({ "from": record.from_id, "message_id": record.id }),
        read: false,
        created_at: record.created_at,
    };

    if let Err(persist_error) = state.notifications.insert_notification(&notification).await {
        error!(
            user_id = %notification.user_id,
            notification_id = %notification.id,
            error = ?persist_error,
            "failed to persist chat notification"
        );
    }

    let room = notification_room(&notification.user_id);
    let audience = room_audience(state, &room).await;
    state.bus.publish(CollabEvent {
        topic: room,
        kind: EventKind::Notification,
        message: WsMessage::Notification {
            user_id: notification.user_id.clone(),
            notification,
        },
        origin_user_id: None,
        origin_conn_id: None,
        audience,
    });
}

pub(crate) async fn handle_join_notifications(
    state: &CollabState,
    conn_id: ConnId,
    user_id: &str,
) {
    state.rooms.join(&notification_room(user_id), conn_id).await;
}

pub(crate) async fn handle_view_saved(
    state: &CollabState,
    conn_id: ConnId,
    view_id: &str,
    saved_by: Option<String>,
) -> Result<(), WsMessage> {
    let user = require_member(state, view_id, conn_id).await?;
    let saved_by = saved_by.filter(|name| !is_placeholder_name(name)).unwrap_or(user.name);
    let audience = view_audience(state, view_id).await;

    state.bus.publish(CollabEvent {
        topic: view_topic(view_id),
        kind: EventKind::ViewSaved,
        message: WsMessage::ViewSaved {
            view_id: view_id.to_string(),
            saved_by: Some(saved_by),
        },
        origin_user_id: Some(user.id),
        origin_conn_id: Some(conn_id),
        audience,
    });
    Ok(())
}

/// Disconnect is an implicit leave everywhere the connection participated.
pub(crate) async fn cleanup_connection(state: &CollabState, conn_id: ConnId) {
    for view_id in state.sessions.views_for_conn(conn_id).await {
        handle_leave_view(state, conn_id, &view_id).await;
    }
    state.rooms.leave_all(conn_id).await;
    state.conns.unregister(conn_id).await;
}
