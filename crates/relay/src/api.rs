// REST retrieval surface. Live updates ride the WebSocket; these endpoints
// serve initial loads and let backend services inject notifications.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use atelier_common::protocol::ws::WsMessage;
use atelier_common::types::{NotificationRecord, NotificationSeverity};

use crate::bus::{CollabEvent, EventBus, EventKind, Recipient};
use crate::error::{ErrorCode, RelayError};
use crate::rooms::{notification_room, RoomRegistry};
use crate::stores::{MessageStore, NotificationStore};

#[derive(Clone)]
pub struct ApiState {
    pub messages: MessageStore,
    pub notifications: NotificationStore,
    pub rooms: RoomRegistry,
    pub bus: EventBus,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/chat/{user_a}/{user_b}", get(chat_history))
        .route("/v1/notifications", post(create_notification))
        .route("/v1/notifications/{user_id}", get(list_notifications))
        .route("/v1/notifications/{id}/read", post(mark_notification_read))
        .with_state(state)
}

async fn chat_history(
    Path((user_a, user_b)): Path<(String, String)>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.messages.history(&user_a, &user_b).await {
        Ok(messages) => Json(json!({ "messages": messages })).into_response(),
        Err(load_error) => {
            error!(user_a = %user_a, user_b = %user_b, error = ?load_error, "failed to load chat history");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn list_notifications(
    Path(user_id): Path<String>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.notifications.list_for_user(&user_id).await {
        Ok(notifications) => Json(json!({ "notifications": notifications })).into_response(),
        Err(load_error) => {
            error!(user_id = %user_id, error = ?load_error, "failed to list notifications");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    pub user_id: String,
    pub kind: String,
    #[serde(default)]
    pub severity: Option<NotificationSeverity>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Persist a notification and push it to the recipient's live stream.
async fn create_notification(
    State(state): State<ApiState>,
    Json(payload): Json<CreateNotificationRequest>,
) -> impl IntoResponse {
    if payload.user_id.trim().is_empty() {
        return RelayError::new(ErrorCode::ValidationFailed, "user_id must not be empty")
            .with_details(json!({ "field": "user_id" }))
            .into_response();
    }
    if payload.title.trim().is_empty() {
        return RelayError::new(ErrorCode::ValidationFailed, "title must not be empty")
            .with_details(json!({ "field": "title" }))
            .into_response();
    }

    let notification = NotificationRecord {
        id: Uuid::new_v4(),
        user_id: payload.user_id,
        kind: payload.kind,
        severity: payload.severity.unwrap_or(NotificationSeverity::Info),
        title: payload.title,
        message: payload.message,
        metadata: payload.metadata.unwrap_or_else(|| json!({})),
        read: false,
        created_at: Utc::now(),
    };

    if let Err(persist_error) = state.notifications.insert_notification(&notification).await {
        error!(
            user_id = %notification.user_id,
            notification_id = %notification.id,
            error = ?persist_error,
            "failed to persist notification"
        );
        return RelayError::from_code(ErrorCode::InternalError).into_response();
    }

    let room = notification_room(&notification.user_id);
    let audience = state
        .rooms
        .members(&room)
        .await
        .into_iter()
        .map(|conn_id| Recipient { conn_id, user_id: None })
        .collect();
    state.bus.publish(CollabEvent {
        topic: room,
        kind: EventKind::Notification,
        message: WsMessage::Notification {
            user_id: notification.user_id.clone(),
            notification: notification.clone(),
        },
        origin_user_id: None,
        origin_conn_id: None,
        audience,
    });

    (StatusCode::CREATED, Json(notification)).into_response()
}

async fn mark_notification_read(
    Path(id): Path<Uuid>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    match state.notifications.mark_read(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => RelayError::from_code(ErrorCode::NotFound).into_response(),
        Err(update_error) => {
            error!(notification_id = %id, error = ?update_error, "failed to mark notification read");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}
