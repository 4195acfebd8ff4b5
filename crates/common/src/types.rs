// Core domain types shared across all Atelier crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validated presence identity, visible to every member of a view session.
///
/// Only ever constructed after passing identity enrichment; `id` is the
/// durable directory identifier, never a transport connection id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    /// Display hint for cursor/selection overlays (e.g. "#e06c75").
    pub color: String,
}

/// A possibly-incomplete user descriptor as supplied by a joining client.
///
/// Must pass enrichment before it becomes a [`PresenceUser`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserCandidate {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Cursor position on the canvas, in view coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// A persisted direct chat message. Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessageRecord {
    pub id: Uuid,
    pub from_id: String,
    pub to_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSeverity {
    Info,
    Warning,
    Error,
}

impl NotificationSeverity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A persisted notification. Content is immutable; only the read flag
/// transitions after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: String,
    /// Event category, e.g. "mention", "comment-reply", "chat-message".
    pub kind: String,
    pub severity: NotificationSeverity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}
