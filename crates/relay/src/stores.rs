// Narrow interfaces to the external persistence collaborators: the user
// directory, the chat message store, and the notification store.
//
// Each store is an enum with a Postgres variant for production and a Memory
// variant that backs tests and databaseless development. The tables behind
// the Postgres variants are owned by the platform's persistence layer; the
// relay only reads and appends through these operations.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use atelier_common::types::{ChatMessageRecord, NotificationRecord, NotificationSeverity};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A user directory record as the platform stores it. Either field may be
/// missing for partially-provisioned accounts.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRecord {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Resolves durable user ids to directory records.
#[derive(Clone)]
pub enum UserDirectory {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, DirectoryRecord>>>),
}

impl UserDirectory {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn find_user(&self, user_id: &str) -> Result<Option<DirectoryRecord>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query(
                    r#"
                    SELECT name, email
                    FROM users
                    WHERE id = $1
                    "#,
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("failed to query user directory")?;

                Ok(row.map(|row| DirectoryRecord {
                    name: row.get("name"),
                    email: row.get("email"),
                }))
            }
            Self::Memory(store) => Ok(store.read().await.get(user_id).cloned()),
        }
    }

    pub async fn insert(&self, user_id: impl Into<String>, record: DirectoryRecord) {
        if let Self::Memory(store) = self {
            store.write().await.insert(user_id.into(), record);
        }
    }

    pub async fn remove(&self, user_id: &str) {
        if let Self::Memory(store) = self {
            store.write().await.remove(user_id);
        }
    }
}

/// Persists and retrieves direct chat messages.
#[derive(Clone)]
pub enum MessageStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<Vec<ChatMessageRecord>>>),
}

impl MessageStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(Vec::new())))
    }

    pub async fn insert_message(&self, message: &ChatMessageRecord) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO chat_messages (id, from_id, to_id, message, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(message.id)
                .bind(&message.from_id)
                .bind(&message.to_id)
                .bind(&message.message)
                .bind(message.created_at)
                .execute(pool)
                .await
                .context("failed to persist chat message")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.push(message.clone());
                Ok(())
            }
        }
    }

    /// Messages exchanged between `user_a` and `user_b` in either direction,
    /// oldest first.
    pub async fn history(&self, user_a: &str, user_b: &str) -> Result<Vec<ChatMessageRecord>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT id, from_id, to_id, message, created_at
                    FROM chat_messages
                    WHERE (from_id = $1 AND to_id = $2)
                       OR (from_id = $2 AND to_id = $1)
                    ORDER BY created_at ASC
                    "#,
                )
                .bind(user_a)
                .bind(user_b)
                .fetch_all(pool)
                .await
                .context("failed to load chat history")?;

                Ok(rows
                    .into_iter()
                    .map(|row| ChatMessageRecord {
                        id: row.get("id"),
                        from_id: row.get("from_id"),
                        to_id: row.get("to_id"),
                        message: row.get("message"),
                        created_at: row.get("created_at"),
                    })
                    .collect())
            }
            Self::Memory(store) => {
                let mut messages: Vec<ChatMessageRecord> = store
                    .read()
                    .await
                    .iter()
                    .filter(|m| {
                        (m.from_id == user_a && m.to_id == user_b)
                            || (m.from_id == user_b && m.to_id == user_a)
                    })
                    .cloned()
                    .collect();
                messages.sort_by_key(|m| m.created_at);
                Ok(messages)
            }
        }
    }
}

/// Persists notifications and tracks their read state.
#[derive(Clone)]
pub enum NotificationStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<Vec<NotificationRecord>>>),
}

impl NotificationStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(Vec::new())))
    }

    pub async fn insert_notification(&self, notification: &NotificationRecord) -> Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO notifications
                        (id, user_id, kind, severity, title, message, metadata, read, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(notification.id)
                .bind(&notification.user_id)
                .bind(&notification.kind)
                .bind(notification.severity.as_str())
                .bind(&notification.title)
                .bind(&notification.message)
                .bind(&notification.metadata)
                .bind(notification.read)
                .bind(notification.created_at)
                .execute(pool)
                .await
                .context("failed to persist notification")?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.push(notification.clone());
                Ok(())
            }
        }
    }

    /// All notifications for a user, newest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<NotificationRecord>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query(
                    r#"
                    SELECT id, user_id, kind, severity, title, message, metadata, read, created_at
                    FROM notifications
                    WHERE user_id = $1
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(user_id)
                .fetch_all(pool)
                .await
                .context("failed to list notifications")?;

                rows.into_iter().map(notification_from_row).collect()
            }
            Self::Memory(store) => {
                let mut notifications: Vec<NotificationRecord> = store
                    .read()
                    .await
                    .iter()
                    .filter(|n| n.user_id == user_id)
                    .cloned()
                    .collect();
                notifications.sort_by_key(|n| std::cmp::Reverse(n.created_at));
                Ok(notifications)
            }
        }
    }

    /// Mark a notification read. Returns false if no such notification
    /// exists.
    pub async fn mark_read(&self, id: Uuid) -> Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    UPDATE notifications
                    SET read = TRUE
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .execute(pool)
                .await
                .context("failed to mark notification read")?;
                Ok(result.rows_affected() > 0)
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                match guard.iter_mut().find(|n| n.id == id) {
                    Some(notification) => {
                        notification.read = true;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }
}

fn notification_from_row(row: sqlx::postgres::PgRow) -> Result<NotificationRecord> {
    let severity: String = row.get("severity");
    let severity = NotificationSeverity::from_db_value(&severity)
        .with_context(|| format!("invalid notification severity '{severity}' in database"))?;
    let created_at: DateTime<Utc> = row.get("created_at");

    Ok(NotificationRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: row.get("kind"),
        severity,
        title: row.get("title"),
        message: row.get("message"),
        metadata: row.get("metadata"),
        read: row.get("read"),
        created_at,
    })
}
