// View session registry (presence membership and cursors).
//
// A view session exists only while it has members: sessions are created on
// the first join and removed eagerly when the last member leaves. Members
// and cursors are always mutated together so the two maps cannot drift.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use atelier_common::types::{CursorPosition, PresenceUser};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::identity::is_placeholder_name;

/// Transport connection identifier. Assigned per socket; never shown to
/// other members (broadcast payloads carry durable user ids).
pub type ConnId = Uuid;

/// Tracks per-view presence: which connections are in a view, as whom, and
/// where their cursors are.
#[derive(Debug, Clone, Default)]
pub struct ViewSessionStore {
    sessions: Arc<RwLock<HashMap<String, ViewSession>>>,
}

#[derive(Debug, Clone, Default)]
struct ViewSession {
    members: HashMap<ConnId, PresenceUser>,
    cursors: HashMap<ConnId, CursorPosition>,
}

/// A point-in-time view of a session, suitable for `session_state` and
/// `user_joined` payloads. Cursors are re-keyed by durable user id.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Members deduplicated by user id (a user with several tabs appears
    /// once), ordered by user id for stable payloads.
    pub users: Vec<PresenceUser>,
    pub cursors: HashMap<String, CursorPosition>,
    pub conn_id_to_user_id: HashMap<ConnId, String>,
}

impl ViewSessionStore {
    /// Add a member to a view session, creating the session if absent.
    pub async fn insert_member(&self, view_id: &str, conn_id: ConnId, user: PresenceUser) {
        let mut guard = self.sessions.write().await;
        let session = guard.entry(view_id.to_string()).or_default();
        session.members.insert(conn_id, user);
    }

    /// Remove a member and its cursor. Deletes the session when it becomes
    /// empty. Returns the removed user, or `None` if the membership did not
    /// exist (disconnect races are expected).
    pub async fn remove_member(&self, view_id: &str, conn_id: ConnId) -> Option<PresenceUser> {
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(view_id)?;
        let removed = session.members.remove(&conn_id);
        session.cursors.remove(&conn_id);
        if session.members.is_empty() {
            guard.remove(view_id);
        }
        removed
    }

    /// Remove several members at once (failed re-validation). Tolerates
    /// entries already removed by a racing leave.
    pub async fn remove_members(&self, view_id: &str, conn_ids: &[ConnId]) {
        let mut guard = self.sessions.write().await;
        let Some(session) = guard.get_mut(view_id) else {
            return;
        };
        for conn_id in conn_ids {
            session.members.remove(conn_id);
            session.cursors.remove(conn_id);
        }
        if session.members.is_empty() {
            guard.remove(view_id);
        }
    }

    pub async fn member(&self, view_id: &str, conn_id: ConnId) -> Option<PresenceUser> {
        self.sessions.read().await.get(view_id)?.members.get(&conn_id).cloned()
    }

    /// All (connection, user) pairs in a view.
    pub async fn members(&self, view_id: &str) -> Vec<(ConnId, PresenceUser)> {
        self.sessions
            .read()
            .await
            .get(view_id)
            .map(|session| {
                session.members.iter().map(|(conn, user)| (*conn, user.clone())).collect()
            })
            .unwrap_or_default()
    }

    /// Update a member's cursor. Returns the mover's user id, or `None`
    /// when the connection is not a member (the update is discarded).
    pub async fn set_cursor(
        &self,
        view_id: &str,
        conn_id: ConnId,
        position: CursorPosition,
    ) -> Option<String> {
        let mut guard = self.sessions.write().await;
        let session = guard.get_mut(view_id)?;
        let user_id = session.members.get(&conn_id)?.id.clone();
        session.cursors.insert(conn_id, position);
        Some(user_id)
    }

    /// Snapshot the session for `session_state` / `user_joined` payloads.
    pub async fn snapshot(&self, view_id: &str) -> Option<SessionSnapshot> {
        let guard = self.sessions.read().await;
        let session = guard.get(view_id)?;

        let conn_id_to_user_id: HashMap<ConnId, String> =
            session.members.iter().map(|(conn, user)| (*conn, user.id.clone())).collect();

        let mut seen = HashSet::new();
        let mut users: Vec<PresenceUser> = session
            .members
            .values()
            .filter(|user| seen.insert(user.id.clone()))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));

        let cursors = session
            .cursors
            .iter()
            .filter_map(|(conn, position)| {
                session.members.get(conn).map(|user| (user.id.clone(), *position))
            })
            .collect();

        Some(SessionSnapshot { users, cursors, conn_id_to_user_id })
    }

    /// Deduplicated members whose stored names still pass validation. Used
    /// for `user_left` payloads so a stale identity never reappears there.
    pub async fn valid_users(&self, view_id: &str) -> Vec<PresenceUser> {
        let guard = self.sessions.read().await;
        let Some(session) = guard.get(view_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut users: Vec<PresenceUser> = session
            .members
            .values()
            .filter(|user| !is_placeholder_name(&user.name))
            .filter(|user| seen.insert(user.id.clone()))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub async fn contains_view(&self, view_id: &str) -> bool {
        self.sessions.read().await.contains_key(view_id)
    }

    /// Every view this connection is currently a member of (for disconnect
    /// cleanup).
    pub async fn views_for_conn(&self, conn_id: ConnId) -> Vec<String> {
        self.sessions
            .read()
            .await
            .iter()
            .filter(|(_, session)| session.members.contains_key(&conn_id))
            .map(|(view_id, _)| view_id.clone())
            .collect()
    }

    /// Find a display name for a user across all active sessions (used to
    /// label chat messages when the sender supplied no hint).
    pub async fn display_name_for(&self, user_id: &str) -> Option<String> {
        let guard = self.sessions.read().await;
        guard
            .values()
            .flat_map(|session| session.members.values())
            .find(|user| user.id == user_id)
            .map(|user| user.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> PresenceUser {
        PresenceUser { id: id.to_string(), name: name.to_string(), color: "#61afef".to_string() }
    }

    fn conn(n: u128) -> ConnId {
        Uuid::from_u128(n)
    }

    // ── Membership lifecycle ───────────────────────────────────────

    #[tokio::test]
    async fn join_then_leave_removes_the_session() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        assert!(store.contains_view("v1").await);

        let removed = store.remove_member("v1", conn(1)).await.expect("member should exist");
        assert_eq!(removed.name, "Alice");
        assert!(!store.contains_view("v1").await);
    }

    #[tokio::test]
    async fn remove_unknown_member_is_a_no_op() {
        let store = ViewSessionStore::default();
        assert!(store.remove_member("v1", conn(1)).await.is_none());

        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        assert!(store.remove_member("v1", conn(2)).await.is_none());
        assert!(store.contains_view("v1").await);
    }

    #[tokio::test]
    async fn cursor_is_dropped_with_its_member() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v1", conn(2), user("user-bbbbbbbbbb2", "Bob")).await;
        store.set_cursor("v1", conn(1), CursorPosition { x: 10.0, y: 20.0 }).await;

        store.remove_member("v1", conn(1)).await;
        let snapshot = store.snapshot("v1").await.expect("session should remain");
        assert!(snapshot.cursors.is_empty());
    }

    #[tokio::test]
    async fn remove_members_tolerates_already_removed_entries() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v1", conn(2), user("user-bbbbbbbbbb2", "Bob")).await;
        store.remove_member("v1", conn(2)).await;

        // conn(2) already gone; conn(3) never existed.
        store.remove_members("v1", &[conn(2), conn(3)]).await;
        assert!(store.contains_view("v1").await);

        store.remove_members("v1", &[conn(1)]).await;
        assert!(!store.contains_view("v1").await);
    }

    // ── Cursors ────────────────────────────────────────────────────

    #[tokio::test]
    async fn set_cursor_requires_membership() {
        let store = ViewSessionStore::default();
        let position = CursorPosition { x: 1.0, y: 2.0 };
        assert!(store.set_cursor("v1", conn(1), position).await.is_none());

        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        let mover = store.set_cursor("v1", conn(1), position).await;
        assert_eq!(mover.as_deref(), Some("user-aaaaaaaaaa1"));
    }

    #[tokio::test]
    async fn snapshot_keys_cursors_by_user_id() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.set_cursor("v1", conn(1), CursorPosition { x: 10.0, y: 20.0 }).await;

        let snapshot = store.snapshot("v1").await.expect("session should exist");
        let position = snapshot.cursors.get("user-aaaaaaaaaa1").expect("cursor keyed by user id");
        assert_eq!(position.x, 10.0);
        assert_eq!(position.y, 20.0);
        assert_eq!(
            snapshot.conn_id_to_user_id.get(&conn(1)).map(String::as_str),
            Some("user-aaaaaaaaaa1"),
        );
    }

    // ── Deduplication ──────────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_deduplicates_multi_tab_users() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v1", conn(2), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v1", conn(3), user("user-bbbbbbbbbb2", "Bob")).await;

        let snapshot = store.snapshot("v1").await.expect("session should exist");
        assert_eq!(snapshot.users.len(), 2);
        assert_eq!(snapshot.conn_id_to_user_id.len(), 3);
    }

    #[tokio::test]
    async fn valid_users_filters_placeholder_names() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        // A stale entry that predates a directory fix.
        store.insert_member("v1", conn(2), user("user-bbbbbbbbbb2", "User")).await;

        let users = store.valid_users("v1").await;
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "Alice");
    }

    // ── Cross-session queries ──────────────────────────────────────

    #[tokio::test]
    async fn views_for_conn_lists_all_memberships() {
        let store = ViewSessionStore::default();
        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v2", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        store.insert_member("v2", conn(2), user("user-bbbbbbbbbb2", "Bob")).await;

        let mut views = store.views_for_conn(conn(1)).await;
        views.sort();
        assert_eq!(views, vec!["v1".to_string(), "v2".to_string()]);
    }

    #[tokio::test]
    async fn display_name_scans_active_sessions() {
        let store = ViewSessionStore::default();
        assert!(store.display_name_for("user-aaaaaaaaaa1").await.is_none());

        store.insert_member("v1", conn(1), user("user-aaaaaaaaaa1", "Alice")).await;
        assert_eq!(store.display_name_for("user-aaaaaaaaaa1").await.as_deref(), Some("Alice"));
    }
}
