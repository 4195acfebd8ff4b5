// Internal collaboration event bus.
//
// Every broadcastable event is published here exactly once, as a
// `CollabEvent` carrying its topic, origin, the already-built wire message,
// and the audience snapshotted at publish time. Both transports are thin
// adapters over this bus: the room broadcaster (broadcast.rs) fans out to
// live WebSocket connections, and `subscribe_topic` serves query-style
// subscribers. The delivery-scope predicate lives here so the two
// transports cannot drift apart.

use std::sync::Arc;

use atelier_common::protocol::ws::WsMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::presence::ConnId;

/// Capacity of the broadcast channel. Slow receivers that fall behind will
/// skip messages (RecvError::Lagged).
const BROADCAST_CAPACITY: usize = 4096;

/// Bus topic for a view session's events.
pub fn view_topic(view_id: &str) -> String {
    format!("view:{view_id}")
}

/// Broadcastable event kinds. The kind decides the delivery scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    UserJoined,
    UserLeft,
    CursorUpdate,
    NodeChanged,
    EdgeChanged,
    NodeDeleted,
    EdgeDeleted,
    SelectionChanged,
    ViewSaved,
    ChatMessage,
    Notification,
}

/// Who receives an event, relative to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryScope {
    /// Every subscriber of the topic, origin included. Node/edge events are
    /// inclusive: the receiver discards events tagged with its own user id,
    /// which keeps at-least-once semantics across reconnects.
    Inclusive,
    /// Every subscriber except connections of the originating user.
    ExcludeOriginUser,
    /// Every subscriber except the originating connection. Selection is the
    /// one connection-scoped exception: it is ephemeral and needs no
    /// identity translation.
    ExcludeOriginConn,
}

impl EventKind {
    pub const fn delivery_scope(self) -> DeliveryScope {
        match self {
            Self::CursorUpdate => DeliveryScope::ExcludeOriginUser,
            Self::SelectionChanged => DeliveryScope::ExcludeOriginConn,
            Self::UserJoined
            | Self::UserLeft
            | Self::NodeChanged
            | Self::EdgeChanged
            | Self::NodeDeleted
            | Self::EdgeDeleted
            | Self::ViewSaved
            | Self::ChatMessage
            | Self::Notification => DeliveryScope::Inclusive,
        }
    }
}

/// A connection the event should reach. Room recipients carry no per-member
/// identity, so `user_id` is `None` for them.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub conn_id: ConnId,
    pub user_id: Option<String>,
}

/// A single broadcastable event.
///
/// `audience` is captured when the event is published, so delivery matches
/// the membership the emitting handler saw. A connection that joins a view
/// or room afterwards never receives earlier traffic, even if the
/// broadcaster has not drained the bus yet.
#[derive(Debug, Clone)]
pub struct CollabEvent {
    pub topic: String,
    pub kind: EventKind,
    pub message: WsMessage,
    pub origin_user_id: Option<String>,
    pub origin_conn_id: Option<ConnId>,
    pub audience: Vec<Recipient>,
}

/// The shared filter predicate. `subscriber_conn_id` is `None` for
/// query-style subscribers, which have no connection identity; for them a
/// connection-scoped exclusion cannot match and the event is delivered.
pub fn should_deliver(
    event: &CollabEvent,
    subscriber_user_id: Option<&str>,
    subscriber_conn_id: Option<ConnId>,
) -> bool {
    match event.kind.delivery_scope() {
        DeliveryScope::Inclusive => true,
        DeliveryScope::ExcludeOriginUser => match (&event.origin_user_id, subscriber_user_id) {
            (Some(origin), Some(subscriber)) => origin != subscriber,
            _ => true,
        },
        DeliveryScope::ExcludeOriginConn => match (event.origin_conn_id, subscriber_conn_id) {
            (Some(origin), Some(subscriber)) => origin != subscriber,
            _ => true,
        },
    }
}

/// The global event bus. Cloneable; stored in the router state.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<CollabEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    /// Raw subscription to every event (used by the room broadcaster).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CollabEvent>> {
        self.sender.subscribe()
    }

    /// Publish an event. Send errors mean there are no subscribers, which
    /// is fine.
    pub fn publish(&self, event: CollabEvent) {
        let _ = self.sender.send(Arc::new(event));
    }

    /// Topic-filtered subscription for the secondary transport. Applies the
    /// same delivery-scope predicate as the room broadcaster, keyed by the
    /// subscriber's authenticated user id.
    pub fn subscribe_topic(
        &self,
        topic: String,
        subscriber_user_id: Option<String>,
    ) -> mpsc::UnboundedReceiver<WsMessage> {
        let mut inbound = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(event) => {
                        if event.topic != topic {
                            continue;
                        }
                        if !should_deliver(&event, subscriber_user_id.as_deref(), None) {
                            continue;
                        }
                        if tx.send(event.message.clone()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "topic subscriber lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_common::types::CursorPosition;
    use uuid::Uuid;

    fn conn(n: u128) -> ConnId {
        Uuid::from_u128(n)
    }

    fn cursor_event(origin_user: &str, origin_conn: ConnId) -> CollabEvent {
        CollabEvent {
            topic: view_topic("v1"),
            kind: EventKind::CursorUpdate,
            message: WsMessage::CursorUpdate {
                view_id: "v1".to_string(),
                user_id: origin_user.to_string(),
                position: CursorPosition { x: 10.0, y: 20.0 },
            },
            origin_user_id: Some(origin_user.to_string()),
            origin_conn_id: Some(origin_conn),
            audience: Vec::new(),
        }
    }

    // ── Delivery scopes ────────────────────────────────────────────

    #[test]
    fn scope_table_matches_event_semantics() {
        assert_eq!(EventKind::CursorUpdate.delivery_scope(), DeliveryScope::ExcludeOriginUser);
        assert_eq!(EventKind::SelectionChanged.delivery_scope(), DeliveryScope::ExcludeOriginConn);
        for inclusive in [
            EventKind::UserJoined,
            EventKind::UserLeft,
            EventKind::NodeChanged,
            EventKind::EdgeChanged,
            EventKind::NodeDeleted,
            EventKind::EdgeDeleted,
            EventKind::ViewSaved,
            EventKind::ChatMessage,
            EventKind::Notification,
        ] {
            assert_eq!(inclusive.delivery_scope(), DeliveryScope::Inclusive);
        }
    }

    #[test]
    fn cursor_events_skip_every_connection_of_the_origin_user() {
        let event = cursor_event("user-aaaaaaaaaa1", conn(1));
        // Same user, different tab: still excluded.
        assert!(!should_deliver(&event, Some("user-aaaaaaaaaa1"), Some(conn(2))));
        assert!(should_deliver(&event, Some("user-bbbbbbbbbb2"), Some(conn(3))));
    }

    #[test]
    fn selection_events_skip_only_the_origin_connection() {
        let event = CollabEvent {
            kind: EventKind::SelectionChanged,
            ..cursor_event("user-aaaaaaaaaa1", conn(1))
        };
        assert!(!should_deliver(&event, Some("user-aaaaaaaaaa1"), Some(conn(1))));
        // Same user, different tab: delivered.
        assert!(should_deliver(&event, Some("user-aaaaaaaaaa1"), Some(conn(2))));
    }

    #[test]
    fn inclusive_events_reach_the_origin() {
        let event = CollabEvent {
            kind: EventKind::NodeChanged,
            ..cursor_event("user-aaaaaaaaaa1", conn(1))
        };
        assert!(should_deliver(&event, Some("user-aaaaaaaaaa1"), Some(conn(1))));
    }

    // ── Topic subscriptions ────────────────────────────────────────

    #[tokio::test]
    async fn topic_subscription_filters_by_topic_and_origin_user() {
        let bus = EventBus::default();
        let mut updates =
            bus.subscribe_topic(view_topic("v1"), Some("user-bbbbbbbbbb2".to_string()));
        let mut own_echo =
            bus.subscribe_topic(view_topic("v1"), Some("user-aaaaaaaaaa1".to_string()));
        let mut other_view =
            bus.subscribe_topic(view_topic("v2"), Some("user-bbbbbbbbbb2".to_string()));

        // Let the forwarder tasks attach before publishing.
        tokio::task::yield_now().await;
        bus.publish(cursor_event("user-aaaaaaaaaa1", conn(1)));

        let delivered = updates.recv().await.expect("subscriber should receive the event");
        match delivered {
            WsMessage::CursorUpdate { user_id, .. } => assert_eq!(user_id, "user-aaaaaaaaaa1"),
            other => panic!("expected cursor_update, got {other:?}"),
        }

        // The origin user's own subscription and the other view see nothing.
        tokio::task::yield_now().await;
        assert!(own_echo.try_recv().is_err());
        assert!(other_view.try_recv().is_err());
    }
}
