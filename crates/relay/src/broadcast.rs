// Room broadcaster: the live-socket transport over the event bus.
//
// A single background task consumes every published event, applies the
// shared delivery-scope predicate to the audience captured at publish time,
// and pushes the wire message into each recipient connection's outbound
// queue. Resolving the audience at publish time keeps delivery consistent
// with the session state the emitting handler saw; connections that join
// later never receive earlier events.

use std::collections::HashMap;
use std::sync::Arc;

use atelier_common::protocol::ws::WsMessage;
use tokio::sync::{broadcast as tokio_broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{should_deliver, CollabEvent, EventBus};
use crate::presence::ConnId;

/// Live connections and their outbound message queues.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<RwLock<HashMap<ConnId, mpsc::UnboundedSender<WsMessage>>>>,
}

impl ConnectionRegistry {
    /// Register a connection's outbound queue. Returns the receiving half,
    /// which the socket task drains into the websocket.
    pub async fn register(&self, conn_id: ConnId) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.conns.write().await.insert(conn_id, tx);
        rx
    }

    pub async fn unregister(&self, conn_id: ConnId) {
        self.conns.write().await.remove(&conn_id);
    }

    /// Queue a message for one connection. Dropped silently if the
    /// connection is gone or its socket task has stopped draining.
    pub async fn send_to(&self, conn_id: ConnId, message: WsMessage) {
        if let Some(tx) = self.conns.read().await.get(&conn_id) {
            let _ = tx.send(message);
        }
    }

    pub async fn active_connections(&self) -> usize {
        self.conns.read().await.len()
    }
}

/// Deliver one event to every eligible connection in its audience.
pub async fn deliver_event(event: &CollabEvent, conns: &ConnectionRegistry) {
    for recipient in &event.audience {
        if should_deliver(event, recipient.user_id.as_deref(), Some(recipient.conn_id)) {
            conns.send_to(recipient.conn_id, event.message.clone()).await;
        }
    }
}

/// Spawn the broadcaster task. Runs until the bus is dropped.
pub fn spawn_room_broadcaster(bus: &EventBus, conns: ConnectionRegistry) -> JoinHandle<()> {
    let mut inbound = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match inbound.recv().await {
                Ok(event) => deliver_event(&event, &conns).await,
                Err(tokio_broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "room broadcaster lagged behind the bus");
                }
                Err(tokio_broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed, stopping room broadcaster");
                    break;
                }
            }
        }
    })
}
