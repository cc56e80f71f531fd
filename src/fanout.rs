//! Real-time fan-out
//!
//! Registry of live connections, each bound to its session user, with
//! broadcast (accepted pixels, presence) and per-user unicast (economy
//! updates, standing). Sends are fire-and-forget: a receiver whose channel
//! is gone is dropped from the registry, never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::database::Database;
use crate::protocol::ServerMsg;

pub type ConnId = u64;

struct Connection {
    user_id: Option<String>,
    sender: mpsc::UnboundedSender<ServerMsg>,
}

pub struct ConnectionHub {
    connections: DashMap<ConnId, Connection>,
    next_id: AtomicU64,
    shard_id: String,
}

impl ConnectionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(0),
            shard_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    /// Bind a new connection to its session user; the returned receiver is
    /// drained by the connection's writer task.
    pub fn register(
        &self,
        user_id: Option<String>,
    ) -> (ConnId, mpsc::UnboundedReceiver<ServerMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections.insert(
            id,
            Connection {
                user_id,
                sender: tx,
            },
        );
        debug!("Connection {} registered ({} live)", id, self.local_count());
        (id, rx)
    }

    pub fn unregister(&self, id: ConnId) {
        self.connections.remove(&id);
        debug!(
            "Connection {} unregistered ({} live)",
            id,
            self.local_count()
        );
    }

    pub fn local_count(&self) -> usize {
        self.connections.len()
    }

    /// Push to one connection only (connect-time config/canvas/standing).
    pub fn send_to(&self, id: ConnId, msg: ServerMsg) {
        if let Some(conn) = self.connections.get(&id) {
            let _ = conn.sender.send(msg);
        }
    }

    /// Broadcast to every live connection except `skip` (the placing
    /// client already holds optimistic state plus its ack).
    pub fn broadcast(&self, msg: &ServerMsg, skip: Option<ConnId>) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if Some(*entry.key()) == skip {
                continue;
            }
            if entry.value().sender.send(msg.clone()).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }

    /// Unicast to every connection of one user (multiple tabs).
    pub fn unicast_user(&self, user_id: &str, msg: &ServerMsg) {
        let mut dead = Vec::new();
        for entry in self.connections.iter() {
            if entry.value().user_id.as_deref() == Some(user_id) {
                if entry.value().sender.send(msg.clone()).is_err() {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            self.connections.remove(&id);
        }
    }
}

/// Periodic presence heartbeat: publish this shard's local count to the
/// shared registry and broadcast the sum over all non-expired shard rows,
/// so several accepting shards agree on one number.
pub fn start_presence_task(
    hub: Arc<ConnectionHub>,
    db: Arc<Database>,
    every: Duration,
) {
    let ttl = chrono::Duration::from_std(every * 3).unwrap_or(chrono::Duration::seconds(15));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        info!(
            "Presence heartbeat every {:?} for shard {}",
            every,
            hub.shard_id()
        );
        loop {
            ticker.tick().await;
            let local = hub.local_count() as i64;
            if let Err(e) = db.upsert_presence(hub.shard_id(), local).await {
                error!("Failed to publish presence for this shard: {}", e);
                continue;
            }
            match db.presence_total(ttl, Utc::now()).await {
                Ok(count) => hub.broadcast(&ServerMsg::Online { count }, None),
                Err(e) => error!("Failed to read presence registry: {}", e),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_skips_origin_connection() {
        let hub = ConnectionHub::new();
        let (origin, mut origin_rx) = hub.register(Some("a".into()));
        let (_other, mut other_rx) = hub.register(Some("b".into()));

        hub.broadcast(
            &ServerMsg::Pixel {
                x: 1,
                y: 2,
                color_id: 3,
            },
            Some(origin),
        );

        assert!(matches!(
            other_rx.try_recv(),
            Ok(ServerMsg::Pixel { x: 1, y: 2, color_id: 3 })
        ));
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_reaches_all_tabs_of_one_user() {
        let hub = ConnectionHub::new();
        let (_tab1, mut rx1) = hub.register(Some("a".into()));
        let (_tab2, mut rx2) = hub.register(Some("a".into()));
        let (_other, mut rx3) = hub.register(Some("b".into()));

        hub.unicast_user("a", &ServerMsg::Online { count: 1 });
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let hub = ConnectionHub::new();
        let (_alive, _rx) = hub.register(None);
        let (_dead, rx) = hub.register(None);
        drop(rx);

        hub.broadcast(&ServerMsg::Online { count: 0 }, None);
        assert_eq!(hub.local_count(), 1);
    }
}
