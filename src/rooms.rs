//! Room membership and broadcast fan-out.
//!
//! A room is the set of live connections subscribed to one conversation's
//! broadcasts. Delivery is best-effort per connection: a send that fails or
//! exceeds the bounded timeout prunes that connection from the room lazily;
//! nothing is retried and the room itself is unaffected.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::config::SEND_TIMEOUT;
use crate::error::SyncError;
use crate::protocol::ServerEvent;

/// Live handle to one authenticated connection's outbound queue.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub user_id: String,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(conn_id: u64, user_id: impl Into<String>, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            conn_id,
            user_id: user_id.into(),
            tx,
        }
    }

    /// Queue an event for this connection, bounded by the send timeout.
    /// A closed or saturated connection reports [`SyncError::Timeout`]; it is
    /// never left pending indefinitely.
    pub async fn send(&self, event: ServerEvent) -> Result<(), SyncError> {
        match timeout(SEND_TIMEOUT, self.tx.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(SyncError::Timeout),
        }
    }
}

/// `conversation_id -> {conn_id -> handle}` membership map.
pub struct RoomRouter {
    rooms: Mutex<HashMap<String, HashMap<u64, ConnectionHandle>>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe a connection to a conversation's broadcasts.
    pub async fn join(&self, conversation_id: &str, handle: ConnectionHandle) {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(conversation_id.to_string())
            .or_default()
            .insert(handle.conn_id, handle);
    }

    /// Remove a connection from every room it joined. Idempotent.
    pub async fn leave_all(&self, conn_id: u64) {
        let mut rooms = self.rooms.lock().await;
        rooms.retain(|_, members| {
            members.remove(&conn_id);
            !members.is_empty()
        });
    }

    /// Connection ids currently joined to a conversation.
    pub async fn members(&self, conversation_id: &str) -> Vec<u64> {
        let rooms = self.rooms.lock().await;
        rooms
            .get(conversation_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Deliver `event` to every joined connection, the sender included.
    /// Returns the number of successful deliveries; failed connections are
    /// pruned from the room.
    pub async fn broadcast(&self, conversation_id: &str, event: ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = {
            let rooms = self.rooms.lock().await;
            match rooms.get(conversation_id) {
                Some(members) => members.values().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for handle in handles {
            match handle.send(event.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => dead.push(handle.conn_id),
            }
        }

        if !dead.is_empty() {
            let mut rooms = self.rooms.lock().await;
            if let Some(members) = rooms.get_mut(conversation_id) {
                for conn_id in &dead {
                    members.remove(conn_id);
                }
                if members.is_empty() {
                    rooms.remove(conversation_id);
                }
            }
            crate::plog!(
                "rooms: pruned {} dead connection(s) from {}",
                dead.len(),
                crate::logging::conv_id(conversation_id)
            );
        }

        delivered
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}
