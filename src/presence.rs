//! Presence registry: who is online, and on which connection.
//!
//! One authoritative connection per user. Registering while an entry exists
//! replaces it (last-writer-wins) and closes the stale connection. Every
//! roster change broadcasts the full roster to all registered connections,
//! fire-and-forget; a slow or broken recipient is the room router's problem,
//! not retried here.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::protocol::{PresenceInfo, ServerEvent, UserIdentity};
use crate::rooms::ConnectionHandle;
use crate::util::now_secs;

pub struct PresenceEntry {
    pub identity: UserIdentity,
    pub handle: ConnectionHandle,
    pub last_seen_at: u64,
}

pub struct PresenceRegistry {
    inner: Mutex<HashMap<String, PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the entry for this user and broadcast the roster.
    /// A previous connection for the same user is told it was replaced and
    /// its handle dropped, which closes it.
    pub async fn register(&self, identity: UserIdentity, handle: ConnectionHandle) {
        let user_id = identity.user_id.clone();
        let replaced = {
            let mut inner = self.inner.lock().await;
            inner.insert(
                user_id.clone(),
                PresenceEntry {
                    identity,
                    handle,
                    last_seen_at: now_secs(),
                },
            )
        };

        if let Some(old) = replaced {
            crate::plog!(
                "presence: replacing stale session for {}",
                crate::logging::user_id(&user_id)
            );
            let _ = old.handle.send(ServerEvent::SessionReplaced).await;
        } else {
            crate::plog!("presence: {} online", crate::logging::user_id(&user_id));
        }

        self.broadcast_roster().await;
    }

    /// Remove the user's entry if it still belongs to `conn_id` and broadcast
    /// the roster. Idempotent: a repeated or stale disconnect (the user
    /// already re-registered on a newer connection) changes nothing and does
    /// not broadcast.
    pub async fn unregister(&self, user_id: &str, conn_id: u64) {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.get(user_id) {
                Some(entry) if entry.handle.conn_id == conn_id => {
                    inner.remove(user_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            crate::plog!("presence: {} offline", crate::logging::user_id(user_id));
            self.broadcast_roster().await;
        }
    }

    /// Full roster, sorted by user id for stable payloads.
    pub async fn snapshot(&self) -> Vec<PresenceInfo> {
        let inner = self.inner.lock().await;
        let mut users: Vec<PresenceInfo> = inner
            .values()
            .map(|entry| PresenceInfo {
                user_id: entry.identity.user_id.clone(),
                username: entry.identity.username.clone(),
                avatar: entry.identity.avatar.clone(),
                last_seen_at: entry.last_seen_at,
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().await.contains_key(user_id)
    }

    /// The user's live connection handle, if online.
    pub async fn handle_for(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.inner
            .lock()
            .await
            .get(user_id)
            .map(|entry| entry.handle.clone())
    }

    async fn broadcast_roster(&self) {
        let users = self.snapshot().await;
        let handles: Vec<ConnectionHandle> = {
            let inner = self.inner.lock().await;
            inner.values().map(|e| e.handle.clone()).collect()
        };
        crate::plog!("presence: broadcasting roster of {} user(s)", users.len());
        for handle in handles {
            let _ = handle
                .send(ServerEvent::OnlineUsers {
                    users: users.clone(),
                })
                .await;
        }
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
