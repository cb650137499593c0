//! Reconciliation of client-minted provisional conversation ids.
//!
//! A client renders a conversation optimistically under a temporary id
//! before the server confirms it. The arena is the explicitly-scoped holding
//! area for those ids: sends addressed to an unresolved temp id are buffered
//! here (never stored under the temp id), and once the directory resolves
//! the creation they are replayed against the durable id in arrival order.
//! Resolved mappings stick around so late requests still tagged with the
//! temp id are redirected. A failed creation poisons its slot so buffered
//! and late sends fail-ack instead of parking forever; pending and failed
//! slots die with their connection.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::rooms::ConnectionHandle;

pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Whether an id is a client-minted provisional id rather than a durable one.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Mint a collision-resistant temporary id (`tmp-` + 24 hex chars). Clients
/// mint their own; this helper keeps test and example clients honest.
pub fn mint_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", hex::encode(rand::random::<[u8; 12]>()))
}

/// A send buffered against an unresolved temp id, with everything needed to
/// replay it and ack the original request.
pub struct BufferedSend {
    pub handle: ConnectionHandle,
    pub request_id: u64,
    pub sender_id: String,
    pub text: String,
    pub reply_to: Option<String>,
}

enum Slot {
    /// Creation in flight; buffered sends wait for the durable id.
    Pending {
        owner_conn: u64,
        buffered: Vec<BufferedSend>,
    },
    /// Creation acknowledged; the temp id now redirects here.
    Resolved(String),
    /// Creation failed; anything addressed to this temp id fails too until
    /// the client retries under a fresh id.
    Failed {
        owner_conn: u64,
        error: SyncError,
    },
}

/// What happened to a send offered to [`TempIdArena::buffer_send`].
pub enum BufferOutcome {
    /// Parked until the temp id resolves; the ack is deferred.
    Buffered,
    /// The temp id already resolved; the caller delivers to this durable id.
    Resolved(String),
    /// The creation already failed; the send fails with its error.
    Failed(SyncError),
}

pub struct TempIdArena {
    slots: Mutex<HashMap<String, Slot>>,
}

impl TempIdArena {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Durable id this temp id resolved to, if resolution already happened.
    pub async fn lookup(&self, temp_id: &str) -> Option<String> {
        match self.slots.lock().await.get(temp_id) {
            Some(Slot::Resolved(id)) => Some(id.clone()),
            _ => None,
        }
    }

    /// Buffer a send against a not-yet-resolved temp id. Creates the pending
    /// slot on first use, owned by the buffering connection. A send offered
    /// to an already-resolved or already-failed slot is not buffered; the
    /// outcome tells the caller to deliver directly or to fail the request.
    pub async fn buffer_send(&self, temp_id: &str, send: BufferedSend) -> BufferOutcome {
        let mut slots = self.slots.lock().await;
        let owner_conn = send.handle.conn_id;
        match slots.entry(temp_id.to_string()).or_insert(Slot::Pending {
            owner_conn,
            buffered: Vec::new(),
        }) {
            Slot::Pending { buffered, .. } => {
                buffered.push(send);
                BufferOutcome::Buffered
            }
            Slot::Resolved(id) => BufferOutcome::Resolved(id.clone()),
            Slot::Failed { error, .. } => BufferOutcome::Failed(error.clone()),
        }
    }

    /// Record the durable id for a temp id and take any buffered sends for
    /// replay, in arrival order.
    pub async fn resolve(&self, temp_id: &str, durable_id: &str) -> Vec<BufferedSend> {
        let mut slots = self.slots.lock().await;
        let previous = slots.insert(temp_id.to_string(), Slot::Resolved(durable_id.to_string()));
        match previous {
            Some(Slot::Pending { buffered, .. }) => {
                if !buffered.is_empty() {
                    crate::plog!(
                        "reconcile: {} -> {} replaying {} buffered send(s)",
                        temp_id,
                        crate::logging::conv_id(durable_id),
                        buffered.len()
                    );
                }
                buffered
            }
            _ => Vec::new(),
        }
    }

    /// Record that the creation behind a temp id failed and take any buffered
    /// sends so the caller can fail-ack them. Later sends addressed to the
    /// temp id fail immediately instead of parking forever. A resolved slot
    /// is left alone.
    pub async fn fail(&self, temp_id: &str, conn_id: u64, error: SyncError) -> Vec<BufferedSend> {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(temp_id) {
            Some(Slot::Resolved(_)) => Vec::new(),
            Some(slot @ Slot::Pending { .. }) => {
                let previous = std::mem::replace(
                    slot,
                    Slot::Failed {
                        owner_conn: conn_id,
                        error,
                    },
                );
                match previous {
                    Slot::Pending { buffered, .. } => buffered,
                    _ => Vec::new(),
                }
            }
            _ => {
                slots.insert(
                    temp_id.to_string(),
                    Slot::Failed {
                        owner_conn: conn_id,
                        error,
                    },
                );
                Vec::new()
            }
        }
    }

    /// Drop pending and failed slots owned by a disconnected connection.
    /// Their temp ids had a bounded lifetime; the client retries creation
    /// after reconnect.
    pub async fn clear_connection(&self, conn_id: u64) {
        let mut slots = self.slots.lock().await;
        slots.retain(|_, slot| match slot {
            Slot::Pending { owner_conn, .. } | Slot::Failed { owner_conn, .. } => {
                *owner_conn != conn_id
            }
            Slot::Resolved(_) => true,
        });
    }
}

impl Default for TempIdArena {
    fn default() -> Self {
        Self::new()
    }
}
