//! Shared application state and startup wiring.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::auth::TokenVerifier;
use crate::directory::{Conversation, ConversationDirectory};
use crate::error::StoreError;
use crate::messages::{Message, MessageLog};
use crate::presence::PresenceRegistry;
use crate::reconcile::TempIdArena;
use crate::rooms::RoomRouter;
use crate::store::Store;

pub struct AppState {
    pub verifier: TokenVerifier,
    pub presence: PresenceRegistry,
    pub directory: ConversationDirectory,
    pub log: MessageLog,
    pub rooms: RoomRouter,
    pub arena: TempIdArena,
    pub store: Mutex<Store>,
    pub next_conn_id: AtomicU64,
    /// One delivery mutex per conversation, held across append and fan-out
    /// so all room members observe messages in sequence order, and across
    /// read-mark derivation so the unread cache never absorbs a stale count.
    delivery_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub async fn delivery_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.delivery_locks.lock().await;
        Arc::clone(locks.entry(conversation_id.to_string()).or_default())
    }
}

pub type SharedState = Arc<AppState>;

/// Build the shared state and reload the registries from the durable store.
pub async fn init(store: Store, secret: &str) -> Result<SharedState, StoreError> {
    let state: SharedState = Arc::new(AppState {
        verifier: TokenVerifier::new(secret),
        presence: PresenceRegistry::new(),
        directory: ConversationDirectory::new(),
        log: MessageLog::new(),
        rooms: RoomRouter::new(),
        arena: TempIdArena::new(),
        store: Mutex::new(store),
        next_conn_id: AtomicU64::new(0),
        delivery_locks: Mutex::new(HashMap::new()),
    });
    reload(&state).await?;
    Ok(state)
}

/// Rebuild the in-memory directory and message log from the store. Unread
/// caches are derived from the persisted read marks.
async fn reload(state: &SharedState) -> Result<(), StoreError> {
    let store = state.store.lock().await;
    let rows = store.all_conversations()?;
    let count = rows.len();

    for row in rows {
        let participants = store.participants(&row.conversation_id)?;

        let mut messages = Vec::new();
        for m in store.messages(&row.conversation_id)? {
            let read_by = store.read_by(&m.message_id)?.into_iter().collect();
            messages.push(Message {
                id: m.message_id,
                conversation_id: m.conversation_id,
                text: m.text,
                sender_id: m.sender_id,
                created_at: m.created_at,
                seq: m.seq,
                read_by,
                reply_to: m.reply_to,
            });
        }

        let mut unread = HashMap::new();
        for user in &participants {
            let count = messages.iter().filter(|m| !m.read_by.contains(user)).count();
            unread.insert(user.clone(), count as u64);
        }

        let conversation = Conversation {
            id: row.conversation_id,
            participants,
            name: row.name,
            avatar: row.avatar,
            is_group: row.is_group,
            is_self_chat: row.is_self_chat,
            created_at: row.created_at,
            latest_message_id: row.latest_message_id,
            latest_message_at: row.latest_message_at,
            unread,
        };
        state.log.insert_loaded(&conversation.id, messages).await;
        state.directory.insert_loaded(conversation).await;
    }

    if count > 0 {
        crate::plog!("state: reloaded {count} conversation(s) from store");
    }
    Ok(())
}
