//! Conversation directory: the dedup source of truth.
//!
//! Every conversation maps to a canonical, order-independent
//! [`ConversationKey`]. Creation serializes per key, never globally: two
//! concurrent requests for the same participant pair race on one small
//! mutex, exactly one creation wins, and the loser observes `existing=true`
//! with the same durable id. Unrelated conversations stay independent.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::SyncError;
use crate::protocol::ConversationInfo;
use crate::util::now_millis;

/// Canonical dedup key for a conversation's participant set and type flags.
/// Never transmitted; used only for directory lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey(String);

impl ConversationKey {
    /// Key for a 1:1 conversation; order-independent.
    pub fn direct(a: &str, b: &str) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        ConversationKey(format!("dm:{lo}+{hi}"))
    }

    /// Key for a user's notes-to-self conversation. Discriminated from a 1:1
    /// chat against oneself so the two can never collide.
    pub fn self_chat(user: &str) -> Self {
        ConversationKey(format!("self:{user}"))
    }

    /// Key for a group conversation over its full member set.
    pub fn group(members: &[String]) -> Self {
        let mut sorted: Vec<&str> = members.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        ConversationKey(format!("group:{}", sorted.join("+")))
    }

    /// Recompute the key from stored conversation fields (startup reload).
    pub fn of(conversation: &Conversation) -> Self {
        if conversation.is_self_chat {
            Self::self_chat(&conversation.participants[0])
        } else if conversation.is_group {
            Self::group(&conversation.participants)
        } else {
            Self::direct(&conversation.participants[0], &conversation.participants[1])
        }
    }
}

/// A conversation as the directory sees it. `unread` is a cache of the
/// per-user derived unread counts; the message log's `read_by` sets are the
/// canonical fact and every cache write comes from them.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    /// Sorted participant ids.
    pub participants: Vec<String>,
    pub name: String,
    pub avatar: String,
    pub is_group: bool,
    pub is_self_chat: bool,
    pub created_at: u64,
    pub latest_message_id: Option<String>,
    pub latest_message_at: Option<u64>,
    pub unread: HashMap<String, u64>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    pub fn unread_for(&self, user_id: &str) -> u64 {
        self.unread.get(user_id).copied().unwrap_or(0)
    }

    /// Wire form as seen by one recipient.
    pub fn info_for(&self, user_id: &str) -> ConversationInfo {
        ConversationInfo {
            id: self.id.clone(),
            participants: self.participants.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            is_group: self.is_group,
            is_self_chat: self.is_self_chat,
            latest_message_id: self.latest_message_id.clone(),
            latest_message_at: self.latest_message_at,
            unread_count: self.unread_for(user_id),
        }
    }
}

/// Parameters for a 1:1 or self-chat creation request.
pub struct ConversationRequest {
    pub requester: String,
    pub target: String,
    pub name: String,
    pub avatar: String,
    pub is_self_chat: bool,
}

pub struct ConversationDirectory {
    conversations: RwLock<HashMap<String, Conversation>>,
    by_key: RwLock<HashMap<ConversationKey, String>>,
    /// One creation mutex per key; held across the lookup-then-insert so
    /// exactly one creation wins a race.
    creation_locks: Mutex<HashMap<ConversationKey, Arc<Mutex<()>>>>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            by_key: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the conversation for this request, creating it if absent.
    /// Returns the conversation and whether it already existed. Concurrent
    /// calls with the same key serialize; all callers receive the same id.
    pub async fn resolve_or_create(
        &self,
        request: ConversationRequest,
    ) -> Result<(Conversation, bool), SyncError> {
        if request.is_self_chat && request.target != request.requester {
            return Err(SyncError::Invalid(
                "self chat target must be the requester".to_string(),
            ));
        }

        let key = if request.is_self_chat {
            ConversationKey::self_chat(&request.requester)
        } else {
            ConversationKey::direct(&request.requester, &request.target)
        };

        let key_lock = {
            let mut locks = self.creation_locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let _creating = key_lock.lock().await;

        if let Some(id) = self.by_key.read().await.get(&key).cloned() {
            let conversations = self.conversations.read().await;
            let conversation = conversations
                .get(&id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(id))?;
            return Ok((conversation, true));
        }

        let mut participants = if request.is_self_chat {
            vec![request.requester.clone()]
        } else {
            vec![request.requester.clone(), request.target.clone()]
        };
        participants.sort_unstable();

        let conversation = Conversation {
            id: new_conversation_id(),
            participants,
            name: if request.is_self_chat {
                "Yourself".to_string()
            } else {
                request.name
            },
            avatar: request.avatar,
            is_group: false,
            is_self_chat: request.is_self_chat,
            created_at: now_millis(),
            latest_message_id: None,
            latest_message_at: None,
            unread: HashMap::new(),
        };

        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation.clone());
        self.by_key.write().await.insert(key, conversation.id.clone());

        crate::plog!(
            "directory: created {} for {:?}",
            crate::logging::conv_id(&conversation.id),
            conversation.participants
        );

        Ok((conversation, false))
    }

    pub async fn get(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    /// Record a new latest message and bump unread for everyone but the
    /// sender. Returns the updated conversation.
    pub async fn touch(
        &self,
        id: &str,
        message_id: &str,
        at: u64,
        sender_id: &str,
    ) -> Option<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.get_mut(id)?;
        conversation.latest_message_id = Some(message_id.to_string());
        conversation.latest_message_at = Some(at);
        for participant in conversation.participants.clone() {
            if participant != sender_id {
                *conversation.unread.entry(participant).or_insert(0) += 1;
            }
        }
        Some(conversation.clone())
    }

    /// Write a derived unread count into the cache for one user.
    pub async fn set_unread(&self, id: &str, user_id: &str, count: u64) -> Option<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations.get_mut(id)?;
        conversation.unread.insert(user_id.to_string(), count);
        Some(conversation.clone())
    }

    /// All conversations a user participates in, most recently active first.
    pub async fn conversations_for(&self, user_id: &str) -> Vec<Conversation> {
        let conversations = self.conversations.read().await;
        let mut list: Vec<Conversation> = conversations
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect();
        list.sort_by_key(|c| std::cmp::Reverse(c.latest_message_at.unwrap_or(c.created_at)));
        list
    }

    /// Insert a conversation reloaded from the durable store.
    pub async fn insert_loaded(&self, conversation: Conversation) {
        let key = ConversationKey::of(&conversation);
        self.by_key.write().await.insert(key, conversation.id.clone());
        self.conversations
            .write()
            .await
            .insert(conversation.id.clone(), conversation);
    }
}

impl Default for ConversationDirectory {
    fn default() -> Self {
        Self::new()
    }
}

/// Durable conversation ids are 32 hex chars so they can never be mistaken
/// for a client-minted `tmp-` id.
fn new_conversation_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
