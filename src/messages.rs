//! Append-only per-conversation message log with read-state tracking.
//!
//! Each conversation's log is guarded by its own mutex so appends to
//! unrelated conversations never contend. Ordering within a conversation is
//! the server-assigned sequence number (client clocks are not trusted);
//! `read_by` sets only grow, and unread counts are derived from them.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::directory::Conversation;
use crate::error::SyncError;
use crate::protocol::MessageInfo;
use crate::util::now_millis;

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
    pub created_at: u64,
    pub seq: u64,
    pub read_by: BTreeSet<String>,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn info(&self) -> MessageInfo {
        MessageInfo {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            text: self.text.clone(),
            sender_id: self.sender_id.clone(),
            created_at: self.created_at,
            seq: self.seq,
            read_by: self.read_by.iter().cloned().collect(),
            reply_to: self.reply_to.clone(),
        }
    }
}

/// Result of a `mark_read` call: which messages actually changed, and the
/// reader's remaining derived unread count (the canonical value callers push
/// into the directory cache).
#[derive(Debug)]
pub struct MarkReadOutcome {
    pub newly_read: Vec<String>,
    pub remaining_unread: u64,
}

struct ConversationLog {
    next_seq: u64,
    messages: Vec<Message>,
}

pub struct MessageLog {
    logs: RwLock<HashMap<String, Arc<Mutex<ConversationLog>>>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
        }
    }

    async fn log_for(&self, conversation_id: &str) -> Arc<Mutex<ConversationLog>> {
        if let Some(log) = self.logs.read().await.get(conversation_id) {
            return Arc::clone(log);
        }
        let mut logs = self.logs.write().await;
        Arc::clone(logs.entry(conversation_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ConversationLog {
                next_seq: 1,
                messages: Vec::new(),
            }))
        }))
    }

    /// Append a message. The sender must be a participant; the message is
    /// created already read by its sender.
    pub async fn append(
        &self,
        conversation: &Conversation,
        sender_id: &str,
        text: String,
        reply_to: Option<String>,
    ) -> Result<Message, SyncError> {
        if !conversation.is_participant(sender_id) {
            return Err(SyncError::Forbidden);
        }

        let log = self.log_for(&conversation.id).await;
        let mut log = log.lock().await;
        let seq = log.next_seq;
        log.next_seq += 1;

        let message = Message {
            id: new_message_id(),
            conversation_id: conversation.id.clone(),
            text,
            sender_id: sender_id.to_string(),
            created_at: now_millis(),
            seq,
            read_by: BTreeSet::from([sender_id.to_string()]),
            reply_to,
        };
        log.messages.push(message.clone());

        crate::plog!(
            "log: appended {} seq {} to {}",
            crate::logging::msg_id(&message.id),
            seq,
            crate::logging::conv_id(&conversation.id)
        );
        Ok(message)
    }

    /// Add `reader` to the `read_by` set of each listed message. Idempotent:
    /// an already-present reader is a no-op and does not appear in the
    /// outcome's `newly_read`.
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        reader: &str,
        message_ids: &[String],
    ) -> MarkReadOutcome {
        let log = self.log_for(conversation_id).await;
        let mut log = log.lock().await;

        let wanted: BTreeSet<&str> = message_ids.iter().map(String::as_str).collect();
        let mut newly_read = Vec::new();
        let mut remaining_unread = 0;
        for message in &mut log.messages {
            if wanted.contains(message.id.as_str()) && message.read_by.insert(reader.to_string()) {
                newly_read.push(message.id.clone());
            }
            if !message.read_by.contains(reader) {
                remaining_unread += 1;
            }
        }

        MarkReadOutcome {
            newly_read,
            remaining_unread,
        }
    }

    /// Messages with `seq > cursor`, in sequence order. `cursor = 0` is the
    /// full log; a caller can restart from the last sequence it saw.
    pub async fn list_since(&self, conversation_id: &str, cursor: u64) -> Vec<Message> {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;
        log.messages
            .iter()
            .filter(|m| m.seq > cursor)
            .cloned()
            .collect()
    }

    /// Derived unread count: messages the user has not read.
    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> u64 {
        let log = self.log_for(conversation_id).await;
        let log = log.lock().await;
        log.messages
            .iter()
            .filter(|m| !m.read_by.contains(user_id))
            .count() as u64
    }

    /// Install a conversation's log reloaded from the durable store.
    pub async fn insert_loaded(&self, conversation_id: &str, messages: Vec<Message>) {
        let next_seq = messages.iter().map(|m| m.seq).max().unwrap_or(0) + 1;
        let mut logs = self.logs.write().await;
        logs.insert(
            conversation_id.to_string(),
            Arc::new(Mutex::new(ConversationLog { next_seq, messages })),
        );
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

fn new_message_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
