//! Wire types for the synchronization protocol.
//!
//! Every inbound event is a tagged variant with a fixed schema, validated at
//! the boundary before it reaches the engine. Requests carry a `request_id`
//! and are answered with an `ack` event carrying `success` plus any payload;
//! failures are reported as `{success: false, error}` rather than closing the
//! connection.

use serde::{Deserialize, Serialize};

/// Resolved identity of an authenticated user. Immutable for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
}

/// Roster entry sent in `online_users` broadcasts and acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    /// Seconds since UNIX epoch of the entry's last registration.
    pub last_seen_at: u64,
}

/// Wire form of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub conversation_id: String,
    pub text: String,
    pub sender_id: String,
    /// Milliseconds since UNIX epoch, server clock.
    pub created_at: u64,
    /// Server-assigned per-conversation sequence number, the ordering
    /// tie-break for equal timestamps.
    pub seq: u64,
    pub read_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// Wire form of a conversation, rendered for one recipient (`unread_count`
/// is that recipient's counter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub id: String,
    pub participants: Vec<String>,
    pub name: String,
    pub avatar: String,
    pub is_group: bool,
    pub is_self_chat: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_message_at: Option<u64>,
    pub unread_count: u64,
}

/// Events a client may send. Unknown tags fail deserialization and are
/// rejected before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    GetOnlineUsers {
        request_id: u64,
    },
    StartConversation {
        request_id: u64,
        target_user_id: String,
        #[serde(default)]
        target_username: Option<String>,
        #[serde(default)]
        target_avatar: Option<String>,
        /// Client-minted provisional id to reconcile in the ack.
        #[serde(default)]
        temp_id: Option<String>,
        #[serde(default)]
        is_self_chat: bool,
    },
    SendMessage {
        request_id: u64,
        conversation_id: String,
        text: String,
        #[serde(default)]
        reply_to: Option<String>,
    },
    MarkRead {
        request_id: u64,
        conversation_id: String,
        message_ids: Vec<String>,
    },
    GetMessages {
        request_id: u64,
        conversation_id: String,
    },
}

impl ClientEvent {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientEvent::GetOnlineUsers { request_id }
            | ClientEvent::StartConversation { request_id, .. }
            | ClientEvent::SendMessage { request_id, .. }
            | ClientEvent::MarkRead { request_id, .. }
            | ClientEvent::GetMessages { request_id, .. } => *request_id,
        }
    }
}

/// Events the server emits, both acks and room/roster broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Ack {
        request_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        users: Option<Vec<PresenceInfo>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messages: Option<Vec<MessageInfo>>,
    },
    OnlineUsers {
        users: Vec<PresenceInfo>,
    },
    NewConversation {
        conversation: ConversationInfo,
    },
    ConversationUpdated {
        conversation: ConversationInfo,
    },
    NewMessage {
        conversation_id: String,
        message: MessageInfo,
    },
    MessagesRead {
        conversation_id: String,
        reader_id: String,
        message_ids: Vec<String>,
    },
    /// Sent to a stale session just before it is closed because the same
    /// user registered a newer connection.
    SessionReplaced,
}

impl ServerEvent {
    /// A bare successful ack with no payload.
    pub fn ack_ok(request_id: u64) -> Self {
        ServerEvent::Ack {
            request_id,
            success: true,
            error: None,
            users: None,
            conversation_id: None,
            temp_id: None,
            existing: None,
            messages: None,
        }
    }

    /// A failed ack carrying the error text.
    pub fn ack_err(request_id: u64, error: impl std::fmt::Display) -> Self {
        ServerEvent::Ack {
            request_id,
            success: false,
            error: Some(error.to_string()),
            users: None,
            conversation_id: None,
            temp_id: None,
            existing: None,
            messages: None,
        }
    }
}
