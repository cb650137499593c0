//! SQLite repository for users, conversations, messages, and read marks.
//!
//! The in-memory registries are authoritative while the process runs; the
//! store is the durable collaborator they write through to, and the source
//! the registries are reloaded from at startup. It also backs the REST
//! history endpoints.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id     TEXT PRIMARY KEY,
    username    TEXT NOT NULL,
    avatar      TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    conversation_id   TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    avatar            TEXT NOT NULL,
    is_group          INTEGER NOT NULL DEFAULT 0,
    is_self_chat      INTEGER NOT NULL DEFAULT 0,
    created_at        INTEGER NOT NULL,
    latest_message_id TEXT,
    latest_message_at INTEGER
);

CREATE TABLE IF NOT EXISTS participants (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    PRIMARY KEY (conversation_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_participants_user ON participants (user_id);

CREATE TABLE IF NOT EXISTS messages (
    message_id      TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    sender_id       TEXT NOT NULL,
    text            TEXT NOT NULL,
    created_at      INTEGER NOT NULL,
    reply_to        TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_conv_seq ON messages (conversation_id, seq);

CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    PRIMARY KEY (message_id, user_id)
);
";

/// User row stored in the database.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub user_id: String,
    pub username: String,
    pub avatar: String,
    pub created_at: u64,
}

/// Conversation row stored in the database.
#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub name: String,
    pub avatar: String,
    pub is_group: bool,
    pub is_self_chat: bool,
    pub created_at: u64,
    pub latest_message_id: Option<String>,
    pub latest_message_at: Option<u64>,
}

/// Message row stored in the database.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: String,
    pub conversation_id: String,
    pub seq: u64,
    pub sender_id: String,
    pub text: String,
    pub created_at: u64,
    pub reply_to: Option<String>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory database, used by tests and `serve` without a db path.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // -- users --------------------------------------------------------------

    pub fn insert_user(&self, row: &UserRow) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO users (user_id, username, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![row.user_id, row.username, row.avatar, row.created_at],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<UserRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, username, avatar, created_at FROM users WHERE user_id = ?1",
                params![user_id],
                |r| {
                    Ok(UserRow {
                        user_id: r.get(0)?,
                        username: r.get(1)?,
                        avatar: r.get(2)?,
                        created_at: r.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // -- conversations ------------------------------------------------------

    pub fn insert_conversation(
        &mut self,
        row: &ConversationRow,
        participants: &[String],
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations
             (conversation_id, name, avatar, is_group, is_self_chat, created_at,
              latest_message_id, latest_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.conversation_id,
                row.name,
                row.avatar,
                row.is_group,
                row.is_self_chat,
                row.created_at,
                row.latest_message_id,
                row.latest_message_at,
            ],
        )?;
        for user_id in participants {
            tx.execute(
                "INSERT OR IGNORE INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
                params![row.conversation_id, user_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_latest_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        at: u64,
    ) -> Result<(), StoreError> {
        let n = self.conn.execute(
            "UPDATE conversations SET latest_message_id = ?2, latest_message_at = ?3
             WHERE conversation_id = ?1",
            params![conversation_id, message_id, at],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound(conversation_id.to_string()));
        }
        Ok(())
    }

    pub fn participants(&self, conversation_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM participants WHERE conversation_id = ?1 ORDER BY user_id")?;
        let rows = stmt
            .query_map(params![conversation_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All conversations a user participates in, most recently active first.
    pub fn conversations_for(&self, user_id: &str) -> Result<Vec<ConversationRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.conversation_id, c.name, c.avatar, c.is_group, c.is_self_chat,
                    c.created_at, c.latest_message_id, c.latest_message_at
             FROM conversations c
             JOIN participants p ON p.conversation_id = c.conversation_id
             WHERE p.user_id = ?1
             ORDER BY COALESCE(c.latest_message_at, c.created_at) DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id], row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every conversation in the store; used for the startup reload.
    pub fn all_conversations(&self) -> Result<Vec<ConversationRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, name, avatar, is_group, is_self_chat,
                    created_at, latest_message_id, latest_message_at
             FROM conversations ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- messages -----------------------------------------------------------

    /// Insert a message together with its initial read mark (the sender).
    pub fn insert_message(&mut self, row: &MessageRow) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO messages
             (message_id, conversation_id, seq, sender_id, text, created_at, reply_to)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.message_id,
                row.conversation_id,
                row.seq,
                row.sender_id,
                row.text,
                row.created_at,
                row.reply_to,
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
            params![row.message_id, row.sender_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record that `user_id` has read `message_id`. Idempotent.
    pub fn mark_read(&self, message_id: &str, user_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id) VALUES (?1, ?2)",
            params![message_id, user_id],
        )?;
        Ok(())
    }

    pub fn read_by(&self, message_id: &str) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM message_reads WHERE message_id = ?1 ORDER BY user_id")?;
        let rows = stmt
            .query_map(params![message_id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// All messages of a conversation in sequence order.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<MessageRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, seq, sender_id, text, created_at, reply_to
             FROM messages WHERE conversation_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// A page of up to `limit` messages with `seq < before` (newest page when
    /// `before` is `None`), returned in ascending sequence order.
    pub fn messages_page(
        &self,
        conversation_id: &str,
        before: Option<u64>,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, seq, sender_id, text, created_at, reply_to
             FROM messages
             WHERE conversation_id = ?1 AND (?2 IS NULL OR seq < ?2)
             ORDER BY seq DESC LIMIT ?3",
        )?;
        let mut rows = stmt
            .query_map(params![conversation_id, before, limit], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }
}

fn row_to_conversation(r: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        conversation_id: r.get(0)?,
        name: r.get(1)?,
        avatar: r.get(2)?,
        is_group: r.get(3)?,
        is_self_chat: r.get(4)?,
        created_at: r.get(5)?,
        latest_message_id: r.get(6)?,
        latest_message_at: r.get(7)?,
    })
}

fn row_to_message(r: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        message_id: r.get(0)?,
        conversation_id: r.get(1)?,
        seq: r.get(2)?,
        sender_id: r.get(3)?,
        text: r.get(4)?,
        created_at: r.get(5)?,
        reply_to: r.get(6)?,
    })
}
