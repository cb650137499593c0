//! Error taxonomy for the synchronization engine.
//!
//! Connection-level failures ([`AuthError`]) refuse the connection before any
//! server state exists. Per-operation failures ([`SyncError`]) are returned
//! to the invoking client through its ack and never terminate the session or
//! leak into other participants' state.

use std::fmt;

/// Why a connection handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credential missing, structurally invalid, or signature mismatch.
    Malformed,
    /// Credential was valid once but its expiry has passed.
    Expired,
    /// Signature checks out but the user no longer exists in the store.
    UnknownUser(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Malformed => write!(f, "malformed credential"),
            AuthError::Expired => write!(f, "expired credential"),
            AuthError::UnknownUser(id) => write!(f, "unknown user: {id}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Per-operation failures surfaced through acks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The target of a conversation request does not exist.
    TargetNotFound(String),
    /// Sender is not a participant of the addressed conversation.
    Forbidden,
    /// The addressed conversation (or message) does not exist.
    NotFound(String),
    /// An emit did not complete within the bounded send window.
    Timeout,
    /// Request payload failed validation at the boundary.
    Invalid(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::TargetNotFound(id) => write!(f, "target user not found: {id}"),
            SyncError::Forbidden => write!(f, "sender is not a participant"),
            SyncError::NotFound(id) => write!(f, "conversation not found: {id}"),
            SyncError::Timeout => write!(f, "operation timed out"),
            SyncError::Invalid(msg) => write!(f, "invalid request: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

/// Failures in the durable store.
#[derive(Debug)]
pub enum StoreError {
    Sqlite(rusqlite::Error),
    NotFound(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StoreError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}
