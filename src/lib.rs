//! parley: a real-time chat synchronization server.
//!
//! Clients connect over an authenticated websocket and exchange tagged JSON
//! events. The server keeps the canonical state: who is online, which
//! conversations exist (deduplicated by participant set), and each
//! conversation's ordered message log with per-message read receipts.
//! Everything is persisted to SQLite and reloaded at startup; a small REST
//! API exposes conversation listings and paged history.

pub mod auth;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod logging;
pub mod messages;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod rooms;
pub mod router;
pub mod state;
pub mod store;
pub mod util;
