//! Configuration types and constants for the parley server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Capacity of each connection's outbound event queue.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Bound on any single emit to a client before it is reported as failed.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default lifetime of issued bearer tokens.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 3600;

/// Default page size for the REST message-history endpoint.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

/// Maximum accepted message text length, in bytes.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024;

/// Real-time chat synchronization server.
///
/// Authenticated WebSocket sessions, an online-presence roster, deduplicated
/// conversation creation and an ordered message log with read receipts.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server.
    Serve {
        /// Bind address [env: PARLEY_BIND] [default: 127.0.0.1:3001]
        #[arg(long, short = 'b')]
        bind: Option<String>,

        /// SQLite database path [env: PARLEY_DB] [default: parley.db]
        #[arg(long, short = 'd')]
        db: Option<PathBuf>,

        /// Token signing secret [env: PARLEY_SECRET]
        #[arg(long, short = 's')]
        secret: Option<String>,
    },
    /// Seed a user into the store (admin tooling, not a registration flow).
    AddUser {
        /// Durable user id.
        user_id: String,
        /// Display name.
        username: String,
        /// Avatar reference [default: /default-avatar.png]
        #[arg(long)]
        avatar: Option<String>,
        /// SQLite database path [env: PARLEY_DB] [default: parley.db]
        #[arg(long, short = 'd')]
        db: Option<PathBuf>,
    },
    /// Mint a bearer token for an existing user.
    IssueToken {
        user_id: String,
        /// Token lifetime in seconds [default: 86400]
        #[arg(long)]
        ttl: Option<u64>,
        /// Token signing secret [env: PARLEY_SECRET]
        #[arg(long, short = 's')]
        secret: Option<String>,
    },
}

pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub secret: String,
}

impl Config {
    pub fn resolve(bind: Option<String>, db: Option<PathBuf>, secret: Option<String>) -> Self {
        Self {
            bind_addr: bind
                .or_else(|| std::env::var("PARLEY_BIND").ok())
                .unwrap_or_else(|| "127.0.0.1:3001".to_string()),
            db_path: resolve_db_path(db),
            secret: resolve_secret(secret),
        }
    }
}

pub fn resolve_db_path(db: Option<PathBuf>) -> PathBuf {
    db.or_else(|| std::env::var("PARLEY_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("parley.db"))
}

pub fn resolve_secret(secret: Option<String>) -> String {
    secret
        .or_else(|| std::env::var("PARLEY_SECRET").ok())
        .unwrap_or_else(|| "development-secret".to_string())
}
