use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use parley::config::{Cli, Command, Config, resolve_db_path, resolve_secret, DEFAULT_TOKEN_TTL_SECS};
use parley::store::{Store, UserRow};
use parley::util::now_secs;
use parley::{auth, logging, plog, router, state};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    match cli.command {
        Command::Serve { bind, db, secret } => {
            let config = Config::resolve(bind, db, secret);
            serve(config).await
        }
        Command::AddUser {
            user_id,
            username,
            avatar,
            db,
        } => add_user(&resolve_db_path(db), user_id, username, avatar),
        Command::IssueToken {
            user_id,
            ttl,
            secret,
        } => {
            let verifier = auth::TokenVerifier::new(resolve_secret(secret));
            let token = verifier.issue(&user_id, ttl.unwrap_or(DEFAULT_TOKEN_TTL_SECS));
            println!("{token}");
            ExitCode::SUCCESS
        }
    }
}

async fn serve(config: Config) -> ExitCode {
    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            plog!("failed to open {}: {e}", config.db_path.display());
            return ExitCode::FAILURE;
        }
    };

    let state = match state::init(store, &config.secret).await {
        Ok(state) => state,
        Err(e) => {
            plog!("failed to load state: {e}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            plog!("failed to bind {}: {e}", config.bind_addr);
            return ExitCode::FAILURE;
        }
    };

    plog!("parley listening on {}", config.bind_addr);
    plog!("  websocket: ws://{}/ws", config.bind_addr);
    plog!("  store:     {}", config.db_path.display());

    let app = router::build_router(state);
    if let Err(e) = axum::serve(listener, app).await {
        plog!("server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn add_user(
    db_path: &Path,
    user_id: String,
    username: String,
    avatar: Option<String>,
) -> ExitCode {
    let store = match Store::open(db_path) {
        Ok(store) => store,
        Err(e) => {
            plog!("failed to open {}: {e}", db_path.display());
            return ExitCode::FAILURE;
        }
    };
    let row = UserRow {
        user_id,
        username,
        avatar: avatar.unwrap_or_else(|| "/default-avatar.png".to_string()),
        created_at: now_secs(),
    };
    match store.insert_user(&row) {
        Ok(()) => {
            plog!("added user {}", logging::user_id(&row.user_id));
            ExitCode::SUCCESS
        }
        Err(e) => {
            plog!("failed to add user: {e}");
            ExitCode::FAILURE
        }
    }
}
