//! HTTP surface: the websocket endpoint plus a small read-only REST API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use crate::config::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
use crate::engine;
use crate::protocol::{ConversationInfo, MessageInfo};
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(engine::ws_handler))
        .route("/api/health", get(health))
        .route("/api/users/:user_id/conversations", get(list_conversations))
        .route(
            "/api/conversations/:conversation_id/messages",
            get(list_messages),
        )
        .with_state(state)
}

/// A JSON error body with the given status.
pub fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// A user's conversations, most recently active first, rendered from that
/// user's perspective.
async fn list_conversations(
    Path(user_id): Path<String>,
    State(state): State<SharedState>,
) -> Json<Vec<ConversationInfo>> {
    let conversations = state.directory.conversations_for(&user_id).await;
    Json(
        conversations
            .iter()
            .map(|c| c.info_for(&user_id))
            .collect(),
    )
}

#[derive(Deserialize)]
struct HistoryQuery {
    /// Return messages with `seq` strictly below this; newest page if absent.
    before: Option<u64>,
    limit: Option<u32>,
}

/// Paged message history, oldest first within the page.
async fn list_messages(
    Path(conversation_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    State(state): State<SharedState>,
) -> Response {
    if state.directory.get(&conversation_id).await.is_none() {
        return api_error(StatusCode::NOT_FOUND, "no such conversation");
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);

    let store = state.store.lock().await;
    match store.messages_page(&conversation_id, query.before, limit) {
        Ok(rows) => {
            let read_by = |id: &str| store.read_by(id).unwrap_or_default();
            let messages: Vec<MessageInfo> = rows
                .into_iter()
                .map(|m| MessageInfo {
                    read_by: read_by(&m.message_id),
                    id: m.message_id,
                    conversation_id: m.conversation_id,
                    text: m.text,
                    sender_id: m.sender_id,
                    created_at: m.created_at,
                    seq: m.seq,
                    reply_to: m.reply_to,
                })
                .collect();
            Json(messages).into_response()
        }
        Err(e) => {
            crate::plog!("api: history query for {conversation_id} failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "history unavailable")
        }
    }
}
