//! The synchronization engine: one coordinator task per connection.
//!
//! A connection moves through `Authenticated -> Active -> Disconnected`.
//! The bearer credential is verified before the websocket upgrade, so a
//! refused connection never creates any server state. Once
//! active, inbound events are dispatched serially for the connection; every
//! request is answered through its ack, and failures never tear down the
//! session or leak into other participants.
//!
//! Reconnection is a fresh session: it re-registers presence, rejoins the
//! rooms of the user's conversations, and the client re-fetches state rather
//! than resuming from before the gap.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::{MAX_MESSAGE_LEN, OUTBOUND_CHANNEL_CAPACITY};
use crate::directory::{Conversation, ConversationRequest};
use crate::error::SyncError;
use crate::logging;
use crate::protocol::{ClientEvent, ServerEvent, UserIdentity};
use crate::reconcile::{is_temp_id, BufferOutcome, BufferedSend};
use crate::rooms::ConnectionHandle;
use crate::router::api_error;
use crate::state::SharedState;
use crate::store;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Authenticated,
    Active,
    Disconnected,
}

fn transition(from: ConnState, to: ConnState, user_id: &str, conn_id: u64) -> ConnState {
    crate::plog!(
        "session: {:?} -> {:?} for {} (conn {})",
        from,
        to,
        logging::user_id(user_id),
        conn_id
    );
    to
}

/// Websocket entry point. The credential comes from the `Authorization`
/// header or a `token` query parameter; verification failure refuses the
/// upgrade with 401 and nothing else happens.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<SharedState>,
) -> Response {
    let Some(credential) = bearer_token(&headers).or(query.token) else {
        return api_error(StatusCode::UNAUTHORIZED, "missing credential");
    };

    let verified = {
        let store = state.store.lock().await;
        state.verifier.verify(&credential, &store)
    };
    match verified {
        Ok(identity) => ws
            .on_upgrade(move |socket| session(socket, identity, state))
            .into_response(),
        Err(e) => {
            crate::plog!("session: connection refused: {e}");
            api_error(StatusCode::UNAUTHORIZED, e.to_string())
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

async fn session(socket: WebSocket, identity: UserIdentity, state: SharedState) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let user_id = identity.user_id.clone();
    let mut phase = ConnState::Authenticated;

    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(OUTBOUND_CHANNEL_CAPACITY);
    let handle = ConnectionHandle::new(conn_id, user_id.clone(), event_tx);

    let (mut sink, mut stream) = socket.split();

    // Writer task: forwards queued events to the socket. A replacement
    // notice is the last thing a superseded session is sent.
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let closing = matches!(event, ServerEvent::SessionReplaced);
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Register presence (which pushes the roster to everyone, this
    // connection included) and rejoin the rooms of every conversation the
    // user already participates in.
    state.presence.register(identity.clone(), handle.clone()).await;
    for conversation in state.directory.conversations_for(&user_id).await {
        state.rooms.join(&conversation.id, handle.clone()).await;
    }
    phase = transition(phase, ConnState::Active, &user_id, conn_id);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&state, &handle, &identity, event).await,
                Err(e) => {
                    crate::plog!(
                        "session: rejected malformed event from {}: {e}",
                        logging::user_id(&user_id)
                    );
                }
            },
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Ping/pong keepalives are handled by the transport.
            Ok(_) => {}
        }
    }

    transition(phase, ConnState::Disconnected, &user_id, conn_id);
    state.presence.unregister(&user_id, conn_id).await;
    state.rooms.leave_all(conn_id).await;
    state.arena.clear_connection(conn_id).await;
    drop(handle);
    let _ = writer.await;
}

/// Route one inbound event. Handlers return the ack to send, `None` when the
/// ack is deferred (buffered optimistic send), or an error that becomes a
/// failed ack.
async fn dispatch(
    state: &SharedState,
    handle: &ConnectionHandle,
    identity: &UserIdentity,
    event: ClientEvent,
) {
    let request_id = event.request_id();
    let result = match event {
        ClientEvent::GetOnlineUsers { .. } => get_online_users(state, request_id).await,
        ClientEvent::StartConversation {
            target_user_id,
            temp_id,
            is_self_chat,
            ..
        } => {
            start_conversation(
                state,
                handle,
                identity,
                request_id,
                target_user_id,
                temp_id,
                is_self_chat,
            )
            .await
        }
        ClientEvent::SendMessage {
            conversation_id,
            text,
            reply_to,
            ..
        } => {
            send_message(
                state,
                handle,
                identity,
                request_id,
                conversation_id,
                text,
                reply_to,
            )
            .await
        }
        ClientEvent::MarkRead {
            conversation_id,
            message_ids,
            ..
        } => mark_read(state, identity, request_id, conversation_id, message_ids).await,
        ClientEvent::GetMessages {
            conversation_id, ..
        } => get_messages(state, identity, request_id, conversation_id).await,
    };

    let ack = match result {
        Ok(Some(ack)) => ack,
        Ok(None) => return,
        Err(e) => {
            crate::plog!(
                "session: request {request_id} from {} failed: {e}",
                logging::user_id(&identity.user_id)
            );
            ServerEvent::ack_err(request_id, e)
        }
    };
    let _ = handle.send(ack).await;
}

async fn get_online_users(
    state: &SharedState,
    request_id: u64,
) -> Result<Option<ServerEvent>, SyncError> {
    let users = state.presence.snapshot().await;
    Ok(Some(ServerEvent::Ack {
        request_id,
        success: true,
        error: None,
        users: Some(users),
        conversation_id: None,
        temp_id: None,
        existing: None,
        messages: None,
    }))
}

async fn start_conversation(
    state: &SharedState,
    handle: &ConnectionHandle,
    identity: &UserIdentity,
    request_id: u64,
    target_user_id: String,
    temp_id: Option<String>,
    is_self_chat: bool,
) -> Result<Option<ServerEvent>, SyncError> {
    let created = create_conversation(state, identity, target_user_id, is_self_chat).await;
    let (conversation, existing) = match created {
        Ok(created) => created,
        Err(e) => {
            // Creation failed, so the temp id will never resolve. Poison its
            // slot and fail-ack anything already parked against it; later
            // sends tagged with the temp id fail at buffering time.
            if let Some(tid) = &temp_id {
                for buffered in state.arena.fail(tid, handle.conn_id, e.clone()).await {
                    let _ = buffered
                        .handle
                        .send(ServerEvent::ack_err(buffered.request_id, e.clone()))
                        .await;
                }
            }
            return Err(e);
        }
    };

    if !existing {
        let mut store = state.store.lock().await;
        if let Err(e) = store.insert_conversation(
            &conversation_row(&conversation),
            &conversation.participants,
        ) {
            crate::plog!(
                "store: failed to persist conversation {}: {e}",
                logging::conv_id(&conversation.id)
            );
        }
    }

    // Join the requester's connection, and for a 1:1 the target's live
    // connection too, so both sides receive room broadcasts immediately.
    state.rooms.join(&conversation.id, handle.clone()).await;
    for participant in &conversation.participants {
        if participant != &identity.user_id {
            if let Some(target_handle) = state.presence.handle_for(participant).await {
                state.rooms.join(&conversation.id, target_handle).await;
            }
        }
    }

    // Announce the conversation. The requester always hears about it; other
    // participants only when it was newly created.
    for participant in &conversation.participants {
        if existing && participant != &identity.user_id {
            continue;
        }
        if let Some(participant_handle) = state.presence.handle_for(participant).await {
            let _ = participant_handle
                .send(ServerEvent::NewConversation {
                    conversation: conversation.info_for(participant),
                })
                .await;
        }
    }

    // The creation ack goes out before any buffered sends are replayed, so
    // the client learns the id mapping before their deferred acks arrive.
    let _ = handle
        .send(ServerEvent::Ack {
            request_id,
            success: true,
            error: None,
            users: None,
            conversation_id: Some(conversation.id.clone()),
            temp_id: temp_id.clone(),
            existing: Some(existing),
            messages: None,
        })
        .await;

    // Reconcile the provisional id: record the mapping and replay any sends
    // the client issued against it while creation was in flight.
    if let Some(tid) = &temp_id {
        let replays = state.arena.resolve(tid, &conversation.id).await;
        for buffered in replays {
            let outcome = deliver_message(
                state,
                &buffered.sender_id,
                &conversation.id,
                buffered.text,
                buffered.reply_to,
            )
            .await;
            let ack = match outcome {
                Ok(()) => ServerEvent::ack_ok(buffered.request_id),
                Err(e) => ServerEvent::ack_err(buffered.request_id, e),
            };
            let _ = buffered.handle.send(ack).await;
        }
    }

    Ok(None)
}

/// Resolve the conversation a `start_conversation` request addresses. The
/// store's profile is authoritative for the conversation's display metadata;
/// the client-supplied name and avatar are hints only.
async fn create_conversation(
    state: &SharedState,
    identity: &UserIdentity,
    target_user_id: String,
    is_self_chat: bool,
) -> Result<(Conversation, bool), SyncError> {
    let (name, avatar, target) = if is_self_chat {
        (
            "Yourself".to_string(),
            identity.avatar.clone(),
            identity.user_id.clone(),
        )
    } else {
        let store = state.store.lock().await;
        let target_user = store
            .get_user(&target_user_id)
            .ok()
            .flatten()
            .ok_or_else(|| SyncError::TargetNotFound(target_user_id.clone()))?;
        (target_user.username, target_user.avatar, target_user.user_id)
    };

    state
        .directory
        .resolve_or_create(ConversationRequest {
            requester: identity.user_id.clone(),
            target,
            name,
            avatar,
            is_self_chat,
        })
        .await
}

async fn send_message(
    state: &SharedState,
    handle: &ConnectionHandle,
    identity: &UserIdentity,
    request_id: u64,
    conversation_id: String,
    text: String,
    reply_to: Option<String>,
) -> Result<Option<ServerEvent>, SyncError> {
    if text.is_empty() {
        return Err(SyncError::Invalid("empty message text".to_string()));
    }
    if text.len() > MAX_MESSAGE_LEN {
        return Err(SyncError::Invalid("message text too long".to_string()));
    }

    let conversation_id = if is_temp_id(&conversation_id) {
        match state.arena.lookup(&conversation_id).await {
            Some(durable) => durable,
            None => {
                // Creation still in flight: park the send, ack when replayed.
                // A resolution or failure racing the buffering is reported
                // back instead, and the send follows that outcome directly.
                let outcome = state
                    .arena
                    .buffer_send(
                        &conversation_id,
                        BufferedSend {
                            handle: handle.clone(),
                            request_id,
                            sender_id: identity.user_id.clone(),
                            text: text.clone(),
                            reply_to: reply_to.clone(),
                        },
                    )
                    .await;
                match outcome {
                    BufferOutcome::Buffered => return Ok(None),
                    BufferOutcome::Resolved(durable) => durable,
                    BufferOutcome::Failed(e) => return Err(e),
                }
            }
        }
    } else {
        conversation_id
    };

    deliver_message(state, &identity.user_id, &conversation_id, text, reply_to).await?;
    Ok(Some(ServerEvent::ack_ok(request_id)))
}

/// Append, persist, and fan out one message. Shared by the direct path and
/// the reconciliation replay path.
async fn deliver_message(
    state: &SharedState,
    sender_id: &str,
    conversation_id: &str,
    text: String,
    reply_to: Option<String>,
) -> Result<(), SyncError> {
    let conversation = state
        .directory
        .get(conversation_id)
        .await
        .ok_or_else(|| SyncError::NotFound(conversation_id.to_string()))?;

    // Held across append and broadcast so concurrent senders cannot fan out
    // their messages out of sequence order.
    let delivery = state.delivery_lock(conversation_id).await;
    let _delivery = delivery.lock().await;

    let message = state
        .log
        .append(&conversation, sender_id, text, reply_to)
        .await?;

    {
        let mut store = state.store.lock().await;
        if let Err(e) = store.insert_message(&message_row(&message)) {
            crate::plog!(
                "store: failed to persist {}: {e}",
                logging::msg_id(&message.id)
            );
        }
        if let Err(e) =
            store.update_latest_message(conversation_id, &message.id, message.created_at)
        {
            crate::plog!(
                "store: failed to update latest for {}: {e}",
                logging::conv_id(conversation_id)
            );
        }
    }

    let updated = state
        .directory
        .touch(conversation_id, &message.id, message.created_at, sender_id)
        .await;

    state
        .rooms
        .broadcast(
            conversation_id,
            ServerEvent::NewMessage {
                conversation_id: conversation_id.to_string(),
                message: message.info(),
            },
        )
        .await;

    if let Some(updated) = updated {
        notify_conversation_updated(state, &updated).await;
    }
    Ok(())
}

async fn mark_read(
    state: &SharedState,
    identity: &UserIdentity,
    request_id: u64,
    conversation_id: String,
    message_ids: Vec<String>,
) -> Result<Option<ServerEvent>, SyncError> {
    let conversation_id = resolve_conversation_id(state, conversation_id).await?;
    let conversation = state
        .directory
        .get(&conversation_id)
        .await
        .ok_or_else(|| SyncError::NotFound(conversation_id.clone()))?;
    if !conversation.is_participant(&identity.user_id) {
        return Err(SyncError::Forbidden);
    }

    // Serialized with deliveries: the remaining-unread count derived here is
    // only valid for the cache while no append lands between the derivation
    // and the cache write.
    let delivery = state.delivery_lock(&conversation_id).await;
    let _delivery = delivery.lock().await;

    let outcome = state
        .log
        .mark_read(&conversation_id, &identity.user_id, &message_ids)
        .await;

    if !outcome.newly_read.is_empty() {
        let store = state.store.lock().await;
        for message_id in &outcome.newly_read {
            if let Err(e) = store.mark_read(message_id, &identity.user_id) {
                crate::plog!(
                    "store: failed to persist read mark on {}: {e}",
                    logging::msg_id(message_id)
                );
            }
        }
    }

    // The derived count from the log is the fact; the directory only caches it.
    let updated = state
        .directory
        .set_unread(&conversation_id, &identity.user_id, outcome.remaining_unread)
        .await;

    if !outcome.newly_read.is_empty() {
        state
            .rooms
            .broadcast(
                &conversation_id,
                ServerEvent::MessagesRead {
                    conversation_id: conversation_id.clone(),
                    reader_id: identity.user_id.clone(),
                    message_ids: outcome.newly_read,
                },
            )
            .await;
    }

    if let Some(updated) = updated {
        if let Some(reader_handle) = state.presence.handle_for(&identity.user_id).await {
            let _ = reader_handle
                .send(ServerEvent::ConversationUpdated {
                    conversation: updated.info_for(&identity.user_id),
                })
                .await;
        }
    }

    Ok(Some(ServerEvent::ack_ok(request_id)))
}

async fn get_messages(
    state: &SharedState,
    identity: &UserIdentity,
    request_id: u64,
    conversation_id: String,
) -> Result<Option<ServerEvent>, SyncError> {
    let conversation_id = resolve_conversation_id(state, conversation_id).await?;
    let conversation = state
        .directory
        .get(&conversation_id)
        .await
        .ok_or_else(|| SyncError::NotFound(conversation_id.clone()))?;
    if !conversation.is_participant(&identity.user_id) {
        return Err(SyncError::Forbidden);
    }

    let messages = state.log.list_since(&conversation_id, 0).await;
    Ok(Some(ServerEvent::Ack {
        request_id,
        success: true,
        error: None,
        users: None,
        conversation_id: Some(conversation_id),
        temp_id: None,
        existing: None,
        messages: Some(messages.iter().map(|m| m.info()).collect()),
    }))
}

/// Redirect a provisional id to its durable id. An unresolved temp id is
/// reported as not found; the client retries after the creation ack.
async fn resolve_conversation_id(
    state: &SharedState,
    conversation_id: String,
) -> Result<String, SyncError> {
    if is_temp_id(&conversation_id) {
        state
            .arena
            .lookup(&conversation_id)
            .await
            .ok_or(SyncError::NotFound(conversation_id))
    } else {
        Ok(conversation_id)
    }
}

/// Push each online participant their own view of an updated conversation
/// (unread counts differ per recipient, so this is not a room broadcast).
async fn notify_conversation_updated(state: &SharedState, conversation: &Conversation) {
    for participant in &conversation.participants {
        if let Some(participant_handle) = state.presence.handle_for(participant).await {
            let _ = participant_handle
                .send(ServerEvent::ConversationUpdated {
                    conversation: conversation.info_for(participant),
                })
                .await;
        }
    }
}

fn conversation_row(conversation: &Conversation) -> store::ConversationRow {
    store::ConversationRow {
        conversation_id: conversation.id.clone(),
        name: conversation.name.clone(),
        avatar: conversation.avatar.clone(),
        is_group: conversation.is_group,
        is_self_chat: conversation.is_self_chat,
        created_at: conversation.created_at,
        latest_message_id: conversation.latest_message_id.clone(),
        latest_message_at: conversation.latest_message_at,
    }
}

fn message_row(message: &crate::messages::Message) -> store::MessageRow {
    store::MessageRow {
        message_id: message.id.clone(),
        conversation_id: message.conversation_id.clone(),
        seq: message.seq,
        sender_id: message.sender_id.clone(),
        text: message.text.clone(),
        created_at: message.created_at,
        reply_to: message.reply_to.clone(),
    }
}
