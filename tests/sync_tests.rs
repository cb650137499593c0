//! End-to-end tests: a real server, real websocket clients.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use parley::auth::TokenVerifier;
use parley::protocol::{ClientEvent, ServerEvent};
use parley::reconcile::mint_temp_id;
use parley::state;
use parley::store::{Store, UserRow};

const SECRET: &str = "test-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(users: &[&str]) -> (String, oneshot::Sender<()>) {
    let store = Store::open_in_memory().expect("open store");
    for user_id in users {
        store
            .insert_user(&UserRow {
                user_id: user_id.to_string(),
                username: format!("{}!", user_id.to_uppercase()),
                avatar: format!("/{user_id}.png"),
                created_at: 0,
            })
            .expect("seed user");
    }

    let state = state::init(store, SECRET).await.expect("init state");
    let app = parley::router::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_tx)
}

fn token_for(user_id: &str) -> String {
    TokenVerifier::new(SECRET).issue(user_id, 3600)
}

async fn connect(addr: &str, user_id: &str) -> Client {
    let url = format!("ws://{addr}/ws?token={}", token_for(user_id));
    let (socket, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("connect websocket");
    socket
}

async fn send(client: &mut Client, event: &ClientEvent) {
    let text = serde_json::to_string(event).expect("serialize event");
    client
        .send(WsMessage::Text(text))
        .await
        .expect("send event");
}

/// Read server events until one matches, failing after a bounded wait.
/// Non-matching events (roster churn, unrelated broadcasts) are skipped.
async fn recv_until<F>(client: &mut Client, what: &str, mut matches: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    loop {
        let frame = timeout(deadline, client.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .unwrap_or_else(|| panic!("connection closed waiting for {what}"))
            .expect("websocket frame");
        if let WsMessage::Text(text) = frame {
            let event: ServerEvent = serde_json::from_str(&text).expect("server event");
            if matches(&event) {
                return event;
            }
        }
    }
}

async fn recv_ack(client: &mut Client, id: u64) -> ServerEvent {
    recv_until(client, "ack", |e| {
        matches!(e, ServerEvent::Ack { request_id, .. } if *request_id == id)
    })
    .await
}

/// Start a 1:1 conversation and return its durable id.
async fn open_conversation(client: &mut Client, target: &str, request_id: u64) -> String {
    send(
        client,
        &ClientEvent::StartConversation {
            request_id,
            target_user_id: target.to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: None,
            is_self_chat: false,
        },
    )
    .await;
    match recv_ack(client, request_id).await {
        ServerEvent::Ack {
            success: true,
            conversation_id: Some(id),
            ..
        } => id,
        other => panic!("unexpected start ack: {other:?}"),
    }
}

fn get_json(url: &str) -> serde_json::Value {
    let body = ureq::get(url)
        .call()
        .expect("http request")
        .into_string()
        .expect("body");
    serde_json::from_str(&body).expect("json body")
}

#[tokio::test]
async fn rejects_bad_credentials_before_upgrade() {
    let (addr, shutdown_tx) = start_server(&["alice"]).await;

    // No token at all.
    let url = format!("ws://{addr}/ws");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    // Signed with the wrong secret.
    let bad = TokenVerifier::new("wrong-secret").issue("alice", 3600);
    let url = format!("ws://{addr}/ws?token={bad}");
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    // Valid token for a user the store does not know.
    let url = format!("ws://{addr}/ws?token={}", token_for("ghost"));
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn presence_roster_tracks_connects_and_disconnects() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "initial roster", |e| {
        matches!(e, ServerEvent::OnlineUsers { users }
            if users.iter().any(|u| u.user_id == "alice"))
    })
    .await;

    let mut bob = connect(&addr, "bob").await;
    recv_until(&mut alice, "roster with bob", |e| {
        matches!(e, ServerEvent::OnlineUsers { users }
            if users.iter().any(|u| u.user_id == "bob"))
    })
    .await;

    // Bob's own roster includes both, sorted by user id.
    let roster = recv_until(&mut bob, "bob roster", |e| {
        matches!(e, ServerEvent::OnlineUsers { users } if users.len() == 2)
    })
    .await;
    if let ServerEvent::OnlineUsers { users } = roster {
        let ids: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(ids, vec!["alice", "bob"]);
        assert_eq!(users[1].username, "BOB!");
    }

    drop(bob);
    recv_until(&mut alice, "roster without bob", |e| {
        matches!(e, ServerEvent::OnlineUsers { users }
            if !users.iter().any(|u| u.user_id == "bob"))
    })
    .await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn second_start_for_same_pair_resolves_existing() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;
    let mut bob = connect(&addr, "bob").await;

    let conversation_id = open_conversation(&mut alice, "bob", 1).await;

    // Bob is told about the conversation even though Alice started it.
    recv_until(&mut bob, "new_conversation", |e| {
        matches!(e, ServerEvent::NewConversation { conversation }
            if conversation.id == conversation_id)
    })
    .await;

    // Bob starting "the same" chat lands on the same durable id.
    send(
        &mut bob,
        &ClientEvent::StartConversation {
            request_id: 2,
            target_user_id: "alice".to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: None,
            is_self_chat: false,
        },
    )
    .await;
    match recv_ack(&mut bob, 2).await {
        ServerEvent::Ack {
            success: true,
            conversation_id: Some(id),
            existing: Some(true),
            ..
        } => assert_eq!(id, conversation_id),
        other => panic!("unexpected ack: {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn starting_conversation_with_unknown_user_fails_the_request_only() {
    let (addr, shutdown_tx) = start_server(&["alice"]).await;
    let mut alice = connect(&addr, "alice").await;

    send(
        &mut alice,
        &ClientEvent::StartConversation {
            request_id: 1,
            target_user_id: "nobody".to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: None,
            is_self_chat: false,
        },
    )
    .await;
    match recv_ack(&mut alice, 1).await {
        ServerEvent::Ack {
            success: false,
            error: Some(error),
            ..
        } => assert!(error.contains("nobody"), "error was {error:?}"),
        other => panic!("unexpected ack: {other:?}"),
    }

    // The session survives the failure.
    send(&mut alice, &ClientEvent::GetOnlineUsers { request_id: 2 }).await;
    recv_ack(&mut alice, 2).await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn messages_flow_to_both_sides_with_read_receipts() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;
    let mut bob = connect(&addr, "bob").await;

    let conversation_id = open_conversation(&mut alice, "bob", 1).await;

    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 2,
            conversation_id: conversation_id.clone(),
            text: "hello bob".to_string(),
            reply_to: None,
        },
    )
    .await;

    // The sender receives its own broadcast (no echo suppression), ahead of
    // the ack.
    let event = recv_until(&mut alice, "own broadcast", |e| {
        matches!(e, ServerEvent::NewMessage { .. })
    })
    .await;
    let message_id = match event {
        ServerEvent::NewMessage {
            conversation_id: cid,
            message,
        } => {
            assert_eq!(cid, conversation_id);
            assert_eq!(message.text, "hello bob");
            assert_eq!(message.sender_id, "alice");
            assert_eq!(message.seq, 1);
            assert_eq!(message.read_by, vec!["alice"]);
            message.id
        }
        other => panic!("unexpected event: {other:?}"),
    };
    recv_ack(&mut alice, 2).await;

    recv_until(&mut bob, "new_message", |e| {
        matches!(e, ServerEvent::NewMessage { message, .. } if message.id == message_id)
    })
    .await;

    // Bob sees his unread counter rise, then clears it.
    recv_until(&mut bob, "conversation_updated", |e| {
        matches!(e, ServerEvent::ConversationUpdated { conversation }
            if conversation.id == conversation_id && conversation.unread_count == 1)
    })
    .await;

    send(
        &mut bob,
        &ClientEvent::MarkRead {
            request_id: 3,
            conversation_id: conversation_id.clone(),
            message_ids: vec![message_id.clone()],
        },
    )
    .await;
    recv_ack(&mut bob, 3).await;

    // Alice learns her message was read.
    recv_until(&mut alice, "messages_read", |e| {
        matches!(e, ServerEvent::MessagesRead { reader_id, message_ids, .. }
            if reader_id == "bob" && message_ids.contains(&message_id))
    })
    .await;

    // A second mark_read is a no-op and produces no further broadcast;
    // history shows both readers.
    send(
        &mut bob,
        &ClientEvent::MarkRead {
            request_id: 4,
            conversation_id: conversation_id.clone(),
            message_ids: vec![message_id.clone()],
        },
    )
    .await;
    recv_ack(&mut bob, 4).await;

    send(
        &mut bob,
        &ClientEvent::GetMessages {
            request_id: 5,
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    match recv_ack(&mut bob, 5).await {
        ServerEvent::Ack {
            success: true,
            messages: Some(messages),
            ..
        } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].read_by, vec!["alice", "bob"]);
        }
        other => panic!("unexpected ack: {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn offline_recipient_catches_up_after_connecting() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;

    // Bob is offline for the creation and the first message.
    let conversation_id = open_conversation(&mut alice, "bob", 1).await;
    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 2,
            conversation_id: conversation_id.clone(),
            text: "while you were out".to_string(),
            reply_to: None,
        },
    )
    .await;
    recv_ack(&mut alice, 2).await;

    let mut bob = connect(&addr, "bob").await;
    send(
        &mut bob,
        &ClientEvent::GetMessages {
            request_id: 3,
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    let message_id = match recv_ack(&mut bob, 3).await {
        ServerEvent::Ack {
            success: true,
            messages: Some(messages),
            ..
        } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].text, "while you were out");
            assert_eq!(messages[0].read_by, vec!["alice"]);
            messages[0].id.clone()
        }
        other => panic!("unexpected ack: {other:?}"),
    };

    send(
        &mut bob,
        &ClientEvent::MarkRead {
            request_id: 4,
            conversation_id: conversation_id.clone(),
            message_ids: vec![message_id],
        },
    )
    .await;
    recv_ack(&mut bob, 4).await;

    let base = format!("http://{addr}");
    let conversations = tokio::task::spawn_blocking(move || {
        get_json(&format!("{base}/api/users/bob/conversations"))
    })
    .await
    .expect("rest task");
    assert_eq!(conversations[0]["unread_count"], 0);

    // Connecting rejoined the room: bob receives new broadcasts directly.
    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 5,
            conversation_id: conversation_id.clone(),
            text: "welcome back".to_string(),
            reply_to: None,
        },
    )
    .await;
    recv_until(&mut bob, "live broadcast", |e| {
        matches!(e, ServerEvent::NewMessage { message, .. } if message.text == "welcome back")
    })
    .await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn sends_against_a_temp_id_are_replayed_after_resolution() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;
    let mut bob = connect(&addr, "bob").await;

    // Fire the creation and two optimistic sends without waiting for acks.
    let temp_id = mint_temp_id();
    send(
        &mut alice,
        &ClientEvent::StartConversation {
            request_id: 1,
            target_user_id: "bob".to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: Some(temp_id.clone()),
            is_self_chat: false,
        },
    )
    .await;
    for (request_id, text) in [(2, "first"), (3, "second")] {
        send(
            &mut alice,
            &ClientEvent::SendMessage {
                request_id,
                conversation_id: temp_id.clone(),
                text: text.to_string(),
                reply_to: None,
            },
        )
        .await;
    }

    let conversation_id = match recv_ack(&mut alice, 1).await {
        ServerEvent::Ack {
            success: true,
            conversation_id: Some(id),
            temp_id: Some(echoed),
            existing: Some(false),
            ..
        } => {
            assert_eq!(echoed, temp_id);
            id
        }
        other => panic!("unexpected start ack: {other:?}"),
    };
    recv_ack(&mut alice, 2).await;
    recv_ack(&mut alice, 3).await;

    // Bob receives both messages under the durable id, in send order.
    for expected in ["first", "second"] {
        recv_until(&mut bob, expected, |e| {
            matches!(e, ServerEvent::NewMessage { conversation_id: cid, message }
                if *cid == conversation_id && message.text == expected)
        })
        .await;
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn failed_creation_fails_its_buffered_sends() {
    let (addr, shutdown_tx) = start_server(&["alice"]).await;
    let mut alice = connect(&addr, "alice").await;

    // The optimistic send goes out first, then the creation it depends on,
    // which fails because the target does not exist.
    let temp_id = mint_temp_id();
    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 1,
            conversation_id: temp_id.clone(),
            text: "never lands".to_string(),
            reply_to: None,
        },
    )
    .await;
    send(
        &mut alice,
        &ClientEvent::StartConversation {
            request_id: 2,
            target_user_id: "nobody".to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: Some(temp_id.clone()),
            is_self_chat: false,
        },
    )
    .await;

    // The buffered send is failed when the creation fails, ahead of the
    // creation's own failed ack; neither hangs.
    match recv_ack(&mut alice, 1).await {
        ServerEvent::Ack {
            success: false,
            error: Some(error),
            ..
        } => assert!(error.contains("nobody"), "error was {error:?}"),
        other => panic!("unexpected ack: {other:?}"),
    }
    match recv_ack(&mut alice, 2).await {
        ServerEvent::Ack { success: false, .. } => {}
        other => panic!("unexpected ack: {other:?}"),
    }

    // A later send still tagged with the dead temp id fails immediately
    // instead of parking forever.
    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 3,
            conversation_id: temp_id,
            text: "still nothing".to_string(),
            reply_to: None,
        },
    )
    .await;
    match recv_ack(&mut alice, 3).await {
        ServerEvent::Ack { success: false, .. } => {}
        other => panic!("unexpected ack: {other:?}"),
    }

    // The session survives all of it.
    send(&mut alice, &ClientEvent::GetOnlineUsers { request_id: 4 }).await;
    recv_ack(&mut alice, 4).await;

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn unread_cache_stays_consistent_under_concurrent_reads_and_sends() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;
    let mut bob = connect(&addr, "bob").await;

    let conversation_id = open_conversation(&mut alice, "bob", 1).await;

    // Alice streams messages while bob marks each one read the moment its
    // broadcast arrives, so reads interleave with deliveries.
    const ROUNDS: u64 = 10;
    let alice_task = async {
        for i in 0..ROUNDS {
            send(
                &mut alice,
                &ClientEvent::SendMessage {
                    request_id: 10 + i,
                    conversation_id: conversation_id.clone(),
                    text: format!("ping {i}"),
                    reply_to: None,
                },
            )
            .await;
            recv_ack(&mut alice, 10 + i).await;
        }
    };
    let bob_task = async {
        let mut seen = 0u64;
        let mut acked = 0u64;
        while seen < ROUNDS || acked < ROUNDS {
            let event = recv_until(&mut bob, "message or read ack", |e| {
                matches!(e, ServerEvent::NewMessage { .. })
                    || matches!(e, ServerEvent::Ack { request_id, .. } if *request_id >= 100)
            })
            .await;
            match event {
                ServerEvent::NewMessage {
                    conversation_id: cid,
                    message,
                } => {
                    seen += 1;
                    send(
                        &mut bob,
                        &ClientEvent::MarkRead {
                            request_id: 100 + seen,
                            conversation_id: cid,
                            message_ids: vec![message.id],
                        },
                    )
                    .await;
                }
                ServerEvent::Ack { success, .. } => {
                    assert!(success);
                    acked += 1;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    };
    tokio::join!(alice_task, bob_task);

    // The cached count served over REST must match the count derived from
    // per-message read state; bob read everything, so both are zero.
    send(
        &mut bob,
        &ClientEvent::GetMessages {
            request_id: 200,
            conversation_id: conversation_id.clone(),
        },
    )
    .await;
    let derived_unread = match recv_ack(&mut bob, 200).await {
        ServerEvent::Ack {
            success: true,
            messages: Some(messages),
            ..
        } => {
            assert_eq!(messages.len(), ROUNDS as usize);
            messages
                .iter()
                .filter(|m| !m.read_by.iter().any(|r| r == "bob"))
                .count()
        }
        other => panic!("unexpected ack: {other:?}"),
    };
    assert_eq!(derived_unread, 0);

    let base = format!("http://{addr}");
    let conversations = tokio::task::spawn_blocking(move || {
        get_json(&format!("{base}/api/users/bob/conversations"))
    })
    .await
    .expect("rest task");
    assert_eq!(
        conversations[0]["unread_count"],
        derived_unread as u64,
        "cached unread count drifted from the per-message read state"
    );

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn self_chat_is_separate_and_single_participant() {
    let (addr, shutdown_tx) = start_server(&["alice"]).await;
    let mut alice = connect(&addr, "alice").await;

    send(
        &mut alice,
        &ClientEvent::StartConversation {
            request_id: 1,
            target_user_id: "alice".to_string(),
            target_username: None,
            target_avatar: None,
            temp_id: None,
            is_self_chat: true,
        },
    )
    .await;
    // The announcement precedes the ack.
    let announced = recv_until(&mut alice, "self chat announcement", |e| {
        matches!(e, ServerEvent::NewConversation { conversation } if conversation.is_self_chat)
    })
    .await;
    let self_chat_id = match announced {
        ServerEvent::NewConversation { conversation } => {
            assert_eq!(conversation.participants, vec!["alice"]);
            assert_eq!(conversation.name, "Yourself");
            conversation.id
        }
        other => panic!("unexpected event: {other:?}"),
    };

    match recv_ack(&mut alice, 1).await {
        ServerEvent::Ack {
            success: true,
            conversation_id: Some(id),
            ..
        } => assert_eq!(id, self_chat_id),
        other => panic!("unexpected ack: {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn newer_connection_replaces_the_stale_session() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut first = connect(&addr, "alice").await;
    let mut second = connect(&addr, "alice").await;

    recv_until(&mut first, "session_replaced", |e| {
        matches!(e, ServerEvent::SessionReplaced)
    })
    .await;
    // The stale socket is closed after the notice.
    let end = timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                None | Some(Ok(WsMessage::Close(_))) => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok(), "stale session was not closed");

    // The surviving session still works.
    send(&mut second, &ClientEvent::GetOnlineUsers { request_id: 1 }).await;
    match recv_ack(&mut second, 1).await {
        ServerEvent::Ack {
            success: true,
            users: Some(users),
            ..
        } => assert_eq!(users.len(), 1),
        other => panic!("unexpected ack: {other:?}"),
    }

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn rest_surface_serves_health_conversations_and_history() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob"]).await;
    let mut alice = connect(&addr, "alice").await;
    let conversation_id = open_conversation(&mut alice, "bob", 1).await;

    for (request_id, text) in [(2, "one"), (3, "two"), (4, "three")] {
        send(
            &mut alice,
            &ClientEvent::SendMessage {
                request_id,
                conversation_id: conversation_id.clone(),
                text: text.to_string(),
                reply_to: None,
            },
        )
        .await;
        recv_ack(&mut alice, request_id).await;
    }

    let base = format!("http://{addr}");
    let cid = conversation_id.clone();
    let (health, conversations, newest, earlier) = tokio::task::spawn_blocking(move || {
        let health = get_json(&format!("{base}/api/health"));
        let conversations = get_json(&format!("{base}/api/users/bob/conversations"));
        let newest = get_json(&format!("{base}/api/conversations/{cid}/messages?limit=2"));
        let earlier = get_json(&format!(
            "{base}/api/conversations/{cid}/messages?limit=2&before=2"
        ));
        (health, conversations, newest, earlier)
    })
    .await
    .expect("rest task");

    assert_eq!(health["status"], "ok");

    let list = conversations.as_array().expect("conversation list");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], conversation_id.as_str());
    assert_eq!(list[0]["unread_count"], 3);

    let newest = newest.as_array().expect("message page");
    assert_eq!(
        newest.iter().map(|m| m["text"].as_str().unwrap()).collect::<Vec<_>>(),
        vec!["two", "three"]
    );
    let earlier = earlier.as_array().expect("earlier page");
    assert_eq!(
        earlier.iter().map(|m| m["text"].as_str().unwrap()).collect::<Vec<_>>(),
        vec!["one"]
    );

    // Unknown conversation is a 404, not an empty page.
    let base = format!("http://{addr}");
    let status = tokio::task::spawn_blocking(move || {
        match ureq::get(&format!("{base}/api/conversations/missing/messages")).call() {
            Ok(r) => r.status(),
            Err(ureq::Error::Status(code, _)) => code,
            Err(e) => panic!("transport error: {e}"),
        }
    })
    .await
    .expect("rest task");
    assert_eq!(status, 404);

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn malformed_and_forbidden_events_fail_without_closing() {
    let (addr, shutdown_tx) = start_server(&["alice", "bob", "carol"]).await;
    let mut alice = connect(&addr, "alice").await;
    let mut carol = connect(&addr, "carol").await;

    let conversation_id = open_conversation(&mut alice, "bob", 1).await;

    // Unknown event type is dropped without an ack or a close.
    alice
        .send(WsMessage::Text(
            r#"{"type":"drop_tables","request_id":99}"#.to_string(),
        ))
        .await
        .expect("send garbage");

    // A non-participant cannot post into the conversation.
    send(
        &mut carol,
        &ClientEvent::SendMessage {
            request_id: 2,
            conversation_id: conversation_id.clone(),
            text: "let me in".to_string(),
            reply_to: None,
        },
    )
    .await;
    match recv_ack(&mut carol, 2).await {
        ServerEvent::Ack { success: false, .. } => {}
        other => panic!("unexpected ack: {other:?}"),
    }

    // Empty text is rejected up front.
    send(
        &mut alice,
        &ClientEvent::SendMessage {
            request_id: 3,
            conversation_id,
            text: String::new(),
            reply_to: None,
        },
    )
    .await;
    match recv_ack(&mut alice, 3).await {
        ServerEvent::Ack { success: false, .. } => {}
        other => panic!("unexpected ack: {other:?}"),
    }

    // Both sessions still answer.
    send(&mut alice, &ClientEvent::GetOnlineUsers { request_id: 4 }).await;
    recv_ack(&mut alice, 4).await;

    shutdown_tx.send(()).ok();
}
