//! Integration tests for `ChatClient` over the in-memory transport.
//!
//! The memory server plays the chat server: tests read the frames the
//! client emits and push server events back. A fake store stands in for
//! the REST side.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatsync::prelude::*;
use chatsync::protocol::{ClientEvent, MessagePayload, ServerEvent, Timestamp};
use chatsync::transport::{MemoryConnector, MemoryPeer, MemoryServer, memory_pair};
use chatsync::{IncomingMessage, SessionConfig, SessionSignal};
use tokio::sync::broadcast;

// =========================================================================
// Helpers
// =========================================================================

#[derive(Default)]
struct StoreState {
    history: HashMap<RoomKey, Vec<IncomingMessage>>,
    deleted: Vec<MessageId>,
    fail_fetch: bool,
}

#[derive(Clone, Default)]
struct FakeStore(Arc<Mutex<StoreState>>);

impl FakeStore {
    fn with_history(room: RoomKey, history: Vec<IncomingMessage>) -> Self {
        let store = Self::default();
        store.0.lock().unwrap().history.insert(room, history);
        store
    }

    fn deleted(&self) -> Vec<MessageId> {
        self.0.lock().unwrap().deleted.clone()
    }
}

impl MessageStore for FakeStore {
    async fn fetch_history(&self, room: &RoomKey) -> Result<Vec<IncomingMessage>, StoreError> {
        let state = self.0.lock().unwrap();
        if state.fail_fetch {
            return Err(StoreError::Request("500 internal server error".into()));
        }
        Ok(state.history.get(room).cloned().unwrap_or_default())
    }

    async fn delete_messages(&self, _room: &RoomKey, ids: &[MessageId]) -> Result<(), StoreError> {
        self.0.lock().unwrap().deleted.extend_from_slice(ids);
        Ok(())
    }
}

fn alice() -> PeerId {
    PeerId::from("alice")
}

fn bob() -> PeerId {
    PeerId::from("bob")
}

fn room() -> RoomKey {
    RoomKey::channel("general")
}

fn payload(id: &str, sender: PeerId, text: &str, at: Timestamp) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        room_key: room(),
        sender_id: sender,
        text: text.into(),
        created_at: at,
        reply_to_id: None,
        client_nonce: None,
        delivered_to: Vec::new(),
        read_by: Vec::new(),
    }
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        max_retries: 1,
        retry_backoff: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

fn client_with(store: FakeStore) -> (ChatClient, MemoryServer) {
    let (connector, server): (MemoryConnector, MemoryServer) = memory_pair();
    let client = ChatClient::builder()
        .identity(alice())
        .session_config(fast_session())
        .build(connector, store)
        .expect("identity is set");
    (client, server)
}

/// A client that is connected and has `room()` open.
async fn open_client(store: FakeStore) -> (ChatClient, MemoryPeer, MemoryServer) {
    let (client, mut server) = client_with(store);
    client.connect().await.expect("memory server accepts");
    let mut peer = server.accept().await.expect("connection arrives");
    client.open_room(room()).await.expect("room opens");
    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::JoinRoom { room_key: room() }
    );
    (client, peer, server)
}

async fn next_client_event(peer: &mut MemoryPeer) -> ClientEvent {
    let frame = peer.recv().await.expect("client should send a frame");
    serde_json::from_slice(&frame).expect("client frames are JSON events")
}

fn push(peer: &MemoryPeer, event: ServerEvent) {
    let bytes = serde_json::to_vec(&event).unwrap();
    assert!(peer.send(&bytes), "client connection should be open");
}

async fn expect_event(
    events: &mut broadcast::Receiver<ChatEvent>,
    mut matches: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

// =========================================================================
// Builder
// =========================================================================

#[tokio::test]
async fn test_build_without_identity_fails() {
    let (connector, _server) = memory_pair();
    let result = ChatClient::builder().build(connector, NoopStore);
    assert!(matches!(result, Err(ChatsyncError::MissingIdentity)));
}

#[tokio::test]
async fn test_build_does_not_dial() {
    let (client, server) = client_with(FakeStore::default());
    assert_eq!(client.identity(), &alice());
    assert_eq!(client.connection_state(), ConnectionState::Idle);
    assert_eq!(server.attempts(), 0);
}

// =========================================================================
// Sending
// =========================================================================

#[tokio::test]
async fn test_send_then_nonce_echo_confirms_in_place() {
    let (client, mut peer, _server) = open_client(FakeStore::default()).await;
    let mut events = client.subscribe();

    let local_id = client.send(room(), "  hi  ", None).await.unwrap();

    let added = expect_event(&mut events, |e| matches!(e, ChatEvent::MessageAdded { .. })).await;
    let ChatEvent::MessageAdded { message, .. } = added else {
        unreachable!()
    };
    assert_eq!(message.id, local_id);
    assert_eq!(message.text, "hi");
    assert!(message.is_optimistic);
    assert_eq!(message.delivery_state, DeliveryState::Sending);

    let ClientEvent::SendMessage {
        text, client_nonce, ..
    } = next_client_event(&mut peer).await
    else {
        panic!("expected a send");
    };
    assert_eq!(text, "hi");
    assert_eq!(client_nonce, local_id.as_str());

    let mut echo = payload("srv-1", alice(), "hi", 1_000);
    echo.client_nonce = Some(client_nonce);
    push(&peer, ServerEvent::ReceiveMessage(echo));

    let updated =
        expect_event(&mut events, |e| matches!(e, ChatEvent::MessageUpdated { .. })).await;
    let ChatEvent::MessageUpdated {
        message,
        previous_id,
        ..
    } = updated
    else {
        unreachable!()
    };
    assert_eq!(previous_id, Some(local_id));
    assert_eq!(message.id, MessageId::from("srv-1"));
    assert!(!message.is_optimistic);

    let messages = client.messages(room()).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery_state, DeliveryState::Sent);
}

#[tokio::test]
async fn test_send_blank_text_is_rejected_without_insert() {
    let (client, _server) = client_with(FakeStore::default());
    let err = client.send(room(), "   \n", None).await.unwrap_err();
    assert!(matches!(err, SendError::EmptyMessage));
    assert!(client.messages(room()).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_with_server_down_marks_message_failed() {
    let (client, server) = client_with(FakeStore::default());
    server.refuse_all(true);
    let mut events = client.subscribe();

    let err = client.send(room(), "hello?", None).await.unwrap_err();
    let SendError::ConnectionUnavailable { local_id, .. } = err else {
        panic!("expected ConnectionUnavailable, got {err:?}");
    };

    let added = expect_event(&mut events, |e| matches!(e, ChatEvent::MessageAdded { .. })).await;
    let ChatEvent::MessageAdded { message, .. } = added else {
        unreachable!()
    };
    assert!(!message.failed);

    let updated =
        expect_event(&mut events, |e| matches!(e, ChatEvent::MessageUpdated { .. })).await;
    let ChatEvent::MessageUpdated { message, .. } = updated else {
        unreachable!()
    };
    assert_eq!(message.id, local_id);
    assert!(message.failed);
    assert!(message.is_optimistic);

    let messages = client.messages(room()).await.unwrap();
    assert_eq!(messages.len(), 1, "a failed message stays visible");
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_failure_resends_with_same_nonce() {
    let (client, mut server) = client_with(FakeStore::default());
    server.refuse_all(true);
    let Err(SendError::ConnectionUnavailable { local_id, .. }) =
        client.send(room(), "again", None).await
    else {
        panic!("send should fail while the server refuses");
    };

    server.refuse_all(false);
    let retried = client.retry(room(), local_id.clone()).await.unwrap();
    assert_eq!(retried, local_id);

    let mut peer = server.accept().await.unwrap();
    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::JoinRoom { room_key: room() }
    );
    let ClientEvent::SendMessage { client_nonce, .. } = next_client_event(&mut peer).await else {
        panic!("expected a send");
    };
    assert_eq!(client_nonce, local_id.as_str());

    let messages = client.messages(room()).await.unwrap();
    assert!(!messages[0].failed);
}

#[tokio::test]
async fn test_retry_of_unknown_or_healthy_message_is_refused() {
    let (client, _peer, _server) = open_client(FakeStore::default()).await;

    let err = client
        .retry(room(), MessageId::from("ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::UnknownMessage(_)));

    let local_id = client.send(room(), "fine", None).await.unwrap();
    let err = client.retry(room(), local_id).await.unwrap_err();
    assert!(matches!(err, SendError::NotRetryable(_)));
}

#[tokio::test]
async fn test_server_rejection_is_surfaced_with_local_id() {
    let (client, peer, _server) = open_client(FakeStore::default()).await;
    let mut events = client.subscribe();
    let local_id = client.send(room(), "spam", None).await.unwrap();

    push(
        &peer,
        ServerEvent::SendRejected {
            room_key: room(),
            client_nonce: Some(local_id.as_str().to_owned()),
            reason: "rate limited".into(),
        },
    );

    let rejected =
        expect_event(&mut events, |e| matches!(e, ChatEvent::SendRejected { .. })).await;
    assert_eq!(
        rejected,
        ChatEvent::SendRejected {
            room: room(),
            local_id: Some(local_id),
            reason: "rate limited".into(),
        }
    );
}

// =========================================================================
// Rooms, history, deletion
// =========================================================================

#[tokio::test]
async fn test_open_room_seeds_history_and_acknowledges_delivery() {
    let store = FakeStore::with_history(
        room(),
        vec![
            payload("m2", bob(), "second", 200),
            payload("m1", bob(), "first", 100),
        ],
    );
    let (client, mut server) = client_with(store);
    client.connect().await.unwrap();
    let mut peer = server.accept().await.unwrap();

    let messages = client.open_room(room()).await.unwrap();
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2"]);

    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::JoinRoom { room_key: room() }
    );
    let mut acked = Vec::new();
    for _ in 0..2 {
        match next_client_event(&mut peer).await {
            ClientEvent::MarkDelivered { message_id, .. } => acked.push(message_id),
            other => panic!("expected MarkDelivered, got {other:?}"),
        }
    }
    acked.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(acked, vec![MessageId::from("m1"), MessageId::from("m2")]);

    let preview = client.last_preview(room()).await.unwrap();
    assert!(matches!(preview, LastMessagePreview::Message { ref id, .. } if id.as_str() == "m2"));
}

#[tokio::test]
async fn test_open_room_before_connect_acks_history_after_connect() {
    let store = FakeStore::with_history(room(), vec![payload("m1", bob(), "early", 100)]);
    let (client, mut server) = client_with(store);

    let messages = client.open_room(room()).await.unwrap();
    assert_eq!(messages.len(), 1);

    client.connect().await.unwrap();
    let mut peer = server.accept().await.unwrap();
    push(
        &peer,
        ServerEvent::ReceiveMessage(payload("m2", bob(), "live", 200)),
    );

    let mut acked = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), async {
        while acked.len() < 2 {
            match next_client_event(&mut peer).await {
                ClientEvent::MarkDelivered { message_id, .. } => acked.push(message_id),
                ClientEvent::JoinRoom { .. } => {}
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("both messages should be acknowledged");

    acked.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(acked, vec![MessageId::from("m1"), MessageId::from("m2")]);
}

#[tokio::test]
async fn test_open_room_history_failure_is_reported() {
    let store = FakeStore::default();
    store.0.lock().unwrap().fail_fetch = true;
    let (client, _server) = client_with(store);

    let err = client.open_room(room()).await.unwrap_err();
    assert!(matches!(err, ChatsyncError::Store(StoreError::Request(_))));
}

#[tokio::test]
async fn test_delete_latest_message_updates_preview() {
    let store = FakeStore::with_history(
        room(),
        vec![
            payload("m1", bob(), "first", 100),
            payload("m2", bob(), "second", 200),
        ],
    );
    let (client, _peer, _server) = open_client(store.clone()).await;
    let mut events = client.subscribe();

    let removed = client
        .delete_messages(room(), vec![MessageId::from("m2")])
        .await
        .unwrap();
    assert_eq!(removed, vec![MessageId::from("m2")]);
    assert_eq!(store.deleted(), vec![MessageId::from("m2")]);

    expect_event(&mut events, |e| matches!(e, ChatEvent::MessagesRemoved { .. })).await;
    let changed =
        expect_event(&mut events, |e| matches!(e, ChatEvent::PreviewChanged { .. })).await;
    let ChatEvent::PreviewChanged { preview, .. } = changed else {
        unreachable!()
    };
    assert!(matches!(preview, LastMessagePreview::Message { ref id, .. } if id.as_str() == "m1"));
}

#[tokio::test]
async fn test_clear_history_empties_room_and_preview() {
    let store = FakeStore::with_history(room(), vec![payload("m1", bob(), "only", 100)]);
    let (client, _peer, _server) = open_client(store.clone()).await;

    let removed = client.clear_room_history(room()).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert!(client.messages(room()).await.unwrap().is_empty());
    assert_eq!(
        client.last_preview(room()).await.unwrap(),
        LastMessagePreview::Empty
    );
}

// =========================================================================
// Receipts
// =========================================================================

#[tokio::test]
async fn test_read_receipt_marks_own_message_read() {
    let (client, peer, _server) = open_client(FakeStore::default()).await;
    let mut events = client.subscribe();

    push(&peer, ServerEvent::ReceiveMessage(payload("s1", alice(), "yo", 10)));
    expect_event(&mut events, |e| matches!(e, ChatEvent::MessageAdded { .. })).await;

    push(
        &peer,
        ServerEvent::MessageRead {
            room_key: room(),
            message_id: MessageId::from("s1"),
            peer_id: bob(),
            at: 20,
        },
    );
    let updated =
        expect_event(&mut events, |e| matches!(e, ChatEvent::MessageUpdated { .. })).await;
    let ChatEvent::MessageUpdated { message, .. } = updated else {
        unreachable!()
    };
    assert_eq!(message.delivery_state, DeliveryState::Read);
    assert!(message.is_delivered_to(&bob()));
}

#[tokio::test]
async fn test_mark_visible_emits_read_once_per_viewing_session() {
    let (client, mut peer, _server) = open_client(FakeStore::default()).await;

    push(&peer, ServerEvent::ReceiveMessage(payload("p1", bob(), "hey", 10)));
    assert!(matches!(
        next_client_event(&mut peer).await,
        ClientEvent::MarkDelivered { .. }
    ));

    let ids = vec![MessageId::from("p1")];
    client.mark_visible(room(), ids.clone()).await.unwrap();
    client.mark_visible(room(), ids.clone()).await.unwrap();
    client.input_changed(room(), "x").await.unwrap();

    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::MarkRead {
            room_key: room(),
            message_id: MessageId::from("p1"),
        }
    );
    assert!(
        matches!(next_client_event(&mut peer).await, ClientEvent::Typing { is_typing: true, .. }),
        "the second mark_visible must not emit another read"
    );
}

// =========================================================================
// Typing and presence
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_typing_stops_after_idle_period() {
    let (client, mut peer, _server) = open_client(FakeStore::default()).await;

    let started = tokio::time::Instant::now();
    client.input_changed(room(), "h").await.unwrap();
    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::Typing {
            room_key: room(),
            is_typing: true
        }
    );

    assert_eq!(
        next_client_event(&mut peer).await,
        ClientEvent::Typing {
            room_key: room(),
            is_typing: false
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_sending_ends_typing_burst() {
    let (client, mut peer, _server) = open_client(FakeStore::default()).await;

    client.input_changed(room(), "hel").await.unwrap();
    client.send(room(), "hello", None).await.unwrap();

    let frames = [
        next_client_event(&mut peer).await,
        next_client_event(&mut peer).await,
        next_client_event(&mut peer).await,
    ];
    assert!(matches!(frames[0], ClientEvent::Typing { is_typing: true, .. }));
    assert!(
        matches!(frames[1], ClientEvent::Typing { is_typing: false, .. }),
        "typing stop must precede the message, got {:?}",
        frames[1]
    );
    assert!(matches!(frames[2], ClientEvent::SendMessage { .. }));
}

#[tokio::test]
async fn test_sends_reach_server_in_call_order_with_typing() {
    let (client, mut peer, _server) = open_client(FakeStore::default()).await;

    for text in ["one", "two", "three"] {
        client.input_changed(room(), text).await.unwrap();
        client.send(room(), text, None).await.unwrap();
    }

    let mut order = Vec::new();
    while order.len() < 9 {
        match next_client_event(&mut peer).await {
            ClientEvent::Typing { is_typing, .. } => order.push(format!("typing:{is_typing}")),
            ClientEvent::SendMessage { text, .. } => order.push(format!("send:{text}")),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(
        order,
        vec![
            "typing:true",
            "typing:false",
            "send:one",
            "typing:true",
            "typing:false",
            "send:two",
            "typing:true",
            "typing:false",
            "send:three",
        ]
    );
}

#[tokio::test]
async fn test_remote_presence_and_typing_are_published() {
    let (client, peer, _server) = open_client(FakeStore::default()).await;
    let mut events = client.subscribe();

    push(&peer, ServerEvent::UserOnline { peer_id: bob() });
    let online =
        expect_event(&mut events, |e| matches!(e, ChatEvent::PresenceChanged { .. })).await;
    assert_eq!(
        online,
        ChatEvent::PresenceChanged {
            peer: bob(),
            online: true
        }
    );
    assert!(client.is_online(bob()).await.unwrap());

    push(
        &peer,
        ServerEvent::UserTyping {
            room_key: room(),
            peer_id: bob(),
            is_typing: true,
        },
    );
    expect_event(&mut events, |e| matches!(e, ChatEvent::TypingChanged { .. })).await;
    let summary = client.typing_summary(room()).await.unwrap();
    assert_eq!(summary.shown, vec![bob()]);

    push(&peer, ServerEvent::UserOffline { peer_id: bob() });
    let typing =
        expect_event(&mut events, |e| matches!(e, ChatEvent::TypingChanged { .. })).await;
    let ChatEvent::TypingChanged { summary, .. } = typing else {
        unreachable!()
    };
    assert!(summary.is_empty(), "going offline clears typing");
    assert!(!client.is_online(bob()).await.unwrap());
}

#[tokio::test]
async fn test_own_typing_echo_is_ignored() {
    let (client, peer, _server) = open_client(FakeStore::default()).await;

    push(
        &peer,
        ServerEvent::UserTyping {
            room_key: room(),
            peer_id: alice(),
            is_typing: true,
        },
    );
    // Round-trip a later event so the typing echo has been handled.
    push(&peer, ServerEvent::UserOnline { peer_id: bob() });
    while !client.is_online(bob()).await.unwrap() {
        tokio::task::yield_now().await;
    }
    assert!(client.typing_summary(room()).await.unwrap().is_empty());
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let (client, _server) = client_with(FakeStore::default());
    client.shutdown().await.unwrap();

    let err = client.send(room(), "late", None).await.unwrap_err();
    assert!(matches!(err, SendError::EngineStopped));
}

#[tokio::test]
async fn test_connection_signals_are_forwarded() {
    let (client, _server) = client_with(FakeStore::default());
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    let connected =
        expect_event(&mut events, |e| matches!(e, ChatEvent::Connection(_))).await;
    assert_eq!(connected, ChatEvent::Connection(SessionSignal::Connected));
    assert_eq!(client.connection_state(), ConnectionState::Open);
}
