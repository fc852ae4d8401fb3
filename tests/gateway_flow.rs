//! End-to-end protocol flows over the in-memory directory and store:
//! join, fan-out, no-echo, receipts and history assembly.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use securechat_gateway::config::Config;
use securechat_gateway::error::AppError;
use securechat_gateway::services::directory::Directory;
use securechat_gateway::services::encryption::{EncryptionManager, Envelope};
use securechat_gateway::services::memory::{MemoryDirectory, MemoryMessageStore};
use securechat_gateway::services::message_store::MessageStore;
use securechat_gateway::state::AppState;
use securechat_gateway::websocket::events::{ReceiptKind, RoomEvent};
use securechat_gateway::websocket::frames::OutboundFrame;
use securechat_gateway::websocket::handlers::{self, SessionCtx};
use securechat_gateway::websocket::RoomRegistry;

fn test_state() -> (AppState, Arc<MemoryDirectory>, Arc<MemoryMessageStore>) {
    // 1024-bit keys keep test keygen fast
    let crypto = Arc::new(EncryptionManager::new(1024));
    let directory = Arc::new(MemoryDirectory::new(crypto.clone()));
    let store = Arc::new(MemoryMessageStore::new());

    let state = AppState {
        registry: RoomRegistry::new(),
        directory: directory.clone(),
        store: store.clone(),
        crypto,
        config: Arc::new(Config {
            database_url: String::new(),
            port: 0,
            jwt_secret: "test-secret".into(),
            rsa_key_bits: 1024,
        }),
    };
    (state, directory, store)
}

fn alice_bob_room_seven(directory: &MemoryDirectory) {
    directory.add_user(1, "alice");
    directory.add_user(2, "bob");
    directory.add_room(7, false, &[1, 2]);
}

/// Walk the join path the session actor walks: resolve the room, cache
/// keys, register, assemble history, announce presence.
async fn join(
    state: &AppState,
    me: &str,
    peer: &str,
) -> (SessionCtx, UnboundedReceiver<RoomEvent>, OutboundFrame) {
    let me = state
        .directory
        .identity_by_username(me)
        .await
        .unwrap()
        .unwrap();
    let peer = state
        .directory
        .identity_by_username(peer)
        .await
        .unwrap()
        .unwrap();
    let room = handlers::resolve_shared_room(state.directory.as_ref(), &me, &peer)
        .await
        .unwrap();
    let keys = handlers::load_session_keys(state.directory.as_ref(), &me, &peer)
        .await
        .unwrap();
    let (subscriber_id, rx) = state.registry.join(room.id).await.unwrap();
    let mut ctx = SessionCtx {
        me,
        peer,
        room,
        subscriber_id,
        keys,
        history_floor: 0,
    };
    let (history, floor) = handlers::assemble_history(state, &ctx).await.unwrap();
    ctx.history_floor = floor;
    handlers::announce_online(state, &ctx).await;
    (ctx, rx, history)
}

fn drain(rx: &mut UnboundedReceiver<RoomEvent>) {
    while rx.try_recv().is_ok() {}
}

#[tokio::test]
async fn chat_message_is_persisted_encrypted_and_reaches_only_the_peer() {
    let (state, directory, store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, mut alice_rx, _) = join(&state, "alice", "bob").await;
    let (bob, mut bob_rx, _) = join(&state, "bob", "alice").await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    handlers::handle_chat_message(&state, &alice, "hi")
        .await
        .unwrap();

    // persisted with room and sender, ciphertext only
    let stored = store.history(7).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].room_id, 7);
    assert_eq!(stored[0].sender_id, alice.me.id);
    assert_ne!(stored[0].content, "hi");
    Envelope::from_json(&stored[0].content).expect("content is an envelope");

    // bob renders the decrypted frame
    let event = bob_rx.try_recv().expect("bob receives the broadcast");
    match handlers::render_event(&state.crypto, &bob, event) {
        Some(OutboundFrame::ChatMessage { message }) => {
            assert_eq!(message.content, "hi");
            assert_eq!(message.sender, "alice");
            assert_eq!(message.chat_room, 7);
        }
        other => panic!("unexpected render: {other:?}"),
    }

    // alice receives her own broadcast but never renders it (no-echo)
    let echo = alice_rx.try_recv().expect("broadcast includes the sender");
    assert!(handlers::render_event(&state.crypto, &alice, echo).is_none());
}

#[tokio::test]
async fn read_receipt_reaches_the_original_sender() {
    let (state, directory, store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, mut alice_rx, _) = join(&state, "alice", "bob").await;
    let (bob, mut bob_rx, _) = join(&state, "bob", "alice").await;

    handlers::handle_chat_message(&state, &alice, "hi")
        .await
        .unwrap();
    let message_id = store.history(7).await.unwrap()[0].id;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    handlers::handle_mark(&state, &bob, ReceiptKind::Read, message_id)
        .await
        .unwrap();

    // storage flipped before any broadcast
    assert!(store.get(message_id).await.unwrap().unwrap().is_read);

    let event = alice_rx.try_recv().expect("receipt reaches alice");
    match handlers::render_event(&state.crypto, &alice, event) {
        Some(OutboundFrame::ReadReceipt {
            message_id: id,
            sender,
            serialized_message,
        }) => {
            assert_eq!(id, message_id);
            assert_eq!(sender, "bob");
            assert_eq!(serialized_message.content, "hi", "receipt carries the decrypted view");
            assert!(serialized_message.is_read);
        }
        other => panic!("unexpected render: {other:?}"),
    }

    // bob does not render his own receipt
    let echo = bob_rx.try_recv().expect("broadcast includes the actor");
    assert!(handlers::render_event(&state.crypto, &bob, echo).is_none());
}

#[tokio::test]
async fn delivered_and_read_flags_are_independent() {
    let (state, directory, store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, _alice_rx, _) = join(&state, "alice", "bob").await;
    let (bob, _bob_rx, _) = join(&state, "bob", "alice").await;

    handlers::handle_chat_message(&state, &alice, "coalesced")
        .await
        .unwrap();
    let message_id = store.history(7).await.unwrap()[0].id;

    // read without a prior delivered transition
    handlers::handle_mark(&state, &bob, ReceiptKind::Read, message_id)
        .await
        .unwrap();
    let stored = store.get(message_id).await.unwrap().unwrap();
    assert!(stored.is_read);
    assert!(!stored.is_delivered);

    handlers::handle_mark(&state, &bob, ReceiptKind::Delivered, message_id)
        .await
        .unwrap();
    let stored = store.get(message_id).await.unwrap().unwrap();
    assert!(stored.is_read, "read flag is monotonic");
    assert!(stored.is_delivered);
}

#[tokio::test]
async fn message_racing_the_history_fetch_is_delivered_exactly_once() {
    let (state, directory, _store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, mut alice_rx, _) = join(&state, "alice", "bob").await;
    drain(&mut alice_rx);

    // bob registers in the room first, as the session actor does
    let me = state
        .directory
        .identity_by_username("bob")
        .await
        .unwrap()
        .unwrap();
    let peer = state
        .directory
        .identity_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let room = handlers::resolve_shared_room(state.directory.as_ref(), &me, &peer)
        .await
        .unwrap();
    let keys = handlers::load_session_keys(state.directory.as_ref(), &me, &peer)
        .await
        .unwrap();
    let (subscriber_id, mut rx) = state.registry.join(room.id).await.unwrap();

    // alice sends in the window between bob's registration and his
    // history fetch, so the broadcast is buffered on bob's channel
    handlers::handle_chat_message(&state, &alice, "hi")
        .await
        .unwrap();

    let mut bob = SessionCtx {
        me,
        peer,
        room,
        subscriber_id,
        keys,
        history_floor: 0,
    };
    let (history, floor) = handlers::assemble_history(&state, &bob).await.unwrap();
    bob.history_floor = floor;

    match history {
        OutboundFrame::ChatHistory { messages } => {
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].content, "hi");
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // the buffered broadcast covers the same message; it never renders
    let event = rx.try_recv().expect("broadcast buffered during join");
    assert!(handlers::render_event(&state.crypto, &bob, event).is_none());

    // traffic after the join still renders normally
    handlers::handle_chat_message(&state, &alice, "again")
        .await
        .unwrap();
    let event = rx.try_recv().expect("post-join broadcast");
    match handlers::render_event(&state.crypto, &bob, event) {
        Some(OutboundFrame::ChatMessage { message }) => assert_eq!(message.content, "again"),
        other => panic!("unexpected render: {other:?}"),
    }
}

#[tokio::test]
async fn receipt_flip_is_scoped_to_the_session_room() {
    let (state, directory, store) = test_state();
    alice_bob_room_seven(&directory);
    directory.add_user(3, "carol");
    directory.add_room(8, false, &[1, 3]);

    let (_alice, _alice_rx, _) = join(&state, "alice", "bob").await;
    let (bob, _bob_rx, _) = join(&state, "bob", "alice").await;

    // a message that lives in room 8, which bob's session never joined
    let foreign = store.create(1, 8, "{}").await.unwrap();

    let err = handlers::handle_mark(&state, &bob, ReceiptKind::Read, foreign.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MessageNotFound(id) if id == foreign.id));

    let stored = store.get(foreign.id).await.unwrap().unwrap();
    assert!(!stored.is_read, "flag untouched outside the session's room");
}

#[tokio::test]
async fn marking_an_unknown_message_is_an_error_not_a_broadcast() {
    let (state, directory, _store) = test_state();
    alice_bob_room_seven(&directory);

    let (_alice, mut alice_rx, _) = join(&state, "alice", "bob").await;
    let (bob, mut bob_rx, _) = join(&state, "bob", "alice").await;
    drain(&mut alice_rx);
    drain(&mut bob_rx);

    let err = handlers::handle_mark(&state, &bob, ReceiptKind::Read, 999)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MessageNotFound(999)));
    assert!(alice_rx.try_recv().is_err(), "no partial broadcast");
}

#[tokio::test]
async fn room_resolution_is_symmetric_and_prefers_the_lowest_id() {
    let (state, directory, _store) = test_state();
    directory.add_user(1, "alice");
    directory.add_user(2, "bob");
    directory.add_room(9, false, &[1, 2]);
    directory.add_room(7, false, &[1, 2]);
    directory.add_room(11, true, &[1, 2]);

    let alice = state
        .directory
        .identity_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let bob = state
        .directory
        .identity_by_username("bob")
        .await
        .unwrap()
        .unwrap();

    let a_to_b = handlers::resolve_shared_room(state.directory.as_ref(), &alice, &bob)
        .await
        .unwrap();
    let b_to_a = handlers::resolve_shared_room(state.directory.as_ref(), &bob, &alice)
        .await
        .unwrap();
    assert_eq!(a_to_b.id, 7);
    assert_eq!(b_to_a.id, 7);
}

#[tokio::test]
async fn no_shared_room_maps_to_close_code_400() {
    let (state, directory, _store) = test_state();
    directory.add_user(1, "alice");
    directory.add_user(3, "carol");
    directory.add_room(7, false, &[1]);

    let alice = state
        .directory
        .identity_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    let carol = state
        .directory
        .identity_by_username("carol")
        .await
        .unwrap()
        .unwrap();

    let err = handlers::resolve_shared_room(state.directory.as_ref(), &alice, &carol)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NoSharedRoom(ref u) if u == "carol"));
    assert_eq!(err.close_code(), 400);
}

#[tokio::test]
async fn history_is_chronological_decrypted_and_skips_bad_messages() {
    let (state, directory, store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, _alice_rx, _) = join(&state, "alice", "bob").await;
    for text in ["one", "two", "three"] {
        handlers::handle_chat_message(&state, &alice, text)
            .await
            .unwrap();
    }
    // a corrupted row must not poison the batch
    store.create(1, 7, "definitely not an envelope").await.unwrap();

    // a fresh join sees the full decrypted history, including bob reading
    // messages alice sent (encrypted for bob's key)
    let (_bob, _bob_rx, history) = join(&state, "bob", "alice").await;
    match history {
        OutboundFrame::ChatHistory { messages } => {
            let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["one", "two", "three"]);
            assert!(messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
            assert!(messages.iter().all(|m| m.sender == "alice"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    // the sender's own replay decrypts via the recipient's key material
    let (_alice2, _rx2, replay) = join(&state, "alice", "bob").await;
    match replay {
        OutboundFrame::ChatHistory { messages } => {
            assert_eq!(messages.len(), 3);
            assert_eq!(messages[0].content, "one");
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn presence_and_typing_render_for_the_peer_only() {
    let (state, directory, _store) = test_state();
    alice_bob_room_seven(&directory);

    let (alice, mut alice_rx, _) = join(&state, "alice", "bob").await;

    // the explicit self-reply is distinct from the room broadcast
    match handlers::self_presence_reply(&alice) {
        OutboundFrame::OnlineAck { message, sender } => {
            assert_eq!(sender, "alice");
            assert!(message.contains("connected"));
        }
        other => panic!("unexpected frame: {other:?}"),
    }

    let (bob, mut bob_rx, _) = join(&state, "bob", "alice").await;
    assert!(directory.is_online(2));

    // alice sees bob come online
    let event = alice_rx.try_recv().expect("alice hears the join");
    let Some(event) = std::iter::once(event)
        .chain(std::iter::from_fn(|| alice_rx.try_recv().ok()))
        .find(|e| !matches!(e, RoomEvent::Presence { username, .. } if username == "alice"))
    else {
        panic!("no presence event from bob");
    };
    match handlers::render_event(&state.crypto, &alice, event) {
        Some(OutboundFrame::OnlineAck { message, sender }) => {
            assert_eq!(sender, "bob");
            assert_eq!(message, "bob is online");
        }
        other => panic!("unexpected render: {other:?}"),
    }
    drain(&mut bob_rx);

    handlers::handle_typing(&state, &alice).await;
    let event = bob_rx.try_recv().expect("typing reaches bob");
    match handlers::render_event(&state.crypto, &bob, event) {
        Some(OutboundFrame::WritingIndicator { message, sender }) => {
            assert_eq!(sender, "alice");
            assert_eq!(message, "alice is typing...");
        }
        other => panic!("unexpected render: {other:?}"),
    }

    // disconnect announces offline and deregisters
    handlers::announce_offline(&state, &bob).await;
    assert!(!directory.is_online(2));
    assert_eq!(state.registry.member_count(7).await, 1);
}
