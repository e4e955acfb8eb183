//! Integration tests for frame dispatch through the hub.
//!
//! Connections are channel-backed, so every test sees exactly the frames a
//! WebSocket client would receive, without a socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use logos_sync::{
    codes, ChannelHandle, CollabHub, Connection, Cursor, MemoryStore, Persistence,
    PersistenceWriter, ServerConfig, ServerMessage, SweepReport,
};
use tokio::sync::mpsc::UnboundedReceiver;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Client {
    conn: Connection,
    rx: UnboundedReceiver<Arc<str>>,
}

impl Client {
    fn new() -> Self {
        let (handle, rx) = ChannelHandle::new();
        Self {
            conn: Connection::new(Arc::new(handle)),
            rx,
        }
    }

    /// Decode every frame queued so far.
    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            out.push(ServerMessage::decode(&frame).unwrap());
        }
        out
    }

    fn expect_one(&mut self) -> ServerMessage {
        let mut frames = self.drain();
        assert_eq!(frames.len(), 1, "expected one frame, got {frames:?}");
        frames.remove(0)
    }
}

fn test_hub() -> CollabHub {
    CollabHub::new(&ServerConfig::for_testing("127.0.0.1:0"), None)
}

fn send(hub: &mut CollabHub, client: &Client, raw: &str) {
    hub.handle_frame(&client.conn, raw)
        .deliver(client.conn.handle.as_ref());
}

fn join_frame(room: &str, user: &str, client: &str) -> String {
    format!(r#"{{"type":"JOIN_ROOM","roomId":"{room}","userId":"{user}","clientId":"{client}"}}"#)
}

fn op_frame(room: &str, client: &str, id: &str, version: u64, kind: &str, pos: usize, text: &str) -> String {
    format!(
        r#"{{"type":"OT_OP","roomId":"{room}","clientId":"{client}","operation":{{"id":"{id}","version":{version},"type":"{kind}","position":{pos},"content":"{text}"}}}}"#
    )
}

fn insert_frame(room: &str, client: &str, id: &str, version: u64, pos: usize, text: &str) -> String {
    op_frame(room, client, id, version, "insert", pos, text)
}

fn error_code(message: &ServerMessage) -> &str {
    match message {
        ServerMessage::Error { code, .. } => code,
        other => panic!("expected ERROR, got {other:?}"),
    }
}

/// Join alice (client "A") and bob (client "B") to `room`, draining the join frames.
fn two_clients(hub: &mut CollabHub, room: &str) -> (Client, Client) {
    let mut alice = Client::new();
    let mut bob = Client::new();
    send(hub, &alice, &join_frame(room, "alice", "A"));
    send(hub, &bob, &join_frame(room, "bob", "B"));
    alice.drain();
    bob.drain();
    (alice, bob)
}

// ─── Join / leave ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_replies_and_notifies_others() {
    let mut hub = test_hub();
    let mut alice = Client::new();
    let mut bob = Client::new();

    send(&mut hub, &alice, &join_frame("r1", "alice", "A"));
    match alice.expect_one() {
        ServerMessage::RoomJoined { version, content, participants, .. } => {
            assert_eq!(version, 0);
            assert_eq!(content, "");
            assert_eq!(participants.len(), 1);
        }
        other => panic!("expected ROOM_JOINED, got {other:?}"),
    }

    send(&mut hub, &bob, &join_frame("r1", "bob", "B"));
    match bob.expect_one() {
        ServerMessage::RoomJoined { participants, .. } => assert_eq!(participants.len(), 2),
        other => panic!("expected ROOM_JOINED, got {other:?}"),
    }
    match alice.expect_one() {
        ServerMessage::UserJoined { participant, participant_count, .. } => {
            assert_eq!(participant.user_id, "bob");
            assert_eq!(participant.client_id, "B");
            assert_eq!(participant_count, 2);
        }
        other => panic!("expected USER_JOINED, got {other:?}"),
    }
}

#[tokio::test]
async fn test_room_full_rejects_fifth_client() {
    let mut hub = test_hub();
    let mut clients: Vec<Client> = (0..5).map(|_| Client::new()).collect();

    for (i, client) in clients.iter().enumerate() {
        send(&mut hub, client, &join_frame("r1", &format!("user{i}"), &format!("c{i}")));
    }

    let last = clients.last_mut().unwrap();
    match last.expect_one() {
        ServerMessage::Error { code, room_id, .. } => {
            assert_eq!(code, codes::ROOM_FULL);
            assert_eq!(room_id.as_deref(), Some("r1"));
        }
        other => panic!("expected ROOM_FULL, got {other:?}"),
    }
    assert_eq!(hub.manager().get_room("r1").unwrap().participant_count(), 4);
}

#[tokio::test]
async fn test_leave_notifies_remaining() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &bob, r#"{"type":"LEAVE_ROOM","roomId":"r1","clientId":"B"}"#);
    assert!(bob.drain().is_empty());
    match alice.expect_one() {
        ServerMessage::UserLeft { user_id, client_id, participant_count, .. } => {
            assert_eq!(user_id, "bob");
            assert_eq!(client_id, "B");
            assert_eq!(participant_count, 1);
        }
        other => panic!("expected USER_LEFT, got {other:?}"),
    }

    // Bob's binding is gone with him
    send(&mut hub, &bob, &insert_frame("r1", "B", "late", 0, 0, "x"));
    assert_eq!(error_code(&bob.expect_one()), codes::NOT_IN_ROOM);
}

#[tokio::test]
async fn test_disconnect_leaves_every_room() {
    let mut hub = test_hub();
    let (mut alice, bob) = two_clients(&mut hub, "r1");
    send(&mut hub, &bob, &join_frame("r2", "bob", "B"));

    let out = hub.disconnect(bob.conn.id);
    out.deliver(bob.conn.handle.as_ref());

    match alice.expect_one() {
        ServerMessage::UserLeft { client_id, participant_count, .. } => {
            assert_eq!(client_id, "B");
            assert_eq!(participant_count, 1);
        }
        other => panic!("expected USER_LEFT, got {other:?}"),
    }
    // r2 emptied and was removed
    assert!(hub.manager().get_room("r2").is_none());
    assert_eq!(hub.stats().idle_documents, 1);
}

// ─── Operations ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_op_is_acked_and_broadcast_without_echo() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, &insert_frame("r1", "A", "op1", 0, 0, "Hello"));

    match alice.expect_one() {
        ServerMessage::Ack { operation_id, version, .. } => {
            assert_eq!(operation_id, "op1");
            assert_eq!(version, 1);
        }
        other => panic!("expected ACK, got {other:?}"),
    }
    match bob.expect_one() {
        ServerMessage::OtOp { client_id, operation, version, .. } => {
            assert_eq!(client_id, "A");
            assert_eq!(version, 1);
            assert_eq!(operation.content, "Hello");
            assert_eq!(operation.user_id, "alice");
        }
        other => panic!("expected OT_OP, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, &insert_frame("r1", "A", "a1", 0, 0, "Hello"));
    send(&mut hub, &bob, &insert_frame("r1", "B", "b1", 0, 0, "Hi "));

    let alice_frames = alice.drain();
    assert_eq!(alice_frames.len(), 2);
    match &alice_frames[1] {
        ServerMessage::OtOp { operation, version, .. } => {
            assert_eq!(*version, 2);
            assert_eq!(operation.position, 5);
        }
        other => panic!("expected OT_OP, got {other:?}"),
    }
    let bob_frames = bob.drain();
    assert!(matches!(bob_frames[0], ServerMessage::OtOp { version: 1, .. }));
    assert!(matches!(bob_frames[1], ServerMessage::Ack { version: 2, .. }));

    assert_eq!(hub.engine().document("r1").unwrap().content(), "HelloHi ");
}

#[tokio::test]
async fn test_duplicate_op_acked_once_broadcast_once() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    let frame = insert_frame("r1", "A", "op1", 0, 0, "x");
    send(&mut hub, &alice, &frame);
    send(&mut hub, &alice, &frame);

    let acks = alice.drain();
    assert_eq!(acks.len(), 2);
    for ack in &acks {
        assert!(matches!(ack, ServerMessage::Ack { version: 1, .. }), "{ack:?}");
    }
    assert_eq!(bob.drain().len(), 1);
    assert_eq!(hub.engine().document("r1").unwrap().version(), 1);
}

#[tokio::test]
async fn test_out_of_bounds_op_rejected() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, &op_frame("r1", "A", "d1", 0, "delete", 0, "abc"));
    assert_eq!(error_code(&alice.expect_one()), codes::VALIDATION_ERROR);
    assert!(bob.drain().is_empty());
    assert_eq!(hub.engine().document("r1").unwrap().version(), 0);
}

#[tokio::test]
async fn test_overflowing_position_rejected() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");
    send(&mut hub, &alice, &insert_frame("r1", "A", "seed", 0, 0, "hello"));
    alice.drain();
    bob.drain();

    send(&mut hub, &alice, &op_frame("r1", "A", "d1", 1, "delete", usize::MAX, "ab"));
    assert_eq!(error_code(&alice.expect_one()), codes::VALIDATION_ERROR);

    // Fits the wire range but not the document
    send(&mut hub, &alice, &op_frame("r1", "A", "d2", 1, "delete", i64::MAX as usize, "ab"));
    assert_eq!(error_code(&alice.expect_one()), codes::VALIDATION_ERROR);

    assert!(bob.drain().is_empty());
    let doc = hub.engine().document("r1").unwrap();
    assert_eq!((doc.version(), doc.content()), (1, "hello"));
}

#[tokio::test]
async fn test_pipelined_ops_from_one_client() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");
    send(&mut hub, &alice, &insert_frame("r1", "A", "seed", 0, 0, "xyz"));
    alice.drain();
    bob.drain();

    // Both written against version 1 before the first ACK arrived
    send(&mut hub, &alice, &insert_frame("r1", "A", "a1", 1, 0, "ab"));
    send(&mut hub, &alice, &insert_frame("r1", "A", "a2", 1, 1, "Q"));

    let acks = alice.drain();
    assert!(matches!(acks[0], ServerMessage::Ack { version: 2, .. }));
    assert!(matches!(acks[1], ServerMessage::Ack { version: 3, .. }));
    match &bob.drain()[1] {
        ServerMessage::OtOp { operation, version, .. } => {
            assert_eq!(*version, 3);
            assert_eq!(operation.position, 3);
        }
        other => panic!("expected OT_OP, got {other:?}"),
    }
    assert_eq!(hub.engine().document("r1").unwrap().content(), "abxQyz");
}

#[tokio::test]
async fn test_rate_limit_rejects_fifty_first_op() {
    let mut hub = test_hub();
    let (mut alice, _bob) = two_clients(&mut hub, "r1");

    for i in 0..51u64 {
        send(&mut hub, &alice, &insert_frame("r1", "A", &format!("op{i}"), i.min(50), 0, "x"));
    }

    let frames = alice.drain();
    assert_eq!(frames.len(), 51);
    assert!(frames[..50].iter().all(|f| matches!(f, ServerMessage::Ack { .. })));
    assert_eq!(error_code(&frames[50]), codes::RATE_LIMITED);
    assert_eq!(hub.engine().document("r1").unwrap().version(), 50);
}

// ─── Binding and validation ──────────────────────────────────────────────────

#[tokio::test]
async fn test_unbound_and_spoofed_clients_rejected() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");
    let mut stranger = Client::new();

    send(&mut hub, &stranger, &insert_frame("r1", "S", "s1", 0, 0, "x"));
    assert_eq!(error_code(&stranger.expect_one()), codes::NOT_IN_ROOM);

    // Bob's connection claiming to be alice
    send(&mut hub, &bob, &insert_frame("r1", "A", "spoof", 0, 0, "x"));
    assert_eq!(error_code(&bob.expect_one()), codes::NOT_IN_ROOM);

    assert!(alice.drain().is_empty());
    assert_eq!(hub.engine().document("r1").unwrap().version(), 0);
}

#[tokio::test]
async fn test_malformed_frames_get_validation_errors() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    let bad = [
        "not json",
        r#"{"type":"SHOUT","roomId":"r1","clientId":"A"}"#,
        r#"{"type":"JOIN_ROOM","roomId":"","userId":"alice","clientId":"A"}"#,
        r#"{"type":"OT_OP","roomId":"r1","clientId":"A","operation":{"id":"x","version":0,"type":"insert","position":-1,"content":"a"}}"#,
        r#"{"type":"OT_OP","roomId":"r1","clientId":"A","operation":{"id":"x","version":0,"type":"insert","position":0,"content":""}}"#,
        r#"{"type":"OT_OP","roomId":"r1","clientId":"A","operation":{"id":"x","version":0,"type":"move","position":0,"content":"a"}}"#,
    ];
    for raw in bad {
        send(&mut hub, &alice, raw);
        assert_eq!(error_code(&alice.expect_one()), codes::VALIDATION_ERROR, "frame {raw}");
    }
    assert!(bob.drain().is_empty());
}

// ─── Presence ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_update_reaches_others() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(
        &mut hub,
        &alice,
        r#"{"type":"CURSOR_UPDATE","roomId":"r1","clientId":"A","cursor":{"line":3,"column":7}}"#,
    );

    assert!(alice.drain().is_empty());
    match bob.expect_one() {
        ServerMessage::CursorUpdate { user_id, cursor, .. } => {
            assert_eq!(user_id, "alice");
            assert_eq!(cursor, Cursor::new(3, 7));
        }
        other => panic!("expected CURSOR_UPDATE, got {other:?}"),
    }
    let room = hub.manager().get_room("r1").unwrap();
    assert_eq!(room.presence_of("A").unwrap().cursor, Cursor::new(3, 7));
}

#[tokio::test]
async fn test_presence_update_reaches_everyone() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, r#"{"type":"PRESENCE_UPDATE","roomId":"r1","clientId":"A"}"#);
    for client in [&mut alice, &mut bob] {
        match client.expect_one() {
            ServerMessage::PresenceUpdate { participants, .. } => assert_eq!(participants.len(), 2),
            other => panic!("expected PRESENCE_UPDATE, got {other:?}"),
        }
    }
}

// ─── Sync ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_state_incremental_and_full() {
    let mut hub = test_hub();
    let (mut alice, mut bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, &insert_frame("r1", "A", "a1", 0, 0, "ab"));
    send(&mut hub, &bob, &insert_frame("r1", "B", "b1", 1, 2, "cd"));
    send(&mut hub, &alice, &insert_frame("r1", "A", "a2", 2, 4, "ef"));
    alice.drain();
    bob.drain();

    send(&mut hub, &bob, r#"{"type":"SYNC_STATE","roomId":"r1","clientId":"B","fromVersion":0}"#);
    match bob.expect_one() {
        ServerMessage::SyncState { version, content, operations, .. } => {
            assert_eq!(version, 3);
            assert_eq!(content, None);
            let ids: Vec<&str> = operations.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(ids, vec!["a1", "a2"]);
        }
        other => panic!("expected SYNC_STATE, got {other:?}"),
    }

    // Ahead of the document: full content
    send(&mut hub, &bob, r#"{"type":"SYNC_STATE","roomId":"r1","clientId":"B","fromVersion":99}"#);
    match bob.expect_one() {
        ServerMessage::SyncState { content, operations, .. } => {
            assert_eq!(content.as_deref(), Some("abcdef"));
            assert!(operations.is_empty());
        }
        other => panic!("expected SYNC_STATE, got {other:?}"),
    }

    send(&mut hub, &bob, r#"{"type":"SYNC_STATE","roomId":"r1","clientId":"B"}"#);
    match bob.expect_one() {
        ServerMessage::SyncState { version, content, .. } => {
            assert_eq!(version, 3);
            assert_eq!(content.as_deref(), Some("abcdef"));
        }
        other => panic!("expected SYNC_STATE, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ack_clears_pending_queue() {
    let mut hub = test_hub();
    let (mut alice, _bob) = two_clients(&mut hub, "r1");

    send(&mut hub, &alice, &insert_frame("r1", "A", "a1", 0, 0, "x"));
    send(&mut hub, &alice, &insert_frame("r1", "A", "a2", 1, 1, "y"));
    alice.drain();
    assert_eq!(hub.engine().get_queue_stats("r1").total_pending, 2);

    send(&mut hub, &alice, r#"{"type":"ACK","roomId":"r1","clientId":"A","operationId":"a1"}"#);
    assert!(alice.drain().is_empty());
    assert_eq!(hub.engine().get_queue_stats("r1").total_pending, 1);
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sweep_snapshots_and_restores_document() {
    let config = ServerConfig::for_testing("127.0.0.1:0");
    let store = Arc::new(MemoryStore::new());
    let mut hub = CollabHub::new(&config, Some(PersistenceWriter::spawn(store.clone())));

    let mut alice = Client::new();
    send(&mut hub, &alice, &join_frame("r1", "alice", "A"));
    send(&mut hub, &alice, &insert_frame("r1", "A", "a1", 0, 0, "persist me"));
    send(&mut hub, &alice, r#"{"type":"LEAVE_ROOM","roomId":"r1","clientId":"A"}"#);
    alice.drain();

    // Not idle long enough yet
    assert_eq!(hub.sweep_at(Instant::now()), SweepReport::default());
    let later = Instant::now() + Duration::from_secs(1);
    let report = hub.sweep_at(later);
    assert_eq!(report.draining, vec!["r1".to_string()]);
    assert!(report.documents.is_empty());

    hub.flush_persistence().await.unwrap();
    let report = hub.sweep_at(later);
    assert_eq!(report.documents, vec!["r1".to_string()]);
    assert_eq!(hub.stats().documents, 0);

    send(&mut hub, &alice, &join_frame("r1", "alice", "A2"));
    match alice.expect_one() {
        ServerMessage::RoomJoined { version, content, .. } => {
            assert_eq!(version, 1);
            assert_eq!(content, "persist me");
        }
        other => panic!("expected ROOM_JOINED, got {other:?}"),
    }

    hub.shutdown().await;
    assert_eq!(store.get_snapshot("r1").unwrap().unwrap().content, "persist me");
}
