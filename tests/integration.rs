//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a gateway on a free port and drives it with raw
//! tokio-tungstenite clients, verifying the full pipeline: auth gate, room
//! binding, CRDT relay, awareness cleanup, and debounced persistence.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update, WriteTxn};

use kn_collab::protocol::{self, WireMessage};
use kn_collab::registry::{RegistryConfig, RoomRegistry};
use kn_collab::server::{ServerConfig, SyncServer};
use kn_collab::storage::{StoreConfig, VersionStore};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a gateway over the given registry, return the port.
async fn start_gateway(registry: Arc<RoomRegistry>, auth_token: Option<String>) -> u16 {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        auth_token,
    };
    let server = SyncServer::new(config, registry);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listener time to bind
    sleep(Duration::from_millis(50)).await;
    port
}

async fn start_default_gateway() -> u16 {
    let registry = Arc::new(RoomRegistry::new(None, RegistryConfig::default()));
    start_gateway(registry, None).await
}

async fn connect(port: u16, room: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/?room={room}");
    let (ws, _) = connect_async(&url).await.unwrap();
    ws
}

/// Next decoded protocol frame, or panic after the timeout.
async fn recv_wire(ws: &mut Ws) -> WireMessage {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return protocol::decode(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no frame arrives inside the window.
async fn expect_silence(ws: &mut Ws, window: Duration) {
    assert!(
        timeout(window, ws.next()).await.is_err(),
        "expected no frame"
    );
}

async fn send_wire(ws: &mut Ws, msg: &WireMessage) {
    let text = protocol::encode(msg).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

fn text_delta(doc: &Doc, at: u32, content: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, at, content);
    }
    doc.transact().encode_diff_v1(&before)
}

fn apply(doc: &Doc, update: &[u8]) {
    let mut txn = doc.transact_mut();
    txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
}

fn doc_text(doc: &Doc) -> String {
    let txn = doc.transact();
    match txn.get_text("content") {
        Some(text) => text.get_string(&txn),
        None => String::new(),
    }
}

#[tokio::test]
async fn test_connect_receives_bootstrap_sync() {
    let port = start_default_gateway().await;
    let mut ws = connect(port, "doc-1").await;

    match recv_wire(&mut ws).await {
        WireMessage::Sync { room_id, update } => {
            assert_eq!(room_id, "doc-1");
            // Empty room: the payload applies cleanly to a fresh doc.
            apply(&Doc::new(), &update);
        }
        other => panic!("expected sync, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hello_world_two_clients() {
    let port = start_default_gateway().await;

    // Client A joins and inserts "hello".
    let mut a = connect(port, "doc-1").await;
    let _ = recv_wire(&mut a).await;
    let doc_a = Doc::new();
    let u1 = text_delta(&doc_a, 0, "hello");
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-1".into(),
            update: u1,
        },
    )
    .await;

    // No self-echo back to A.
    expect_silence(&mut a, Duration::from_millis(300)).await;

    // Client B joins: the bootstrap sync reconstructs "hello".
    let mut b = connect(port, "doc-1").await;
    let doc_b = Doc::new();
    match recv_wire(&mut b).await {
        WireMessage::Sync { update, .. } => apply(&doc_b, &update),
        other => panic!("expected sync, got {other:?}"),
    }
    assert_eq!(doc_text(&doc_b), "hello");

    // B appends " world"; A receives exactly that delta once.
    let u2 = text_delta(&doc_b, 5, " world");
    send_wire(
        &mut b,
        &WireMessage::Update {
            room_id: "doc-1".into(),
            update: u2.clone(),
        },
    )
    .await;

    match recv_wire(&mut a).await {
        WireMessage::Update { update, .. } => {
            assert_eq!(update, u2);
            apply(&doc_a, &update);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(doc_text(&doc_a), "hello world");
    assert_eq!(doc_text(&doc_b), "hello world");
    expect_silence(&mut a, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_deferred_room_binding() {
    let port = start_default_gateway().await;

    // Connect without a room parameter: binding waits for the first frame.
    let url = format!("ws://127.0.0.1:{port}/");
    let (mut a, _) = connect_async(&url).await.unwrap();

    let doc = Doc::new();
    let delta = text_delta(&doc, 0, "deferred");
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-late".into(),
            update: delta,
        },
    )
    .await;

    // The first frame both binds and edits, and the bootstrap sync for the
    // fresh room arrives.
    match recv_wire(&mut a).await {
        WireMessage::Sync { room_id, .. } => assert_eq!(room_id, "doc-late"),
        other => panic!("expected sync, got {other:?}"),
    }

    // A second client sees the edit that rode in on the binding frame.
    let mut b = connect(port, "doc-late").await;
    let doc_b = Doc::new();
    match recv_wire(&mut b).await {
        WireMessage::Sync { update, .. } => apply(&doc_b, &update),
        other => panic!("expected sync, got {other:?}"),
    }
    assert_eq!(doc_text(&doc_b), "deferred");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let port = start_default_gateway().await;

    let mut a = connect(port, "doc-1").await;
    let _ = recv_wire(&mut a).await;
    let mut b = connect(port, "doc-2").await;
    let _ = recv_wire(&mut b).await;

    let doc = Doc::new();
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-1".into(),
            update: text_delta(&doc, 0, "only doc-1"),
        },
    )
    .await;

    expect_silence(&mut b, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_misrouted_frame_dropped() {
    let port = start_default_gateway().await;

    let mut a = connect(port, "doc-1").await;
    let _ = recv_wire(&mut a).await;
    let mut b = connect(port, "doc-1").await;
    let _ = recv_wire(&mut b).await;

    // A is bound to doc-1 but addresses doc-2: silently dropped.
    let doc = Doc::new();
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-2".into(),
            update: text_delta(&doc, 0, "stray"),
        },
    )
    .await;
    expect_silence(&mut b, Duration::from_millis(300)).await;

    // A fresh joiner of doc-1 still sees an empty document.
    let mut c = connect(port, "doc-1").await;
    let doc_c = Doc::new();
    match recv_wire(&mut c).await {
        WireMessage::Sync { update, .. } => apply(&doc_c, &update),
        other => panic!("expected sync, got {other:?}"),
    }
    assert_eq!(doc_text(&doc_c), "");
}

#[tokio::test]
async fn test_awareness_relay_and_disconnect_cleanup() {
    let registry = Arc::new(RoomRegistry::new(None, RegistryConfig::default()));
    let port = start_gateway(registry.clone(), None).await;

    let mut a = connect(port, "doc-1").await;
    let _ = recv_wire(&mut a).await;
    let mut b = connect(port, "doc-1").await;
    let _ = recv_wire(&mut b).await;

    // A announces client 5.
    let payload = serde_json::to_vec(&serde_json::json!({ "5": { "user": "alice" } })).unwrap();
    send_wire(
        &mut a,
        &WireMessage::Awareness {
            room_id: "doc-1".into(),
            payload,
        },
    )
    .await;

    match recv_wire(&mut b).await {
        WireMessage::Awareness { payload, .. } => {
            let entries: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert_eq!(entries["5"]["user"], "alice");
        }
        other => panic!("expected awareness, got {other:?}"),
    }

    // A disconnects; B is told client 5 left, and the room is clean.
    a.close(None).await.unwrap();
    match recv_wire(&mut b).await {
        WireMessage::Awareness { payload, .. } => {
            let entries: serde_json::Value = serde_json::from_slice(&payload).unwrap();
            assert!(entries["5"].is_null());
        }
        other => panic!("expected awareness retraction, got {other:?}"),
    }

    let room = registry.get("doc-1").await.unwrap();
    assert_eq!(room.stats().await.awareness_count, 0);
}

#[tokio::test]
async fn test_auth_gate() {
    let registry = Arc::new(RoomRegistry::new(None, RegistryConfig::default()));
    let port = start_gateway(registry, Some("sesame".to_string())).await;

    // Missing token: the upgrade is refused.
    let url = format!("ws://127.0.0.1:{port}/?room=doc-1");
    assert!(connect_async(&url).await.is_err());

    // Wrong token: refused.
    let url = format!("ws://127.0.0.1:{port}/?room=doc-1&token=wrong");
    assert!(connect_async(&url).await.is_err());

    // Correct token: admitted, bootstrap arrives.
    let url = format!("ws://127.0.0.1:{port}/?room=doc-1&token=sesame");
    let (mut ws, _) = connect_async(&url).await.unwrap();
    assert!(matches!(recv_wire(&mut ws).await, WireMessage::Sync { .. }));
}

#[tokio::test]
async fn test_debounced_persistence_coalesces() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(VersionStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let registry = Arc::new(RoomRegistry::new(
        Some(store.clone()),
        RegistryConfig {
            debounce: Duration::from_millis(100),
            ..RegistryConfig::default()
        },
    ));
    let port = start_gateway(registry, None).await;

    let mut ws = connect(port, "doc-1").await;
    let _ = recv_wire(&mut ws).await;

    // A burst of edits inside one debounce window.
    let doc = Doc::new();
    for word in ["k", "n", "o", "w"] {
        let len = doc_text(&doc).len() as u32;
        let delta = text_delta(&doc, len, word);
        send_wire(
            &mut ws,
            &WireMessage::Update {
                room_id: "doc-1".into(),
                update: delta,
            },
        )
        .await;
    }

    sleep(Duration::from_millis(500)).await;

    // Exactly one version, holding the fully merged state.
    assert_eq!(store.count("doc-1").unwrap(), 1);
    let snapshot = store.load_latest("doc-1").unwrap().unwrap();
    let check = Doc::new();
    apply(&check, &snapshot);
    assert_eq!(doc_text(&check), "know");
}

#[tokio::test]
async fn test_persisted_room_hydrates_on_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        Arc::new(VersionStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());

    // Seed the store as if a previous process had saved a snapshot.
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, 0, "restored");
    }
    let snapshot = doc
        .transact()
        .encode_state_as_update_v1(&yrs::StateVector::default());
    store.save("doc-1", &snapshot, None).unwrap();

    let registry = Arc::new(RoomRegistry::new(Some(store), RegistryConfig::default()));
    let port = start_gateway(registry, None).await;

    let mut ws = connect(port, "doc-1").await;
    let doc_b = Doc::new();
    match recv_wire(&mut ws).await {
        WireMessage::Sync { update, .. } => apply(&doc_b, &update),
        other => panic!("expected sync, got {other:?}"),
    }
    assert_eq!(doc_text(&doc_b), "restored");
}

#[tokio::test]
async fn test_garbage_frames_do_not_kill_connection() {
    let port = start_default_gateway().await;

    let mut a = connect(port, "doc-1").await;
    let _ = recv_wire(&mut a).await;
    let mut b = connect(port, "doc-1").await;
    let _ = recv_wire(&mut b).await;

    // Unparseable text, unknown type, and a corrupt delta are all dropped.
    a.send(Message::Text("not json at all".into())).await.unwrap();
    a.send(Message::Text(r#"{"type":"nope","roomId":"doc-1"}"#.into()))
        .await
        .unwrap();
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-1".into(),
            update: vec![0xFF, 0xBA, 0xD0],
        },
    )
    .await;
    expect_silence(&mut b, Duration::from_millis(300)).await;

    // The same connection still works afterwards.
    let doc = Doc::new();
    send_wire(
        &mut a,
        &WireMessage::Update {
            room_id: "doc-1".into(),
            update: text_delta(&doc, 0, "still alive"),
        },
    )
    .await;
    match recv_wire(&mut b).await {
        WireMessage::Update { update, .. } => {
            let doc_b = Doc::new();
            apply(&doc_b, &update);
            assert_eq!(doc_text(&doc_b), "still alive");
        }
        other => panic!("expected update, got {other:?}"),
    }
}
