use crate::*;
use arena_core::{Arena, ArenaConfig, MemoryStorage, ShutdownState, SystemClock};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start() -> (Arc<ArenaServer>, std::net::SocketAddr, ShutdownState) {
    let arena = Arc::new(Arena::new(
        ArenaConfig::default(),
        Arc::new(MemoryStorage::new()),
        Arc::new(SystemClock),
    ));
    let server = Arc::new(create_server_with_config(
        ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        },
        arena,
    ));
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let shutdown = ShutdownState::new();
    {
        let server = server.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await });
    }
    (server, addr, shutdown)
}

async fn open(addr: std::net::SocketAddr) -> Socket {
    let (socket, _) = connect_async(format!("ws://{addr}")).await.expect("connect");
    socket
}

async fn send(socket: &mut Socket, frame: Value) {
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .expect("send");
}

/// Reads frames until one satisfies `matches`, skipping the rest.
async fn expect_frame(socket: &mut Socket, matches: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if matches(&frame) {
                        return frame;
                    }
                }
                Some(Ok(_)) => continue,
                other => panic!("socket ended early: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

async fn identify(socket: &mut Socket, username: &str) -> Value {
    send(
        socket,
        json!({"namespace": "session", "event": "identify", "data": {"username": username}}),
    )
    .await;
    let reply = expect_frame(socket, |f| f["request"] == "session.identify").await;
    reply["data"]["player"]["id"].clone()
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_players_are_notified_of_their_game() {
    let (_server, addr, shutdown) = start().await;
    let mut alice = open(addr).await;
    let mut bob = open(addr).await;
    let alice_id = identify(&mut alice, "alice").await;
    let bob_id = identify(&mut bob, "bob").await;

    send(&mut alice, json!({"namespace": "queue", "event": "join"})).await;
    let queued = expect_frame(&mut alice, |f| f["request"] == "queue.join").await;
    assert_eq!(queued["data"]["status"], "queued");

    send(&mut bob, json!({"namespace": "queue", "event": "join"})).await;
    let matched = expect_frame(&mut bob, |f| f["request"] == "queue.join").await;
    assert_eq!(matched["data"]["status"], "matched");

    for socket in [&mut alice, &mut bob] {
        let started = expect_frame(socket, |f| f["event"] == "game_started").await;
        assert_eq!(started["type"], "notification");
        assert_eq!(started["scope"]["channel"], "game");
        let players: Vec<Value> = started["game"]["players"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["player_id"].clone())
            .collect();
        assert!(players.contains(&alice_id));
        assert!(players.contains(&bob_id));
    }

    shutdown.initiate_shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn closing_the_last_socket_opens_the_reconnection_window() {
    let (server, addr, shutdown) = start().await;
    let mut alice = open(addr).await;
    let alice_id: arena_core::PlayerId =
        serde_json::from_value(identify(&mut alice, "alice").await).unwrap();
    assert!(server.arena().presence().is_connected(alice_id));

    alice.close(None).await.expect("close");
    drop(alice);

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.arena().presence().is_connected(alice_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("disconnect should be recorded");

    let record = server.arena().presence().record(alice_id).expect("record kept");
    assert!(record.disconnected_at.is_some());
    shutdown.initiate_shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_frames_are_rejected_without_closing() {
    let (_server, addr, shutdown) = start().await;
    let mut alice = open(addr).await;
    identify(&mut alice, "alice").await;

    let padding = "x".repeat(ServerConfig::default().max_message_size + 1);
    send(
        &mut alice,
        json!({"namespace": "lobby", "event": "chat", "data": {"message": padding}}),
    )
    .await;
    let rejected = expect_frame(&mut alice, |f| f["type"] == "reply").await;
    assert_eq!(rejected["error"]["kind"], "invalid_request");

    send(&mut alice, json!({"namespace": "session", "event": "heartbeat"})).await;
    let ack = expect_frame(&mut alice, |f| f["request"] == "session.heartbeat").await;
    assert_eq!(ack["data"]["ok"], true);
    shutdown.initiate_shutdown();
}
