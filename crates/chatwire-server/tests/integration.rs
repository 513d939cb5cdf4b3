//! End-to-end integration tests using a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use chatwire_core::{HubConfig, ServerConfig};
use chatwire_server::{start, ServerHandle};
use chatwire_telemetry::MetricsRecorder;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot_with(hub: HubConfig) -> ServerHandle {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    };
    start(config, hub, Arc::new(MetricsRecorder::new()))
        .await
        .unwrap()
}

async fn boot() -> ServerHandle {
    boot_with(HubConfig::default()).await
}

fn ws_url(handle: &ServerHandle) -> String {
    format!("ws://127.0.0.1:{}/ws", handle.port())
}

fn http_url(handle: &ServerHandle, path: &str) -> String {
    format!("http://127.0.0.1:{}{path}", handle.port())
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect and consume the welcome frame. Returns the connection id.
async fn connect_welcomed(url: &str) -> (WsStream, String) {
    let mut ws = connect(url).await;
    let welcome = read_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let id = welcome["connection"].as_str().unwrap().to_owned();
    (ws, id)
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn read_until(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let frame = read_json(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn request(ws: &mut WsStream, frame: Value) -> Value {
    let id = frame["id"].clone();
    send(ws, frame).await;
    read_until(ws, |f| f["id"] == id).await
}

/// Whether the server closed the socket within the timeout.
async fn closed_by_server(ws: &mut WsStream) -> bool {
    loop {
        match timeout(TIMEOUT, ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => {}
        }
    }
}

// ── HTTP ──

#[tokio::test]
async fn root_reports_running() {
    let handle = boot().await;
    let body = reqwest::get(http_url(&handle, "/"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "Chat App API running");
    handle.shutdown().await;
}

#[tokio::test]
async fn health_counts_connections() {
    let handle = boot().await;
    let (_ws, _) = connect_welcomed(&ws_url(&handle)).await;

    let body: Value = reqwest::get(http_url(&handle, "/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn metrics_snapshot_lists_connections() {
    let handle = boot().await;
    let (_ws, _) = connect_welcomed(&ws_url(&handle)).await;

    let body: Value = reqwest::get(http_url(&handle, "/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = body["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m["name"].as_str())
        .collect();
    assert!(names.contains(&"connections_total"));
    handle.shutdown().await;
}

#[tokio::test]
async fn channel_endpoint_reports_members() {
    let handle = boot().await;
    let (mut ws, _) = connect_welcomed(&ws_url(&handle)).await;
    let ack = request(&mut ws, json!({"type": "join", "channel": "general", "id": "j1"})).await;
    assert_eq!(ack["type"], "ack");

    let resp = reqwest::get(http_url(&handle, "/channels/general")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["name"], "general");
    assert_eq!(body["members"], 1);
    assert_eq!(body["next_seq"], 1);

    let missing = reqwest::get(http_url(&handle, "/channels/nowhere")).await.unwrap();
    assert_eq!(missing.status(), 404);
    handle.shutdown().await;
}

// ── Messaging ──

#[tokio::test]
async fn join_send_and_receive() {
    let handle = boot().await;
    let url = ws_url(&handle);
    let (mut alice, alice_id) = connect_welcomed(&url).await;
    let (mut bob, bob_id) = connect_welcomed(&url).await;

    let ack = request(&mut alice, json!({"type": "join", "channel": "general", "id": "a1"})).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["op"], "join");
    request(&mut bob, json!({"type": "join", "channel": "general", "id": "b1"})).await;

    let joined = read_until(&mut alice, |f| f["type"] == "presence" && f["connection"] == bob_id.as_str()).await;
    assert_eq!(joined["kind"], "joined");
    assert_eq!(joined["sender"], "system");

    let ack = request(
        &mut alice,
        json!({"type": "send", "channel": "general", "payload": "hello", "id": "a2"}),
    )
    .await;
    assert_eq!(ack["seq"], 1);

    let msg = read_until(&mut bob, |f| f["type"] == "message").await;
    assert_eq!(msg["payload"], "hello");
    assert_eq!(msg["seq"], 1);
    assert_eq!(msg["sender"], alice_id.as_str());
    assert_eq!(msg["channel"], "general");
    handle.shutdown().await;
}

#[tokio::test]
async fn send_without_join_is_rejected() {
    let handle = boot().await;
    let (mut ws, _) = connect_welcomed(&ws_url(&handle)).await;
    let err = request(
        &mut ws,
        json!({"type": "send", "channel": "general", "payload": "x", "id": "s1"}),
    )
    .await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "NOT_MEMBER");

    let pong = request(&mut ws, json!({"type": "ping", "id": "p1"})).await;
    assert_eq!(pong["type"], "pong");
    handle.shutdown().await;
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let handle = boot_with(HubConfig {
        max_payload_bytes: 8,
        ..HubConfig::default()
    })
    .await;
    let (mut ws, _) = connect_welcomed(&ws_url(&handle)).await;
    request(&mut ws, json!({"type": "join", "channel": "general", "id": "j"})).await;

    let err = request(
        &mut ws,
        json!({"type": "send", "channel": "general", "payload": "123456789", "id": "s"}),
    )
    .await;
    assert_eq!(err["code"], "PAYLOAD_TOO_LARGE");

    let ack = request(
        &mut ws,
        json!({"type": "send", "channel": "general", "payload": "12345678", "id": "t"}),
    )
    .await;
    assert_eq!(ack["seq"], 1);
    handle.shutdown().await;
}

#[tokio::test]
async fn binary_frame_is_rejected() {
    let handle = boot().await;
    let (mut ws, _) = connect_welcomed(&ws_url(&handle)).await;
    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let err = read_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "INVALID_FRAME");
    handle.shutdown().await;
}

// ── Lifecycle ──

#[tokio::test]
async fn client_close_announces_disconnect() {
    let handle = boot().await;
    let url = ws_url(&handle);
    let (mut alice, _) = connect_welcomed(&url).await;
    let (mut bob, bob_id) = connect_welcomed(&url).await;
    request(&mut alice, json!({"type": "join", "channel": "general", "id": "a"})).await;
    request(&mut bob, json!({"type": "join", "channel": "general", "id": "b"})).await;

    bob.close(None).await.unwrap();

    let gone = read_until(&mut alice, |f| {
        f["type"] == "presence" && f["kind"] == "disconnected"
    })
    .await;
    assert_eq!(gone["connection"], bob_id.as_str());
    handle.shutdown().await;
}

#[tokio::test]
async fn capacity_rejection() {
    let handle = boot_with(HubConfig {
        max_connections: 1,
        ..HubConfig::default()
    })
    .await;
    let url = ws_url(&handle);
    let (mut first, _) = connect_welcomed(&url).await;

    let mut second = connect(&url).await;
    let err = read_json(&mut second).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "CAPACITY_EXCEEDED");
    assert!(closed_by_server(&mut second).await);

    let pong = request(&mut first, json!({"type": "ping", "id": "p"})).await;
    assert_eq!(pong["type"], "pong");
    handle.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_closes_clients() {
    let handle = boot().await;
    let (mut ws, _) = connect_welcomed(&ws_url(&handle)).await;
    let hub = Arc::clone(handle.hub());

    handle.shutdown().await;
    assert!(closed_by_server(&mut ws).await);
    assert_eq!(hub.stats().connections, 0);
}
