//! HTTP round trips against a served hub.

use courier_core::config::HubConfig;
use courier_core::{Hub, HubBuilder};
use courier_protocol::Addressing;
use courier_server::config::Config;
use courier_server::handlers::{self, AppState};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;

async fn start(longpoll_timeout: Duration) -> (SocketAddr, Arc<Hub>) {
    let mut hub_config = HubConfig::default();
    hub_config.session.longpoll_timeout = longpoll_timeout;
    let hub = HubBuilder::new(hub_config).build().unwrap();

    let mut config = Config::default();
    config.metrics.enabled = false;
    let state = Arc::new(AppState::with_hub(config, Arc::clone(&hub)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(handlers::serve(listener, state));
    (addr, hub)
}

async fn request(addr: SocketAddr, raw: String) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

fn post_form(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

fn urlencode(raw: &str) -> String {
    raw.bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() {
                (b as char).to_string()
            } else {
                format!("%{b:02X}")
            }
        })
        .collect()
}

fn body(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

async fn wait_for_user(hub: &Hub, user: &str) {
    for _ in 0..200 {
        if hub.registry().lookup_by_user(user).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{user} never registered");
}

#[tokio::test]
async fn test_ping() {
    let (addr, _hub) = start(Duration::from_secs(1)).await;
    let response = request(addr, get("/ping")).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert_eq!(body(&response), "OK");
}

#[tokio::test]
async fn test_health_reports_status() {
    let (addr, _hub) = start(Duration::from_secs(1)).await;
    let response = request(addr, get("/health")).await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let health: Value = serde_json::from_str(body(&response)).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["clients"], 0);
}

#[tokio::test]
async fn test_long_poll_without_user_is_rejected() {
    let (addr, _hub) = start(Duration::from_secs(1)).await;
    let response = request(addr, get("/lp")).await;
    assert!(response.starts_with("HTTP/1.1 400"));
}

#[tokio::test]
async fn test_long_poll_times_out_empty() {
    let (addr, hub) = start(Duration::from_millis(100)).await;
    let response = request(addr, get("/lp?user=alice")).await;
    assert!(response.starts_with("HTTP/1.1 204"));
    assert_eq!(hub.registry().local_count(), 0);
}

#[tokio::test]
async fn test_long_poll_delivers_first_message() {
    let (addr, hub) = start(Duration::from_secs(5)).await;
    let pending = tokio::spawn(request(addr, get("/lp?user=alice&page=%2Finbox")));

    wait_for_user(&hub, "alice").await;
    for _ in 0..200 {
        if hub.registry().page_len("/inbox") == Some(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(hub.registry().page_len("/inbox"), Some(1));

    let delivered = hub.router().fan_out(
        &Addressing::User {
            user: "alice".into(),
            page: None,
        },
        &payload(json!({"event": "note", "data": {"n": 1}})),
    );
    assert_eq!(delivered, 1);

    let response = pending.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response
        .to_lowercase()
        .contains("access-control-allow-origin: *"));

    let message: Value = serde_json::from_str(body(&response)).unwrap();
    assert_eq!(message["event"], "note");
    assert_eq!(message["data"], json!({"n": 1}));

    // The socket is gone once the response is written
    for _ in 0..200 {
        if hub.registry().local_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(hub.registry().local_count(), 0);
    assert_eq!(hub.registry().page_len("/inbox"), None);
}

#[tokio::test]
async fn test_long_poll_form_command_is_routed() {
    let (addr, _hub) = start(Duration::from_secs(5)).await;
    let command = json!({
        "command": {"command": "message", "user": "bob"},
        "message": {"event": "echo", "data": {}}
    })
    .to_string();
    let form = format!("user=bob&command={}", urlencode(&command));

    let response = request(addr, post_form("/lp", &form)).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    let message: Value = serde_json::from_str(body(&response)).unwrap();
    assert_eq!(message["event"], "echo");
}

#[tokio::test]
async fn test_long_poll_shutdown_is_unavailable() {
    let (addr, hub) = start(Duration::from_secs(5)).await;
    let pending = tokio::spawn(request(addr, get("/lp?user=carol")));

    wait_for_user(&hub, "carol").await;
    hub.shutdown();

    let response = pending.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 503"));
}

#[tokio::test]
async fn test_websocket_session() {
    let (addr, hub) = start(Duration::from_secs(1)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/socket"))
        .await
        .unwrap();

    let auth = json!({"command": {"command": "authenticate", "user": "dave"}});
    ws.send(WsMessage::Text(auth.to_string())).await.unwrap();
    wait_for_user(&hub, "dave").await;

    hub.router().fan_out(
        &Addressing::All,
        &payload(json!({"event": "hello", "data": {}})),
    );

    let frame = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let WsMessage::Text(text) = frame else {
        panic!("expected a text frame, got {frame:?}");
    };
    let message: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(message["event"], "hello");

    hub.shutdown();
    let frame = tokio::time::timeout(Duration::from_secs(1), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let WsMessage::Close(Some(close)) = frame else {
        panic!("expected a close frame, got {frame:?}");
    };
    assert_eq!(u16::from(close.code), 1001);
}
