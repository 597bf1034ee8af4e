//! End-to-end routing through a hub on the in-memory backend.

mod common;

use common::{config, connect, eventually, hub_with, shared_hub, START};
use courier_core::backend::{BackendConnection, Connector};
use courier_core::{BackendRole, HubBuilder};
use courier_protocol::{encode_envelope, Envelope, Message};
use courier_transport::memory::{Frame, MemoryClient};
use courier_transport::CloseCode;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

fn ping_payload() -> Map<String, Value> {
    json!({"event": "ping", "data": {}}).as_object().cloned().unwrap()
}

async fn authenticate(client: &MemoryClient, hub: &Arc<courier_core::Hub>, user: &str) {
    client
        .send(Envelope::new("authenticate").with_param("user", user))
        .await
        .unwrap();
    let hub = Arc::clone(hub);
    let user = user.to_string();
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            let user = user.clone();
            async move { hub.registry().lookup_by_user(&user).is_ok() }
        })
        .await
    );
}

#[tokio::test]
async fn test_bus_message_reaches_client_once() {
    let t = shared_hub();
    let mut client = connect(&t.hub);
    authenticate(&client, &t.hub, "u1").await;

    let envelope = Envelope::new("message")
        .with_param("user", "u1")
        .with_message(ping_payload());
    let mut conn = t.backend.connect().await.unwrap();
    conn.list_push("courier_queue", &encode_envelope(&envelope).unwrap())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), client.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Message::new("ping", Map::new(), START));
    assert_eq!(
        serde_json::to_value(&message).unwrap(),
        json!({"event": "ping", "data": {}, "time": START})
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.try_recv().is_none());
}

#[tokio::test]
async fn test_bus_subscription_reaches_client() {
    let t = shared_hub();
    let mut client = connect(&t.hub);
    authenticate(&client, &t.hub, "u1").await;

    let envelope = Envelope::new("message")
        .with_param("user", "u1")
        .with_message(ping_payload());
    let payload = encode_envelope(&envelope).unwrap();
    let mut conn = t.backend.connect().await.unwrap();

    // Publish until the subscriber is attached
    let mut received = None;
    for _ in 0..100 {
        conn.publish("courier", &payload).await.unwrap();
        if let Ok(message) =
            tokio::time::timeout(Duration::from_millis(20), client.next_message()).await
        {
            received = message;
            break;
        }
    }
    assert_eq!(received.unwrap().event, "ping");
}

#[tokio::test]
async fn test_users_fan_out_skips_missing_user() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let mut a = connect(&t.hub);
    let mut c = connect(&t.hub);
    authenticate(&a, &t.hub, "a").await;
    authenticate(&c, &t.hub, "c").await;

    let envelope = Envelope::new("message")
        .with_param("users", "a,b,c")
        .with_message(ping_payload());
    t.hub.router().handle_bus(envelope).await;

    for client in [&mut a, &mut c] {
        let message = tokio::time::timeout(Duration::from_secs(1), client.next_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.event, "ping");
    }
}

#[tokio::test]
async fn test_client_message_without_bus_fans_out_locally() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let sender = connect(&t.hub);
    let mut receiver = connect(&t.hub);
    authenticate(&sender, &t.hub, "s").await;
    authenticate(&receiver, &t.hub, "r").await;

    receiver
        .send(Envelope::new("setpage").with_param("page", "/inbox"))
        .await
        .unwrap();
    let hub = Arc::clone(&t.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.registry().page_len("/inbox") == Some(1) }
        })
        .await
    );

    sender
        .send(
            Envelope::new("message")
                .with_param("page", "/inbox")
                .with_message(ping_payload()),
        )
        .await
        .unwrap();
    let message = tokio::time::timeout(Duration::from_secs(1), receiver.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.event, "ping");
}

#[tokio::test]
async fn test_client_message_with_bus_is_forwarded() {
    let t = shared_hub();
    let sender = connect(&t.hub);
    let mut receiver = connect(&t.hub);
    authenticate(&sender, &t.hub, "s").await;
    authenticate(&receiver, &t.hub, "r").await;

    // The forwarded copy comes back through the subscription; retry until
    // the subscriber is attached
    let mut received = None;
    for _ in 0..100 {
        sender
            .send(
                Envelope::new("message")
                    .with_param("user", "r")
                    .with_message(ping_payload()),
            )
            .await
            .unwrap();
        if let Ok(message) =
            tokio::time::timeout(Duration::from_millis(20), receiver.next_message()).await
        {
            received = message;
            break;
        }
    }
    assert_eq!(received.unwrap().event, "ping");
}

#[tokio::test]
async fn test_bad_handshake_closes_without_data() {
    let t = shared_hub();
    let mut client = connect(&t.hub);
    client
        .send(Envelope::new("setpage").with_param("page", "/"))
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), client.recv())
        .await
        .unwrap();
    assert_eq!(frame, Some(Frame::Close(CloseCode::Error)));
    assert_eq!(t.hub.registry().local_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_sessions_going_away() {
    let t = shared_hub();
    let mut client = connect(&t.hub);
    authenticate(&client, &t.hub, "u1").await;

    t.hub.shutdown();
    let frame = tokio::time::timeout(Duration::from_secs(1), client.recv())
        .await
        .unwrap();
    assert_eq!(frame, Some(Frame::Close(CloseCode::GoingAway)));

    let hub = Arc::clone(&t.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.registry().local_count() == 0 }
        })
        .await
    );
}

#[tokio::test]
async fn test_client_disconnect_closes_normally() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let mut client = connect(&t.hub);
    authenticate(&client, &t.hub, "u1").await;

    client.disconnect();
    let frame = tokio::time::timeout(Duration::from_secs(1), client.recv())
        .await
        .unwrap();
    assert_eq!(frame, Some(Frame::Close(CloseCode::Normal)));
    assert_eq!(t.hub.registry().local_count(), 0);
}

#[tokio::test]
async fn test_hub_without_backend_routes_locally() {
    let hub = HubBuilder::new(config()).build().unwrap();
    let mut client = connect(&hub);
    authenticate(&client, &hub, "u1").await;

    let delivered = hub.router().fan_out(
        &courier_protocol::Addressing::All,
        &ping_payload(),
    );
    assert_eq!(delivered, 1);
    assert_eq!(client.next_message().await.unwrap().event, "ping");
    assert!(hub.presence().is_none());
}
