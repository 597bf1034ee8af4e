//! Long-poll sessions.

mod common;

use common::{config, eventually, hub_with};
use courier_core::{serve_long_poll, BackendRole, LongPollOutcome, LongPollRequest};
use courier_protocol::Envelope;
use courier_transport::longpoll;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn request(user: &str) -> LongPollRequest {
    LongPollRequest {
        user: user.to_string(),
        ..LongPollRequest::default()
    }
}

#[tokio::test]
async fn test_delivers_first_message() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let (writer, mut response) = longpoll::channel();
    let poll = tokio::spawn(serve_long_poll(
        Arc::clone(&t.hub),
        LongPollRequest {
            user: "u1".into(),
            page: Some("/feed".into()),
            command: None,
        },
        writer,
    ));

    let hub = Arc::clone(&t.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.registry().page_len("/feed") == Some(1) }
        })
        .await
    );

    let payload = json!({"event": "e", "data": {"n": 1}});
    t.hub
        .router()
        .handle_bus(
            Envelope::new("message")
                .with_param("page", "/feed")
                .with_message(payload.as_object().cloned().unwrap()),
        )
        .await;

    assert_eq!(poll.await.unwrap(), LongPollOutcome::Delivered);
    assert_eq!(response.recv().await.unwrap().event, "e");
    assert_eq!(t.hub.registry().local_count(), 0);
    assert_eq!(t.hub.registry().page_len("/feed"), None);
}

#[tokio::test]
async fn test_times_out_empty() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let (writer, mut response) = longpoll::channel();

    let outcome = serve_long_poll(Arc::clone(&t.hub), request("u1"), writer).await;
    assert_eq!(outcome, LongPollOutcome::TimedOut);
    assert!(response.recv().await.is_none());
    assert_eq!(t.hub.registry().local_count(), 0);
}

#[tokio::test]
async fn test_missing_user_is_rejected() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let (writer, _response) = longpoll::channel();
    let outcome = serve_long_poll(Arc::clone(&t.hub), request(""), writer).await;
    assert_eq!(outcome, LongPollOutcome::Rejected);
}

#[tokio::test]
async fn test_killswitch_disables_long_poll() {
    let mut config = config();
    config.killswitch.poll_interval = Duration::from_millis(10);
    let t = hub_with(config, BackendRole::Shared);
    t.hub.killswitch().unwrap().activate(30).await.unwrap();

    let flags = Arc::clone(t.hub.flags());
    assert!(eventually(|| std::future::ready(flags.longpoll_disabled())).await);

    let (writer, _response) = longpoll::channel();
    let outcome = serve_long_poll(Arc::clone(&t.hub), request("u1"), writer).await;
    assert_eq!(outcome, LongPollOutcome::Disabled);

    t.hub.killswitch().unwrap().deactivate().await.unwrap();
    assert!(eventually(|| std::future::ready(!flags.longpoll_disabled())).await);
}

#[tokio::test]
async fn test_shutdown_ends_poll() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let (writer, _response) = longpoll::channel();
    let poll = tokio::spawn(serve_long_poll(Arc::clone(&t.hub), request("u1"), writer));

    let hub = Arc::clone(&t.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.registry().local_count() == 1 }
        })
        .await
    );
    t.hub.shutdown();
    assert_eq!(poll.await.unwrap(), LongPollOutcome::Shutdown);
}

#[tokio::test]
async fn test_command_is_routed_as_client_command() {
    let t = hub_with(config(), BackendRole::PresenceOnly);
    let (writer, _response) = longpoll::channel();
    let command = r#"{"command":{"command":"setgroups","groups":"g1,g2"}}"#;
    let poll = tokio::spawn(serve_long_poll(
        Arc::clone(&t.hub),
        LongPollRequest {
            user: "u1".into(),
            page: None,
            command: Some(command.into()),
        },
        writer,
    ));

    let hub = Arc::clone(&t.hub);
    assert!(
        eventually(|| {
            let hub = Arc::clone(&hub);
            async move { hub.registry().group_len("g2") == Some(1) }
        })
        .await
    );
    assert_eq!(poll.await.unwrap(), LongPollOutcome::TimedOut);
    assert_eq!(t.hub.registry().group_len("g2"), None);
}
