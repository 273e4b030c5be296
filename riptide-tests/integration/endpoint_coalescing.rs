//! Single-flight endpoint creation as seen by clients.

use std::time::Duration;

use riptide_hub::engine::{EndpointBehavior, EndpointOptions, MockEngineFactory};
use riptide_hub::{HubConfig, HubMessage};
use tokio_test::assert_ok;

use crate::support::{HASH_X, TestHub, content, json};

fn gated_hub() -> TestHub {
    TestHub::spawn_with(
        HubConfig::for_testing(),
        MockEngineFactory::with_endpoint_behavior(EndpointBehavior::Gated),
    )
}

fn server_url(message: &HubMessage) -> String {
    match message {
        HubMessage::ServerReady { server_url, .. } => server_url.clone(),
        other => panic!("expected server-ready, got {}", other.kind()),
    }
}

#[tokio::test]
async fn test_concurrent_requests_share_one_endpoint() {
    let mut hub = gated_hub();
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_X).await;
    hub.drain().await;

    let (first, second) = futures::join!(
        hub.handle.create_server("a", "k1", EndpointOptions::default()),
        hub.handle.create_server("b", "k2", EndpointOptions::default()),
    );
    assert_ok!(first);
    assert_ok!(second);
    let stats = hub.stats().await;
    assert!(stats.session(content(HASH_X)).unwrap().endpoint_pending);

    hub.factory.release_endpoints();
    let ready = [hub.next().await, hub.next().await];

    assert_eq!(server_url(&ready[0]), server_url(&ready[1]));
    let mut clients: Vec<_> = ready.iter().map(|m| m.client_key().to_string()).collect();
    clients.sort();
    assert_eq!(clients, vec!["a", "b"]);
    assert_eq!(hub.factory.endpoint_calls(content(HASH_X)), 1);
}

#[tokio::test]
async fn test_ready_endpoint_is_reused() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    assert_ok!(
        hub.handle
            .create_server("a", "k1", EndpointOptions::default())
            .await
    );
    let first = server_url(&hub.next_of("server-ready").await);

    hub.add("b", "k2", HASH_X).await;
    assert_ok!(
        hub.handle
            .create_server("b", "k2", EndpointOptions::default())
            .await
    );
    let second = server_url(&hub.next_of("server-ready").await);

    assert_eq!(first, second);
    assert_eq!(hub.factory.endpoint_calls(content(HASH_X)), 1);
    let stats = hub.stats().await;
    assert_eq!(
        stats.session(content(HASH_X)).unwrap().server_url.as_deref(),
        Some(first.as_str())
    );
}

#[tokio::test]
async fn test_add_with_server_reports_ready_then_subscribed() {
    let mut hub = TestHub::spawn();

    hub.add_with_server("a", "k1", HASH_X).await;
    let ready = hub.next().await;
    let subscribed = hub.next().await;

    assert_eq!(ready.kind(), "server-ready");
    assert_eq!(subscribed.kind(), "torrent-subscribed");
    assert_eq!(
        json(&subscribed)["torrent"]["serverURL"],
        server_url(&ready).as_str()
    );
}

#[tokio::test]
async fn test_requested_port_is_passed_to_engine() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;

    let options = EndpointOptions {
        host: Some("0.0.0.0".to_string()),
        port: Some(8123),
    };
    assert_ok!(hub.handle.create_server("a", "k1", options).await);

    assert_eq!(
        server_url(&hub.next_of("server-ready").await),
        "http://0.0.0.0:8123"
    );
}

#[tokio::test]
async fn test_unknown_torrent_key_gets_warning() {
    let mut hub = TestHub::spawn();

    assert_ok!(
        hub.handle
            .create_server("a", "nope", EndpointOptions::default())
            .await
    );
    let message = hub.next().await;

    let body = json(&message);
    assert_eq!(body["type"], "warning");
    assert_eq!(body["torrentKey"], "nope");
    assert_eq!(body["error"]["message"], "Missing torrentKey: nope");
}

#[tokio::test]
async fn test_failed_creation_notifies_every_waiter() {
    let mut hub = TestHub::spawn_with(
        HubConfig::for_testing(),
        MockEngineFactory::with_endpoint_behavior(EndpointBehavior::Fail(
            "address in use".to_string(),
        )),
    );
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_X).await;
    hub.drain().await;

    assert_ok!(
        hub.handle
            .create_server("a", "k1", EndpointOptions::default())
            .await
    );
    assert_ok!(
        hub.handle
            .create_server("b", "k2", EndpointOptions::default())
            .await
    );
    let errors = [hub.next().await, hub.next().await];

    for error in &errors {
        assert_eq!(error.kind(), "error");
        assert!(
            json(error)["error"]["message"]
                .as_str()
                .unwrap()
                .contains("address in use")
        );
    }
    let stats = hub.stats().await;
    let session = stats.session(content(HASH_X)).unwrap();
    assert!(!session.endpoint_pending);
    assert_eq!(session.server_url, None);
}

#[tokio::test]
async fn test_destroy_during_creation_cancels_waiters() {
    let mut hub = gated_hub();
    hub.add("a", "k1", HASH_X).await;
    hub.drain().await;
    assert_ok!(
        hub.handle
            .create_server("a", "k1", EndpointOptions::default())
            .await
    );

    assert_ok!(hub.handle.destroy("a", None).await);
    let cancelled = hub.next().await;
    assert_eq!(cancelled.kind(), "error");
    assert!(
        json(&cancelled)["error"]["message"]
            .as_str()
            .unwrap()
            .contains("cancelled")
    );
    assert!(hub.stats().await.sessions.is_empty());

    // The endpoint finishing late is closed rather than leaked
    hub.factory.release_endpoints();
    let mut closed = Vec::new();
    for _ in 0..100 {
        closed = hub.factory.closed_endpoints();
        if !closed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(closed.len(), 1);
}
