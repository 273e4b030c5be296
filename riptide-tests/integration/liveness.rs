//! Heartbeat expiry, periodic updates and delayed disconnects.
//!
//! All tests run on paused time; sleeping advances the clock instantly.

use std::time::Duration;

use riptide_hub::engine::MockEngineFactory;
use riptide_hub::HubConfig;
use tokio_test::assert_ok;

use crate::support::{HASH_X, TestHub, content};

fn sweeping_config() -> HubConfig {
    HubConfig {
        heartbeat_timeout: Duration::from_millis(1000),
        sweep_interval: Duration::from_millis(100),
        ..HubConfig::for_testing()
    }
}

fn sweeping_hub() -> TestHub {
    TestHub::spawn_with(sweeping_config(), MockEngineFactory::new())
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_expired_with_its_sessions() {
    let hub = sweeping_hub();
    hub.add("a", "k1", HASH_X).await;
    assert!(hub.stats().await.engine_running);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let stats = hub.stats().await;
    assert_eq!(stats.clients, 0);
    assert!(stats.sessions.is_empty());
    assert!(!stats.engine_running);
    assert_eq!(hub.factory.destroy_calls(content(HASH_X)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_client_alive() {
    let hub = sweeping_hub();
    hub.add("a", "k1", HASH_X).await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_ok!(hub.handle.heartbeat("a").await);
    }
    assert_eq!(hub.stats().await.sessions.len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(hub.stats().await.sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_expiry_only_drops_the_silent_subscriber() {
    let hub = sweeping_hub();
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_X).await;

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_ok!(hub.handle.heartbeat("b").await);
    }

    let stats = hub.stats().await;
    assert_eq!(stats.clients, 1);
    let session = stats.session(content(HASH_X)).unwrap();
    assert_eq!(session.subscriptions.len(), 1);
    assert_eq!(session.subscriptions[0].client_key.as_str(), "b");
    assert_eq!(hub.factory.destroy_calls(content(HASH_X)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sweep_sends_update_to_every_subscriber() {
    let mut hub = sweeping_hub();
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_X).await;
    hub.drain().await;

    let first = hub.next_of("update").await;
    let second = hub.next_of("update").await;

    let mut clients = vec![
        first.client_key().to_string(),
        second.client_key().to_string(),
    ];
    clients.sort();
    assert_eq!(clients, vec!["a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_never_expires() {
    let config = HubConfig {
        heartbeat_timeout: Duration::ZERO,
        ..sweeping_config()
    };
    let hub = TestHub::spawn_with(config, MockEngineFactory::new());
    hub.add("a", "k1", HASH_X).await;

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(hub.stats().await.sessions.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_destroy() {
    let hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;

    assert_ok!(
        hub.handle
            .destroy("a", Some(Duration::from_millis(500)))
            .await
    );
    assert_eq!(hub.stats().await.sessions.len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stats = hub.stats().await;
    assert!(stats.sessions.is_empty());
    assert_eq!(stats.clients, 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_does_not_cancel_delayed_destroy() {
    let hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    assert_ok!(
        hub.handle
            .destroy("a", Some(Duration::from_millis(500)))
            .await
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ok!(hub.handle.heartbeat("a").await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(hub.stats().await.sessions.is_empty());
}

#[tokio::test]
async fn test_unknown_heartbeat_is_ignored() {
    let mut hub = TestHub::spawn();

    assert_ok!(hub.handle.heartbeat("ghost").await);

    assert!(hub.drain().await.is_empty());
    assert_eq!(hub.stats().await.clients, 0);
}
