//! Session sharing, cascading teardown and engine lifecycle.

use riptide_hub::engine::{MockEngineFactory, TorrentError};
use riptide_hub::{ClientKey, HubConfig, HubError, HubMessage, TorrentKey};
use tokio_test::assert_ok;

use crate::support::{HASH_X, HASH_Y, MAGNET_X, TestHub, content, json, kinds};

#[tokio::test]
async fn test_same_content_shares_one_session() {
    let mut hub = TestHub::spawn();

    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", MAGNET_X).await;
    let messages = hub.drain().await;

    assert_eq!(kinds(&messages), vec!["torrent-subscribed", "torrent-subscribed"]);
    for message in &messages {
        assert_eq!(json(message)["torrent"]["infoHash"], HASH_X);
    }

    let stats = hub.stats().await;
    assert_eq!(stats.sessions.len(), 1);
    assert_eq!(stats.subscription_count(), 2);
    assert_eq!(stats.clients, 2);
    assert_eq!(hub.factory.add_calls(content(HASH_X)), 1);
    assert_eq!(hub.factory.engines_created(), 1);
}

#[tokio::test]
async fn test_session_lives_until_last_subscriber_leaves() {
    let hub = TestHub::spawn();
    let x = content(HASH_X);
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_X).await;

    assert_ok!(hub.handle.destroy("a", None).await);
    let stats = hub.stats().await;
    let session = stats.session(x).unwrap();
    assert_eq!(session.subscriptions.len(), 1);
    assert_eq!(session.subscriptions[0].client_key, ClientKey::from("b"));
    assert_eq!(hub.factory.destroy_calls(x), 0);

    assert_ok!(hub.handle.destroy("b", None).await);
    let stats = hub.stats().await;
    assert!(stats.sessions.is_empty());
    assert!(!stats.engine_running);
    assert_eq!(stats.clients, 0);
    assert_eq!(hub.factory.destroy_calls(x), 1);
    assert_eq!(hub.factory.engines_destroyed(), 1);
}

#[tokio::test]
async fn test_subscribe_after_teardown_does_not_recreate() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    assert_ok!(hub.handle.destroy("a", None).await);
    hub.drain().await;

    assert_ok!(hub.handle.subscribe("b", "k1", HASH_X).await);
    let messages = hub.drain().await;

    assert_eq!(messages.len(), 1);
    assert!(matches!(
        &messages[0],
        HubMessage::TorrentSubscribed { torrent: None, .. }
    ));
    assert_eq!(hub.factory.engines_created(), 1);
    assert!(!hub.stats().await.engine_running);
}

#[tokio::test]
async fn test_subscribe_joins_existing_session() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.drain().await;

    assert_ok!(hub.handle.subscribe("b", "watching", MAGNET_X).await);
    let message = hub.next_of("torrent-subscribed").await;

    assert_eq!(message.client_key(), &ClientKey::from("b"));
    assert_eq!(message.torrent_key(), Some(&TorrentKey::from("watching")));
    assert_eq!(json(&message)["torrent"]["numPeers"], 3);
    assert_eq!(hub.stats().await.subscription_count(), 2);
    assert_eq!(hub.factory.add_calls(content(HASH_X)), 1);
}

#[tokio::test]
async fn test_reusing_torrent_key_moves_subscription() {
    let hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.add("a", "k1", HASH_Y).await;

    let stats = hub.stats().await;

    assert_eq!(stats.sessions.len(), 1);
    assert!(stats.session(content(HASH_Y)).is_some());
    assert_eq!(hub.factory.destroy_calls(content(HASH_X)), 1);
    // Engine stays up for the remaining session
    assert!(stats.engine_running);
    assert_eq!(hub.factory.engines_created(), 1);
}

#[tokio::test]
async fn test_repeated_add_is_idempotent() {
    let hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.add("a", "k1", HASH_X).await;

    let stats = hub.stats().await;

    assert_eq!(stats.subscription_count(), 1);
    assert_eq!(hub.factory.add_calls(content(HASH_X)), 1);
}

#[tokio::test]
async fn test_failed_add_reports_error_and_releases_engine() {
    let factory = MockEngineFactory::new();
    factory.fail_add_for(content(HASH_X));
    let mut hub = TestHub::spawn_with(HubConfig::for_testing(), factory);

    hub.add("a", "k1", HASH_X).await;
    let messages = hub.drain().await;

    assert_eq!(kinds(&messages), vec!["error"]);
    assert_eq!(json(&messages[0])["torrentKey"], "k1");
    let stats = hub.stats().await;
    assert!(stats.sessions.is_empty());
    assert!(!stats.engine_running);
    assert_eq!(hub.factory.engines_destroyed(), 1);
}

#[tokio::test]
async fn test_invalid_identifier_is_reported_to_requester() {
    let mut hub = TestHub::spawn();

    hub.add("a", "k1", "magnet:?dn=no-hash").await;
    let message = hub.next().await;

    assert_eq!(message.kind(), "error");
    assert!(
        json(&message)["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Invalid torrent identifier")
    );
    assert_eq!(hub.factory.engines_created(), 0);
}

#[tokio::test]
async fn test_ensure_engine_creates_once() {
    let hub = TestHub::spawn();

    assert_ok!(hub.handle.ensure_engine().await);
    assert_ok!(hub.handle.ensure_engine().await);
    hub.add("a", "k1", HASH_X).await;

    assert!(hub.stats().await.engine_running);
    assert_eq!(hub.factory.engines_created(), 1);
}

#[tokio::test]
async fn test_engine_creation_failure_surfaces() {
    let factory = MockEngineFactory::new();
    factory.fail_engine_creation();
    let hub = TestHub::spawn_with(HubConfig::for_testing(), factory);

    let result = hub.handle.ensure_engine().await;

    assert!(matches!(
        result,
        Err(HubError::Torrent(TorrentError::EngineUnavailable { .. }))
    ));
}

#[tokio::test]
async fn test_shutdown_tears_everything_down() {
    let hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_Y).await;

    assert_ok!(hub.handle.shutdown().await);

    assert_eq!(hub.factory.engines_destroyed(), 1);
    assert_eq!(hub.factory.destroy_calls(content(HASH_X)), 1);
    assert_eq!(hub.factory.destroy_calls(content(HASH_Y)), 1);
    assert!(matches!(hub.handle.stats().await, Err(HubError::HubShutdown)));
}
