//! Raw JSON in, JSON out, and engine events relayed to clients.

use std::time::Duration;

use riptide_hub::engine::{EngineEvent, EngineFault, MockEngineFactory, SessionEvent, SessionStatus};
use riptide_hub::{HubConfig, HubError, ProtocolError};
use serde_json::json as object;

use crate::support::{HASH_X, HASH_Y, TestHub, content, json};

#[tokio::test]
async fn test_add_torrent_over_json() {
    let mut hub = TestHub::spawn();
    let raw = object!({
        "type": "add-torrent",
        "clientKey": "c1",
        "torrentKey": "t1",
        "torrentID": HASH_X,
        "options": { "announce": ["udp://tracker"] }
    });

    hub.handle.dispatch_json(&raw.to_string()).await.unwrap();
    let reply = json(&hub.next().await);

    assert_eq!(reply["type"], "torrent-subscribed");
    assert_eq!(reply["clientKey"], "c1");
    assert_eq!(reply["torrentKey"], "t1");
    assert_eq!(reply["torrent"]["infoHash"], HASH_X);
    assert_eq!(reply["torrent"]["serverURL"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_unknown_type_is_rejected() {
    let hub = TestHub::spawn();

    let result = hub
        .handle
        .dispatch_json(r#"{"type":"seek","clientKey":"c1"}"#)
        .await;

    match result {
        Err(e @ HubError::Protocol(ProtocolError::UnknownMessageType { .. })) => {
            assert!(e.is_client_error());
        }
        other => panic!("expected unknown message type, got {other:?}"),
    }
    assert_eq!(hub.stats().await.clients, 0);
}

#[tokio::test]
async fn test_malformed_message_is_rejected() {
    let hub = TestHub::spawn();

    for raw in [
        "not json",
        r#"{"clientKey":"c1"}"#,
        r#"{"type":"subscribe","clientKey":"c1"}"#,
    ] {
        let result = hub.handle.dispatch_json(raw).await;
        assert!(
            matches!(result, Err(HubError::Protocol(ProtocolError::Malformed { .. }))),
            "{raw} was accepted"
        );
    }
}

#[tokio::test]
async fn test_engine_warning_is_broadcast_to_every_client() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.add("b", "k2", HASH_Y).await;
    hub.drain().await;

    assert!(
        hub.factory
            .emit_engine(EngineEvent::Warning(EngineFault::new("tracker down")))
    );
    let warnings = [hub.next().await, hub.next().await];

    let mut clients = Vec::new();
    for warning in &warnings {
        let body = json(warning);
        assert_eq!(body["type"], "warning");
        assert_eq!(body["error"]["message"], "tracker down");
        assert!(body.get("torrentKey").is_none());
        clients.push(body["clientKey"].as_str().unwrap().to_string());
    }
    clients.sort();
    assert_eq!(clients, vec!["a", "b"]);
}

#[tokio::test]
async fn test_session_events_reach_each_subscriber_with_its_own_key() {
    let mut hub = TestHub::spawn();
    hub.add("a", "mine", HASH_X).await;
    hub.add("b", "theirs", HASH_X).await;
    hub.add("c", "other", HASH_Y).await;
    hub.drain().await;

    assert!(hub.factory.emit(content(HASH_X), SessionEvent::Metadata));
    let updates = [json(&hub.next().await), json(&hub.next().await)];

    let mut keys: Vec<(String, String)> = updates
        .iter()
        .map(|body| {
            assert_eq!(body["type"], "metadata");
            (
                body["clientKey"].as_str().unwrap().to_string(),
                body["torrentKey"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    keys.sort();
    assert_eq!(keys, vec![
        ("a".to_string(), "mine".to_string()),
        ("b".to_string(), "theirs".to_string()),
    ]);
    assert!(hub.drain().await.is_empty());
}

#[tokio::test]
async fn test_session_error_carries_torrent_key() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.drain().await;

    let mut fault = EngineFault::new("piece verification failed");
    fault.stack = Some("at verify()".to_string());
    assert!(hub.factory.emit(content(HASH_X), SessionEvent::Error(fault)));
    let body = json(&hub.next().await);

    assert_eq!(body["type"], "error");
    assert_eq!(body["torrentKey"], "k1");
    assert_eq!(body["error"]["stack"], "at verify()");
}

#[tokio::test]
async fn test_done_carries_progress_snapshot() {
    let mut hub = TestHub::spawn();
    hub.add("a", "k1", HASH_X).await;
    hub.drain().await;

    hub.factory.set_status(content(HASH_X), SessionStatus {
        name: Some("Sample".to_string()),
        total_length: 1024,
        progress: 1.0,
        bytes_downloaded: 1024,
        ..Default::default()
    });
    assert!(hub.factory.emit(content(HASH_X), SessionEvent::Done));
    let body = json(&hub.next().await);

    assert_eq!(body["type"], "done");
    assert_eq!(body["torrent"]["progress"], 1.0);
    assert_eq!(body["torrent"]["downloaded"], 1024);
}

fn downloaded(bytes: u64) -> SessionStatus {
    SessionStatus {
        total_length: 1000,
        bytes_downloaded: bytes,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_throttled_progress_is_flushed_when_window_closes() {
    let config = HubConfig {
        progress_throttle: Duration::from_millis(1000),
        ..HubConfig::for_testing()
    };
    let mut hub = TestHub::spawn_with(config, MockEngineFactory::new());
    hub.add("a", "k1", HASH_X).await;
    hub.drain().await;

    hub.factory.set_status(content(HASH_X), downloaded(100));
    assert!(hub.factory.emit(content(HASH_X), SessionEvent::Download));
    let leading = json(&hub.next().await);
    assert_eq!(leading["type"], "download");
    assert_eq!(leading["torrent"]["downloaded"], 100);

    for bytes in [200, 300] {
        hub.factory.set_status(content(HASH_X), downloaded(bytes));
        assert!(hub.factory.emit(content(HASH_X), SessionEvent::Download));
    }

    // One trailing message with the latest snapshot
    let trailing = json(&hub.next().await);
    assert_eq!(trailing["type"], "download");
    assert_eq!(trailing["torrent"]["downloaded"], 300);
    assert!(hub.drain().await.is_empty());
}
