//! Full runs of the hub on the simulated engine.

use std::time::Duration;

use riptide_hub::HubConfig;
use riptide_hub::engine::EndpointOptions;
use riptide_sim::{SimulatedEngineFactory, SimulationConfig};
use tokio_test::assert_ok;

use crate::support::{HASH_X, MAGNET_X, TestHub, json};

fn simulated_hub() -> TestHub<SimulatedEngineFactory> {
    let simulation = SimulationConfig {
        tick_interval: Duration::from_millis(10),
        ..SimulationConfig::deterministic_testing()
    };
    TestHub::spawn_with(
        HubConfig::for_testing(),
        SimulatedEngineFactory::new(simulation),
    )
}

#[tokio::test]
async fn test_torrent_downloads_to_completion() {
    let mut hub = simulated_hub();
    hub.add("a", "k1", HASH_X).await;

    let subscribed = json(&hub.next_of("torrent-subscribed").await);
    assert_eq!(subscribed["torrent"]["infoHash"], HASH_X);

    let metadata = json(&hub.next_of("metadata").await);
    assert_eq!(metadata["torrent"]["name"], "sim-01234567");
    assert_eq!(metadata["torrent"]["files"].as_array().unwrap().len(), 3);

    let done = json(&hub.next_of("done").await);
    assert_eq!(done["torrent"]["progress"], 1.0);
    assert_eq!(done["torrent"]["downloaded"], done["torrent"]["length"]);
}

#[tokio::test]
async fn test_second_client_shares_simulated_transfer() {
    let mut hub = simulated_hub();
    hub.add("a", "k1", HASH_X).await;
    hub.next_of("metadata").await;

    hub.add("b", "k2", MAGNET_X).await;
    let subscribed = json(&hub.next_of("torrent-subscribed").await);
    assert_eq!(subscribed["clientKey"], "b");
    assert_eq!(subscribed["torrent"]["name"], "sim-01234567");

    let mut done_for = Vec::new();
    while done_for.len() < 2 {
        let done = hub.next_of("done").await;
        done_for.push(done.client_key().to_string());
    }
    done_for.sort();
    assert_eq!(done_for, vec!["a", "b"]);
}

#[tokio::test]
async fn test_endpoint_serves_torrent_until_destroyed() {
    let mut hub = simulated_hub();
    hub.add("a", "k1", HASH_X).await;
    assert_ok!(
        hub.handle
            .create_server("a", "k1", EndpointOptions::default())
            .await
    );
    let ready = json(&hub.next_of("server-ready").await);
    let url = ready["serverURL"].as_str().unwrap().to_string();
    assert!(url.starts_with("http://127.0.0.1:"));

    let index: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(index["infoHash"], HASH_X);

    assert_ok!(hub.handle.destroy("a", None).await);
    assert!(!hub.stats().await.engine_running);

    let mut refused = false;
    for _ in 0..50 {
        if reqwest::get(&url).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "endpoint still listening after destroy");
}
