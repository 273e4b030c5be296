//! Property tests: the hub's registries match a simple model after any
//! sequence of adds, subscribes and disconnects.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use riptide_hub::{ContentId, HubStats};

use crate::support::{TestHub, content};

#[derive(Debug, Clone)]
enum Op {
    Add { client: u8, key: u8, torrent: u8 },
    Subscribe { client: u8, key: u8, torrent: u8 },
    Destroy { client: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..3u8, 0..2u8, 0..3u8)
            .prop_map(|(client, key, torrent)| Op::Add { client, key, torrent }),
        2 => (0..3u8, 0..2u8, 0..3u8)
            .prop_map(|(client, key, torrent)| Op::Subscribe { client, key, torrent }),
        1 => (0..3u8).prop_map(|client| Op::Destroy { client }),
    ]
}

fn hash(torrent: u8) -> String {
    format!("{:040x}", u32::from(torrent) + 1)
}

/// Expected `(client, key) -> torrent` bindings.
fn model(ops: &[Op]) -> BTreeMap<(String, String), ContentId> {
    let mut bindings = BTreeMap::new();
    for op in ops {
        match op {
            Op::Add { client, key, torrent } => {
                bindings.insert((format!("c{client}"), format!("k{key}")), content(&hash(*torrent)));
            }
            Op::Subscribe { client, key, torrent } => {
                let target = content(&hash(*torrent));
                if bindings.values().any(|bound| *bound == target) {
                    bindings.insert((format!("c{client}"), format!("k{key}")), target);
                }
            }
            Op::Destroy { client } => {
                let client = format!("c{client}");
                bindings.retain(|(bound, _), _| *bound != client);
            }
        }
    }
    bindings
}

async fn apply(ops: &[Op]) -> (HubStats, usize) {
    let hub = TestHub::spawn();
    for op in ops {
        match op {
            Op::Add { client, key, torrent } => {
                hub.add(&format!("c{client}"), &format!("k{key}"), &hash(*torrent))
                    .await;
            }
            Op::Subscribe { client, key, torrent } => {
                hub.handle
                    .subscribe(format!("c{client}"), format!("k{key}"), hash(*torrent))
                    .await
                    .unwrap();
            }
            Op::Destroy { client } => {
                hub.handle.destroy(format!("c{client}"), None).await.unwrap();
            }
        }
    }
    let stats = hub.stats().await;
    (stats, hub.factory.engines_created())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_registries_match_model(ops in proptest::collection::vec(op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (stats, engines_created) = runtime.block_on(apply(&ops));
        let expected = model(&ops);

        let mut actual = BTreeMap::new();
        let mut contents = BTreeSet::new();
        for session in &stats.sessions {
            // One session per content, never empty
            prop_assert!(contents.insert(session.content_id));
            prop_assert!(!session.subscriptions.is_empty());
            for subscription in &session.subscriptions {
                let pair = (
                    subscription.client_key.to_string(),
                    subscription.torrent_key.to_string(),
                );
                prop_assert!(actual.insert(pair, session.content_id).is_none());
            }
        }

        prop_assert_eq!(actual, expected);
        prop_assert_eq!(stats.engine_running, !stats.sessions.is_empty());
        if !stats.sessions.is_empty() {
            prop_assert!(engines_created >= 1);
        }
    }
}
