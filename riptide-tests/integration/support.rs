//! Shared fixtures for hub tests.

#![allow(dead_code)]

use std::time::Duration;

use riptide_hub::engine::{AddOptions, EngineFactory, MockEngineFactory};
use riptide_hub::protocol::channel_sink;
use riptide_hub::{ContentId, HubConfig, HubHandle, HubMessage, HubStats, spawn_hub};
use tokio::sync::mpsc;

pub const HASH_X: &str = "0123456789abcdef0123456789abcdef01234567";
pub const HASH_Y: &str = "fedcba9876543210fedcba9876543210fedcba98";
pub const MAGNET_X: &str =
    "magnet:?xt=urn:btih:0123456789ABCDEF0123456789ABCDEF01234567&dn=Sample&tr=udp%3A%2F%2Ftracker";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn content(identifier: &str) -> ContentId {
    ContentId::from_identifier(identifier).unwrap()
}

/// A spawned hub plus everything it sent.
pub struct TestHub<F = MockEngineFactory> {
    pub handle: HubHandle,
    pub factory: F,
    outbox: mpsc::UnboundedReceiver<HubMessage>,
}

impl TestHub<MockEngineFactory> {
    /// Hub with the mock engine and no background timers.
    pub fn spawn() -> Self {
        Self::spawn_with(HubConfig::for_testing(), MockEngineFactory::new())
    }
}

impl<F> TestHub<F>
where
    F: EngineFactory + Clone + 'static,
{
    pub fn spawn_with(config: HubConfig, factory: F) -> Self {
        let (sender, outbox) = mpsc::unbounded_channel();
        let handle = spawn_hub(config, factory.clone(), channel_sink(sender));
        Self {
            handle,
            factory,
            outbox,
        }
    }

    pub async fn add(&self, client: &str, key: &str, identifier: &str) {
        self.handle
            .add_torrent(client, key, identifier, AddOptions::default())
            .await
            .unwrap();
    }

    pub async fn add_with_server(&self, client: &str, key: &str, identifier: &str) {
        let options = AddOptions {
            server: true,
            ..Default::default()
        };
        self.handle
            .add_torrent(client, key, identifier, options)
            .await
            .unwrap();
    }

    pub async fn stats(&self) -> HubStats {
        self.handle.stats().await.unwrap()
    }

    /// Next outbound message, failing the test if none arrives.
    pub async fn next(&mut self) -> HubMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.outbox.recv())
            .await
            .expect("timed out waiting for a hub message")
            .expect("hub message sink closed")
    }

    /// Next outbound message of the given type, skipping others.
    pub async fn next_of(&mut self, kind: &str) -> HubMessage {
        loop {
            let message = self.next().await;
            if message.kind() == kind {
                return message;
            }
        }
    }

    /// Messages sent for every command queued so far.
    pub async fn drain(&mut self) -> Vec<HubMessage> {
        self.stats().await;
        let mut messages = Vec::new();
        while let Ok(message) = self.outbox.try_recv() {
            messages.push(message);
        }
        messages
    }
}

pub fn json(message: &HubMessage) -> serde_json::Value {
    serde_json::to_value(message).unwrap()
}

pub fn kinds(messages: &[HubMessage]) -> Vec<&'static str> {
    messages.iter().map(HubMessage::kind).collect()
}
