//! Handle for communicating with the hub actor.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::commands::{HubCommand, HubStats};
use crate::HubError;
use crate::content::{ClientKey, TorrentKey};
use crate::engine::{AddOptions, EndpointOptions};
use crate::protocol::{self, ClientMessage, DestroyOptions};

/// Handle for communicating with the hub actor.
///
/// Cheap to clone; every transport feeding client messages into the hub
/// holds its own copy. Replies to client messages are not returned here but
/// delivered through the sink given to [`spawn_hub`](super::spawn_hub).
#[derive(Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub(crate) fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    /// Queues a client message for processing.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn send(&self, message: ClientMessage) -> Result<(), HubError> {
        self.sender
            .send(HubCommand::Message { message })
            .await
            .map_err(|_| HubError::HubShutdown)
    }

    /// Decodes a raw JSON control message and queues it.
    ///
    /// # Errors
    /// - `HubError::Protocol` - Unknown `type` or malformed payload
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn dispatch_json(&self, raw: &str) -> Result<(), HubError> {
        let message = protocol::decode_client_message(raw).inspect_err(|e| {
            tracing::warn!("Rejecting client message: {}", e);
        })?;
        self.send(message).await
    }

    /// Attaches to an existing session without creating anything.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn subscribe(
        &self,
        client_key: impl Into<ClientKey>,
        torrent_key: impl Into<TorrentKey>,
        torrent_id: impl Into<String>,
    ) -> Result<(), HubError> {
        self.send(ClientMessage::Subscribe {
            client_key: client_key.into(),
            torrent_key: torrent_key.into(),
            torrent_id: torrent_id.into(),
        })
        .await
    }

    /// Adds a torrent, reusing an existing session for the same content.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn add_torrent(
        &self,
        client_key: impl Into<ClientKey>,
        torrent_key: impl Into<TorrentKey>,
        torrent_id: impl Into<String>,
        options: AddOptions,
    ) -> Result<(), HubError> {
        self.send(ClientMessage::AddTorrent {
            client_key: client_key.into(),
            torrent_key: torrent_key.into(),
            torrent_id: torrent_id.into(),
            options,
        })
        .await
    }

    /// Requests the streaming endpoint of the session bound to `torrent_key`.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn create_server(
        &self,
        client_key: impl Into<ClientKey>,
        torrent_key: impl Into<TorrentKey>,
        options: EndpointOptions,
    ) -> Result<(), HubError> {
        self.send(ClientMessage::CreateServer {
            client_key: client_key.into(),
            torrent_key: torrent_key.into(),
            options,
        })
        .await
    }

    /// Refreshes a client's liveness.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn heartbeat(&self, client_key: impl Into<ClientKey>) -> Result<(), HubError> {
        self.send(ClientMessage::Heartbeat {
            client_key: client_key.into(),
        })
        .await
    }

    /// Disconnects a client, optionally after `delay`.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn destroy(
        &self,
        client_key: impl Into<ClientKey>,
        delay: Option<Duration>,
    ) -> Result<(), HubError> {
        let delay = delay.map(|d| d.as_secs_f64() * 1000.0);
        self.send(ClientMessage::Destroy {
            client_key: client_key.into(),
            options: DestroyOptions { delay },
        })
        .await
    }

    /// Creates the engine ahead of the first `add-torrent`.
    ///
    /// # Errors
    /// - `HubError::Torrent` - The engine factory failed
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn ensure_engine(&self) -> Result<(), HubError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::EnsureEngine { responder })
            .await
            .map_err(|_| HubError::HubShutdown)?;

        rx.await.map_err(|_| HubError::HubShutdown)?
    }

    /// Gets a snapshot of clients, sessions and the engine.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor has stopped
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::GetStats { responder })
            .await
            .map_err(|_| HubError::HubShutdown)?;

        rx.await.map_err(|_| HubError::HubShutdown)
    }

    /// Destroys every session and the engine, then stops the actor.
    ///
    /// # Errors
    /// - `HubError::HubShutdown` - The actor had already stopped
    pub async fn shutdown(&self) -> Result<(), HubError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::Shutdown { responder })
            .await
            .map_err(|_| HubError::HubShutdown)?;

        rx.await.map_err(|_| HubError::HubShutdown)
    }

    /// Returns false once the actor has stopped.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
