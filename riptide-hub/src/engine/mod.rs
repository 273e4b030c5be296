//! Torrent engine abstraction consumed by the hub.
//!
//! The hub never transfers data itself. It drives an engine through these
//! traits, which lets production, simulation and test engines share the
//! same multiplexer.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_mocks;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::content::ContentId;
use crate::hub::HubEvent;

#[cfg(any(test, feature = "test-utils"))]
pub use test_mocks::{EndpointBehavior, MockEngineFactory};

/// Errors reported by engines and by engine-facing hub operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid torrent identifier: {reason}")]
    InvalidIdentifier { reason: String },

    #[error("Failed to add torrent {content_id}: {reason}")]
    AddFailed { content_id: ContentId, reason: String },

    #[error("Failed to create server: {reason}")]
    EndpointFailed { reason: String },

    #[error("Server creation for {content_id} cancelled: torrent was destroyed")]
    EndpointCancelled { content_id: ContentId },

    #[error("Torrent engine unavailable: {reason}")]
    EngineUnavailable { reason: String },
}

/// Options accepted by `add-torrent`.
///
/// Unknown keys are passed to the engine untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOptions {
    /// Expose the torrent over a local endpoint before reporting completion
    #[serde(default)]
    pub server: bool,
    /// Endpoint options used when `server` is set
    #[serde(default)]
    pub server_options: EndpointOptions,
    /// Engine-specific options
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Options for exposing a session over a local endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOptions {
    /// Interface to bind, engine default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Port to bind, any free port when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// File entry within a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub length: u64,
}

/// Point-in-time status of one engine session.
///
/// Engines fill in what they know; metadata fields stay empty until the
/// torrent's metadata has been fetched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    /// Display name, once known
    pub name: Option<String>,
    /// Total content length in bytes
    pub total_length: u64,
    /// Files in the torrent
    pub files: Vec<FileEntry>,
    /// Completion ratio (0.0 to 1.0)
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    /// Download rate in bytes per second
    pub download_rate: u64,
    /// Upload rate in bytes per second
    pub upload_rate: u64,
    /// Uploaded divided by downloaded
    pub share_ratio: f64,
    pub peer_count: usize,
    /// Estimated milliseconds until completion
    pub time_remaining_ms: Option<u64>,
}

/// Warning or error raised by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineFault {
    pub message: String,
    pub stack: Option<String>,
}

impl EngineFault {
    /// Creates a fault without a backtrace.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl From<&TorrentError> for EngineFault {
    fn from(error: &TorrentError) -> Self {
        Self::new(error.to_string())
    }
}

/// Events raised by the engine as a whole.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Warning(EngineFault),
    Error(EngineFault),
}

/// Events raised by one engine session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Info hash resolved
    InfoHash,
    /// Metadata (name, files) fetched
    Metadata,
    /// Bytes were downloaded
    Download,
    /// Bytes were uploaded
    Upload,
    /// All pieces downloaded and verified
    Done,
    Warning(EngineFault),
    Error(EngineFault),
}

/// Identity the hub assigns to every session it creates.
///
/// Never reused, so events from a destroyed session cannot reach a newer
/// session for the same content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Channel through which an engine reports engine-wide events.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    sender: mpsc::UnboundedSender<HubEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(sender: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self { sender }
    }

    /// Reports an event. Silently dropped once the hub has stopped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(HubEvent::Engine(event));
    }
}

/// Channel through which an engine session reports its events.
#[derive(Debug, Clone)]
pub struct SessionEventSink {
    session: SessionId,
    sender: mpsc::UnboundedSender<HubEvent>,
}

impl SessionEventSink {
    pub(crate) fn new(session: SessionId, sender: mpsc::UnboundedSender<HubEvent>) -> Self {
        Self { session, sender }
    }

    /// Session this sink reports for.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Reports an event. Silently dropped once the hub has stopped.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(HubEvent::Session {
            session: self.session,
            event,
        });
    }
}

/// Creates the process-wide engine on first use.
pub trait EngineFactory: Send + Sync {
    /// Creates a new engine instance.
    ///
    /// # Errors
    /// - `TorrentError::EngineUnavailable` - Engine could not be started
    fn create(&self, events: EngineEventSink) -> Result<Box<dyn TorrentEngine>, TorrentError>;
}

/// A running torrent engine.
pub trait TorrentEngine: Send {
    /// Starts a transfer for the given identifier.
    ///
    /// # Errors
    /// - `TorrentError::AddFailed` - Engine rejected the torrent
    fn add(
        &mut self,
        content_id: ContentId,
        identifier: &str,
        options: &AddOptions,
        events: SessionEventSink,
    ) -> Result<Arc<dyn EngineSession>, TorrentError>;

    /// Stops the engine and releases its resources.
    fn destroy(&mut self);
}

/// One transfer inside an engine.
#[async_trait]
pub trait EngineSession: Send + Sync {
    /// Current status snapshot.
    fn status(&self) -> SessionStatus;

    /// Creates a local endpoint exposing this session and waits until it
    /// is listening.
    ///
    /// # Errors
    /// - `TorrentError::EndpointFailed` - Endpoint could not be bound
    async fn create_endpoint(
        &self,
        options: EndpointOptions,
    ) -> Result<Box<dyn Endpoint>, TorrentError>;

    /// Stops the transfer.
    fn destroy(&self);
}

/// A listening endpoint created by [`EngineSession::create_endpoint`].
pub trait Endpoint: Send + Sync {
    /// URL clients use to reach the endpoint.
    fn url(&self) -> String;

    /// Stops listening.
    fn close(&self);
}
