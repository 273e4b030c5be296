//! Riptide Hub - Shared torrent sessions for many remote clients
//!
//! Multiplexes one set of long-lived torrent sessions across independent
//! clients. Sessions are deduplicated by content identity, kept alive while
//! at least one client is subscribed, and torn down (together with the
//! engine) once the last interested client disconnects or stops sending
//! heartbeats.
//!
//! All state lives inside a single actor task; [`HubHandle`] is the
//! cloneable front door.

pub mod clients;
pub mod config;
pub mod content;
pub mod endpoint;
pub mod engine;
pub mod hub;
pub mod protocol;
pub mod relay;
pub mod sessions;
pub mod sweeper;

pub use config::HubConfig;
pub use content::{ClientKey, ContentId, TorrentKey};
pub use engine::{EngineFactory, EngineSession, TorrentEngine, TorrentError};
pub use hub::{HubHandle, HubStats, SessionSummary, spawn_hub};
pub use protocol::{ClientMessage, HubMessage, MessageSink, ProtocolError};

/// Top-level errors surfaced by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Unknown client: {client_key}")]
    UnknownClient { client_key: ClientKey },

    #[error("Missing torrentKey: {torrent_key}")]
    UnknownSession { torrent_key: TorrentKey },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Hub has shut down")]
    HubShutdown,
}

impl HubError {
    /// Returns true when the failure was caused by what a client sent.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            HubError::Protocol(_)
                | HubError::UnknownClient { .. }
                | HubError::UnknownSession { .. }
                | HubError::Torrent(TorrentError::InvalidIdentifier { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
