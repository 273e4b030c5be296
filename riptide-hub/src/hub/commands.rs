//! Command definitions for the hub actor.

use tokio::sync::oneshot;

use crate::HubError;
use crate::content::ContentId;
use crate::protocol::ClientMessage;
use crate::sessions::Subscription;

/// Commands that can be sent to the hub actor.
///
/// Queries carry a response channel; control messages from clients are
/// fire-and-forget because their answers travel through the message sink.
pub enum HubCommand {
    /// Process a control message from a remote client.
    Message { message: ClientMessage },
    /// Create the engine without adding a torrent.
    EnsureEngine {
        responder: oneshot::Sender<Result<(), HubError>>,
    },
    /// Snapshot of the hub's registries.
    GetStats { responder: oneshot::Sender<HubStats> },
    /// Destroy every session and the engine, then stop the actor.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Point-in-time view of the hub for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HubStats {
    /// Number of live clients
    pub clients: usize,
    /// Registered sessions in creation order
    pub sessions: Vec<SessionSummary>,
    /// Whether the engine instance exists
    pub engine_running: bool,
}

impl HubStats {
    /// Summary of the session for `content_id`, if registered.
    pub fn session(&self, content_id: ContentId) -> Option<&SessionSummary> {
        self.sessions.iter().find(|s| s.content_id == content_id)
    }

    /// Total subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions.iter().map(|s| s.subscriptions.len()).sum()
    }
}

/// One registered session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub content_id: ContentId,
    pub subscriptions: Vec<Subscription>,
    pub server_url: Option<String>,
    pub endpoint_pending: bool,
}
