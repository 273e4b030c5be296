//! Actor owning all hub state.
//!
//! Inbound messages, engine callbacks, endpoint completions, delayed
//! disconnects and sweeper ticks are processed one at a time by a single
//! task, so no registry is ever observed half-updated.

mod actor;
mod commands;
mod core;
mod handle;

use std::fmt;

pub use actor::spawn_hub;
pub use commands::{HubStats, SessionSummary};
pub(crate) use self::core::Hub;
pub use handle::HubHandle;

use crate::content::ClientKey;
use crate::engine::{Endpoint, EngineEvent, SessionEvent, SessionId, TorrentError};
use crate::relay::ProgressKind;

/// Internal notifications funneled into the actor next to commands.
pub(crate) enum HubEvent {
    Engine(EngineEvent),
    Session {
        session: SessionId,
        event: SessionEvent,
    },
    EndpointSettled {
        session: SessionId,
        result: Result<Box<dyn Endpoint>, TorrentError>,
    },
    DisconnectDue {
        client_key: ClientKey,
    },
    /// A throttled progress stream's window closed
    ProgressDue {
        session: SessionId,
        kind: ProgressKind,
    },
}

impl fmt::Debug for HubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubEvent::Engine(event) => write!(f, "Engine({event:?})"),
            HubEvent::Session { session, event } => write!(f, "Session({session}, {event:?})"),
            HubEvent::EndpointSettled { session, result } => match result {
                Ok(endpoint) => write!(f, "EndpointSettled({session}, {})", endpoint.url()),
                Err(e) => write!(f, "EndpointSettled({session}, {e})"),
            },
            HubEvent::DisconnectDue { client_key } => write!(f, "DisconnectDue({client_key})"),
            HubEvent::ProgressDue { session, kind } => write!(f, "ProgressDue({session}, {kind:?})"),
        }
    }
}
