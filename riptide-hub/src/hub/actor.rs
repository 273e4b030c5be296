//! Actor implementation for the hub.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::HubEvent;
use super::commands::HubCommand;
use super::core::Hub;
use super::handle::HubHandle;
use crate::config::HubConfig;
use crate::engine::EngineFactory;
use crate::protocol::SharedSink;
use crate::sweeper::Sweeper;

/// Spawns the hub actor and returns its handle.
///
/// The engine is not created here; the first `add-torrent` (or an explicit
/// [`HubHandle::ensure_engine`]) creates it through `factory`. Outbound
/// messages for every client are handed to `sink`.
///
/// # Examples
/// ```rust,no_run
/// use riptide_hub::engine::{EngineEventSink, EngineFactory, TorrentEngine, TorrentError};
/// use riptide_hub::protocol::channel_sink;
/// use riptide_hub::{HubConfig, spawn_hub};
///
/// struct NoBackend;
///
/// impl EngineFactory for NoBackend {
///     fn create(&self, _events: EngineEventSink) -> Result<Box<dyn TorrentEngine>, TorrentError> {
///         Err(TorrentError::EngineUnavailable {
///             reason: "no backend configured".to_string(),
///         })
///     }
/// }
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), riptide_hub::HubError> {
/// let (sender, _outbox) = tokio::sync::mpsc::unbounded_channel();
/// let handle = spawn_hub(HubConfig::default(), NoBackend, channel_sink(sender));
/// handle.heartbeat("client-1").await?;
/// # Ok(())
/// # }
/// ```
pub fn spawn_hub<F>(config: HubConfig, factory: F, sink: SharedSink) -> HubHandle
where
    F: EngineFactory + 'static,
{
    let (sender, receiver) = mpsc::channel(config.command_buffer.max(1));
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let hub = Hub::new(config, Arc::new(factory), sink, event_sender);

    tokio::spawn(async move {
        run_actor_loop(hub, receiver, event_receiver).await;
    });

    HubHandle::new(sender)
}

/// Runs the main actor loop.
///
/// Commands, internal events and sweeper ticks are processed one at a time.
/// The loop ends on a shutdown command or when every handle is dropped; both
/// destroy all sessions and the engine first.
async fn run_actor_loop(
    mut hub: Hub,
    mut receiver: mpsc::Receiver<HubCommand>,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
) {
    tracing::debug!("Hub actor started");
    let mut sweeper = Sweeper::new(&hub.config);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    tracing::debug!("All hub handles dropped");
                    hub.shutdown();
                    break;
                };
                if !handle_command(&mut hub, command) {
                    break;
                }
            }
            Some(event) = events.recv() => {
                hub.handle_event(event, Instant::now());
            }
            now = sweeper.tick() => {
                let report = hub.sweep(now);
                if !report.expired.is_empty() {
                    tracing::debug!("Sweep expired {} clients", report.expired.len());
                }
            }
        }
    }

    tracing::debug!("Hub actor stopped");
}

/// Handles a single command.
/// Returns true to continue processing, false to shutdown.
fn handle_command(hub: &mut Hub, command: HubCommand) -> bool {
    match command {
        HubCommand::Message { message } => {
            tracing::trace!("Client message {}", message.kind());
            hub.handle_message(message, Instant::now());
        }

        HubCommand::EnsureEngine { responder } => {
            let _ = responder.send(hub.ensure_engine());
        }

        HubCommand::GetStats { responder } => {
            let _ = responder.send(hub.stats());
        }

        HubCommand::Shutdown { responder } => {
            hub.shutdown();
            let _ = responder.send(());
            return false;
        }
    }

    true
}
