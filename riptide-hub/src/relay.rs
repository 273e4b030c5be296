//! Translation of engine events into outbound client messages.
//!
//! Snapshots are computed once per event and copied to every subscriber,
//! each copy stamped with that subscriber's own client and torrent key.

use std::time::Duration;

use tokio::time::Instant;

use crate::content::{ClientKey, TorrentKey};
use crate::engine::{EngineEvent, SessionEvent};
use crate::protocol::{ErrorPayload, HubMessage, SharedSink, TorrentState};
use crate::sessions::{Session, Subscription};

/// Which progress stream an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Download,
    Upload,
}

/// Per-stream throttle state.
#[derive(Debug, Default)]
struct ThrottleWindow {
    last_sent: Option<Instant>,
    /// A suppressed event is waiting for the window to close
    pending: bool,
}

/// Outcome of [`ProgressThrottle::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttled {
    /// Send now
    Send,
    /// Suppressed; a trailing send is due after this wait
    Defer(Duration),
    /// Suppressed; a trailing send is already scheduled
    Coalesced,
}

/// Rate limit for `download` and `upload` messages of one session.
///
/// Fires on both edges: the first event of a window is sent at once, and
/// if more arrive inside the window one trailing message is sent when it
/// closes.
#[derive(Debug, Default)]
pub struct ProgressThrottle {
    download: ThrottleWindow,
    upload: ThrottleWindow,
}

impl ProgressThrottle {
    fn window_mut(&mut self, kind: ProgressKind) -> &mut ThrottleWindow {
        match kind {
            ProgressKind::Download => &mut self.download,
            ProgressKind::Upload => &mut self.upload,
        }
    }

    /// Decides what to do with a `kind` event at `now`. A zero `window`
    /// never throttles.
    pub fn check(&mut self, kind: ProgressKind, now: Instant, window: Duration) -> Throttled {
        if window.is_zero() {
            return Throttled::Send;
        }
        let state = self.window_mut(kind);
        match state.last_sent {
            Some(sent) if now.saturating_duration_since(sent) < window => {
                if state.pending {
                    Throttled::Coalesced
                } else {
                    state.pending = true;
                    Throttled::Defer(window - now.saturating_duration_since(sent))
                }
            }
            _ => {
                state.last_sent = Some(now);
                state.pending = false;
                Throttled::Send
            }
        }
    }

    /// Claims the trailing send for `kind`. Returns false if a leading send
    /// already covered it.
    pub fn take_pending(&mut self, kind: ProgressKind, now: Instant) -> bool {
        let state = self.window_mut(kind);
        if !state.pending {
            return false;
        }
        state.pending = false;
        state.last_sent = Some(now);
        true
    }
}

/// Outbound side of the hub.
pub struct EventRelay {
    sink: SharedSink,
}

impl EventRelay {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }

    pub fn send(&self, message: HubMessage) {
        self.sink.send(message);
    }

    /// Sends an engine-wide warning or error to every live client.
    pub fn broadcast_engine_event(&self, clients: &[ClientKey], event: EngineEvent) {
        let (is_error, payload) = match event {
            EngineEvent::Warning(fault) => (false, ErrorPayload::from(fault)),
            EngineEvent::Error(fault) => (true, ErrorPayload::from(fault)),
        };
        tracing::warn!(
            "Engine {}: {} (broadcast to {} clients)",
            if is_error { "error" } else { "warning" },
            payload.message,
            clients.len()
        );

        for client_key in clients {
            let message = if is_error {
                HubMessage::Error {
                    client_key: client_key.clone(),
                    torrent_key: None,
                    error: payload.clone(),
                }
            } else {
                HubMessage::Warning {
                    client_key: client_key.clone(),
                    torrent_key: None,
                    error: payload.clone(),
                }
            };
            self.sink.send(message);
        }
    }

    /// Relays a session event to all of the session's subscribers.
    ///
    /// `download`/`upload` events inside the throttle window are held back.
    /// Returns the stream and wait when the caller must schedule a trailing
    /// [`EventRelay::send_progress`].
    pub fn relay_session_event(
        &self,
        session: &mut Session,
        event: SessionEvent,
        now: Instant,
        throttle: Duration,
    ) -> Option<(ProgressKind, Duration)> {
        match event {
            SessionEvent::InfoHash => {
                let info = session.info();
                self.fan_out(session, |client_key, torrent_key| HubMessage::Infohash {
                    client_key,
                    torrent_key,
                    torrent: info.clone(),
                });
            }
            SessionEvent::Metadata => {
                let info = session.info();
                self.fan_out(session, |client_key, torrent_key| HubMessage::Metadata {
                    client_key,
                    torrent_key,
                    torrent: info.clone(),
                });
            }
            SessionEvent::Download | SessionEvent::Upload => {
                let kind = if matches!(event, SessionEvent::Download) {
                    ProgressKind::Download
                } else {
                    ProgressKind::Upload
                };
                let decision = session.throttle_mut().check(kind, now, throttle);
                match decision {
                    Throttled::Send => self.send_progress(session, kind),
                    Throttled::Defer(wait) => return Some((kind, wait)),
                    Throttled::Coalesced => {}
                }
            }
            SessionEvent::Done => {
                tracing::debug!("Torrent {} done", session.content_id());
                let progress = session.progress();
                self.fan_out(session, |client_key, torrent_key| HubMessage::Done {
                    client_key,
                    torrent_key,
                    torrent: progress.clone(),
                });
            }
            SessionEvent::Warning(fault) => {
                tracing::warn!("Torrent {} warning: {}", session.content_id(), fault.message);
                let payload = ErrorPayload::from(fault);
                self.fan_out(session, |client_key, torrent_key| HubMessage::Warning {
                    client_key,
                    torrent_key: Some(torrent_key),
                    error: payload.clone(),
                });
            }
            SessionEvent::Error(fault) => {
                tracing::warn!("Torrent {} error: {}", session.content_id(), fault.message);
                let payload = ErrorPayload::from(fault);
                self.fan_out(session, |client_key, torrent_key| HubMessage::Error {
                    client_key,
                    torrent_key: Some(torrent_key),
                    error: payload.clone(),
                });
            }
        }
        None
    }

    /// Sends a `download` or `upload` snapshot to every subscriber.
    pub fn send_progress(&self, session: &Session, kind: ProgressKind) {
        let progress = session.progress();
        match kind {
            ProgressKind::Download => {
                self.fan_out(session, |client_key, torrent_key| HubMessage::Download {
                    client_key,
                    torrent_key,
                    torrent: progress.clone(),
                })
            }
            ProgressKind::Upload => {
                self.fan_out(session, |client_key, torrent_key| HubMessage::Upload {
                    client_key,
                    torrent_key,
                    torrent: progress.clone(),
                })
            }
        }
    }

    /// Sends an `update` progress snapshot to every subscriber.
    pub fn send_update(&self, session: &Session) {
        let progress = session.progress();
        self.fan_out(session, |client_key, torrent_key| HubMessage::Update {
            client_key,
            torrent_key,
            torrent: progress.clone(),
        });
    }

    /// Builds one message per subscription of `session`.
    pub fn fan_out<F>(&self, session: &Session, build: F)
    where
        F: Fn(ClientKey, TorrentKey) -> HubMessage,
    {
        for subscription in session.subscriptions() {
            self.sink.send(build(
                subscription.client_key.clone(),
                subscription.torrent_key.clone(),
            ));
        }
    }

    pub fn subscribed(&self, subscription: &Subscription, torrent: Option<TorrentState>) {
        self.sink.send(HubMessage::TorrentSubscribed {
            client_key: subscription.client_key.clone(),
            torrent_key: subscription.torrent_key.clone(),
            torrent,
        });
    }

    pub fn server_ready(&self, subscription: &Subscription, server_url: String) {
        self.sink.send(HubMessage::ServerReady {
            client_key: subscription.client_key.clone(),
            torrent_key: subscription.torrent_key.clone(),
            server_url,
        });
    }

    /// Sends a `warning` to one client.
    pub fn warn(
        &self,
        client_key: &ClientKey,
        torrent_key: Option<&TorrentKey>,
        error: ErrorPayload,
    ) {
        self.sink.send(HubMessage::Warning {
            client_key: client_key.clone(),
            torrent_key: torrent_key.cloned(),
            error,
        });
    }

    /// Sends an `error` to one client.
    pub fn error(
        &self,
        client_key: &ClientKey,
        torrent_key: Option<&TorrentKey>,
        error: ErrorPayload,
    ) {
        self.sink.send(HubMessage::Error {
            client_key: client_key.clone(),
            torrent_key: torrent_key.cloned(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_window() {
        let mut throttle = ProgressThrottle::default();
        let start = Instant::now();
        let window = Duration::from_secs(1);

        assert_eq!(throttle.check(ProgressKind::Download, start, window), Throttled::Send);
        assert_eq!(
            throttle.check(ProgressKind::Download, start + Duration::from_millis(400), window),
            Throttled::Defer(Duration::from_millis(600))
        );
        assert_eq!(
            throttle.check(ProgressKind::Download, start + Duration::from_millis(500), window),
            Throttled::Coalesced
        );
        // Streams are throttled independently
        assert_eq!(
            throttle.check(ProgressKind::Upload, start + Duration::from_millis(500), window),
            Throttled::Send
        );
    }

    #[test]
    fn test_trailing_send_restarts_window() {
        let mut throttle = ProgressThrottle::default();
        let start = Instant::now();
        let window = Duration::from_secs(1);
        throttle.check(ProgressKind::Upload, start, window);
        throttle.check(ProgressKind::Upload, start + Duration::from_millis(200), window);

        let due = start + window;
        assert!(throttle.take_pending(ProgressKind::Upload, due));
        assert!(!throttle.take_pending(ProgressKind::Upload, due));
        assert_eq!(
            throttle.check(ProgressKind::Upload, due + Duration::from_millis(10), window),
            Throttled::Defer(Duration::from_millis(990))
        );
    }

    #[test]
    fn test_leading_send_cancels_trailing() {
        let mut throttle = ProgressThrottle::default();
        let start = Instant::now();
        let window = Duration::from_secs(1);
        throttle.check(ProgressKind::Download, start, window);
        throttle.check(ProgressKind::Download, start + Duration::from_millis(100), window);

        let later = start + Duration::from_secs(2);
        assert_eq!(throttle.check(ProgressKind::Download, later, window), Throttled::Send);
        assert!(!throttle.take_pending(ProgressKind::Download, later));
    }

    #[test]
    fn test_zero_window_never_throttles() {
        let mut throttle = ProgressThrottle::default();
        let now = Instant::now();

        for _ in 0..5 {
            assert_eq!(throttle.check(ProgressKind::Upload, now, Duration::ZERO), Throttled::Send);
        }
    }
}
