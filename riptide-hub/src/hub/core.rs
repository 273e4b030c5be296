//! Core hub state machine run inside the actor.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::HubEvent;
use super::commands::{HubStats, SessionSummary};
use crate::HubError;
use crate::clients::ClientRegistry;
use crate::config::HubConfig;
use crate::content::{ClientKey, ContentId, TorrentKey};
use crate::endpoint::EnsureOutcome;
use crate::engine::{
    AddOptions, Endpoint, EndpointOptions, EngineFactory, SessionId, TorrentError,
};
use crate::protocol::{ClientMessage, DestroyOptions, ErrorPayload, SharedSink};
use crate::relay::EventRelay;
use crate::sessions::{
    DestroyedSession, EndpointWaiter, Session, SessionRegistry, Subscription, WaiterPurpose,
};

/// All mutable hub state.
///
/// Not thread-safe on purpose: the actor is its only owner and feeds it one
/// message at a time.
pub(crate) struct Hub {
    pub(crate) config: HubConfig,
    pub(crate) clients: ClientRegistry,
    pub(crate) sessions: SessionRegistry,
    pub(crate) relay: EventRelay,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl Hub {
    pub(crate) fn new(
        config: HubConfig,
        factory: Arc<dyn EngineFactory>,
        sink: SharedSink,
        events: mpsc::UnboundedSender<HubEvent>,
    ) -> Self {
        Self {
            config,
            clients: ClientRegistry::new(),
            sessions: SessionRegistry::new(factory, events.clone()),
            relay: EventRelay::new(sink),
            events,
        }
    }

    /// Processes one control message from a client.
    pub(crate) fn handle_message(&mut self, message: ClientMessage, now: Instant) {
        let client_key = message.client_key().clone();

        if let ClientMessage::Heartbeat { .. } = message {
            if !self.clients.refresh(&client_key, now) {
                let error = HubError::UnknownClient { client_key };
                tracing::warn!("Skipping heartbeat: {}", error);
            }
            return;
        }
        self.clients.touch(&client_key, now);

        match message {
            ClientMessage::Subscribe {
                torrent_key,
                torrent_id,
                ..
            } => self.subscribe(Subscription::new(client_key, torrent_key), &torrent_id),
            ClientMessage::AddTorrent {
                torrent_key,
                torrent_id,
                options,
                ..
            } => self.add_torrent(
                Subscription::new(client_key, torrent_key),
                &torrent_id,
                options,
            ),
            ClientMessage::CreateServer {
                torrent_key,
                options,
                ..
            } => self.create_server(client_key, torrent_key, options),
            ClientMessage::Destroy { options, .. } => self.destroy(client_key, options),
            ClientMessage::Heartbeat { .. } => {}
        }
    }

    /// Processes one internal event.
    pub(crate) fn handle_event(&mut self, event: HubEvent, now: Instant) {
        match event {
            HubEvent::Engine(event) => {
                let clients = self.clients.keys();
                self.relay.broadcast_engine_event(&clients, event);
            }
            HubEvent::Session { session, event } => match self.sessions.get_mut(session) {
                Some(target) => {
                    let deferred = self.relay.relay_session_event(
                        target,
                        event,
                        now,
                        self.config.progress_throttle,
                    );
                    if let Some((kind, wait)) = deferred {
                        let events = self.events.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(wait).await;
                            let _ = events.send(HubEvent::ProgressDue { session, kind });
                        });
                    }
                }
                None => tracing::debug!("Dropping {:?} for destroyed {}", event, session),
            },
            HubEvent::ProgressDue { session, kind } => {
                if let Some(target) = self.sessions.get_mut(session) {
                    if target.throttle_mut().take_pending(kind, now) {
                        self.relay.send_progress(target, kind);
                    }
                }
            }
            HubEvent::EndpointSettled { session, result } => self.settle_endpoint(session, result),
            HubEvent::DisconnectDue { client_key } => {
                tracing::debug!("Delayed destroy for client {} is due", client_key);
                self.disconnect(&client_key);
            }
        }
    }

    fn subscribe(&mut self, subscription: Subscription, torrent_id: &str) {
        let content_id = match ContentId::from_identifier(torrent_id) {
            Ok(content_id) => content_id,
            Err(e) => {
                tracing::warn!("Subscribe from {}: {}", subscription.client_key, e);
                self.relay.subscribed(&subscription, None);
                return;
            }
        };

        let previous = self
            .sessions
            .binding(&subscription.client_key, &subscription.torrent_key);
        match self.sessions.subscribe(subscription.clone(), content_id) {
            Some((session, state)) => {
                self.release_previous(previous, session, &subscription);
                self.relay.subscribed(&subscription, Some(state));
            }
            None => {
                tracing::debug!("No session for {} to subscribe to", content_id);
                self.relay.subscribed(&subscription, None);
            }
        }
    }

    fn add_torrent(&mut self, subscription: Subscription, torrent_id: &str, options: AddOptions) {
        let content_id = match ContentId::from_identifier(torrent_id) {
            Ok(content_id) => content_id,
            Err(e) => {
                self.reject(&subscription, &e);
                return;
            }
        };

        let previous = self
            .sessions
            .binding(&subscription.client_key, &subscription.torrent_key);
        let added = match self
            .sessions
            .add(subscription.clone(), content_id, torrent_id, &options)
        {
            Ok(added) => added,
            Err(e) => {
                self.reject(&subscription, &e);
                return;
            }
        };
        self.release_previous(previous, added.session, &subscription);

        if options.server {
            let waiter = EndpointWaiter {
                subscription,
                purpose: WaiterPurpose::AddCompleted,
            };
            self.ensure_endpoint(added.session, options.server_options, waiter);
        } else if let Some(session) = self.sessions.get(added.session) {
            self.relay.subscribed(&subscription, Some(session.state()));
        }
    }

    fn create_server(
        &mut self,
        client_key: ClientKey,
        torrent_key: TorrentKey,
        options: EndpointOptions,
    ) {
        let Some(session) = self.sessions.find_by_torrent_key(&client_key, &torrent_key) else {
            let error = HubError::UnknownSession {
                torrent_key: torrent_key.clone(),
            };
            tracing::warn!("Create server from {}: {}", client_key, error);
            self.relay.warn(
                &client_key,
                Some(&torrent_key),
                ErrorPayload::new(error.to_string()),
            );
            return;
        };

        let waiter = EndpointWaiter {
            subscription: Subscription::new(client_key, torrent_key),
            purpose: WaiterPurpose::ServerReady,
        };
        self.ensure_endpoint(session, options, waiter);
    }

    fn destroy(&mut self, client_key: ClientKey, options: DestroyOptions) {
        match options.delay() {
            Some(delay) => {
                tracing::debug!("Destroying client {} in {:?}", client_key, delay);
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = events.send(HubEvent::DisconnectDue { client_key });
                });
            }
            None => self.disconnect(&client_key),
        }
    }

    /// Drops a client and everything only it kept alive.
    pub(crate) fn disconnect(&mut self, client_key: &ClientKey) {
        tracing::debug!("Disconnecting client {}", client_key);
        self.clients.remove(client_key);
        let destroyed = self.sessions.remove_client(client_key);
        self.finish_destroyed(destroyed);
    }

    /// Creates the engine without adding a torrent.
    pub(crate) fn ensure_engine(&mut self) -> Result<(), HubError> {
        self.sessions.ensure_engine()?;
        Ok(())
    }

    /// Destroys every session and the engine.
    pub(crate) fn shutdown(&mut self) {
        tracing::debug!("Shutting down hub with {} sessions", self.sessions.len());
        let destroyed = self.sessions.destroy_all();
        self.finish_destroyed(destroyed);
    }

    pub(crate) fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            engine_running: self.sessions.engine_running(),
            sessions: self
                .sessions
                .sessions()
                .into_iter()
                .map(|session| SessionSummary {
                    content_id: session.content_id(),
                    subscriptions: session.subscriptions().to_vec(),
                    server_url: session.endpoint_url().map(str::to_string),
                    endpoint_pending: session.endpoint_pending(),
                })
                .collect(),
        }
    }

    fn ensure_endpoint(
        &mut self,
        session: SessionId,
        options: EndpointOptions,
        waiter: EndpointWaiter,
    ) {
        let Some(target) = self.sessions.get_mut(session) else {
            return;
        };

        match target.endpoint_mut().ensure(waiter) {
            EnsureOutcome::Ready { url, waiter } => {
                notify_waiter(&self.relay, Some(&*target), waiter, &Ok(url));
            }
            EnsureOutcome::Queued => {
                tracing::debug!("Server for {} already pending", target.content_id());
            }
            EnsureOutcome::Start => {
                tracing::debug!("Creating server for {}", target.content_id());
                let backend = target.backend();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = backend.create_endpoint(options).await;
                    let _ = events.send(HubEvent::EndpointSettled { session, result });
                });
            }
        }
    }

    fn settle_endpoint(
        &mut self,
        session: SessionId,
        result: Result<Box<dyn Endpoint>, TorrentError>,
    ) {
        let Some(target) = self.sessions.get_mut(session) else {
            if let Ok(endpoint) = result {
                tracing::debug!("Closing server {} of destroyed {}", endpoint.url(), session);
                endpoint.close();
            }
            return;
        };

        let Some(settled) = target.endpoint_mut().settle(result) else {
            return;
        };
        match &settled.outcome {
            Ok(url) => tracing::debug!("Server for {} ready at {}", target.content_id(), url),
            Err(e) => tracing::warn!("Server for {} failed: {}", target.content_id(), e),
        }

        for waiter in settled.waiters {
            notify_waiter(&self.relay, Some(&*target), waiter, &settled.outcome);
        }
    }

    /// Moves a `(client, torrentKey)` pair off the session it was bound to
    /// before it was bound to `current`.
    fn release_previous(
        &mut self,
        previous: Option<SessionId>,
        current: SessionId,
        subscription: &Subscription,
    ) {
        let Some(previous) = previous.filter(|id| *id != current) else {
            return;
        };
        tracing::debug!(
            "Rebinding {}/{} from {} to {}",
            subscription.client_key,
            subscription.torrent_key,
            previous,
            current
        );
        if let Some(destroyed) = self.sessions.detach(previous, subscription) {
            self.finish_destroyed(vec![destroyed]);
        }
    }

    /// Tells waiters of destroyed sessions their endpoint is not coming.
    fn finish_destroyed(&self, destroyed: Vec<DestroyedSession>) {
        for session in destroyed {
            let cancelled = TorrentError::EndpointCancelled {
                content_id: session.content_id,
            };
            for waiter in session.cancelled {
                notify_waiter(&self.relay, None, waiter, &Err(cancelled.clone()));
            }
        }
    }

    fn reject(&self, subscription: &Subscription, error: &TorrentError) {
        tracing::warn!(
            "Add torrent {}/{} failed: {}",
            subscription.client_key,
            subscription.torrent_key,
            error
        );
        self.relay.error(
            &subscription.client_key,
            Some(&subscription.torrent_key),
            ErrorPayload::new(error.to_string()),
        );
    }
}

/// Answers one endpoint waiter exactly once.
fn notify_waiter(
    relay: &EventRelay,
    session: Option<&Session>,
    waiter: EndpointWaiter,
    outcome: &Result<String, TorrentError>,
) {
    let subscription = &waiter.subscription;
    match outcome {
        Ok(url) => {
            relay.server_ready(subscription, url.clone());
            if waiter.purpose == WaiterPurpose::AddCompleted {
                relay.subscribed(subscription, session.map(Session::state));
            }
        }
        Err(e) => relay.error(
            &subscription.client_key,
            Some(&subscription.torrent_key),
            ErrorPayload::new(e.to_string()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EndpointBehavior, MockEngineFactory, SessionEvent};
    use crate::protocol::{HubMessage, channel_sink};

    const HASH_X: &str = "0123456789abcdef0123456789abcdef01234567";
    const HASH_Y: &str = "fedcba9876543210fedcba9876543210fedcba98";

    struct Fixture {
        hub: Hub,
        factory: MockEngineFactory,
        outbox: mpsc::UnboundedReceiver<HubMessage>,
        events: mpsc::UnboundedReceiver<HubEvent>,
    }

    impl Fixture {
        fn new(factory: MockEngineFactory) -> Self {
            let (sink_tx, outbox) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            let hub = Hub::new(
                HubConfig::for_testing(),
                Arc::new(factory.clone()),
                channel_sink(sink_tx),
                events_tx,
            );
            Self {
                hub,
                factory,
                outbox,
                events,
            }
        }

        fn send(&mut self, message: ClientMessage) {
            self.hub.handle_message(message, Instant::now());
        }

        fn add(&mut self, client: &str, key: &str, hash: &str, server: bool) {
            self.send(ClientMessage::AddTorrent {
                client_key: client.into(),
                torrent_key: key.into(),
                torrent_id: hash.to_string(),
                options: AddOptions {
                    server,
                    ..Default::default()
                },
            });
        }

        fn create_server(&mut self, client: &str, key: &str) {
            self.send(ClientMessage::CreateServer {
                client_key: client.into(),
                torrent_key: key.into(),
                options: EndpointOptions::default(),
            });
        }

        /// Feeds the next internal event back into the hub.
        async fn pump(&mut self) {
            let event = self.events.recv().await.unwrap();
            self.hub.handle_event(event, Instant::now());
        }

        fn drain(&mut self) -> Vec<HubMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbox.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn content(hash: &str) -> ContentId {
        ContentId::from_identifier(hash).unwrap()
    }

    #[tokio::test]
    async fn test_add_without_server_reports_snapshot() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, false);

        let messages = fx.drain();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            HubMessage::TorrentSubscribed {
                client_key,
                torrent: Some(state),
                ..
            } => {
                assert_eq!(client_key.as_str(), "a");
                assert_eq!(state.info_hash, content(HASH_X));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_add_with_server_completes_after_endpoint() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, true);
        assert!(fx.drain().is_empty());

        fx.pump().await;
        let messages = fx.drain();
        let kinds: Vec<&str> = messages.iter().map(HubMessage::kind).collect();
        assert_eq!(kinds, vec!["server-ready", "torrent-subscribed"]);
        match &messages[1] {
            HubMessage::TorrentSubscribed {
                torrent: Some(state),
                ..
            } => assert_eq!(state.server_url.as_deref(), Some("http://localhost:9000")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_create_server_runs_once() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, false);
        fx.add("b", "t2", HASH_X, false);
        fx.drain();

        fx.create_server("a", "t1");
        fx.create_server("b", "t2");
        fx.create_server("a", "t1");
        fx.pump().await;

        let messages = fx.drain();
        let ready: Vec<(&str, &str)> = messages
            .iter()
            .filter_map(|m| match m {
                HubMessage::ServerReady {
                    client_key,
                    server_url,
                    ..
                } => Some((client_key.as_str(), server_url.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(
            ready,
            vec![
                ("a", "http://localhost:9000"),
                ("b", "http://localhost:9000"),
                ("a", "http://localhost:9000"),
            ]
        );
        assert_eq!(fx.factory.endpoint_calls(content(HASH_X)), 1);

        // Later requests are answered from the ready endpoint
        fx.create_server("b", "t2");
        assert_eq!(fx.drain().len(), 1);
        assert_eq!(fx.factory.endpoint_calls(content(HASH_X)), 1);
    }

    #[tokio::test]
    async fn test_create_server_for_unknown_key_warns() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.create_server("a", "missing");

        let messages = fx.drain();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            HubMessage::Warning {
                torrent_key, error, ..
            } => {
                assert_eq!(torrent_key.as_ref().map(TorrentKey::as_str), Some("missing"));
                assert!(error.message.contains("missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.hub.sessions.engine_running());
    }

    #[tokio::test]
    async fn test_endpoint_failure_notifies_all_waiters() {
        let factory =
            MockEngineFactory::with_endpoint_behavior(EndpointBehavior::Fail("port busy".into()));
        let mut fx = Fixture::new(factory);
        fx.add("a", "t1", HASH_X, true);
        fx.create_server("a", "t1");
        fx.pump().await;

        let messages = fx.drain();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.kind() == "error"));
        assert!(!fx.hub.stats().sessions[0].endpoint_pending);
    }

    #[tokio::test]
    async fn test_destroy_while_pending_cancels_waiters() {
        let factory = MockEngineFactory::with_endpoint_behavior(EndpointBehavior::Gated);
        let mut fx = Fixture::new(factory.clone());
        fx.add("a", "t1", HASH_X, true);
        fx.create_server("a", "t1");

        fx.send(ClientMessage::Destroy {
            client_key: "a".into(),
            options: DestroyOptions::default(),
        });
        let messages = fx.drain();
        assert_eq!(messages.len(), 2);
        for message in &messages {
            match message {
                HubMessage::Error { error, .. } => assert!(error.message.contains("cancelled")),
                other => panic!("unexpected {other:?}"),
            }
        }

        // The endpoint finishing late is closed instead of leaking
        factory.release_endpoints();
        fx.pump().await;
        assert!(fx.drain().is_empty());
        assert_eq!(factory.closed_endpoints(), vec!["http://localhost:9000".to_string()]);
    }

    #[tokio::test]
    async fn test_session_events_fan_out_with_own_keys() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, false);
        fx.add("b", "t7", HASH_X, false);
        fx.drain();

        fx.factory.emit(content(HASH_X), SessionEvent::Metadata);
        fx.pump().await;

        let routed: Vec<(String, String)> = fx
            .drain()
            .into_iter()
            .map(|m| {
                assert_eq!(m.kind(), "metadata");
                (
                    m.client_key().to_string(),
                    m.torrent_key().map(ToString::to_string).unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            routed,
            vec![
                ("a".to_string(), "t1".to_string()),
                ("b".to_string(), "t7".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_events_after_destruction_are_dropped() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, false);
        fx.send(ClientMessage::Destroy {
            client_key: "a".into(),
            options: DestroyOptions::default(),
        });
        fx.drain();

        fx.factory.emit(content(HASH_X), SessionEvent::Done);
        fx.pump().await;
        assert!(fx.drain().is_empty());
    }

    #[tokio::test]
    async fn test_rebinding_key_releases_old_session() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", HASH_X, false);
        fx.add("a", "t1", HASH_Y, false);

        let stats = fx.hub.stats();
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.sessions[0].content_id, content(HASH_Y));
        assert_eq!(fx.factory.destroy_calls(content(HASH_X)), 1);
        assert!(stats.engine_running);
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_client_is_dropped() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.send(ClientMessage::Heartbeat {
            client_key: "ghost".into(),
        });

        assert_eq!(fx.hub.stats().clients, 0);
        assert!(fx.drain().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_identifier() {
        let mut fx = Fixture::new(MockEngineFactory::new());
        fx.add("a", "t1", "not-a-torrent", false);
        fx.send(ClientMessage::Subscribe {
            client_key: "a".into(),
            torrent_key: "t2".into(),
            torrent_id: "not-a-torrent".to_string(),
        });

        let kinds: Vec<&str> = fx.drain().iter().map(HubMessage::kind).collect();
        assert_eq!(kinds, vec!["error", "torrent-subscribed"]);
        assert_eq!(fx.factory.engines_created(), 0);
    }
}
