//! Session registry: one session per content, shared by many subscribers.
//!
//! The registry owns the engine instance and every session created through
//! it. A session lives exactly as long as it has at least one subscription;
//! the engine lives until the last session is gone.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::content::{ClientKey, ContentId, TorrentKey};
use crate::endpoint::EndpointState;
use crate::engine::{
    AddOptions, EngineEventSink, EngineFactory, EngineSession, SessionEventSink, SessionId,
    SessionStatus, TorrentEngine, TorrentError,
};
use crate::hub::HubEvent;
use crate::protocol::{TorrentInfo, TorrentProgress, TorrentState};
use crate::relay::ProgressThrottle;

/// Binding of one client's torrent key to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub client_key: ClientKey,
    pub torrent_key: TorrentKey,
}

impl Subscription {
    pub fn new(client_key: ClientKey, torrent_key: TorrentKey) -> Self {
        Self {
            client_key,
            torrent_key,
        }
    }
}

/// Why a client is waiting for a session's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterPurpose {
    /// `create-server`: answer with `server-ready`
    ServerReady,
    /// `add-torrent` with `server`: answer with `server-ready` then the
    /// subscription snapshot
    AddCompleted,
}

/// A client waiting for a session's endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointWaiter {
    pub subscription: Subscription,
    pub purpose: WaiterPurpose,
}

/// One live transfer shared by its subscribers.
pub struct Session {
    id: SessionId,
    content_id: ContentId,
    backend: Arc<dyn EngineSession>,
    subscriptions: Vec<Subscription>,
    endpoint: EndpointState<EndpointWaiter>,
    throttle: ProgressThrottle,
}

impl Session {
    fn new(id: SessionId, content_id: ContentId, backend: Arc<dyn EngineSession>) -> Self {
        Self {
            id,
            content_id,
            backend,
            subscriptions: Vec::new(),
            endpoint: EndpointState::Idle,
            throttle: ProgressThrottle::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Subscriptions in the order they were attached.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn endpoint_url(&self) -> Option<&str> {
        self.endpoint.url()
    }

    pub fn endpoint_pending(&self) -> bool {
        self.endpoint.is_pending()
    }

    pub fn backend(&self) -> Arc<dyn EngineSession> {
        self.backend.clone()
    }

    pub fn endpoint_mut(&mut self) -> &mut EndpointState<EndpointWaiter> {
        &mut self.endpoint
    }

    pub fn throttle_mut(&mut self) -> &mut ProgressThrottle {
        &mut self.throttle
    }

    pub fn has_subscription(&self, client_key: &ClientKey, torrent_key: &TorrentKey) -> bool {
        self.subscriptions
            .iter()
            .any(|s| &s.client_key == client_key && &s.torrent_key == torrent_key)
    }

    /// Info snapshot.
    pub fn info(&self) -> TorrentInfo {
        self.info_from(self.backend.status())
    }

    /// Progress snapshot.
    pub fn progress(&self) -> TorrentProgress {
        progress_from(&self.backend.status())
    }

    /// Info and progress from a single status read.
    pub fn state(&self) -> TorrentState {
        let status = self.backend.status();
        let progress = progress_from(&status);
        TorrentState::new(self.info_from(status), progress)
    }

    fn info_from(&self, status: SessionStatus) -> TorrentInfo {
        TorrentInfo {
            name: status.name,
            info_hash: self.content_id,
            length: status.total_length,
            server_url: self.endpoint.url().map(str::to_string),
            files: status.files,
        }
    }

    /// Attaches a subscription. Returns false if the exact pair was
    /// already attached.
    fn attach(&mut self, subscription: Subscription) -> bool {
        if self.has_subscription(&subscription.client_key, &subscription.torrent_key) {
            return false;
        }
        self.subscriptions.push(subscription);
        true
    }
}

fn progress_from(status: &SessionStatus) -> TorrentProgress {
    TorrentProgress {
        progress: status.progress,
        downloaded: status.bytes_downloaded,
        uploaded: status.bytes_uploaded,
        length: status.total_length,
        download_speed: status.download_rate,
        upload_speed: status.upload_rate,
        ratio: status.share_ratio,
        num_peers: status.peer_count,
        time_remaining: status.time_remaining_ms,
    }
}

/// Record of a session that was torn down.
#[derive(Debug)]
pub struct DestroyedSession {
    pub id: SessionId,
    pub content_id: ContentId,
    /// Waiters of an endpoint that never became ready
    pub cancelled: VecDeque<EndpointWaiter>,
}

/// Outcome of [`SessionRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Added {
    pub session: SessionId,
    /// True if a new engine session was started
    pub created: bool,
}

/// Sessions keyed by content, plus the engine that backs them.
pub struct SessionRegistry {
    factory: Arc<dyn EngineFactory>,
    engine: Option<Box<dyn TorrentEngine>>,
    sessions: HashMap<ContentId, Session>,
    routes: HashMap<SessionId, ContentId>,
    next_session_id: u64,
    events: mpsc::UnboundedSender<HubEvent>,
}

impl SessionRegistry {
    pub(crate) fn new(
        factory: Arc<dyn EngineFactory>,
        events: mpsc::UnboundedSender<HubEvent>,
    ) -> Self {
        Self {
            factory,
            engine: None,
            sessions: HashMap::new(),
            routes: HashMap::new(),
            next_session_id: 0,
            events,
        }
    }

    pub fn engine_running(&self) -> bool {
        self.engine.is_some()
    }

    /// Creates the engine if it does not exist yet.
    ///
    /// # Errors
    /// - `TorrentError::EngineUnavailable` - Factory could not start an engine
    pub fn ensure_engine(&mut self) -> Result<&mut Box<dyn TorrentEngine>, TorrentError> {
        let engine = match self.engine.take() {
            Some(engine) => engine,
            None => {
                tracing::debug!("Creating torrent engine");
                self.factory
                    .create(EngineEventSink::new(self.events.clone()))?
            }
        };
        Ok(self.engine.insert(engine))
    }

    /// Destroys the engine. Returns false if there was none.
    pub fn teardown_engine(&mut self) -> bool {
        match self.engine.take() {
            Some(mut engine) => {
                tracing::debug!("Destroying torrent engine");
                engine.destroy();
                true
            }
            None => false,
        }
    }

    /// Attaches to an existing session for `content_id`.
    ///
    /// Never creates the engine or a session. Returns the session's snapshot,
    /// or `None` if nothing matches.
    pub fn subscribe(
        &mut self,
        subscription: Subscription,
        content_id: ContentId,
    ) -> Option<(SessionId, TorrentState)> {
        let session = self.sessions.get_mut(&content_id)?;
        if !session.attach(subscription) {
            tracing::debug!("Subscription already attached to {}", content_id);
        }
        Some((session.id, session.state()))
    }

    /// Attaches to the session for `content_id`, starting one if needed.
    ///
    /// # Errors
    /// - `TorrentError::EngineUnavailable` - Engine could not be created
    /// - `TorrentError::AddFailed` - Engine rejected the torrent; no
    ///   subscription is left behind
    pub fn add(
        &mut self,
        subscription: Subscription,
        content_id: ContentId,
        identifier: &str,
        options: &AddOptions,
    ) -> Result<Added, TorrentError> {
        if let Some(session) = self.sessions.get_mut(&content_id) {
            session.attach(subscription);
            return Ok(Added {
                session: session.id,
                created: false,
            });
        }

        let engine_was_running = self.engine_running();
        // Rejected adds consume an id too
        let id = SessionId(self.next_session_id);
        self.next_session_id += 1;
        let sink = SessionEventSink::new(id, self.events.clone());

        let added = self
            .ensure_engine()
            .and_then(|engine| engine.add(content_id, identifier, options, sink));
        let backend = match added {
            Ok(backend) => backend,
            Err(e) => {
                if !engine_was_running && self.sessions.is_empty() {
                    self.teardown_engine();
                }
                return Err(e);
            }
        };

        tracing::debug!("Created {} for {}", id, content_id);

        let mut session = Session::new(id, content_id, backend);
        session.attach(subscription);
        self.sessions.insert(content_id, session);
        self.routes.insert(id, content_id);

        Ok(Added {
            session: id,
            created: true,
        })
    }

    /// Finds the session any subscription with `torrent_key` points at,
    /// preferring one owned by `client_key`.
    pub fn find_by_torrent_key(
        &self,
        client_key: &ClientKey,
        torrent_key: &TorrentKey,
    ) -> Option<SessionId> {
        self.binding(client_key, torrent_key).or_else(|| {
            self.sessions
                .values()
                .filter(|s| s.subscriptions.iter().any(|sub| &sub.torrent_key == torrent_key))
                .map(|s| s.id)
                .min()
        })
    }

    /// Session holding exactly this client's `torrent_key`.
    pub fn binding(&self, client_key: &ClientKey, torrent_key: &TorrentKey) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.has_subscription(client_key, torrent_key))
            .map(|s| s.id)
    }

    /// Removes one subscription from one session, destroying the session if
    /// it was the last one.
    pub fn detach(
        &mut self,
        session: SessionId,
        subscription: &Subscription,
    ) -> Option<DestroyedSession> {
        let content_id = *self.routes.get(&session)?;
        let entry = self.sessions.get_mut(&content_id)?;
        entry.subscriptions.retain(|s| s != subscription);

        if entry.subscriptions.is_empty() {
            self.destroy_session(content_id)
        } else {
            None
        }
    }

    /// Removes every subscription of `client_key` and destroys sessions
    /// left without subscribers. Tears down the engine once no session
    /// remains.
    pub fn remove_client(&mut self, client_key: &ClientKey) -> Vec<DestroyedSession> {
        let mut emptied: Vec<(SessionId, ContentId)> = Vec::new();
        for session in self.sessions.values_mut() {
            session.subscriptions.retain(|s| &s.client_key != client_key);
            if session.subscriptions.is_empty() {
                emptied.push((session.id, session.content_id));
            }
        }
        emptied.sort();

        let destroyed: Vec<DestroyedSession> = emptied
            .into_iter()
            .filter_map(|(_, content_id)| self.destroy_session(content_id))
            .collect();

        if self.sessions.is_empty() {
            self.teardown_engine();
        }
        destroyed
    }

    /// Destroys every session and the engine.
    pub fn destroy_all(&mut self) -> Vec<DestroyedSession> {
        let mut content_ids: Vec<(SessionId, ContentId)> =
            self.sessions.values().map(|s| (s.id, s.content_id)).collect();
        content_ids.sort();

        let destroyed: Vec<DestroyedSession> = content_ids
            .into_iter()
            .filter_map(|(_, content_id)| self.destroy_session(content_id))
            .collect();
        self.teardown_engine();
        destroyed
    }

    fn destroy_session(&mut self, content_id: ContentId) -> Option<DestroyedSession> {
        let mut session = self.sessions.remove(&content_id)?;
        self.routes.remove(&session.id);

        let cancelled = session.endpoint.teardown();
        session.backend.destroy();
        tracing::debug!(
            "Destroyed {} for {} ({} endpoint waiters cancelled)",
            session.id,
            content_id,
            cancelled.len()
        );

        Some(DestroyedSession {
            id: session.id,
            content_id,
            cancelled,
        })
    }

    /// Session by its hub-assigned id, if still registered.
    pub fn get(&self, session: SessionId) -> Option<&Session> {
        self.routes
            .get(&session)
            .and_then(|content_id| self.sessions.get(content_id))
    }

    pub fn get_mut(&mut self, session: SessionId) -> Option<&mut Session> {
        let content_id = self.routes.get(&session)?;
        self.sessions.get_mut(content_id)
    }

    pub fn by_content(&self, content_id: &ContentId) -> Option<&Session> {
        self.sessions.get(content_id)
    }

    /// Sessions in creation order.
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MockEngineFactory, SessionEvent};

    fn content(byte: u8) -> ContentId {
        ContentId::new([byte; 20])
    }

    fn sub(client: &str, key: &str) -> Subscription {
        Subscription::new(client.into(), key.into())
    }

    fn registry(factory: &MockEngineFactory) -> SessionRegistry {
        let (events, _rx) = mpsc::unbounded_channel();
        SessionRegistry::new(Arc::new(factory.clone()), events)
    }

    #[test]
    fn test_same_content_shares_one_session() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();

        let first = registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        let second = registry.add(sub("b", "t2"), content(1), "x", &options).unwrap();
        let third = registry.add(sub("a", "t3"), content(1), "x", &options).unwrap();

        assert!(first.created);
        assert!(!second.created && !third.created);
        assert_eq!(first.session, second.session);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first.session).unwrap().subscriptions().len(), 3);
        assert_eq!(factory.add_calls(content(1)), 1);
        assert_eq!(factory.engines_created(), 1);
    }

    #[test]
    fn test_duplicate_pair_is_idempotent() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();

        let added = registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();

        assert_eq!(registry.get(added.session).unwrap().subscriptions().len(), 1);
    }

    #[test]
    fn test_subscribe_without_session_creates_nothing() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);

        assert!(registry.subscribe(sub("a", "t1"), content(7)).is_none());
        assert!(!registry.engine_running());
        assert_eq!(factory.engines_created(), 0);
    }

    #[test]
    fn test_subscribe_attaches_to_existing_session() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        registry
            .add(sub("a", "t1"), content(1), "x", &AddOptions::default())
            .unwrap();

        let (id, state) = registry.subscribe(sub("b", "t9"), content(1)).unwrap();

        assert_eq!(state.info_hash, content(1));
        assert_eq!(registry.get(id).unwrap().subscriptions().len(), 2);
    }

    #[test]
    fn test_remove_client_cascades_to_engine() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();
        registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        registry.add(sub("b", "t2"), content(1), "x", &options).unwrap();
        registry.add(sub("b", "t3"), content(2), "y", &options).unwrap();

        let destroyed = registry.remove_client(&"b".into());
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].content_id, content(2));
        assert_eq!(factory.destroy_calls(content(2)), 1);
        assert!(registry.engine_running());

        let destroyed = registry.remove_client(&"a".into());
        assert_eq!(destroyed.len(), 1);
        assert_eq!(factory.destroy_calls(content(1)), 1);
        assert!(registry.is_empty());
        assert!(!registry.engine_running());
        assert_eq!(factory.engines_destroyed(), 1);

        // Nothing left to tear down
        assert!(registry.remove_client(&"a".into()).is_empty());
        assert_eq!(factory.engines_destroyed(), 1);
    }

    #[test]
    fn test_failed_add_leaves_no_subscription_or_engine() {
        let factory = MockEngineFactory::new();
        factory.fail_add_for(content(3));
        let mut registry = registry(&factory);

        let result = registry.add(sub("a", "t1"), content(3), "x", &AddOptions::default());

        assert!(matches!(result, Err(TorrentError::AddFailed { .. })));
        assert!(registry.is_empty());
        assert!(registry.binding(&"a".into(), &"t1".into()).is_none());
        assert!(!registry.engine_running());
        assert_eq!(factory.engines_destroyed(), 1);
    }

    #[test]
    fn test_rejected_add_consumes_its_session_id() {
        let factory = MockEngineFactory::new();
        factory.fail_add_for(content(3));
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut registry = SessionRegistry::new(Arc::new(factory.clone()), events);
        let options = AddOptions::default();

        assert!(registry.add(sub("a", "t1"), content(3), "x", &options).is_err());
        let added = registry.add(sub("a", "t2"), content(1), "y", &options).unwrap();

        // The rejected sink reports under an id nothing is routed to
        assert!(factory.emit(content(3), SessionEvent::Metadata));
        match rx.try_recv().unwrap() {
            HubEvent::Session { session, .. } => {
                assert_ne!(session, added.session);
                assert!(registry.get(session).is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed_add_keeps_engine_serving_other_sessions() {
        let factory = MockEngineFactory::new();
        factory.fail_add_for(content(3));
        let mut registry = registry(&factory);
        let options = AddOptions::default();
        registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();

        assert!(registry.add(sub("a", "t2"), content(3), "y", &options).is_err());
        assert!(registry.engine_running());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_find_by_torrent_key_prefers_own_subscription() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();
        let a = registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        let b = registry.add(sub("b", "t1"), content(2), "y", &options).unwrap();

        assert_eq!(
            registry.find_by_torrent_key(&"b".into(), &"t1".into()),
            Some(b.session)
        );
        assert_eq!(
            registry.find_by_torrent_key(&"a".into(), &"t1".into()),
            Some(a.session)
        );
        // Any client's key matches when the requester has none of its own
        assert_eq!(
            registry.find_by_torrent_key(&"c".into(), &"t1".into()),
            Some(a.session)
        );
        assert!(registry.find_by_torrent_key(&"a".into(), &"t7".into()).is_none());
    }

    #[test]
    fn test_detach_last_subscription_destroys_session() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let added = registry
            .add(sub("a", "t1"), content(1), "x", &AddOptions::default())
            .unwrap();

        let destroyed = registry.detach(added.session, &sub("a", "t1")).unwrap();

        assert_eq!(destroyed.id, added.session);
        assert!(registry.get(added.session).is_none());
        assert_eq!(factory.destroy_calls(content(1)), 1);
    }

    #[test]
    fn test_session_ids_are_never_reused() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();

        let first = registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        registry.remove_client(&"a".into());
        let second = registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();

        assert_ne!(first.session, second.session);
        assert!(registry.get(first.session).is_none());
        assert_eq!(factory.engines_created(), 2);
    }

    #[test]
    fn test_destroy_all() {
        let factory = MockEngineFactory::new();
        let mut registry = registry(&factory);
        let options = AddOptions::default();
        registry.add(sub("a", "t1"), content(1), "x", &options).unwrap();
        registry.add(sub("b", "t2"), content(2), "y", &options).unwrap();

        let destroyed = registry.destroy_all();

        assert_eq!(destroyed.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(factory.engines_destroyed(), 1);
    }
}
