//! Mock engine for testing the hub.
//!
//! Records every call the hub makes so tests can assert on engine
//! lifecycle, and lets tests hold endpoint creation open to exercise
//! waiter coalescing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::{
    AddOptions, Endpoint, EndpointOptions, EngineEvent, EngineEventSink, EngineFactory,
    EngineSession, FileEntry, SessionEvent, SessionEventSink, SessionStatus, TorrentEngine,
    TorrentError,
};
use crate::content::ContentId;

const MOCK_BASE_PORT: u16 = 9000;
const MOCK_TOTAL_LENGTH: u64 = 4 * 1024 * 1024;

/// How mock sessions answer `create_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointBehavior {
    /// Endpoint is ready as soon as it is requested
    Immediate,
    /// Endpoint stays pending until `release_endpoints` is called
    Gated,
    /// Endpoint creation fails with the given reason
    Fail(String),
}

#[derive(Default)]
struct MockState {
    engines_created: usize,
    engines_destroyed: usize,
    fail_engine_creation: bool,
    fail_adds: Vec<ContentId>,
    add_calls: HashMap<ContentId, usize>,
    destroy_calls: HashMap<ContentId, usize>,
    endpoint_calls: HashMap<ContentId, usize>,
    closed_endpoints: Vec<String>,
    statuses: HashMap<ContentId, SessionStatus>,
    session_sinks: HashMap<ContentId, SessionEventSink>,
    engine_sink: Option<EngineEventSink>,
    next_port: u16,
}

/// Factory producing mock engines that share one call log.
#[derive(Clone)]
pub struct MockEngineFactory {
    state: Arc<Mutex<MockState>>,
    behavior: Arc<Mutex<EndpointBehavior>>,
    gate: Arc<watch::Sender<bool>>,
}

impl MockEngineFactory {
    /// Creates a factory whose endpoints are ready immediately.
    pub fn new() -> Self {
        Self::with_endpoint_behavior(EndpointBehavior::Immediate)
    }

    /// Creates a factory with the given endpoint behavior.
    pub fn with_endpoint_behavior(behavior: EndpointBehavior) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            behavior: Arc::new(Mutex::new(behavior)),
            gate: Arc::new(gate),
        }
    }

    /// Makes the next engine creations fail.
    pub fn fail_engine_creation(&self) {
        self.state.lock().fail_engine_creation = true;
    }

    /// Makes every `add` for `content_id` fail.
    pub fn fail_add_for(&self, content_id: ContentId) {
        self.state.lock().fail_adds.push(content_id);
    }

    /// Completes every gated endpoint, pending or future.
    pub fn release_endpoints(&self) {
        self.gate.send_replace(true);
    }

    /// Overrides the status reported by the session for `content_id`.
    pub fn set_status(&self, content_id: ContentId, status: SessionStatus) {
        self.state.lock().statuses.insert(content_id, status);
    }

    /// Raises a session event as the engine would.
    ///
    /// Returns false if no session for `content_id` was ever added.
    pub fn emit(&self, content_id: ContentId, event: SessionEvent) -> bool {
        let sink = self.state.lock().session_sinks.get(&content_id).cloned();
        match sink {
            Some(sink) => {
                sink.emit(event);
                true
            }
            None => false,
        }
    }

    /// Raises an engine-wide event. Returns false if no engine exists yet.
    pub fn emit_engine(&self, event: EngineEvent) -> bool {
        let sink = self.state.lock().engine_sink.clone();
        match sink {
            Some(sink) => {
                sink.emit(event);
                true
            }
            None => false,
        }
    }

    pub fn engines_created(&self) -> usize {
        self.state.lock().engines_created
    }

    pub fn engines_destroyed(&self) -> usize {
        self.state.lock().engines_destroyed
    }

    /// Number of `add` calls that reached the engine for `content_id`.
    pub fn add_calls(&self, content_id: ContentId) -> usize {
        self.state
            .lock()
            .add_calls
            .get(&content_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of times the session for `content_id` was destroyed.
    pub fn destroy_calls(&self, content_id: ContentId) -> usize {
        self.state
            .lock()
            .destroy_calls
            .get(&content_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `create_endpoint` calls for `content_id`.
    pub fn endpoint_calls(&self, content_id: ContentId) -> usize {
        self.state
            .lock()
            .endpoint_calls
            .get(&content_id)
            .copied()
            .unwrap_or(0)
    }

    /// URLs of endpoints that were closed.
    pub fn closed_endpoints(&self) -> Vec<String> {
        self.state.lock().closed_endpoints.clone()
    }
}

impl Default for MockEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for MockEngineFactory {
    fn create(&self, events: EngineEventSink) -> Result<Box<dyn TorrentEngine>, TorrentError> {
        let mut state = self.state.lock();
        if state.fail_engine_creation {
            return Err(TorrentError::EngineUnavailable {
                reason: "Mock engine creation failure".to_string(),
            });
        }
        state.engines_created += 1;
        state.engine_sink = Some(events);

        Ok(Box::new(MockEngine {
            factory: self.clone(),
            destroyed: false,
        }))
    }
}

struct MockEngine {
    factory: MockEngineFactory,
    destroyed: bool,
}

impl TorrentEngine for MockEngine {
    fn add(
        &mut self,
        content_id: ContentId,
        _identifier: &str,
        _options: &AddOptions,
        events: SessionEventSink,
    ) -> Result<Arc<dyn EngineSession>, TorrentError> {
        let mut state = self.factory.state.lock();
        // Kept even for rejected adds so tests can emit through it
        state.session_sinks.insert(content_id, events);
        if state.fail_adds.contains(&content_id) {
            return Err(TorrentError::AddFailed {
                content_id,
                reason: "Mock add failure".to_string(),
            });
        }
        *state.add_calls.entry(content_id).or_default() += 1;

        Ok(Arc::new(MockSession {
            content_id,
            factory: self.factory.clone(),
        }))
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            self.destroyed = true;
            let mut state = self.factory.state.lock();
            state.engines_destroyed += 1;
            state.engine_sink = None;
        }
    }
}

struct MockSession {
    content_id: ContentId,
    factory: MockEngineFactory,
}

#[async_trait]
impl EngineSession for MockSession {
    fn status(&self) -> SessionStatus {
        let state = self.factory.state.lock();
        state
            .statuses
            .get(&self.content_id)
            .cloned()
            .unwrap_or_else(|| default_status(self.content_id))
    }

    async fn create_endpoint(
        &self,
        options: EndpointOptions,
    ) -> Result<Box<dyn Endpoint>, TorrentError> {
        let url = {
            let mut state = self.factory.state.lock();
            *state.endpoint_calls.entry(self.content_id).or_default() += 1;
            let port = options
                .port
                .unwrap_or(MOCK_BASE_PORT + state.next_port);
            state.next_port += 1;
            let host = options.host.unwrap_or_else(|| "localhost".to_string());
            format!("http://{host}:{port}")
        };

        let behavior = self.factory.behavior.lock().clone();
        match behavior {
            EndpointBehavior::Immediate => {}
            EndpointBehavior::Gated => {
                let mut gate = self.factory.gate.subscribe();
                gate.wait_for(|open| *open)
                    .await
                    .map_err(|_| TorrentError::EndpointFailed {
                        reason: "Mock gate dropped".to_string(),
                    })?;
            }
            EndpointBehavior::Fail(reason) => {
                return Err(TorrentError::EndpointFailed { reason });
            }
        }

        Ok(Box::new(MockEndpoint {
            url,
            factory: self.factory.clone(),
        }))
    }

    fn destroy(&self) {
        let mut state = self.factory.state.lock();
        *state.destroy_calls.entry(self.content_id).or_default() += 1;
    }
}

struct MockEndpoint {
    url: String,
    factory: MockEngineFactory,
}

impl Endpoint for MockEndpoint {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn close(&self) {
        self.factory.state.lock().closed_endpoints.push(self.url.clone());
    }
}

fn default_status(content_id: ContentId) -> SessionStatus {
    let name = format!("mock-{}", &content_id.to_string()[..8]);
    SessionStatus {
        name: Some(name.clone()),
        total_length: MOCK_TOTAL_LENGTH,
        files: vec![FileEntry {
            name: format!("{name}.mp4"),
            length: MOCK_TOTAL_LENGTH,
        }],
        progress: 0.25,
        bytes_downloaded: MOCK_TOTAL_LENGTH / 4,
        bytes_uploaded: 0,
        download_rate: 65_536,
        upload_rate: 0,
        share_ratio: 0.0,
        peer_count: 3,
        time_remaining_ms: Some(48_000),
    }
}
