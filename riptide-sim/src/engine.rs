//! Simulated torrent engine.
//!
//! Plugs into the hub like a real engine: sessions report metadata and
//! progress over time, and endpoints are real HTTP listeners.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use riptide_hub::engine::{
    AddOptions, Endpoint, EndpointOptions, EngineEvent, EngineEventSink, EngineFault,
    EngineFactory, EngineSession, SessionEvent, SessionEventSink, SessionStatus, TorrentEngine,
};
use riptide_hub::{ContentId, TorrentError};

use crate::config::SimulationConfig;
use crate::server;
use crate::torrent::{SimulatedTorrent, run_transfer};

/// Creates [`SimulatedEngine`]s sharing one configuration.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngineFactory {
    config: SimulationConfig,
}

impl SimulatedEngineFactory {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }
}

impl EngineFactory for SimulatedEngineFactory {
    fn create(&self, events: EngineEventSink) -> Result<Box<dyn TorrentEngine>, TorrentError> {
        tracing::debug!(
            "Starting simulated engine ({} B/s, tick {:?})",
            self.config.simulated_download_speed,
            self.config.tick_interval
        );
        Ok(Box::new(SimulatedEngine::new(self.config.clone(), events)))
    }
}

/// Engine whose torrents download from nowhere at a configured speed.
pub struct SimulatedEngine {
    config: SimulationConfig,
    events: EngineEventSink,
    torrents: HashMap<ContentId, Arc<SimulatedTorrent>>,
    rng: ChaCha8Rng,
    destroyed: bool,
}

impl SimulatedEngine {
    pub fn new(config: SimulationConfig, events: EngineEventSink) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        };
        Self {
            config,
            events,
            torrents: HashMap::new(),
            rng,
            destroyed: false,
        }
    }
}

impl TorrentEngine for SimulatedEngine {
    fn add(
        &mut self,
        content_id: ContentId,
        identifier: &str,
        options: &AddOptions,
        events: SessionEventSink,
    ) -> Result<Arc<dyn EngineSession>, TorrentError> {
        if self.destroyed {
            return Err(TorrentError::EngineUnavailable {
                reason: "Simulated engine was destroyed".to_string(),
            });
        }
        self.torrents.retain(|_, torrent| !torrent.is_stopped());
        if self.torrents.contains_key(&content_id) {
            return Err(TorrentError::AddFailed {
                content_id,
                reason: "Torrent already added".to_string(),
            });
        }

        tracing::debug!("Simulating {} from {}", content_id, identifier);
        if !options.extra.is_empty() {
            let ignored: Vec<&str> = options.extra.keys().map(String::as_str).collect();
            events.emit(SessionEvent::Warning(EngineFault::new(
                format!("Ignoring unsupported options: {}", ignored.join(", ")),
            )));
        }
        if self.rng.random_bool(self.config.tracker_failure_rate.clamp(0.0, 1.0)) {
            self.events.emit(EngineEvent::Warning(EngineFault::new(format!(
                "Tracker announce failed for {content_id}"
            ))));
        }

        let torrent = Arc::new(SimulatedTorrent::new(content_id, &self.config));
        let rng = ChaCha8Rng::seed_from_u64(self.rng.random());
        tokio::spawn(run_transfer(torrent.clone(), events, rng));
        self.torrents.insert(content_id, torrent.clone());

        Ok(Arc::new(SimulatedSession {
            torrent,
            listen_host: self.config.listen_host.clone(),
        }))
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        tracing::debug!("Destroying simulated engine with {} torrents", self.torrents.len());
        for (_, torrent) in self.torrents.drain() {
            torrent.stop();
        }
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Hub-facing view of one simulated torrent.
pub struct SimulatedSession {
    torrent: Arc<SimulatedTorrent>,
    listen_host: String,
}

#[async_trait]
impl EngineSession for SimulatedSession {
    fn status(&self) -> SessionStatus {
        self.torrent.status()
    }

    async fn create_endpoint(
        &self,
        options: EndpointOptions,
    ) -> Result<Box<dyn Endpoint>, TorrentError> {
        if self.torrent.is_stopped() {
            return Err(TorrentError::EndpointFailed {
                reason: format!("Torrent {} was destroyed", self.torrent.content_id()),
            });
        }
        let host = options.host.unwrap_or_else(|| self.listen_host.clone());
        let endpoint = server::serve(self.torrent.clone(), &host, options.port.unwrap_or(0)).await?;
        Ok(Box::new(endpoint))
    }

    fn destroy(&self) {
        self.torrent.stop();
    }
}
