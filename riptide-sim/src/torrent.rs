//! One simulated torrent and the task driving its transfer.

use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use riptide_hub::ContentId;
use riptide_hub::engine::{FileEntry, SessionEvent, SessionEventSink, SessionStatus};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::SimulationConfig;

/// What a single transfer step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Metadata became available
    Metadata,
    /// Bytes moved; `uploaded` is set when any were uploaded
    Progress { uploaded: bool },
    /// Last byte downloaded
    Done,
    /// Nothing left to do
    Idle,
}

#[derive(Debug, Default)]
struct Transfer {
    metadata_ready: bool,
    downloaded: u64,
    uploaded: u64,
    download_rate: u64,
    upload_rate: u64,
    peers: usize,
    done: bool,
}

/// Shared state of a simulated torrent.
///
/// Owned jointly by the engine, the transfer task and any HTTP endpoint
/// serving it.
#[derive(Debug)]
pub struct SimulatedTorrent {
    content_id: ContentId,
    name: String,
    files: Vec<FileEntry>,
    total_length: u64,
    config: SimulationConfig,
    transfer: Mutex<Transfer>,
    stop: watch::Sender<bool>,
}

impl SimulatedTorrent {
    pub fn new(content_id: ContentId, config: &SimulationConfig) -> Self {
        let name = format!("sim-{}", &content_id.to_string()[..8]);
        let files = split_files(&name, config.torrent_length, config.files_per_torrent);
        let (stop, _) = watch::channel(false);

        Self {
            content_id,
            name,
            files,
            total_length: config.torrent_length,
            config: config.clone(),
            transfer: Mutex::new(Transfer::default()),
            stop,
        }
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Advances the transfer by one tick.
    pub fn advance(&self, rng: &mut ChaCha8Rng) -> Step {
        let mut transfer = self.transfer.lock();
        if transfer.done {
            return Step::Idle;
        }
        let max_peers = self.config.max_simulated_peers.max(1);

        if !transfer.metadata_ready {
            transfer.metadata_ready = true;
            transfer.peers = rng.random_range(1..=max_peers);
            return Step::Metadata;
        }

        let jitter: f64 = rng.random_range(0.5..1.5);
        let rate = (self.config.simulated_download_speed as f64 * jitter) as u64;
        let remaining = self.total_length - transfer.downloaded;
        let chunk = ((rate as f64 * self.config.tick_interval.as_secs_f64()) as u64)
            .clamp(1, remaining.max(1))
            .min(remaining);
        let uploaded = (chunk as f64 * self.config.upload_ratio) as u64;

        transfer.downloaded += chunk;
        transfer.uploaded += uploaded;
        transfer.download_rate = rate;
        transfer.upload_rate = (rate as f64 * self.config.upload_ratio) as u64;
        transfer.peers = match rng.random_range(0..3) {
            0 => transfer.peers.saturating_sub(1).max(1),
            1 => (transfer.peers + 1).min(max_peers),
            _ => transfer.peers,
        };

        if transfer.downloaded >= self.total_length {
            transfer.done = true;
            transfer.download_rate = 0;
            return Step::Done;
        }
        Step::Progress {
            uploaded: uploaded > 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let transfer = self.transfer.lock();
        let progress = if self.total_length == 0 {
            1.0
        } else {
            transfer.downloaded as f64 / self.total_length as f64
        };
        let share_ratio = if transfer.downloaded == 0 {
            0.0
        } else {
            transfer.uploaded as f64 / transfer.downloaded as f64
        };
        let time_remaining_ms = (transfer.download_rate > 0).then(|| {
            (self.total_length - transfer.downloaded).saturating_mul(1000) / transfer.download_rate
        });

        SessionStatus {
            name: transfer.metadata_ready.then(|| self.name.clone()),
            total_length: self.total_length,
            files: if transfer.metadata_ready {
                self.files.clone()
            } else {
                Vec::new()
            },
            progress,
            bytes_downloaded: transfer.downloaded,
            bytes_uploaded: transfer.uploaded,
            download_rate: transfer.download_rate,
            upload_rate: transfer.upload_rate,
            share_ratio,
            peer_count: transfer.peers,
            time_remaining_ms,
        }
    }

    /// Stops the transfer task and any endpoint serving this torrent.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            tracing::debug!("Stopped simulated torrent {}", self.content_id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once [`stop`](Self::stop) was called.
    pub async fn stopped(&self) {
        let mut stop = self.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }
}

/// Drives `torrent` tick by tick until it completes or is stopped.
pub async fn run_transfer(
    torrent: std::sync::Arc<SimulatedTorrent>,
    events: SessionEventSink,
    mut rng: ChaCha8Rng,
) {
    let mut ticker = tokio::time::interval(torrent.config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    events.emit(SessionEvent::InfoHash);

    loop {
        tokio::select! {
            _ = torrent.stopped() => break,
            _ = ticker.tick() => match torrent.advance(&mut rng) {
                Step::Metadata => events.emit(SessionEvent::Metadata),
                Step::Progress { uploaded } => {
                    events.emit(SessionEvent::Download);
                    if uploaded {
                        events.emit(SessionEvent::Upload);
                    }
                }
                Step::Done => {
                    events.emit(SessionEvent::Download);
                    events.emit(SessionEvent::Done);
                    break;
                }
                Step::Idle => break,
            },
        }
    }
    tracing::debug!("Transfer task for {} finished", torrent.content_id);
}

fn split_files(name: &str, total_length: u64, count: usize) -> Vec<FileEntry> {
    let count = count.max(1) as u64;
    let share = total_length / count;

    (0..count)
        .map(|i| FileEntry {
            name: format!("{name}/file-{i:02}.bin"),
            length: if i + 1 == count {
                total_length - share * (count - 1)
            } else {
                share
            },
        })
        .collect()
}
