//! HTTP endpoints exposing simulated torrents.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use riptide_hub::engine::{Endpoint, FileEntry};
use riptide_hub::TorrentError;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::torrent::SimulatedTorrent;

/// Listing served at `GET /`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentIndex {
    pub info_hash: String,
    pub name: Option<String>,
    pub length: u64,
    pub files: Vec<FileEntry>,
    pub progress: f64,
    pub downloaded: u64,
    pub num_peers: usize,
}

/// A listening HTTP server for one torrent.
pub struct SimulatedEndpoint {
    url: String,
    shutdown: watch::Sender<bool>,
}

impl Endpoint for SimulatedEndpoint {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn close(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!("Closing endpoint {}", self.url);
        }
    }
}

/// Binds `host:port` and serves `torrent` until the endpoint is closed or
/// the torrent is stopped.
///
/// # Errors
/// - `TorrentError::EndpointFailed` - Address could not be bound
pub async fn serve(
    torrent: Arc<SimulatedTorrent>,
    host: &str,
    port: u16,
) -> Result<SimulatedEndpoint, TorrentError> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| TorrentError::EndpointFailed {
            reason: format!("Failed to bind {host}:{port}: {e}"),
        })?;
    let address = listener
        .local_addr()
        .map_err(|e| TorrentError::EndpointFailed {
            reason: e.to_string(),
        })?;

    let (shutdown, mut closed) = watch::channel(false);
    let watched = torrent.clone();
    let app = Router::new()
        .route("/", get(torrent_index))
        .layer(CorsLayer::permissive())
        .with_state(torrent);

    tokio::spawn(async move {
        let signal = async move {
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => {}
                _ = watched.stopped() => {}
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
        {
            tracing::warn!("Endpoint {} failed: {}", address, e);
        }
        tracing::debug!("Endpoint {} stopped", address);
    });

    let url = format!("http://{address}");
    tracing::debug!("Serving simulated torrent at {}", url);
    Ok(SimulatedEndpoint { url, shutdown })
}

async fn torrent_index(State(torrent): State<Arc<SimulatedTorrent>>) -> Json<TorrentIndex> {
    let status = torrent.status();
    Json(TorrentIndex {
        info_hash: torrent.content_id().to_string(),
        name: status.name,
        length: status.total_length,
        files: status.files,
        progress: status.progress,
        downloaded: status.bytes_downloaded,
        num_peers: status.peer_count,
    })
}

#[cfg(test)]
mod tests {
    use riptide_hub::ContentId;

    use super::*;
    use crate::config::SimulationConfig;

    fn torrent() -> Arc<SimulatedTorrent> {
        Arc::new(SimulatedTorrent::new(
            ContentId::new([0x11; 20]),
            &SimulationConfig::deterministic_testing(),
        ))
    }

    #[tokio::test]
    async fn test_index_lists_torrent() {
        let endpoint = serve(torrent(), "127.0.0.1", 0).await.unwrap();

        let index: serde_json::Value = reqwest::get(endpoint.url())
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(index["infoHash"], "1111111111111111111111111111111111111111");
        assert_eq!(index["length"], 4 * 1024 * 1024);
        assert_eq!(index["progress"], 0.0);
        endpoint.close();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let first = serve(torrent(), "127.0.0.1", 0).await.unwrap();
        let port: u16 = first.url().rsplit(':').next().unwrap().parse().unwrap();

        let second = serve(torrent(), "127.0.0.1", port).await;

        assert!(matches!(second, Err(TorrentError::EndpointFailed { .. })));
    }

    #[tokio::test]
    async fn test_close_stops_listener() {
        let endpoint = serve(torrent(), "127.0.0.1", 0).await.unwrap();
        let url = endpoint.url();
        endpoint.close();

        let mut refused = false;
        for _ in 0..50 {
            if reqwest::get(&url).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(refused);
    }
}
