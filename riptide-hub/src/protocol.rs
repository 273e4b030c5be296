//! Wire messages exchanged with remote clients.
//!
//! Messages are JSON objects discriminated by a `type` field. The hub only
//! produces and consumes these values; delivery is left to a
//! [`MessageSink`] supplied by whoever owns the transport.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::content::{ClientKey, ContentId, TorrentKey};
use crate::engine::{AddOptions, EndpointOptions, EngineFault, FileEntry};

const INBOUND_TYPES: &[&str] = &[
    "subscribe",
    "add-torrent",
    "create-server",
    "heartbeat",
    "destroy",
];

/// Errors raised while decoding inbound messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    #[error("Malformed message: {reason}")]
    Malformed { reason: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        ProtocolError::Malformed {
            reason: error.to_string(),
        }
    }
}

/// Control messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Catch up with a torrent some client already added
    Subscribe {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        #[serde(rename = "torrentID", alias = "torrentId")]
        torrent_id: String,
    },
    /// Add a torrent, sharing an existing session when possible
    AddTorrent {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        #[serde(rename = "torrentID", alias = "torrentId")]
        torrent_id: String,
        #[serde(default)]
        options: AddOptions,
    },
    /// Expose a torrent over a local endpoint
    CreateServer {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        #[serde(default)]
        options: EndpointOptions,
    },
    Heartbeat { client_key: ClientKey },
    /// Drop every subscription the client holds
    Destroy {
        client_key: ClientKey,
        #[serde(default)]
        options: DestroyOptions,
    },
}

impl ClientMessage {
    /// Key of the client that sent the message.
    pub fn client_key(&self) -> &ClientKey {
        match self {
            ClientMessage::Subscribe { client_key, .. }
            | ClientMessage::AddTorrent { client_key, .. }
            | ClientMessage::CreateServer { client_key, .. }
            | ClientMessage::Heartbeat { client_key }
            | ClientMessage::Destroy { client_key, .. } => client_key,
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => "subscribe",
            ClientMessage::AddTorrent { .. } => "add-torrent",
            ClientMessage::CreateServer { .. } => "create-server",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::Destroy { .. } => "destroy",
        }
    }
}

/// Options for `destroy`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DestroyOptions {
    /// Milliseconds to wait before disconnecting, any JSON number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,
}

impl DestroyOptions {
    /// Wait before disconnecting, or `None` to disconnect now.
    ///
    /// Zero, negative and non-finite delays disconnect immediately. Delays
    /// too large for a `Duration` wait forever.
    pub fn delay(&self) -> Option<Duration> {
        let ms = self.delay.filter(|ms| ms.is_finite() && *ms > 0.0)?;
        Some(Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX))
    }
}

/// Decodes one inbound JSON message.
///
/// # Errors
/// - `ProtocolError::UnknownMessageType` - `type` is not a known control message
/// - `ProtocolError::Malformed` - Invalid JSON or missing fields
pub fn decode_client_message(raw: &str) -> Result<ClientMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let message_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed {
            reason: "missing string field `type`".to_string(),
        })?;

    if !INBOUND_TYPES.contains(&message_type) {
        return Err(ProtocolError::UnknownMessageType {
            message_type: message_type.to_string(),
        });
    }

    Ok(serde_json::from_value(value)?)
}

/// Descriptive snapshot of a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentInfo {
    pub name: Option<String>,
    pub info_hash: ContentId,
    pub length: u64,
    #[serde(rename = "serverURL")]
    pub server_url: Option<String>,
    pub files: Vec<FileEntry>,
}

/// Transfer progress snapshot of a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentProgress {
    pub progress: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub length: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub ratio: f64,
    pub num_peers: usize,
    /// Milliseconds, absent when unknown
    pub time_remaining: Option<u64>,
}

/// Info and progress together, sent when a client (re)subscribes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentState {
    pub name: Option<String>,
    pub info_hash: ContentId,
    pub length: u64,
    #[serde(rename = "serverURL")]
    pub server_url: Option<String>,
    pub files: Vec<FileEntry>,
    pub progress: f64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub ratio: f64,
    pub num_peers: usize,
    pub time_remaining: Option<u64>,
}

impl TorrentState {
    /// Merges the two snapshots; `length` is taken from `info`.
    pub fn new(info: TorrentInfo, progress: TorrentProgress) -> Self {
        Self {
            name: info.name,
            info_hash: info.info_hash,
            length: info.length,
            server_url: info.server_url,
            files: info.files,
            progress: progress.progress,
            downloaded: progress.downloaded,
            uploaded: progress.uploaded,
            download_speed: progress.download_speed,
            upload_speed: progress.upload_speed,
            ratio: progress.ratio,
            num_peers: progress.num_peers,
            time_remaining: progress.time_remaining,
        }
    }
}

/// Error body attached to `warning` and `error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

impl From<EngineFault> for ErrorPayload {
    fn from(fault: EngineFault) -> Self {
        Self {
            message: fault.message,
            stack: fault.stack,
        }
    }
}

/// Messages sent from the hub to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HubMessage {
    TorrentSubscribed {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: Option<TorrentState>,
    },
    ServerReady {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        #[serde(rename = "serverURL")]
        server_url: String,
    },
    Infohash {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentInfo,
    },
    Metadata {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentInfo,
    },
    Download {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentProgress,
    },
    Upload {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentProgress,
    },
    Done {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentProgress,
    },
    Update {
        client_key: ClientKey,
        torrent_key: TorrentKey,
        torrent: TorrentProgress,
    },
    Warning {
        client_key: ClientKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        torrent_key: Option<TorrentKey>,
        error: ErrorPayload,
    },
    Error {
        client_key: ClientKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        torrent_key: Option<TorrentKey>,
        error: ErrorPayload,
    },
}

impl HubMessage {
    /// Client the message is addressed to.
    pub fn client_key(&self) -> &ClientKey {
        match self {
            HubMessage::TorrentSubscribed { client_key, .. }
            | HubMessage::ServerReady { client_key, .. }
            | HubMessage::Infohash { client_key, .. }
            | HubMessage::Metadata { client_key, .. }
            | HubMessage::Download { client_key, .. }
            | HubMessage::Upload { client_key, .. }
            | HubMessage::Done { client_key, .. }
            | HubMessage::Update { client_key, .. }
            | HubMessage::Warning { client_key, .. }
            | HubMessage::Error { client_key, .. } => client_key,
        }
    }

    /// Torrent key the message concerns, if any.
    pub fn torrent_key(&self) -> Option<&TorrentKey> {
        match self {
            HubMessage::TorrentSubscribed { torrent_key, .. }
            | HubMessage::ServerReady { torrent_key, .. }
            | HubMessage::Infohash { torrent_key, .. }
            | HubMessage::Metadata { torrent_key, .. }
            | HubMessage::Download { torrent_key, .. }
            | HubMessage::Upload { torrent_key, .. }
            | HubMessage::Done { torrent_key, .. }
            | HubMessage::Update { torrent_key, .. } => Some(torrent_key),
            HubMessage::Warning { torrent_key, .. } | HubMessage::Error { torrent_key, .. } => {
                torrent_key.as_ref()
            }
        }
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::TorrentSubscribed { .. } => "torrent-subscribed",
            HubMessage::ServerReady { .. } => "server-ready",
            HubMessage::Infohash { .. } => "infohash",
            HubMessage::Metadata { .. } => "metadata",
            HubMessage::Download { .. } => "download",
            HubMessage::Upload { .. } => "upload",
            HubMessage::Done { .. } => "done",
            HubMessage::Update { .. } => "update",
            HubMessage::Warning { .. } => "warning",
            HubMessage::Error { .. } => "error",
        }
    }
}

/// Outbound delivery function injected by the transport owner.
///
/// Called from the hub actor; implementations must not block.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: HubMessage);
}

impl<F> MessageSink for F
where
    F: Fn(HubMessage) + Send + Sync,
{
    fn send(&self, message: HubMessage) {
        self(message)
    }
}

/// Shared handle to a message sink.
pub type SharedSink = Arc<dyn MessageSink>;

/// Sink forwarding every message into an unbounded channel.
pub fn channel_sink(sender: mpsc::UnboundedSender<HubMessage>) -> SharedSink {
    Arc::new(move |message: HubMessage| {
        if sender.send(message).is_err() {
            tracing::debug!("Outbound channel closed, dropping message");
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_add_torrent() {
        let raw = r#"{
            "clientKey": "c1",
            "type": "add-torrent",
            "torrentKey": "t1",
            "torrentID": "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
            "options": {"server": true}
        }"#;

        let message = decode_client_message(raw).unwrap();
        match message {
            ClientMessage::AddTorrent {
                client_key,
                torrent_key,
                options,
                ..
            } => {
                assert_eq!(client_key.as_str(), "c1");
                assert_eq!(torrent_key.as_str(), "t1");
                assert!(options.server);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    fn destroy_options(raw: &str) -> DestroyOptions {
        match decode_client_message(raw).unwrap() {
            ClientMessage::Destroy { options, .. } => options,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_destroy_delay_accepts_any_number() {
        let float = destroy_options(
            r#"{"clientKey":"c1","type":"destroy","options":{"delay":1000.0}}"#,
        );
        assert_eq!(float.delay(), Some(Duration::from_millis(1000)));

        let fractional = destroy_options(
            r#"{"clientKey":"c1","type":"destroy","options":{"delay":1500.5}}"#,
        );
        let delay = fractional.delay().unwrap();
        assert!(delay > Duration::from_millis(1500) && delay < Duration::from_millis(1501));

        let negative =
            destroy_options(r#"{"clientKey":"c1","type":"destroy","options":{"delay":-1}}"#);
        assert_eq!(negative.delay, Some(-1.0));
        assert_eq!(negative.delay(), None);

        let zero = destroy_options(r#"{"clientKey":"c1","type":"destroy","options":{"delay":0}}"#);
        assert_eq!(zero.delay(), None);
    }

    #[test]
    fn test_destroy_delay_out_of_range() {
        let huge = DestroyOptions { delay: Some(1e300) };
        assert_eq!(huge.delay(), Some(Duration::MAX));

        let nan = DestroyOptions { delay: Some(f64::NAN) };
        assert_eq!(nan.delay(), None);
        let infinite = DestroyOptions { delay: Some(f64::INFINITY) };
        assert_eq!(infinite.delay(), None);
    }

    #[test]
    fn test_decode_destroy_with_and_without_delay() {
        let delayed =
            decode_client_message(r#"{"clientKey":"c1","type":"destroy","options":{"delay":500}}"#)
                .unwrap();
        assert_eq!(
            delayed,
            ClientMessage::Destroy {
                client_key: "c1".into(),
                options: DestroyOptions { delay: Some(500.0) },
            }
        );

        let immediate = decode_client_message(r#"{"clientKey":"c1","type":"destroy"}"#).unwrap();
        assert_eq!(
            immediate,
            ClientMessage::Destroy {
                client_key: "c1".into(),
                options: DestroyOptions::default(),
            }
        );
    }

    #[test]
    fn test_unknown_type_reported() {
        let result = decode_client_message(r#"{"clientKey":"c1","type":"pause"}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::UnknownMessageType { message_type }) if message_type == "pause"
        ));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        assert!(matches!(
            decode_client_message(r#"{"type":"heartbeat"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            decode_client_message("not json"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            decode_client_message(r#"{"clientKey":"c1"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = HubMessage::ServerReady {
            client_key: "c1".into(),
            torrent_key: "t1".into(),
            server_url: "http://localhost:9000".to_string(),
        };

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "server-ready",
                "clientKey": "c1",
                "torrentKey": "t1",
                "serverURL": "http://localhost:9000"
            })
        );
    }

    #[test]
    fn test_subscribed_null_and_broadcast_warning_shape() {
        let missing = HubMessage::TorrentSubscribed {
            client_key: "c1".into(),
            torrent_key: "t9".into(),
            torrent: None,
        };
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            json!({"type": "torrent-subscribed", "clientKey": "c1", "torrentKey": "t9", "torrent": null})
        );

        let warning = HubMessage::Warning {
            client_key: "c2".into(),
            torrent_key: None,
            error: ErrorPayload::new("tracker unreachable"),
        };
        assert_eq!(
            serde_json::to_value(&warning).unwrap(),
            json!({"type": "warning", "clientKey": "c2", "error": {"message": "tracker unreachable"}})
        );
    }

    #[test]
    fn test_full_snapshot_is_flat() {
        let state = TorrentState::new(
            TorrentInfo {
                name: Some("sintel".to_string()),
                info_hash: ContentId::new([1; 20]),
                length: 100,
                server_url: None,
                files: vec![FileEntry {
                    name: "sintel.mp4".to_string(),
                    length: 100,
                }],
            },
            TorrentProgress {
                progress: 0.5,
                downloaded: 50,
                uploaded: 0,
                length: 100,
                download_speed: 10,
                upload_speed: 0,
                ratio: 0.0,
                num_peers: 2,
                time_remaining: Some(5000),
            },
        );

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["name"], json!("sintel"));
        assert_eq!(value["infoHash"], json!("01".repeat(20)));
        assert_eq!(value["length"], json!(100));
        assert_eq!(value["serverURL"], json!(null));
        assert_eq!(value["numPeers"], json!(2));
        assert_eq!(value["timeRemaining"], json!(5000));
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = channel_sink(tx);

        sink.send(HubMessage::Warning {
            client_key: "c1".into(),
            torrent_key: None,
            error: ErrorPayload::new("slow tracker"),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "warning");
        assert_eq!(received.client_key().as_str(), "c1");
        assert!(received.torrent_key().is_none());
    }
}
