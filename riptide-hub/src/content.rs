//! Identity types: content hashes and client-chosen keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::engine::TorrentError;

const MAGNET_SCHEME: &str = "magnet";
const BTIH_PREFIX: &str = "urn:btih:";

/// SHA-1 info hash identifying the content of a torrent.
///
/// Two identifiers (a magnet link and a bare hash, say) that resolve to the
/// same `ContentId` share one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; 20]);

impl ContentId {
    /// Creates a content id from a 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns the underlying hash bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Derives the content id from a torrent identifier.
    ///
    /// Accepts `magnet:?xt=urn:btih:<hash>` links and bare 40-character hex
    /// info hashes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidIdentifier` - Not a magnet link or hex hash
    pub fn from_identifier(identifier: &str) -> Result<Self, TorrentError> {
        let identifier = identifier.trim();
        if identifier.starts_with("magnet:") {
            return Self::from_magnet(identifier);
        }
        Self::from_hex(identifier)
    }

    fn from_magnet(magnet: &str) -> Result<Self, TorrentError> {
        let url = Url::parse(magnet).map_err(|e| TorrentError::InvalidIdentifier {
            reason: format!("Invalid magnet link: {e}"),
        })?;
        if url.scheme() != MAGNET_SCHEME {
            return Err(TorrentError::InvalidIdentifier {
                reason: format!("Unsupported scheme: {}", url.scheme()),
            });
        }

        url.query_pairs()
            .filter(|(key, _)| key == "xt")
            .find_map(|(_, value)| {
                value
                    .get(..BTIH_PREFIX.len())
                    .filter(|prefix| prefix.eq_ignore_ascii_case(BTIH_PREFIX))
                    .map(|_| value[BTIH_PREFIX.len()..].to_string())
            })
            .ok_or_else(|| TorrentError::InvalidIdentifier {
                reason: format!("Missing btih exact topic in magnet link: {magnet}"),
            })
            .and_then(|hash| Self::from_hex(&hash))
    }

    fn from_hex(hash: &str) -> Result<Self, TorrentError> {
        if hash.len() != 40 {
            return Err(TorrentError::InvalidIdentifier {
                reason: format!("Invalid hash length: {} (expected 40)", hash.len()),
            });
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hash, &mut bytes).map_err(|e| TorrentError::InvalidIdentifier {
            reason: format!("Invalid hex in hash {hash}: {e}"),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentId {
    type Err = TorrentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_identifier(s)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

/// Opaque key a remote client generated for itself.
///
/// Treated as untrusted input: only ever compared, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

/// Key a client generated for one of its torrents.
///
/// Only meaningful together with the owning client's [`ClientKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TorrentKey(String);

macro_rules! opaque_key {
    ($name:ident) => {
        impl $name {
            /// Wraps a raw key.
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            /// Returns the raw key.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self(key.to_string())
            }
        }

        impl From<String> for $name {
            fn from(key: String) -> Self {
                Self(key)
            }
        }
    };
}

opaque_key!(ClientKey);
opaque_key!(TorrentKey);

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_hex_and_magnet_resolve_to_same_content() {
        let from_hex = ContentId::from_identifier(HASH).unwrap();
        let magnet = format!("magnet:?xt=urn:btih:{HASH}&dn=Big+Buck+Bunny&tr=udp://t.example:1337");
        let from_magnet = ContentId::from_identifier(&magnet).unwrap();

        assert_eq!(from_hex, from_magnet);
        assert_eq!(from_hex.to_string(), HASH);
    }

    #[test]
    fn test_hash_is_case_insensitive() {
        let upper = ContentId::from_identifier(&HASH.to_uppercase()).unwrap();
        let magnet = format!("magnet:?xt=URN:BTIH:{}", HASH.to_uppercase());

        assert_eq!(upper, ContentId::from_identifier(HASH).unwrap());
        assert_eq!(upper, ContentId::from_identifier(&magnet).unwrap());
        assert_eq!(upper.to_string(), HASH);
    }

    #[test]
    fn test_invalid_identifiers_rejected() {
        for bad in [
            "",
            "not-a-hash",
            "magnet:?dn=no+topic",
            "magnet:?xt=urn:sha1:0123",
            "zz23456789abcdef0123456789abcdef01234567",
        ] {
            let result = ContentId::from_identifier(bad);
            assert!(
                matches!(result, Err(TorrentError::InvalidIdentifier { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_content_id_serializes_as_hex() {
        let id = ContentId::new([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();

        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        assert_eq!(serde_json::from_str::<ContentId>(&json).unwrap(), id);
    }

    #[test]
    fn test_keys_are_transparent_strings() {
        let key = ClientKey::new("c-9f2");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"c-9f2\"");
        assert_eq!(TorrentKey::from("t1").as_str(), "t1");
    }
}
