//! PeerId: deterministic identifier for a node in the mesh.
//!
//! Derived by hashing the normalized `host:port` endpoint string, so every
//! node computes the same id for a given endpoint without negotiation.
//! Displays as a 64-character lowercase hex string.

use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID format: expected 64 hex chars")]
    InvalidFormat,
}

/// A deterministic identifier for a peer in the mesh.
///
/// `PeerId` is a pure function of the peer's `host:port`: both ends of a
/// link derive the same id independently, so links agree on identity
/// without any exchange. Ordering is lexicographic over the hex digest,
/// which gives every node the same total order over the membership list.
///
/// # Examples
/// ```
/// use registry_core::PeerId;
///
/// let id = PeerId::derive("10.0.0.1", 7070);
/// assert_eq!(id, PeerId::derive("10.0.0.1", 7070));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the id for an endpoint. The input is expected to already be
    /// normalized (trimmed, lowercase host).
    pub fn derive(host: &str, port: u16) -> Self {
        let digest = Sha256::digest(format!("{host}:{port}").as_bytes());
        Self(hex::encode(digest))
    }

    /// The full hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self(s.to_ascii_lowercase()));
        }

        Err(PeerIdError::InvalidFormat)
    }
}

// Serialize as the hex string for consistency in logs, errors and frames
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let a = PeerId::derive("10.0.0.1", 7070);
        let b = PeerId::derive("10.0.0.1", 7070);
        assert_eq!(a, b);
    }

    #[test]
    fn test_derive_distinguishes_endpoints() {
        assert_ne!(PeerId::derive("10.0.0.1", 7070), PeerId::derive("10.0.0.2", 7070));
        assert_ne!(PeerId::derive("10.0.0.1", 7070), PeerId::derive("10.0.0.1", 7071));
    }

    #[test]
    fn test_display_is_lowercase_hex() {
        let id = PeerId::derive("node-a", 7070);
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_roundtrip() {
        let original = PeerId::derive("node-a", 7070);
        let parsed: PeerId = original.to_string().parse().unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_parse_uppercase_hex() {
        let id = PeerId::derive("node-a", 7070);
        let parsed: PeerId = id.to_string().to_ascii_uppercase().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_invalid_format() {
        assert!("too_short".parse::<PeerId>().is_err());
        assert!("".parse::<PeerId>().is_err());
        // right length, non-hex
        assert!("g".repeat(64).parse::<PeerId>().is_err());
        // wrong length
        assert!("a".repeat(63).parse::<PeerId>().is_err());
        assert!("a".repeat(65).parse::<PeerId>().is_err());
    }

    #[test]
    fn test_ordering_matches_hex_order() {
        let mut ids = vec![
            PeerId::derive("c", 1),
            PeerId::derive("a", 1),
            PeerId::derive("b", 1),
        ];
        ids.sort();
        let hex: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut sorted_hex = hex.clone();
        sorted_hex.sort();
        assert_eq!(hex, sorted_hex);
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = PeerId::derive("node-a", 7070);
        let json = serde_json::to_string(&original).unwrap();
        let parsed: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
