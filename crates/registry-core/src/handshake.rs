//! Authenticated link registration.
//!
//! The first frame on any socket must be a register command proving the
//! sender knows the cluster's shared secret:
//! `sign = hex(HMAC-SHA256(secret, "{peer_id}:{ts}"))`. The receiving side
//! checks the fields in order (peer id shape, clock drift, signature) and
//! destroys the socket on the first failure; there is no partially trusted
//! state.

use crate::peer_id::PeerId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Allowed skew between the sender's and receiver's clocks.
pub const DEFAULT_DRIFT: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("First frame is not a register command")]
    UnexpectedCommand,
    #[error("Malformed peer id")]
    BadPeerId,
    #[error("Timestamp outside the allowed drift window (skew {skew_ms}ms)")]
    ClockDrift { skew_ms: u64 },
    #[error("HMAC signature mismatch")]
    BadSignature,
}

/// The register frame's payload.
///
/// `peer_id` stays a raw string here so a malformed id is reported as a
/// handshake failure rather than a frame decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub peer_id: String,
    /// Sender wall clock, unix milliseconds.
    pub ts: u64,
    /// `hex(HMAC-SHA256(secret, "{peer_id}:{ts}"))`
    pub sign: String,
}

/// Signs outgoing register frames and verifies incoming ones.
pub struct LinkAuthenticator {
    secret: Vec<u8>,
    drift: Duration,
}

impl LinkAuthenticator {
    pub fn new(secret: impl Into<Vec<u8>>, drift: Duration) -> Self {
        Self {
            secret: secret.into(),
            drift,
        }
    }

    /// Build the signed payload announcing `peer_id` at time `now_ms`.
    pub fn build_register(&self, peer_id: &PeerId, now_ms: u64) -> RegisterPayload {
        RegisterPayload {
            peer_id: peer_id.to_string(),
            ts: now_ms,
            sign: self.sign(peer_id.as_str(), now_ms),
        }
    }

    /// Validate an incoming register payload against the local clock.
    ///
    /// Checks run in order: peer id shape, drift window, signature. The
    /// caller destroys the socket on any error.
    pub fn verify(&self, payload: &RegisterPayload, now_ms: u64) -> Result<PeerId, HandshakeError> {
        let peer_id: PeerId = payload
            .peer_id
            .parse()
            .map_err(|_| HandshakeError::BadPeerId)?;

        let skew_ms = now_ms.abs_diff(payload.ts);
        if skew_ms > self.drift.as_millis() as u64 {
            return Err(HandshakeError::ClockDrift { skew_ms });
        }

        let sign = hex::decode(&payload.sign).map_err(|_| HandshakeError::BadSignature)?;
        let mut mac = self.mac();
        mac.update(format!("{}:{}", payload.peer_id, payload.ts).as_bytes());
        mac.verify_slice(&sign)
            .map_err(|_| HandshakeError::BadSignature)?;

        Ok(peer_id)
    }

    fn sign(&self, peer_id: &str, ts: u64) -> String {
        let mut mac = self.mac();
        mac.update(format!("{peer_id}:{ts}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000_000;

    fn auth() -> LinkAuthenticator {
        LinkAuthenticator::new(b"cluster-secret".to_vec(), DEFAULT_DRIFT)
    }

    fn peer() -> PeerId {
        PeerId::derive("node-b", 7070)
    }

    // ==================== Accept path ====================

    #[test]
    fn test_sign_verify_roundtrip() {
        let payload = auth().build_register(&peer(), NOW);
        assert_eq!(auth().verify(&payload, NOW), Ok(peer()));
    }

    #[test]
    fn test_verify_within_drift_window() {
        let payload = auth().build_register(&peer(), NOW);
        assert!(auth().verify(&payload, NOW + 59_000).is_ok());
        assert!(auth().verify(&payload, NOW - 59_000).is_ok());
    }

    // ==================== Reject path ====================

    #[test]
    fn test_wrong_secret_rejected() {
        let other = LinkAuthenticator::new(b"different-secret".to_vec(), DEFAULT_DRIFT);
        let payload = other.build_register(&peer(), NOW);

        assert_eq!(auth().verify(&payload, NOW), Err(HandshakeError::BadSignature));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        // 120s old against a 60s window
        let payload = auth().build_register(&peer(), NOW - 120_000);
        assert_eq!(
            auth().verify(&payload, NOW),
            Err(HandshakeError::ClockDrift { skew_ms: 120_000 })
        );
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let payload = auth().build_register(&peer(), NOW + 120_000);
        assert!(matches!(
            auth().verify(&payload, NOW),
            Err(HandshakeError::ClockDrift { .. })
        ));
    }

    #[test]
    fn test_bad_peer_id_rejected() {
        let mut payload = auth().build_register(&peer(), NOW);
        payload.peer_id = "not-a-peer-id".into();
        assert_eq!(auth().verify(&payload, NOW), Err(HandshakeError::BadPeerId));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let mut payload = auth().build_register(&peer(), NOW);
        let mut sign = payload.sign.into_bytes();
        sign[0] = if sign[0] == b'0' { b'1' } else { b'0' };
        payload.sign = String::from_utf8(sign).unwrap();

        assert_eq!(auth().verify(&payload, NOW), Err(HandshakeError::BadSignature));
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        let mut payload = auth().build_register(&peer(), NOW);
        payload.sign = "zz".repeat(32);
        assert_eq!(auth().verify(&payload, NOW), Err(HandshakeError::BadSignature));
    }

    #[test]
    fn test_tampered_peer_id_rejected() {
        // signature was computed for a different id
        let mut payload = auth().build_register(&peer(), NOW);
        payload.peer_id = PeerId::derive("node-c", 7070).to_string();
        assert_eq!(auth().verify(&payload, NOW), Err(HandshakeError::BadSignature));
    }
}
