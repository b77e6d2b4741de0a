//! registry-core: protocol and state logic for the gossip service registry.
//!
//! This crate provides the pure pieces of the mesh, shared by the daemon
//! and by anything that needs to speak the protocol:
//! - Deterministic peer identity and the static membership directory
//! - Length-prefixed wire framing and the command envelope
//! - Authenticated link registration (shared-secret HMAC)
//! - The replicated registry store with its anti-entropy operations
//! - Reconnect backoff policy

pub mod backoff;
pub mod command;
pub mod directory;
pub mod frame;
pub mod handshake;
pub mod peer_id;
pub mod store;

pub use backoff::{ReconnectConfig, ReconnectState};
pub use command::{Command, CommandKind, Envelope};
pub use directory::{DirectoryError, PeerDirectory, PeerEndpoint};
pub use frame::{encode_frame, FrameDecoder, FrameError, MAX_BUFFER, PROTOCOL_VERSION};
pub use handshake::{HandshakeError, LinkAuthenticator, RegisterPayload};
pub use peer_id::{PeerId, PeerIdError};
pub use store::{Digest, DigestDiff, RecordDraft, RegistryStore, ServiceRecord};
