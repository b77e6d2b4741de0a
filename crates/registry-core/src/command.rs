//! Wire commands.
//!
//! A closed union of every message the mesh exchanges, wrapped in an
//! [`Envelope`] carrying the correlation metadata for request/response
//! pairing. Dispatch happens over [`CommandKind`], so an unknown or
//! unhandled command is dropped without touching the connection.

use crate::handshake::RegisterPayload;
use crate::store::{Digest, ServiceRecord};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Every command the protocol knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// First frame on any link: authenticates the sender.
    Register(RegisterPayload),
    /// Liveness probe; answered with the responder's clock.
    Ping { ts: u64 },
    /// Anti-entropy summary of local record versions.
    GossipDigest { digest: Digest },
    /// Full records pushed to a peer that is behind.
    GossipRecords { records: Vec<ServiceRecord> },
    /// Request for the full records backing the listed ids; answered with
    /// a `GossipRecords` response.
    GossipFetch { record_ids: Vec<String> },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Register(_) => CommandKind::Register,
            Command::Ping { .. } => CommandKind::Ping,
            Command::GossipDigest { .. } => CommandKind::GossipDigest,
            Command::GossipRecords { .. } => CommandKind::GossipRecords,
            Command::GossipFetch { .. } => CommandKind::GossipFetch,
        }
    }
}

/// The dispatchable tag of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Register,
    Ping,
    GossipDigest,
    GossipRecords,
    GossipFetch,
}

impl Display for CommandKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::Register => "register-socket",
            CommandKind::Ping => "ping",
            CommandKind::GossipDigest => "gossip-digest",
            CommandKind::GossipRecords => "gossip-record",
            CommandKind::GossipFetch => "gossip-fetch-services",
        };
        f.write_str(name)
    }
}

/// One logical message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id: present on a request awaiting a reply, and echoed
    /// back on the matching response.
    pub id: Option<u64>,
    /// Marks a reply travelling back to a pending request.
    pub is_response: bool,
    /// Sender wall clock, unix milliseconds.
    pub ts: Option<u64>,
    pub payload: Command,
}

impl Envelope {
    /// A fire-and-forget message: no reply expected.
    pub fn event(payload: Command) -> Self {
        Self {
            id: None,
            is_response: false,
            ts: None,
            payload,
        }
    }

    /// A request that expects a same-id response.
    pub fn request(id: u64, payload: Command) -> Self {
        Self {
            id: Some(id),
            is_response: false,
            ts: None,
            payload,
        }
    }

    /// The reply to a request carrying `id`.
    pub fn response(id: u64, payload: Command) -> Self {
        Self {
            id: Some(id),
            is_response: true,
            ts: None,
            payload,
        }
    }

    pub fn with_ts(mut self, ts: u64) -> Self {
        self.ts = Some(ts);
        self
    }
}
