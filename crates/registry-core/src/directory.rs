//! Static membership directory.
//!
//! Built once at startup from the configured endpoint list and immutable
//! afterwards. Splits the membership into "self" and "others" and fixes
//! the dial direction for every pair: the node with the smaller id listens,
//! the node with the greater id is dialed.

use crate::peer_id::PeerId;
use std::collections::BTreeMap;
use thiserror::Error;

/// Default TCP port assumed when a peer entry omits one.
pub const DEFAULT_PORT: u16 = 7070;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Own endpoint {0} is missing from the membership list")]
    SelfNotFound(String),
}

/// A configured peer endpoint with its derived id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// The `host:port` dial address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The fixed cluster membership, derived once from configuration.
#[derive(Debug)]
pub struct PeerDirectory {
    this_node: PeerEndpoint,
    others: Vec<PeerEndpoint>,
}

impl PeerDirectory {
    /// Build the directory from our own endpoint and the configured peer
    /// list. Entries are normalized (trimmed, lowercased), deduplicated by
    /// the normalized `host:port` string and sorted by id; malformed
    /// entries with an empty host are dropped.
    ///
    /// Fails only when our own endpoint cannot be located in the derived
    /// list, which is a fatal configuration error.
    pub fn new(self_host: &str, self_port: u16, peers: &[String]) -> Result<Self, DirectoryError> {
        let self_addr = format!("{self_host}:{self_port}");

        let mut entries: BTreeMap<String, PeerEndpoint> = BTreeMap::new();
        for raw in peers.iter().map(String::as_str).chain([self_addr.as_str()]) {
            let Some((host, port)) = parse_endpoint(raw) else {
                continue;
            };
            let key = format!("{host}:{port}");
            entries.entry(key).or_insert_with(|| PeerEndpoint {
                id: PeerId::derive(&host, port),
                host,
                port,
            });
        }

        let mut all: Vec<PeerEndpoint> = entries.into_values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));

        let self_host_norm = self_host.trim().to_ascii_lowercase();
        let self_index = all
            .iter()
            .position(|p| p.host == self_host_norm && p.port == self_port)
            .ok_or(DirectoryError::SelfNotFound(self_addr))?;

        let this_node = all.remove(self_index);

        Ok(Self { this_node, others: all })
    }

    /// Our own endpoint.
    pub fn this_node(&self) -> &PeerEndpoint {
        &self.this_node
    }

    /// Our own derived id.
    pub fn self_id(&self) -> &PeerId {
        &self.this_node.id
    }

    /// Every configured peer except ourselves, sorted by id.
    pub fn others(&self) -> &[PeerEndpoint] {
        &self.others
    }

    /// The peers this node is responsible for dialing: those with an id
    /// strictly greater than our own. The other side of each remaining
    /// pair dials us, so exactly one link per pair is initiated.
    pub fn dial_targets(&self) -> impl Iterator<Item = &PeerEndpoint> {
        self.others.iter().filter(|p| p.id > self.this_node.id)
    }

    /// Look up a peer endpoint by id.
    pub fn get(&self, id: &PeerId) -> Option<&PeerEndpoint> {
        self.others.iter().find(|p| &p.id == id)
    }
}

/// Normalize one `host[:port]` entry. Returns `None` for entries with an
/// empty host; a missing or unparsable port falls back to [`DEFAULT_PORT`].
fn parse_endpoint(raw: &str) -> Option<(String, u16)> {
    let normalized = raw.trim().to_ascii_lowercase();
    let (host, port_str) = match normalized.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (normalized.as_str(), None),
    };

    if host.is_empty() {
        return None;
    }

    let port = port_str
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    Some((host.to_string(), port))
}
