//! Node configuration.
//!
//! One static options struct assembled at startup; nothing here changes at
//! runtime. Membership is fixed: the peer list given here is the whole
//! cluster.

use registry_core::backoff::ReconnectConfig;
use registry_core::handshake::DEFAULT_DRIFT;
use std::time::Duration;

/// How long a correlated call waits for its response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between anti-entropy rounds.
pub const DEFAULT_GOSSIP_INTERVAL: Duration = Duration::from_secs(10);
/// How long a write waits for a full send buffer to drain before the peer
/// is treated as unresponsive.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle period between marking the node closed and tearing sockets down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Static options for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host other peers use to reach this node.
    pub host: String,
    /// TCP port this node listens on.
    pub port: u16,
    /// The full cluster membership as `host:port` strings. May or may not
    /// include this node's own endpoint.
    pub peers: Vec<String>,
    /// Shared secret for the link handshake.
    pub shared_secret: String,
    pub response_timeout: Duration,
    pub gossip_interval: Duration,
    pub drain_timeout: Duration,
    /// Allowed clock skew on incoming register frames.
    pub handshake_drift: Duration,
    pub shutdown_grace: Duration,
    pub reconnect: ReconnectConfig,
}

impl NodeConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        peers: Vec<String>,
        shared_secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            peers,
            shared_secret: shared_secret.into(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            gossip_interval: DEFAULT_GOSSIP_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            handshake_drift: DEFAULT_DRIFT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// The local listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
