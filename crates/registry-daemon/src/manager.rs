//! Connection manager: listening, dialing and link registration.
//!
//! Owns the `peer id -> link` map. Exactly one live socket exists per
//! peer id at any time; registering a new link under an id that is
//! already mapped destroys the previous socket. The accept path trusts a
//! socket only after its first frame carries a valid signed register
//! command.

use crate::config::NodeConfig;
use crate::connection::{run_accepted, LinkEvent, PeerLink};
use crate::outgoing::run_dialer;
use registry_core::directory::PeerDirectory;
use registry_core::handshake::LinkAuthenticator;
use registry_core::peer_id::PeerId;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// The live link map, shared read-mostly with the router's write path.
/// All mutation happens in the manager.
pub type SharedLinks = Arc<RwLock<HashMap<PeerId, Arc<PeerLink>>>>;

pub struct ConnectionManager {
    cfg: Arc<NodeConfig>,
    directory: Arc<PeerDirectory>,
    auth: Arc<LinkAuthenticator>,
    links: SharedLinks,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    shutdown_tx: watch::Sender<bool>,
    next_link_id: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Create the manager plus the event stream its socket tasks feed.
    pub fn new(
        cfg: Arc<NodeConfig>,
        directory: Arc<PeerDirectory>,
        auth: Arc<LinkAuthenticator>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        (
            Self {
                cfg,
                directory,
                auth,
                links: Arc::new(RwLock::new(HashMap::new())),
                events_tx,
                shutdown_tx,
                next_link_id: Arc::new(AtomicU64::new(1)),
            },
            events_rx,
        )
    }

    /// Bind the cluster listener.
    pub async fn bind(listen_addr: &str) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("TCP listening on {}", listen_addr);
        Ok(listener)
    }

    /// Shared view of the live links (handed to the router).
    pub fn links(&self) -> SharedLinks {
        self.links.clone()
    }

    /// A receiver that flips when the manager shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Hand a freshly accepted socket to its own task. The socket stays
    /// untrusted until that task sees a valid register frame.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if *self.shutdown_tx.borrow() {
            return;
        }

        let link_id = self.next_link_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        debug!("New connection from {} (link {})", addr, link_id);

        tokio::spawn(run_accepted(
            stream,
            addr,
            link_id,
            self.auth.clone(),
            self.cfg.drain_timeout,
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));
    }

    /// Spawn one dialer per peer this node is responsible for reaching.
    pub fn start_dialers(&self) {
        for peer in self.directory.dial_targets() {
            tokio::spawn(run_dialer(
                peer.clone(),
                self.directory.self_id().clone(),
                self.auth.clone(),
                self.cfg.clone(),
                self.next_link_id.clone(),
                self.events_tx.clone(),
                self.shutdown_tx.subscribe(),
            ));
        }
    }

    /// Map a registered socket under its peer id, destroying any previous
    /// socket for that id. The replacement is atomic under the map lock.
    pub fn register_link(&self, link: Arc<PeerLink>) {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = links.insert(link.peer_id().clone(), link.clone()) {
            if prev.link_id() != link.link_id() {
                info!(
                    "Duplicate link for {}, destroying the previous socket",
                    link.peer_id().short()
                );
                prev.destroy();
            }
        }
    }

    /// Drop the mapping for a closed socket. A stale notice about an
    /// already-replaced link is ignored.
    pub fn unregister_link(&self, peer_id: &PeerId, link_id: u64) {
        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        if links.get(peer_id).is_some_and(|l| l.link_id() == link_id) {
            links.remove(peer_id);
            info!(
                "Link closed: [{}] <-> [{}]",
                self.directory.self_id().short(),
                peer_id.short()
            );
        }
    }

    /// Number of registered links.
    pub fn peer_count(&self) -> usize {
        self.links.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop the transport: mark the node closed so socket tasks stop
    /// processing inbound data, give in-flight traffic a settle period,
    /// then destroy every link.
    pub async fn shutdown(&self) {
        info!("Transport shutting down");
        let _ = self.shutdown_tx.send(true);

        tokio::time::sleep(self.cfg.shutdown_grace).await;

        let mut links = self.links.write().unwrap_or_else(|e| e.into_inner());
        for (_, link) in links.drain() {
            link.destroy();
        }
    }
}
