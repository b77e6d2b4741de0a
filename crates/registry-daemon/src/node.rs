//! Node assembly and lifecycle.
//!
//! Wires the components together in their dependency order (directory,
//! transport, router, gossip engine) and drives the accept/dispatch loop.
//! All link-map mutation happens on this loop; socket tasks only feed it
//! events.

use crate::config::NodeConfig;
use crate::connection::LinkEvent;
use crate::gossip::GossipEngine;
use crate::manager::ConnectionManager;
use crate::registry::RegistryHandle;
use crate::router::{MessageRouter, RouterHandle};
use anyhow::Result;
use registry_core::directory::PeerDirectory;
use registry_core::handshake::LinkAuthenticator;
use registry_core::peer_id::PeerId;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A fully wired node, bound but not yet running.
pub struct Node {
    directory: Arc<PeerDirectory>,
    registry: RegistryHandle,
    manager: ConnectionManager,
    router: Arc<MessageRouter>,
    handle: RouterHandle,
    listener: TcpListener,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    gossip_task: JoinHandle<()>,
}

impl Node {
    /// Build every component, bind the listener and start the dialers and
    /// the gossip cycle. Fails on configuration errors (own endpoint
    /// missing from the membership) or if the listen address is taken.
    pub async fn start(cfg: NodeConfig) -> Result<Self> {
        let cfg = Arc::new(cfg);

        let directory = Arc::new(PeerDirectory::new(&cfg.host, cfg.port, &cfg.peers)?);
        info!(
            "[{}] membership: {} peer(s), {} to dial",
            directory.self_id().short(),
            directory.others().len(),
            directory.dial_targets().count()
        );

        let auth = Arc::new(LinkAuthenticator::new(
            cfg.shared_secret.as_bytes().to_vec(),
            cfg.handshake_drift,
        ));
        let registry = RegistryHandle::new(directory.self_id().clone());

        let (manager, events_rx) = ConnectionManager::new(cfg.clone(), directory.clone(), auth);
        let listener = ConnectionManager::bind(&cfg.listen_addr()).await?;

        let handle = RouterHandle::new(manager.links(), cfg.response_timeout);
        let engine = Arc::new(GossipEngine::new(
            directory.self_id().clone(),
            registry.clone(),
            handle.clone(),
            cfg.gossip_interval,
        ));

        let mut router = MessageRouter::new(handle.clone());
        engine.register_handlers(&mut router);
        let router = Arc::new(router);

        let gossip_task = engine.spawn_cycle(manager.shutdown_signal());
        manager.start_dialers();

        Ok(Self {
            directory,
            registry,
            manager,
            router,
            handle,
            listener,
            events_rx,
            gossip_task,
        })
    }

    pub fn self_id(&self) -> &PeerId {
        self.directory.self_id()
    }

    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    pub fn router(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Detach the node onto its own task and return the control handle.
    pub fn spawn(self) -> NodeHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let router = self.handle.clone();
        let self_id = self.directory.self_id().clone();
        let task = tokio::spawn(self.run(stop_rx));

        NodeHandle {
            registry,
            router,
            self_id,
            stop_tx,
            task,
        }
    }

    /// The accept/dispatch loop. Runs until stopped, then tears the
    /// transport down gracefully.
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let Node {
            manager,
            router,
            listener,
            mut events_rx,
            gossip_task,
            ..
        } = self;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => manager.accept_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                event = events_rx.recv() => match event {
                    Some(LinkEvent::Registered { link }) => manager.register_link(link),
                    Some(LinkEvent::Command { from, envelope }) => router.dispatch(from, envelope),
                    Some(LinkEvent::Closed { peer_id, link_id }) => {
                        manager.unregister_link(&peer_id, link_id)
                    }
                    None => break,
                },
            }
        }

        manager.shutdown().await;
        let _ = gossip_task.await;
        info!("Node stopped");
    }
}

/// Control handle for a running node.
pub struct NodeHandle {
    /// Local-collaborator surface for registration callers.
    pub registry: RegistryHandle,
    /// Send capability over the node's links.
    pub router: RouterHandle,
    self_id: PeerId,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// Stop the node and wait for the graceful teardown to finish.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}
