//! Message routing: dispatch and correlated calls.
//!
//! Inbound envelopes either resolve a pending call (responses, matched by
//! correlation id) or go to the handler registered for their command kind
//! in a dispatch table built once at startup. Outbound, [`RouterHandle`]
//! is the narrow send capability handed to the upper layers: plain sends,
//! broadcast, and the timeout-bounded `call` primitive.

use crate::connection::{now_ms, PeerLink, SendError};
use crate::manager::SharedLinks;
use futures::future::BoxFuture;
use registry_core::command::{Command, CommandKind, Envelope};
use registry_core::peer_id::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A registered command handler. Returning `Some` sends the command back
/// as the response when the inbound envelope carried a correlation id.
pub type HandlerFn = Box<dyn Fn(PeerId, Command) -> BoxFuture<'static, Option<Command>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("No live link for peer {0}")]
    UnknownPeer(PeerId),
    #[error("Link write failed: {0}")]
    LinkFailed(#[from] SendError),
}

/// How a correlated call ended. A timeout is a normal, handleable outcome
/// here, not an error: the peer may simply be slow or gone.
#[derive(Debug, PartialEq)]
pub enum CallOutcome {
    Reply(Command),
    Timeout,
}

/// Cheap-to-clone send capability over the live links.
#[derive(Clone)]
pub struct RouterHandle {
    links: SharedLinks,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Envelope>>>>,
    next_call_id: Arc<AtomicU64>,
    response_timeout: Duration,
}

impl RouterHandle {
    pub fn new(links: SharedLinks, response_timeout: Duration) -> Self {
        Self {
            links,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_call_id: Arc::new(AtomicU64::new(0)),
            response_timeout,
        }
    }

    /// Peers with a live, registered link right now.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Send one command to a peer, expecting no reply.
    pub async fn send_to(&self, peer: &PeerId, command: Command) -> Result<(), RouteError> {
        let link = self.link(peer)?;
        self.write(&link, &Envelope::event(command).with_ts(now_ms()))
            .await
    }

    /// Send the response to a request that carried `id`.
    pub async fn respond(&self, peer: &PeerId, id: u64, command: Command) -> Result<(), RouteError> {
        let link = self.link(peer)?;
        self.write(&link, &Envelope::response(id, command).with_ts(now_ms()))
            .await
    }

    /// Send a request and wait for its same-id response, bounded by the
    /// response timeout.
    ///
    /// Concurrent calls multiplex freely over one socket; the correlation
    /// id is the only demultiplexing key. The timeout cancels only this
    /// call's wait, never the write or other pending calls.
    pub async fn call(&self, peer: &PeerId, command: Command) -> Result<CallOutcome, RouteError> {
        let link = self.link(peer)?;

        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let envelope = Envelope::request(id, command).with_ts(now_ms());
        if let Err(e) = self.write(&link, &envelope).await {
            // release the waiter; nothing will ever resolve it
            self.remove_pending(id);
            return Err(e);
        }

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(envelope)) => Ok(CallOutcome::Reply(envelope.payload)),
            // waiter dropped without a response; treat like a timeout
            Ok(Err(_)) => Ok(CallOutcome::Timeout),
            Err(_) => {
                self.remove_pending(id);
                Ok(CallOutcome::Timeout)
            }
        }
    }

    /// Best-effort send to every connected peer; failures are logged and
    /// do not stop the fan-out.
    pub async fn broadcast(&self, command: Command) {
        for peer in self.connected_peers() {
            if let Err(e) = self.send_to(&peer, command.clone()).await {
                warn!("Broadcast to {} failed: {}", peer.short(), e);
            }
        }
    }

    /// Resolve the pending waiter for a response envelope. Returns whether
    /// a waiter was still registered under the id.
    pub(crate) fn resolve_pending(&self, id: u64, envelope: Envelope) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match waiter {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    fn remove_pending(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn link(&self, peer: &PeerId) -> Result<Arc<PeerLink>, RouteError> {
        self.links
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
            .ok_or_else(|| RouteError::UnknownPeer(peer.clone()))
    }

    /// Write one envelope; a connection-fatal failure destroys the link so
    /// the reconnect path can rebuild it.
    async fn write(&self, link: &Arc<PeerLink>, envelope: &Envelope) -> Result<(), RouteError> {
        match link.send(envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_connection_fatal() {
                    warn!("Destroying link to {}: {}", link.peer_id().short(), e);
                    link.destroy();
                }
                Err(RouteError::LinkFailed(e))
            }
        }
    }
}

/// The dispatch half: a static `kind -> handler` table built at startup.
pub struct MessageRouter {
    handle: RouterHandle,
    handlers: HashMap<CommandKind, HandlerFn>,
}

impl MessageRouter {
    pub fn new(handle: RouterHandle) -> Self {
        Self {
            handle,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for one command kind. Later registrations
    /// replace earlier ones.
    pub fn register<F>(&mut self, kind: CommandKind, handler: F)
    where
        F: Fn(PeerId, Command) -> BoxFuture<'static, Option<Command>> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// The send capability backing this router.
    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Route one inbound envelope.
    ///
    /// Responses resolve their pending call and never reach a handler.
    /// Requests run their handler on a spawned task so a slow handler
    /// cannot stall the event loop; a handler result is written back as
    /// the response when the request carried a correlation id. Envelopes
    /// with no registered handler are dropped.
    pub fn dispatch(&self, from: PeerId, envelope: Envelope) {
        if envelope.is_response {
            if let Some(id) = envelope.id {
                if !self.handle.resolve_pending(id, envelope) {
                    debug!("Late or unknown response {} from {}", id, from.short());
                }
            }
            return;
        }

        let kind = envelope.payload.kind();
        let Some(handler) = self.handlers.get(&kind) else {
            debug!("No handler for {}, dropping frame from {}", kind, from.short());
            return;
        };

        let reply_to = envelope.id;
        let future = handler(from.clone(), envelope.payload);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let result = future.await;
            if let (Some(reply), Some(id)) = (result, reply_to) {
                if let Err(e) = handle.respond(&from, id, reply).await {
                    warn!("Failed to send response to {}: {}", from.short(), e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{read_loop, LinkEvent};
    use registry_core::frame::{encode_frame, FrameDecoder};
    use std::collections::HashMap as StdHashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::RwLock;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::{mpsc, watch};

    fn peer() -> PeerId {
        PeerId::derive("node-b", 7070)
    }

    fn empty_links() -> SharedLinks {
        Arc::new(RwLock::new(StdHashMap::new()))
    }

    async fn linked_pair(peer_id: PeerId) -> (SharedLinks, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (_reader, writer) = client.into_split();
        let link = Arc::new(PeerLink::new(
            peer_id.clone(),
            1,
            writer,
            Duration::from_secs(5),
        ));

        let links = empty_links();
        links.write().unwrap().insert(peer_id, link);
        (links, server)
    }

    // ==================== Call primitive ====================

    #[tokio::test]
    async fn test_call_unknown_peer() {
        let handle = RouterHandle::new(empty_links(), Duration::from_millis(100));
        let result = handle.call(&peer(), Command::Ping { ts: 1 }).await;
        assert!(matches!(result, Err(RouteError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_call_times_out_against_silent_peer() {
        let (links, _server) = linked_pair(peer()).await;
        let handle = RouterHandle::new(links, Duration::from_millis(100));

        let start = Instant::now();
        let outcome = handle.call(&peer(), Command::Ping { ts: 1 }).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcome, CallOutcome::Timeout);
        assert!(elapsed >= Duration::from_millis(100), "resolved early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "excessive slack: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_call_resolved_by_response() {
        // a fake peer that answers every request with a ping reply
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut server, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = server.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                for envelope in decoder.push(&buf[..n]).unwrap() {
                    let id = envelope.id.unwrap();
                    let reply = Envelope::response(id, Command::Ping { ts: 99 });
                    server.write_all(&encode_frame(&reply).unwrap()).await.unwrap();
                }
            }
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut reader, writer) = client.into_split();
        let link = Arc::new(PeerLink::new(peer(), 1, writer, Duration::from_secs(5)));

        let links = empty_links();
        links.write().unwrap().insert(peer(), link.clone());
        let handle = RouterHandle::new(links, Duration::from_secs(2));
        let router = Arc::new(MessageRouter::new(handle.clone()));

        // pump inbound frames through dispatch, like the node loop does
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            read_loop(&mut reader, &mut decoder, &link, &events_tx, &mut shutdown_rx).await;
        });
        let pump_router = router.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let LinkEvent::Command { from, envelope } = event {
                    pump_router.dispatch(from, envelope);
                }
            }
        });

        let outcome = handle.call(&peer(), Command::Ping { ts: 1 }).await.unwrap();
        assert_eq!(outcome, CallOutcome::Reply(Command::Ping { ts: 99 }));
    }

    #[tokio::test]
    async fn test_correlation_ids_unique() {
        let (links, _server) = linked_pair(peer()).await;
        let handle = RouterHandle::new(links, Duration::from_millis(50));

        // concurrent calls against a silent peer must not collide
        let calls: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.call(&peer(), Command::Ping { ts: 1 }).await })
            })
            .collect();
        for call in calls {
            assert_eq!(call.await.unwrap().unwrap(), CallOutcome::Timeout);
        }

        // every waiter was released
        assert!(handle.pending.lock().unwrap().is_empty());
    }

    // ==================== Dispatch ====================

    #[tokio::test]
    async fn test_dispatch_skips_unregistered_kind() {
        let handle = RouterHandle::new(empty_links(), Duration::from_millis(50));
        let mut router = MessageRouter::new(handle);

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        router.register(CommandKind::Ping, move |_, _| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                None
            })
        });

        // no handler for digests: dropped, no panic
        router.dispatch(
            peer(),
            Envelope::event(Command::GossipDigest { digest: Default::default() }),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!called.load(Ordering::SeqCst));

        router.dispatch(peer(), Envelope::event(Command::Ping { ts: 1 }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_response_never_reaches_handler() {
        let handle = RouterHandle::new(empty_links(), Duration::from_millis(50));
        let mut router = MessageRouter::new(handle);

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        router.register(CommandKind::Ping, move |_, _| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                None
            })
        });

        router.dispatch(peer(), Envelope::response(7, Command::Ping { ts: 1 }));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!called.load(Ordering::SeqCst));
    }
}
