//! Individual peer links.
//!
//! Each socket is owned by exactly one read task that drives the frame
//! decoder and forwards decoded envelopes over the event channel. The
//! write half lives in a [`PeerLink`], serialized behind an async mutex
//! and aware of OS send-buffer pressure: a write that cannot be enqueued
//! waits once for the socket to drain, and a second failure marks the
//! peer unresponsive.

use registry_core::command::{Command, Envelope};
use registry_core::frame::{encode_frame, FrameDecoder, FrameError};
use registry_core::handshake::{HandshakeError, LinkAuthenticator};
use registry_core::peer_id::PeerId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Read buffer size for one recv call.
const READ_CHUNK: usize = 64 * 1024;

/// Current wall clock, unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Event emitted by a socket task.
#[derive(Debug)]
pub enum LinkEvent {
    /// A socket completed registration and is ready for traffic.
    Registered { link: Arc<PeerLink> },
    /// A decoded envelope from a registered peer.
    Command { from: PeerId, envelope: Envelope },
    /// A registered socket's read side finished. `link_id` lets the
    /// manager tell a stale notice from one about the current socket.
    Closed { peer_id: PeerId, link_id: u64 },
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Frame encode failed: {0}")]
    Encode(#[from] FrameError),
    #[error("Socket write failed: {0}")]
    Io(#[from] io::Error),
    #[error("Persistent backpressure, send buffer never drained")]
    Backpressure,
}

impl SendError {
    /// Whether the link is no longer usable after this error. A bad
    /// envelope is local to one frame; everything else poisons the socket.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, SendError::Encode(_))
    }
}

/// The writable side of one live socket to a peer.
///
/// At most one `PeerLink` per peer id is registered at a time; a newly
/// registered link replaces (and destroys) any previous one.
#[derive(Debug)]
pub struct PeerLink {
    peer_id: PeerId,
    link_id: u64,
    writer: Mutex<OwnedWriteHalf>,
    closed: Notify,
    drain_timeout: Duration,
}

impl PeerLink {
    pub fn new(peer_id: PeerId, link_id: u64, writer: OwnedWriteHalf, drain_timeout: Duration) -> Self {
        Self {
            peer_id,
            link_id,
            writer: Mutex::new(writer),
            closed: Notify::new(),
            drain_timeout,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    /// Encode and write one envelope, respecting send-buffer pressure.
    ///
    /// The frame is first written non-blocking. If the OS buffer fills up
    /// mid-frame, we wait for the socket to become writable again, bounded
    /// by the drain timeout, and retry exactly once. A retry that still
    /// cannot complete reports [`SendError::Backpressure`]; the caller is
    /// expected to destroy the link, since a torn frame cannot be resumed.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        let frame = encode_frame(envelope)?;
        let writer = self.writer.lock().await;

        let mut written = try_write_all(&writer, &frame)?;
        if written == frame.len() {
            return Ok(());
        }

        match timeout(self.drain_timeout, writer.writable()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(SendError::Io(e)),
            Err(_) => return Err(SendError::Backpressure),
        }

        written += try_write_all(&writer, &frame[written..])?;
        if written < frame.len() {
            return Err(SendError::Backpressure);
        }
        Ok(())
    }

    /// Tear the link down: the read task exits and, once the manager drops
    /// its mapping, the socket closes. Idempotent.
    pub fn destroy(&self) {
        self.closed.notify_one();
    }

    /// Resolves once `destroy` has been called.
    pub(crate) async fn wait_destroyed(&self) {
        self.closed.notified().await;
    }
}

/// Write as much of `buf` as the socket accepts without blocking.
fn try_write_all(writer: &OwnedWriteHalf, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match writer.try_write(&buf[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Pump a registered socket: decode frames in stream order and forward
/// them as events until the socket dies, the link is destroyed, or the
/// node shuts down.
pub(crate) async fn read_loop(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
    link: &Arc<PeerLink>,
    events: &mpsc::UnboundedSender<LinkEvent>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let peer_id = link.peer_id().clone();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = link.wait_destroyed() => {
                debug!("Link to {} destroyed locally", peer_id.short());
                break;
            }
            _ = shutdown.changed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Connection {} stream ended", peer_id.short());
                    break;
                }
                Ok(n) => match decoder.push(&buf[..n]) {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            let _ = events.send(LinkEvent::Command {
                                from: peer_id.clone(),
                                envelope,
                            });
                        }
                    }
                    Err(e) => {
                        warn!("Protocol error on link {}: {}", peer_id.short(), e);
                        break;
                    }
                },
                Err(e) => {
                    debug!("Read error on link {}: {}", peer_id.short(), e);
                    break;
                }
            }
        }
    }

    decoder.reset();
}

/// Drive one accepted socket: await a single valid register frame, then
/// run the normal read loop under the authenticated peer id.
///
/// Sockets that fail registration are destroyed silently; only registered
/// links produce `Closed` events.
pub(crate) async fn run_accepted(
    stream: TcpStream,
    addr: SocketAddr,
    link_id: u64,
    auth: Arc<LinkAuthenticator>,
    drain_timeout: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    // The first frame must be a valid register command; anything else
    // destroys the socket with no partial trust state.
    let (peer_id, early) = loop {
        let n = tokio::select! {
            _ = shutdown.changed() => return,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Connection from {} closed before registering", addr);
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!("Read error from unregistered {}: {}", addr, e);
                    return;
                }
            }
        };

        let mut envelopes = match decoder.push(&buf[..n]) {
            Ok(envelopes) => envelopes,
            Err(e) => {
                warn!("Protocol error from unregistered {}: {}", addr, e);
                return;
            }
        };
        if envelopes.is_empty() {
            continue;
        }

        let first = envelopes.remove(0);
        match validate_register(&auth, &first) {
            Ok(peer_id) => break (peer_id, envelopes),
            Err(e) => {
                warn!("Destroying connection from {}: {}", addr, e);
                return;
            }
        }
    };

    info!("Registered inbound link from {} ({})", peer_id.short(), addr);
    let link = Arc::new(PeerLink::new(peer_id.clone(), link_id, writer, drain_timeout));
    if events.send(LinkEvent::Registered { link: link.clone() }).is_err() {
        return;
    }

    // frames that rode in on the same chunk as the register command
    for envelope in early {
        let _ = events.send(LinkEvent::Command {
            from: peer_id.clone(),
            envelope,
        });
    }

    read_loop(&mut reader, &mut decoder, &link, &events, &mut shutdown).await;
    let _ = events.send(LinkEvent::Closed { peer_id, link_id });
}

/// Check that the first frame on an accepted socket is a well-signed
/// register command.
fn validate_register(
    auth: &LinkAuthenticator,
    envelope: &Envelope,
) -> Result<PeerId, HandshakeError> {
    match &envelope.payload {
        Command::Register(payload) => auth.verify(payload, now_ms()),
        _ => Err(HandshakeError::UnexpectedCommand),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::handshake::DEFAULT_DRIFT;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn peer() -> PeerId {
        PeerId::derive("node-b", 7070)
    }

    // ==================== Sending ====================

    #[tokio::test]
    async fn test_send_produces_decodable_frames() {
        let (client, mut server) = socket_pair().await;
        let (_reader, writer) = client.into_split();
        let link = PeerLink::new(peer(), 1, writer, Duration::from_secs(5));

        let envelope = Envelope::event(Command::Ping { ts: 42 });
        link.send(&envelope).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        let mut decoded = Vec::new();
        while decoded.is_empty() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "socket closed before a frame arrived");
            decoded.extend(decoder.push(&buf[..n]).unwrap());
        }

        assert_eq!(decoded, vec![envelope]);
    }

    // ==================== Read loop ====================

    #[tokio::test]
    async fn test_read_loop_forwards_in_order() {
        let (client, server) = socket_pair().await;
        let (mut reader, writer) = client.into_split();
        let link = Arc::new(PeerLink::new(peer(), 1, writer, Duration::from_secs(5)));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            read_loop(&mut reader, &mut decoder, &link, &events_tx, &mut shutdown_rx).await;
        });

        let sender = {
            let (_reader, writer) = server.into_split();
            PeerLink::new(peer(), 2, writer, Duration::from_secs(5))
        };
        sender.send(&Envelope::event(Command::Ping { ts: 1 })).await.unwrap();
        sender.send(&Envelope::event(Command::Ping { ts: 2 })).await.unwrap();

        for expected in [1, 2] {
            let event = timeout(Duration::from_secs(2), events_rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                LinkEvent::Command { envelope, .. } => {
                    assert_eq!(envelope.payload, Command::Ping { ts: expected });
                }
                other => panic!("expected command event, got {other:?}"),
            }
        }

        drop(sender); // closes the socket, the read loop sees EOF
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_destroy_stops_read_loop() {
        let (client, _server) = socket_pair().await;
        let (mut reader, writer) = client.into_split();
        let link = Arc::new(PeerLink::new(peer(), 1, writer, Duration::from_secs(5)));

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_link = link.clone();
        let task = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            read_loop(&mut reader, &mut decoder, &loop_link, &events_tx, &mut shutdown_rx).await;
        });

        link.destroy();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    // ==================== Register validation ====================

    #[test]
    fn test_validate_register_accepts_signed_frame() {
        let auth = LinkAuthenticator::new(b"secret".to_vec(), DEFAULT_DRIFT);
        let envelope = Envelope::event(Command::Register(auth.build_register(&peer(), now_ms())));
        assert_eq!(validate_register(&auth, &envelope), Ok(peer()));
    }

    #[test]
    fn test_validate_register_rejects_other_commands() {
        let auth = LinkAuthenticator::new(b"secret".to_vec(), DEFAULT_DRIFT);
        let envelope = Envelope::event(Command::Ping { ts: 1 });
        assert_eq!(
            validate_register(&auth, &envelope),
            Err(HandshakeError::UnexpectedCommand)
        );
    }
}
