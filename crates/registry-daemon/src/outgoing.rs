//! Outgoing peer links.
//!
//! One dialer task per dial target. The task owns the whole lifecycle of
//! its link: connect, announce ourselves with a signed register frame,
//! pump the read loop, and on any disconnect schedule the next attempt
//! with jittered exponential backoff.

use crate::config::NodeConfig;
use crate::connection::{now_ms, read_loop, LinkEvent, PeerLink};
use registry_core::backoff::ReconnectState;
use registry_core::command::{Command, Envelope};
use registry_core::directory::PeerEndpoint;
use registry_core::frame::FrameDecoder;
use registry_core::handshake::LinkAuthenticator;
use registry_core::peer_id::PeerId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Dial `peer` and keep the link alive until shutdown.
///
/// The dial direction is fixed by the membership directory: this task only
/// exists for peers whose id is greater than our own, so the two ends of a
/// pair never race to create duplicate links.
pub(crate) async fn run_dialer(
    peer: PeerEndpoint,
    self_id: PeerId,
    auth: Arc<LinkAuthenticator>,
    cfg: Arc<NodeConfig>,
    next_link_id: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reconnect = ReconnectState::new();

    loop {
        if *shutdown.borrow() {
            return;
        }

        match TcpStream::connect((peer.host.as_str(), peer.port)).await {
            Ok(stream) => {
                reconnect.reset();
                let link_id = next_link_id.fetch_add(1, Ordering::Relaxed);
                let (mut reader, writer) = stream.into_split();
                let link = Arc::new(PeerLink::new(
                    peer.id.clone(),
                    link_id,
                    writer,
                    cfg.drain_timeout,
                ));

                // announce ourselves before any other traffic
                let register = Envelope::event(Command::Register(
                    auth.build_register(&self_id, now_ms()),
                ))
                .with_ts(now_ms());

                match link.send(&register).await {
                    Ok(()) => {
                        info!("[{}] dial {} established", self_id.short(), peer.id.short());
                        if events.send(LinkEvent::Registered { link: link.clone() }).is_err() {
                            return;
                        }

                        let mut decoder = FrameDecoder::new();
                        read_loop(&mut reader, &mut decoder, &link, &events, &mut shutdown).await;

                        let _ = events.send(LinkEvent::Closed {
                            peer_id: peer.id.clone(),
                            link_id,
                        });
                    }
                    Err(e) => warn!("Failed to register with {}: {}", peer.id.short(), e),
                }
            }
            Err(e) => debug!("Dial {} failed: {}", peer.addr(), e),
        }

        if *shutdown.borrow() {
            return;
        }

        let delay = reconnect.next_delay(&cfg.reconnect);
        info!(
            "Scheduled reconnect to {} in {:?} (attempt {})",
            peer.id.short(),
            delay,
            reconnect.attempts()
        );
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
