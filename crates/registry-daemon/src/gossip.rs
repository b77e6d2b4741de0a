//! Gossip anti-entropy engine.
//!
//! Every interval, pick one random connected peer and send it our digest.
//! A peer receiving a digest compares versions both ways: records we hold
//! fresher are pushed over, records the sender holds fresher are fetched
//! with a correlated call. Failures are logged and the next cycle retries
//! with a fresh random peer, so convergence only needs liveness, not any
//! particular round succeeding.
//!
//! The engine never touches sockets directly: it is handed the router's
//! narrow send capability and the shared registry handle.

use crate::connection::now_ms;
use crate::registry::RegistryHandle;
use crate::router::{CallOutcome, MessageRouter, RouterHandle};
use registry_core::command::{Command, CommandKind};
use registry_core::peer_id::PeerId;
use registry_core::store::Digest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub struct GossipEngine {
    self_id: PeerId,
    registry: RegistryHandle,
    router: RouterHandle,
    interval: Duration,
}

impl GossipEngine {
    pub fn new(
        self_id: PeerId,
        registry: RegistryHandle,
        router: RouterHandle,
        interval: Duration,
    ) -> Self {
        Self {
            self_id,
            registry,
            router,
            interval,
        }
    }

    /// Install the gossip (and ping) handlers into the dispatch table.
    pub fn register_handlers(self: &Arc<Self>, router: &mut MessageRouter) {
        let engine = self.clone();
        router.register(CommandKind::GossipDigest, move |from, command| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Command::GossipDigest { digest } = command {
                    engine.on_digest(from, digest).await;
                }
                None
            })
        });

        let engine = self.clone();
        router.register(CommandKind::GossipRecords, move |from, command| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Command::GossipRecords { records } = command {
                    let applied = engine.registry.merge_remote(records);
                    debug!("Merged {} pushed record(s) from {}", applied, from.short());
                }
                None
            })
        });

        let engine = self.clone();
        router.register(CommandKind::GossipFetch, move |_from, command| {
            let engine = engine.clone();
            Box::pin(async move {
                match command {
                    Command::GossipFetch { record_ids } => Some(Command::GossipRecords {
                        records: engine.registry.records_for(&record_ids),
                    }),
                    _ => None,
                }
            })
        });

        router.register(CommandKind::Ping, |_from, _command| {
            Box::pin(async move { Some(Command::Ping { ts: now_ms() }) })
        });
    }

    /// Run the periodic digest cycle until shutdown.
    pub fn spawn_cycle(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                self.gossip_cycle().await;
            }

            debug!("Gossip cycle stopped");
        })
    }

    /// One round: random peer, one digest.
    async fn gossip_cycle(&self) {
        let peers = self.router.connected_peers();
        if peers.is_empty() {
            return;
        }

        let target = {
            use rand::Rng;
            peers[rand::rng().random_range(0..peers.len())].clone()
        };

        let digest = self.registry.digest();
        debug!(
            "[{}] gossip digest ({} record(s)) -> {}",
            self.self_id.short(),
            digest.len(),
            target.short()
        );

        if let Err(e) = self
            .router
            .send_to(&target, Command::GossipDigest { digest })
            .await
        {
            warn!("Failed to send digest to {}: {}", target.short(), e);
        }
    }

    /// Reconcile against a peer's digest: push what we hold fresher, pull
    /// what it holds fresher. The two halves are independent and either is
    /// skipped when its candidate set is empty.
    async fn on_digest(&self, from: PeerId, digest: Digest) {
        let diff = self.registry.diff(&digest);
        if diff.is_empty() {
            return;
        }

        if !diff.push_ids.is_empty() {
            let records = self.registry.records_for(&diff.push_ids);
            debug!("Pushing {} fresher record(s) to {}", records.len(), from.short());
            if let Err(e) = self
                .router
                .send_to(&from, Command::GossipRecords { records })
                .await
            {
                warn!("Failed to push records to {}: {}", from.short(), e);
            }
        }

        if !diff.pull_ids.is_empty() {
            debug!(
                "Fetching {} stale record(s) from {}",
                diff.pull_ids.len(),
                from.short()
            );
            match self
                .router
                .call(&from, Command::GossipFetch { record_ids: diff.pull_ids })
                .await
            {
                Ok(CallOutcome::Reply(Command::GossipRecords { records })) => {
                    // versions are re-checked at application time: a record
                    // overtaken since the digest exchange is dropped
                    let applied = self.registry.merge_remote(records);
                    debug!("Merged {} fetched record(s) from {}", applied, from.short());
                }
                Ok(CallOutcome::Reply(other)) => {
                    warn!("Unexpected {} reply to fetch from {}", other.kind(), from.short());
                }
                Ok(CallOutcome::Timeout) => {
                    warn!("Record fetch from {} timed out", from.short());
                }
                Err(e) => {
                    warn!("Record fetch from {} failed: {}", from.short(), e);
                }
            }
        }
    }
}
