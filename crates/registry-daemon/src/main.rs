//! registry-daemon: a peer node for decentralized service discovery.
//!
//! Maintains authenticated TCP links to every configured peer and
//! replicates the service registry between them with gossip anti-entropy.

use anyhow::Result;
use clap::Parser;
use registry_daemon::config::NodeConfig;
use registry_daemon::node::Node;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "registry-daemon")]
#[command(about = "Gossip-replicated service registry node")]
struct Args {
    /// Host other peers use to reach this node
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = registry_core::directory::DEFAULT_PORT)]
    port: u16,

    /// Peer endpoint as host:port; repeat for every cluster member
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Shared secret for the link handshake
    #[arg(long)]
    secret: String,

    /// Seconds between gossip rounds
    #[arg(long, default_value_t = 10)]
    gossip_interval: u64,

    /// Request/response timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    response_timeout: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,registry_daemon=debug"
    } else {
        "info,registry_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting registry-daemon");
    info!("Listen address: {}:{}", args.host, args.port);

    let mut cfg = NodeConfig::new(args.host, args.port, args.peers, args.secret);
    cfg.gossip_interval = Duration::from_secs(args.gossip_interval);
    cfg.response_timeout = Duration::from_millis(args.response_timeout);

    let node = Node::start(cfg).await?;
    info!("Node running as {}. Press Ctrl+C to stop.", node.self_id());
    let handle = node.spawn();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.stop().await;
    info!("Shutting down");
    Ok(())
}
