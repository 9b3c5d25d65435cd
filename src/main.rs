//! Cairn node binary.
//!
//! Minimal wiring around the DHT core: a UDP transport, the bootstrap
//! manager, the maintainer, and optional LAN discovery. Higher layers
//! (messaging, friend lists) live elsewhere; this binary only joins the
//! network and keeps the routing table warm.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cairn::dht::{
    BootstrapManager, DhtConfig, LanDiscovery, Maintainer, NegotiatingHandshake, NodeCache,
    RoutingTable, Transport, UdpTransport, VersionedHandshake,
};
use cairn::{Address, KeyPair, NodeId, system_clock};

/// Cairn version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cairn", version, about = "Cairn: DHT node")]
struct Args {
    /// UDP port for DHT traffic
    #[arg(short, long, default_value = "33445")]
    port: u16,

    /// Bootstrap node as pubkeyhex@host:port (repeatable)
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Node cache file, loaded at startup and saved at shutdown
    #[arg(short, long)]
    cache_file: Option<PathBuf>,

    /// Broadcast LAN discovery beacons and listen for them on port+1
    #[arg(long)]
    lan_discovery: bool,

    /// Disable Noise-IK version negotiation (legacy packets only)
    #[arg(long)]
    legacy_only: bool,
}

fn parse_bootstrap(entry: &str) -> Result<(String, SocketAddr), String> {
    let (hex, addr) = entry
        .split_once('@')
        .ok_or_else(|| format!("expected pubkeyhex@host:port, got {entry}"))?;
    let socket: SocketAddr = addr
        .parse()
        .map_err(|e| format!("invalid address {addr}: {e}"))?;
    Ok((hex.to_string(), socket))
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cairn=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let keypair = KeyPair::generate();
    let self_key = *keypair.public_key();
    let clock = system_clock();
    let config = DhtConfig {
        versioned_handshakes: !args.legacy_only,
        ..Default::default()
    };

    info!("════════════════════════════════════════════════════════════");
    info!("  Cairn v{VERSION} - DHT node");
    info!("════════════════════════════════════════════════════════════");
    info!("Node pubkey: {}", self_key.to_hex());
    info!("Port: {}", args.port);

    let transport = match UdpTransport::bind(args.port).await {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to bind UDP port {}: {}", args.port, e);
            return;
        }
    };

    let routing = Arc::new(RoutingTable::new(
        NodeId::from_public_key(self_key),
        &config,
        clock.clone(),
    ));

    let handshake: Option<Arc<dyn VersionedHandshake>> = if config.versioned_handshakes {
        Some(Arc::new(NegotiatingHandshake::new(
            self_key,
            config.send_timeout_secs,
        )))
    } else {
        None
    };

    let manager = BootstrapManager::new(
        config.clone(),
        routing.clone(),
        transport.clone(),
        clock.clone(),
        handshake,
    );
    manager.register();

    for entry in &args.bootstrap {
        match parse_bootstrap(entry) {
            Ok((hex, socket)) => {
                let address = Address::from_socket_addr(socket);
                if let Err(e) = manager.add_bootstrap(address, &hex).await {
                    warn!("Rejected bootstrap node {entry}: {e}");
                }
            }
            Err(e) => warn!("Rejected bootstrap node: {e}"),
        }
    }

    // Reseed from a previous run before going to the network.
    if let Some(path) = &args.cache_file
        && path.exists()
    {
        match NodeCache::load(path) {
            Ok(cache) => {
                let restored = cache.restore(&routing, clock.now_secs());
                info!("Restored {restored} cached nodes");
            }
            Err(e) => warn!("Ignoring node cache: {e}"),
        }
    }

    let maintainer = Arc::new(Maintainer::new(
        config.clone(),
        manager.clone(),
        transport.clone(),
        clock.clone(),
    ));
    maintainer.start().await;

    // LAN discovery: beacons go out one port up; a second socket listens
    // there and feeds the same dispatcher.
    let lan = if args.lan_discovery {
        let lan = LanDiscovery::new(transport.clone(), self_key, args.port);
        match UdpTransport::bind(lan.discovery_port()).await {
            Ok(listener) => {
                listener.register_handler(cairn::PacketType::LanDiscovery, manager.clone());
                lan.start().await;
                Some((lan, listener))
            }
            Err(e) => {
                warn!("LAN discovery disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    if !args.bootstrap.is_empty() {
        let manager = manager.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            match manager.bootstrap(cancel).await {
                Ok(()) => info!("Joined the network"),
                Err(e) => error!("Bootstrap failed: {e}"),
            }
        });
    } else {
        info!("No bootstrap nodes; waiting for inbound peers");
    }

    // Status printer
    {
        let routing = routing.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let stats = routing.stats();
                info!(
                    "Status: {} nodes ({} good, {} unknown, {} bad)",
                    stats.total, stats.good, stats.unknown, stats.bad
                );
            }
        });
    }

    info!("Cairn running. Waiting for peers...");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    shutdown.cancel();
    maintainer.stop().await;
    if let Some((lan, listener)) = lan {
        lan.stop().await;
        listener.close().await;
    }

    if let Some(path) = &args.cache_file {
        let cache = NodeCache::snapshot(&routing);
        match cache.save(path) {
            Ok(()) => info!("Saved {} nodes to cache", cache.len()),
            Err(e) => warn!("Failed to save node cache: {e}"),
        }
    }
    transport.close().await;
}
