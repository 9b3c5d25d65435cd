//! LAN discovery beacon.
//!
//! Announces this node on the local network every ten seconds: a 34-byte
//! `public_key[32] || port(u16 BE)` payload sent to the limited broadcast
//! address and the common private-network directed broadcasts, one port
//! above the DHT port. Peers that hear a beacon add the sender to their
//! routing table and probe it like any other node.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dht::address::Address;
use crate::dht::packet::Packet;
use crate::dht::transport::Transport;
use crate::dht::types::LAN_DISCOVERY_INTERVAL_SECS;
use crate::types::PublicKey;

/// Limited broadcast plus directed broadcasts for the RFC 1918 ranges.
pub const BROADCAST_TARGETS: [[u8; 4]; 4] = [
    [255, 255, 255, 255],
    [192, 168, 255, 255],
    [10, 255, 255, 255],
    [172, 31, 255, 255],
];

/// Periodic beacon sender. `Stopped → Running → Stopped`, idempotent both
/// ways.
pub struct LanDiscovery {
    transport: Arc<dyn Transport>,
    self_key: PublicKey,
    /// The DHT port we advertise; beacons go out on this port plus one.
    dht_port: u16,
    inner: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LanDiscovery {
    pub fn new(transport: Arc<dyn Transport>, self_key: PublicKey, dht_port: u16) -> Self {
        Self { transport, self_key, dht_port, inner: tokio::sync::Mutex::new(None) }
    }

    /// Port beacons are sent to (and listened on).
    pub fn discovery_port(&self) -> u16 {
        self.dht_port.wrapping_add(1)
    }

    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let task = tokio::spawn(beacon_loop(
            self.transport.clone(),
            self.self_key,
            self.dht_port,
            cancel.clone(),
        ));
        *inner = Some((cancel, task));
        info!(port = self.discovery_port(), "lan discovery started");
    }

    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some((cancel, task)) = inner.take() else {
            return;
        };
        cancel.cancel();
        let _ = task.await;
    }
}

async fn beacon_loop(
    transport: Arc<dyn Transport>,
    self_key: PublicKey,
    dht_port: u16,
    cancel: CancellationToken,
) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(LAN_DISCOVERY_INTERVAL_SECS));
    let discovery_port = dht_port.wrapping_add(1);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        let packet = Packet::lan_discovery(&self_key, dht_port);
        for octets in BROADCAST_TARGETS {
            let target = Address::ipv4(octets, discovery_port);
            // Broadcasts are best-effort by design; the next tick retries.
            if let Err(e) = transport.send(&packet, &target).await {
                debug!(target = %target, error = %e, "lan beacon failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::transport::ChannelTransport;

    #[tokio::test]
    async fn start_stop_idempotent() {
        let transport = ChannelTransport::new("127.0.0.1:33445".parse().unwrap());
        let lan = LanDiscovery::new(transport, PublicKey([1; 32]), 33_445);
        assert_eq!(lan.discovery_port(), 33_446);

        lan.start().await;
        lan.start().await;
        lan.stop().await;
        lan.stop().await;
    }

    #[tokio::test]
    async fn beacons_reach_every_broadcast_target() {
        let transport = ChannelTransport::new("127.0.0.1:33445".parse().unwrap());
        let lan = LanDiscovery::new(transport.clone(), PublicKey([1; 32]), 33_445);
        lan.start().await;

        // interval fires immediately; wait for the first round
        let mut tries = 0;
        while transport.sent_count() < BROADCAST_TARGETS.len() && tries < 100 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            tries += 1;
        }
        lan.stop().await;

        let sent = transport.take_sent();
        assert!(sent.len() >= BROADCAST_TARGETS.len());
        for (packet, addr) in sent.iter().take(BROADCAST_TARGETS.len()) {
            assert_eq!(packet.data.len(), 34);
            assert_eq!(addr.port(), 33_446);
        }
    }
}
