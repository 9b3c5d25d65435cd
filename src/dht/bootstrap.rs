//! Bootstrap orchestration and the packet state machine.
//!
//! The manager owns the seed-node list, drives initial network entry with
//! parallel per-seed workers and exponential backoff, and dispatches every
//! inbound DHT packet: node queries, pings, group announcements, and
//! version negotiation.
//!
//! # Locking
//!
//! `state` (seed list, attempt counter, bootstrapped flag) and
//! `peer_versions` are leaf locks: neither is ever held while calling into
//! the routing table or across a transport send.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dht::address::{Address, NodeEntry, ParserSelector};
use crate::dht::error::DhtError;
use crate::dht::groups::GroupAnnouncement;
use crate::dht::handshake::{
    HANDSHAKE_FLAG_REQUEST, HANDSHAKE_FLAG_RESPONSE, HANDSHAKE_PAYLOAD_SIZE, LATEST_VERSION,
    NegotiatingHandshake, ProtocolVersion, VersionedHandshake,
};
use crate::dht::packet::{Packet, PacketType, sender_key};
use crate::dht::routing::RoutingTable;
use crate::dht::transport::{Transport, TransportError};
use crate::dht::types::{
    BACKOFF_FACTOR, BootstrapNode, DhtConfig, EXTENDED_ENTRY_MIN_SIZE, GET_NODES_PAYLOAD_SIZE,
    LAN_DISCOVERY_PAYLOAD_SIZE, LEGACY_ENTRY_SIZE, MAX_SENT_NODES, Node, NodeStatus,
};
use crate::time::Clock;
use crate::types::{NodeId, PUBLIC_KEY_SIZE, PublicKey};

/// SendNodes header: sender key plus the entry count byte.
const SEND_NODES_HEADER_SIZE: usize = PUBLIC_KEY_SIZE + 1;

struct BootstrapState {
    nodes: Vec<BootstrapNode>,
    attempts: u32,
    bootstrapped: bool,
}

struct WorkerOutcome {
    public_key: PublicKey,
    address: Address,
    version: ProtocolVersion,
    reached: bool,
}

/// Seed-list owner, bootstrap driver, and packet dispatcher.
pub struct BootstrapManager {
    config: DhtConfig,
    routing: Arc<RoutingTable>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    parsers: ParserSelector,
    state: tokio::sync::Mutex<BootstrapState>,
    /// Agreed protocol version per peer, keyed by address string.
    peer_versions: RwLock<HashMap<String, ProtocolVersion>>,
    handshake: Option<Arc<dyn VersionedHandshake>>,
}

impl BootstrapManager {
    pub fn new(
        config: DhtConfig,
        routing: Arc<RoutingTable>,
        transport: Arc<dyn Transport>,
        clock: Clock,
        handshake: Option<Arc<dyn VersionedHandshake>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            routing,
            transport,
            clock,
            parsers: ParserSelector::new(),
            state: tokio::sync::Mutex::new(BootstrapState {
                nodes: Vec::new(),
                attempts: 0,
                bootstrapped: false,
            }),
            peer_versions: RwLock::new(HashMap::new()),
            handshake,
        })
    }

    /// Register this manager for every packet type it dispatches.
    pub fn register(self: &Arc<Self>) {
        for packet_type in [
            PacketType::PingRequest,
            PacketType::PingResponse,
            PacketType::GetNodes,
            PacketType::SendNodes,
            PacketType::LanDiscovery,
            PacketType::GroupAnnounce,
            PacketType::GroupQuery,
            PacketType::GroupQueryResponse,
            PacketType::NoiseHandshake,
        ] {
            self.transport.register_handler(packet_type, self.clone());
        }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    fn self_key(&self) -> PublicKey {
        *self.routing.self_key()
    }

    // =========================================================================
    // SEED LIST
    // =========================================================================

    /// Add or update a seed node. The key is 64 hex chars; seeds are
    /// deduplicated by address string.
    pub async fn add_bootstrap(&self, address: Address, pubkey_hex: &str) -> Result<(), DhtError> {
        let public_key = PublicKey::from_hex(pubkey_hex)?;
        let addr_string = address.to_string();

        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .nodes
            .iter_mut()
            .find(|n| n.address.to_string() == addr_string)
        {
            existing.public_key = public_key;
        } else {
            state.nodes.push(BootstrapNode::new(address, public_key));
        }
        Ok(())
    }

    /// Snapshot of the configured seeds.
    pub async fn bootstrap_nodes(&self) -> Vec<BootstrapNode> {
        self.state.lock().await.nodes.clone()
    }

    pub async fn is_bootstrapped(&self) -> bool {
        self.state.lock().await.bootstrapped
    }

    // =========================================================================
    // BOOTSTRAP
    // =========================================================================

    /// Join the network: contact every seed in parallel, retry with
    /// exponential backoff until enough answer or the attempt cap is hit.
    /// Cancellation returns [`DhtError::Cancelled`] without touching the
    /// bootstrapped flag.
    pub async fn bootstrap(&self, cancel: CancellationToken) -> Result<(), DhtError> {
        loop {
            let (seeds, attempt) = {
                let mut state = self.state.lock().await;
                if state.nodes.is_empty() {
                    return Err(DhtError::NoBootstrapNodes);
                }
                state.attempts += 1;
                if state.attempts > self.config.max_bootstrap_attempts {
                    return Err(DhtError::MaxAttemptsReached(self.config.max_bootstrap_attempts));
                }
                (state.nodes.clone(), state.attempts)
            };

            match self.bootstrap_attempt(&seeds, &cancel).await {
                Ok(reached) => {
                    info!(reached, attempt, "bootstrap complete");
                    let mut state = self.state.lock().await;
                    state.bootstrapped = true;
                    state.attempts = 0;
                    return Ok(());
                }
                Err(DhtError::Cancelled) => return Err(DhtError::Cancelled),
                Err(e) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        error = %e,
                        retry_in_secs = delay.as_secs_f64(),
                        "bootstrap attempt failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DhtError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One fan-out round over the seed list. Ok(reached) when at least
    /// `min_bootstrap_nodes` seeds were contacted.
    async fn bootstrap_attempt(
        &self,
        seeds: &[BootstrapNode],
        cancel: &CancellationToken,
    ) -> Result<usize, DhtError> {
        let (tx, mut rx) = mpsc::channel::<WorkerOutcome>(seeds.len());

        for seed in seeds {
            let tx = tx.clone();
            let transport = self.transport.clone();
            let handshake = if self.config.versioned_handshakes {
                self.handshake.clone()
            } else {
                None
            };
            let self_key = self.self_key();
            let seed_key = seed.public_key;
            let seed_addr = seed.address.clone();
            let timeout = Duration::from_secs(self.config.send_timeout_secs);

            tokio::spawn(async move {
                let mut version = ProtocolVersion::Legacy;
                if let Some(handshake) = handshake {
                    match handshake.initiate(&seed_key, transport.as_ref(), &seed_addr).await {
                        Ok(response) => version = response.agreed_version,
                        Err(e) => {
                            // Never fatal: fall back to the unversioned path.
                            debug!(seed = %seed_addr, error = %e, "handshake fell back to legacy");
                        }
                    }
                }

                // Initial discovery targets the seed's own key.
                let request = Packet::get_nodes(&self_key, &seed_key);
                let reached = match tokio::time::timeout(timeout, transport.send(&request, &seed_addr))
                    .await
                {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(seed = %seed_addr, error = %e, "bootstrap send failed");
                        false
                    }
                    Err(_) => {
                        debug!(seed = %seed_addr, "bootstrap send timed out");
                        false
                    }
                };

                let _ = tx
                    .send(WorkerOutcome {
                        public_key: seed_key,
                        address: seed_addr,
                        version,
                        reached,
                    })
                    .await;
            });
        }
        drop(tx);

        let now = self.clock.now_secs();
        let mut reached = 0usize;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(DhtError::Cancelled),
                outcome = rx.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            {
                let mut state = self.state.lock().await;
                if let Some(seed) = state
                    .nodes
                    .iter_mut()
                    .find(|n| n.public_key == outcome.public_key)
                {
                    seed.last_used = Some(now);
                }
            }

            if outcome.reached {
                self.set_peer_version(&outcome.address, outcome.version);
                self.routing
                    .add(Node::new(outcome.public_key, outcome.address, now));
                reached += 1;
            }
        }

        if reached >= self.config.min_bootstrap_nodes.min(seeds.len()) && reached > 0 {
            Ok(reached)
        } else {
            Err(DhtError::InsufficientConnections {
                connected: reached,
                required: self.config.min_bootstrap_nodes,
            })
        }
    }

    /// Delay before retry `attempt + 1`: initial × 1.5^(attempt−1), capped,
    /// with ±50% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_secs as f64
            * BACKOFF_FACTOR.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_backoff_secs as f64);
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64((capped * jitter).max(0.05))
    }

    // =========================================================================
    // PEER VERSIONS
    // =========================================================================

    /// Agreed protocol version for a peer; Legacy until negotiated.
    pub fn peer_version(&self, addr: &Address) -> ProtocolVersion {
        self.peer_versions
            .read()
            .expect("peer version lock poisoned")
            .get(&addr.to_string())
            .copied()
            .unwrap_or_default()
    }

    fn set_peer_version(&self, addr: &Address, version: ProtocolVersion) {
        self.peer_versions
            .write()
            .expect("peer version lock poisoned")
            .insert(addr.to_string(), version);
    }

    // =========================================================================
    // PACKET DISPATCH
    // =========================================================================

    /// Route one inbound packet. Validation failures drop the packet and
    /// surface the reason to the caller.
    pub async fn handle_packet(&self, packet: Packet, from: Address) -> Result<(), DhtError> {
        match packet.packet_type {
            PacketType::GetNodes => self.on_get_nodes(&packet.data, &from).await,
            PacketType::SendNodes => self.on_send_nodes(&packet.data, &from).await,
            PacketType::PingRequest => self.on_ping_request(&packet.data, &from).await,
            PacketType::PingResponse => self.on_ping_response(&packet.data, &from).await,
            PacketType::GroupAnnounce => self.on_group_announce(&packet.data),
            PacketType::GroupQuery => self.on_group_query(&packet.data, &from).await,
            PacketType::GroupQueryResponse => self.on_group_query_response(&packet.data),
            PacketType::NoiseHandshake => self.on_noise_handshake(&packet.data, &from).await,
            PacketType::LanDiscovery => self.on_lan_discovery(&packet.data, &from),
        }
    }

    async fn on_get_nodes(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() < GET_NODES_PAYLOAD_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: payload.len(),
                need: GET_NODES_PAYLOAD_SIZE,
            });
        }
        let sender = sender_key(payload)?;
        if sender == self.self_key() {
            return Ok(());
        }
        let target = PublicKey::from_slice(&payload[32..64])?;

        self.routing.mark_good(&sender, from);

        // The sender was just inserted above; it never belongs in its own
        // reply. Over-fetch by one so filtering it out still yields a full
        // set.
        let mut closest = self
            .routing
            .find_closest(&NodeId::from_public_key(target), MAX_SENT_NODES + 1);
        closest.retain(|n| n.public_key != sender);
        closest.truncate(MAX_SENT_NODES);

        let mut data = Vec::with_capacity(SEND_NODES_HEADER_SIZE + closest.len() * LEGACY_ENTRY_SIZE);
        data.extend_from_slice(self.self_key().as_bytes());
        data.push(closest.len() as u8);
        for node in &closest {
            let entry = NodeEntry { public_key: node.public_key, address: node.address.clone() };
            let parser = self.parsers.for_address(&entry.address);
            data.extend_from_slice(&parser.serialize_node_entry(&entry)?);
        }

        let reply = Packet::new(PacketType::SendNodes, data);
        self.send_timed(&reply, from).await?;
        debug!(peer = %from, count = closest.len(), "answered get_nodes");
        Ok(())
    }

    async fn on_send_nodes(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() < SEND_NODES_HEADER_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: payload.len(),
                need: SEND_NODES_HEADER_SIZE,
            });
        }
        let sender = sender_key(payload)?;
        if sender == self.self_key() {
            return Ok(());
        }

        self.routing.mark_good(&sender, from);
        self.mark_seed_success(&sender, from).await;

        // Zero entries is a legal, empty response. The count must at least
        // fit the smallest possible entries.
        let count = payload[SEND_NODES_HEADER_SIZE - 1] as usize;
        if payload.len() < SEND_NODES_HEADER_SIZE + count * EXTENDED_ENTRY_MIN_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: payload.len(),
                need: SEND_NODES_HEADER_SIZE + count * EXTENDED_ENTRY_MIN_SIZE,
            });
        }

        let now = self.clock.now_secs();
        let mut offset = SEND_NODES_HEADER_SIZE;
        let mut accepted = 0usize;
        for _ in 0..count {
            if offset >= payload.len() {
                break;
            }
            match self.parsers.parse_entry(payload, offset) {
                Ok((entry, next)) => {
                    offset = next;
                    if entry.public_key == self.self_key() {
                        continue;
                    }
                    let mut node = Node::new(entry.public_key, entry.address, now);
                    node.status = NodeStatus::Good;
                    if self.routing.add(node) {
                        accepted += 1;
                    }
                }
                Err(e) => {
                    // A malformed entry never fails the packet. Fixed-size
                    // legacy entries can be stepped over; without a known
                    // length we stop here.
                    debug!(peer = %from, error = %e, "skipping malformed node entry");
                    if payload.len() - offset >= LEGACY_ENTRY_SIZE {
                        offset += LEGACY_ENTRY_SIZE;
                    } else {
                        break;
                    }
                }
            }
        }
        debug!(peer = %from, count, accepted, "processed send_nodes");
        Ok(())
    }

    async fn on_ping_request(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() >= PUBLIC_KEY_SIZE {
            let sender = sender_key(payload)?;
            if sender == self.self_key() {
                return Ok(());
            }
            self.routing.mark_good(&sender, from);
        }
        let reply = Packet::ping_response(payload);
        self.send_timed(&reply, from).await?;
        Ok(())
    }

    async fn on_ping_response(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() < PUBLIC_KEY_SIZE {
            return Err(DhtError::TruncatedPacket { got: payload.len(), need: PUBLIC_KEY_SIZE });
        }

        // The response echoes our request verbatim, so the payload key names
        // the pinger, not the responder. Identify the responder by the
        // address it answered from; fall back to the seed list, then to a
        // stamped sender key for peers we have never seen.
        let responder = match self.routing.find_by_address(from) {
            Some(node) => node.public_key,
            None => match self.seed_key_for(from).await {
                Some(seed_key) => seed_key,
                None => {
                    let stamped = sender_key(payload)?;
                    if stamped == self.self_key() {
                        return Ok(());
                    }
                    stamped
                }
            },
        };

        self.routing.mark_good(&responder, from);
        self.routing.record_pong(&responder);
        Ok(())
    }

    async fn seed_key_for(&self, from: &Address) -> Option<PublicKey> {
        let addr_string = from.to_string();
        self.state
            .lock()
            .await
            .nodes
            .iter()
            .find(|s| s.address.to_string() == addr_string)
            .map(|s| s.public_key)
    }

    fn on_group_announce(&self, payload: &[u8]) -> Result<(), DhtError> {
        let ttl = self.routing.groups().default_ttl_secs();
        let announcement = GroupAnnouncement::deserialize(payload, ttl)?;
        debug!(group_id = announcement.group_id, "stored group announcement");
        self.routing.groups().store(announcement);
        Ok(())
    }

    async fn on_group_query(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() < 4 {
            return Err(DhtError::TruncatedPacket { got: payload.len(), need: 4 });
        }
        let group_id = u32::from_be_bytes(payload[0..4].try_into().expect("4-byte slice"));

        let data = match self.routing.groups().get(group_id) {
            Some(announcement) => {
                let mut data = vec![0x01];
                data.extend_from_slice(&announcement.serialize());
                data
            }
            None => vec![0x00],
        };
        let reply = Packet::new(PacketType::GroupQueryResponse, data);
        self.send_timed(&reply, from).await?;
        Ok(())
    }

    fn on_group_query_response(&self, payload: &[u8]) -> Result<(), DhtError> {
        if payload.is_empty() {
            return Err(DhtError::TruncatedPacket { got: 0, need: 1 });
        }
        if payload[0] == 0 {
            return Ok(());
        }
        let ttl = self.routing.groups().default_ttl_secs();
        let announcement = GroupAnnouncement::deserialize(&payload[1..], ttl)?;
        self.routing.groups().store(announcement.clone());
        self.routing.groups().notify_response(&announcement);
        Ok(())
    }

    async fn on_noise_handshake(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if !self.config.versioned_handshakes {
            return Err(DhtError::UnsupportedPacketType(
                PacketType::NoiseHandshake.as_wire(),
            ));
        }
        if payload.len() < HANDSHAKE_PAYLOAD_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: payload.len(),
                need: HANDSHAKE_PAYLOAD_SIZE,
            });
        }
        let sender = sender_key(payload)?;
        if sender == self.self_key() {
            return Ok(());
        }
        let flags = payload[PUBLIC_KEY_SIZE];
        let proposed = payload[PUBLIC_KEY_SIZE + 1];

        match flags {
            HANDSHAKE_FLAG_REQUEST => {
                let agreed =
                    ProtocolVersion::from_wire(proposed.min(LATEST_VERSION.as_wire()))?;
                self.set_peer_version(from, agreed);
                let reply =
                    NegotiatingHandshake::packet(&self.self_key(), HANDSHAKE_FLAG_RESPONSE, agreed);
                self.send_timed(&reply, from).await?;
                debug!(peer = %from, version = agreed.as_wire(), "answered version negotiation");
                Ok(())
            }
            HANDSHAKE_FLAG_RESPONSE => {
                let agreed = ProtocolVersion::from_wire(proposed)?;
                self.set_peer_version(from, agreed);
                if let Some(handshake) = &self.handshake {
                    handshake.on_response(&from.to_string(), proposed);
                }
                Ok(())
            }
            other => Err(DhtError::HandshakeFailed(format!("unknown flags {other:#04x}"))),
        }
    }

    fn on_lan_discovery(&self, payload: &[u8], from: &Address) -> Result<(), DhtError> {
        if payload.len() < LAN_DISCOVERY_PAYLOAD_SIZE {
            return Err(DhtError::TruncatedPacket {
                got: payload.len(),
                need: LAN_DISCOVERY_PAYLOAD_SIZE,
            });
        }
        let sender = sender_key(payload)?;
        if sender == self.self_key() {
            return Ok(());
        }
        let port = u16::from_be_bytes([payload[32], payload[33]]);

        // The beacon advertises the peer's DHT port; the datagram arrives
        // from its discovery socket.
        let address = match from {
            Address::Ipv4 { octets, .. } => Address::Ipv4 { octets: *octets, port },
            Address::Ipv6 { octets, .. } => Address::Ipv6 { octets: *octets, port },
            other => other.clone(),
        };
        self.routing
            .add(Node::new(sender, address, self.clock.now_secs()));
        Ok(())
    }

    async fn mark_seed_success(&self, sender: &PublicKey, from: &Address) {
        let addr_string = from.to_string();
        let mut state = self.state.lock().await;
        for seed in state.nodes.iter_mut() {
            if seed.public_key == *sender || seed.address.to_string() == addr_string {
                seed.success = true;
            }
        }
    }

    // =========================================================================
    // GROUP OPERATIONS
    // =========================================================================

    /// Key a group id into the keyspace for closest-node selection.
    fn group_target(group_id: u32) -> NodeId {
        let mut bytes = [0u8; PUBLIC_KEY_SIZE];
        bytes[..4].copy_from_slice(&group_id.to_be_bytes());
        NodeId::from_public_key(PublicKey(bytes))
    }

    /// Store an announcement locally and push it to the closest known nodes.
    /// Fan-out sends are best-effort.
    pub async fn announce_group(&self, announcement: GroupAnnouncement) {
        let group_id = announcement.group_id;
        let packet = Packet::new(PacketType::GroupAnnounce, announcement.serialize());
        self.routing.groups().store(announcement);

        let targets = self.fan_out_targets(group_id).await;
        for address in targets {
            if let Err(e) = self.send_timed(&packet, &address).await {
                debug!(group_id, peer = %address, error = %e, "announce fan-out failed");
            }
        }
    }

    /// Look up a group. A live local entry returns immediately; otherwise
    /// queries fan out and [`DhtError::QueryPending`] signals that results
    /// arrive via the response callback.
    pub async fn query_group(&self, group_id: u32) -> Result<GroupAnnouncement, DhtError> {
        if let Some(announcement) = self.routing.groups().get(group_id) {
            return Ok(announcement);
        }

        let packet = Packet::group_query(group_id);
        let targets = self.fan_out_targets(group_id).await;
        for address in &targets {
            if let Err(e) = self.send_timed(&packet, address).await {
                debug!(group_id, peer = %address, error = %e, "group query send failed");
            }
        }
        Err(DhtError::QueryPending)
    }

    /// Closest known nodes to the group key, or the seed list when the
    /// routing table is still empty.
    async fn fan_out_targets(&self, group_id: u32) -> Vec<Address> {
        let closest = self
            .routing
            .find_closest(&Self::group_target(group_id), MAX_SENT_NODES);
        if !closest.is_empty() {
            return closest.into_iter().map(|n| n.address).collect();
        }
        self.bootstrap_nodes()
            .await
            .into_iter()
            .take(MAX_SENT_NODES)
            .map(|s| s.address)
            .collect()
    }

    async fn send_timed(&self, packet: &Packet, addr: &Address) -> Result<(), DhtError> {
        let timeout = Duration::from_secs(self.config.send_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send(packet, addr)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DhtError::Transport(TransportError::Timeout)),
        }
    }
}

#[async_trait]
impl crate::dht::transport::PacketSink for BootstrapManager {
    async fn deliver(&self, packet: Packet, from: Address) {
        let packet_name = packet.packet_type.name();
        if let Err(e) = self.handle_packet(packet, from.clone()).await {
            if e.is_pending() {
                return;
            }
            debug!(operation = packet_name, peer = %from, error = %e, "dropped packet");
        }
    }
}
