//! DHT constants, configuration, and node bookkeeping types.
//!
//! # Design Goals
//!
//! 1. **Bounded state**: every collection the network can grow has an
//!    explicit cap: 256 buckets of `k_bucket_size` nodes, one announcement
//!    per group id, a fixed bootstrap list.
//!
//! 2. **Deterministic liveness**: node state transitions (Unknown → Good →
//!    Bad → removed) depend only on injected clock readings, never on
//!    ambient wall time.
//!
//! 3. **Wire compatibility**: packet type values and entry layouts match
//!    the transport's enumeration exactly; see the registry below.

use serde::{Deserialize, Serialize};

use crate::dht::address::Address;
use crate::types::{NodeId, PublicKey};

// =============================================================================
// PACKET TYPE REGISTRY
// =============================================================================
// Wire-visible constants. Assignments MUST match the transport's enumeration;
// do not renumber without a protocol version bump.

/// Ping request. Payload: opaque, at least the sender's 32-byte public key.
pub const PACKET_PING_REQUEST: u8 = 0x00;

/// Ping response. Payload: verbatim echo of the request.
pub const PACKET_PING_RESPONSE: u8 = 0x01;

/// GetNodes. Payload: `sender_pubkey[32] || target_pubkey[32]`.
pub const PACKET_GET_NODES: u8 = 0x02;

/// SendNodes. Payload: `sender_pubkey[32] || count(u8) || entries[count]`.
pub const PACKET_SEND_NODES: u8 = 0x04;

/// LAN discovery beacon: `public_key[32] || port(u16 BE)`, exactly 34 bytes.
pub const PACKET_LAN_DISCOVERY: u8 = 0x21;

/// Group announcement push. Payload: serialized announcement.
pub const PACKET_GROUP_ANNOUNCE: u8 = 0x50;

/// Group lookup. Payload: `group_id(u32 BE)`.
pub const PACKET_GROUP_QUERY: u8 = 0x51;

/// Group lookup reply: `found(u8) || [serialized announcement if found=1]`.
pub const PACKET_GROUP_QUERY_RESPONSE: u8 = 0x52;

/// Version negotiation: `sender_pubkey[32] || flags(u8) || version(u8)`.
pub const PACKET_NOISE_HANDSHAKE: u8 = 0x60;

// =============================================================================
// WIRE SIZES
// =============================================================================

/// GetNodes payload is exactly two public keys.
pub const GET_NODES_PAYLOAD_SIZE: usize = 64;

/// Legacy SendNodes entry: `pubkey[32] || ip16[16] || port(u16 BE)`.
/// IPv4 addresses use the IPv4-mapped-IPv6 form (`0…0 FF FF` prefix).
pub const LEGACY_ENTRY_SIZE: usize = 50;

/// Minimum extended entry: `pubkey[32] || tag(u8) || port(u16 BE)` with an
/// empty address body. Used only as the detection floor; each variant
/// enforces its exact length during parsing.
pub const EXTENDED_ENTRY_MIN_SIZE: usize = 35;

/// SendNodes replies carry at most this many entries.
pub const MAX_SENT_NODES: usize = 4;

/// LAN discovery payload size.
pub const LAN_DISCOVERY_PAYLOAD_SIZE: usize = 34;

/// Cap on group names on the wire. Longer names are a parse error.
pub const MAX_GROUP_NAME_LEN: usize = 128;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================
// Seconds unless noted. Each is overridable through DhtConfig.

/// Maintainer ping cadence.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 60;

/// Maintainer random-lookup cadence.
pub const DEFAULT_LOOKUP_INTERVAL_SECS: u64 = 300;

/// A Good node silent for longer than this is demoted to Bad.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 600;

/// A Bad node silent for longer than this is removed from its bucket.
pub const DEFAULT_PRUNE_TIMEOUT_SECS: u64 = 3600;

/// First bootstrap retry delay.
pub const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 1;

/// Bootstrap backoff ceiling.
pub const DEFAULT_MAX_BACKOFF_SECS: u64 = 120;

/// Backoff growth factor per failed attempt.
pub const BACKOFF_FACTOR: f64 = 1.5;

/// Per-send network timeout.
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 5;

/// TTL applied to announcements received without one (TTL is never wired).
pub const DEFAULT_ANNOUNCEMENT_TTL_SECS: u64 = 24 * 60 * 60;

/// LAN discovery beacon cadence.
pub const LAN_DISCOVERY_INTERVAL_SECS: u64 = 10;

// =============================================================================
// BOOTSTRAP DEFAULTS
// =============================================================================

/// Successful seed contacts required to consider bootstrap complete.
pub const DEFAULT_MIN_BOOTSTRAP_NODES: usize = 4;

/// Hard cap on bootstrap retries.
pub const DEFAULT_MAX_BOOTSTRAP_ATTEMPTS: u32 = 5;

/// Nodes per k-bucket.
pub const DEFAULT_K_BUCKET_SIZE: usize = 8;

/// Number of k-buckets: one per possible first-differing-bit position.
pub const BUCKET_COUNT: usize = 256;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tunable DHT parameters. `Default` matches the protocol's shipped values.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub min_bootstrap_nodes: usize,
    pub max_bootstrap_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub ping_interval_secs: u64,
    pub lookup_interval_secs: u64,
    pub node_timeout_secs: u64,
    pub prune_timeout_secs: u64,
    pub k_bucket_size: usize,
    pub announcement_ttl_secs: u64,
    pub send_timeout_secs: u64,
    /// Attempt Noise-IK version negotiation before legacy GetNodes.
    pub versioned_handshakes: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            min_bootstrap_nodes: DEFAULT_MIN_BOOTSTRAP_NODES,
            max_bootstrap_attempts: DEFAULT_MAX_BOOTSTRAP_ATTEMPTS,
            initial_backoff_secs: DEFAULT_INITIAL_BACKOFF_SECS,
            max_backoff_secs: DEFAULT_MAX_BACKOFF_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            lookup_interval_secs: DEFAULT_LOOKUP_INTERVAL_SECS,
            node_timeout_secs: DEFAULT_NODE_TIMEOUT_SECS,
            prune_timeout_secs: DEFAULT_PRUNE_TIMEOUT_SECS,
            k_bucket_size: DEFAULT_K_BUCKET_SIZE,
            announcement_ttl_secs: DEFAULT_ANNOUNCEMENT_TTL_SECS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            versioned_handshakes: true,
        }
    }
}

// =============================================================================
// NODE STATE
// =============================================================================

/// Liveness state of a known peer.
///
/// Created Unknown; a successful ping or query response sets Good; the
/// maintainer demotes Good → Bad on timeout and deletes Bad after the prune
/// timeout. Bad nodes are the only replacement candidates in a full bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Unknown,
    Good,
    Bad,
}

/// Probe accounting for a single peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingStats {
    pub sent: u64,
    pub received: u64,
    pub success: u64,
    pub failure: u64,
}

impl PingStats {
    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    pub fn record_success(&mut self) {
        self.received += 1;
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure += 1;
    }

    /// Fraction of sent probes answered. 0.0 when nothing was sent.
    pub fn reliability(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        self.success as f64 / self.sent as f64
    }
}

/// A peer known to the routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub public_key: PublicKey,
    pub address: Address,
    /// Epoch seconds of the last observed activity. 0 = never.
    pub last_seen: u64,
    pub status: NodeStatus,
    pub ping_stats: PingStats,
}

impl Node {
    pub fn new(public_key: PublicKey, address: Address, now_secs: u64) -> Self {
        Self {
            id: NodeId::from_public_key(public_key),
            public_key,
            address,
            last_seen: now_secs,
            status: NodeStatus::Unknown,
            ping_stats: PingStats::default(),
        }
    }

    /// Apply a status observation. `last_seen` is monotonic: a stale
    /// observation can change status but never rewinds the clock.
    pub fn update(&mut self, status: NodeStatus, now_secs: u64) {
        self.status = status;
        self.last_seen = self.last_seen.max(now_secs);
    }

    /// Whether this node has been active within `window_secs` of `now_secs`.
    pub fn active_within(&self, window_secs: u64, now_secs: u64) -> bool {
        now_secs.saturating_sub(self.last_seen) < window_secs
    }
}

// =============================================================================
// BOOTSTRAP NODES
// =============================================================================

/// A configured seed peer. Owned by the bootstrap manager's node list.
#[derive(Debug, Clone)]
pub struct BootstrapNode {
    pub address: Address,
    pub public_key: PublicKey,
    /// Epoch seconds of the last bootstrap attempt against this seed.
    pub last_used: Option<u64>,
    /// Whether this seed has ever answered us.
    pub success: bool,
}

impl BootstrapNode {
    pub fn new(address: Address, public_key: PublicKey) -> Self {
        Self { address, public_key, last_used: None, success: false }
    }
}
