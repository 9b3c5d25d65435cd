//! Kademlia routing table: 256 k-buckets keyed by first-differing-bit
//! position, with a bounded max-heap k-closest lookup.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::dht::address::Address;
use crate::dht::bucket::KBucket;
use crate::dht::groups::GroupStorage;
use crate::dht::types::{BUCKET_COUNT, DhtConfig, Node, NodeStatus, PingStats};
use crate::time::Clock;
use crate::types::{Distance, NodeId, PublicKey};

/// Bucket index for a distance: the position of the first set bit, MSB
/// first. The all-zero distance (a self-match, unreachable in practice
/// because the self key is rejected before bucket selection) maps to the
/// last bucket by convention.
pub fn first_set_bit_position(d: &Distance) -> usize {
    for (i, byte) in d.iter().enumerate() {
        if *byte != 0 {
            return i * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

/// Observability snapshot for status lines and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub total: usize,
    pub good: usize,
    pub bad: usize,
    pub unknown: usize,
}

/// Max-heap entry for the bounded k-closest search. Ordered by distance
/// only, so the heap root is always the farthest retained candidate.
struct Candidate {
    dist: Distance,
    node: Node,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist.cmp(&other.dist)
    }
}

/// The routing table.
///
/// The bucket array and group-storage handle are fixed at construction;
/// per-bucket locks are the only mutable state, making them the innermost
/// (and only) locks this type takes. Never call into the transport while
/// holding one; every accessor snapshots and releases first.
pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<KBucket>,
    groups: GroupStorage,
    clock: Clock,
}

impl RoutingTable {
    pub fn new(self_id: NodeId, config: &DhtConfig, clock: Clock) -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| KBucket::new(config.k_bucket_size))
            .collect();
        let groups = GroupStorage::new(clock.clone(), config.announcement_ttl_secs);
        Self { self_id, buckets, groups, clock }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn self_key(&self) -> &PublicKey {
        &self.self_id.public_key
    }

    pub fn groups(&self) -> &GroupStorage {
        &self.groups
    }

    fn bucket_for(&self, key: &PublicKey) -> &KBucket {
        let dist = self.self_id.public_key.distance(key);
        &self.buckets[first_set_bit_position(&dist)]
    }

    /// Insert a node. The self node is never inserted.
    pub fn add(&self, node: Node) -> bool {
        if node.id == self.self_id {
            return false;
        }
        self.bucket_for(&node.public_key).add(node)
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        self.bucket_for(&id.public_key).remove(id)
    }

    /// Up to `k` known nodes, ascending by distance to `target`.
    ///
    /// A max-heap bounded at `k` scans every node once: while under
    /// capacity, push; once full, replace the root whenever a strictly
    /// closer candidate appears. Draining the heap yields farthest-first,
    /// so the result is reversed into ascending order. No full sort, and
    /// each distance is computed exactly once.
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<Node> {
        if k == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);
        for bucket in &self.buckets {
            for node in bucket.snapshot() {
                let dist = target.public_key.distance(&node.public_key);
                if heap.len() < k {
                    heap.push(Candidate { dist, node });
                } else if heap.peek().is_some_and(|farthest| dist < farthest.dist) {
                    heap.pop();
                    heap.push(Candidate { dist, node });
                }
            }
        }

        let mut out: Vec<Node> = Vec::with_capacity(heap.len());
        while let Some(c) = heap.pop() {
            out.push(c.node);
        }
        out.reverse();
        out
    }

    /// Every known node across all buckets.
    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets.iter().flat_map(|b| b.snapshot()).collect()
    }

    /// Node currently registered at this address, if any.
    pub fn find_by_address(&self, address: &Address) -> Option<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.snapshot())
            .find(|n| &n.address == address)
    }

    pub fn bucket_nodes(&self, index: usize) -> Vec<Node> {
        self.buckets.get(index).map(|b| b.snapshot()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn nodes_by_status(&self, status: NodeStatus) -> Vec<Node> {
        self.buckets
            .iter()
            .flat_map(|b| b.snapshot())
            .filter(|n| n.status == status)
            .collect()
    }

    /// Drop every node silent for longer than `max_age_secs`.
    pub fn remove_stale(&self, max_age_secs: u64) -> usize {
        let now = self.clock.now_secs();
        let mut removed = 0;
        for bucket in &self.buckets {
            bucket.retain(|n| {
                let keep = now.saturating_sub(n.last_seen) <= max_age_secs;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        removed
    }

    /// One maintenance pass: Good nodes silent past `node_timeout_secs`
    /// become Bad; Bad nodes silent past `prune_timeout_secs` are removed.
    /// Returns (demoted, pruned).
    pub fn age_out(&self, node_timeout_secs: u64, prune_timeout_secs: u64) -> (usize, usize) {
        let now = self.clock.now_secs();
        let mut demoted = 0;
        let mut pruned = 0;
        for bucket in &self.buckets {
            bucket.retain(|n| {
                let silent = now.saturating_sub(n.last_seen);
                match n.status {
                    NodeStatus::Good if silent > node_timeout_secs => {
                        n.status = NodeStatus::Bad;
                        demoted += 1;
                        true
                    }
                    NodeStatus::Bad if silent > prune_timeout_secs => {
                        pruned += 1;
                        false
                    }
                    _ => true,
                }
            });
        }
        (demoted, pruned)
    }

    /// Record activity from a peer: refresh an existing entry as Good or
    /// insert a fresh Good node at this address.
    pub fn mark_good(&self, public_key: &PublicKey, address: &Address) {
        let now = self.clock.now_secs();
        let id = NodeId::from_public_key(*public_key);
        if id == self.self_id {
            return;
        }
        let bucket = self.bucket_for(public_key);
        let updated = bucket.update(&id, |n| {
            n.update(NodeStatus::Good, now);
            n.address = address.clone();
        });
        if !updated {
            let mut node = Node::new(*public_key, address.clone(), now);
            node.status = NodeStatus::Good;
            bucket.add(node);
        }
    }

    /// Record a ping answered by this peer.
    pub fn record_pong(&self, public_key: &PublicKey) {
        let id = NodeId::from_public_key(*public_key);
        let now = self.clock.now_secs();
        self.bucket_for(public_key).update(&id, |n| {
            n.update(NodeStatus::Good, now);
            n.ping_stats.record_success();
        });
    }

    /// Record a probe sent to this peer.
    pub fn record_ping_sent(&self, id: &NodeId) {
        self.bucket_for(&id.public_key).update(id, |n| n.ping_stats.record_sent());
    }

    pub fn ping_stats(&self, id: &NodeId) -> Option<PingStats> {
        let mut out = None;
        self.bucket_for(&id.public_key).update(id, |n| out = Some(n.ping_stats));
        out
    }

    pub fn stats(&self) -> RoutingStats {
        let mut stats = RoutingStats::default();
        for node in self.all_nodes() {
            stats.total += 1;
            match node.status {
                NodeStatus::Good => stats.good += 1,
                NodeStatus::Bad => stats.bad += 1,
                NodeStatus::Unknown => stats.unknown += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::address::Address;
    use crate::time::MockTimeProvider;
    use std::sync::Arc;

    fn table(self_first: u8) -> RoutingTable {
        let mut b = [0u8; 32];
        b[0] = self_first;
        RoutingTable::new(
            NodeId::from_public_key(PublicKey(b)),
            &DhtConfig::default(),
            Arc::new(MockTimeProvider::new(1_000)),
        )
    }

    fn node(first: u8) -> Node {
        let mut b = [0u8; 32];
        b[0] = first;
        Node::new(PublicKey(b), Address::ipv4([127, 0, 0, 1], 33445), 1_000)
    }

    #[test]
    fn first_set_bit_scans_msb_first() {
        let mut d = [0u8; 32];
        d[0] = 0b1000_0000;
        assert_eq!(first_set_bit_position(&d), 0);
        d[0] = 0b0000_0001;
        assert_eq!(first_set_bit_position(&d), 7);
        d[0] = 0;
        d[31] = 1;
        assert_eq!(first_set_bit_position(&d), 255);
        // all-zero sentinel
        assert_eq!(first_set_bit_position(&[0u8; 32]), 255);
    }

    #[test]
    fn self_node_is_rejected() {
        let table = table(0x05);
        assert!(!table.add(node(0x05)));
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn nodes_land_in_the_distance_bucket() {
        let table = table(0x00);
        // distance 0x80... → bit 0
        assert!(table.add(node(0x80)));
        assert_eq!(table.bucket_nodes(0).len(), 1);
        // distance 0x01... → bit 7
        assert!(table.add(node(0x01)));
        assert_eq!(table.bucket_nodes(7).len(), 1);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn find_closest_orders_by_distance() {
        // self = 0x00…, target first byte 0x80: expect 0x80, 0x81, 0x82
        let table = table(0x00);
        for first in [0x80, 0x81, 0x82, 0x7f, 0x00u8.wrapping_add(0x10), 0xff] {
            table.add(node(first));
        }
        let target = NodeId::from_public_key(PublicKey({
            let mut b = [0u8; 32];
            b[0] = 0x80;
            b
        }));
        let closest = table.find_closest(&target, 3);
        let firsts: Vec<u8> = closest.iter().map(|n| n.public_key.0[0]).collect();
        assert_eq!(firsts, vec![0x80, 0x81, 0x82]);
    }

    #[test]
    fn find_closest_edge_cases() {
        let table = table(0x00);
        let target = NodeId::from_public_key(PublicKey([1u8; 32]));
        assert!(table.find_closest(&target, 0).is_empty());
        assert!(table.find_closest(&target, 4).is_empty());

        table.add(node(0x40));
        table.add(node(0x41));
        // k larger than population returns everything
        assert_eq!(table.find_closest(&target, 10).len(), 2);
    }

    #[test]
    fn age_out_demotes_then_prunes() {
        let clock = Arc::new(MockTimeProvider::new(10_000));
        let mut b = [0u8; 32];
        b[0] = 1;
        let table = RoutingTable::new(
            NodeId::from_public_key(PublicKey(b)),
            &DhtConfig::default(),
            clock.clone(),
        );

        let mut fresh = node(0x80);
        fresh.status = NodeStatus::Good;
        fresh.last_seen = 10_000 - 300; // 5 min ago
        let mut stale = node(0x40);
        stale.status = NodeStatus::Good;
        stale.last_seen = 10_000 - 660; // 11 min ago
        let mut dead = node(0x20);
        dead.status = NodeStatus::Bad;
        dead.last_seen = 10_000 - 3_660; // 61 min ago
        table.add(fresh);
        table.add(stale);
        table.add(dead);

        let (demoted, pruned) = table.age_out(600, 3_600);
        assert_eq!((demoted, pruned), (1, 1));
        assert_eq!(table.count(), 2);
        assert_eq!(table.nodes_by_status(NodeStatus::Bad).len(), 1);
        assert_eq!(table.nodes_by_status(NodeStatus::Good).len(), 1);
    }

    #[test]
    fn add_same_node_is_idempotent() {
        let table = table(0x00);
        assert!(table.add(node(0x42)));
        assert!(table.add(node(0x42)));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn mark_good_inserts_or_refreshes() {
        let table = table(0x00);
        let key = PublicKey({
            let mut b = [0u8; 32];
            b[0] = 0x42;
            b
        });
        let addr = Address::ipv4([10, 0, 0, 1], 1234);
        table.mark_good(&key, &addr);
        let nodes = table.nodes_by_status(NodeStatus::Good);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].address, addr);

        let moved = Address::ipv4([10, 0, 0, 2], 1234);
        table.mark_good(&key, &moved);
        assert_eq!(table.count(), 1);
        assert_eq!(table.all_nodes()[0].address, moved);
    }
}
