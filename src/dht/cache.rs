//! On-disk node cache.
//!
//! Persists known peers across restarts so a node can rejoin without
//! depending entirely on its seed list. The file is bincode (local storage
//! only, never fed by the network) and is size-checked before
//! deserialization.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dht::address::Address;
use crate::dht::routing::RoutingTable;
use crate::dht::types::Node;
use crate::types::PublicKey;

/// Reject cache files larger than this before deserializing.
/// 2048 entries at well under 512 bytes each fit comfortably.
const MAX_CACHE_FILE_SIZE: u64 = 1024 * 1024;

/// Upper bound on restored entries, regardless of file contents.
const MAX_CACHED_NODES: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedNode {
    public_key: PublicKey,
    address: Address,
    last_seen: u64,
}

/// Snapshot of the routing table's known peers.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NodeCache {
    nodes: Vec<CachedNode>,
}

impl NodeCache {
    /// Capture every node currently in the table.
    pub fn snapshot(routing: &RoutingTable) -> Self {
        let nodes = routing
            .all_nodes()
            .into_iter()
            .take(MAX_CACHED_NODES)
            .map(|n| CachedNode {
                public_key: n.public_key,
                address: n.address,
                last_seen: n.last_seen,
            })
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    /// Load from file, rejecting oversized files before deserialization.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_CACHE_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("node cache file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Reseed a routing table. Restored nodes start Unknown and earn Good
    /// through probing. Returns how many the table accepted.
    pub fn restore(&self, routing: &RoutingTable, now_secs: u64) -> usize {
        let mut restored = 0;
        for cached in self.nodes.iter().take(MAX_CACHED_NODES) {
            let node = Node::new(cached.public_key, cached.address.clone(), now_secs);
            if routing.add(node) {
                restored += 1;
            }
        }
        restored
    }
}
