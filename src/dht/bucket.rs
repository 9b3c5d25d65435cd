//! Bounded per-distance-range peer container.

use std::sync::Mutex;

use crate::dht::types::{Node, NodeStatus};
use crate::types::NodeId;

/// A single k-bucket: at most `max_size` nodes at one XOR-distance range,
/// ordered by recency (newest at the back).
///
/// Replacement policy follows Kademlia's preference for established nodes:
/// a full bucket only evicts when a resident is unambiguously Bad. The lock
/// is the innermost lock in the crate; nothing is called while holding it.
#[derive(Debug)]
pub struct KBucket {
    nodes: Mutex<Vec<Node>>,
    max_size: usize,
}

impl KBucket {
    pub fn new(max_size: usize) -> Self {
        Self { nodes: Mutex::new(Vec::with_capacity(max_size)), max_size }
    }

    /// Insert or refresh a node.
    ///
    /// - Same id already present: the old entry is removed and the new one
    ///   pushed to the back (recency update). Returns true.
    /// - Room left: appended. Returns true.
    /// - Full: the first Bad resident is evicted in favor of the candidate.
    ///   Returns true.
    /// - Full of Good/Unknown residents: candidate rejected. Returns false.
    pub fn add(&self, node: Node) -> bool {
        let mut nodes = self.nodes.lock().expect("bucket lock poisoned");

        if let Some(pos) = nodes.iter().position(|n| n.id == node.id) {
            nodes.remove(pos);
            nodes.push(node);
            return true;
        }

        if nodes.len() < self.max_size {
            nodes.push(node);
            return true;
        }

        if let Some(pos) = nodes.iter().position(|n| n.status == NodeStatus::Bad) {
            nodes.remove(pos);
            nodes.push(node);
            return true;
        }

        false
    }

    /// Remove by id (swap-remove; recency order is not preserved).
    pub fn remove(&self, id: &NodeId) -> bool {
        let mut nodes = self.nodes.lock().expect("bucket lock poisoned");
        if let Some(pos) = nodes.iter().position(|n| &n.id == id) {
            nodes.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Clone-copy of the contents, safe to iterate outside the lock.
    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.lock().expect("bucket lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().expect("bucket lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutate the node with this id in place. Returns whether it was found.
    pub fn update<F: FnOnce(&mut Node)>(&self, id: &NodeId, f: F) -> bool {
        let mut nodes = self.nodes.lock().expect("bucket lock poisoned");
        if let Some(node) = nodes.iter_mut().find(|n| &n.id == id) {
            f(node);
            true
        } else {
            false
        }
    }

    /// Visit every node mutably, dropping those for which `f` returns false.
    pub fn retain<F: FnMut(&mut Node) -> bool>(&self, f: F) {
        self.nodes.lock().expect("bucket lock poisoned").retain_mut(f);
    }
}
