//! Consistent hashing ring with virtual nodes.
//!
//! Ring state is deterministic given the node set, the vnode count, and the
//! hash function (32-bit FNV-1a, stable across processes), so every node that
//! sees the same alive set computes the same preference list for any key.
//! Readers work against immutable `Arc<Ring>` snapshots published through
//! `RingHandle`; membership changes build a fresh ring and swap it in whole.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// A physical node as the ring sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RingNode {
    pub id: String,
    pub addr: String,
}

/// One hash position owned by a physical node.
#[derive(Clone, Debug)]
struct Vnode {
    hash: u32,
    node_id: String,
}

/// Consistent hashing ring.
pub struct Ring {
    vnodes_per_node: usize,
    vnodes: Vec<Vnode>,
    nodes: HashMap<String, RingNode>,
}

/// Default virtual nodes per physical node.
pub const DEFAULT_VNODES: usize = 128;

impl Ring {
    /// Create an empty ring; a non-positive vnode count falls back to the
    /// default.
    pub fn new(vnodes_per_node: usize) -> Self {
        let vnodes_per_node = if vnodes_per_node == 0 {
            DEFAULT_VNODES
        } else {
            vnodes_per_node
        };
        Self {
            vnodes_per_node,
            vnodes: Vec::new(),
            nodes: HashMap::new(),
        }
    }

    /// Rebuild the ring from scratch with the given nodes.
    pub fn set_nodes(&mut self, nodes: &[RingNode]) {
        self.nodes = HashMap::with_capacity(nodes.len());
        self.vnodes = Vec::with_capacity(nodes.len() * self.vnodes_per_node);

        for node in nodes {
            self.nodes.insert(node.id.clone(), node.clone());
            for i in 0..self.vnodes_per_node {
                let hash = vnode_hash(&node.id, i);
                self.vnodes.push(Vnode {
                    hash,
                    node_id: node.id.clone(),
                });
            }
        }

        // Sort by (hash, owner) so equal hashes order deterministically too.
        self.vnodes
            .sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node_id.cmp(&b.node_id)));
    }

    /// Add a single node, leaving the vnode sequence identical to a full
    /// rebuild over the extended set.
    pub fn add_node(&mut self, node: RingNode) {
        if self.nodes.contains_key(&node.id) {
            return;
        }
        self.nodes.insert(node.id.clone(), node.clone());
        for i in 0..self.vnodes_per_node {
            let hash = vnode_hash(&node.id, i);
            let vnode = Vnode {
                hash,
                node_id: node.id.clone(),
            };
            let idx = self
                .vnodes
                .partition_point(|v| (v.hash, v.node_id.as_str()) < (hash, node.id.as_str()));
            self.vnodes.insert(idx, vnode);
        }
    }

    /// Remove a node and all of its vnodes.
    pub fn remove_node(&mut self, node_id: &str) {
        if self.nodes.remove(node_id).is_none() {
            return;
        }
        self.vnodes.retain(|v| v.node_id != node_id);
    }

    /// The node owning `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &str) -> Option<&RingNode> {
        if self.vnodes.is_empty() {
            return None;
        }
        let idx = self.first_vnode_index(key);
        self.nodes.get(&self.vnodes[idx].node_id)
    }

    /// Up to `k` distinct physical nodes, walking forward from the owner.
    pub fn preference_list(&self, key: &str, k: usize) -> Vec<RingNode> {
        if self.vnodes.is_empty() || k == 0 {
            return Vec::new();
        }

        let start = self.first_vnode_index(key);
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(k.min(self.nodes.len()));

        for offset in 0..self.vnodes.len() {
            if out.len() >= k {
                break;
            }
            let vnode = &self.vnodes[(start + offset) % self.vnodes.len()];
            if seen.insert(vnode.node_id.as_str()) {
                if let Some(node) = self.nodes.get(&vnode.node_id) {
                    out.push(node.clone());
                }
            }
        }
        out
    }

    /// All physical nodes currently on the ring.
    pub fn nodes(&self) -> Vec<RingNode> {
        self.nodes.values().cloned().collect()
    }

    /// Number of physical nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node occupies the ring.
    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    /// Configured virtual nodes per physical node.
    pub fn vnodes_per_node(&self) -> usize {
        self.vnodes_per_node
    }

    /// Index of the first vnode with hash >= H(key), wrapping to zero.
    fn first_vnode_index(&self, key: &str) -> usize {
        let key_hash = fnv1a32(key.as_bytes());
        let idx = self.vnodes.partition_point(|v| v.hash < key_hash);
        if idx >= self.vnodes.len() {
            0
        } else {
            idx
        }
    }
}

/// Atomically swappable ring snapshot.
///
/// Readers grab an `Arc<Ring>` and keep using it for the whole request even
/// if membership changes mid-flight; `rebuild` publishes a replacement built
/// from the new node set.
pub struct RingHandle {
    vnodes_per_node: usize,
    inner: RwLock<Arc<Ring>>,
}

impl RingHandle {
    /// Build the initial ring from `nodes`.
    pub fn new(vnodes_per_node: usize, nodes: &[RingNode]) -> Self {
        let mut ring = Ring::new(vnodes_per_node);
        ring.set_nodes(nodes);
        Self {
            vnodes_per_node: ring.vnodes_per_node(),
            inner: RwLock::new(Arc::new(ring)),
        }
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<Ring> {
        self.inner.read().expect("ring lock poisoned").clone()
    }

    /// Replace the ring with one built from `nodes`.
    pub fn rebuild(&self, nodes: &[RingNode]) {
        let mut ring = Ring::new(self.vnodes_per_node);
        ring.set_nodes(nodes);
        *self.inner.write().expect("ring lock poisoned") = Arc::new(ring);
    }
}

/// Hash for a node's i-th virtual node.
fn vnode_hash(node_id: &str, index: usize) -> u32 {
    fnv1a32(format!("{node_id}-vnode-{index}").as_bytes())
}

/// 32-bit FNV-1a. Deterministic across processes and platforms, which the
/// std hasher does not guarantee.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
