//! Consistent-hash ring derived from the membership view. Rebuilt from
//! scratch every tick; construction is deterministic for a given view, so
//! all nodes agree on placement without coordination.

use serde::Deserialize;

use crate::network::{ring_position, NodeAddress};

#[derive(Clone, Deserialize, Debug)]
pub struct RingConfig {
    /// Modulus of the consistent hash. Must be identical on every node.
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingNode {
    pub addr: NodeAddress,
    pub position: u64,
}

#[derive(Clone, Debug, Default)]
pub struct Ring {
    nodes: Vec<RingNode>,
    ring_size: u64,
}

impl Ring {
    pub fn from_members(members: impl Iterator<Item = NodeAddress>, ring_size: u64) -> Self {
        let mut nodes: Vec<RingNode> = members
            .map(|addr| RingNode {
                addr,
                position: addr.ring_position(ring_size),
            })
            .collect();
        // Positions may collide, the address breaks the tie the same way
        // everywhere.
        nodes.sort_by_key(|n| (n.position, n.addr));
        Self { nodes, ring_size }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RingNode] {
        &self.nodes
    }

    pub fn contains(&self, addr: NodeAddress) -> bool {
        self.nodes.iter().any(|n| n.addr == addr)
    }

    /// The three successive nodes responsible for `key`, in placement order
    /// (primary, secondary, tertiary). `None` when the ring is too small to
    /// place three replicas.
    pub fn replicas_for(&self, key: &str) -> Option<[RingNode; 3]> {
        if self.nodes.len() < 3 {
            return None;
        }
        let pos = ring_position(key, self.ring_size);
        let n = self.nodes.len();
        let i = self
            .nodes
            .iter()
            .position(|node| pos <= node.position)
            .unwrap_or(0);
        Some([
            self.nodes[i],
            self.nodes[(i + 1) % n],
            self.nodes[(i + 2) % n],
        ])
    }

    /// The two ring predecessors and two successors of `addr`, nearest
    /// last (`predecessors[1]` is the immediate predecessor).
    pub fn neighborhood_of(&self, addr: NodeAddress) -> Option<Neighborhood> {
        let i = self.nodes.iter().position(|n| n.addr == addr)?;
        let n = self.nodes.len();
        Some(Neighborhood {
            predecessors: vec![
                self.nodes[(i + n - 2) % n].addr,
                self.nodes[(i + n - 1) % n].addr,
            ],
            successors: vec![self.nodes[(i + 1) % n].addr, self.nodes[(i + 2) % n].addr],
        })
    }
}

/// The ring slice around one node: who it holds replicas for and who holds
/// its replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Neighborhood {
    pub predecessors: Vec<NodeAddress>,
    pub successors: Vec<NodeAddress>,
}

/// Handed to the storage coordinator when the neighborhood moved; carries
/// the neighborhood as it was before the change.
#[derive(Clone, Debug)]
pub struct RingChange {
    pub old_predecessors: Vec<NodeAddress>,
    pub old_successors: Vec<NodeAddress>,
}

pub struct RingManager {
    config: RingConfig,
    ring: Ring,
    committed: Neighborhood,
}

impl RingManager {
    pub fn new(config: RingConfig) -> Self {
        Self {
            config,
            ring: Ring::default(),
            committed: Neighborhood::default(),
        }
    }

    pub fn rebuild(&mut self, members: impl Iterator<Item = NodeAddress>) {
        self.ring = Ring::from_members(members, self.config.size);
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Detects whether the neighborhood around `self_addr` moved since the
    /// last call. Comparison is by address equality; positions are not
    /// trusted because they may collide. On change the previously committed
    /// neighborhood is surrendered for use by stabilization.
    pub fn take_change(&mut self, self_addr: NodeAddress) -> Option<RingChange> {
        let current = self.ring.neighborhood_of(self_addr).unwrap_or_default();
        if current == self.committed {
            return None;
        }
        let old = std::mem::replace(&mut self.committed, current);
        Some(RingChange {
            old_predecessors: old.predecessors,
            old_successors: old.successors,
        })
    }
}
