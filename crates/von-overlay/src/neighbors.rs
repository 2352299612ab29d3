//! Neighbor table and per-neighbor knowledge state.

use std::collections::BTreeMap;

use von_transport::{PeerId, ID_UNASSIGNED};

use crate::node::Node;

/// What happened to a neighbor since the last [`NeighborTable::take_updates`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStatus {
    /// Newly inserted
    Inserted,
    /// Position, radius or metadata changed
    Updated,
    /// Removed
    Deleted,
}

/// What one neighbor is believed to know about another.
///
/// A bitmask over [`NeighborState::OVERLAPPED`] and
/// [`NeighborState::ENCLOSED`]; the empty mask is
/// [`NeighborState::REGULAR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NeighborState(u8);

impl NeighborState {
    /// Neither overlapped nor enclosing
    pub const REGULAR: Self = Self(0);
    /// Inside the other node's AOI
    pub const OVERLAPPED: Self = Self(1);
    /// Enclosing neighbor of the other node
    pub const ENCLOSED: Self = Self(2);

    /// All bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// No bit set.
    pub const fn is_regular(self) -> bool {
        self.0 == 0
    }

    /// Whether moving from `known` to `self` is news worth a notification.
    ///
    /// A neighbor is worth telling about when it was not known to overlap
    /// and it now either overlaps, or newly became enclosing.
    pub const fn is_news_since(self, known: Self) -> bool {
        !known.contains(Self::OVERLAPPED)
            && (self.contains(Self::OVERLAPPED)
                || (!known.contains(Self::ENCLOSED) && self.contains(Self::ENCLOSED)))
    }
}

impl std::ops::BitOr for NeighborState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Local view of the overlay: peer id → node record.
///
/// Updates follow last-write-wins on [`Node::time`]: a snapshot older than
/// the stored one is ignored. The table never holds id 0.
#[derive(Debug, Default, Clone)]
pub struct NeighborTable {
    nodes: BTreeMap<PeerId, Node>,
    updates: BTreeMap<PeerId, UpdateStatus>,
}

impl NeighborTable {
    /// Create empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a node by id.
    pub fn get(&self, id: PeerId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Whether `id` is present.
    pub fn contains(&self, id: PeerId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Insert a node not yet present.
    ///
    /// Returns false if the id is unassigned or already known.
    pub fn insert(&mut self, node: Node) -> bool {
        if node.id == ID_UNASSIGNED || self.nodes.contains_key(&node.id) {
            return false;
        }
        self.updates.insert(node.id, UpdateStatus::Inserted);
        self.nodes.insert(node.id, node);
        true
    }

    /// Apply a snapshot of a known node.
    ///
    /// Returns true if the node was present and the snapshot not older.
    pub fn update(&mut self, node: &Node) -> bool {
        let Some(existing) = self.nodes.get_mut(&node.id) else {
            return false;
        };
        if node.time < existing.time {
            return false;
        }
        existing.update(node);

        // An insert not yet reported stays an insert
        let status = self.updates.entry(node.id).or_insert(UpdateStatus::Updated);
        if *status != UpdateStatus::Inserted {
            *status = UpdateStatus::Updated;
        }
        true
    }

    /// Record that `id` was heard from at `now`.
    pub fn touch(&mut self, id: PeerId, now: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.endpoint.last_accessed = now;
        }
    }

    /// Remove a node.
    pub fn remove(&mut self, id: PeerId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        // An insert nobody has seen yet cancels out
        if self.updates.get(&id) == Some(&UpdateStatus::Inserted) {
            self.updates.remove(&id);
        } else {
            self.updates.insert(id, UpdateStatus::Deleted);
        }
        Some(node)
    }

    /// Number of nodes (self included).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.nodes.keys().copied()
    }

    /// All nodes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Drain the change log.
    pub fn take_updates(&mut self) -> Vec<(PeerId, UpdateStatus)> {
        std::mem::take(&mut self.updates).into_iter().collect()
    }

    /// Clear all nodes and the change log.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.updates.clear();
    }
}
