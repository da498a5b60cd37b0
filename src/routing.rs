/// Successor-based routing table.
///
/// A thin view of the ring: every known node's position, sorted, with
/// successor lookup. The node at position `p` with predecessor `q` is
/// responsible for the arc `(q, p]`. Ring maintenance (joins, slides,
/// finger tables) happens elsewhere; the repair engine only ever asks
/// "who is responsible for this replica key" and "what range do I own".
use crate::keyspace::{Bound, Interval, RingKey};
use crate::network::NodeId;

/// Sorted node positions with successor lookup.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// `(position, node)` pairs, sorted by position.
    ring: Vec<(RingKey, NodeId)>,
}

impl RoutingTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or move a node. A node appears at most once.
    pub fn insert(&mut self, position: RingKey, node: NodeId) {
        self.ring.retain(|(_, n)| *n != node);
        match self.ring.binary_search_by_key(&position, |(p, _)| *p) {
            // Position collision: last write wins.
            Ok(i) => self.ring[i] = (position, node),
            Err(i) => self.ring.insert(i, (position, node)),
        }
    }

    /// Remove a node.
    pub fn remove(&mut self, node: NodeId) {
        self.ring.retain(|(_, n)| *n != node);
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// The node responsible for `key`: the first position at or after it,
    /// wrapping around zero.
    pub fn lookup(&self, key: RingKey) -> Option<NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let i = match self.ring.binary_search_by_key(&key, |(p, _)| *p) {
            Ok(i) => i,
            Err(i) => i,
        };
        let (_, node) = self.ring.get(i).or_else(|| self.ring.first())?;
        Some(*node)
    }

    /// The arc `(predecessor, position]` a node is responsible for. A
    /// single-node ring owns everything.
    pub fn responsibility(&self, node: NodeId) -> Option<Interval> {
        let i = self.ring.iter().position(|(_, n)| *n == node)?;
        if self.ring.len() == 1 {
            return Some(Interval::Full);
        }
        let (position, _) = self.ring[i];
        let (predecessor, _) = if i == 0 {
            *self.ring.last()?
        } else {
            self.ring[i - 1]
        };
        Some(Interval::from_bounds(
            Bound::Open,
            predecessor,
            position,
            Bound::Closed,
        ))
    }

    /// All known `(position, node)` pairs in ring order.
    pub fn nodes(&self) -> &[(RingKey, NodeId)] {
        &self.ring
    }
}
