/// Approximate Reconciliation Tree.
///
/// An ART compresses a finalised Merkle tree into one Bloom filter per
/// level: level `d` holds the hashes of all tree nodes at depth `d`, and a
/// separate leaf filter holds every leaf hash regardless of depth (the tree
/// is adaptively split, so leaves occur at many depths). Comparison walks
/// the local tree top-down: a node hash absent from the remote level
/// filter marks the subtree divergent and the walk descends to narrow the
/// divergence to leaf intervals; a present hash prunes the subtree, which
/// is where the approximation (false positives hiding real differences)
/// comes from.
///
/// The correction factor enlarges filter capacity to compensate for error
/// compounding across levels.
use crate::error::{RepairError, RepairResult};
use crate::keyspace::Interval;
use crate::reconciliation::bloom::{BloomFilter, BloomParts};
use crate::reconciliation::merkle::{MerkleTree, Node};
use serde::{Deserialize, Serialize};

/// ART sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArtConfig {
    /// False-positive rate of the per-level filters over inner nodes.
    pub inner_fpr: f64,
    /// False-positive rate of the leaf filter.
    pub leaf_fpr: f64,
    /// Capacity multiplier (>= 1) applied to every filter.
    pub correction_factor: f64,
}

impl Default for ArtConfig {
    fn default() -> Self {
        Self {
            inner_fpr: 0.01,
            leaf_fpr: 0.1,
            correction_factor: 2.0,
        }
    }
}

/// Wire form of an ART.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtParts {
    /// The interval the source tree summarised.
    pub interval: Interval,
    /// Per-level filters, outermost level first.
    pub level_filters: Vec<BloomParts>,
    /// Filter over all leaf hashes.
    pub leaf_filter: BloomParts,
}

/// Bloom-filter-per-level digest of a finalised Merkle tree.
#[derive(Debug, Clone)]
pub struct Art {
    interval: Interval,
    levels: Vec<BloomFilter>,
    leaves: BloomFilter,
}

impl Art {
    /// Digest a finalised tree.
    pub fn from_tree(tree: &MerkleTree, config: &ArtConfig) -> RepairResult<Art> {
        if !tree.is_finalised() {
            return Err(RepairError::TreeNotFinalised);
        }

        // Count nodes per depth to size the filters.
        let mut level_counts: Vec<usize> = Vec::new();
        let mut leaf_count = 0usize;
        visit(tree.root_node(), 0, &mut |node, depth| {
            if level_counts.len() <= depth {
                level_counts.resize(depth + 1, 0);
            }
            level_counts[depth] += 1;
            if node.is_leaf() {
                leaf_count += 1;
            }
        });

        let capacity = |count: usize| ((count as f64 * config.correction_factor).ceil() as usize).max(1);
        let mut levels: Vec<BloomFilter> = level_counts
            .iter()
            .map(|&count| BloomFilter::new(capacity(count), config.inner_fpr))
            .collect();
        let mut leaves = BloomFilter::new(capacity(leaf_count), config.leaf_fpr);

        visit(tree.root_node(), 0, &mut |node, depth| {
            levels[depth].add(&node.hash());
            if node.is_leaf() {
                leaves.add(&node.hash());
            }
        });

        Ok(Art {
            interval: tree.interval(),
            levels,
            leaves,
        })
    }

    /// The interval the digested tree covered.
    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Number of levels digested.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Walk `local` against this remote digest and collect the leaf
    /// intervals of subtrees the remote (probably) does not have.
    ///
    /// Absence is definite, so every returned interval genuinely diverges;
    /// false positives can only hide divergence, never invent it.
    pub fn divergent_intervals(&self, local: &MerkleTree) -> RepairResult<Vec<Interval>> {
        if !local.is_finalised() {
            return Err(RepairError::TreeNotFinalised);
        }
        if local.interval() != self.interval {
            return Err(RepairError::IntervalMismatch {
                local: local.interval(),
                remote: self.interval,
            });
        }
        let mut divergent = Vec::new();
        self.walk(local.root_node(), 0, &mut divergent);
        Ok(divergent)
    }

    fn walk(&self, node: &Node, depth: usize, divergent: &mut Vec<Interval>) {
        if node.interval().is_empty() {
            return;
        }
        if node.is_leaf() {
            if !self.leaves.contains(&node.hash()) {
                divergent.push(node.interval());
            }
            return;
        }
        // A level the remote digested and a present hash prunes the
        // subtree; anything else descends.
        if let Some(filter) = self.levels.get(depth) {
            if filter.contains(&node.hash()) {
                return;
            }
        }
        for child in node.children() {
            self.walk(child, depth + 1, divergent);
        }
    }

    /// Split into the wire form.
    pub fn to_parts(&self) -> ArtParts {
        ArtParts {
            interval: self.interval,
            level_filters: self.levels.iter().map(BloomFilter::to_parts).collect(),
            leaf_filter: self.leaves.to_parts(),
        }
    }

    /// Rebuild from the wire form.
    pub fn from_parts(parts: &ArtParts) -> RepairResult<Art> {
        if parts.level_filters.is_empty() {
            return Err(RepairError::MalformedSummary(
                "art summary has no levels".to_string(),
            ));
        }
        let levels = parts
            .level_filters
            .iter()
            .map(BloomFilter::from_parts)
            .collect::<RepairResult<Vec<_>>>()?;
        let leaves = BloomFilter::from_parts(&parts.leaf_filter)?;
        Ok(Art {
            interval: parts.interval,
            levels,
            leaves,
        })
    }
}

fn visit<'a>(node: &'a Node, depth: usize, f: &mut impl FnMut(&'a Node, usize)) {
    f(node, depth);
    for child in node.children() {
        visit(child, depth + 1, f);
    }
}
