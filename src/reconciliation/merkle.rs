/// Interval-partitioned Merkle tree.
///
/// The tree summarises the `(key, version)` items of a ring interval so two
/// nodes can locate differing sub-intervals without exchanging all keys.
/// Leaves hold buckets of items; a bucket that reaches the configured size
/// is split by equi-partitioning the leaf's interval into `branch_factor`
/// child arcs and redistributing. Finalisation computes hashes bottom-up
/// and freezes the tree.
///
/// The leaf hash is SHA-256 over the serialised, key-sorted bucket (a fixed
/// constant for an empty bucket). The inner hash is the bitwise XOR of the
/// child hashes. XOR is commutative, which is sound here because child
/// intervals are disjoint; the same key can never sit under two siblings.
/// Do not swap in a non-commutative inner hash without re-examining the
/// comparison algorithm.
use crate::error::{RepairError, RepairResult};
use crate::keyspace::{Interval, RingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Node hash width.
pub type NodeHash = [u8; 32];

/// Hash of a leaf with no items.
pub const EMPTY_BUCKET_HASH: NodeHash = [0u8; 32];

/// Shape parameters of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleConfig {
    /// Children per split leaf.
    pub branch_factor: usize,
    /// Items a leaf holds before it splits.
    pub bucket_size: usize,
}

impl Default for MerkleConfig {
    fn default() -> Self {
        Self {
            branch_factor: 2,
            bucket_size: 64,
        }
    }
}

/// One item summarised by the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    /// Ring position (in the session's coordinate space).
    pub key: RingKey,
    /// Entry version.
    pub version: u64,
}

impl LeafItem {
    /// Serialised identity-and-version fingerprint, the unit fed into
    /// Bloom filters and leaf hashes.
    pub fn fingerprint(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(&self.key.to_be_bytes());
        out[16..].copy_from_slice(&self.version.to_be_bytes());
        out
    }
}

/// A node signature exchanged during level-by-level comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MerkleDigest {
    /// The interval this signature covers.
    pub interval: Interval,
    /// The node hash.
    pub hash: NodeHash,
    /// Whether the sender has no deeper structure under this interval.
    pub leaf: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum Node {
    Leaf {
        interval: Interval,
        bucket: Vec<LeafItem>,
        hash: Option<NodeHash>,
    },
    Inner {
        interval: Interval,
        children: Vec<Node>,
        count: u64,
        hash: Option<NodeHash>,
    },
}

impl Node {
    pub(crate) fn interval(&self) -> Interval {
        match self {
            Node::Leaf { interval, .. } | Node::Inner { interval, .. } => *interval,
        }
    }

    pub(crate) fn hash(&self) -> NodeHash {
        match self {
            Node::Leaf { hash, .. } | Node::Inner { hash, .. } => {
                hash.unwrap_or(EMPTY_BUCKET_HASH)
            }
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub(crate) fn children(&self) -> &[Node] {
        match self {
            Node::Leaf { .. } => &[],
            Node::Inner { children, .. } => children,
        }
    }
}

enum InsertOutcome {
    Added,
    Replaced,
}

/// Balanced, interval-partitioned hash tree.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root: Node,
    config: MerkleConfig,
    size: u64,
    finalised: bool,
}

impl MerkleTree {
    /// Empty tree over `interval`. Fails on an empty interval or a
    /// degenerate shape.
    pub fn new(interval: Interval, config: MerkleConfig) -> RepairResult<Self> {
        if interval.is_empty() {
            return Err(RepairError::EmptyTreeInterval);
        }
        if config.branch_factor < 2 || config.bucket_size == 0 {
            return Err(RepairError::Config(format!(
                "merkle shape: branch_factor={}, bucket_size={}",
                config.branch_factor, config.bucket_size
            )));
        }
        Ok(Self {
            root: Node::Leaf {
                interval,
                bucket: Vec::new(),
                hash: None,
            },
            config,
            size: 0,
            finalised: false,
        })
    }

    /// Build and finalise a tree in one step.
    pub fn from_items(
        interval: Interval,
        config: MerkleConfig,
        items: impl IntoIterator<Item = (RingKey, u64)>,
    ) -> RepairResult<Self> {
        let mut tree = Self::new(interval, config)?;
        for (key, version) in items {
            tree.insert(key, version)?;
        }
        tree.finalise();
        Ok(tree)
    }

    /// Insert an item into the leaf whose interval contains `key`.
    /// Re-inserting a key replaces its version. Fails on a finalised tree
    /// or a key outside the root interval.
    pub fn insert(&mut self, key: RingKey, version: u64) -> RepairResult<()> {
        if self.finalised {
            return Err(RepairError::TreeFinalised);
        }
        let root_interval = self.root.interval();
        if !root_interval.contains(key) {
            return Err(RepairError::KeyOutsideInterval {
                key,
                interval: root_interval,
            });
        }
        match insert_node(&mut self.root, key, version, self.config)? {
            InsertOutcome::Added => self.size += 1,
            InsertOutcome::Replaced => {}
        }
        Ok(())
    }

    /// Compute hashes bottom-up and freeze the tree. Idempotent.
    pub fn finalise(&mut self) {
        if !self.finalised {
            finalise_node(&mut self.root);
            self.finalised = true;
        }
    }

    /// Total items in the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the tree has been finalised.
    pub fn is_finalised(&self) -> bool {
        self.finalised
    }

    /// The interval the tree summarises.
    pub fn interval(&self) -> Interval {
        self.root.interval()
    }

    /// The shape parameters.
    pub fn config(&self) -> MerkleConfig {
        self.config
    }

    /// Root hash of a finalised tree; a deterministic function of the item
    /// multiset and the configured hashes.
    pub fn root_hash(&self) -> RepairResult<NodeHash> {
        if !self.finalised {
            return Err(RepairError::TreeNotFinalised);
        }
        Ok(self.root.hash())
    }

    /// Signature of the root, the opening message of a comparison.
    pub fn root_digest(&self) -> RepairResult<MerkleDigest> {
        if !self.finalised {
            return Err(RepairError::TreeNotFinalised);
        }
        Ok(MerkleDigest {
            interval: self.root.interval(),
            hash: self.root.hash(),
            leaf: self.root.is_leaf(),
        })
    }

    /// Maximum depth of the tree (0 for a bucket-only root).
    pub fn depth(&self) -> usize {
        fn depth_of(node: &Node) -> usize {
            node.children()
                .iter()
                .map(|c| 1 + depth_of(c))
                .max()
                .unwrap_or(0)
        }
        depth_of(&self.root)
    }

    pub(crate) fn root_node(&self) -> &Node {
        &self.root
    }

    /// Process one round of incoming signatures during level-by-level
    /// comparison.
    ///
    /// Returns the signatures to send back (descending into divergent
    /// inner nodes, or terminal echoes for divergent leaves) and the
    /// divergent intervals newly discovered on this side. `seen` carries
    /// the intervals already reported across rounds so echoes terminate.
    pub fn diff_digests(
        &self,
        incoming: &[MerkleDigest],
        seen: &mut HashSet<Interval>,
    ) -> RepairResult<(Vec<MerkleDigest>, Vec<Interval>)> {
        if !self.finalised {
            return Err(RepairError::TreeNotFinalised);
        }
        let mut reply = Vec::new();
        let mut divergent = Vec::new();

        for digest in incoming {
            if digest.interval.is_empty() {
                continue;
            }
            let Some((node, exact)) = self.find_node(&digest.interval) else {
                continue;
            };
            if exact && node.hash() == digest.hash {
                continue;
            }
            if exact && !node.is_leaf() && !digest.leaf {
                // Both sides have structure here: descend.
                for child in node.children() {
                    if !child.interval().is_empty() {
                        reply.push(MerkleDigest {
                            interval: child.interval(),
                            hash: child.hash(),
                            leaf: child.is_leaf(),
                        });
                    }
                }
                continue;
            }
            // One side bottomed out: the interval diverges.
            let local_interval = if exact { digest.interval } else { node.interval() };
            let first_local = seen.insert(local_interval);
            let first_remote = if local_interval == digest.interval {
                first_local
            } else {
                seen.insert(digest.interval)
            };
            if first_local {
                divergent.push(local_interval);
            }
            if first_remote {
                reply.push(MerkleDigest {
                    interval: digest.interval,
                    hash: node.hash(),
                    leaf: true,
                });
            }
        }
        Ok((reply, divergent))
    }

    /// Walk down to the node covering exactly `interval`, or the leaf that
    /// contains it when this tree is less deeply split there.
    fn find_node(&self, interval: &Interval) -> Option<(&Node, bool)> {
        let probe = match interval {
            Interval::Empty => return None,
            Interval::Full => 0,
            Interval::Arc { left, .. } => *left,
        };
        let mut node = &self.root;
        loop {
            if node.interval() == *interval {
                return Some((node, true));
            }
            if node.is_leaf() {
                return Some((node, false));
            }
            match node
                .children()
                .iter()
                .find(|c| c.interval().contains(probe))
            {
                Some(child) => node = child,
                None => return None,
            }
        }
    }
}

/// Offline comparison of two finalised trees over the same interval.
///
/// Returns the minimal set of disjoint sub-intervals whose leaf signatures
/// differ. Symmetric: `compare(a, b)` and `compare(b, a)` report the same
/// interval set.
pub fn compare(a: &MerkleTree, b: &MerkleTree) -> RepairResult<Vec<Interval>> {
    if !a.finalised || !b.finalised {
        return Err(RepairError::TreeNotFinalised);
    }
    if a.root.interval() != b.root.interval() {
        return Err(RepairError::IntervalMismatch {
            local: a.root.interval(),
            remote: b.root.interval(),
        });
    }
    if a.config != b.config {
        return Err(RepairError::MalformedSummary(
            "merkle configuration mismatch".to_string(),
        ));
    }
    let mut out = Vec::new();
    walk(&a.root, &b.root, &mut out);
    Ok(out)
}

fn walk(a: &Node, b: &Node, out: &mut Vec<Interval>) {
    if a.hash() == b.hash() {
        return;
    }
    match (a, b) {
        (Node::Inner { children: ca, .. }, Node::Inner { children: cb, .. })
            if ca.len() == cb.len() =>
        {
            for (x, y) in ca.iter().zip(cb) {
                walk(x, y, out);
            }
        }
        // A leaf on either side bottoms out the descent; both nodes cover
        // the same interval by construction.
        _ => out.push(a.interval()),
    }
}

fn insert_node(
    node: &mut Node,
    key: RingKey,
    version: u64,
    config: MerkleConfig,
) -> RepairResult<InsertOutcome> {
    match node {
        Node::Leaf {
            interval, bucket, ..
        } => {
            if let Some(existing) = bucket.iter_mut().find(|item| item.key == key) {
                existing.version = version;
                return Ok(InsertOutcome::Replaced);
            }
            if bucket.len() < config.bucket_size {
                bucket.push(LeafItem { key, version });
                return Ok(InsertOutcome::Added);
            }
            // Bucket full: split the leaf and redistribute.
            let parent_interval = *interval;
            let items = std::mem::take(bucket);
            let children: Vec<Node> = parent_interval
                .partition(config.branch_factor)
                .into_iter()
                .map(|child_interval| Node::Leaf {
                    interval: child_interval,
                    bucket: Vec::new(),
                    hash: None,
                })
                .collect();
            *node = Node::Inner {
                interval: parent_interval,
                children,
                count: 0,
                hash: None,
            };
            for item in items {
                insert_node(node, item.key, item.version, config)?;
            }
            insert_node(node, key, version, config)
        }
        Node::Inner { children, .. } => {
            for child in children.iter_mut() {
                if child.interval().contains(key) {
                    return insert_node(child, key, version, config);
                }
            }
            Err(RepairError::KeyOutsideInterval {
                key,
                interval: node.interval(),
            })
        }
    }
}

fn finalise_node(node: &mut Node) -> (NodeHash, u64) {
    match node {
        Node::Leaf { bucket, hash, .. } => {
            bucket.sort_by_key(|item| item.key);
            let h = if bucket.is_empty() {
                EMPTY_BUCKET_HASH
            } else {
                let mut hasher = Sha256::new();
                for item in bucket.iter() {
                    hasher.update(item.key.to_be_bytes());
                    hasher.update(item.version.to_be_bytes());
                }
                hasher.finalize().into()
            };
            *hash = Some(h);
            (h, bucket.len() as u64)
        }
        Node::Inner {
            children,
            count,
            hash,
            ..
        } => {
            let mut acc = EMPTY_BUCKET_HASH;
            let mut total = 0u64;
            for child in children.iter_mut() {
                let (child_hash, child_count) = finalise_node(child);
                for (a, b) in acc.iter_mut().zip(child_hash.iter()) {
                    *a ^= b;
                }
                total += child_count;
            }
            *count = total;
            *hash = Some(acc);
            (acc, total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_of(interval: Interval, config: MerkleConfig, keys: &[(u128, u64)]) -> MerkleTree {
        MerkleTree::from_items(interval, config, keys.iter().copied()).unwrap()
    }

    #[test]
    fn test_empty_interval_rejected() {
        assert!(matches!(
            MerkleTree::new(Interval::Empty, MerkleConfig::default()),
            Err(RepairError::EmptyTreeInterval)
        ));
    }

    #[test]
    fn test_insert_outside_interval_fails() {
        let mut tree = MerkleTree::new(Interval::arc(0, 100), MerkleConfig::default()).unwrap();
        assert!(matches!(
            tree.insert(100, 1),
            Err(RepairError::KeyOutsideInterval { .. })
        ));
    }

    #[test]
    fn test_insert_after_finalise_fails() {
        let mut tree = MerkleTree::new(Interval::arc(0, 100), MerkleConfig::default()).unwrap();
        tree.insert(1, 1).unwrap();
        tree.finalise();
        assert!(matches!(tree.insert(2, 1), Err(RepairError::TreeFinalised)));
    }

    #[test]
    fn test_root_hash_requires_finalise() {
        let tree = MerkleTree::new(Interval::arc(0, 100), MerkleConfig::default()).unwrap();
        assert!(matches!(
            tree.root_hash(),
            Err(RepairError::TreeNotFinalised)
        ));
    }

    #[test]
    fn test_hash_deterministic_under_insertion_order() {
        let interval = Interval::arc(0, 1 << 20);
        let config = MerkleConfig {
            branch_factor: 2,
            bucket_size: 4,
        };
        let keys: Vec<(u128, u64)> = (0..200u128).map(|i| (i * 37 % (1 << 20), 1)).collect();
        let mut reversed = keys.clone();
        reversed.reverse();

        let a = tree_of(interval, config, &keys);
        let b = tree_of(interval, config, &reversed);
        assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());
        assert_eq!(a.size(), b.size());
    }

    #[test]
    fn test_one_item_buckets_split_every_key() {
        let config = MerkleConfig {
            branch_factor: 2,
            bucket_size: 1,
        };
        let keys: Vec<(u128, u64)> = (0..16u128).map(|i| (i, 1)).collect();
        let tree = tree_of(Interval::Full, config, &keys);
        assert_eq!(tree.size(), 16);
        // 16 adjacent keys at the bottom of a 2^128 ring force a deep spine.
        assert!(tree.depth() > 100, "depth {}", tree.depth());
    }

    #[test]
    fn test_reinsert_replaces_version() {
        let mut tree = MerkleTree::new(Interval::arc(0, 100), MerkleConfig::default()).unwrap();
        tree.insert(5, 1).unwrap();
        tree.insert(5, 2).unwrap();
        assert_eq!(tree.size(), 1);
    }

    #[test]
    fn test_compare_identical_is_empty() {
        let interval = Interval::arc(0, 10_000);
        let config = MerkleConfig {
            branch_factor: 4,
            bucket_size: 8,
        };
        let keys: Vec<(u128, u64)> = (0..300u128).map(|i| (i * 31 % 10_000, 1)).collect();
        let a = tree_of(interval, config, &keys);
        let b = tree_of(interval, config, &keys);
        assert_eq!(compare(&a, &b).unwrap(), Vec::<Interval>::new());
    }

    #[test]
    fn test_compare_empty_trees() {
        let a = tree_of(Interval::Full, MerkleConfig::default(), &[]);
        let b = tree_of(Interval::Full, MerkleConfig::default(), &[]);
        assert!(compare(&a, &b).unwrap().is_empty());
    }

    #[test]
    fn test_compare_finds_version_change() {
        let interval = Interval::arc(0, 1 << 16);
        let config = MerkleConfig {
            branch_factor: 2,
            bucket_size: 4,
        };
        let keys: Vec<(u128, u64)> = (0..128u128).map(|i| (i * 512, 1)).collect();
        let mut stale = keys.clone();
        stale[17].1 = 2;

        let a = tree_of(interval, config, &keys);
        let b = tree_of(interval, config, &stale);

        let diff = compare(&a, &b).unwrap();
        assert!(!diff.is_empty());
        assert!(diff.iter().any(|iv| iv.contains(keys[17].0)));
        // No divergence reported where nothing changed.
        assert!(!diff.iter().any(|iv| iv.contains(keys[90].0)));
    }

    #[test]
    fn test_compare_is_symmetric() {
        let interval = Interval::arc(0, 1 << 16);
        let config = MerkleConfig {
            branch_factor: 2,
            bucket_size: 4,
        };
        let keys_a: Vec<(u128, u64)> = (0..100u128).map(|i| (i * 523, 1)).collect();
        let mut keys_b = keys_a.clone();
        keys_b.truncate(90); // b misses ten items

        let a = tree_of(interval, config, &keys_a);
        let b = tree_of(interval, config, &keys_b);

        let ab: HashSet<Interval> = compare(&a, &b).unwrap().into_iter().collect();
        let ba: HashSet<Interval> = compare(&b, &a).unwrap().into_iter().collect();
        assert_eq!(ab, ba);
        assert!(!ab.is_empty());
    }

    #[test]
    fn test_compare_rejects_interval_mismatch() {
        let a = tree_of(Interval::arc(0, 100), MerkleConfig::default(), &[(1, 1)]);
        let b = tree_of(Interval::arc(0, 200), MerkleConfig::default(), &[(1, 1)]);
        assert!(matches!(
            compare(&a, &b),
            Err(RepairError::IntervalMismatch { .. })
        ));
    }

    #[test]
    fn test_digest_exchange_converges() {
        // Simulate the wire protocol: two sides exchange digests until
        // quiescent, then both know the divergent intervals.
        let interval = Interval::arc(0, 1 << 16);
        let config = MerkleConfig {
            branch_factor: 2,
            bucket_size: 4,
        };
        let keys_a: Vec<(u128, u64)> = (0..200u128).map(|i| (i * 293 % (1 << 16), 3)).collect();
        let mut keys_b = keys_a.clone();
        keys_b[5].1 = 4; // b is newer here
        keys_b.remove(100); // b misses this key

        let a = tree_of(interval, config, &keys_a);
        let b = tree_of(interval, config, &keys_b);

        let mut seen_a = HashSet::new();
        let mut seen_b = HashSet::new();
        let mut divergent_a = Vec::new();
        let mut divergent_b = Vec::new();

        // a opens with its root digest; messages ping-pong until empty.
        let mut in_flight = vec![a.root_digest().unwrap()];
        let mut to_b = true;
        let mut rounds = 0;
        while !in_flight.is_empty() {
            rounds += 1;
            assert!(rounds < 1000, "digest exchange did not converge");
            if to_b {
                let (reply, divergent) = b.diff_digests(&in_flight, &mut seen_b).unwrap();
                divergent_b.extend(divergent);
                in_flight = reply;
            } else {
                let (reply, divergent) = a.diff_digests(&in_flight, &mut seen_a).unwrap();
                divergent_a.extend(divergent);
                in_flight = reply;
            }
            to_b = !to_b;
        }

        let changed_key = keys_a[5].0;
        let missing_key = keys_a[100].0;
        assert!(divergent_a.iter().any(|iv| iv.contains(changed_key)));
        assert!(divergent_b.iter().any(|iv| iv.contains(changed_key)));
        assert!(divergent_a.iter().any(|iv| iv.contains(missing_key)));
        assert!(divergent_b.iter().any(|iv| iv.contains(missing_key)));

        // Untouched regions are not reported on either side.
        let clean_key = keys_a[150].0;
        assert!(!divergent_a.iter().any(|iv| iv.contains(clean_key)));
        assert!(!divergent_b.iter().any(|iv| iv.contains(clean_key)));
    }

    #[test]
    fn test_identical_trees_exchange_one_message() {
        let keys: Vec<(u128, u64)> = (0..50u128).map(|i| (i * 7, 1)).collect();
        let a = tree_of(Interval::arc(0, 1000), MerkleConfig::default(), &keys);
        let b = tree_of(Interval::arc(0, 1000), MerkleConfig::default(), &keys);

        let mut seen = HashSet::new();
        let (reply, divergent) = b
            .diff_digests(&[a.root_digest().unwrap()], &mut seen)
            .unwrap();
        assert!(reply.is_empty());
        assert!(divergent.is_empty());
    }
}
