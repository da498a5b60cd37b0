/// Set reconciliation primitives.
///
/// Three summary kinds trade bandwidth against precision:
///
/// - **Bloom**: one filter over the item fingerprints; O(1) round trips,
///   probabilistic, heals both directions via a filter echo.
/// - **Merkle tree**: level-by-level signature descent; exact modulo hash
///   collisions, O(depth) round trips.
/// - **ART**: Bloom filter per Merkle level; one round trip, approximate,
///   one-directional.
///
/// A session picks its method at creation and carries the corresponding
/// summary type; divergences found by any method become key-update or
/// key-regeneration resolutions applied through the replica store.
pub mod art;
pub mod bloom;
pub mod merkle;

pub use art::{Art, ArtConfig, ArtParts};
pub use bloom::{BloomFilter, BloomParts};
pub use merkle::{compare, LeafItem, MerkleConfig, MerkleDigest, MerkleTree, NodeHash};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The reconciliation method of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconMethod {
    /// Bloom filter exchange.
    #[default]
    Bloom,
    /// Merkle signature descent.
    MerkleTree,
    /// Approximate reconciliation tree.
    Art,
}

impl fmt::Display for ReconMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconMethod::Bloom => write!(f, "bloom"),
            ReconMethod::MerkleTree => write!(f, "merkle_tree"),
            ReconMethod::Art => write!(f, "art"),
        }
    }
}

impl FromStr for ReconMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bloom" => Ok(ReconMethod::Bloom),
            "merkle_tree" | "merkle" => Ok(ReconMethod::MerkleTree),
            "art" => Ok(ReconMethod::Art),
            other => Err(format!(
                "unknown reconciliation method '{}' (expected bloom, merkle_tree, or art)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_round_trip() {
        for method in [ReconMethod::Bloom, ReconMethod::MerkleTree, ReconMethod::Art] {
            let parsed: ReconMethod = method.to_string().parse().unwrap();
            assert_eq!(parsed, method);
        }
        assert!("gossip".parse::<ReconMethod>().is_err());
    }
}
