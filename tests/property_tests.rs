/// Property tests for the repair engine's algebraic invariants.
use proptest::prelude::*;
use ringmend::network::{decode_blob, encode_blob};
use ringmend::reconciliation::{compare, BloomFilter, MerkleConfig, MerkleTree};
use ringmend::{
    home_key, replica_key, sync_degree, Interval, QUADRANT_SPAN, REPLICATION_FACTOR,
};
use std::collections::HashSet;

proptest! {
    /// `replica(replica(K, q), -q) = K` for every key and quadrant.
    #[test]
    fn replica_key_round_trips(key: u128, q in 0u8..4) {
        let there = replica_key(key, q);
        let back = replica_key(there, REPLICATION_FACTOR - q);
        prop_assert_eq!(back, key);
    }

    /// All four replicas of a key share its logical identity and land in
    /// four distinct quadrants.
    #[test]
    fn replica_group_is_one_per_quadrant(key in 0u128..QUADRANT_SPAN) {
        let mut quadrants = HashSet::new();
        for q in 0..REPLICATION_FACTOR {
            let replica = replica_key(key, q);
            prop_assert_eq!(home_key(replica), key);
            quadrants.insert(replica >> 126);
        }
        prop_assert_eq!(quadrants.len(), 4);
    }

    /// Equi-partitioning preserves length and covers every key exactly
    /// once.
    #[test]
    fn partition_is_exact(left: u128, len in 1u128..=u128::MAX, n in 1usize..8, probe: u128) {
        let interval = Interval::arc(left, left.wrapping_add(len));
        let parts = interval.partition(n);
        prop_assert_eq!(parts.len(), n);

        let total: u128 = parts.iter().map(|p| p.len().unwrap_or(0)).sum();
        prop_assert_eq!(total, len);

        let covering = parts.iter().filter(|p| p.contains(probe)).count();
        prop_assert_eq!(covering, usize::from(interval.contains(probe)));
    }

    /// Intersection agrees with membership.
    #[test]
    fn intersection_matches_membership(
        a_left: u128, a_len in 1u128..=u128::MAX,
        b_left: u128, b_len in 1u128..=u128::MAX,
        probe: u128,
    ) {
        let a = Interval::arc(a_left, a_left.wrapping_add(a_len));
        let b = Interval::arc(b_left, b_left.wrapping_add(b_len));
        let in_both = a.contains(probe) && b.contains(probe);
        let in_intersection = a.intersect(&b).iter().any(|p| p.contains(probe));
        prop_assert_eq!(in_both, in_intersection);
    }

    /// Difference removes exactly the other interval.
    #[test]
    fn difference_matches_membership(
        a_left: u128, a_len in 1u128..=u128::MAX,
        b_left: u128, b_len in 1u128..=u128::MAX,
        probe: u128,
    ) {
        let a = Interval::arc(a_left, a_left.wrapping_add(a_len));
        let b = Interval::arc(b_left, b_left.wrapping_add(b_len));
        let expected = a.contains(probe) && !b.contains(probe);
        let got = a.difference(&b).iter().any(|p| p.contains(probe));
        prop_assert_eq!(expected, got);
    }

    /// A Bloom filter never produces a false negative.
    #[test]
    fn bloom_has_no_false_negatives(items in prop::collection::vec(any::<u64>(), 1..200)) {
        let mut filter = BloomFilter::new(items.len(), 0.01);
        for item in &items {
            filter.add(&item.to_be_bytes());
        }
        for item in &items {
            prop_assert!(filter.contains(&item.to_be_bytes()));
        }
    }

    /// The root hash is a function of the item multiset, not of insertion
    /// order.
    #[test]
    fn merkle_root_is_order_independent(
        mut keys in prop::collection::hash_set(0u128..1_000_000, 1..150),
        bucket_size in 1usize..16,
    ) {
        let config = MerkleConfig { branch_factor: 2, bucket_size };
        let interval = Interval::arc(0, 1_000_000);
        let forward: Vec<(u128, u64)> = keys.iter().map(|&k| (k, 1)).collect();
        let mut reverse = forward.clone();
        reverse.reverse();

        let a = MerkleTree::from_items(interval, config, forward).unwrap();
        let b = MerkleTree::from_items(interval, config, reverse).unwrap();
        prop_assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());

        // And any single change is visible in the root.
        let &some_key = keys.iter().next().unwrap();
        keys.remove(&some_key);
        let smaller: Vec<(u128, u64)> = keys.iter().map(|&k| (k, 1)).collect();
        let c = MerkleTree::from_items(interval, config, smaller).unwrap();
        prop_assert_ne!(a.root_hash().unwrap(), c.root_hash().unwrap());
    }

    /// Comparison is symmetric and empty for equal trees.
    #[test]
    fn merkle_compare_is_symmetric(
        keys_a in prop::collection::hash_set(0u128..100_000, 1..100),
        keys_b in prop::collection::hash_set(0u128..100_000, 1..100),
    ) {
        let config = MerkleConfig { branch_factor: 4, bucket_size: 4 };
        let interval = Interval::arc(0, 100_000);
        let a = MerkleTree::from_items(interval, config, keys_a.iter().map(|&k| (k, 1))).unwrap();
        let b = MerkleTree::from_items(interval, config, keys_b.iter().map(|&k| (k, 1))).unwrap();

        let ab: HashSet<Interval> = compare(&a, &b).unwrap().into_iter().collect();
        let ba: HashSet<Interval> = compare(&b, &a).unwrap().into_iter().collect();
        prop_assert_eq!(&ab, &ba);

        if keys_a == keys_b {
            prop_assert!(ab.is_empty());
        } else {
            // Every differing key is covered by some reported interval.
            for key in keys_a.symmetric_difference(&keys_b) {
                prop_assert!(ab.iter().any(|iv| iv.contains(*key)));
            }
        }
    }

    /// The resolve blob codec round-trips.
    #[test]
    fn blob_codec_round_trips(value: u64, version: u64) {
        let bytes = encode_blob(&value, version).unwrap();
        let (decoded, decoded_version): (u64, u64) = decode_blob(&bytes).unwrap();
        prop_assert_eq!(decoded, value);
        prop_assert_eq!(decoded_version, version);
    }

    /// Sync degree stays within [0, 1].
    #[test]
    fn sync_degree_is_bounded(total in 0u64..10_000, missing in 0u64..10_000, outdated in 0u64..10_000) {
        let degree = sync_degree(total, missing, outdated);
        prop_assert!((0.0..=1.0).contains(&degree));
    }
}
