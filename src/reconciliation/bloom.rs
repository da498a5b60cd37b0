/// Bloom filter for probabilistic set membership.
///
/// Bloom filters provide space-efficient probabilistic membership testing:
/// "definitely not in set" (no false negatives) or "probably in set" (some
/// false positives). That asymmetry is exactly what a sync protocol wants:
/// a definite absence means the item must be reconciled, and a false
/// positive only means an already-divergent item is missed until the next
/// round.
///
/// The filter is parameterised by the expected item count and the desired
/// false-positive rate; bit-array size and hash count follow the standard
/// formulas. The hash family is derived from two base hashes by double
/// hashing, so the whole family is reproducible from the filter's seed and
/// travels on the wire as `(filter_bytes, m, k, seed)`.
use crate::error::{RepairError, RepairResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bloom filter over opaque byte items.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    /// Bit array, packed.
    bits: Vec<u8>,
    /// Number of bits.
    m: u64,
    /// Number of hash functions.
    k: u32,
    /// Number of items inserted.
    n: u64,
    /// Seed mixed into the base hashes.
    seed: u64,
}

/// Wire form of a Bloom filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomParts {
    /// Packed bit array.
    pub filter_bytes: Vec<u8>,
    /// Number of bits.
    pub m: u64,
    /// Number of hash functions.
    pub k: u32,
    /// Hash-family seed.
    pub seed: u64,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at `false_positive_rate`.
    ///
    /// `m = -n * ln(p) / (ln 2)^2`, `k = round((m / n) * ln 2)`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        Self::with_seed(expected_items, false_positive_rate, 0)
    }

    /// Like [`BloomFilter::new`] with an explicit hash-family seed.
    pub fn with_seed(expected_items: usize, false_positive_rate: f64, seed: u64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = ((-n * false_positive_rate.ln()) / (2.0_f64.ln().powi(2))).ceil() as u64;
        let m = m.max(1);
        let k = ((m as f64 / n) * 2.0_f64.ln()).round() as u32;

        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            m,
            k: k.max(1),
            n: 0,
            seed,
        }
    }

    /// Create a filter with explicit dimensions.
    pub fn with_dimensions(m: u64, k: u32, seed: u64) -> Self {
        let m = m.max(1);
        Self {
            bits: vec![0u8; ((m + 7) / 8) as usize],
            m,
            k: k.max(1),
            n: 0,
            seed,
        }
    }

    /// Insert an item.
    pub fn add(&mut self, item: &[u8]) {
        let (h1, h2) = self.base_hashes(item);
        for i in 0..self.k {
            let idx = self.index(h1, h2, i);
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
        self.n += 1;
    }

    /// Whether the item might be in the set. `false` is definite.
    pub fn contains(&self, item: &[u8]) -> bool {
        let (h1, h2) = self.base_hashes(item);
        for i in 0..self.k {
            let idx = self.index(h1, h2, i);
            if self.bits[idx / 8] & (1 << (idx % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Merge another filter into this one. Both filters must share
    /// dimensions and seed.
    pub fn union(&mut self, other: &BloomFilter) -> RepairResult<()> {
        if self.m != other.m || self.k != other.k || self.seed != other.seed {
            return Err(RepairError::BloomParamMismatch {
                local_m: self.m,
                local_k: self.k,
                remote_m: other.m,
                remote_k: other.k,
            });
        }
        for (byte, other_byte) in self.bits.iter_mut().zip(&other.bits) {
            *byte |= other_byte;
        }
        self.n += other.n;
        Ok(())
    }

    /// Number of items inserted.
    pub fn len(&self) -> u64 {
        self.n
    }

    /// Whether no items were inserted. An empty filter has a
    /// false-positive rate of zero.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Number of bits.
    pub fn bit_len(&self) -> u64 {
        self.m
    }

    /// Number of hash functions.
    pub fn hash_count(&self) -> u32 {
        self.k
    }

    /// Size of the packed bit array.
    pub fn size_in_bytes(&self) -> usize {
        self.bits.len()
    }

    /// Estimated false-positive rate at the current fill:
    /// `(1 - e^(-kn/m))^k`.
    pub fn estimated_fpr(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let exponent = -(self.k as f64) * self.n as f64 / self.m as f64;
        (1.0 - exponent.exp()).powi(self.k as i32)
    }

    /// Split into the wire form.
    pub fn to_parts(&self) -> BloomParts {
        BloomParts {
            filter_bytes: self.bits.clone(),
            m: self.m,
            k: self.k,
            seed: self.seed,
        }
    }

    /// Rebuild from the wire form, validating the byte length.
    pub fn from_parts(parts: &BloomParts) -> RepairResult<Self> {
        let expected_len = ((parts.m + 7) / 8) as usize;
        if parts.m == 0 || parts.k == 0 || parts.filter_bytes.len() != expected_len {
            return Err(RepairError::MalformedSummary(format!(
                "bloom parts: m={}, k={}, {} bytes",
                parts.m,
                parts.k,
                parts.filter_bytes.len()
            )));
        }
        Ok(Self {
            bits: parts.filter_bytes.clone(),
            m: parts.m,
            k: parts.k,
            // The wire does not carry n; any received filter is treated as
            // populated for FPR estimation purposes.
            n: 1,
            seed: parts.seed,
        })
    }

    /// Two base hashes from one digest; all k probes are derived from
    /// them by double hashing: `g_i = h1 + i * h2 mod m`.
    fn base_hashes(&self, item: &[u8]) -> (u64, u64) {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_be_bytes());
        hasher.update(item);
        let digest = hasher.finalize();

        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[0..8]);
        let h1 = u64::from_be_bytes(buf);
        buf.copy_from_slice(&digest[8..16]);
        // Odd step so the probe sequence cycles through the bit array.
        let h2 = u64::from_be_bytes(buf) | 1;
        (h1, h2)
    }

    fn index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.m) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(i: u64) -> [u8; 8] {
        i.to_be_bytes()
    }

    #[test]
    fn test_empty_filter() {
        let filter = BloomFilter::new(100, 0.01);
        assert!(filter.is_empty());
        assert_eq!(filter.len(), 0);
        assert!(!filter.contains(&item(1)));
        assert_eq!(filter.estimated_fpr(), 0.0);
    }

    #[test]
    fn test_insert_and_query() {
        let mut filter = BloomFilter::new(100, 0.01);
        filter.add(&item(1));
        filter.add(&item(2));

        assert!(filter.contains(&item(1)));
        assert!(filter.contains(&item(2)));
        assert!(!filter.contains(&item(3)));
    }

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            filter.add(&item(i));
        }
        for i in 0..500 {
            assert!(filter.contains(&item(i)), "false negative for {}", i);
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let mut filter = BloomFilter::new(10_000, 0.01);
        for i in 0..1000 {
            filter.add(&item(i));
        }

        let false_positives = (1000..2000).filter(|&i| filter.contains(&item(i))).count();
        let rate = false_positives as f64 / 1000.0;
        assert!(rate < 0.05, "false positive rate too high: {}", rate);
    }

    #[test]
    fn test_dimension_formulas() {
        // 1000 items at 1% needs ~9586 bits and ~7 hashes.
        let filter = BloomFilter::new(1000, 0.01);
        assert!(filter.bit_len() > 9000 && filter.bit_len() < 10_000);
        assert_eq!(filter.hash_count(), 7);
    }

    #[test]
    fn test_union() {
        let mut a = BloomFilter::with_seed(100, 0.01, 7);
        let mut b = BloomFilter::with_seed(100, 0.01, 7);
        a.add(&item(1));
        b.add(&item(2));

        a.union(&b).unwrap();
        assert!(a.contains(&item(1)));
        assert!(a.contains(&item(2)));
    }

    #[test]
    fn test_union_rejects_mismatched_params() {
        let mut a = BloomFilter::new(100, 0.01);
        let b = BloomFilter::new(1000, 0.01);
        assert!(matches!(
            a.union(&b),
            Err(RepairError::BloomParamMismatch { .. })
        ));
    }

    #[test]
    fn test_wire_round_trip() {
        let mut filter = BloomFilter::with_seed(200, 0.05, 42);
        for i in 0..50 {
            filter.add(&item(i));
        }
        let parts = filter.to_parts();
        let restored = BloomFilter::from_parts(&parts).unwrap();
        for i in 0..50 {
            assert!(restored.contains(&item(i)));
        }
        assert_eq!(restored.bit_len(), filter.bit_len());
        assert_eq!(restored.hash_count(), filter.hash_count());
    }

    #[test]
    fn test_from_parts_rejects_bad_length() {
        let parts = BloomParts {
            filter_bytes: vec![0u8; 3],
            m: 100,
            k: 3,
            seed: 0,
        };
        assert!(BloomFilter::from_parts(&parts).is_err());
    }

    #[test]
    fn test_seed_changes_family() {
        let mut a = BloomFilter::with_seed(100, 0.01, 1);
        let mut b = BloomFilter::with_seed(100, 0.01, 2);
        a.add(&item(9));
        b.add(&item(9));
        // Different seeds place the same item at different bits.
        assert_ne!(a.to_parts().filter_bytes, b.to_parts().filter_bytes);
    }
}
