/// Key-space arithmetic for the 128-bit ring.
///
/// Keys are unsigned 128-bit integers and the ring is the key space modulo
/// 2^128. The ring is divided into four equal quadrants; the four replicas
/// of a key sit at the same offset within each quadrant. Intervals are
/// contiguous arcs of the ring and support the usual set algebra plus
/// equi-partitioning, which the Merkle tree uses to split leaves.
///
/// Internally every interval is normalised to one of three shapes: empty,
/// the full ring, or a half-open arc `[left, right)` that may wrap past
/// zero. The open/closed bound notation used on the wire and in the
/// literature is accepted by [`Interval::from_bounds`] and folded into the
/// normal form, which makes structural equality coincide with set equality.
use serde::{Deserialize, Serialize};
use std::fmt;

/// A position on the ring.
pub type RingKey = u128;

/// Number of replicas each key has on the ring.
pub const REPLICATION_FACTOR: u8 = 4;

/// Width of one quadrant: 2^126.
pub const QUADRANT_SPAN: u128 = 1u128 << 126;

/// Derive the replica key of `key` in quadrant offset `j` (mod 4).
///
/// For a key K the four replica keys are `K + j * 2^126 mod 2^128` for
/// `j` in `0..4`. The derivation round-trips:
/// `replica_key(replica_key(k, j), 4 - j) == k`.
pub fn replica_key(key: RingKey, j: u8) -> RingKey {
    key.wrapping_add(QUADRANT_SPAN.wrapping_mul((j % REPLICATION_FACTOR) as u128))
}

/// The quadrant (0..4) a key falls into.
pub fn quadrant_of(key: RingKey) -> u8 {
    (key >> 126) as u8
}

/// Project a key into quadrant 0, its logical identity.
///
/// Two physical keys are replicas of the same logical key exactly when
/// their home keys are equal.
pub fn home_key(key: RingKey) -> RingKey {
    key & (QUADRANT_SPAN - 1)
}

/// The arc of the ring covered by quadrant `j`.
pub fn quadrant_interval(j: u8) -> Interval {
    let j = (j % REPLICATION_FACTOR) as u128;
    Interval::arc(
        j.wrapping_mul(QUADRANT_SPAN),
        (j + 1).wrapping_mul(QUADRANT_SPAN),
    )
}

/// An interval bound, open or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bound {
    /// The endpoint is excluded: `(` or `)`.
    Open,
    /// The endpoint is included: `[` or `]`.
    Closed,
}

/// A contiguous arc of the ring.
///
/// The normal form is one of: [`Interval::Empty`], [`Interval::Full`], or
/// an arc `[left, right)` with `left != right`, wrapping past zero when
/// `left > right`. Construction from open/closed bounds normalises, so
/// `==` compares intervals as sets of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// No keys.
    Empty,
    /// The whole ring.
    Full,
    /// Half-open arc `[left, right)`, wrapping when `left > right`.
    Arc {
        /// Inclusive left endpoint.
        left: RingKey,
        /// Exclusive right endpoint.
        right: RingKey,
    },
}

/// Inclusive segment `[lo, hi]` used internally for interval algebra.
///
/// Inclusive endpoints keep the arithmetic inside u128: the full ring is
/// `[0, u128::MAX]` without needing to represent 2^128.
#[derive(Debug, Clone, Copy)]
struct Seg {
    lo: u128,
    hi: u128,
}

impl Interval {
    /// The empty interval.
    pub fn empty() -> Self {
        Interval::Empty
    }

    /// The full ring.
    pub fn all() -> Self {
        Interval::Full
    }

    /// Half-open arc `[left, right)`. `left == right` denotes the arc that
    /// goes all the way around, i.e. the full ring.
    pub fn arc(left: RingKey, right: RingKey) -> Self {
        if left == right {
            Interval::Full
        } else {
            Interval::Arc { left, right }
        }
    }

    /// The interval holding exactly one key.
    pub fn single(key: RingKey) -> Self {
        Interval::Arc {
            left: key,
            right: key.wrapping_add(1),
        }
    }

    /// Construct from explicit open/closed bounds, normalising to the
    /// half-open form. `('(' a, a ')')` is everything except `a`;
    /// `('[' a, a ']')` degenerates to the full ring by the wrapping
    /// reading.
    pub fn from_bounds(left_bound: Bound, left: RingKey, right: RingKey, right_bound: Bound) -> Self {
        let l = match left_bound {
            Bound::Closed => left,
            Bound::Open => left.wrapping_add(1),
        };
        let r = match right_bound {
            Bound::Open => right,
            Bound::Closed => right.wrapping_add(1),
        };
        Interval::arc(l, r)
    }

    /// Whether the interval contains no keys.
    pub fn is_empty(&self) -> bool {
        matches!(self, Interval::Empty)
    }

    /// Whether the interval is the whole ring.
    pub fn is_all(&self) -> bool {
        matches!(self, Interval::Full)
    }

    /// Membership test.
    pub fn contains(&self, key: RingKey) -> bool {
        match *self {
            Interval::Empty => false,
            Interval::Full => true,
            Interval::Arc { left, right } => {
                if left < right {
                    left <= key && key < right
                } else {
                    key >= left || key < right
                }
            }
        }
    }

    /// Number of keys in the interval, `None` for the full ring (2^128
    /// does not fit in a u128).
    pub fn len(&self) -> Option<u128> {
        match *self {
            Interval::Empty => Some(0),
            Interval::Full => None,
            Interval::Arc { left, right } => Some(right.wrapping_sub(left)),
        }
    }

    /// The complement arc.
    pub fn complement(&self) -> Interval {
        match *self {
            Interval::Empty => Interval::Full,
            Interval::Full => Interval::Empty,
            Interval::Arc { left, right } => Interval::Arc {
                left: right,
                right: left,
            },
        }
    }

    /// Rotate the interval by `delta` positions around the ring.
    pub fn shift(&self, delta: RingKey) -> Interval {
        match *self {
            Interval::Arc { left, right } => Interval::Arc {
                left: left.wrapping_add(delta),
                right: right.wrapping_add(delta),
            },
            other => other,
        }
    }

    /// Intersection, as a set of disjoint arcs (at most two).
    pub fn intersect(&self, other: &Interval) -> Vec<Interval> {
        let mut out = Vec::new();
        for a in self.segments() {
            for b in other.segments() {
                let lo = a.lo.max(b.lo);
                let hi = a.hi.min(b.hi);
                if lo <= hi {
                    out.push(Seg { lo, hi });
                }
            }
        }
        normalise(out)
    }

    /// Union, as a set of disjoint arcs.
    pub fn union(&self, other: &Interval) -> Vec<Interval> {
        let mut segs = self.segments();
        segs.extend(other.segments());
        normalise(segs)
    }

    /// Set difference `self \ other`, as a set of disjoint arcs.
    pub fn difference(&self, other: &Interval) -> Vec<Interval> {
        self.intersect(&other.complement())
    }

    /// Whether the two intervals share any key.
    pub fn overlaps(&self, other: &Interval) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Equi-partition into `n` arcs, in ring order starting at the left
    /// endpoint. Some trailing arcs are empty when the interval holds
    /// fewer than `n` keys. Partitioning the empty interval yields `n`
    /// empty arcs.
    pub fn partition(&self, n: usize) -> Vec<Interval> {
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![*self];
        }
        let n_u = n as u128;
        match *self {
            Interval::Empty => vec![Interval::Empty; n],
            Interval::Full => {
                // Total length is 2^128 = u128::MAX + 1; derive the exact
                // quotient and remainder without representing it.
                let max = u128::MAX;
                let (q, r) = if max % n_u == n_u - 1 {
                    (max / n_u + 1, 0)
                } else {
                    (max / n_u, max % n_u + 1)
                };
                let bound = |i: u128| i * q + (i * r) / n_u;
                (0..n_u)
                    .map(|i| {
                        let left = bound(i);
                        let right = if i + 1 == n_u { 0 } else { bound(i + 1) };
                        Interval::Arc { left, right }
                    })
                    .collect()
            }
            Interval::Arc { left, right } => {
                let len = right.wrapping_sub(left);
                let (q, r) = (len / n_u, len % n_u);
                let offset = |i: u128| i * q + (i * r) / n_u;
                (0..n_u)
                    .map(|i| {
                        let lo = offset(i);
                        let hi = if i + 1 == n_u { len } else { offset(i + 1) };
                        if lo == hi {
                            Interval::Empty
                        } else {
                            Interval::Arc {
                                left: left.wrapping_add(lo),
                                right: left.wrapping_add(hi),
                            }
                        }
                    })
                    .collect()
            }
        }
    }

    /// Decompose into non-wrapping inclusive segments.
    fn segments(&self) -> Vec<Seg> {
        match *self {
            Interval::Empty => Vec::new(),
            Interval::Full => vec![Seg {
                lo: 0,
                hi: u128::MAX,
            }],
            Interval::Arc { left, right } => {
                if left < right {
                    vec![Seg {
                        lo: left,
                        hi: right - 1,
                    }]
                } else {
                    // Wrapping arc: split at zero.
                    let mut segs = vec![Seg {
                        lo: left,
                        hi: u128::MAX,
                    }];
                    if right > 0 {
                        segs.push(Seg {
                            lo: 0,
                            hi: right - 1,
                        });
                    }
                    segs
                }
            }
        }
    }
}

/// Merge segments into disjoint, maximal arcs, rejoining across zero.
fn normalise(mut segs: Vec<Seg>) -> Vec<Interval> {
    if segs.is_empty() {
        return Vec::new();
    }
    segs.sort_by_key(|s| s.lo);
    let mut merged: Vec<Seg> = Vec::with_capacity(segs.len());
    for seg in segs {
        match merged.last_mut() {
            Some(last) if seg.lo <= last.hi.saturating_add(1) => {
                last.hi = last.hi.max(seg.hi);
            }
            _ => merged.push(seg),
        }
    }
    // A pair touching zero from both sides is one wrapping arc.
    if merged.len() > 1 {
        let first = merged[0];
        let last_hi = merged[merged.len() - 1].hi;
        if first.lo == 0 && last_hi == u128::MAX {
            merged.remove(0);
            if let Some(last) = merged.last_mut() {
                last.hi = first.hi;
            }
        }
    }
    merged.into_iter().map(to_interval).collect()
}

fn to_interval(seg: Seg) -> Interval {
    if seg.lo == 0 && seg.hi == u128::MAX {
        Interval::Full
    } else {
        Interval::Arc {
            left: seg.lo,
            right: seg.hi.wrapping_add(1),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Interval::Empty => write!(f, "[)"),
            Interval::Full => write!(f, "[0, 2^128)"),
            Interval::Arc { left, right } => write!(f, "[{:#x}, {:#x})", left, right),
        }
    }
}
