/// Error types for ringmend operations.
///
/// This module provides the error hierarchy for the repair engine. The
/// variants follow the failure taxonomy of the protocol: structural errors
/// (malformed summaries, parameter mismatches) abort a session without
/// retry, transient errors are retried within the session, and semantic
/// conflicts are reported but never resolved by overwriting.
use crate::keyspace::{Interval, RingKey};
use thiserror::Error;

/// The main error type for repair-engine operations.
///
/// All fallible operations in ringmend return `Result<T, RepairError>`.
#[derive(Error, Debug)]
pub enum RepairError {
    /// A key was inserted into a tree whose root interval does not cover it.
    #[error("key {key:#034x} is outside interval {interval}")]
    KeyOutsideInterval {
        /// The offending key.
        key: RingKey,
        /// The interval that was expected to contain it.
        interval: Interval,
    },

    /// A Merkle tree was constructed over an empty interval.
    #[error("cannot build a tree over an empty interval")]
    EmptyTreeInterval,

    /// Insertion was attempted after `finalise`.
    #[error("tree is finalised; no further insertions allowed")]
    TreeFinalised,

    /// An operation required a finalised tree but the tree was still open.
    #[error("tree is not finalised")]
    TreeNotFinalised,

    /// Two summaries disagreed on the interval under reconciliation.
    #[error("interval disagreement: local {local}, remote {remote}")]
    IntervalMismatch {
        /// Our side of the disagreement.
        local: Interval,
        /// The peer's side.
        remote: Interval,
    },

    /// Bloom filters with different dimensions cannot be combined.
    #[error("bloom parameter mismatch: local (m={local_m}, k={local_k}), remote (m={remote_m}, k={remote_k})")]
    BloomParamMismatch {
        local_m: u64,
        local_k: u32,
        remote_m: u64,
        remote_k: u32,
    },

    /// A summary failed structural validation.
    #[error("malformed summary: {0}")]
    MalformedSummary(String),

    /// A mutation hit an entry holding a lock.
    #[error("entry {key:#034x} is locked")]
    EntryLocked {
        /// The locked key.
        key: RingKey,
    },

    /// Equal versions with different values: a genuine conflict.
    #[error("version conflict on key {key:#034x} at version {version}")]
    VersionConflict {
        /// The conflicting key.
        key: RingKey,
        /// The version both replicas claim.
        version: u64,
    },

    /// A message referenced a session this node does not know.
    #[error("unknown session {0}")]
    UnknownSession(u64),

    /// The per-node cap on concurrently open sessions was reached.
    #[error("session limit reached ({0} open)")]
    SessionLimit(usize),

    /// A new session's interval overlaps an already-open session.
    #[error("interval {0} overlaps an open session")]
    OverlappingSession(Interval),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Wire (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blob codec error for resolve payloads.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Network transport error.
    #[error("network error: {0}")]
    Network(String),
}

/// Result type alias for repair-engine operations.
pub type RepairResult<T> = Result<T, RepairError>;
