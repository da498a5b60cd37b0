//! # ringmend: anti-entropy replica repair for a 128-bit ring
//!
//! ringmend is the replica repair engine of a Chord-like ring key–value
//! store with four-fold replication. Every logical key lives at four ring
//! positions, one per quadrant; concurrent writes, lost messages and node
//! churn make those replicas drift. This crate detects and reconciles the
//! drift with bandwidth-compact summaries instead of full key exchanges:
//!
//! - **Bloom filters**: one round trip, probabilistic, heals both
//!   directions;
//! - **Merkle trees**: interval-partitioned signature descent, exact
//!   modulo hash collisions;
//! - **Approximate reconciliation trees**: a Bloom filter per Merkle
//!   level, the tightest summaries at the price of approximation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringmend::{NodeConfig, RepairNode};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ringmend::init_logging();
//!
//!     let node = RepairNode::new(NodeConfig::new())?;
//!     node.start().await?;
//!
//!     node.put(0xdead_beef, json!({"name": "alice"}), 1);
//!
//!     // Reconcile our replica of the key against quadrant 2.
//!     node.repair_key(0xdead_beef, 2).await?;
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The engine is layered, leaves first:
//!
//! 1. **Key space** ([`keyspace`]): 128-bit ring arithmetic, intervals,
//!    replica-key derivation.
//! 2. **Summaries** ([`reconciliation`]): Bloom filter, Merkle tree, ART.
//! 3. **Sessions** ([`session`]): a pure state machine per bilateral
//!    exchange.
//! 4. **Orchestrator** ([`orchestrator`]): triggers, session arena,
//!    resolution application, statistics.
//! 5. **Node** ([`node`]): the actor shell wiring everything to TCP and
//!    timers.
//!
//! The replica store ([`store`]) and the peer sampler ([`sampler`]) are
//! collaborators: the engine mutates data only through the store's
//! interface and needs only `random_peer()` from gossip.
//!
//! Repair runs concurrently with writes and converges eventually; it
//! never provides strong consistency, never overwrites equal-version
//! conflicts, and treats the replication factor (four) as fixed.

pub mod config;
pub mod error;
pub mod keyspace;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod reconciliation;
pub mod routing;
pub mod sampler;
pub mod session;
pub mod stats;
pub mod store;

// Public API exports
pub use config::{RepairConfig, RepairType};
pub use error::{RepairError, RepairResult};
pub use keyspace::{
    home_key, quadrant_interval, quadrant_of, replica_key, Bound, Interval, RingKey,
    QUADRANT_SPAN, REPLICATION_FACTOR,
};
pub use network::{Message, NodeId, PeerInfo};
pub use node::{NodeConfig, NodeStatus, RepairNode};
pub use orchestrator::{Outbound, RepairOrchestrator};
pub use reconciliation::{
    Art, ArtConfig, BloomFilter, MerkleConfig, MerkleTree, ReconMethod,
};
pub use routing::RoutingTable;
pub use sampler::{CyclonSampler, PeerSampler};
pub use session::{AbortReason, Session, SessionState, SessionStats};
pub use stats::{sync_degree, RepairStats, StatsSnapshot};
pub use store::{DbEntry, ReplicaStore, Resolution};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{RepairConfig, RepairType};
    pub use crate::error::{RepairError, RepairResult};
    pub use crate::keyspace::{replica_key, Interval, RingKey};
    pub use crate::node::{NodeConfig, RepairNode};
    pub use crate::reconciliation::ReconMethod;
    pub use crate::stats::sync_degree;
    pub use crate::store::{DbEntry, ReplicaStore};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled via the
/// `RINGMEND_LOG` environment variable (`error`, `warn`, `info`, `debug`,
/// `trace`); the default is `info`.
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("RINGMEND_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::registry()
        .with(EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
