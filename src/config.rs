/// Configuration for the repair engine.
///
/// A `RepairConfig` is a plain value. Every session receives a snapshot of
/// it at creation and never re-reads configuration mid-round, so a config
/// change only affects sessions opened afterwards.
use crate::error::{RepairError, RepairResult};
use crate::reconciliation::ReconMethod;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What kinds of divergence a repair round aims to heal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairType {
    /// Replace stale replicas with newer-version remote entries.
    Update,
    /// Create missing replicas from authoritative remote entries.
    Regen,
    /// Both of the above.
    #[default]
    Mixed,
}

/// Tunables for the repair orchestrator and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairConfig {
    /// Master switch; a disabled engine ignores triggers entirely.
    pub enabled: bool,
    /// Period between trigger events.
    pub trigger_interval: Duration,
    /// Probability (0-100) that a given trigger actually starts a session.
    pub trigger_probability: u8,
    /// Reconciliation method for new sessions.
    pub recon_method: ReconMethod,
    /// Divergence kinds this node's rounds heal.
    pub repair_type: RepairType,
    /// Bloom filter false-positive rate, in (0, 1).
    pub bloom_fpr: f64,
    /// Upper bound on items summarised per round; larger rounds are split
    /// into parts.
    pub max_items: usize,
    /// False-positive rate of the inner-level ART filters.
    pub art_inner_fpr: f64,
    /// False-positive rate of the leaf-level ART filter.
    pub art_leaf_fpr: f64,
    /// Capacity multiplier compensating compounded ART error across levels.
    pub art_correction_factor: f64,
    /// Merkle tree branching factor (>= 2).
    pub merkle_branch_factor: usize,
    /// Merkle leaf bucket size (>= 1).
    pub merkle_bucket_size: usize,
    /// Session time-to-live; expired sessions are swept by the GC.
    pub session_ttl: Duration,
    /// Period of the session garbage-collection sweep.
    pub gc_interval: Duration,
    /// Cap on concurrently open sessions per node.
    pub max_open_sessions: usize,
    /// Transient-failure retries before a session aborts.
    pub retry_limit: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_interval: Duration::from_secs(60),
            trigger_probability: 33,
            recon_method: ReconMethod::Bloom,
            repair_type: RepairType::Mixed,
            bloom_fpr: 0.01,
            max_items: 100_000,
            art_inner_fpr: 0.01,
            art_leaf_fpr: 0.1,
            art_correction_factor: 2.0,
            merkle_branch_factor: 2,
            merkle_bucket_size: 64,
            session_ttl: Duration::from_secs(100),
            gc_interval: Duration::from_secs(60),
            max_open_sessions: 4,
            retry_limit: 3,
        }
    }
}

impl RepairConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reconciliation method.
    pub fn method(mut self, method: ReconMethod) -> Self {
        self.recon_method = method;
        self
    }

    /// Set the repair type.
    pub fn repair(mut self, repair_type: RepairType) -> Self {
        self.repair_type = repair_type;
        self
    }

    /// Set the Bloom false-positive rate.
    pub fn bloom_fpr(mut self, fpr: f64) -> Self {
        self.bloom_fpr = fpr;
        self
    }

    /// Set the per-round item cap.
    pub fn max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Set the trigger period.
    pub fn trigger_interval(mut self, interval: Duration) -> Self {
        self.trigger_interval = interval;
        self
    }

    /// Set the trigger probability (clamped to 100).
    pub fn trigger_probability(mut self, percent: u8) -> Self {
        self.trigger_probability = percent.min(100);
        self
    }

    /// Set the Merkle tree shape.
    pub fn merkle_shape(mut self, branch_factor: usize, bucket_size: usize) -> Self {
        self.merkle_branch_factor = branch_factor;
        self.merkle_bucket_size = bucket_size;
        self
    }

    /// Set the session TTL.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Check value ranges. Called once when a node starts; sessions trust
    /// their snapshot afterwards.
    pub fn validate(&self) -> RepairResult<()> {
        for (name, fpr) in [
            ("bloom_fpr", self.bloom_fpr),
            ("art_inner_fpr", self.art_inner_fpr),
            ("art_leaf_fpr", self.art_leaf_fpr),
        ] {
            if !(fpr > 0.0 && fpr < 1.0) {
                return Err(RepairError::Config(format!(
                    "{} must be in (0, 1), got {}",
                    name, fpr
                )));
            }
        }
        if self.art_correction_factor < 1.0 {
            return Err(RepairError::Config(format!(
                "art_correction_factor must be >= 1, got {}",
                self.art_correction_factor
            )));
        }
        if self.merkle_branch_factor < 2 {
            return Err(RepairError::Config(format!(
                "merkle_branch_factor must be >= 2, got {}",
                self.merkle_branch_factor
            )));
        }
        if self.merkle_bucket_size == 0 {
            return Err(RepairError::Config(
                "merkle_bucket_size must be >= 1".to_string(),
            ));
        }
        if self.trigger_probability > 100 {
            return Err(RepairError::Config(format!(
                "trigger_probability must be 0-100, got {}",
                self.trigger_probability
            )));
        }
        if self.max_items == 0 {
            return Err(RepairError::Config("max_items must be >= 1".to_string()));
        }
        if self.max_open_sessions == 0 {
            return Err(RepairError::Config(
                "max_open_sessions must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
