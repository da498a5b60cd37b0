/// Monitoring counters for the repair engine.
///
/// Counters are plain atomics behind an increment interface so sessions can
/// report from any task without coordination. `snapshot` gives a consistent
/// enough view for logs and tests.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide repair counters.
#[derive(Debug, Default)]
pub struct RepairStats {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_aborted: AtomicU64,
    sessions_failed: AtomicU64,
    entries_updated: AtomicU64,
    entries_regenerated: AtomicU64,
    conflicts: AtomicU64,
    resolve_requests: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_aborted: u64,
    pub sessions_failed: u64,
    pub entries_updated: u64,
    pub entries_regenerated: u64,
    pub conflicts: u64,
    pub resolve_requests: u64,
}

impl RepairStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_aborted(&self) {
        self.sessions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_updated(&self) {
        self.entries_updated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn entry_regenerated(&self) {
        self.entries_regenerated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn resolve_request(&self) {
        self.resolve_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            sessions_aborted: self.sessions_aborted.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            entries_updated: self.entries_updated.load(Ordering::Relaxed),
            entries_regenerated: self.entries_regenerated.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            resolve_requests: self.resolve_requests.load(Ordering::Relaxed),
        }
    }
}

/// Sync degree of a replica set: `(total - missing - outdated) / total`,
/// a scalar in [0, 1]. An empty replica set is fully synchronised.
pub fn sync_degree(total: u64, missing: u64, outdated: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    let divergent = (missing + outdated).min(total);
    (total - divergent) as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = RepairStats::new();
        stats.session_started();
        stats.session_started();
        stats.session_completed();
        stats.entry_updated();
        stats.entry_regenerated();
        stats.conflict();

        let snap = stats.snapshot();
        assert_eq!(snap.sessions_started, 2);
        assert_eq!(snap.sessions_completed, 1);
        assert_eq!(snap.entries_updated, 1);
        assert_eq!(snap.entries_regenerated, 1);
        assert_eq!(snap.conflicts, 1);
    }

    #[test]
    fn test_sync_degree_bounds() {
        assert_eq!(sync_degree(0, 0, 0), 1.0);
        assert_eq!(sync_degree(100, 0, 0), 1.0);
        assert_eq!(sync_degree(100, 50, 50), 0.0);
        assert_eq!(sync_degree(100, 10, 15), 0.75);
        // Saturates rather than going negative.
        assert_eq!(sync_degree(10, 20, 20), 0.0);
    }
}
