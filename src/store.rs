/// Replica database for one node.
///
/// The store keeps this node's replicas of logical keys, one entry per ring
/// position the node is responsible for. It is shared process-wide and
/// mutated only through this interface; repair sessions never touch entries
/// directly. Backed by DashMap for lock-free concurrent access.
///
/// Two capabilities matter to the repair engine:
///
/// - **Change recording**: an armed interval accumulates the keys written
///   or deleted since arming, so incremental summaries can be built from
///   `get_changes` instead of a full scan.
/// - **Resolution application**: `apply_resolution` folds a remote entry
///   into the local store idempotently with respect to `(key, version)`:
///   the higher version wins, equal versions with equal values are a
///   no-op, and equal versions with different values are reported as a
///   conflict and never overwritten.
use crate::config::RepairType;
use crate::error::{RepairError, RepairResult};
use crate::keyspace::{home_key, Interval, RingKey};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;

/// A single replica entry.
///
/// Locks are process-local bookkeeping for the transaction layer and never
/// travel on the wire; a deserialized entry is always unlocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbEntry {
    /// Ring position of this replica.
    pub key: RingKey,
    /// Stored value; `None` for an empty entry.
    pub value: Option<JsonValue>,
    /// Monotonically increasing version.
    pub version: u64,
    /// Exclusive write lock.
    #[serde(skip)]
    write_lock: bool,
    /// Stacking read locks.
    #[serde(skip)]
    read_lock: u32,
}

impl DbEntry {
    /// Create an entry holding a value.
    pub fn new(key: RingKey, value: JsonValue, version: u64) -> Self {
        Self {
            key,
            value: Some(value),
            version,
            write_lock: false,
            read_lock: 0,
        }
    }

    /// Create an empty entry (no value). Empty entries exist to hold locks
    /// transiently.
    pub fn empty(key: RingKey) -> Self {
        Self {
            key,
            value: None,
            version: 0,
            write_lock: false,
            read_lock: 0,
        }
    }

    /// Whether the entry carries no value.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Whether any lock is held.
    pub fn is_locked(&self) -> bool {
        self.write_lock || self.read_lock > 0
    }

    /// Whether the write lock is held.
    pub fn is_write_locked(&self) -> bool {
        self.write_lock
    }

    /// Number of stacked read locks.
    pub fn read_locks(&self) -> u32 {
        self.read_lock
    }

    /// Take the exclusive write lock. Fails while read locks are held.
    pub fn set_write_lock(&mut self) -> RepairResult<()> {
        if self.read_lock > 0 {
            return Err(RepairError::EntryLocked { key: self.key });
        }
        self.write_lock = true;
        Ok(())
    }

    /// Release the write lock.
    pub fn clear_write_lock(&mut self) {
        self.write_lock = false;
    }

    /// Stack a read lock. Fails while the write lock is held.
    pub fn add_read_lock(&mut self) -> RepairResult<()> {
        if self.write_lock {
            return Err(RepairError::EntryLocked { key: self.key });
        }
        self.read_lock += 1;
        Ok(())
    }

    /// Release one read lock.
    pub fn release_read_lock(&mut self) {
        self.read_lock = self.read_lock.saturating_sub(1);
    }

    /// The same entry re-addressed to another ring position, unlocked.
    /// Used when folding a remote replica into the local quadrant.
    pub fn rekey(&self, key: RingKey) -> DbEntry {
        DbEntry {
            key,
            value: self.value.clone(),
            version: self.version,
            write_lock: false,
            read_lock: 0,
        }
    }

    /// Fingerprint of the logical identity and version of this entry,
    /// used as the item fed into Bloom filters and Merkle leaves. Two
    /// replicas fingerprint equal exactly when they hold the same logical
    /// key at the same version.
    pub fn fingerprint(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[..16].copy_from_slice(&home_key(self.key).to_be_bytes());
        out[16..].copy_from_slice(&self.version.to_be_bytes());
        out
    }
}

/// Outcome of folding a remote entry into the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A missing replica was created from the remote entry.
    Regenerated,
    /// A stale replica was replaced by a newer remote version.
    Updated,
    /// Nothing to do (already current, or remote is older).
    Unchanged,
    /// The local entry is locked; application must be retried later.
    Deferred,
    /// Equal versions with different values. Never overwritten.
    Conflict,
}

/// Keys written and deleted since a recording interval was armed.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Keys written (inserted or updated).
    pub changed: HashSet<RingKey>,
    /// Keys deleted.
    pub deleted: HashSet<RingKey>,
}

/// The per-node replica database.
#[derive(Debug, Default)]
pub struct ReplicaStore {
    /// Entries keyed by ring position.
    entries: DashMap<RingKey, DbEntry>,
    /// Armed change recorders, keyed by their interval.
    recorders: DashMap<Interval, ChangeSet>,
}

impl ReplicaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value, creating a new version of the entry.
    pub fn put(&self, key: RingKey, value: JsonValue, version: u64) -> DbEntry {
        let entry = DbEntry::new(key, value, version);
        self.entries.insert(key, entry.clone());
        self.note_change(key);
        entry
    }

    /// Insert a pre-built entry verbatim.
    pub fn insert_entry(&self, entry: DbEntry) {
        let key = entry.key;
        self.entries.insert(key, entry);
        self.note_change(key);
    }

    /// Fetch a copy of the entry at `key`.
    pub fn get(&self, key: RingKey) -> Option<DbEntry> {
        self.entries.get(&key).map(|e| e.clone())
    }

    /// Delete the entry at `key`. Refused while any lock is held.
    pub fn delete(&self, key: RingKey) -> RepairResult<bool> {
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_locked() {
                return Err(RepairError::EntryLocked { key });
            }
        }
        let removed = self.entries.remove(&key).is_some();
        if removed {
            self.note_delete(key);
        }
        Ok(removed)
    }

    /// Number of entries stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries whose key falls in `interval`, sorted by key.
    pub fn entries_in(&self, interval: &Interval) -> Vec<DbEntry> {
        let mut out: Vec<DbEntry> = self
            .entries
            .iter()
            .filter(|e| interval.contains(*e.key()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.key);
        out
    }

    /// Number of entries whose key falls in `interval`.
    pub fn count_in(&self, interval: &Interval) -> usize {
        self.entries
            .iter()
            .filter(|e| interval.contains(*e.key()))
            .count()
    }

    /// Take the write lock on `key`, creating an empty entry if absent.
    pub fn lock_write(&self, key: RingKey) -> RepairResult<()> {
        let mut entry = self.entries.entry(key).or_insert_with(|| DbEntry::empty(key));
        entry.set_write_lock()
    }

    /// Release the write lock on `key`.
    pub fn unlock_write(&self, key: RingKey) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.clear_write_lock();
        }
    }

    /// Stack a read lock on `key`.
    pub fn lock_read(&self, key: RingKey) -> RepairResult<()> {
        let mut entry = self.entries.entry(key).or_insert_with(|| DbEntry::empty(key));
        entry.add_read_lock()
    }

    /// Release one read lock on `key`.
    pub fn unlock_read(&self, key: RingKey) {
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.release_read_lock();
        }
    }

    /// Arm change recording over `interval`. Subsequent writes and deletes
    /// inside the interval are accumulated until `disarm_recording`.
    pub fn arm_recording(&self, interval: Interval) {
        self.recorders.entry(interval).or_default();
    }

    /// Changed entries and deleted keys recorded for `interval` since it
    /// was armed. Returns `None` if the interval was never armed.
    pub fn get_changes(&self, interval: &Interval) -> Option<(Vec<DbEntry>, Vec<RingKey>)> {
        let recorder = self.recorders.get(interval)?;
        let mut changed: Vec<DbEntry> = recorder
            .changed
            .iter()
            .filter_map(|key| self.get(*key))
            .collect();
        changed.sort_by_key(|e| e.key);
        let mut deleted: Vec<RingKey> = recorder.deleted.iter().copied().collect();
        deleted.sort_unstable();
        Some((changed, deleted))
    }

    /// Drop the recorder for `interval`.
    pub fn disarm_recording(&self, interval: &Interval) {
        self.recorders.remove(interval);
    }

    /// Fold a remote entry into the local store.
    ///
    /// Idempotent with respect to `(key, version)`: applying the same
    /// resolution twice is a no-op, so at-least-once delivery of resolve
    /// messages is acceptable.
    pub fn apply_resolution(&self, incoming: &DbEntry, repair_type: RepairType) -> Resolution {
        match self.entries.get_mut(&incoming.key) {
            None => {
                if matches!(repair_type, RepairType::Regen | RepairType::Mixed) {
                    drop(self.entries.entry(incoming.key).or_insert_with(|| DbEntry {
                        key: incoming.key,
                        value: incoming.value.clone(),
                        version: incoming.version,
                        write_lock: false,
                        read_lock: 0,
                    }));
                    self.note_change(incoming.key);
                    Resolution::Regenerated
                } else {
                    Resolution::Unchanged
                }
            }
            Some(mut existing) => {
                if existing.is_locked() {
                    return Resolution::Deferred;
                }
                if incoming.version > existing.version {
                    if matches!(repair_type, RepairType::Update | RepairType::Mixed) {
                        existing.value = incoming.value.clone();
                        existing.version = incoming.version;
                        drop(existing);
                        self.note_change(incoming.key);
                        Resolution::Updated
                    } else {
                        Resolution::Unchanged
                    }
                } else if incoming.version < existing.version {
                    Resolution::Unchanged
                } else if incoming.value == existing.value {
                    Resolution::Unchanged
                } else {
                    Resolution::Conflict
                }
            }
        }
    }

    fn note_change(&self, key: RingKey) {
        for mut recorder in self.recorders.iter_mut() {
            if recorder.key().contains(key) {
                recorder.deleted.remove(&key);
                recorder.changed.insert(key);
            }
        }
    }

    fn note_delete(&self, key: RingKey) {
        for mut recorder in self.recorders.iter_mut() {
            if recorder.key().contains(key) {
                recorder.changed.remove(&key);
                recorder.deleted.insert(key);
            }
        }
    }
}
