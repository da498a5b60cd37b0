//! Repair orchestrator.
//!
//! The orchestrator drives every reconciliation session on a node. On each
//! trigger it rolls the configured probability, picks a random local key
//! and a random foreign replica quadrant, resolves the responsible peer
//! through the routing table, and opens an initiator session. Incoming
//! wire messages are routed to their session by `(initiator, session-id)`;
//! resolve messages for dead sessions are dropped silently. A periodic
//! sweep enforces session TTLs and replays transient failures with
//! exponential backoff.
//!
//! Sessions live in an arena keyed by integer session id (scoped to their
//! initiator), so sessions and orchestrator never hold references to each
//! other. The orchestrator is the only place where session outputs touch
//! the store or produce network traffic, which keeps the state machine
//! pure.
//!
//! Locally initiated sessions are kept on disjoint intervals: a trigger
//! whose target interval overlaps an open initiated session is refused,
//! so no two of our rounds ever work the same keys at once.

use crate::config::RepairConfig;
use crate::error::{RepairError, RepairResult};
use crate::keyspace::{
    home_key, quadrant_interval, quadrant_of, replica_key, Interval, RingKey, QUADRANT_SPAN,
    REPLICATION_FACTOR,
};
use crate::network::{Message, NodeId};
use crate::reconciliation::LeafItem;
use crate::routing::RoutingTable;
use crate::session::{Role, Session, SessionEvent, SessionOutput, SessionState, SummaryIn};
use crate::stats::RepairStats;
use crate::store::{DbEntry, ReplicaStore, Resolution};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Base delay for transient-failure backoff; doubles per attempt.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// A message addressed to a peer, produced by driving sessions.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination node.
    pub to: NodeId,
    /// The message to deliver.
    pub msg: Message,
}

/// Arena key: session ids are unique per initiator only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    initiator: NodeId,
    id: u64,
}

/// A transiently failed round waiting to be replayed.
#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    due: Instant,
    key: RingKey,
    offset: u8,
    attempt: u32,
}

/// Per-node driver of the repair engine.
pub struct RepairOrchestrator {
    node_id: NodeId,
    store: Arc<ReplicaStore>,
    routing: RoutingTable,
    config: RepairConfig,
    stats: Arc<RepairStats>,
    sessions: HashMap<SessionKey, Session>,
    next_session_id: u64,
    retries: Vec<PendingRetry>,
}

impl RepairOrchestrator {
    /// Create an orchestrator for a node.
    pub fn new(
        node_id: NodeId,
        store: Arc<ReplicaStore>,
        config: RepairConfig,
        stats: Arc<RepairStats>,
    ) -> Self {
        // Session ids are monotonically increasing and unique per
        // initiator. Starting the sequence at a random base keeps two
        // peers that initiate toward each other from ever sharing an id,
        // which would make their summaries indistinguishable on the wire.
        let base = rand::thread_rng().gen_range(1..u64::MAX / 2);
        Self {
            node_id,
            store,
            routing: RoutingTable::new(),
            config,
            stats,
            sessions: HashMap::new(),
            next_session_id: base,
            retries: Vec::new(),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The replica store this orchestrator repairs.
    pub fn store(&self) -> Arc<ReplicaStore> {
        Arc::clone(&self.store)
    }

    /// The routing table, for ring maintenance.
    pub fn routing_mut(&mut self) -> &mut RoutingTable {
        &mut self.routing
    }

    /// Read access to the routing table.
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Number of open sessions.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// The shared counters.
    pub fn stats(&self) -> Arc<RepairStats> {
        Arc::clone(&self.stats)
    }

    /// Periodic trigger. Honors the master switch and the trigger
    /// probability, then opens one session toward a random replica
    /// quadrant of a random local key.
    pub fn on_trigger(&mut self, now: Instant) -> Vec<Outbound> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut rng = rand::thread_rng();
        if rng.gen_range(0..100u8) >= self.config.trigger_probability {
            return Vec::new();
        }
        let Some(responsibility) = self.routing.responsibility(self.node_id) else {
            debug!("trigger skipped: node not in routing table");
            return Vec::new();
        };
        let candidates = self.store.entries_in(&responsibility);
        let Some(entry) = candidates.choose(&mut rng) else {
            return Vec::new();
        };
        let key = entry.key;
        let offset = rng.gen_range(1..REPLICATION_FACTOR);
        match self.start_session_for(key, offset, now) {
            Ok(outbound) => outbound,
            Err(e) => {
                debug!(error = %e, "trigger skipped");
                Vec::new()
            }
        }
    }

    /// Open a session reconciling `key`'s replica in the quadrant `offset`
    /// arcs away, against whichever peer the routing table holds
    /// responsible. A replica routed back to this node is a no-op (the
    /// one-node ring case).
    pub fn start_session_for(
        &mut self,
        key: RingKey,
        offset: u8,
        now: Instant,
    ) -> RepairResult<Vec<Outbound>> {
        let replica = replica_key(key, offset);
        let peer = self
            .routing
            .lookup(replica)
            .ok_or_else(|| RepairError::Network("no route to replica".to_string()))?;
        if peer == self.node_id {
            debug!(key = %key, "replica is local; nothing to reconcile");
            return Ok(Vec::new());
        }
        self.start_session_with(key, offset, peer, now)
    }

    /// Open a session toward an explicit peer (e.g. one picked by the
    /// peer sampler when routing has no entry for the replica).
    pub fn start_session_with(
        &mut self,
        key: RingKey,
        offset: u8,
        peer: NodeId,
        now: Instant,
    ) -> RepairResult<Vec<Outbound>> {
        if self.sessions.len() >= self.config.max_open_sessions {
            return Err(RepairError::SessionLimit(self.sessions.len()));
        }

        // Session scope: our responsibility, cut to the key's quadrant,
        // projected into home coordinates.
        let quadrant = quadrant_of(key);
        let responsibility = self
            .routing
            .responsibility(self.node_id)
            .unwrap_or(Interval::Full);
        let piece = responsibility
            .intersect(&quadrant_interval(quadrant))
            .into_iter()
            .find(|p| p.contains(key))
            .unwrap_or_else(|| Interval::single(key));
        let back = QUADRANT_SPAN.wrapping_mul(((REPLICATION_FACTOR - quadrant) % REPLICATION_FACTOR) as u128);
        let interval = piece.shift(back);

        // Locally initiated sessions stay on disjoint ranges so no two of
        // our rounds ever work the same keys at once. Responder sessions
        // are exempt: resolution application never takes locks (it defers
        // on held ones) and is idempotent, so answering a peer about a
        // range we are also reconciling is safe.
        for session in self.sessions.values() {
            if session.role == Role::Initiator && session.interval.overlaps(&interval) {
                return Err(RepairError::OverlappingSession(interval));
            }
        }

        let items = self.snapshot_items(&interval);
        let id = self.next_session_id;
        self.next_session_id += 1;
        info!(
            session = id,
            peer = %peer,
            method = %self.config.recon_method,
            interval = %interval,
            items = items.len(),
            "opening repair session"
        );
        let mut session = Session::initiator(
            id,
            self.node_id,
            peer,
            self.config.recon_method,
            interval,
            replica_key(key, offset),
            items,
            self.config.clone(),
            now,
        );
        session.origin = Some((key, offset));
        self.stats.session_started();
        let session_key = SessionKey {
            initiator: self.node_id,
            id,
        };
        self.sessions.insert(session_key, session);
        Ok(self.drive(session_key, SessionEvent::Start))
    }

    /// Route an incoming wire message.
    pub fn on_message(&mut self, from: NodeId, msg: Message, now: Instant) -> Vec<Outbound> {
        match msg {
            Message::Hello { .. } | Message::HelloAck { .. } => Vec::new(),

            Message::RequestSync {
                session,
                method,
                replica_key,
                interval,
            } => {
                if interval.is_empty() {
                    return vec![Outbound {
                        to: from,
                        msg: Message::SessionAbort {
                            session,
                            reason: crate::session::AbortReason::Structural,
                        },
                    }];
                }
                // Backpressure: at the session cap, ask the initiator to
                // retry later.
                if self.sessions.len() >= self.config.max_open_sessions {
                    return vec![Outbound {
                        to: from,
                        msg: Message::SessionAbort {
                            session,
                            reason: crate::session::AbortReason::Retry,
                        },
                    }];
                }
                let items = self.snapshot_items(&interval);
                debug!(
                    session,
                    peer = %from,
                    method = %method,
                    items = items.len(),
                    "accepting repair session"
                );
                let responder = Session::responder(
                    session,
                    from,
                    method,
                    interval,
                    replica_key,
                    items,
                    self.config.clone(),
                    now,
                );
                self.stats.session_started();
                self.sessions.insert(
                    SessionKey {
                        initiator: from,
                        id: session,
                    },
                    responder,
                );
                Vec::new()
            }

            Message::BloomSummary {
                session,
                interval,
                filter,
            } => match self.find_session(from, session) {
                Some(key) => self.drive(
                    key,
                    SessionEvent::Summary(SummaryIn::Bloom { interval, filter }),
                ),
                None => self.drop_dead(session, "bloom_summary"),
            },

            Message::MerkleSummary {
                session,
                level,
                hashes,
            } => match self.find_session(from, session) {
                Some(key) => self.drive(
                    key,
                    SessionEvent::Summary(SummaryIn::Merkle {
                        level,
                        digests: hashes,
                    }),
                ),
                None => self.drop_dead(session, "merkle_summary"),
            },

            Message::ArtSummary {
                session,
                interval,
                filters,
                leaf_filter,
                ..
            } => match self.find_session(from, session) {
                Some(key) => self.drive(
                    key,
                    SessionEvent::Summary(SummaryIn::Art(crate::reconciliation::ArtParts {
                        interval,
                        level_filters: filters,
                        leaf_filter,
                    })),
                ),
                None => self.drop_dead(session, "art_summary"),
            },

            Message::ResolveUpdate { session, entry } => {
                match self.find_session(from, session) {
                    Some(key) => {
                        let (home, outcome) = self.apply_incoming(&entry);
                        self.drive(key, SessionEvent::Resolved { key: home, outcome })
                    }
                    None => self.drop_dead(session, "resolve_update"),
                }
            }

            Message::ResolveRegen { session, key } => match self.find_session(from, session) {
                Some(_) => {
                    self.stats.resolve_request();
                    let entry = self
                        .own_entry(key)
                        .unwrap_or_else(|| DbEntry::empty(key));
                    vec![Outbound {
                        to: from,
                        msg: Message::ResolveUpdate { session, entry },
                    }]
                }
                None => self.drop_dead(session, "resolve_regen"),
            },

            Message::SessionDone { session, stats } => match self.find_session(from, session) {
                Some(key) => self.drive(key, SessionEvent::PeerDone(stats)),
                None => self.drop_dead(session, "session_done"),
            },

            Message::SessionAbort { session, reason } => {
                if reason == crate::session::AbortReason::Retry {
                    return self.schedule_retry(from, session, now);
                }
                match self.find_session(from, session) {
                    Some(key) => self.drive(key, SessionEvent::PeerAbort(reason)),
                    None => self.drop_dead(session, "session_abort"),
                }
            }
        }
    }

    /// Periodic sweep: enforce TTLs and replay due retries.
    pub fn on_gc_tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut outbound = Vec::new();
        let keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        for key in keys {
            outbound.extend(self.drive(key, SessionEvent::Tick(now)));
        }

        let due: Vec<PendingRetry> = {
            let (due, later) = self.retries.drain(..).partition(|r| r.due <= now);
            self.retries = later;
            due
        };
        for retry in due {
            debug!(attempt = retry.attempt, "replaying repair round");
            match self.start_session_for(retry.key, retry.offset, now) {
                Ok(out) => {
                    // Carry the attempt count into the replayed session so
                    // the backoff keeps growing.
                    let replay = SessionKey {
                        initiator: self.node_id,
                        id: self.next_session_id - 1,
                    };
                    if let Some(session) = self.sessions.get_mut(&replay) {
                        session.retries = retry.attempt;
                    }
                    outbound.extend(out);
                }
                Err(e) => debug!(error = %e, "retry skipped"),
            }
        }
        outbound
    }

    /// Record a transport failure for an outgoing message. Initiated
    /// sessions are replayed with exponential backoff until the retry
    /// budget runs out.
    pub fn on_send_failure(&mut self, peer: NodeId, msg: &Message, now: Instant) {
        let Some(sid) = msg.session() else { return };
        let key = SessionKey {
            initiator: self.node_id,
            id: sid,
        };
        let Some(session) = self.sessions.get(&key) else {
            return;
        };
        if session.peer != peer {
            return;
        }
        let origin = session.origin;
        let attempt = session.retries + 1;
        self.sessions.remove(&key);
        match origin {
            Some((key, offset)) if attempt <= self.config.retry_limit => {
                let backoff = RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                debug!(session = sid, attempt, ?backoff, "peer unreachable; backing off");
                self.retries.push(PendingRetry {
                    due: now + backoff,
                    key,
                    offset,
                    attempt,
                });
            }
            _ => {
                warn!(session = sid, "retries exhausted; aborting session");
                self.stats.session_aborted();
            }
        }
    }

    /// Peer asked us to retry later: replay the round after a backoff.
    fn schedule_retry(&mut self, from: NodeId, sid: u64, now: Instant) -> Vec<Outbound> {
        let key = SessionKey {
            initiator: self.node_id,
            id: sid,
        };
        let Some(session) = self.sessions.get(&key) else {
            return self.drop_dead(sid, "session_abort");
        };
        if session.peer != from {
            return Vec::new();
        }
        let origin = session.origin;
        let attempt = session.retries + 1;
        self.sessions.remove(&key);
        if let Some((key, offset)) = origin {
            if attempt <= self.config.retry_limit {
                let backoff = RETRY_BACKOFF_BASE * 2u32.saturating_pow(attempt - 1);
                self.retries.push(PendingRetry {
                    due: now + backoff,
                    key,
                    offset,
                    attempt,
                });
                return Vec::new();
            }
        }
        self.stats.session_aborted();
        Vec::new()
    }

    /// Feed one event into a session and interpret its outputs.
    fn drive(&mut self, key: SessionKey, event: SessionEvent) -> Vec<Outbound> {
        let Some(session) = self.sessions.get_mut(&key) else {
            return Vec::new();
        };
        let outputs = session.step(event);
        let peer = session.peer;
        let sid = session.id;

        let mut outbound = Vec::new();
        let mut finished = false;
        for output in outputs {
            match output {
                SessionOutput::Send(msg) => outbound.push(Outbound { to: peer, msg }),
                SessionOutput::PushKeys(keys) => {
                    for home in keys {
                        if let Some(entry) = self.own_entry(home) {
                            outbound.push(Outbound {
                                to: peer,
                                msg: Message::ResolveUpdate {
                                    session: sid,
                                    entry,
                                },
                            });
                        }
                    }
                }
                SessionOutput::PushIntervals(intervals) => {
                    for interval in intervals {
                        for entry in self.entries_with_home_in(&interval) {
                            outbound.push(Outbound {
                                to: peer,
                                msg: Message::ResolveUpdate {
                                    session: sid,
                                    entry,
                                },
                            });
                        }
                    }
                }
                SessionOutput::Finished => finished = true,
            }
        }
        if finished {
            self.finalize(key);
        }
        outbound
    }

    fn finalize(&mut self, key: SessionKey) {
        let Some(session) = self.sessions.remove(&key) else {
            return;
        };
        let stats = session.stats();
        match session.state() {
            SessionState::Done => {
                info!(
                    session = session.id,
                    rounds = stats.rounds,
                    updated = stats.updated,
                    regenerated = stats.regenerated,
                    "session complete"
                );
                self.stats.session_completed();
            }
            SessionState::Aborted => self.stats.session_aborted(),
            SessionState::Failed => self.stats.session_failed(),
            other => {
                debug!(session = session.id, state = ?other, "session removed while active");
            }
        }
    }

    fn find_session(&self, from: NodeId, sid: u64) -> Option<SessionKey> {
        let ours = SessionKey {
            initiator: self.node_id,
            id: sid,
        };
        if let Some(session) = self.sessions.get(&ours) {
            if session.peer == from {
                return Some(ours);
            }
        }
        let theirs = SessionKey {
            initiator: from,
            id: sid,
        };
        self.sessions.contains_key(&theirs).then_some(theirs)
    }

    fn drop_dead(&self, sid: u64, kind: &str) -> Vec<Outbound> {
        debug!(session = sid, kind, "dropping message for dead session");
        Vec::new()
    }

    /// Snapshot the local items for a home-space interval, deduplicated by
    /// logical key keeping the highest version.
    fn snapshot_items(&self, interval: &Interval) -> Vec<LeafItem> {
        let mut best: HashMap<RingKey, u64> = HashMap::new();
        for entry in self.store.entries_in(&Interval::Full) {
            if entry.is_empty() {
                continue;
            }
            let home = home_key(entry.key);
            if interval.contains(home) {
                let version = best.entry(home).or_insert(entry.version);
                *version = (*version).max(entry.version);
            }
        }
        let mut items: Vec<LeafItem> = best
            .into_iter()
            .map(|(key, version)| LeafItem { key, version })
            .collect();
        items.sort_by_key(|item| item.key);
        items
    }

    /// The local replica entry for a logical (home) key, if any.
    fn own_entry(&self, home: RingKey) -> Option<DbEntry> {
        for j in 0..REPLICATION_FACTOR {
            let candidate = replica_key(home, j);
            if let Some(entry) = self.store.get(candidate) {
                if !entry.is_empty() {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// All local entries whose logical key falls in a home-space interval.
    fn entries_with_home_in(&self, interval: &Interval) -> Vec<DbEntry> {
        let mut out: Vec<DbEntry> = self
            .store
            .entries_in(&Interval::Full)
            .into_iter()
            .filter(|entry| !entry.is_empty() && interval.contains(home_key(entry.key)))
            .collect();
        out.sort_by_key(|entry| entry.key);
        out
    }

    /// Fold a remote entry into every replica position this node owns for
    /// its logical key.
    fn apply_incoming(&self, entry: &DbEntry) -> (RingKey, Resolution) {
        let home = home_key(entry.key);
        let responsibility = self
            .routing
            .responsibility(self.node_id)
            .unwrap_or(Interval::Full);
        let mut outcome = Resolution::Unchanged;
        for j in 0..REPLICATION_FACTOR {
            let candidate = replica_key(home, j);
            if !responsibility.contains(candidate) {
                continue;
            }
            let local = entry.rekey(candidate);
            let result = self.store.apply_resolution(&local, self.config.repair_type);
            match result {
                Resolution::Updated => self.stats.entry_updated(),
                Resolution::Regenerated => self.stats.entry_regenerated(),
                Resolution::Conflict => self.stats.conflict(),
                _ => {}
            }
            outcome = worse(outcome, result);
        }
        (home, outcome)
    }
}

/// Severity order for aggregating per-replica outcomes.
fn worse(a: Resolution, b: Resolution) -> Resolution {
    fn rank(r: Resolution) -> u8 {
        match r {
            Resolution::Unchanged => 0,
            Resolution::Updated => 1,
            Resolution::Regenerated => 2,
            Resolution::Deferred => 3,
            Resolution::Conflict => 4,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}
