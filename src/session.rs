//! Reconciliation session state machine.
//!
//! One session is one bilateral reconciliation exchange. Both peers run the
//! same machine; the roles differ only in which message each receives
//! first. The machine is deliberately pure: a single
//! `step(event) -> Vec<SessionOutput>` transition function that never
//! touches the store or the network itself. The orchestrator feeds it
//! events (wire messages, resolution outcomes, timer ticks) and interprets
//! its outputs (messages to send, entries to push), which makes every
//! protocol path testable without I/O.
//!
//! ```text
//! IDLE ──trigger──▶ BUILD_SUMMARY ──send_summary──▶ WAIT_REPLY
//!                                                     │
//!                                          reply received
//!                                                     ▼
//!                                               DIFF_COMPUTE
//!                                                     │
//!                                          resolve requests sent
//!                                                     ▼
//!                                                WAIT_RESOLVE ── all resolved / TTL ──▶ DONE
//! ```
//!
//! Terminal states: DONE, ABORTED (TTL, retry exhaustion, peer abort,
//! semantic conflict), FAILED (malformed summary, interval disagreement,
//! Bloom parameter mismatch).
//!
//! A session owns a snapshot of its configuration and of the local items in
//! its interval, both taken at creation; it never re-reads either
//! mid-round.

use crate::config::RepairConfig;
use crate::keyspace::{Interval, RingKey};
use crate::network::Message;
use crate::reconciliation::{
    Art, ArtConfig, ArtParts, BloomFilter, BloomParts, LeafItem, MerkleConfig, MerkleDigest,
    MerkleTree, ReconMethod,
};
use crate::store::Resolution;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, warn};

use crate::network::NodeId;

/// Which end of the session this machine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the session via `request_sync`.
    Initiator,
    /// Accepted the session.
    Responder,
}

/// The session's position in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    BuildSummary,
    WaitReply,
    DiffCompute,
    WaitResolve,
    Done,
    Aborted,
    Failed,
}

/// Why a session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The TTL elapsed before the session completed.
    Ttl,
    /// Equal-version conflicting values were detected.
    Conflict,
    /// Transient failures exhausted the retry budget.
    RetryExhausted,
    /// The responder is busy on an overlapping range; try again later.
    Retry,
    /// The peer is shutting down.
    Shutdown,
    /// Malformed summary, interval disagreement, or parameter mismatch.
    Structural,
}

/// Per-session counters, exchanged inside `session_done`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Summary rounds processed.
    pub rounds: u64,
    /// Entries this side asked to be pushed to the peer.
    pub pushed: u64,
    /// Local entries updated from remote resolutions.
    pub updated: u64,
    /// Local entries regenerated from remote resolutions.
    pub regenerated: u64,
    /// Resolutions that were already current.
    pub unchanged: u64,
    /// Resolutions deferred because of locks.
    pub deferred: u64,
    /// Equal-version conflicts observed.
    pub conflicts: u64,
    /// Redelivery pulls issued.
    pub pulls: u64,
}

/// An incoming summary, already parsed off the wire.
#[derive(Debug, Clone)]
pub enum SummaryIn {
    Bloom {
        interval: Interval,
        filter: BloomParts,
    },
    Merkle {
        level: u32,
        digests: Vec<MerkleDigest>,
    },
    Art(ArtParts),
}

/// Input to the transition function.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Begin the session (initiator builds and sends its first summary).
    Start,
    /// A summary arrived from the peer.
    Summary(SummaryIn),
    /// The orchestrator applied a remote resolution for `key` (a home
    /// key) with the given outcome.
    Resolved { key: RingKey, outcome: Resolution },
    /// The peer declared the session complete.
    PeerDone(SessionStats),
    /// The peer terminated the session.
    PeerAbort(AbortReason),
    /// Timer tick for TTL enforcement.
    Tick(Instant),
}

/// Output of the transition function, interpreted by the orchestrator.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// Send a message to the session peer.
    Send(Message),
    /// Push the local entries for these home keys to the peer.
    PushKeys(Vec<RingKey>),
    /// Push the local entries inside these home intervals to the peer.
    PushIntervals(Vec<Interval>),
    /// The session reached a terminal state; garbage-collect it.
    Finished,
}

/// One bilateral reconciliation exchange.
#[derive(Debug)]
pub struct Session {
    /// Session id, unique per initiator.
    pub id: u64,
    /// The node that opened the session.
    pub initiator: NodeId,
    /// The other end.
    pub peer: NodeId,
    /// This machine's role.
    pub role: Role,
    /// Reconciliation method, fixed at creation.
    pub method: ReconMethod,
    /// Session scope in home coordinates.
    pub interval: Interval,
    /// The replica key named in `request_sync` (informational).
    pub replica_key: RingKey,

    state: SessionState,
    config: RepairConfig,
    items: Vec<LeafItem>,
    deadline: Instant,
    stats: SessionStats,
    abort_reason: Option<AbortReason>,

    // Bloom segmentation.
    parts: VecDeque<Interval>,
    // Merkle working state.
    tree: Option<MerkleTree>,
    merkle_seen: HashSet<Interval>,
    divergent: Vec<Interval>,
    flushed: bool,
    signaled: bool,
    // Resolve bookkeeping.
    outstanding: u32,
    deferred: Vec<RingKey>,
    // Orchestrator bookkeeping for transient-failure replays.
    pub(crate) retries: u32,
    pub(crate) origin: Option<(RingKey, u8)>,
}

impl Session {
    /// Create the initiating side.
    #[allow(clippy::too_many_arguments)]
    pub fn initiator(
        id: u64,
        self_node: NodeId,
        peer: NodeId,
        method: ReconMethod,
        interval: Interval,
        replica_key: RingKey,
        items: Vec<LeafItem>,
        config: RepairConfig,
        now: Instant,
    ) -> Self {
        Self::new(
            id,
            self_node,
            peer,
            Role::Initiator,
            method,
            interval,
            replica_key,
            items,
            config,
            now,
        )
    }

    /// Create the responding side for a received `request_sync`.
    #[allow(clippy::too_many_arguments)]
    pub fn responder(
        id: u64,
        initiator: NodeId,
        method: ReconMethod,
        interval: Interval,
        replica_key: RingKey,
        items: Vec<LeafItem>,
        config: RepairConfig,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(
            id,
            initiator,
            initiator,
            Role::Responder,
            method,
            interval,
            replica_key,
            items,
            config,
            now,
        );
        // The responder has no opening move; it waits for a summary.
        session.state = SessionState::WaitReply;
        session
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        id: u64,
        initiator: NodeId,
        peer: NodeId,
        role: Role,
        method: ReconMethod,
        interval: Interval,
        replica_key: RingKey,
        items: Vec<LeafItem>,
        config: RepairConfig,
        now: Instant,
    ) -> Self {
        let deadline = now + config.session_ttl;
        Self {
            id,
            initiator,
            peer,
            role,
            method,
            interval,
            replica_key,
            state: SessionState::Idle,
            config,
            items,
            deadline,
            stats: SessionStats::default(),
            abort_reason: None,
            parts: VecDeque::new(),
            tree: None,
            merkle_seen: HashSet::new(),
            divergent: Vec::new(),
            flushed: false,
            signaled: false,
            outstanding: 0,
            deferred: Vec::new(),
            retries: 0,
            origin: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SessionState::Done | SessionState::Aborted | SessionState::Failed
        )
    }

    /// The session's counters.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Why the session aborted, if it did.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    /// The TTL deadline.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Redelivery pulls currently awaiting replies.
    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// The single transition function.
    pub fn step(&mut self, event: SessionEvent) -> Vec<SessionOutput> {
        if self.is_terminal() {
            return Vec::new();
        }
        match event {
            SessionEvent::Start => self.on_start(),
            SessionEvent::Summary(summary) => self.on_summary(summary),
            SessionEvent::Resolved { key, outcome } => self.on_resolved(key, outcome),
            SessionEvent::PeerDone(stats) => self.on_peer_done(stats),
            SessionEvent::PeerAbort(reason) => {
                debug!(session = self.id, ?reason, "peer aborted session");
                self.state = SessionState::Aborted;
                self.abort_reason = Some(reason);
                vec![SessionOutput::Finished]
            }
            SessionEvent::Tick(now) => self.on_tick(now),
        }
    }

    fn on_start(&mut self) -> Vec<SessionOutput> {
        if self.role == Role::Responder {
            // Responder sessions are armed at construction.
            return Vec::new();
        }
        self.state = SessionState::BuildSummary;
        let mut outputs = vec![SessionOutput::Send(Message::RequestSync {
            session: self.id,
            method: self.method,
            replica_key: self.replica_key,
            interval: self.interval,
        })];

        match self.method {
            ReconMethod::Bloom => {
                // Rounds exceeding max_items split into part intervals.
                let part_count = self.items.len().div_ceil(self.config.max_items).max(1);
                self.parts = self
                    .interval
                    .partition(part_count)
                    .into_iter()
                    .filter(|p| !p.is_empty())
                    .collect();
                if let Some(part) = self.parts.pop_front() {
                    outputs.push(self.bloom_summary_for(part));
                }
            }
            ReconMethod::MerkleTree => match self.build_tree() {
                Ok(digest) => outputs.push(SessionOutput::Send(Message::MerkleSummary {
                    session: self.id,
                    level: 0,
                    hashes: vec![digest],
                })),
                Err(why) => return self.fail(&why),
            },
            ReconMethod::Art => {
                if let Err(why) = self.build_tree() {
                    return self.fail(&why);
                }
                let art_config = ArtConfig {
                    inner_fpr: self.config.art_inner_fpr,
                    leaf_fpr: self.config.art_leaf_fpr,
                    correction_factor: self.config.art_correction_factor,
                };
                let art = match self.tree.as_ref() {
                    Some(tree) => match Art::from_tree(tree, &art_config) {
                        Ok(art) => art,
                        Err(e) => return self.fail(&format!("art digest failed: {}", e)),
                    },
                    None => return self.fail("art digest without a tree"),
                };
                let parts = art.to_parts();
                outputs.push(SessionOutput::Send(Message::ArtSummary {
                    session: self.id,
                    level: art.depth() as u32,
                    interval: parts.interval,
                    filters: parts.level_filters,
                    leaf_filter: parts.leaf_filter,
                }));
            }
        }
        self.state = SessionState::WaitReply;
        outputs
    }

    fn on_summary(&mut self, summary: SummaryIn) -> Vec<SessionOutput> {
        self.state = SessionState::DiffCompute;
        self.stats.rounds += 1;
        match (self.method, summary) {
            (ReconMethod::Bloom, SummaryIn::Bloom { interval, filter }) => {
                self.on_bloom(interval, filter)
            }
            (ReconMethod::MerkleTree, SummaryIn::Merkle { level, digests }) => {
                self.on_merkle(level, digests)
            }
            (ReconMethod::Art, SummaryIn::Art(parts)) => self.on_art(parts),
            (method, other) => self.fail(&format!(
                "summary kind does not match session method {} (got {:?})",
                method, other
            )),
        }
    }

    fn on_bloom(&mut self, part: Interval, filter: BloomParts) -> Vec<SessionOutput> {
        if !part.difference(&self.interval).is_empty() {
            return self.fail(&format!(
                "bloom part {} escapes session interval {}",
                part, self.interval
            ));
        }
        let filter = match BloomFilter::from_parts(&filter) {
            Ok(filter) => filter,
            Err(e) => return self.fail(&format!("bad bloom summary: {}", e)),
        };

        // Definite absences are items the peer lacks or holds at another
        // version; push our entries for them.
        let missing: Vec<RingKey> = self
            .items
            .iter()
            .filter(|item| part.contains(item.key) && !filter.contains(&item.fingerprint()))
            .map(|item| item.key)
            .collect();
        self.stats.pushed += missing.len() as u64;

        let mut outputs = Vec::new();
        if !missing.is_empty() {
            outputs.push(SessionOutput::PushKeys(missing));
        }

        match self.role {
            Role::Responder => {
                // Echo our own filter so the initiator heals the reverse
                // direction, then pull redeliveries for anything deferred.
                outputs.push(self.bloom_summary_for(part));
                outputs.extend(self.drain_deferred());
                self.state = SessionState::WaitReply;
            }
            Role::Initiator => {
                if let Some(next) = self.parts.pop_front() {
                    outputs.push(self.bloom_summary_for(next));
                    self.state = SessionState::WaitReply;
                } else {
                    outputs.extend(self.enter_done_flow());
                }
            }
        }
        outputs
    }

    fn on_merkle(&mut self, level: u32, digests: Vec<MerkleDigest>) -> Vec<SessionOutput> {
        if self.tree.is_none() {
            if let Err(why) = self.build_tree() {
                return self.fail(&why);
            }
        }
        let Some(tree) = self.tree.as_ref() else {
            return self.fail("merkle summary without a tree");
        };

        if digests.is_empty() {
            // Peer finished its descent; all its resolves precede this
            // signal on the wire.
            let mut outputs = self.flush_divergent();
            match self.role {
                Role::Responder => {
                    if !self.signaled {
                        self.signaled = true;
                        outputs.push(SessionOutput::Send(Message::MerkleSummary {
                            session: self.id,
                            level,
                            hashes: Vec::new(),
                        }));
                    }
                    outputs.extend(self.drain_deferred());
                    self.state = SessionState::WaitReply;
                }
                Role::Initiator => {
                    outputs.extend(self.enter_done_flow());
                }
            }
            return outputs;
        }

        if level == 0 {
            if let Some(first) = digests.first() {
                if first.interval != tree.interval() {
                    return self.fail(&format!(
                        "interval disagreement: local {}, remote {}",
                        tree.interval(),
                        first.interval
                    ));
                }
                debug!(
                    session = self.id,
                    remote_root = %hex::encode(first.hash),
                    "merkle descent opened"
                );
            }
        }

        let (reply, newly) = match tree.diff_digests(&digests, &mut self.merkle_seen) {
            Ok(result) => result,
            Err(e) => return self.fail(&format!("merkle diff failed: {}", e)),
        };
        self.divergent.extend(newly);

        let mut outputs = Vec::new();
        if reply.is_empty() {
            // Our descent is exhausted: flush and signal.
            outputs.extend(self.flush_divergent());
            self.signaled = true;
            outputs.push(SessionOutput::Send(Message::MerkleSummary {
                session: self.id,
                level: level + 1,
                hashes: Vec::new(),
            }));
        } else {
            outputs.push(SessionOutput::Send(Message::MerkleSummary {
                session: self.id,
                level: level + 1,
                hashes: reply,
            }));
        }
        self.state = SessionState::WaitReply;
        outputs
    }

    fn on_art(&mut self, parts: ArtParts) -> Vec<SessionOutput> {
        if self.role != Role::Responder {
            return self.fail("unexpected art summary on the initiating side");
        }
        let art = match Art::from_parts(&parts) {
            Ok(art) => art,
            Err(e) => return self.fail(&format!("bad art summary: {}", e)),
        };
        if self.tree.is_none() {
            if let Err(why) = self.build_tree() {
                return self.fail(&why);
            }
        }
        let Some(tree) = self.tree.as_ref() else {
            return self.fail("art summary without a tree");
        };
        let divergent = match art.divergent_intervals(tree) {
            Ok(divergent) => divergent,
            Err(e) => return self.fail(&format!("art comparison failed: {}", e)),
        };

        self.stats.pushed += divergent.len() as u64;
        let mut outputs = Vec::new();
        if !divergent.is_empty() {
            outputs.push(SessionOutput::PushIntervals(divergent));
        }
        // ART heals one direction; the responder closes the session.
        outputs.push(SessionOutput::Send(Message::SessionDone {
            session: self.id,
            stats: self.stats,
        }));
        self.state = SessionState::Done;
        outputs.push(SessionOutput::Finished);
        outputs
    }

    fn on_resolved(&mut self, key: RingKey, outcome: Resolution) -> Vec<SessionOutput> {
        match outcome {
            Resolution::Updated => self.stats.updated += 1,
            Resolution::Regenerated => self.stats.regenerated += 1,
            Resolution::Unchanged => self.stats.unchanged += 1,
            Resolution::Deferred => {
                self.stats.deferred += 1;
                self.deferred.push(key);
            }
            Resolution::Conflict => {
                self.stats.conflicts += 1;
                warn!(session = self.id, key = %key, "version conflict");
                self.state = SessionState::Aborted;
                self.abort_reason = Some(AbortReason::Conflict);
                return vec![
                    SessionOutput::Send(Message::SessionAbort {
                        session: self.id,
                        reason: AbortReason::Conflict,
                    }),
                    SessionOutput::Finished,
                ];
            }
        }
        if self.outstanding > 0 {
            self.outstanding -= 1;
        }
        if self.role == Role::Initiator
            && self.state == SessionState::WaitResolve
            && self.outstanding == 0
        {
            return self.complete();
        }
        Vec::new()
    }

    fn on_peer_done(&mut self, remote: SessionStats) -> Vec<SessionOutput> {
        debug!(
            session = self.id,
            remote_pushed = remote.pushed,
            "peer completed session"
        );
        self.state = SessionState::Done;
        vec![SessionOutput::Finished]
    }

    fn on_tick(&mut self, now: Instant) -> Vec<SessionOutput> {
        if now < self.deadline {
            return Vec::new();
        }
        debug!(session = self.id, "session ttl expired");
        self.state = SessionState::Aborted;
        self.abort_reason = Some(AbortReason::Ttl);
        vec![
            SessionOutput::Send(Message::SessionAbort {
                session: self.id,
                reason: AbortReason::Ttl,
            }),
            SessionOutput::Finished,
        ]
    }

    /// Initiator wrap-up: pull redeliveries for deferred keys, then close
    /// once nothing is outstanding.
    fn enter_done_flow(&mut self) -> Vec<SessionOutput> {
        let mut outputs = self.drain_deferred();
        if self.outstanding == 0 {
            outputs.extend(self.complete());
        } else {
            self.state = SessionState::WaitResolve;
        }
        outputs
    }

    fn complete(&mut self) -> Vec<SessionOutput> {
        self.state = SessionState::Done;
        vec![
            SessionOutput::Send(Message::SessionDone {
                session: self.id,
                stats: self.stats,
            }),
            SessionOutput::Finished,
        ]
    }

    fn drain_deferred(&mut self) -> Vec<SessionOutput> {
        let mut outputs = Vec::new();
        for key in std::mem::take(&mut self.deferred) {
            self.stats.pulls += 1;
            self.outstanding += 1;
            outputs.push(SessionOutput::Send(Message::ResolveRegen {
                session: self.id,
                key,
            }));
        }
        outputs
    }

    fn flush_divergent(&mut self) -> Vec<SessionOutput> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        if self.divergent.is_empty() {
            return Vec::new();
        }
        self.stats.pushed += self.divergent.len() as u64;
        vec![SessionOutput::PushIntervals(self.divergent.clone())]
    }

    fn bloom_summary_for(&self, part: Interval) -> SessionOutput {
        let in_part: Vec<&LeafItem> = self
            .items
            .iter()
            .filter(|item| part.contains(item.key))
            .collect();
        let mut filter =
            BloomFilter::with_seed(in_part.len().max(1), self.config.bloom_fpr, self.id);
        for item in &in_part {
            filter.add(&item.fingerprint());
        }
        SessionOutput::Send(Message::BloomSummary {
            session: self.id,
            interval: part,
            filter: filter.to_parts(),
        })
    }

    fn build_tree(&mut self) -> Result<MerkleDigest, String> {
        let config = MerkleConfig {
            branch_factor: self.config.merkle_branch_factor,
            bucket_size: self.config.merkle_bucket_size,
        };
        let tree = MerkleTree::from_items(
            self.interval,
            config,
            self.items.iter().map(|item| (item.key, item.version)),
        )
        .map_err(|e| format!("tree build failed: {}", e))?;
        let digest = tree.root_digest().map_err(|e| e.to_string())?;
        self.tree = Some(tree);
        Ok(digest)
    }

    fn fail(&mut self, why: &str) -> Vec<SessionOutput> {
        warn!(session = self.id, why, "session failed");
        self.state = SessionState::Failed;
        vec![
            SessionOutput::Send(Message::SessionAbort {
                session: self.id,
                reason: AbortReason::Structural,
            }),
            SessionOutput::Finished,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn items_of(pairs: &[(u128, u64)]) -> Vec<LeafItem> {
        pairs
            .iter()
            .map(|&(key, version)| LeafItem { key, version })
            .collect()
    }

    /// Default config with filters oversized far past the defaults, so a
    /// fixed-hash false positive cannot mask the divergences these tests
    /// plant.
    fn config() -> RepairConfig {
        let mut config = RepairConfig::default().bloom_fpr(0.0005);
        config.art_inner_fpr = 1e-4;
        config.art_leaf_fpr = 1e-4;
        config.art_correction_factor = 4.0;
        config
    }

    fn new_pair(
        method: ReconMethod,
        interval: Interval,
        initiator_items: &[(u128, u64)],
        responder_items: &[(u128, u64)],
    ) -> (Session, Session) {
        let now = Instant::now();
        let a = NodeId::new();
        let b = NodeId::new();
        let init = Session::initiator(
            1,
            a,
            b,
            method,
            interval,
            0,
            items_of(initiator_items),
            config(),
            now,
        );
        let resp = Session::responder(
            1,
            a,
            method,
            interval,
            0,
            items_of(responder_items),
            config(),
            now,
        );
        (init, resp)
    }

    /// Feed every `Send` output of one side into the other until both are
    /// quiescent, counting pushes per side.
    fn pump(init: &mut Session, resp: &mut Session) -> (u64, u64) {
        let mut to_resp: VecDeque<Message> = VecDeque::new();
        let mut to_init: VecDeque<Message> = VecDeque::new();
        let mut init_pushes = 0u64;
        let mut resp_pushes = 0u64;

        let outputs = init.step(SessionEvent::Start);
        route(outputs, &mut to_resp, &mut init_pushes);

        let mut safety = 0;
        while !to_resp.is_empty() || !to_init.is_empty() {
            safety += 1;
            assert!(safety < 1000, "session exchange did not converge");
            if let Some(msg) = to_resp.pop_front() {
                if let Some(event) = event_of(msg) {
                    route(resp.step(event), &mut to_init, &mut resp_pushes);
                }
            }
            if let Some(msg) = to_init.pop_front() {
                if let Some(event) = event_of(msg) {
                    route(init.step(event), &mut to_resp, &mut init_pushes);
                }
            }
        }
        (init_pushes, resp_pushes)
    }

    fn route(outputs: Vec<SessionOutput>, queue: &mut VecDeque<Message>, pushes: &mut u64) {
        for output in outputs {
            match output {
                SessionOutput::Send(msg) => queue.push_back(msg),
                SessionOutput::PushKeys(keys) => *pushes += keys.len() as u64,
                SessionOutput::PushIntervals(intervals) => *pushes += intervals.len() as u64,
                SessionOutput::Finished => {}
            }
        }
    }

    fn event_of(msg: Message) -> Option<SessionEvent> {
        match msg {
            Message::RequestSync { .. } => None, // pair is pre-built in tests
            Message::BloomSummary {
                interval, filter, ..
            } => Some(SessionEvent::Summary(SummaryIn::Bloom { interval, filter })),
            Message::MerkleSummary { level, hashes, .. } => {
                Some(SessionEvent::Summary(SummaryIn::Merkle {
                    level,
                    digests: hashes,
                }))
            }
            Message::ArtSummary {
                interval,
                filters,
                leaf_filter,
                ..
            } => Some(SessionEvent::Summary(SummaryIn::Art(ArtParts {
                interval,
                level_filters: filters,
                leaf_filter,
            }))),
            Message::SessionDone { stats, .. } => Some(SessionEvent::PeerDone(stats)),
            Message::SessionAbort { reason, .. } => Some(SessionEvent::PeerAbort(reason)),
            // Resolve traffic is the orchestrator's business; sessions in
            // these tests only count it via PushKeys/PushIntervals.
            Message::ResolveUpdate { .. } | Message::ResolveRegen { .. } => None,
            Message::Hello { .. } | Message::HelloAck { .. } => None,
        }
    }

    #[test]
    fn test_initiator_opens_with_request_sync() {
        let (mut init, _) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &[(1, 1)], &[]);
        let outputs = init.step(SessionEvent::Start);
        assert!(matches!(
            outputs.first(),
            Some(SessionOutput::Send(Message::RequestSync { .. }))
        ));
        assert!(matches!(
            outputs.get(1),
            Some(SessionOutput::Send(Message::BloomSummary { .. }))
        ));
        assert_eq!(init.state(), SessionState::WaitReply);
    }

    #[test]
    fn test_bloom_no_diff_goes_straight_to_done() {
        let keys: Vec<(u128, u64)> = (0..100u128).map(|i| (i * 7, 1)).collect();
        let (mut init, mut resp) =
            new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &keys, &keys);
        let (init_pushes, resp_pushes) = pump(&mut init, &mut resp);

        assert_eq!(init.state(), SessionState::Done);
        assert_eq!(resp.state(), SessionState::Done);
        assert_eq!(init_pushes, 0);
        assert_eq!(resp_pushes, 0);
    }

    #[test]
    fn test_bloom_divergence_triggers_pushes() {
        let keys: Vec<(u128, u64)> = (0..100u128).map(|i| (i * 7, 1)).collect();
        let mut stale = keys.clone();
        stale[3].1 = 0; // responder is older here
        stale.remove(50); // and misses this key

        let (mut init, mut resp) =
            new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &keys, &stale);
        let (init_pushes, resp_pushes) = pump(&mut init, &mut resp);

        assert_eq!(init.state(), SessionState::Done);
        assert_eq!(resp.state(), SessionState::Done);
        // The responder's stale item fingerprints differently, so it pushes
        // toward the initiator; the initiator pushes the newer/extra items.
        assert!(init_pushes > 0);
        assert!(resp_pushes > 0);
    }

    #[test]
    fn test_bloom_splits_into_parts() {
        let keys: Vec<(u128, u64)> = (0..100u128).map(|i| (i * 7, 1)).collect();
        let now = Instant::now();
        let mut init = Session::initiator(
            1,
            NodeId::new(),
            NodeId::new(),
            ReconMethod::Bloom,
            Interval::arc(0, 1000),
            0,
            items_of(&keys),
            config().max_items(30),
            now,
        );
        let mut resp = Session::responder(
            1,
            init.initiator,
            ReconMethod::Bloom,
            Interval::arc(0, 1000),
            0,
            items_of(&keys),
            config().max_items(30),
            now,
        );
        pump(&mut init, &mut resp);
        assert_eq!(init.state(), SessionState::Done);
        // 100 items at 30 per part is four part intervals, each a round.
        assert!(init.stats().rounds >= 4, "rounds {}", init.stats().rounds);
    }

    #[test]
    fn test_merkle_identical_exchanges_and_completes() {
        let keys: Vec<(u128, u64)> = (0..200u128).map(|i| (i * 5, 2)).collect();
        let (mut init, mut resp) =
            new_pair(ReconMethod::MerkleTree, Interval::arc(0, 1024), &keys, &keys);
        let (init_pushes, resp_pushes) = pump(&mut init, &mut resp);

        assert_eq!(init.state(), SessionState::Done);
        assert_eq!(resp.state(), SessionState::Done);
        assert_eq!(init_pushes + resp_pushes, 0);
    }

    #[test]
    fn test_merkle_divergence_flushes_both_sides() {
        let keys: Vec<(u128, u64)> = (0..200u128).map(|i| (i * 5, 2)).collect();
        let mut other = keys.clone();
        other[20].1 = 3;
        other.remove(100);

        let (mut init, mut resp) =
            new_pair(ReconMethod::MerkleTree, Interval::arc(0, 1024), &keys, &other);
        let (init_pushes, resp_pushes) = pump(&mut init, &mut resp);

        assert_eq!(init.state(), SessionState::Done);
        assert_eq!(resp.state(), SessionState::Done);
        assert!(init_pushes > 0);
        assert!(resp_pushes > 0);
    }

    #[test]
    fn test_merkle_interval_disagreement_fails() {
        let (mut init, mut resp) = {
            let now = Instant::now();
            let a = NodeId::new();
            let init = Session::initiator(
                1,
                a,
                NodeId::new(),
                ReconMethod::MerkleTree,
                Interval::arc(0, 1000),
                0,
                items_of(&[(1, 1)]),
                config(),
                now,
            );
            let resp = Session::responder(
                1,
                a,
                ReconMethod::MerkleTree,
                Interval::arc(0, 2000),
                0,
                items_of(&[(1, 1)]),
                config(),
                now,
            );
            (init, resp)
        };
        let outputs = init.step(SessionEvent::Start);
        // Deliver the initiator's root digest into the mismatched responder.
        let summary = outputs
            .into_iter()
            .find_map(|o| match o {
                SessionOutput::Send(Message::MerkleSummary { level, hashes, .. }) => {
                    Some(SessionEvent::Summary(SummaryIn::Merkle {
                        level,
                        digests: hashes,
                    }))
                }
                _ => None,
            })
            .expect("initiator sends a merkle summary");
        let outputs = resp.step(summary);
        assert_eq!(resp.state(), SessionState::Failed);
        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Send(Message::SessionAbort {
                reason: AbortReason::Structural,
                ..
            })
        )));
    }

    #[test]
    fn test_art_responder_pushes_and_closes() {
        let keys: Vec<(u128, u64)> = (0..150u128).map(|i| (i * 6, 1)).collect();
        let mut fuller = keys.clone();
        fuller.push((901, 1));

        // Responder has an entry the initiator lacks.
        let (mut init, mut resp) =
            new_pair(ReconMethod::Art, Interval::arc(0, 1024), &keys, &fuller);
        let (_, resp_pushes) = pump(&mut init, &mut resp);

        assert_eq!(resp.state(), SessionState::Done);
        assert_eq!(init.state(), SessionState::Done);
        assert!(resp_pushes > 0);
    }

    #[test]
    fn test_conflict_aborts_session() {
        let (mut init, _) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &[(1, 1)], &[]);
        init.step(SessionEvent::Start);
        let outputs = init.step(SessionEvent::Resolved {
            key: 1,
            outcome: Resolution::Conflict,
        });
        assert_eq!(init.state(), SessionState::Aborted);
        assert_eq!(init.abort_reason(), Some(AbortReason::Conflict));
        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Send(Message::SessionAbort {
                reason: AbortReason::Conflict,
                ..
            })
        )));
    }

    #[test]
    fn test_ttl_expiry_aborts() {
        let (mut init, _) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &[(1, 1)], &[]);
        init.step(SessionEvent::Start);

        // Before the deadline nothing happens.
        assert!(init.step(SessionEvent::Tick(Instant::now())).is_empty());

        let after = Instant::now() + config().session_ttl + Duration::from_secs(1);
        let outputs = init.step(SessionEvent::Tick(after));
        assert_eq!(init.state(), SessionState::Aborted);
        assert_eq!(init.abort_reason(), Some(AbortReason::Ttl));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Send(Message::SessionAbort { .. }))));
    }

    #[test]
    fn test_deferred_keys_are_pulled() {
        let keys: Vec<(u128, u64)> = (0..10u128).map(|i| (i, 1)).collect();
        let (mut init, _) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &keys, &[]);
        init.step(SessionEvent::Start);

        // A locked local entry defers; the pull goes out when the round ends.
        init.step(SessionEvent::Resolved {
            key: 3,
            outcome: Resolution::Deferred,
        });
        // Echo arrives (empty responder), ending the only part.
        let echo = BloomFilter::with_seed(1, 0.01, 1).to_parts();
        let outputs = init.step(SessionEvent::Summary(SummaryIn::Bloom {
            interval: Interval::arc(0, 1000),
            filter: echo,
        }));
        assert!(outputs.iter().any(|o| matches!(
            o,
            SessionOutput::Send(Message::ResolveRegen { key: 3, .. })
        )));
        assert_eq!(init.state(), SessionState::WaitResolve);
        assert_eq!(init.outstanding(), 1);

        // The redelivery lands and the session closes.
        let outputs = init.step(SessionEvent::Resolved {
            key: 3,
            outcome: Resolution::Updated,
        });
        assert_eq!(init.state(), SessionState::Done);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Send(Message::SessionDone { .. }))));
    }

    #[test]
    fn test_terminal_sessions_ignore_events() {
        let (mut init, _) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &[], &[]);
        init.step(SessionEvent::Start);
        init.step(SessionEvent::PeerAbort(AbortReason::Shutdown));
        assert_eq!(init.state(), SessionState::Aborted);
        assert!(init.step(SessionEvent::Start).is_empty());
        assert!(init
            .step(SessionEvent::Tick(Instant::now()))
            .is_empty());
    }

    #[test]
    fn test_mismatched_summary_kind_fails() {
        let (_, mut resp) = new_pair(ReconMethod::Bloom, Interval::arc(0, 1000), &[], &[]);
        let outputs = resp.step(SessionEvent::Summary(SummaryIn::Merkle {
            level: 0,
            digests: Vec::new(),
        }));
        assert_eq!(resp.state(), SessionState::Failed);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, SessionOutput::Send(Message::SessionAbort { .. }))));
    }
}
