//! Consensus and storage core of one replica.
//!
//! [`ReplicaNode`] owns the whole per-node state: role, term, the replicated
//! log, the applied key-value map, and this node's view of the cluster. It is
//! a pure state machine. Callers feed it messages, proposals, and timer
//! expirations; it accumulates outbound messages and newly applied entries,
//! which the async shell drains through [`ReplicaNode::poll_effects`] and
//! turns into network sends, log lines, and timer updates. Nothing in this
//! module performs I/O, which is what lets the tests below drive whole
//! clusters deterministically in memory.
//!
//! The safety rules are the classic leader-based ones: one vote per term,
//! votes refused to candidates with stale logs, a follower suffix that
//! disagrees with the leader is truncated (never below the commit
//! watermark), and the leader only counts replication of entries from its
//! own term toward the watermark.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::time::{Duration, Instant};

use crate::error::{LogError, StoreError};
use crate::log::{LogEntry, LogStore};
use crate::message::Message;
use crate::store::KvStore;
use crate::types::{CausalToken, LogIndex, NodeId, ReadOutcome, Role, Term, WriteConcern};
use crate::view::{ClusterView, MemberSummary};

/// A message and the member it is addressed to.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: NodeId,
    pub message: Message,
}

/// Everything a node wants done since the last drain.
#[derive(Debug, Default)]
pub struct EffectsBundle {
    /// Messages to put on the wire.
    pub outbound: Vec<Outbound>,
    /// Entries that crossed the commit watermark and were applied, in order.
    pub applied: Vec<LogEntry>,
    /// Leader commit watermarks learned from `CommitInfo` answers, for
    /// pending majority reads.
    pub leader_commits: Vec<LogIndex>,
    /// The election timer must be re-armed (a leader was heard, a vote was
    /// cast, or this node's own role changed).
    pub reset_election_timer: bool,
}

/// One member's consensus state machine plus its log and applied store.
pub struct ReplicaNode {
    id: NodeId,
    term: Term,
    role: Role,
    voted_for: Option<NodeId>,
    votes: BTreeSet<NodeId>,
    log: LogStore,
    store: KvStore,
    view: ClusterView,
    /// Leader bookkeeping: next entry to send each peer.
    next_index: BTreeMap<NodeId, LogIndex>,
    /// Leader bookkeeping: highest index known replicated on each peer.
    match_index: BTreeMap<NodeId, LogIndex>,
    peers: Vec<NodeId>,
    outbound: Vec<Outbound>,
    applied: Vec<LogEntry>,
    leader_commits: Vec<LogIndex>,
    reset_election_timer: bool,
}

impl ReplicaNode {
    /// Creates a follower at term 0 with an empty in-memory log.
    ///
    /// `members` is the full cluster membership including this node;
    /// `offline_after` is the silence threshold for status reporting.
    pub fn new(id: NodeId, members: &[NodeId], offline_after: Duration) -> Self {
        let peers = members.iter().copied().filter(|&m| m != id).collect();
        Self {
            id,
            term: 0,
            role: Role::Follower,
            voted_for: None,
            votes: BTreeSet::new(),
            log: LogStore::in_memory(),
            store: KvStore::new(),
            view: ClusterView::new(id, members, offline_after),
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            peers,
            outbound: Vec::new(),
            applied: Vec::new(),
            leader_commits: Vec::new(),
            reset_election_timer: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.log.commit_index()
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }

    /// The leader this node currently believes in, itself included.
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.view.leader()
    }

    /// Copy of the applied key-value map.
    pub fn store_snapshot(&self) -> BTreeMap<String, String> {
        self.store.snapshot()
    }

    /// Per-member status lines from this node's view.
    pub fn member_summaries(&self, now: Instant) -> Vec<MemberSummary> {
        self.view.snapshot(now)
    }

    /// Takes the accumulated effects, or `None` when there is nothing to do.
    pub fn poll_effects(&mut self) -> Option<EffectsBundle> {
        if self.outbound.is_empty()
            && self.applied.is_empty()
            && self.leader_commits.is_empty()
            && !self.reset_election_timer
        {
            return None;
        }
        Some(EffectsBundle {
            outbound: std::mem::take(&mut self.outbound),
            applied: std::mem::take(&mut self.applied),
            leader_commits: std::mem::take(&mut self.leader_commits),
            reset_election_timer: std::mem::replace(&mut self.reset_election_timer, false),
        })
    }

    /// Starts an election: bumps the term, votes for itself, and asks every
    /// peer for a vote. A single-node cluster becomes leader on the spot.
    ///
    /// Called when the election timer fires and also by the explicit
    /// campaign operation; a leader campaigning deposes itself into a fresh
    /// candidacy at the next term.
    pub fn start_election(&mut self, now: Instant) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id);
        self.votes.clear();
        self.votes.insert(self.id);
        self.view.set_leader(None);
        self.view.record_self(Role::Candidate, self.term, now);
        self.reset_election_timer = true;

        if self.votes.len() >= self.view.majority() {
            self.become_leader(now);
            return;
        }

        let last_log_index = self.log.last_index();
        let last_log_term = self.log.last_term();
        for &peer in &self.peers {
            self.outbound.push(Outbound {
                to: peer,
                message: Message::VoteRequest {
                    term: self.term,
                    candidate_id: self.id,
                    last_log_index,
                    last_log_term,
                },
            });
        }
    }

    /// Leader tick: sends `AppendEntries` to every peer carrying whatever
    /// suffix that peer still needs, empty for an up-to-date peer. This is
    /// both the heartbeat and the retry path for lost replication traffic.
    pub fn heartbeat(&mut self, now: Instant) {
        if self.role != Role::Leader {
            return;
        }
        self.view.record_self(Role::Leader, self.term, now);
        self.broadcast_entries();
    }

    /// Feeds one peer message through the state machine.
    pub fn handle_message(&mut self, msg: Message, now: Instant) {
        self.view.observe(msg.sender(), msg.term(), msg.role_hint(), now);
        if msg.term() > self.term {
            self.step_down(msg.term(), now);
        }
        match msg {
            Message::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_vote_request(term, candidate_id, last_log_index, last_log_term),
            Message::VoteResponse { term, from, granted } => {
                self.handle_vote_response(term, from, granted, now)
            }
            Message::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
                now,
            ),
            Message::AppendResponse {
                term,
                from,
                success,
                match_index,
            } => self.handle_append_response(term, from, success, match_index),
            Message::CommitQuery { from, .. } => self.handle_commit_query(from),
            Message::CommitInfo { term, commit_index, .. } => {
                // Watermarks from deposed leaders are not bounds.
                if term == self.term {
                    self.leader_commits.push(commit_index);
                }
            }
        }
    }

    /// Accepts a client write. Leader only.
    ///
    /// On success the entry is persisted locally and replication to every
    /// peer is queued; the returned index is what the caller's write concern
    /// is then measured against.
    pub fn propose(
        &mut self,
        key: String,
        value: String,
        causal_token: Option<CausalToken>,
    ) -> Result<LogIndex, StoreError> {
        if self.role != Role::Leader {
            return Err(StoreError::NotLeader {
                hint: self.view.leader(),
            });
        }
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.term,
            key,
            value,
            causal_token,
        };
        let index = match self.log.append(entry) {
            Ok(index) => index,
            Err(LogError::Persist(err)) => return Err(StoreError::Persist(err)),
            // A leader appends at its own term onto its own tail, so the
            // log's ordering checks cannot fire here.
            Err(err) => return Err(StoreError::Persist(io::Error::other(err.to_string()))),
        };
        self.try_advance_commit();
        self.broadcast_entries();
        Ok(index)
    }

    /// Whether the write at `index` (created in `term`) has reached the
    /// given concern on this leader.
    ///
    /// Reports `false` once another entry occupies the index, which the
    /// caller distinguishes via the term and role checks it makes anyway.
    pub fn write_concern_met(&self, index: LogIndex, term: Term, concern: WriteConcern) -> bool {
        if self.log.term_at(index) != Some(term) {
            return false;
        }
        match concern {
            WriteConcern::One => true,
            WriteConcern::Majority => self.log.commit_index() >= index,
            WriteConcern::All => {
                self.log.commit_index() >= index
                    && self
                        .peers
                        .iter()
                        .all(|peer| self.match_index.get(peer).is_some_and(|&m| m >= index))
            }
        }
    }

    /// Newest local entry for `key`, committed or not.
    pub fn read_local(&self, key: &str) -> ReadOutcome {
        match self.log.latest_for_key(key) {
            Some(entry) => ReadOutcome {
                value: Some(entry.value.clone()),
                token: entry.index,
            },
            None => ReadOutcome {
                value: None,
                token: self.log.last_index(),
            },
        }
    }

    /// Newest committed value for `key`, served from the applied map.
    pub fn read_committed(&self, key: &str) -> ReadOutcome {
        match self.log.latest_committed_for_key(key) {
            Some(entry) => ReadOutcome {
                value: self.store.get(key),
                token: entry.index,
            },
            None => ReadOutcome {
                value: None,
                token: self.log.commit_index(),
            },
        }
    }

    fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    ) {
        // A candidate whose log is behind ours must not win while our extra
        // entries might be majority-replicated.
        let up_to_date = last_log_term > self.log.last_term()
            || (last_log_term == self.log.last_term() && last_log_index >= self.log.last_index());
        let granted = term == self.term
            && up_to_date
            && self.voted_for.map_or(true, |v| v == candidate_id);
        if granted {
            self.voted_for = Some(candidate_id);
            self.reset_election_timer = true;
        }
        self.outbound.push(Outbound {
            to: candidate_id,
            message: Message::VoteResponse {
                term: self.term,
                from: self.id,
                granted,
            },
        });
    }

    fn handle_vote_response(&mut self, term: Term, from: NodeId, granted: bool, now: Instant) {
        if self.role != Role::Candidate || term != self.term || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.view.majority() {
            self.become_leader(now);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
        now: Instant,
    ) {
        if term < self.term {
            self.respond_append(leader_id, false, 0);
            return;
        }

        // Equal term: a candidate yields to the elected leader, and a
        // follower refreshes its election timer.
        if self.role != Role::Follower {
            self.role = Role::Follower;
            self.votes.clear();
        }
        self.view.set_leader(Some(leader_id));
        self.view.record_self(Role::Follower, self.term, now);
        self.reset_election_timer = true;

        if self.log.term_at(prev_log_index) != Some(prev_log_term) {
            // Our log disagrees at the attach point; the leader will back up
            // and retry from earlier.
            self.respond_append(leader_id, false, 0);
            return;
        }

        let mut last_new = prev_log_index;
        for entry in entries {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => {
                    // Already have it, a retransmission.
                    last_new = entry.index;
                    continue;
                }
                Some(_) => {
                    // Divergent suffix from a deposed leader; drop it. Only a
                    // malformed index-0 entry can land here with nothing to
                    // drop, and append rejects it right after.
                    if self.log.truncate_after(entry.index.saturating_sub(1)).is_err() {
                        self.respond_append(leader_id, false, 0);
                        return;
                    }
                }
                None => {}
            }
            let index = entry.index;
            if self.log.append(entry).is_err() {
                self.respond_append(leader_id, false, 0);
                return;
            }
            last_new = index;
        }

        if leader_commit > self.log.commit_index() {
            self.apply_up_to(leader_commit);
        }
        self.respond_append(leader_id, true, last_new);
    }

    fn handle_append_response(
        &mut self,
        term: Term,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
    ) {
        if self.role != Role::Leader || term != self.term {
            return;
        }
        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            if match_index > *matched {
                *matched = match_index;
            }
            self.next_index.insert(from, match_index + 1);
            self.try_advance_commit();
        } else {
            let next = self.next_index.entry(from).or_insert(1);
            *next = next.saturating_sub(1).max(1);
            self.replicate_to(from);
        }
    }

    fn handle_commit_query(&mut self, from: NodeId) {
        if self.role != Role::Leader {
            return;
        }
        self.outbound.push(Outbound {
            to: from,
            message: Message::CommitInfo {
                term: self.term,
                from: self.id,
                commit_index: self.log.commit_index(),
            },
        });
    }

    fn respond_append(&mut self, to: NodeId, success: bool, match_index: LogIndex) {
        self.outbound.push(Outbound {
            to,
            message: Message::AppendResponse {
                term: self.term,
                from: self.id,
                success,
                match_index,
            },
        });
    }

    fn become_leader(&mut self, now: Instant) {
        self.role = Role::Leader;
        self.view.set_leader(Some(self.id));
        self.view.record_self(Role::Leader, self.term, now);
        let next = self.log.last_index() + 1;
        for &peer in &self.peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        self.reset_election_timer = true;
        self.broadcast_entries();
    }

    fn step_down(&mut self, term: Term, now: Instant) {
        self.term = term;
        self.role = Role::Follower;
        self.voted_for = None;
        self.votes.clear();
        self.view.set_leader(None);
        self.view.record_self(Role::Follower, term, now);
        self.reset_election_timer = true;
    }

    fn broadcast_entries(&mut self) {
        let peers = self.peers.clone();
        for peer in peers {
            self.replicate_to(peer);
        }
    }

    fn replicate_to(&mut self, peer: NodeId) {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);
        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self.log.entries_from(next).to_vec();
        self.outbound.push(Outbound {
            to: peer,
            message: Message::AppendEntries {
                term: self.term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
            },
        });
    }

    /// Advances the watermark to the highest index replicated on a strict
    /// majority, counting only entries from the current term.
    fn try_advance_commit(&mut self) {
        let mut candidate = self.log.last_index();
        while candidate > self.log.commit_index() {
            let replicas =
                1 + self.match_index.values().filter(|&&m| m >= candidate).count();
            if replicas >= self.view.majority() && self.log.term_at(candidate) == Some(self.term) {
                self.apply_up_to(candidate);
                break;
            }
            candidate -= 1;
        }
    }

    fn apply_up_to(&mut self, to: LogIndex) {
        let newly = self.log.advance_commit(to);
        for entry in newly {
            self.store.put(entry.key.clone(), entry.value.clone());
            self.applied.push(entry);
        }
    }
}
