//! Single-group consensus state machine.
//!
//! `RaftNode` is pure: it consumes ticks, peer messages, and proposals, and
//! produces output actions. The caller owns all I/O, which is what makes a
//! whole node of groups drivable from one deterministic loop.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use beehive_core::{LogIndex, NodeId, TermId};

use crate::config::RaftConfig;
use crate::limits::APPEND_ENTRIES_BATCH_MAX;
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, Proposal, RequestVoteRequest,
    RequestVoteResponse, TimeoutNowRequest,
};
use crate::snapshot::Snapshot;

/// The role a member currently plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaftRole {
    /// Passive; responds to RPCs and waits out its election timer.
    #[default]
    Follower,
    /// Actively seeking votes.
    Candidate,
    /// Handles proposals and replicates the log.
    Leader,
}

/// Output actions from the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftOutput {
    /// Send a message to another member.
    SendMessage(Message),
    /// A log entry committed and can be applied.
    CommitEntry {
        /// Log index of the committed entry.
        index: LogIndex,
        /// Term the entry was created in.
        term: TermId,
        /// The committed data.
        data: Bytes,
    },
    /// This node became leader.
    BecameLeader {
        /// The term of the new leadership.
        term: TermId,
    },
    /// This node stepped down from leadership.
    SteppedDown,
}

/// Deterministic xorshift for election jitter.
///
/// Consensus must not depend on ambient randomness, so each group derives
/// its timeouts from a seed the caller controls.
#[derive(Debug, Clone, Copy)]
struct Jitter(u64);

impl Jitter {
    const fn new(seed: u64) -> Self {
        // A zero state would stay zero forever.
        Self(seed | 1)
    }

    fn next(&mut self, span: u32) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        (x % u64::from(span.max(1))) as u32
    }
}

/// A consensus group member.
#[derive(Debug)]
pub struct RaftNode {
    /// Configuration, including current membership.
    config: RaftConfig,

    // Persistent state (mirrored to the WAL by the caller).
    /// Current term.
    current_term: TermId,
    /// Who we voted for in the current term.
    voted_for: Option<NodeId>,
    /// The log.
    log: RaftLog,

    // Volatile state.
    /// Current role.
    role: RaftRole,
    /// Highest index known committed.
    commit_index: LogIndex,
    /// Highest index handed to the applier.
    last_applied: LogIndex,
    /// Current leader, if known.
    leader_id: Option<NodeId>,

    // Leader state, reinitialized on election.
    /// Next log index to send to each peer.
    next_index: HashMap<NodeId, LogIndex>,
    /// Highest index known replicated on each peer.
    match_index: HashMap<NodeId, LogIndex>,
    /// Transfer target awaiting `TimeoutNow`, if a transfer is in flight.
    transfer_target: Option<NodeId>,

    // Candidate state.
    /// Votes received in the current election.
    votes_received: HashSet<NodeId>,

    // Tick state.
    /// Ticks since the last leader contact or election start.
    election_elapsed: u32,
    /// Ticks since the last heartbeat broadcast.
    heartbeat_elapsed: u32,
    /// Randomized election threshold in \[election_tick, 2*election_tick).
    randomized_election_tick: u32,
    /// Jitter source for the threshold.
    jitter: Jitter,
}

impl RaftNode {
    /// Creates a new member in the follower role.
    #[must_use]
    pub fn new(config: RaftConfig) -> Self {
        let mut jitter = Jitter::new(config.jitter_seed);
        let randomized = config.election_tick + jitter.next(config.election_tick);

        let mut node = Self {
            current_term: TermId::new(0),
            voted_for: None,
            log: RaftLog::new(),
            role: RaftRole::Follower,
            commit_index: LogIndex::new(0),
            last_applied: LogIndex::new(0),
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            transfer_target: None,
            votes_received: HashSet::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_tick: randomized,
            jitter,
            config,
        };
        node.reset_peer_tracking();
        node
    }

    /// Returns this node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the current term.
    #[must_use]
    pub const fn current_term(&self) -> TermId {
        self.current_term
    }

    /// Returns the current role.
    #[must_use]
    pub const fn role(&self) -> RaftRole {
        self.role
    }

    /// Returns true if this node leads the group.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    /// Returns the current leader if known.
    #[must_use]
    pub const fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    /// Returns the commit index.
    #[must_use]
    pub const fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Returns the last applied index.
    #[must_use]
    pub const fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Returns a reference to the log.
    #[must_use]
    pub const fn log(&self) -> &RaftLog {
        &self.log
    }

    /// Returns the current members of the group.
    #[must_use]
    pub fn members(&self) -> &[NodeId] {
        &self.config.members
    }

    /// Replaces the group membership.
    ///
    /// Membership for Beehive groups is decided by a command committed in
    /// the cluster group, so the change arrives here already agreed on.
    ///
    /// # Panics
    /// Panics if this node is not in the new membership; removing self goes
    /// through group removal instead.
    pub fn set_members(&mut self, members: Vec<NodeId>) {
        assert!(
            members.contains(&self.config.node_id),
            "cannot reconfigure self out of the group"
        );
        self.config.members = members;
        self.reset_peer_tracking();
    }

    /// Advances the logical clock by one tick.
    pub fn tick(&mut self) -> Vec<RaftOutput> {
        match self.role {
            RaftRole::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.config.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    return self.broadcast_append_entries();
                }
                Vec::new()
            }
            RaftRole::Follower | RaftRole::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_tick {
                    return self.start_election();
                }
                Vec::new()
            }
        }
    }

    /// Submits a proposal (leader only).
    ///
    /// Returns `None` if this node is not the leader, or while a leadership
    /// transfer is in flight.
    pub fn propose(&mut self, proposal: Proposal) -> Option<Vec<RaftOutput>> {
        if self.role != RaftRole::Leader || self.transfer_target.is_some() {
            return None;
        }

        debug_assert!(self.leader_id == Some(self.config.node_id));

        let index = LogIndex::new(self.log.last_index().get() + 1);
        let entry = LogEntry::new(self.current_term, index, proposal.data);
        self.log.append(entry);

        let mut outputs = self.broadcast_append_entries();
        // A single-member group commits immediately.
        outputs.extend(self.try_advance_commit_index());
        Some(outputs)
    }

    /// Begins transferring leadership to `target`.
    ///
    /// The leader stops accepting proposals, brings the target up to date,
    /// then tells it to time out immediately. Returns `None` if not leader
    /// or the target is not a member.
    pub fn transfer_leadership(&mut self, target: NodeId) -> Option<Vec<RaftOutput>> {
        if self.role != RaftRole::Leader || !self.config.members.contains(&target) {
            return None;
        }
        if target == self.config.node_id {
            return Some(Vec::new());
        }

        self.transfer_target = Some(target);

        let mut outputs = Vec::new();
        let caught_up = self
            .match_index
            .get(&target)
            .is_some_and(|&m| m == self.log.last_index());

        if caught_up {
            outputs.push(RaftOutput::SendMessage(Message::TimeoutNow(
                TimeoutNowRequest::new(self.current_term, self.config.node_id, target),
            )));
        } else {
            // Catch the target up first; TimeoutNow follows from the
            // append-entries response path once it matches.
            outputs.extend(self.send_append_entries(target));
        }
        Some(outputs)
    }

    /// Handles an incoming message.
    pub fn handle_message(&mut self, message: Message) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        // A newer term always demotes us first.
        let msg_term = message.term();
        if msg_term > self.current_term {
            let was_leader = self.role == RaftRole::Leader;
            self.step_down(msg_term);
            if was_leader {
                outputs.push(RaftOutput::SteppedDown);
            }
        }

        outputs.extend(match message {
            Message::RequestVote(req) => self.handle_request_vote(&req),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(&resp),
            Message::AppendEntries(req) => self.handle_append_entries(req),
            Message::AppendEntriesResponse(resp) => self.handle_append_entries_response(&resp),
            Message::TimeoutNow(req) => self.handle_timeout_now(&req),
        });
        outputs
    }

    /// Installs a snapshot, resetting log and applied state below it.
    pub fn install_snapshot(&mut self, snapshot: &Snapshot) {
        if snapshot.last_index <= self.commit_index {
            return;
        }
        self.log.reset_to_snapshot(snapshot.last_index, snapshot.last_term);
        self.commit_index = snapshot.last_index;
        self.last_applied = snapshot.last_index;
    }

    /// Compacts the log through `index` after the caller snapshotted it.
    pub fn compact_log(&mut self, index: LogIndex) {
        let term = self.log.term_at(index);
        self.log.compact(index, term);
    }

    fn reset_peer_tracking(&mut self) {
        let next = LogIndex::new(self.log.last_index().get() + 1);
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.config.peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, LogIndex::new(0));
        }
    }

    fn reset_election_timer(&mut self) {
        self.election_elapsed = 0;
        self.randomized_election_tick =
            self.config.election_tick + self.jitter.next(self.config.election_tick);
    }

    fn step_down(&mut self, new_term: TermId) {
        let was_leader = self.role == RaftRole::Leader;
        self.current_term = new_term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.votes_received.clear();
        self.transfer_target = None;
        self.reset_election_timer();
        if was_leader {
            self.leader_id = None;
        }
    }

    fn start_election(&mut self) -> Vec<RaftOutput> {
        let prev_term = self.current_term;

        self.current_term = prev_term.next();
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.config.node_id);
        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);
        self.leader_id = None;
        self.reset_election_timer();

        debug_assert!(self.current_term.get() == prev_term.get() + 1);

        let mut outputs = Vec::new();
        for peer in self.config.peers() {
            let request = RequestVoteRequest::new(
                self.current_term,
                self.config.node_id,
                peer,
                self.log.last_index(),
                self.log.last_term(),
            );
            outputs.push(RaftOutput::SendMessage(Message::RequestVote(request)));
        }

        // Single-member groups elect themselves on the spot.
        if self.votes_received.len() >= self.config.quorum_size() {
            outputs.extend(self.become_leader());
        }

        debug_assert!(matches!(self.role, RaftRole::Candidate | RaftRole::Leader));
        outputs
    }

    fn handle_request_vote(&mut self, req: &RequestVoteRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        let grant = req.term >= self.current_term
            && self.voted_for.map_or(true, |id| id == req.candidate_id)
            && self.log.is_up_to_date(req.last_log_term, req.last_log_index);

        if grant {
            self.voted_for = Some(req.candidate_id);
            self.reset_election_timer();
        }

        outputs.push(RaftOutput::SendMessage(Message::RequestVoteResponse(
            RequestVoteResponse::new(self.current_term, self.config.node_id, req.candidate_id, grant),
        )));
        outputs
    }

    fn handle_request_vote_response(&mut self, resp: &RequestVoteResponse) -> Vec<RaftOutput> {
        if self.role != RaftRole::Candidate || resp.term != self.current_term {
            return Vec::new();
        }

        let mut outputs = Vec::new();
        if resp.vote_granted {
            self.votes_received.insert(resp.from);
            if self.votes_received.len() >= self.config.quorum_size() {
                outputs.extend(self.become_leader());
            }
        }
        outputs
    }

    fn become_leader(&mut self) -> Vec<RaftOutput> {
        debug_assert!(self.votes_received.len() >= self.config.quorum_size());

        self.role = RaftRole::Leader;
        self.leader_id = Some(self.config.node_id);
        self.transfer_target = None;
        self.heartbeat_elapsed = 0;
        self.reset_peer_tracking();

        let mut outputs = vec![RaftOutput::BecameLeader {
            term: self.current_term,
        }];
        outputs.extend(self.broadcast_append_entries());

        debug_assert!(self.is_leader());
        outputs
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();

        if req.term < self.current_term {
            outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
                AppendEntriesResponse::new(
                    self.current_term,
                    self.config.node_id,
                    req.leader_id,
                    false,
                    self.log.last_index(),
                ),
            )));
            return outputs;
        }

        if self.role == RaftRole::Candidate {
            self.role = RaftRole::Follower;
            self.votes_received.clear();
        }

        self.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        let log_ok = req.prev_log_index.get() == 0
            || req.prev_log_index.get() <= self.log.last_index().get()
                && self.log.term_at(req.prev_log_index) == req.prev_log_term;

        if !log_ok {
            outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
                AppendEntriesResponse::new(
                    self.current_term,
                    self.config.node_id,
                    req.leader_id,
                    false,
                    self.log.last_index(),
                ),
            )));
            return outputs;
        }

        if !req.entries.is_empty() {
            self.log.append_entries(req.entries);
        }

        if req.leader_commit > self.commit_index {
            let new_commit = std::cmp::min(req.leader_commit, self.log.last_index());
            outputs.extend(self.apply_committed_entries(new_commit));
        }

        outputs.push(RaftOutput::SendMessage(Message::AppendEntriesResponse(
            AppendEntriesResponse::new(
                self.current_term,
                self.config.node_id,
                req.leader_id,
                true,
                self.log.last_index(),
            ),
        )));
        outputs
    }

    fn handle_append_entries_response(&mut self, resp: &AppendEntriesResponse) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader || resp.term != self.current_term {
            return Vec::new();
        }

        let mut outputs = Vec::new();

        if resp.success {
            self.match_index.insert(resp.from, resp.match_index);
            self.next_index
                .insert(resp.from, LogIndex::new(resp.match_index.get() + 1));

            outputs.extend(self.try_advance_commit_index());

            // A transfer target that just caught up gets its TimeoutNow.
            if self.transfer_target == Some(resp.from)
                && resp.match_index == self.log.last_index()
            {
                outputs.push(RaftOutput::SendMessage(Message::TimeoutNow(
                    TimeoutNowRequest::new(self.current_term, self.config.node_id, resp.from),
                )));
            }
        } else {
            let next = self
                .next_index
                .get(&resp.from)
                .copied()
                .unwrap_or(LogIndex::new(1));
            if next.get() > 1 {
                // Fast backup: jump straight past the follower's log end.
                let backed = next.get().min(resp.match_index.get() + 1).max(1);
                self.next_index.insert(resp.from, LogIndex::new(backed));
            }
            outputs.extend(self.send_append_entries(resp.from));
        }

        outputs
    }

    fn handle_timeout_now(&mut self, req: &TimeoutNowRequest) -> Vec<RaftOutput> {
        if req.term < self.current_term || self.role == RaftRole::Leader {
            return Vec::new();
        }
        self.start_election()
    }

    fn broadcast_append_entries(&mut self) -> Vec<RaftOutput> {
        let mut outputs = Vec::new();
        for peer in self.config.peers() {
            outputs.extend(self.send_append_entries(peer));
        }
        outputs
    }

    fn send_append_entries(&self, peer: NodeId) -> Vec<RaftOutput> {
        let next_idx = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(1));
        let prev_idx = LogIndex::new(next_idx.get().saturating_sub(1));
        let prev_term = self.log.term_at(prev_idx);
        let entries = self.log.entries_from(next_idx, APPEND_ENTRIES_BATCH_MAX);

        vec![RaftOutput::SendMessage(Message::AppendEntries(
            AppendEntriesRequest::new(
                self.current_term,
                self.config.node_id,
                peer,
                prev_idx,
                prev_term,
                entries,
                self.commit_index,
            ),
        ))]
    }

    fn try_advance_commit_index(&mut self) -> Vec<RaftOutput> {
        if self.role != RaftRole::Leader {
            return Vec::new();
        }

        let prev_commit = self.commit_index;
        let mut outputs = Vec::new();

        for n in (self.commit_index.get() + 1)..=self.log.last_index().get() {
            let idx = LogIndex::new(n);

            // Only entries from the current term commit by counting
            // (the Raft safety rule); earlier terms ride along.
            if self.log.term_at(idx) != self.current_term {
                continue;
            }

            let mut count = 1; // leader holds its own entries
            for peer in self.config.peers() {
                if self.match_index.get(&peer).is_some_and(|&m| m >= idx) {
                    count += 1;
                }
            }

            if count >= self.config.quorum_size() {
                outputs.extend(self.apply_committed_entries(idx));
            }
        }

        debug_assert!(self.commit_index >= prev_commit);
        outputs
    }

    fn apply_committed_entries(&mut self, new_commit: LogIndex) -> Vec<RaftOutput> {
        debug_assert!(new_commit <= self.log.last_index());

        let mut outputs = Vec::new();
        if new_commit <= self.commit_index {
            return outputs;
        }
        self.commit_index = new_commit;

        while self.last_applied < self.commit_index {
            let idx = LogIndex::new(self.last_applied.get() + 1);
            if let Some(entry) = self.log.get(idx) {
                outputs.push(RaftOutput::CommitEntry {
                    index: idx,
                    term: entry.term,
                    data: entry.data.clone(),
                });
            }
            self.last_applied = idx;
        }

        debug_assert!(self.last_applied == self.commit_index);
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Vec<NodeId> {
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
    }

    fn node(id: u64, members: Vec<NodeId>) -> RaftNode {
        RaftNode::new(RaftConfig::new(NodeId::new(id), members).with_ticks(5, 1))
    }

    fn tick_until_election(node: &mut RaftNode) -> Vec<RaftOutput> {
        for _ in 0..20 {
            let outputs = node.tick();
            if !outputs.is_empty() {
                return outputs;
            }
        }
        panic!("no election within 20 ticks");
    }

    #[test]
    fn test_starts_as_follower() {
        let n = node(1, three());
        assert_eq!(n.role(), RaftRole::Follower);
        assert_eq!(n.current_term(), TermId::new(0));
        assert!(n.leader_id().is_none());
    }

    #[test]
    fn test_election_timeout_starts_election() {
        let mut n = node(1, three());
        let outputs = tick_until_election(&mut n);

        assert_eq!(n.role(), RaftRole::Candidate);
        assert_eq!(n.current_term(), TermId::new(1));

        let votes = outputs
            .iter()
            .filter(|o| matches!(o, RaftOutput::SendMessage(Message::RequestVote(_))))
            .count();
        assert_eq!(votes, 2);
    }

    #[test]
    fn test_single_member_self_elects() {
        let mut n = node(1, vec![NodeId::new(1)]);
        let outputs = tick_until_election(&mut n);

        assert!(n.is_leader());
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::BecameLeader { .. })));
    }

    #[test]
    fn test_vote_quorum_elects_leader() {
        let mut n = node(1, three());
        tick_until_election(&mut n);

        let outputs = n.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        )));

        assert!(n.is_leader());
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::BecameLeader { .. })));
    }

    #[test]
    fn test_vote_rejected_without_quorum() {
        let mut n = node(1, three());
        tick_until_election(&mut n);

        let outputs = n.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            false,
        )));

        assert_eq!(n.role(), RaftRole::Candidate);
        assert!(outputs.is_empty());
    }

    #[test]
    fn test_propose_commits_with_quorum_ack() {
        let mut n = node(1, three());
        tick_until_election(&mut n);
        n.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        )));

        let outputs = n.propose(Proposal::new(Bytes::from("cmd"))).unwrap();
        assert!(outputs
            .iter()
            .all(|o| !matches!(o, RaftOutput::CommitEntry { .. })));

        // One follower acking entry 1 gives quorum (2 of 3).
        let outputs = n.handle_message(Message::AppendEntriesResponse(
            AppendEntriesResponse::new(
                TermId::new(1),
                NodeId::new(2),
                NodeId::new(1),
                true,
                LogIndex::new(1),
            ),
        ));

        let committed: Vec<_> = outputs
            .iter()
            .filter_map(|o| match o {
                RaftOutput::CommitEntry { index, data, .. } => Some((*index, data.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(committed, vec![(LogIndex::new(1), Bytes::from("cmd"))]);
    }

    #[test]
    fn test_propose_rejected_when_not_leader() {
        let mut n = node(1, three());
        assert!(n.propose(Proposal::new(Bytes::from("x"))).is_none());
    }

    #[test]
    fn test_follower_appends_and_commits() {
        let mut n = node(2, three());

        let entry = LogEntry::new(TermId::new(1), LogIndex::new(1), Bytes::from("cmd"));
        let outputs = n.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
            vec![entry],
            LogIndex::new(1),
        )));

        assert_eq!(n.leader_id(), Some(NodeId::new(1)));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::CommitEntry { index, .. } if *index == LogIndex::new(1))));
        assert!(outputs.iter().any(|o| matches!(
            o,
            RaftOutput::SendMessage(Message::AppendEntriesResponse(r)) if r.success
        )));
    }

    #[test]
    fn test_follower_rejects_gap() {
        let mut n = node(2, three());

        let entry = LogEntry::new(TermId::new(1), LogIndex::new(5), Bytes::from("cmd"));
        let outputs = n.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(4),
            TermId::new(1),
            vec![entry],
            LogIndex::new(0),
        )));

        assert!(outputs.iter().any(|o| matches!(
            o,
            RaftOutput::SendMessage(Message::AppendEntriesResponse(r)) if !r.success
        )));
    }

    #[test]
    fn test_newer_term_steps_leader_down() {
        let mut n = node(1, vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        tick_until_election(&mut n);
        n.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        )));
        assert!(n.is_leader());

        let outputs = n.handle_message(Message::AppendEntries(AppendEntriesRequest::new(
            TermId::new(5),
            NodeId::new(3),
            NodeId::new(1),
            LogIndex::new(0),
            TermId::new(0),
            Vec::new(),
            LogIndex::new(0),
        )));

        assert_eq!(n.role(), RaftRole::Follower);
        assert_eq!(n.current_term(), TermId::new(5));
        assert!(outputs.contains(&RaftOutput::SteppedDown));
    }

    #[test]
    fn test_timeout_now_triggers_immediate_election() {
        let mut n = node(2, three());

        let outputs = n.handle_message(Message::TimeoutNow(TimeoutNowRequest::new(
            TermId::new(0),
            NodeId::new(1),
            NodeId::new(2),
        )));

        assert_eq!(n.role(), RaftRole::Candidate);
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::SendMessage(Message::RequestVote(_)))));
    }

    #[test]
    fn test_transfer_blocks_proposals() {
        let mut n = node(1, three());
        tick_until_election(&mut n);
        n.handle_message(Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(1),
            NodeId::new(2),
            NodeId::new(1),
            true,
        )));

        let outputs = n.transfer_leadership(NodeId::new(2)).unwrap();
        // Target not caught up yet: append entries go out first.
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::SendMessage(Message::AppendEntries(_)))));

        assert!(n.propose(Proposal::new(Bytes::from("x"))).is_none());

        // Target catches up: TimeoutNow follows.
        let outputs = n.handle_message(Message::AppendEntriesResponse(
            AppendEntriesResponse::new(
                TermId::new(1),
                NodeId::new(2),
                NodeId::new(1),
                true,
                n.log().last_index(),
            ),
        ));
        assert!(outputs
            .iter()
            .any(|o| matches!(o, RaftOutput::SendMessage(Message::TimeoutNow(_)))));
    }

    #[test]
    fn test_install_snapshot_advances_applied() {
        let mut n = node(2, three());
        let snap = Snapshot::new(LogIndex::new(10), TermId::new(3), Bytes::from("state"));

        n.install_snapshot(&snap);

        assert_eq!(n.commit_index(), LogIndex::new(10));
        assert_eq!(n.last_applied(), LogIndex::new(10));
        assert_eq!(n.log().last_index(), LogIndex::new(10));
    }

    #[test]
    fn test_set_members_grows_group() {
        let mut n = node(1, vec![NodeId::new(1)]);
        tick_until_election(&mut n);
        assert!(n.is_leader());

        n.set_members(vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
        assert_eq!(n.members().len(), 3);

        // Proposal now needs a quorum of 2, so nothing commits yet.
        let outputs = n.propose(Proposal::new(Bytes::from("cmd"))).unwrap();
        assert!(outputs
            .iter()
            .all(|o| !matches!(o, RaftOutput::CommitEntry { .. })));
    }
}
