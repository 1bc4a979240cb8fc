//! Consensus RPC message types.

use bytes::Bytes;
use beehive_core::{LogIndex, NodeId, TermId};

use crate::LogEntry;

/// Messages exchanged between members of one consensus group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Request vote from candidate to other members.
    RequestVote(RequestVoteRequest),
    /// Response to a vote request.
    RequestVoteResponse(RequestVoteResponse),
    /// Append entries from leader to followers (also used as heartbeat).
    AppendEntries(AppendEntriesRequest),
    /// Response to append entries.
    AppendEntriesResponse(AppendEntriesResponse),
    /// Leadership transfer: tells the target to start an election now.
    TimeoutNow(TimeoutNowRequest),
}

impl Message {
    /// Returns the source node of this message.
    #[must_use]
    pub const fn from(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.candidate_id,
            Self::RequestVoteResponse(r) => r.from,
            Self::AppendEntries(r) => r.leader_id,
            Self::AppendEntriesResponse(r) => r.from,
            Self::TimeoutNow(r) => r.from,
        }
    }

    /// Returns the destination node of this message.
    #[must_use]
    pub const fn to(&self) -> NodeId {
        match self {
            Self::RequestVote(r) => r.to,
            Self::RequestVoteResponse(r) => r.to,
            Self::AppendEntries(r) => r.to,
            Self::AppendEntriesResponse(r) => r.to,
            Self::TimeoutNow(r) => r.to,
        }
    }

    /// Returns the term carried by this message.
    #[must_use]
    pub const fn term(&self) -> TermId {
        match self {
            Self::RequestVote(r) => r.term,
            Self::RequestVoteResponse(r) => r.term,
            Self::AppendEntries(r) => r.term,
            Self::AppendEntriesResponse(r) => r.term,
            Self::TimeoutNow(r) => r.term,
        }
    }
}

/// `RequestVote` RPC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: TermId,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Target member.
    pub to: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: TermId,
}

impl RequestVoteRequest {
    /// Creates a new `RequestVote` request.
    #[must_use]
    pub const fn new(
        term: TermId,
        candidate_id: NodeId,
        to: NodeId,
        last_log_index: LogIndex,
        last_log_term: TermId,
    ) -> Self {
        Self {
            term,
            candidate_id,
            to,
            last_log_index,
            last_log_term,
        }
    }
}

/// `RequestVote` RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: TermId,
    /// Sender of this response.
    pub from: NodeId,
    /// Candidate that requested the vote.
    pub to: NodeId,
    /// True if the vote was granted.
    pub vote_granted: bool,
}

impl RequestVoteResponse {
    /// Creates a new `RequestVote` response.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId, vote_granted: bool) -> Self {
        Self {
            term,
            from,
            to,
            vote_granted,
        }
    }
}

/// `AppendEntries` RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: TermId,
    /// Leader sending this request.
    pub leader_id: NodeId,
    /// Target follower.
    pub to: NodeId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the `prev_log_index` entry.
    pub prev_log_term: TermId,
    /// Entries to store (empty for heartbeat).
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Creates a new `AppendEntries` request.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub const fn new(
        term: TermId,
        leader_id: NodeId,
        to: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: TermId,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> Self {
        Self {
            term,
            leader_id,
            to,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    /// Returns true if this is a heartbeat (no entries).
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `AppendEntries` RPC response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: TermId,
    /// Sender of this response.
    pub from: NodeId,
    /// Leader that sent the request.
    pub to: NodeId,
    /// True if the follower matched `prev_log_index`/`prev_log_term`.
    pub success: bool,
    /// The follower's last log index (for fast backup).
    pub match_index: LogIndex,
}

impl AppendEntriesResponse {
    /// Creates a new `AppendEntries` response.
    #[must_use]
    pub const fn new(
        term: TermId,
        from: NodeId,
        to: NodeId,
        success: bool,
        match_index: LogIndex,
    ) -> Self {
        Self {
            term,
            from,
            to,
            success,
            match_index,
        }
    }
}

/// `TimeoutNow` request for leadership transfer.
///
/// Sent by a leader to the chosen successor, which starts an election
/// immediately without waiting for its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutNowRequest {
    /// The leader's current term.
    pub term: TermId,
    /// The leader initiating the transfer.
    pub from: NodeId,
    /// The target follower that should take over.
    pub to: NodeId,
}

impl TimeoutNowRequest {
    /// Creates a new `TimeoutNow` request.
    #[must_use]
    pub const fn new(term: TermId, from: NodeId, to: NodeId) -> Self {
        Self { term, from, to }
    }
}

/// A proposal submitted to the group leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// The command data to replicate.
    pub data: Bytes,
}

impl Proposal {
    /// Creates a new proposal.
    #[must_use]
    pub const fn new(data: Bytes) -> Self {
        Self { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let req = RequestVoteRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
        );
        let msg = Message::RequestVote(req);

        assert_eq!(msg.from(), NodeId::new(1));
        assert_eq!(msg.to(), NodeId::new(2));
        assert_eq!(msg.term(), TermId::new(1));
    }

    #[test]
    fn test_heartbeat_detection() {
        let hb = AppendEntriesRequest::new(
            TermId::new(1),
            NodeId::new(1),
            NodeId::new(2),
            LogIndex::new(0),
            TermId::new(0),
            Vec::new(),
            LogIndex::new(0),
        );
        assert!(hb.is_heartbeat());
    }
}
