//! Beehive Raft - consensus engine for Beehive's replicated groups.
//!
//! Every replicated piece of Beehive state — the cluster-wide cell registry
//! and each bee colony — rides on one consensus group from this crate. The
//! engine is a pure state machine: inputs are ticks, peer messages, and
//! proposals; outputs are messages to send and committed entries to apply.
//! No I/O happens here, which keeps every group deterministic and testable
//! without a network.
//!
//! # Design Principles
//!
//! - **Correctness first**: standard single-decree-per-index Raft
//! - **Deterministic**: election jitter comes from a per-group seed
//! - **Tick-based**: one `tick()` call drives timeouts for a whole node
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod log;
mod message;
pub mod multi;
mod snapshot;
mod state;

pub use config::RaftConfig;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, Proposal, RequestVoteRequest,
    RequestVoteResponse, TimeoutNowRequest,
};
pub use multi::{GroupMessage, MultiRaft, MultiRaftError, MultiRaftOutput};
pub use snapshot::{Snapshot, SnapshotError};
pub use state::{RaftNode, RaftOutput, RaftRole};

/// Raft configuration limits.
pub mod limits {
    /// Maximum number of nodes in one consensus group.
    pub const GROUP_SIZE_MAX: usize = 7;

    /// Maximum number of entries shipped in one `AppendEntries` request.
    pub const APPEND_ENTRIES_BATCH_MAX: usize = 1000;

    /// Default election tick (ticks before an election timeout fires).
    ///
    /// The effective timeout is randomized in \[`election_tick`,
    /// 2 * `election_tick`). With a 100ms tick this gives 1-2s.
    pub const ELECTION_TICK_DEFAULT: u32 = 10;

    /// Default heartbeat tick (ticks between leader heartbeats).
    pub const HEARTBEAT_TICK_DEFAULT: u32 = 1;
}
