//! Consensus group engine: the wrapper over the raw multi-group raft.
//!
//! Adapts the consensus engine to what the rest of the node needs:
//! per-group proposal, an ordered committed-entry stream (surfaced through
//! [`GroupOutput`]), leadership transfer, membership changes, and the
//! durability hooks. Committed entries of persistent groups are appended
//! to the group's log directory before they are surfaced, and snapshots
//! cut by the appliers compact both the raft log and the on-disk segments.
//!
//! Delivery to appliers is at-least-once; appliers are idempotent on the
//! entry index, so redelivery after a restart is harmless.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use bytes::Bytes;
use beehive_core::{GroupId, LogIndex, NodeId, TermId};
use beehive_raft::{
    GroupMessage, MultiRaft, MultiRaftError, MultiRaftOutput, RaftRole, Snapshot,
};
use beehive_wal::{EntryKind, SegmentConfig, SnapshotStore, Wal, WalError};
use tracing::{debug, info, warn};

use crate::error::RuntimeResult;

/// What a group engine pass produced.
#[derive(Debug)]
pub enum GroupOutput {
    /// Send batched consensus messages to a node.
    Send {
        /// Destination node.
        to: NodeId,
        /// The batch.
        messages: Vec<GroupMessage>,
    },
    /// An entry committed; apply it.
    Committed {
        /// The group.
        group: GroupId,
        /// Entry index.
        index: LogIndex,
        /// Entry term.
        term: TermId,
        /// Entry payload.
        data: Bytes,
    },
    /// This node now leads the group.
    BecameLeader {
        /// The group.
        group: GroupId,
        /// The term.
        term: TermId,
    },
    /// This node stopped leading the group.
    SteppedDown {
        /// The group.
        group: GroupId,
    },
}

/// State recovered for one group at startup.
#[derive(Debug)]
pub struct RecoveredGroup {
    /// The newest snapshot, if one was on disk.
    pub snapshot: Option<(u64, Bytes)>,
    /// Committed entries after the snapshot, in order:
    /// `(index, term, payload)`.
    pub entries: Vec<(u64, u64, Bytes)>,
}

impl RecoveredGroup {
    /// The index recovery ends at (0 if nothing was on disk).
    #[must_use]
    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map(|(index, _, _)| *index)
            .or(self.snapshot.as_ref().map(|(index, _)| *index))
            .unwrap_or(0)
    }
}

/// The per-node group engine.
pub struct GroupEngine {
    multi: MultiRaft,
    /// Base directory for persistent groups, if durability is on.
    data_dir: Option<PathBuf>,
    /// Open logs of persistent groups.
    wals: HashMap<GroupId, Wal>,
    /// Snapshot stores of persistent groups.
    snapshots: HashMap<GroupId, SnapshotStore>,
    /// Groups whose commits must be persisted.
    persistent: HashSet<GroupId>,
    /// Election/heartbeat tick thresholds for new groups.
    election_ticks: u32,
    heartbeat_ticks: u32,
}

impl GroupEngine {
    /// Creates an engine for this node.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        data_dir: Option<PathBuf>,
        election_ticks: u32,
        heartbeat_ticks: u32,
    ) -> Self {
        Self {
            multi: MultiRaft::new(node_id),
            data_dir,
            wals: HashMap::new(),
            snapshots: HashMap::new(),
            persistent: HashSet::new(),
            election_ticks,
            heartbeat_ticks,
        }
    }

    /// Returns this node's id.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.multi.node_id()
    }

    /// Returns true if the group exists on this node.
    #[must_use]
    pub fn has_group(&self, group: GroupId) -> bool {
        self.multi.has_group(group)
    }

    /// Returns `(role, term, leader)` for a group.
    #[must_use]
    pub fn status(&self, group: GroupId) -> Option<(RaftRole, TermId, Option<NodeId>)> {
        self.multi.group_status(group)
    }

    /// Returns true if this node leads the group.
    #[must_use]
    pub fn is_leader(&self, group: GroupId) -> bool {
        self.status(group)
            .is_some_and(|(role, _, _)| role == RaftRole::Leader)
    }

    /// Returns the group's commit index: a local read against state
    /// applied through this index is current as of that point in the log.
    #[must_use]
    pub fn read_index(&self, group: GroupId) -> Option<LogIndex> {
        self.multi.group(group).map(|node| node.commit_index())
    }

    /// Reads any persisted state for a group without creating it.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn recover_group(&mut self, group: GroupId, persistent: bool) -> RuntimeResult<RecoveredGroup> {
        let mut recovered = RecoveredGroup {
            snapshot: None,
            entries: Vec::new(),
        };
        if !persistent {
            return Ok(recovered);
        }
        let Some(dir) = self.group_dir(group) else {
            return Ok(recovered);
        };

        let store = SnapshotStore::open(&dir)?;
        recovered.snapshot = match store.load_latest()? {
            Some((index, raw)) => match Snapshot::decode(raw) {
                Ok(snapshot) => Some((index, snapshot.data)),
                Err(e) => {
                    warn!(%group, error = %e, "ignoring undecodable snapshot");
                    None
                }
            },
            None => None,
        };

        let wal = Wal::open(&dir, self.segment_config())?;
        let floor = recovered.snapshot.as_ref().map_or(0, |(index, _)| *index);
        for entry in wal.entries_from(floor + 1) {
            if entry.kind() == EntryKind::Command {
                recovered
                    .entries
                    .push((entry.index(), entry.term(), entry.payload.clone()));
            }
        }

        self.wals.insert(group, wal);
        self.snapshots.insert(group, store);
        Ok(recovered)
    }

    /// Creates a group, seeding its log position from recovery.
    ///
    /// # Errors
    /// Returns an error if the group already exists or membership is
    /// invalid.
    pub fn create_group(
        &mut self,
        group: GroupId,
        members: Vec<NodeId>,
        persistent: bool,
        recovered_through: u64,
        recovered_term: u64,
    ) -> RuntimeResult<()> {
        self.multi
            .create_group(group, members, self.election_ticks, self.heartbeat_ticks)?;
        if persistent {
            self.persistent.insert(group);
            if let Some(dir) = self.group_dir(group) {
                if !self.wals.contains_key(&group) {
                    self.wals.insert(group, Wal::open(&dir, self.segment_config())?);
                    self.snapshots.insert(group, SnapshotStore::open(&dir)?);
                }
            }
        }

        if recovered_through > 0 {
            // The applier already holds everything through this index; seed
            // the raft log so new proposals continue after it.
            let boundary = Snapshot::new(
                LogIndex::new(recovered_through),
                TermId::new(recovered_term),
                Bytes::new(),
            );
            self.multi.install_snapshot(group, &boundary)?;
        }

        info!(%group, persistent, recovered_through, "group created");
        Ok(())
    }

    /// Removes a group and forgets its storage handles.
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn remove_group(&mut self, group: GroupId) -> Result<(), MultiRaftError> {
        self.multi.remove_group(group)?;
        self.persistent.remove(&group);
        self.wals.remove(&group);
        self.snapshots.remove(&group);
        Ok(())
    }

    /// Replaces a group's membership.
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn set_members(&mut self, group: GroupId, members: Vec<NodeId>) -> Result<(), MultiRaftError> {
        self.multi.set_members(group, members)
    }

    /// Advances every group one tick.
    pub fn tick(&mut self) -> Vec<GroupOutput> {
        let outputs = self.multi.tick();
        self.convert(outputs)
    }

    /// Handles an inbound consensus batch.
    pub fn handle_messages(&mut self, messages: Vec<GroupMessage>) -> Vec<GroupOutput> {
        let outputs = self.multi.handle_messages(messages);
        self.convert(outputs)
    }

    /// Proposes an entry to a group this node leads.
    ///
    /// Returns the index the entry will commit at, plus any immediate
    /// outputs, or `None` if this node is not the leader.
    pub fn propose(&mut self, group: GroupId, data: Bytes) -> Option<(LogIndex, Vec<GroupOutput>)> {
        let index = self.multi.next_propose_index(group)?;
        let outputs = self.multi.propose(group, data)?;
        Some((index, self.convert(outputs)))
    }

    /// Begins leadership transfer for a group this node leads.
    pub fn transfer_leadership(&mut self, group: GroupId, target: NodeId) -> Vec<GroupOutput> {
        match self.multi.transfer_leadership(group, target) {
            Some(outputs) => self.convert(outputs),
            None => Vec::new(),
        }
    }

    /// Records an applier-cut snapshot: persists it, compacts the raft log
    /// and the on-disk segments below it.
    ///
    /// # Errors
    /// Returns an error on filesystem failure.
    pub fn record_snapshot(
        &mut self,
        group: GroupId,
        applied_index: u64,
        state: Bytes,
    ) -> RuntimeResult<()> {
        let term = self
            .status(group)
            .map_or(TermId::new(0), |(_, term, _)| term);
        let snapshot = Snapshot::new(LogIndex::new(applied_index), term, state);

        if let Some(store) = self.snapshots.get(&group) {
            store.save(applied_index, &snapshot.encode())?;
        }
        if let Some(wal) = self.wals.get_mut(&group) {
            wal.compact_below(applied_index)?;
        }
        let _ = self.multi.compact_log(group, LogIndex::new(applied_index));

        debug!(%group, applied_index, "snapshot recorded");
        Ok(())
    }

    /// Flushes group logs to disk. Called once per service tick rather
    /// than per entry.
    pub fn sync(&mut self) {
        for (group, wal) in &mut self.wals {
            if let Err(e) = wal.sync() {
                warn!(group = %group, error = %e, "log sync failed");
            }
        }
    }

    fn convert(&mut self, outputs: Vec<MultiRaftOutput>) -> Vec<GroupOutput> {
        let mut result = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                MultiRaftOutput::SendMessages { to, messages } => {
                    result.push(GroupOutput::Send { to, messages });
                }
                MultiRaftOutput::CommitEntry {
                    group_id,
                    index,
                    term,
                    data,
                } => {
                    self.persist_commit(group_id, index, term, &data);
                    result.push(GroupOutput::Committed {
                        group: group_id,
                        index,
                        term,
                        data,
                    });
                }
                MultiRaftOutput::BecameLeader { group_id, term } => {
                    result.push(GroupOutput::BecameLeader {
                        group: group_id,
                        term,
                    });
                }
                MultiRaftOutput::SteppedDown { group_id } => {
                    result.push(GroupOutput::SteppedDown { group: group_id });
                }
            }
        }
        result
    }

    fn persist_commit(&mut self, group: GroupId, index: LogIndex, term: TermId, data: &Bytes) {
        if !self.persistent.contains(&group) {
            return;
        }
        let Some(wal) = self.wals.get_mut(&group) else {
            return;
        };
        match wal.append(term.get(), index.get(), EntryKind::Command, data.clone()) {
            Ok(()) => {}
            Err(WalError::NonSequentialIndex { .. }) => {
                // Redelivery of an already durable entry after recovery.
                debug!(%group, index = index.get(), "skipping already persisted entry");
            }
            Err(e) => warn!(%group, error = %e, "failed to persist committed entry"),
        }
    }

    fn group_dir(&self, group: GroupId) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|base| base.join(format!("group-{:016x}", group.get())))
    }

    fn segment_config(&self) -> SegmentConfig {
        SegmentConfig::new().with_max_size(64 * 1024 * 1024)
    }
}

impl std::fmt::Debug for GroupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupEngine")
            .field("node_id", &self.multi.node_id())
            .field("groups", &self.multi.group_count())
            .field("persistent", &self.persistent.len())
            .finish()
    }
}
