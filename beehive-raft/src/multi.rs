//! Multi-group engine: every consensus group on one node, driven together.
//!
//! A hive runs one group for the cluster registry plus one per colony led
//! or followed here. `MultiRaft` owns them all, batches outbound messages
//! by destination node, and advances every group from a single `tick()`.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use beehive_core::{GroupId, LogIndex, NodeId, TermId};

use crate::config::RaftConfig;
use crate::message::{Message, Proposal};
use crate::snapshot::Snapshot;
use crate::state::{RaftNode, RaftOutput, RaftRole};

/// Maximum number of groups per node.
pub const GROUPS_PER_NODE_MAX: usize = 10_000;

/// Maximum messages batched for one destination before an early flush.
pub const MESSAGE_BATCH_SIZE_MAX: usize = 100;

/// A message addressed to a specific group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// The target group.
    pub group_id: GroupId,
    /// The consensus message.
    pub message: Message,
}

impl GroupMessage {
    /// Creates a new group message.
    #[must_use]
    pub const fn new(group_id: GroupId, message: Message) -> Self {
        Self { group_id, message }
    }
}

/// Output action from the multi-group engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiRaftOutput {
    /// Send batched messages to a destination node.
    SendMessages {
        /// Destination node.
        to: NodeId,
        /// Batched messages with their group ids.
        messages: Vec<GroupMessage>,
    },
    /// A log entry committed in a group.
    CommitEntry {
        /// The group.
        group_id: GroupId,
        /// Log index of the committed entry.
        index: LogIndex,
        /// Term of the committed entry.
        term: TermId,
        /// The committed data.
        data: Bytes,
    },
    /// This node became leader of a group.
    BecameLeader {
        /// The group.
        group_id: GroupId,
        /// The leadership term.
        term: TermId,
    },
    /// This node stepped down from leading a group.
    SteppedDown {
        /// The group.
        group_id: GroupId,
    },
}

/// Multi-group consensus engine.
#[derive(Debug)]
pub struct MultiRaft {
    /// This node's ID.
    node_id: NodeId,
    /// Groups managed by this engine.
    groups: BTreeMap<GroupId, RaftNode>,
    /// Pending outbound messages batched by destination.
    outbound: HashMap<NodeId, Vec<GroupMessage>>,
}

impl MultiRaft {
    /// Creates a new engine.
    #[must_use]
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            groups: BTreeMap::new(),
            outbound: HashMap::new(),
        }
    }

    /// Returns this node's ID.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the number of groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Returns true if the group exists here.
    #[must_use]
    pub fn has_group(&self, group_id: GroupId) -> bool {
        self.groups.contains_key(&group_id)
    }

    /// Returns a group's node, if present.
    #[must_use]
    pub fn group(&self, group_id: GroupId) -> Option<&RaftNode> {
        self.groups.get(&group_id)
    }

    /// Returns all group ids, in order.
    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.keys().copied().collect()
    }

    /// Returns groups this node currently leads.
    #[must_use]
    pub fn leader_groups(&self) -> Vec<GroupId> {
        self.groups
            .iter()
            .filter(|(_, node)| node.is_leader())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Creates a group with the given members and tick thresholds.
    ///
    /// # Errors
    /// Returns an error if the group exists, the node limit is reached, or
    /// this node is not a member.
    pub fn create_group(
        &mut self,
        group_id: GroupId,
        members: Vec<NodeId>,
        election_tick: u32,
        heartbeat_tick: u32,
    ) -> Result<(), MultiRaftError> {
        if self.groups.contains_key(&group_id) {
            return Err(MultiRaftError::GroupExists(group_id));
        }
        if self.groups.len() >= GROUPS_PER_NODE_MAX {
            return Err(MultiRaftError::TooManyGroups {
                count: self.groups.len(),
                max: GROUPS_PER_NODE_MAX,
            });
        }
        if !members.contains(&self.node_id) {
            return Err(MultiRaftError::NodeNotMember {
                node_id: self.node_id,
                group_id,
            });
        }

        // Seed per-group so timeouts stay varied but reproducible.
        let config = RaftConfig::new(self.node_id, members)
            .with_ticks(election_tick, heartbeat_tick)
            .with_jitter_seed(self.node_id.get() ^ group_id.get());
        self.groups.insert(group_id, RaftNode::new(config));

        debug_assert!(self.groups.contains_key(&group_id));
        Ok(())
    }

    /// Removes a group, dropping its pending outbound messages.
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn remove_group(&mut self, group_id: GroupId) -> Result<(), MultiRaftError> {
        if self.groups.remove(&group_id).is_none() {
            return Err(MultiRaftError::GroupNotFound(group_id));
        }
        for messages in self.outbound.values_mut() {
            messages.retain(|m| m.group_id != group_id);
        }
        Ok(())
    }

    /// Replaces a group's membership (already agreed through the cluster
    /// group).
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn set_members(
        &mut self,
        group_id: GroupId,
        members: Vec<NodeId>,
    ) -> Result<(), MultiRaftError> {
        let node = self
            .groups
            .get_mut(&group_id)
            .ok_or(MultiRaftError::GroupNotFound(group_id))?;
        node.set_members(members);
        Ok(())
    }

    /// Advances every group by one tick.
    pub fn tick(&mut self) -> Vec<MultiRaftOutput> {
        let mut all = Vec::new();
        let ids: Vec<GroupId> = self.groups.keys().copied().collect();
        for group_id in ids {
            if let Some(node) = self.groups.get_mut(&group_id) {
                let outputs = node.tick();
                all.extend(self.process_outputs(group_id, outputs));
            }
        }
        all.extend(self.flush());
        all
    }

    /// Proposes data to a group. `None` if not leader or unknown group.
    pub fn propose(&mut self, group_id: GroupId, data: Bytes) -> Option<Vec<MultiRaftOutput>> {
        let node = self.groups.get_mut(&group_id)?;
        let outputs = node.propose(Proposal::new(data))?;
        let mut all = self.process_outputs(group_id, outputs);
        all.extend(self.flush());
        Some(all)
    }

    /// The index the leader would assign to the next proposal.
    #[must_use]
    pub fn next_propose_index(&self, group_id: GroupId) -> Option<LogIndex> {
        let node = self.groups.get(&group_id)?;
        node.is_leader()
            .then(|| LogIndex::new(node.log().last_index().get() + 1))
    }

    /// Handles one incoming message for a group.
    pub fn handle_message(&mut self, group_id: GroupId, message: Message) -> Vec<MultiRaftOutput> {
        let Some(node) = self.groups.get_mut(&group_id) else {
            return Vec::new();
        };
        let outputs = node.handle_message(message);
        let mut all = self.process_outputs(group_id, outputs);
        all.extend(self.flush());
        all
    }

    /// Handles a batch of incoming messages, flushing outbound batches once.
    pub fn handle_messages(&mut self, messages: Vec<GroupMessage>) -> Vec<MultiRaftOutput> {
        let mut all = Vec::new();
        for GroupMessage { group_id, message } in messages {
            if let Some(node) = self.groups.get_mut(&group_id) {
                let outputs = node.handle_message(message);
                all.extend(self.process_outputs(group_id, outputs));
            }
        }
        all.extend(self.flush());
        all
    }

    /// Begins leadership transfer for a group. `None` if not leader there.
    pub fn transfer_leadership(
        &mut self,
        group_id: GroupId,
        target: NodeId,
    ) -> Option<Vec<MultiRaftOutput>> {
        let node = self.groups.get_mut(&group_id)?;
        let outputs = node.transfer_leadership(target)?;
        let mut all = self.process_outputs(group_id, outputs);
        all.extend(self.flush());
        Some(all)
    }

    /// Installs a snapshot into a group.
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn install_snapshot(
        &mut self,
        group_id: GroupId,
        snapshot: &Snapshot,
    ) -> Result<(), MultiRaftError> {
        let node = self
            .groups
            .get_mut(&group_id)
            .ok_or(MultiRaftError::GroupNotFound(group_id))?;
        node.install_snapshot(snapshot);
        Ok(())
    }

    /// Compacts a group's log through `index` (already snapshotted).
    ///
    /// # Errors
    /// Returns an error if the group does not exist.
    pub fn compact_log(
        &mut self,
        group_id: GroupId,
        index: LogIndex,
    ) -> Result<(), MultiRaftError> {
        let node = self
            .groups
            .get_mut(&group_id)
            .ok_or(MultiRaftError::GroupNotFound(group_id))?;
        node.compact_log(index);
        Ok(())
    }

    /// Returns `(role, term, leader)` for a group.
    #[must_use]
    pub fn group_status(&self, group_id: GroupId) -> Option<(RaftRole, TermId, Option<NodeId>)> {
        self.groups
            .get(&group_id)
            .map(|n| (n.role(), n.current_term(), n.leader_id()))
    }

    fn process_outputs(
        &mut self,
        group_id: GroupId,
        outputs: Vec<RaftOutput>,
    ) -> Vec<MultiRaftOutput> {
        let mut result = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                RaftOutput::SendMessage(msg) => {
                    let dest = msg.to();
                    let batch = self.outbound.entry(dest).or_default();
                    batch.push(GroupMessage::new(group_id, msg));
                    if batch.len() >= MESSAGE_BATCH_SIZE_MAX {
                        let messages = std::mem::take(batch);
                        result.push(MultiRaftOutput::SendMessages { to: dest, messages });
                    }
                }
                RaftOutput::CommitEntry { index, term, data } => {
                    result.push(MultiRaftOutput::CommitEntry {
                        group_id,
                        index,
                        term,
                        data,
                    });
                }
                RaftOutput::BecameLeader { term } => {
                    result.push(MultiRaftOutput::BecameLeader { group_id, term });
                }
                RaftOutput::SteppedDown => {
                    result.push(MultiRaftOutput::SteppedDown { group_id });
                }
            }
        }
        result
    }

    /// Flushes all pending outbound batches.
    pub fn flush(&mut self) -> Vec<MultiRaftOutput> {
        let mut outputs = Vec::new();
        for (dest, messages) in self.outbound.drain() {
            if !messages.is_empty() {
                outputs.push(MultiRaftOutput::SendMessages { to: dest, messages });
            }
        }
        outputs
    }
}

/// Errors from multi-group operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiRaftError {
    /// Group already exists.
    GroupExists(GroupId),
    /// Group not found.
    GroupNotFound(GroupId),
    /// Too many groups on this node.
    TooManyGroups {
        /// Current count.
        count: usize,
        /// Maximum allowed.
        max: usize,
    },
    /// This node is not in the member list.
    NodeNotMember {
        /// This node's id.
        node_id: NodeId,
        /// The group.
        group_id: GroupId,
    },
}

impl std::fmt::Display for MultiRaftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GroupExists(id) => write!(f, "group {id} already exists"),
            Self::GroupNotFound(id) => write!(f, "group {id} not found"),
            Self::TooManyGroups { count, max } => {
                write!(f, "too many groups: {count} (max {max})")
            }
            Self::NodeNotMember { node_id, group_id } => {
                write!(f, "{node_id} is not a member of {group_id}")
            }
        }
    }
}

impl std::error::Error for MultiRaftError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Vec<NodeId> {
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
    }

    fn tick_until<F>(multi: &mut MultiRaft, max_ticks: u32, cond: F) -> Vec<MultiRaftOutput>
    where
        F: Fn(&MultiRaft) -> bool,
    {
        let mut all = Vec::new();
        for _ in 0..max_ticks {
            all.extend(multi.tick());
            if cond(multi) {
                break;
            }
        }
        all
    }

    #[test]
    fn test_create_and_remove_group() {
        let mut multi = MultiRaft::new(NodeId::new(1));

        multi
            .create_group(GroupId::new(1), three(), 5, 1)
            .unwrap();
        assert!(multi.has_group(GroupId::new(1)));
        assert_eq!(multi.group_count(), 1);

        multi.remove_group(GroupId::new(1)).unwrap();
        assert!(!multi.has_group(GroupId::new(1)));
    }

    #[test]
    fn test_duplicate_group_rejected() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        multi.create_group(GroupId::new(1), three(), 5, 1).unwrap();

        let result = multi.create_group(GroupId::new(1), three(), 5, 1);
        assert!(matches!(result, Err(MultiRaftError::GroupExists(_))));
    }

    #[test]
    fn test_non_member_rejected() {
        let mut multi = MultiRaft::new(NodeId::new(99));
        let result = multi.create_group(GroupId::new(1), three(), 5, 1);
        assert!(matches!(result, Err(MultiRaftError::NodeNotMember { .. })));
    }

    #[test]
    fn test_single_member_group_elects_and_commits() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        multi
            .create_group(GroupId::new(1), vec![NodeId::new(1)], 5, 1)
            .unwrap();

        let outputs = tick_until(&mut multi, 20, |m| {
            m.leader_groups().contains(&GroupId::new(1))
        });
        assert!(outputs
            .iter()
            .any(|o| matches!(o, MultiRaftOutput::BecameLeader { .. })));

        let outputs = multi.propose(GroupId::new(1), Bytes::from("cmd")).unwrap();
        assert!(outputs
            .iter()
            .any(|o| matches!(o, MultiRaftOutput::CommitEntry { .. })));
    }

    #[test]
    fn test_propose_not_leader_returns_none() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        multi.create_group(GroupId::new(1), three(), 5, 1).unwrap();

        assert!(multi.propose(GroupId::new(1), Bytes::from("x")).is_none());
    }

    #[test]
    fn test_messages_batched_by_destination() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        for i in 1..=5 {
            multi
                .create_group(GroupId::new(i), three(), 3, 1)
                .unwrap();
        }

        let outputs = tick_until(&mut multi, 20, |m| m.group_ids().iter().all(|&g| {
            m.group_status(g)
                .is_some_and(|(role, _, _)| role != RaftRole::Follower)
        }));

        let sends: Vec<_> = outputs
            .iter()
            .filter_map(|o| match o {
                MultiRaftOutput::SendMessages { to, messages } => Some((to, messages.len())),
                _ => None,
            })
            .collect();
        assert!(!sends.is_empty());
        // At least one batch carries messages from more than one group.
        assert!(sends.iter().any(|(_, len)| *len > 1));
    }

    #[test]
    fn test_next_propose_index_tracks_log() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        multi
            .create_group(GroupId::new(1), vec![NodeId::new(1)], 5, 1)
            .unwrap();
        tick_until(&mut multi, 20, |m| {
            m.leader_groups().contains(&GroupId::new(1))
        });

        assert_eq!(
            multi.next_propose_index(GroupId::new(1)),
            Some(LogIndex::new(1))
        );
        multi.propose(GroupId::new(1), Bytes::from("a")).unwrap();
        assert_eq!(
            multi.next_propose_index(GroupId::new(1)),
            Some(LogIndex::new(2))
        );
    }

    #[test]
    fn test_varied_election_timeouts() {
        let mut multi = MultiRaft::new(NodeId::new(1));
        for i in 1..=5 {
            multi
                .create_group(GroupId::new(i), three(), 10, 1)
                .unwrap();
        }

        multi.tick();
        multi.tick();

        // With election_tick=10 and randomized thresholds in [10, 20),
        // nothing should have started an election after two ticks.
        let followers = multi
            .group_ids()
            .iter()
            .filter(|&&g| {
                multi
                    .group_status(g)
                    .is_some_and(|(role, _, _)| role == RaftRole::Follower)
            })
            .count();
        assert_eq!(followers, 5);
    }
}
