//! Consensus group configuration.

use beehive_core::NodeId;

use crate::limits::{ELECTION_TICK_DEFAULT, GROUP_SIZE_MAX, HEARTBEAT_TICK_DEFAULT};

/// Configuration for one member of a consensus group.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// IDs of all members of the group (including this node).
    pub members: Vec<NodeId>,

    /// Ticks before an election timeout may fire. The effective timeout is
    /// randomized in \[`election_tick`, 2 * `election_tick`).
    pub election_tick: u32,

    /// Ticks between leader heartbeats.
    pub heartbeat_tick: u32,

    /// Seed for the deterministic election jitter.
    pub jitter_seed: u64,
}

impl RaftConfig {
    /// Creates a new configuration.
    ///
    /// # Panics
    /// Panics if the member list is empty or too large, or if this node is
    /// not a member.
    #[must_use]
    pub fn new(node_id: NodeId, members: Vec<NodeId>) -> Self {
        assert!(!members.is_empty(), "group cannot be empty");
        assert!(
            members.len() <= GROUP_SIZE_MAX,
            "group size {} exceeds maximum {}",
            members.len(),
            GROUP_SIZE_MAX
        );
        assert!(members.contains(&node_id), "node_id must be a member");

        Self {
            node_id,
            members,
            election_tick: ELECTION_TICK_DEFAULT,
            heartbeat_tick: HEARTBEAT_TICK_DEFAULT,
            jitter_seed: node_id.get(),
        }
    }

    /// Sets custom tick thresholds.
    ///
    /// # Panics
    /// Panics if `election_tick` is not greater than `heartbeat_tick`.
    #[must_use]
    pub fn with_ticks(mut self, election_tick: u32, heartbeat_tick: u32) -> Self {
        assert!(
            election_tick > heartbeat_tick,
            "election_tick must be > heartbeat_tick"
        );
        self.election_tick = election_tick;
        self.heartbeat_tick = heartbeat_tick;
        self
    }

    /// Sets the jitter seed. Seeding with `node_id ^ group_id` keeps group
    /// timeouts varied without shared randomness.
    #[must_use]
    pub const fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }

    /// Returns the number of members in the group.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.members.len()
    }

    /// Returns the quorum size (majority).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Returns the other members (excluding this node).
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Vec<NodeId> {
        vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
    }

    #[test]
    fn test_config_basics() {
        let config = RaftConfig::new(NodeId::new(1), three());

        assert_eq!(config.group_size(), 3);
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.peers().len(), 2);
    }

    #[test]
    #[should_panic(expected = "group cannot be empty")]
    fn test_empty_group_panics() {
        let _ = RaftConfig::new(NodeId::new(1), vec![]);
    }

    #[test]
    #[should_panic(expected = "node_id must be a member")]
    fn test_non_member_panics() {
        let _ = RaftConfig::new(NodeId::new(9), three());
    }

    #[test]
    fn test_quorum_sizes() {
        let c1 = RaftConfig::new(NodeId::new(1), vec![NodeId::new(1)]);
        assert_eq!(c1.quorum_size(), 1);

        let c3 = RaftConfig::new(NodeId::new(1), three());
        assert_eq!(c3.quorum_size(), 2);

        let c5 = RaftConfig::new(
            NodeId::new(1),
            (1..=5).map(NodeId::new).collect(),
        );
        assert_eq!(c5.quorum_size(), 3);
    }
}
