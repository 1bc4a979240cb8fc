//! Advisory placement.
//!
//! Runs periodically on the cluster leader. Inputs are per-bee message
//! counts, the inter-bee emit graph, and per-node load; the objective is to
//! reduce cross-node emits without pushing any node past its load cap.
//! Placement is incremental: at most one move per bee per interval, and the
//! cheapest action that helps is preferred (leadership transfer, then
//! follower replacement; cell transfers are proposed only between bees of
//! the same application).

use std::collections::{BTreeMap, HashMap};

use beehive_core::{BeeId, NodeId};
use beehive_registry::RegistryState;
use tracing::debug;

/// Per-bee activity counters collected since the last interval.
#[derive(Debug, Clone, Default)]
pub struct BeeStats {
    /// Messages processed by the bee.
    pub messages: u64,
    /// Emits sent per destination bee.
    pub emits_to: BTreeMap<BeeId, u64>,
}

/// Configuration for the rebalancer.
#[derive(Debug, Clone, Copy)]
pub struct PlacementConfig {
    /// Maximum share of cluster messages one node should carry, in
    /// percent.
    pub node_load_cap_pct: u8,
    /// Minimum cross-node emit count before a move is worth proposing.
    pub min_emits_for_move: u64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            node_load_cap_pct: 60,
            min_emits_for_move: 100,
        }
    }
}

/// An advisory placement action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementAction {
    /// Move a colony's leadership to a node it already replicates on.
    TransferLeadership {
        /// The bee.
        bee: BeeId,
        /// The follower to promote.
        to: NodeId,
    },
    /// Replace a follower with a less-loaded node.
    ReplaceFollower {
        /// The bee.
        bee: BeeId,
        /// The follower to drop.
        remove: NodeId,
        /// The node to add.
        add: NodeId,
    },
}

/// Plans advisory moves from observed stats.
#[derive(Debug, Default)]
pub struct Rebalancer {
    config: PlacementConfig,
}

impl Rebalancer {
    /// Creates a rebalancer.
    #[must_use]
    pub const fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    /// Plans at most one move per bee for this interval.
    ///
    /// The heuristic: for each bee, find where its emits land. If most of
    /// its traffic flows to bees led by one other node, and that node has
    /// headroom, and this bee's colony already replicates there, propose a
    /// leadership transfer. Leadership transfer is cheap (no data moves),
    /// so it is the only action proposed spontaneously; cell transfers are
    /// operator- or failover-driven.
    #[must_use]
    pub fn plan(
        &self,
        stats: &HashMap<BeeId, BeeStats>,
        registry: &RegistryState,
    ) -> Vec<PlacementAction> {
        let node_loads = Self::node_loads(stats, registry);
        let total_messages: u64 = node_loads.values().sum();
        if total_messages == 0 {
            return Vec::new();
        }

        let mut actions = Vec::new();
        for (bee_id, bee_stats) in stats {
            let Some(record) = registry.bee(*bee_id) else {
                continue;
            };
            let Some(current_leader) = record.leader() else {
                continue;
            };

            // Where do this bee's emits land, per leader node?
            let mut emits_per_node: BTreeMap<NodeId, u64> = BTreeMap::new();
            for (dest_bee, count) in &bee_stats.emits_to {
                if let Some(dest_leader) = registry.bee(*dest_bee).and_then(|r| r.leader()) {
                    *emits_per_node.entry(dest_leader).or_default() += count;
                }
            }

            let Some((&best_node, &emits_there)) =
                emits_per_node.iter().max_by_key(|(_, count)| **count)
            else {
                continue;
            };

            if best_node == current_leader || emits_there < self.config.min_emits_for_move {
                continue;
            }

            // The target must already replicate the colony; otherwise the
            // move would need a reconfiguration first.
            if !record.colony.contains(&best_node) {
                continue;
            }

            // Load cap: moving there must not overload the target.
            let target_load = node_loads.get(&best_node).copied().unwrap_or(0);
            let projected = target_load + bee_stats.messages;
            let cap = total_messages * u64::from(self.config.node_load_cap_pct) / 100;
            if projected > cap {
                debug!(bee = %bee_id, node = %best_node, projected, cap, "move skipped, load cap");
                continue;
            }

            actions.push(PlacementAction::TransferLeadership {
                bee: *bee_id,
                to: best_node,
            });
        }
        actions
    }

    /// Picks the least-loaded live node to replace a dead follower,
    /// preferring nodes not already in the colony.
    #[must_use]
    pub fn pick_replacement(
        registry: &RegistryState,
        colony: &[NodeId],
        stats: &HashMap<BeeId, BeeStats>,
    ) -> Option<NodeId> {
        let node_loads = Self::node_loads(stats, registry);
        registry
            .live_nodes()
            .into_iter()
            .filter(|node| !colony.contains(node))
            .min_by_key(|node| node_loads.get(node).copied().unwrap_or(0))
    }

    fn node_loads(
        stats: &HashMap<BeeId, BeeStats>,
        registry: &RegistryState,
    ) -> HashMap<NodeId, u64> {
        let mut loads: HashMap<NodeId, u64> = HashMap::new();
        for (bee_id, bee_stats) in stats {
            if let Some(leader) = registry.bee(*bee_id).and_then(|r| r.leader()) {
                *loads.entry(leader).or_default() += bee_stats.messages;
            }
        }
        loads
    }
}
