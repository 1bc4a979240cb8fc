//! The registry state machine.
//!
//! One `RegistryState` lives on every node, fed by the cluster group's
//! committed command stream. Because every node applies the same commands
//! in the same order, lookups against local state are consistent up to the
//! applied index.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{AppName, BeeId, Cell, Epoch, NodeId};
use tracing::{debug, info, warn};

use crate::command::{
    get_cell, get_string, get_u32, get_u64, put_cell, put_string, CodecError, RegistryCommand,
};

/// Ownership record for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CellOwner {
    bee: BeeId,
    epoch: Epoch,
}

/// Everything the registry knows about one bee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeeRecord {
    /// The bee's id.
    pub bee: BeeId,
    /// The application it belongs to.
    pub app: AppName,
    /// The cells it owns (reverse index of the ownership map).
    pub cells: BTreeSet<Cell>,
    /// Colony membership, leader first.
    pub colony: Vec<NodeId>,
    /// Cells currently draining toward a transfer.
    pub draining: BTreeSet<Cell>,
}

impl BeeRecord {
    /// Returns the colony leader.
    #[must_use]
    pub fn leader(&self) -> Option<NodeId> {
        self.colony.first().copied()
    }
}

/// Everything the registry knows about one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    /// The node's id.
    pub node: NodeId,
    /// Hash of the node's application set.
    pub config_hash: u64,
    /// False once the node is declared dead or has left.
    pub alive: bool,
}

/// Result of a cell-set lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every cell is owned by the same bee.
    AllSame(BeeId),
    /// No cell is owned.
    Unowned(Vec<Cell>),
    /// The cells span more than one ownership class (two bees, or one bee
    /// plus unowned cells). Routing rejects these rather than splitting a
    /// handler invocation.
    Split {
        /// Owners and the cells each holds.
        owners: BTreeMap<BeeId, Vec<Cell>>,
        /// Cells nobody owns.
        unowned: Vec<Cell>,
    },
}

/// What an applied command did, for the runtime to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A claim committed and a bee was born.
    Claimed {
        /// The new bee.
        bee: BeeId,
        /// Its application.
        app: AppName,
        /// The cells bound to it.
        cells: Vec<Cell>,
        /// The node hinted to host its colony.
        node: NodeId,
    },
    /// A claim lost the race; these owners already hold cells of the set.
    ClaimRejected {
        /// Owners and the cells each holds.
        owners: BTreeMap<BeeId, Vec<Cell>>,
    },
    /// An empty bee was created as a transfer target.
    BeeCreated {
        /// The new bee.
        bee: BeeId,
        /// Its application.
        app: AppName,
        /// The node to host its colony.
        node: NodeId,
    },
    /// Cells entered the draining state.
    Drained {
        /// The owning bee.
        bee: BeeId,
        /// The draining cells.
        cells: Vec<Cell>,
    },
    /// Cells moved between bees; each moved cell's epoch was bumped.
    Transferred {
        /// The old owner.
        from_bee: BeeId,
        /// The new owner.
        to_bee: BeeId,
        /// The moved cells.
        cells: Vec<Cell>,
    },
    /// A bee was released; its cells are unowned again.
    Released {
        /// The released bee.
        bee: BeeId,
    },
    /// A node joined.
    NodeJoined {
        /// The node.
        node: NodeId,
    },
    /// A join was refused because the application sets differ.
    JoinRefused {
        /// The refused node.
        node: NodeId,
        /// The cluster's configuration hash.
        cluster_hash: u64,
        /// The joiner's configuration hash.
        joiner_hash: u64,
    },
    /// A node left or was declared dead.
    NodeLeft {
        /// The node.
        node: NodeId,
    },
    /// A bee's colony membership changed.
    ColonyChanged {
        /// The bee.
        bee: BeeId,
        /// The new membership, leader first.
        members: Vec<NodeId>,
    },
    /// A new leader announced itself; the bee's cell epochs were bumped.
    LeaderAnnounced {
        /// The bee.
        bee: BeeId,
        /// The new leader.
        leader: NodeId,
    },
    /// An application was recorded in the cluster table.
    AppRegistered {
        /// The application.
        app: AppName,
    },
    /// The command could not be applied; nothing changed.
    Rejected {
        /// Why the command was rejected.
        error: RegistryError,
    },
}

/// Errors from registry apply and lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The bee does not exist.
    UnknownBee(BeeId),
    /// A cell is not owned by the bee named in the command.
    NotOwner {
        /// The cell in question.
        cell: Cell,
        /// The bee the command named.
        bee: BeeId,
    },
    /// Transfer proposed for cells that were never drained.
    NotDraining {
        /// The first offending cell.
        cell: Cell,
    },
    /// A malformed command reached apply.
    Malformed(CodecError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownBee(bee) => write!(f, "unknown {bee}"),
            Self::NotOwner { cell, bee } => {
                write!(f, "cell {cell:?} is not owned by {bee}")
            }
            Self::NotDraining { cell } => {
                write!(f, "cell {cell:?} was not drained before transfer")
            }
            Self::Malformed(e) => write!(f, "malformed command: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The replicated registry state.
#[derive(Debug, Default)]
pub struct RegistryState {
    /// Forward map: cell to its owner.
    owners: BTreeMap<Cell, CellOwner>,
    /// Epochs of released cells, so a later re-claim continues counting
    /// instead of restarting at zero.
    retired_epochs: BTreeMap<Cell, Epoch>,
    /// Per-bee records (the reverse index lives in `BeeRecord::cells`).
    bees: BTreeMap<BeeId, BeeRecord>,
    /// Node membership.
    nodes: BTreeMap<NodeId, NodeRecord>,
    /// Application table.
    apps: BTreeMap<AppName, u64>,
    /// Next bee id to allocate. Monotonic across the cluster's life.
    next_bee_id: u64,
    /// Highest command index applied; duplicates below it are skipped.
    applied_index: u64,
}

impl RegistryState {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_bee_id: 1,
            ..Self::default()
        }
    }

    /// Returns the highest applied command index.
    #[must_use]
    pub const fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Resolves ownership of a cell set against the applied state.
    #[must_use]
    pub fn lookup<'a>(&self, cells: impl IntoIterator<Item = &'a Cell>) -> Resolution {
        let mut owners: BTreeMap<BeeId, Vec<Cell>> = BTreeMap::new();
        let mut unowned = Vec::new();

        for cell in cells {
            match self.owners.get(cell) {
                Some(owner) => owners.entry(owner.bee).or_default().push(cell.clone()),
                None => unowned.push(cell.clone()),
            }
        }

        match (owners.len(), unowned.is_empty()) {
            (0, _) => Resolution::Unowned(unowned),
            (1, true) => {
                let bee = *owners.keys().next().unwrap_or(&BeeId::new(0));
                Resolution::AllSame(bee)
            }
            _ => Resolution::Split { owners, unowned },
        }
    }

    /// Returns the epoch of a cell, if it is or ever was owned.
    #[must_use]
    pub fn cell_epoch(&self, cell: &Cell) -> Option<Epoch> {
        self.owners
            .get(cell)
            .map(|o| o.epoch)
            .or_else(|| self.retired_epochs.get(cell).copied())
    }

    /// Returns a bee's record.
    #[must_use]
    pub fn bee(&self, bee: BeeId) -> Option<&BeeRecord> {
        self.bees.get(&bee)
    }

    /// Iterates all bee records.
    pub fn bees(&self) -> impl Iterator<Item = &BeeRecord> {
        self.bees.values()
    }

    /// Returns bees whose colony includes `node`.
    #[must_use]
    pub fn bees_on_node(&self, node: NodeId) -> Vec<BeeId> {
        self.bees
            .values()
            .filter(|b| b.colony.contains(&node))
            .map(|b| b.bee)
            .collect()
    }

    /// Returns the node record.
    #[must_use]
    pub fn node(&self, node: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(&node)
    }

    /// Returns all live nodes.
    #[must_use]
    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.alive)
            .map(|n| n.node)
            .collect()
    }

    /// Returns the registered applications.
    pub fn apps(&self) -> impl Iterator<Item = (&AppName, u64)> {
        self.apps.iter().map(|(name, word)| (name, *word))
    }

    /// Applies a committed command.
    ///
    /// Duplicate deliveries (same or lower index) are skipped, keeping the
    /// applier idempotent under the wrapper's at-least-once contract.
    pub fn apply(&mut self, index: u64, command: &RegistryCommand) -> Option<RegistryEvent> {
        if index <= self.applied_index {
            debug!(index, applied = self.applied_index, "skipping duplicate command");
            return None;
        }
        self.applied_index = index;

        let event = match command {
            RegistryCommand::Claim {
                cells,
                app,
                candidate_node,
            } => self.apply_claim(cells, app, *candidate_node),
            RegistryCommand::CreateBee { app, node } => self.apply_create_bee(app, *node),
            RegistryCommand::Drain { cells, from_bee } => self.apply_drain(cells, *from_bee),
            RegistryCommand::Transfer {
                cells,
                from_bee,
                to_bee,
            } => self.apply_transfer(cells, *from_bee, *to_bee),
            RegistryCommand::Release { bee } => self.apply_release(*bee),
            RegistryCommand::NodeJoined { node, config_hash } => {
                self.apply_node_joined(*node, *config_hash)
            }
            RegistryCommand::NodeLeft { node } => self.apply_node_left(*node),
            RegistryCommand::SetColony { bee, members } => self.apply_set_colony(*bee, members),
            RegistryCommand::AnnounceLeader { bee, leader } => {
                self.apply_announce_leader(*bee, *leader)
            }
            RegistryCommand::RegisterApp { app, config_word } => {
                self.apps.insert(app.clone(), *config_word);
                RegistryEvent::AppRegistered { app: app.clone() }
            }
        };
        Some(event)
    }

    fn apply_claim(&mut self, cells: &[Cell], app: &AppName, node: NodeId) -> RegistryEvent {
        // First committed claim wins; any owned cell rejects the whole set.
        let mut conflict: BTreeMap<BeeId, Vec<Cell>> = BTreeMap::new();
        for cell in cells {
            if let Some(owner) = self.owners.get(cell) {
                conflict.entry(owner.bee).or_default().push(cell.clone());
            }
        }
        if !conflict.is_empty() {
            return RegistryEvent::ClaimRejected { owners: conflict };
        }

        let bee = self.allocate_bee_id();
        let mut record = BeeRecord {
            bee,
            app: app.clone(),
            cells: BTreeSet::new(),
            colony: vec![node],
            draining: BTreeSet::new(),
        };
        for cell in cells {
            let epoch = self.next_epoch_for(cell);
            self.owners.insert(cell.clone(), CellOwner { bee, epoch });
            self.retired_epochs.remove(cell);
            record.cells.insert(cell.clone());
        }
        self.bees.insert(bee, record);

        info!(%bee, %app, cell_count = cells.len(), %node, "bee claimed cells");
        RegistryEvent::Claimed {
            bee,
            app: app.clone(),
            cells: cells.to_vec(),
            node,
        }
    }

    fn apply_create_bee(&mut self, app: &AppName, node: NodeId) -> RegistryEvent {
        let bee = self.allocate_bee_id();
        self.bees.insert(
            bee,
            BeeRecord {
                bee,
                app: app.clone(),
                cells: BTreeSet::new(),
                colony: vec![node],
                draining: BTreeSet::new(),
            },
        );
        RegistryEvent::BeeCreated {
            bee,
            app: app.clone(),
            node,
        }
    }

    fn apply_drain(&mut self, cells: &[Cell], from_bee: BeeId) -> RegistryEvent {
        let Some(record) = self.bees.get_mut(&from_bee) else {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(from_bee),
            };
        };
        for cell in cells {
            if !record.cells.contains(cell) {
                return RegistryEvent::Rejected {
                    error: RegistryError::NotOwner {
                        cell: cell.clone(),
                        bee: from_bee,
                    },
                };
            }
        }
        for cell in cells {
            record.draining.insert(cell.clone());
        }
        RegistryEvent::Drained {
            bee: from_bee,
            cells: cells.to_vec(),
        }
    }

    fn apply_transfer(
        &mut self,
        cells: &[Cell],
        from_bee: BeeId,
        to_bee: BeeId,
    ) -> RegistryEvent {
        if !self.bees.contains_key(&from_bee) {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(from_bee),
            };
        }
        if !self.bees.contains_key(&to_bee) {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(to_bee),
            };
        }

        // Both phases checked: ownership and a prior drain.
        if let Some(source) = self.bees.get(&from_bee) {
            for cell in cells {
                if !source.cells.contains(cell) {
                    return RegistryEvent::Rejected {
                        error: RegistryError::NotOwner {
                            cell: cell.clone(),
                            bee: from_bee,
                        },
                    };
                }
                if !source.draining.contains(cell) {
                    return RegistryEvent::Rejected {
                        error: RegistryError::NotDraining { cell: cell.clone() },
                    };
                }
            }
        }

        for cell in cells {
            let epoch = self
                .owners
                .get(cell)
                .map_or(Epoch::new(0), |o| o.epoch.next());
            self.owners.insert(
                cell.clone(),
                CellOwner { bee: to_bee, epoch },
            );
            if let Some(source) = self.bees.get_mut(&from_bee) {
                source.cells.remove(cell);
                source.draining.remove(cell);
            }
            if let Some(target) = self.bees.get_mut(&to_bee) {
                target.cells.insert(cell.clone());
            }
        }

        info!(%from_bee, %to_bee, cell_count = cells.len(), "cells transferred");
        RegistryEvent::Transferred {
            from_bee,
            to_bee,
            cells: cells.to_vec(),
        }
    }

    fn apply_release(&mut self, bee: BeeId) -> RegistryEvent {
        let Some(record) = self.bees.remove(&bee) else {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(bee),
            };
        };
        for cell in &record.cells {
            if let Some(owner) = self.owners.remove(cell) {
                // Keep the epoch so a later re-claim continues the count.
                self.retired_epochs.insert(cell.clone(), owner.epoch);
            }
        }
        info!(%bee, "bee released");
        RegistryEvent::Released { bee }
    }

    fn apply_node_joined(&mut self, node: NodeId, config_hash: u64) -> RegistryEvent {
        // The first joiner's application set becomes the cluster's; later
        // joiners must match it.
        if let Some(cluster_hash) = self.nodes.values().map(|n| n.config_hash).next() {
            if cluster_hash != config_hash {
                warn!(%node, cluster_hash, joiner_hash = config_hash, "join refused");
                return RegistryEvent::JoinRefused {
                    node,
                    cluster_hash,
                    joiner_hash: config_hash,
                };
            }
        }

        self.nodes.insert(
            node,
            NodeRecord {
                node,
                config_hash,
                alive: true,
            },
        );
        info!(%node, "node joined");
        RegistryEvent::NodeJoined { node }
    }

    fn apply_node_left(&mut self, node: NodeId) -> RegistryEvent {
        if let Some(record) = self.nodes.get_mut(&node) {
            record.alive = false;
        }
        info!(%node, "node left");
        RegistryEvent::NodeLeft { node }
    }

    fn apply_set_colony(&mut self, bee: BeeId, members: &[NodeId]) -> RegistryEvent {
        let Some(record) = self.bees.get_mut(&bee) else {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(bee),
            };
        };
        record.colony = members.to_vec();
        RegistryEvent::ColonyChanged {
            bee,
            members: members.to_vec(),
        }
    }

    fn apply_announce_leader(&mut self, bee: BeeId, leader: NodeId) -> RegistryEvent {
        let Some(record) = self.bees.get_mut(&bee) else {
            return RegistryEvent::Rejected {
                error: RegistryError::UnknownBee(bee),
            };
        };

        // Move the leader to the front of the colony list.
        record.colony.retain(|&n| n != leader);
        record.colony.insert(0, leader);

        // Bump cell epochs so forwarders holding the old route refresh.
        for cell in record.cells.clone() {
            if let Some(owner) = self.owners.get_mut(&cell) {
                owner.epoch = owner.epoch.next();
            }
        }

        info!(%bee, %leader, "leader announced");
        RegistryEvent::LeaderAnnounced { bee, leader }
    }

    fn allocate_bee_id(&mut self) -> BeeId {
        let bee = BeeId::new(self.next_bee_id);
        self.next_bee_id += 1;
        bee
    }

    fn next_epoch_for(&self, cell: &Cell) -> Epoch {
        self.retired_epochs
            .get(cell)
            .map_or(Epoch::new(0), |e| e.next())
    }

    /// Serializes the registry for a cluster-group snapshot.
    #[must_use]
    pub fn encode_snapshot(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.applied_index);
        buf.put_u64_le(self.next_bee_id);

        buf.put_u32_le(u32::try_from(self.apps.len()).unwrap_or(u32::MAX));
        for (app, word) in &self.apps {
            put_string(&mut buf, app.as_str());
            buf.put_u64_le(*word);
        }

        buf.put_u32_le(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        for record in self.nodes.values() {
            buf.put_u64_le(record.node.get());
            buf.put_u64_le(record.config_hash);
            buf.put_u8(u8::from(record.alive));
        }

        buf.put_u32_le(u32::try_from(self.bees.len()).unwrap_or(u32::MAX));
        for record in self.bees.values() {
            buf.put_u64_le(record.bee.get());
            put_string(&mut buf, record.app.as_str());
            buf.put_u32_le(u32::try_from(record.colony.len()).unwrap_or(u32::MAX));
            for node in &record.colony {
                buf.put_u64_le(node.get());
            }
            buf.put_u32_le(u32::try_from(record.draining.len()).unwrap_or(u32::MAX));
            for cell in &record.draining {
                put_cell(&mut buf, cell);
            }
        }

        buf.put_u32_le(u32::try_from(self.owners.len()).unwrap_or(u32::MAX));
        for (cell, owner) in &self.owners {
            put_cell(&mut buf, cell);
            buf.put_u64_le(owner.bee.get());
            buf.put_u64_le(owner.epoch.get());
        }

        buf.put_u32_le(u32::try_from(self.retired_epochs.len()).unwrap_or(u32::MAX));
        for (cell, epoch) in &self.retired_epochs {
            put_cell(&mut buf, cell);
            buf.put_u64_le(epoch.get());
        }

        buf.freeze()
    }

    /// Rebuilds a registry from snapshot bytes.
    ///
    /// # Errors
    /// Returns an error if the snapshot is malformed.
    pub fn decode_snapshot(mut buf: Bytes) -> Result<Self, RegistryError> {
        let mut state = Self::new();
        state.applied_index = get_u64(&mut buf).map_err(RegistryError::Malformed)?;
        state.next_bee_id = get_u64(&mut buf).map_err(RegistryError::Malformed)?;

        let app_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
        for _ in 0..app_count {
            let app = AppName::new(get_string(&mut buf).map_err(RegistryError::Malformed)?);
            let word = get_u64(&mut buf).map_err(RegistryError::Malformed)?;
            state.apps.insert(app, word);
        }

        let node_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
        for _ in 0..node_count {
            let node = NodeId::new(get_u64(&mut buf).map_err(RegistryError::Malformed)?);
            let config_hash = get_u64(&mut buf).map_err(RegistryError::Malformed)?;
            let alive = get_u8(&mut buf).map_err(RegistryError::Malformed)? != 0;
            state.nodes.insert(
                node,
                NodeRecord {
                    node,
                    config_hash,
                    alive,
                },
            );
        }

        let bee_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
        for _ in 0..bee_count {
            let bee = BeeId::new(get_u64(&mut buf).map_err(RegistryError::Malformed)?);
            let app = AppName::new(get_string(&mut buf).map_err(RegistryError::Malformed)?);
            let colony_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
            let mut colony = Vec::with_capacity(colony_count as usize);
            for _ in 0..colony_count {
                colony.push(NodeId::new(
                    get_u64(&mut buf).map_err(RegistryError::Malformed)?,
                ));
            }
            let draining_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
            let mut draining = BTreeSet::new();
            for _ in 0..draining_count {
                draining.insert(get_cell(&mut buf).map_err(RegistryError::Malformed)?);
            }
            state.bees.insert(
                bee,
                BeeRecord {
                    bee,
                    app,
                    cells: BTreeSet::new(),
                    colony,
                    draining,
                },
            );
        }

        let owner_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
        for _ in 0..owner_count {
            let cell = get_cell(&mut buf).map_err(RegistryError::Malformed)?;
            let bee = BeeId::new(get_u64(&mut buf).map_err(RegistryError::Malformed)?);
            let epoch = Epoch::new(get_u64(&mut buf).map_err(RegistryError::Malformed)?);
            if let Some(record) = state.bees.get_mut(&bee) {
                record.cells.insert(cell.clone());
            }
            state.owners.insert(cell, CellOwner { bee, epoch });
        }

        let retired_count = get_u32(&mut buf).map_err(RegistryError::Malformed)?;
        for _ in 0..retired_count {
            let cell = get_cell(&mut buf).map_err(RegistryError::Malformed)?;
            let epoch = Epoch::new(get_u64(&mut buf).map_err(RegistryError::Malformed)?);
            state.retired_epochs.insert(cell, epoch);
        }

        Ok(state)
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::Truncated { needed: 1 });
    }
    Ok(buf.get_u8())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(dict: &str, key: &str) -> Cell {
        Cell::new(dict, key.as_bytes().to_vec())
    }

    fn claim(state: &mut RegistryState, index: u64, cells: Vec<Cell>, node: u64) -> RegistryEvent {
        state
            .apply(
                index,
                &RegistryCommand::Claim {
                    cells,
                    app: AppName::new("test"),
                    candidate_node: NodeId::new(node),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_claim_allocates_monotonic_bee_ids() {
        let mut state = RegistryState::new();

        let e1 = claim(&mut state, 1, vec![cell("d", "a")], 1);
        let e2 = claim(&mut state, 2, vec![cell("d", "b")], 1);

        let (b1, b2) = match (e1, e2) {
            (RegistryEvent::Claimed { bee: b1, .. }, RegistryEvent::Claimed { bee: b2, .. }) => {
                (b1, b2)
            }
            other => panic!("unexpected events: {other:?}"),
        };
        assert!(b2 > b1);
    }

    #[test]
    fn test_claim_conflict_first_commit_wins() {
        let mut state = RegistryState::new();

        let e1 = claim(&mut state, 1, vec![cell("d", "k")], 1);
        let RegistryEvent::Claimed { bee, .. } = e1 else {
            panic!("first claim must win");
        };

        // The racing claim arrives later in commit order and loses.
        let e2 = claim(&mut state, 2, vec![cell("d", "k"), cell("d", "other")], 2);
        match e2 {
            RegistryEvent::ClaimRejected { owners } => {
                assert_eq!(owners.len(), 1);
                assert!(owners.contains_key(&bee));
            }
            other => panic!("expected rejection, got {other:?}"),
        }

        // The loser's unowned cell stays unowned.
        assert_eq!(
            state.lookup([&cell("d", "other")]),
            Resolution::Unowned(vec![cell("d", "other")])
        );
    }

    #[test]
    fn test_lookup_classification() {
        let mut state = RegistryState::new();
        claim(&mut state, 1, vec![cell("d", "k1")], 1);
        claim(&mut state, 2, vec![cell("d", "k2")], 1);

        let k1 = cell("d", "k1");
        let k2 = cell("d", "k2");
        let k3 = cell("d", "k3");

        assert!(matches!(state.lookup([&k1]), Resolution::AllSame(_)));
        assert!(matches!(state.lookup([&k3]), Resolution::Unowned(_)));
        // Two owners.
        assert!(matches!(
            state.lookup([&k1, &k2]),
            Resolution::Split { .. }
        ));
        // One owner plus an unowned cell is still split.
        match state.lookup([&k1, &k3]) {
            Resolution::Split { owners, unowned } => {
                assert_eq!(owners.len(), 1);
                assert_eq!(unowned, vec![k3]);
            }
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_apply_skipped() {
        let mut state = RegistryState::new();
        claim(&mut state, 1, vec![cell("d", "k")], 1);

        // Redelivery of the same committed index must be a no-op.
        let again = state.apply(
            1,
            &RegistryCommand::Claim {
                cells: vec![cell("d", "k")],
                app: AppName::new("test"),
                candidate_node: NodeId::new(1),
            },
        );
        assert!(again.is_none());
    }

    #[test]
    fn test_transfer_requires_drain() {
        let mut state = RegistryState::new();
        claim(&mut state, 1, vec![cell("d", "c1"), cell("d", "c2")], 1);
        state
            .apply(
                2,
                &RegistryCommand::CreateBee {
                    app: AppName::new("test"),
                    node: NodeId::new(2),
                },
            )
            .unwrap();

        let from = BeeId::new(1);
        let to = BeeId::new(2);

        // Transfer without drain is rejected.
        let event = state
            .apply(
                3,
                &RegistryCommand::Transfer {
                    cells: vec![cell("d", "c2")],
                    from_bee: from,
                    to_bee: to,
                },
            )
            .unwrap();
        assert!(matches!(
            event,
            RegistryEvent::Rejected {
                error: RegistryError::NotDraining { .. }
            }
        ));

        // Drain, then transfer succeeds and bumps the epoch.
        let before = state.cell_epoch(&cell("d", "c2")).unwrap();
        state
            .apply(
                4,
                &RegistryCommand::Drain {
                    cells: vec![cell("d", "c2")],
                    from_bee: from,
                },
            )
            .unwrap();
        let event = state
            .apply(
                5,
                &RegistryCommand::Transfer {
                    cells: vec![cell("d", "c2")],
                    from_bee: from,
                    to_bee: to,
                },
            )
            .unwrap();
        assert!(matches!(event, RegistryEvent::Transferred { .. }));

        assert_eq!(state.lookup([&cell("d", "c2")]), Resolution::AllSame(to));
        assert_eq!(state.lookup([&cell("d", "c1")]), Resolution::AllSame(from));
        assert_eq!(state.cell_epoch(&cell("d", "c2")).unwrap(), before.next());
    }

    #[test]
    fn test_release_retires_epochs() {
        let mut state = RegistryState::new();
        claim(&mut state, 1, vec![cell("d", "k")], 1);

        state
            .apply(2, &RegistryCommand::Release { bee: BeeId::new(1) })
            .unwrap();
        assert!(matches!(
            state.lookup([&cell("d", "k")]),
            Resolution::Unowned(_)
        ));

        // A re-claim continues the epoch sequence instead of restarting.
        claim(&mut state, 3, vec![cell("d", "k")], 1);
        assert_eq!(state.cell_epoch(&cell("d", "k")), Some(Epoch::new(1)));
    }

    #[test]
    fn test_announce_leader_bumps_epochs() {
        let mut state = RegistryState::new();
        claim(&mut state, 1, vec![cell("d", "k")], 1);
        state
            .apply(
                2,
                &RegistryCommand::SetColony {
                    bee: BeeId::new(1),
                    members: vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
                },
            )
            .unwrap();

        let before = state.cell_epoch(&cell("d", "k")).unwrap();
        state
            .apply(
                3,
                &RegistryCommand::AnnounceLeader {
                    bee: BeeId::new(1),
                    leader: NodeId::new(2),
                },
            )
            .unwrap();

        assert_eq!(state.cell_epoch(&cell("d", "k")), Some(before.next()));
        assert_eq!(state.bee(BeeId::new(1)).unwrap().leader(), Some(NodeId::new(2)));
    }

    #[test]
    fn test_join_refused_on_config_mismatch() {
        let mut state = RegistryState::new();

        state
            .apply(
                1,
                &RegistryCommand::NodeJoined {
                    node: NodeId::new(1),
                    config_hash: 42,
                },
            )
            .unwrap();
        let event = state
            .apply(
                2,
                &RegistryCommand::NodeJoined {
                    node: NodeId::new(2),
                    config_hash: 43,
                },
            )
            .unwrap();

        assert!(matches!(event, RegistryEvent::JoinRefused { .. }));
        assert!(state.node(NodeId::new(2)).is_none());
        assert_eq!(state.live_nodes(), vec![NodeId::new(1)]);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut state = RegistryState::new();
        state
            .apply(
                1,
                &RegistryCommand::NodeJoined {
                    node: NodeId::new(1),
                    config_hash: 7,
                },
            )
            .unwrap();
        state
            .apply(
                2,
                &RegistryCommand::RegisterApp {
                    app: AppName::new("counter"),
                    config_word: 9,
                },
            )
            .unwrap();
        claim(&mut state, 3, vec![cell("d", "a"), cell("d", "b")], 1);
        state
            .apply(
                4,
                &RegistryCommand::Drain {
                    cells: vec![cell("d", "b")],
                    from_bee: BeeId::new(1),
                },
            )
            .unwrap();

        let restored = RegistryState::decode_snapshot(state.encode_snapshot()).unwrap();

        assert_eq!(restored.applied_index(), state.applied_index());
        assert_eq!(
            restored.lookup([&cell("d", "a")]),
            state.lookup([&cell("d", "a")])
        );
        assert_eq!(
            restored.bee(BeeId::new(1)).unwrap(),
            state.bee(BeeId::new(1)).unwrap()
        );
        assert_eq!(restored.live_nodes(), state.live_nodes());

        // Allocation continues where it left off.
        let mut restored = restored;
        let event = claim(&mut restored, 5, vec![cell("d", "c")], 1);
        assert!(matches!(
            event,
            RegistryEvent::Claimed { bee, .. } if bee == BeeId::new(2)
        ));
    }
}
