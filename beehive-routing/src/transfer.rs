//! Cell transfer coordination.
//!
//! Moving cells between bees is a two-phase protocol over two consensus
//! groups: the registry marks the cells draining and the source colony
//! quiesces them; once both commit, the source's values are installed on
//! the target colony, the registry rebinds the cells (bumping epochs), and
//! the source finally drops them. Messages mapping to the moving cells
//! queue behind the drain and commit on the target after the switch.
//!
//! The coordinator here is sans-IO: each step returns the proposals to
//! make, and the runtime feeds back the committed events that advance the
//! phase.

use beehive_core::{BeeId, Cell};
use beehive_registry::RegistryCommand;
use beehive_state::{ColonyEntry, ControlEntry, InstalledCell};

/// Maximum concurrent transfers per coordinator.
pub const MAX_CONCURRENT_TRANSFERS: usize = 10;

/// Ticks before an unfinished transfer times out.
pub const TRANSFER_TIMEOUT_TICKS: u64 = 1000;

/// Phase of a cell transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    /// Created, nothing proposed yet.
    Planned,
    /// Drain and quiesce proposed; waiting for both to commit.
    Draining {
        /// The registry marked the cells draining.
        drain_committed: bool,
        /// The source colony applied the quiesce.
        quiesce_committed: bool,
    },
    /// Cell values proposed to the target colony.
    Installing,
    /// Registry rebind proposed.
    Switching,
    /// The transfer finished; the source dropped the cells.
    Done,
    /// The transfer failed.
    Failed {
        /// Why.
        reason: String,
    },
}

impl TransferPhase {
    /// Returns true if the transfer is finished (done or failed).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. })
    }
}

/// Proposals and notifications produced by advancing a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutput {
    /// Propose a command to the cluster group.
    ProposeRegistry(RegistryCommand),
    /// Propose an entry to a colony's group.
    ProposeColony {
        /// The colony's bee.
        bee: BeeId,
        /// The entry to propose.
        entry: ColonyEntry,
    },
    /// The transfer completed.
    Completed,
    /// The transfer failed; cells stay with the source (unquiesce
    /// proposed separately).
    Failed {
        /// Why.
        reason: String,
    },
}

/// One in-flight cell transfer.
#[derive(Debug, Clone)]
pub struct CellTransfer {
    /// The moving cells.
    pub cells: Vec<Cell>,
    /// Current owner.
    pub from_bee: BeeId,
    /// Future owner.
    pub to_bee: BeeId,
    /// Current phase.
    pub phase: TransferPhase,
    /// Tick the transfer started at, for timeout tracking.
    pub started_at_tick: u64,
    /// Cell values captured at quiesce, held until the drain commits too.
    pending_values: Option<Vec<InstalledCell>>,
}

impl CellTransfer {
    /// Creates a transfer in the planned phase.
    ///
    /// # Panics
    /// Panics if source and target are the same bee or the cell list is
    /// empty.
    #[must_use]
    pub fn new(cells: Vec<Cell>, from_bee: BeeId, to_bee: BeeId, current_tick: u64) -> Self {
        assert!(from_bee != to_bee, "transfer source and target must differ");
        assert!(!cells.is_empty(), "transfer needs at least one cell");
        Self {
            cells,
            from_bee,
            to_bee,
            phase: TransferPhase::Planned,
            started_at_tick: current_tick,
            pending_values: None,
        }
    }

    /// Starts the transfer: drain in the registry, quiesce on the source.
    ///
    /// # Panics
    /// Panics unless the transfer is in the planned phase.
    pub fn start(&mut self) -> Vec<TransferOutput> {
        assert!(
            matches!(self.phase, TransferPhase::Planned),
            "can only start a planned transfer"
        );
        self.phase = TransferPhase::Draining {
            drain_committed: false,
            quiesce_committed: false,
        };
        vec![
            TransferOutput::ProposeRegistry(RegistryCommand::Drain {
                cells: self.cells.clone(),
                from_bee: self.from_bee,
            }),
            TransferOutput::ProposeColony {
                bee: self.from_bee,
                entry: ColonyEntry::Control(ControlEntry::Quiesce {
                    cells: self.cells.clone(),
                }),
            },
        ]
    }

    /// Notes that the registry drain committed.
    ///
    /// Once both drain and quiesce are in, returns the install proposal
    /// for the target colony.
    pub fn on_drain_committed(&mut self) -> Vec<TransferOutput> {
        let TransferPhase::Draining {
            drain_committed,
            quiesce_committed,
        } = &mut self.phase
        else {
            return Vec::new();
        };
        *drain_committed = true;
        if *quiesce_committed {
            return self.begin_install();
        }
        Vec::new()
    }

    /// Notes that the source colony applied the quiesce, handing over the
    /// current values of the moving cells.
    ///
    /// Once both drain and quiesce are in, returns the install proposal
    /// for the target colony.
    pub fn on_quiesce_committed(&mut self, values: Vec<InstalledCell>) -> Vec<TransferOutput> {
        let TransferPhase::Draining {
            drain_committed,
            quiesce_committed,
        } = &mut self.phase
        else {
            return Vec::new();
        };
        *quiesce_committed = true;
        self.pending_values = Some(values);

        if *drain_committed {
            return self.begin_install();
        }
        Vec::new()
    }

    fn begin_install(&mut self) -> Vec<TransferOutput> {
        let values = self.pending_values.take().unwrap_or_default();
        self.phase = TransferPhase::Installing;
        vec![TransferOutput::ProposeColony {
            bee: self.to_bee,
            entry: ColonyEntry::Control(ControlEntry::InstallCells { cells: values }),
        }]
    }

    /// Notes that the target colony applied the install; proposes the
    /// registry rebind.
    pub fn on_install_committed(&mut self) -> Vec<TransferOutput> {
        if !matches!(self.phase, TransferPhase::Installing) {
            return Vec::new();
        }
        self.phase = TransferPhase::Switching;
        vec![TransferOutput::ProposeRegistry(RegistryCommand::Transfer {
            cells: self.cells.clone(),
            from_bee: self.from_bee,
            to_bee: self.to_bee,
        })]
    }

    /// Notes that the registry rebind committed; drops the cells from the
    /// source and completes.
    pub fn on_transfer_committed(&mut self) -> Vec<TransferOutput> {
        if !matches!(self.phase, TransferPhase::Switching) {
            return Vec::new();
        }
        self.phase = TransferPhase::Done;
        vec![
            TransferOutput::ProposeColony {
                bee: self.from_bee,
                entry: ColonyEntry::Control(ControlEntry::RemoveCells {
                    cells: self.cells.clone(),
                }),
            },
            TransferOutput::Completed,
        ]
    }

    /// Fails the transfer. The caller unquiesces the source so queued
    /// messages resume against the old owner.
    pub fn fail(&mut self, reason: impl Into<String>) -> Vec<TransferOutput> {
        let reason = reason.into();
        self.phase = TransferPhase::Failed {
            reason: reason.clone(),
        };
        vec![
            TransferOutput::ProposeColony {
                bee: self.from_bee,
                entry: ColonyEntry::Control(ControlEntry::Unquiesce {
                    cells: self.cells.clone(),
                }),
            },
            TransferOutput::Failed { reason },
        ]
    }

    /// Returns true if the transfer exceeded its time budget.
    #[must_use]
    pub const fn is_timed_out(&self, current_tick: u64) -> bool {
        current_tick.saturating_sub(self.started_at_tick) > TRANSFER_TIMEOUT_TICKS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn cell(key: &str) -> Cell {
        Cell::new("d", key.as_bytes().to_vec())
    }

    fn make_transfer() -> CellTransfer {
        CellTransfer::new(vec![cell("c3")], BeeId::new(10), BeeId::new(11), 100)
    }

    #[test]
    fn test_full_protocol_sequence() {
        let mut transfer = make_transfer();

        // Start: drain + quiesce proposals.
        let outputs = transfer.start();
        assert_eq!(outputs.len(), 2);
        assert!(matches!(
            outputs[0],
            TransferOutput::ProposeRegistry(RegistryCommand::Drain { .. })
        ));
        assert!(matches!(
            outputs[1],
            TransferOutput::ProposeColony { bee, .. } if bee == BeeId::new(10)
        ));

        // Drain commits first; nothing more happens yet.
        assert!(transfer.on_drain_committed().is_empty());
        assert!(matches!(transfer.phase, TransferPhase::Draining { .. }));

        // Quiesce commits with the cell values: install goes out.
        let values = vec![InstalledCell {
            cell: cell("c3"),
            value: Some(Bytes::from("v")),
            version: 3,
        }];
        let outputs = transfer.on_quiesce_committed(values);
        assert_eq!(outputs.len(), 1);
        assert!(matches!(
            &outputs[0],
            TransferOutput::ProposeColony { bee, entry: ColonyEntry::Control(ControlEntry::InstallCells { .. }) }
                if *bee == BeeId::new(11)
        ));
        assert!(matches!(transfer.phase, TransferPhase::Installing));

        // Install applied: registry rebind proposed.
        let outputs = transfer.on_install_committed();
        assert!(matches!(
            outputs[0],
            TransferOutput::ProposeRegistry(RegistryCommand::Transfer { .. })
        ));

        // Rebind committed: source drops cells, transfer completes.
        let outputs = transfer.on_transfer_committed();
        assert_eq!(outputs.len(), 2);
        assert!(matches!(
            &outputs[0],
            TransferOutput::ProposeColony { bee, entry: ColonyEntry::Control(ControlEntry::RemoveCells { .. }) }
                if *bee == BeeId::new(10)
        ));
        assert!(matches!(outputs[1], TransferOutput::Completed));
        assert!(transfer.phase.is_terminal());
    }

    #[test]
    fn test_quiesce_before_drain_waits() {
        let mut transfer = make_transfer();
        transfer.start();

        // Quiesce commits before the drain: install must wait.
        let outputs = transfer.on_quiesce_committed(vec![InstalledCell {
            cell: cell("c3"),
            value: Some(Bytes::from("v")),
            version: 1,
        }]);
        assert!(outputs.is_empty());
        assert!(matches!(
            transfer.phase,
            TransferPhase::Draining {
                drain_committed: false,
                quiesce_committed: true,
            }
        ));

        // The drain lands afterwards and the held values go out.
        let outputs = transfer.on_drain_committed();
        assert_eq!(outputs.len(), 1);
        assert!(matches!(
            &outputs[0],
            TransferOutput::ProposeColony { entry: ColonyEntry::Control(ControlEntry::InstallCells { cells }), .. }
                if cells.len() == 1
        ));
    }

    #[test]
    fn test_fail_unquiesces_source() {
        let mut transfer = make_transfer();
        transfer.start();

        let outputs = transfer.fail("timeout");
        assert!(matches!(
            &outputs[0],
            TransferOutput::ProposeColony { entry: ColonyEntry::Control(ControlEntry::Unquiesce { .. }), .. }
        ));
        assert!(matches!(outputs[1], TransferOutput::Failed { .. }));
        assert!(transfer.phase.is_terminal());
    }

    #[test]
    fn test_timeout_detection() {
        let transfer = make_transfer();
        assert!(!transfer.is_timed_out(200));
        assert!(transfer.is_timed_out(100 + TRANSFER_TIMEOUT_TICKS + 1));
    }

    #[test]
    #[should_panic(expected = "must differ")]
    fn test_same_source_target_panics() {
        let _ = CellTransfer::new(vec![cell("x")], BeeId::new(1), BeeId::new(1), 0);
    }

    #[test]
    fn test_out_of_phase_events_ignored() {
        let mut transfer = make_transfer();
        // Events arriving before start are no-ops.
        assert!(transfer.on_install_committed().is_empty());
        assert!(transfer.on_transfer_committed().is_empty());
        assert!(matches!(transfer.phase, TransferPhase::Planned));
    }
}
