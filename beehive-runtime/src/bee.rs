//! The bee actor: one long-lived task per local colony replica.
//!
//! The actor owns the bee's state machine and its bounded input queue.
//! On the colony leader it is also the handler executor: it picks one
//! message at a time, runs `rcv` against a fresh transaction, proposes the
//! transaction entry to the colony group, and resumes only when the entry
//! comes back through the committed stream. Followers run the same actor
//! with the executor half idle, applying committed entries as they arrive.
//!
//! # Message Flow
//!
//! 1. `Deliver`: router hands over a message with its mapped cells
//! 2. executor runs `rcv`, proposes the transaction, records it in flight
//! 3. `Committed`: the entry returns; the machine applies it; emits flush
//! 4. on read-set invalidation the executor retries with refreshed reads

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use beehive_core::{BeeId, Cell, Envelope, HiveError, Limits, OutboundPolicy};
use beehive_state::{
    ApplyOutcome, BeeMachine, ColonyEntry, ControlEntry, InstalledCell, Transaction,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::handler::{App, RcvCtx};
use crate::service::ServiceCommand;

/// Reply channel for a delivered message.
pub type DeliverReply = oneshot::Sender<Result<(), HiveError>>;

/// Reply channel for a cell read.
pub type ReadReply = oneshot::Sender<Result<Option<Bytes>, HiveError>>;

/// Commands to a bee actor.
#[derive(Debug)]
pub enum BeeCommand {
    /// A routed message for this bee.
    Deliver {
        /// The message.
        env: Envelope,
        /// Its mapped cells, resolved by the router.
        cells: Vec<Cell>,
        /// Optional reply resolved at commit or failure.
        reply: Option<DeliverReply>,
    },
    /// A committed colony entry to apply.
    Committed {
        /// Entry index.
        index: u64,
        /// Encoded entry.
        data: Bytes,
    },
    /// Leadership of the colony changed.
    LeaderChanged {
        /// True if this node now leads.
        is_leader: bool,
    },
    /// Read a cell's current value.
    ReadCell {
        /// The cell.
        cell: Cell,
        /// Reply with the value, if any.
        reply: ReadReply,
    },
    /// Stop the actor.
    Shutdown,
}

/// A message waiting in the bee's queue.
#[derive(Debug)]
struct QueuedMsg {
    env: Envelope,
    cells: Vec<Cell>,
    reply: Option<DeliverReply>,
    attempts: u32,
}

/// The transaction currently awaiting commit.
#[derive(Debug)]
struct InFlight {
    qm: QueuedMsg,
    index: u64,
}

/// One local replica of a bee.
pub struct BeeActor {
    bee: BeeId,
    app: Arc<App>,
    machine: BeeMachine,
    limits: Limits,
    persistent: bool,

    queue: VecDeque<QueuedMsg>,
    /// Messages held back because their cells are quiesced by a transfer.
    parked: Vec<QueuedMsg>,
    in_flight: Option<InFlight>,
    is_leader: bool,
    entries_since_snapshot: u64,

    svc_tx: mpsc::Sender<ServiceCommand>,
    cmd_rx: mpsc::UnboundedReceiver<BeeCommand>,
}

impl BeeActor {
    /// Creates an actor over a (possibly recovered) machine.
    #[must_use]
    pub fn new(
        app: Arc<App>,
        machine: BeeMachine,
        limits: Limits,
        persistent: bool,
        svc_tx: mpsc::Sender<ServiceCommand>,
        cmd_rx: mpsc::UnboundedReceiver<BeeCommand>,
    ) -> Self {
        Self {
            bee: machine.bee(),
            app,
            machine,
            limits,
            persistent,
            queue: VecDeque::new(),
            parked: Vec::new(),
            in_flight: None,
            is_leader: false,
            entries_since_snapshot: 0,
            svc_tx,
            cmd_rx,
        }
    }

    /// Runs the actor until shutdown.
    pub async fn run(mut self) {
        info!(bee = %self.bee, app = %self.app.name, "bee actor started");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                BeeCommand::Deliver { env, cells, reply } => {
                    self.on_deliver(env, cells, reply);
                }
                BeeCommand::Committed { index, data } => {
                    self.on_committed(index, data).await;
                }
                BeeCommand::LeaderChanged { is_leader } => {
                    debug!(bee = %self.bee, is_leader, "leadership changed");
                    self.is_leader = is_leader;
                    if !is_leader {
                        self.hand_back_work().await;
                    }
                }
                BeeCommand::ReadCell { cell, reply } => {
                    let value = self.machine.dicts().get(&cell).0.cloned();
                    let _ = reply.send(Ok(value));
                }
                BeeCommand::Shutdown => break,
            }
            self.pump().await;
        }
        info!(bee = %self.bee, "bee actor stopped");
    }

    fn on_deliver(&mut self, env: Envelope, cells: Vec<Cell>, reply: Option<DeliverReply>) {
        if self.queue.len() >= self.limits.max_bee_queue_depth as usize {
            warn!(bee = %self.bee, trace = %env.trace, "bee queue full, message rejected");
            if let Some(reply) = reply {
                let _ = reply.send(Err(HiveError::LimitExceeded {
                    limit: "max_bee_queue_depth",
                    max: u64::from(self.limits.max_bee_queue_depth),
                    actual: self.queue.len() as u64,
                }));
            }
            return;
        }
        self.queue.push_back(QueuedMsg {
            env,
            cells,
            reply,
            attempts: 0,
        });
    }

    async fn on_committed(&mut self, index: u64, data: Bytes) {
        let entry = match ColonyEntry::decode(data) {
            Ok(entry) => entry,
            Err(e) => {
                error!(bee = %self.bee, index, error = %e, "undecodable colony entry");
                return;
            }
        };

        let outcome = self.machine.apply(index, &entry);

        // Control entries move parked work around.
        if let ColonyEntry::Control(control) = &entry {
            self.on_control_applied(control).await;
        }

        // Resolve the in-flight transaction if this was it.
        let ours = self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.index == index);
        if ours {
            let Some(in_flight) = self.in_flight.take() else {
                return;
            };
            self.resolve_in_flight(in_flight.qm, &outcome).await;
        } else if self.is_leader {
            // Entries applied while catching up after a failover: release
            // their emits again. Receivers deduplicate by message id.
            if let ApplyOutcome::Committed { emits } = outcome {
                if !emits.is_empty() {
                    let _ = self
                        .svc_tx
                        .send(ServiceCommand::EmitBatch { emits })
                        .await;
                }
            }
        }

        self.maybe_snapshot().await;
    }

    async fn on_control_applied(&mut self, control: &ControlEntry) {
        match control {
            ControlEntry::Quiesce { cells } => {
                if self.is_leader {
                    // Hand the frozen values to the transfer coordinator.
                    let values = cells
                        .iter()
                        .map(|cell| {
                            let (value, version) = self.machine.dicts().get(cell);
                            InstalledCell {
                                cell: cell.clone(),
                                value: value.cloned(),
                                version,
                            }
                        })
                        .collect();
                    let _ = self
                        .svc_tx
                        .send(ServiceCommand::QuiesceApplied {
                            bee: self.bee,
                            values,
                        })
                        .await;
                }
            }
            ControlEntry::Unquiesce { .. } => {
                // Resume everything whose cells are clear again.
                let (unparked, still_parked): (Vec<_>, Vec<_>) = self
                    .parked
                    .drain(..)
                    .partition(|qm| !qm.cells.iter().any(|c| self.machine.is_quiesced(c)));
                self.parked = still_parked;
                for qm in unparked.into_iter().rev() {
                    self.queue.push_front(qm);
                }
            }
            ControlEntry::RemoveCells { cells } => {
                // Cells moved away: parked messages for them re-route to
                // the new owner.
                let (to_reroute, still_parked): (Vec<_>, Vec<_>) = self
                    .parked
                    .drain(..)
                    .partition(|qm| qm.cells.iter().any(|c| cells.contains(c)));
                self.parked = still_parked;
                for qm in to_reroute {
                    debug!(bee = %self.bee, trace = %qm.env.trace, "rerouting after cell transfer");
                    let _ = self
                        .svc_tx
                        .send(ServiceCommand::Inject {
                            env: qm.env,
                            reply: qm.reply,
                        })
                        .await;
                }
            }
            ControlEntry::InstallCells { .. } | ControlEntry::SnapshotMark => {}
        }
    }

    async fn resolve_in_flight(&mut self, mut qm: QueuedMsg, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Committed { emits } => {
                if !emits.is_empty() {
                    let _ = self
                        .svc_tx
                        .send(ServiceCommand::EmitBatch {
                            emits: emits.clone(),
                        })
                        .await;
                }
                self.entries_since_snapshot += 1;
                if let Some(reply) = qm.reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            ApplyOutcome::Duplicate => {
                // Redelivery: effects are already in; the sender is happy.
                if let Some(reply) = qm.reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            ApplyOutcome::ReadSetInvalid { cell, observed, current } => {
                qm.attempts += 1;
                debug!(
                    bee = %self.bee,
                    trace = %qm.env.trace,
                    cell = ?cell,
                    observed,
                    current,
                    attempt = qm.attempts,
                    "read set invalidated"
                );
                if qm.attempts > self.limits.max_txn_retries {
                    warn!(bee = %self.bee, trace = %qm.env.trace, "transaction aborted after retries");
                    if let Some(reply) = qm.reply.take() {
                        let _ = reply.send(Err(HiveError::TransactionAborted {
                            attempts: qm.attempts,
                        }));
                    }
                } else {
                    // Retry with refreshed reads, ahead of newer work.
                    self.queue.push_front(qm);
                }
            }
            ApplyOutcome::Quiesced { cell } => {
                debug!(bee = %self.bee, cell = ?cell, "message parked behind drain");
                self.parked.push(qm);
            }
            ApplyOutcome::ControlApplied => {}
        }
    }

    /// A demoted replica returns queued and in-flight work to the router,
    /// which forwards it to the new leader. An in-flight transaction that
    /// did commit elsewhere is collapsed by the dedup window on
    /// redelivery.
    async fn hand_back_work(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            let _ = self
                .svc_tx
                .send(ServiceCommand::Inject {
                    env: in_flight.qm.env,
                    reply: in_flight.qm.reply,
                })
                .await;
        }
        let queued: Vec<QueuedMsg> = self.queue.drain(..).chain(self.parked.drain(..)).collect();
        for qm in queued {
            let _ = self
                .svc_tx
                .send(ServiceCommand::Inject {
                    env: qm.env,
                    reply: qm.reply,
                })
                .await;
        }
    }

    /// Starts the next transaction if the executor is idle.
    async fn pump(&mut self) {
        while self.is_leader && self.in_flight.is_none() {
            let Some(qm) = self.queue.pop_front() else {
                return;
            };
            self.execute(qm).await;
        }
    }

    async fn execute(&mut self, mut qm: QueuedMsg) {
        let now = now_us();

        // Expired messages abort before proposing anything.
        if qm.env.deadline_us.is_some_and(|deadline| now > deadline) {
            debug!(bee = %self.bee, trace = %qm.env.trace, "message deadline expired");
            if let Some(reply) = qm.reply.take() {
                let _ = reply.send(Err(HiveError::Timeout {
                    operation: "deliver",
                    waited_us: now.saturating_sub(qm.env.deadline_us.unwrap_or(now)),
                }));
            }
            return;
        }

        // Work behind an active drain parks until the transfer settles.
        if qm.cells.iter().any(|c| self.machine.is_quiesced(c)) {
            self.parked.push(qm);
            return;
        }

        let Some(handler) = self.app.handler(&qm.env.type_tag).cloned() else {
            warn!(bee = %self.bee, tag = %qm.env.type_tag, "no handler bound, dropping");
            if let Some(reply) = qm.reply.take() {
                let _ = reply.send(Err(HiveError::NotFound {
                    resource: "handler",
                    id: 0,
                }));
            }
            return;
        };

        let mut txn = Transaction::new(qm.env.id, qm.env.trace);
        let result = {
            let mut ctx = RcvCtx::new(self.bee, now, self.machine.dicts(), &mut txn);
            handler.rcv(&qm.env, &mut ctx)
        };

        if let Err(e) = result {
            warn!(bee = %self.bee, trace = %qm.env.trace, error = %e, "handler failed");
            match self.app.options.outbound {
                OutboundPolicy::AtLeastOnce => {
                    qm.attempts += 1;
                    if qm.attempts > self.limits.max_txn_retries {
                        error!(bee = %self.bee, trace = %qm.env.trace, "handler failed repeatedly, dropping");
                        if let Some(reply) = qm.reply.take() {
                            let _ = reply.send(Err(HiveError::HandlerFailed {
                                reason: e.reason,
                            }));
                        }
                    } else {
                        self.queue.push_back(qm);
                    }
                }
                OutboundPolicy::AtMostOnce => {
                    if let Some(reply) = qm.reply.take() {
                        let _ = reply.send(Err(HiveError::HandlerFailed { reason: e.reason }));
                    }
                }
            }
            return;
        }

        let staged = txn.staged_bytes();
        if staged > self.limits.max_txn_bytes {
            warn!(bee = %self.bee, trace = %qm.env.trace, staged, "transaction too large");
            if let Some(reply) = qm.reply.take() {
                let _ = reply.send(Err(HiveError::TransactionTooLarge {
                    size: staged,
                    max: self.limits.max_txn_bytes,
                }));
            }
            return;
        }

        // Propose and wait for the index assignment (not the commit).
        let entry = ColonyEntry::Txn(txn);
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .svc_tx
            .send(ServiceCommand::ProposeColony {
                bee: self.bee,
                entry: entry.encode(),
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            if let Some(reply) = qm.reply.take() {
                let _ = reply.send(Err(HiveError::Shutdown));
            }
            return;
        }

        match reply_rx.await {
            Ok(Ok(index)) => {
                self.in_flight = Some(InFlight { qm, index });
            }
            Ok(Err(HiveError::NotLeader { .. })) => {
                debug!(bee = %self.bee, "lost leadership before proposing");
                self.is_leader = false;
                // The message goes back; the router re-forwards it.
                let _ = self
                    .svc_tx
                    .send(ServiceCommand::Inject {
                        env: qm.env,
                        reply: qm.reply,
                    })
                    .await;
            }
            Ok(Err(e)) => {
                if let Some(reply) = qm.reply.take() {
                    let _ = reply.send(Err(e));
                }
            }
            Err(_) => {
                if let Some(reply) = qm.reply.take() {
                    let _ = reply.send(Err(HiveError::Shutdown));
                }
            }
        }
    }

    async fn maybe_snapshot(&mut self) {
        if !self.persistent || self.entries_since_snapshot < self.limits.snapshot_every_entries {
            return;
        }
        self.entries_since_snapshot = 0;
        let _ = self
            .svc_tx
            .send(ServiceCommand::SnapshotTaken {
                bee: self.bee,
                applied_index: self.machine.applied_index(),
                state: self.machine.encode_snapshot(),
            })
            .await;
    }
}

impl std::fmt::Debug for BeeActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeeActor")
            .field("bee", &self.bee)
            .field("is_leader", &self.is_leader)
            .field("queued", &self.queue.len())
            .field("parked", &self.parked.len())
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

/// Microseconds since the Unix epoch.
#[must_use]
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
