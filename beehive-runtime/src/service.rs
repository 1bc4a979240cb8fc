//! The node service loop.
//!
//! One task per node owns the consensus engine, the applied registry, the
//! routing caches, and the handles to every local bee actor. All state
//! transitions happen inside this loop; bee actors and the transport talk
//! to it through channels. Handlers are synchronous and stage outbound
//! frames in an outbox that is flushed between events, which keeps the
//! loop free of re-entrant awaits.
//!
//! Responsibilities, in spec terms: the router (map, lookup, claim,
//! forward), the colony manager (membership repair, leader announcements),
//! failure detection over peer heartbeats, advisory placement, and the
//! cell-transfer coordinator.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use beehive_core::{
    AppName, BeeId, Cell, Envelope, Epoch, GroupId, HiveError, NodeId,
};
use beehive_registry::{RegistryCommand, RegistryEvent, RegistryState, Resolution};
use beehive_routing::{
    BeeStats, CellTransfer, LeaderCache, MapCache, Rebalancer, TransferOutput,
    ROUTING_RETRIES_MAX,
};
use beehive_state::{BeeMachine, ColonyEntry, InstalledCell, StampedEmit};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bee::{now_us, BeeActor, BeeCommand, DeliverReply, ReadReply};
use crate::codec::{ForwardFrame, WireMessage};
use crate::config::HiveConfig;
use crate::group::{GroupEngine, GroupOutput};
use crate::handler::{App, MapCtx};
use crate::transport::PeerTransport;

/// Reply channel for an operator-surface action.
pub type OpReply = oneshot::Sender<Result<(), HiveError>>;

/// Ticks between heartbeat broadcasts.
const HEARTBEAT_WIRE_TICKS: u64 = 3;

/// Ticks before an unanswered claim is re-proposed.
const CLAIM_RETRY_TICKS: u64 = 20;

/// Description of one bee, for the operator surface.
#[derive(Debug, Clone)]
pub struct BeeInfo {
    /// The bee.
    pub bee: BeeId,
    /// Its application.
    pub app: AppName,
    /// Number of cells it owns.
    pub cell_count: usize,
    /// Its colony, leader first.
    pub colony: Vec<NodeId>,
    /// True if a replica runs on this node.
    pub local: bool,
    /// True if the bee lost quorum.
    pub stalled: bool,
}

/// Commands into the service loop.
#[derive(Debug)]
pub enum ServiceCommand {
    /// Route a message (external injection or re-injection).
    Inject {
        /// The message.
        env: Envelope,
        /// Optional reply resolved at commit or failure.
        reply: Option<DeliverReply>,
    },
    /// A bee actor proposing a colony entry. Replies with the assigned
    /// log index, or `NotLeader`.
    ProposeColony {
        /// The bee.
        bee: BeeId,
        /// Encoded entry.
        entry: Bytes,
        /// Index reply.
        reply: oneshot::Sender<Result<u64, HiveError>>,
    },
    /// Committed emits released by a bee; route them.
    EmitBatch {
        /// The stamped emits, in sequence order.
        emits: Vec<StampedEmit>,
    },
    /// A source bee applied a quiesce; here are the frozen values.
    QuiesceApplied {
        /// The source bee.
        bee: BeeId,
        /// The cell values at quiesce.
        values: Vec<InstalledCell>,
    },
    /// A bee cut a snapshot; persist and compact.
    SnapshotTaken {
        /// The bee.
        bee: BeeId,
        /// Applied index the snapshot covers.
        applied_index: u64,
        /// Serialized machine.
        state: Bytes,
    },
    /// Read a cell's value (test and operator surface).
    ReadCell {
        /// The cell.
        cell: Cell,
        /// Value reply.
        reply: ReadReply,
    },
    /// List known bees.
    ListBees {
        /// Reply.
        reply: oneshot::Sender<Vec<BeeInfo>>,
    },
    /// Move cells from their owner to a fresh bee on this node. The
    /// caller must lead the source colony; the coordinator runs here.
    MoveCells {
        /// The cells to move.
        cells: Vec<Cell>,
        /// Reply resolved when the transfer completes or fails.
        reply: OpReply,
    },
    /// Rebuild a stalled bee's colony from this node's replica.
    ForceRecover {
        /// The stalled bee.
        bee: BeeId,
        /// Reply.
        reply: OpReply,
    },
    /// Run a placement pass now.
    Rebalance,
    /// Begin cooperative shutdown.
    Shutdown {
        /// Resolved when the node has stopped.
        reply: oneshot::Sender<()>,
    },
}

/// A claim awaiting its commit, holding the message that triggered it.
#[derive(Debug)]
struct PendingClaim {
    cells: Vec<Cell>,
    env: Envelope,
    reply: Option<DeliverReply>,
    hops: u8,
    since_tick: u64,
}

/// A message that could not be routed yet (no leader known).
#[derive(Debug)]
struct Unrouted {
    env: Envelope,
    cells: Option<Vec<Cell>>,
    reply: Option<DeliverReply>,
    hops: u8,
}

/// A cell move waiting for its target bee to be born.
#[derive(Debug)]
struct PendingMove {
    cells: Vec<Cell>,
    from_bee: BeeId,
    app: AppName,
    reply: Option<OpReply>,
}

/// Handle to one local bee actor.
struct LocalBee {
    tx: mpsc::UnboundedSender<BeeCommand>,
}

/// The node service.
pub struct NodeService<T: PeerTransport> {
    config: HiveConfig,
    apps: HashMap<AppName, Arc<App>>,
    tag_index: HashMap<String, AppName>,
    config_hash: u64,

    engine: GroupEngine,
    registry: RegistryState,
    bees: HashMap<BeeId, LocalBee>,
    stalled: HashSet<BeeId>,

    leader_cache: LeaderCache,
    map_cache: MapCache,
    stats: HashMap<BeeId, BeeStats>,
    rebalancer: Rebalancer,

    transport: T,
    incoming_rx: mpsc::Receiver<WireMessage>,
    cmd_rx: mpsc::Receiver<ServiceCommand>,
    cmd_tx: mpsc::Sender<ServiceCommand>,

    /// Outbound frames staged by sync handlers, flushed between events.
    outbox: Vec<(NodeId, WireMessage)>,
    /// Group outputs pending sync handling.
    pending_outputs: VecDeque<GroupOutput>,

    pending_claims: Vec<PendingClaim>,
    pending_moves: Vec<PendingMove>,
    unrouted: VecDeque<Unrouted>,
    active_transfers: Vec<(CellTransfer, Option<OpReply>)>,
    /// Colony proposals waiting for their group's leader to be known.
    deferred_colony: Vec<(BeeId, Bytes, u64)>,

    heartbeat_seen: HashMap<NodeId, u64>,
    cluster_id: Option<u128>,
    bootstrap_node: NodeId,
    tick: u64,
    registered: bool,
    refused: bool,
    shutdown: Option<(u64, oneshot::Sender<()>)>,
}

impl<T: PeerTransport> NodeService<T> {
    /// Builds the service, recovering any persisted state.
    ///
    /// # Errors
    /// Returns an error if recovery or group creation fails.
    #[allow(clippy::too_many_lines)]
    pub fn new(
        config: HiveConfig,
        apps: Vec<App>,
        transport: T,
        incoming_rx: mpsc::Receiver<WireMessage>,
        cmd_rx: mpsc::Receiver<ServiceCommand>,
        cmd_tx: mpsc::Sender<ServiceCommand>,
    ) -> Result<Self, crate::error::RuntimeError> {
        config.validate()?;

        let mut app_map = HashMap::new();
        let mut tag_index = HashMap::new();
        let mut config_hash: u64 = 0x6265_6568_6976_6521;
        let mut names: Vec<&App> = apps.iter().collect();
        names.sort_by(|a, b| a.name.cmp(&b.name));
        for app in &names {
            config_hash = config_hash.rotate_left(17) ^ app.config_word();
        }
        for app in apps {
            app.options.validate()?;
            for tag in app.type_tags() {
                let clash = tag_index.insert(tag.to_owned(), app.name.clone());
                assert!(clash.is_none(), "type tag '{tag}' bound by two applications");
            }
            app_map.insert(app.name.clone(), Arc::new(app));
        }

        let persist = config.data_dir.is_some();
        let mut engine = GroupEngine::new(
            config.node_id,
            config.data_dir.clone(),
            config.timing.election_ticks,
            config.timing.heartbeat_ticks,
        );

        // Recover the cluster group: registry snapshot plus committed
        // commands after it.
        let recovered = engine.recover_group(GroupId::CLUSTER, persist)?;
        let mut registry = match &recovered.snapshot {
            Some((_, data)) => RegistryState::decode_snapshot(data.clone()).unwrap_or_else(|e| {
                error!(error = %e, "registry snapshot unusable, starting empty");
                RegistryState::new()
            }),
            None => RegistryState::new(),
        };
        let mut last_term = 0;
        for (index, term, data) in &recovered.entries {
            last_term = *term;
            match RegistryCommand::decode(data.clone()) {
                Ok(cmd) => {
                    registry.apply(*index, &cmd);
                }
                Err(e) => warn!(index, error = %e, "skipping undecodable registry entry"),
            }
        }
        engine.create_group(
            GroupId::CLUSTER,
            config.cluster_nodes(),
            persist,
            recovered.last_index(),
            last_term,
        )?;

        let bootstrap_node = config
            .cluster_nodes()
            .first()
            .copied()
            .unwrap_or(config.node_id);
        let cluster_id = (config.node_id == bootstrap_node).then(rand::random::<u128>);

        let mut service = Self {
            config,
            apps: app_map,
            tag_index,
            config_hash,
            engine,
            registry,
            bees: HashMap::new(),
            stalled: HashSet::new(),
            leader_cache: LeaderCache::with_defaults(),
            map_cache: MapCache::new(),
            stats: HashMap::new(),
            rebalancer: Rebalancer::default(),
            transport,
            incoming_rx,
            cmd_rx,
            cmd_tx,
            outbox: Vec::new(),
            pending_outputs: VecDeque::new(),
            pending_claims: Vec::new(),
            pending_moves: Vec::new(),
            unrouted: VecDeque::new(),
            active_transfers: Vec::new(),
            deferred_colony: Vec::new(),
            heartbeat_seen: HashMap::new(),
            cluster_id,
            bootstrap_node,
            tick: 0,
            registered: false,
            refused: false,
            shutdown: None,
        };
        // Revive local replicas recorded in the recovered registry.
        let local_bees: Vec<(BeeId, AppName, Vec<NodeId>)> = service
            .registry
            .bees()
            .filter(|b| b.colony.contains(&service.config.node_id))
            .map(|b| (b.bee, b.app.clone(), b.colony.clone()))
            .collect();
        for (bee, app, colony) in local_bees {
            if let Err(e) = service.spawn_local_bee(bee, &app, colony) {
                error!(%bee, error = %e, "failed to revive bee");
            }
        }

        Ok(service)
    }

    /// Runs the service until shutdown completes.
    pub async fn run(mut self) {
        info!(node = %self.config.node_id, "node service running");
        let mut ticker = tokio::time::interval(self.config.timing.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let stop = tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => true,
                    }
                }
                incoming = self.incoming_rx.recv() => {
                    if let Some(msg) = incoming {
                        self.handle_wire(msg);
                    }
                    false
                }
                _ = ticker.tick() => self.handle_tick(),
            };
            self.drain_outputs();
            self.flush_outbox().await;
            if stop {
                break;
            }
        }

        // Stop the actors; the reply tells the handle we are done.
        for local in self.bees.values() {
            let _ = local.tx.send(BeeCommand::Shutdown);
        }
        if let Some((_, reply)) = self.shutdown.take() {
            let _ = reply.send(());
        }
        info!(node = %self.config.node_id, "node service stopped");
    }

    // ------------------------------------------------------------------
    // Command handling
    // ------------------------------------------------------------------

    /// Returns true when the loop should exit.
    fn handle_command(&mut self, cmd: ServiceCommand) -> bool {
        match cmd {
            ServiceCommand::Inject { env, reply } => {
                self.route(env, None, reply, 0);
            }
            ServiceCommand::ProposeColony { bee, entry, reply } => {
                let _ = reply.send(self.propose_colony_local(bee, entry));
            }
            ServiceCommand::EmitBatch { emits } => {
                for emit in emits {
                    let env = Envelope {
                        type_tag: emit.record.type_tag,
                        payload: emit.record.payload,
                        from_bee: Some(emit.from_bee),
                        id: emit.msg_id,
                        trace: emit.trace,
                        deadline_us: None,
                    };
                    self.route(env, None, None, 0);
                }
            }
            ServiceCommand::QuiesceApplied { bee, values } => {
                self.on_quiesce_applied(bee, values);
            }
            ServiceCommand::SnapshotTaken {
                bee,
                applied_index,
                state,
            } => {
                if let Err(e) =
                    self.engine
                        .record_snapshot(GroupId::colony(bee), applied_index, state)
                {
                    warn!(%bee, error = %e, "failed to record snapshot");
                }
            }
            ServiceCommand::ReadCell { cell, reply } => {
                self.read_cell(cell, reply);
            }
            ServiceCommand::ListBees { reply } => {
                let infos = self
                    .registry
                    .bees()
                    .map(|b| BeeInfo {
                        bee: b.bee,
                        app: b.app.clone(),
                        cell_count: b.cells.len(),
                        colony: b.colony.clone(),
                        local: self.bees.contains_key(&b.bee),
                        stalled: self.stalled.contains(&b.bee),
                    })
                    .collect();
                let _ = reply.send(infos);
            }
            ServiceCommand::MoveCells { cells, reply } => {
                self.start_move(cells, Some(reply));
            }
            ServiceCommand::ForceRecover { bee, reply } => {
                let _ = reply.send(self.force_recover(bee));
            }
            ServiceCommand::Rebalance => self.run_rebalance(),
            ServiceCommand::Shutdown { reply } => {
                info!(node = %self.config.node_id, "shutdown requested, draining");
                let drain_ticks = (self.config.timing.shutdown_drain.as_millis()
                    / self.config.timing.tick_interval.as_millis().max(1))
                    as u64;
                self.shutdown = Some((self.tick + drain_ticks.max(1), reply));
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Wire handling
    // ------------------------------------------------------------------

    fn handle_wire(&mut self, msg: WireMessage) {
        match msg {
            WireMessage::Groups(messages) => {
                let outputs = self.engine.handle_messages(messages);
                self.pending_outputs.extend(outputs);
            }
            WireMessage::Forward(frame) => {
                self.on_forward(frame);
            }
            WireMessage::Heartbeat {
                node,
                cluster_id,
                config_hash,
            } => {
                self.on_heartbeat(node, cluster_id, config_hash);
            }
            WireMessage::TransferLead { group, target } => {
                let outputs = self.engine.transfer_leadership(group, target);
                self.pending_outputs.extend(outputs);
            }
            WireMessage::ProposeRegistry { cmd } => {
                if self.engine.is_leader(GroupId::CLUSTER) {
                    if let Some((_, outputs)) = self.engine.propose(GroupId::CLUSTER, cmd) {
                        self.pending_outputs.extend(outputs);
                    }
                } else {
                    // Relay toward the current leader, if known.
                    self.relay_registry_proposal(cmd);
                }
            }
            WireMessage::ProposeColony { bee, entry } => {
                if self.propose_colony_local(bee, entry).is_err() {
                    debug!(%bee, "dropped relayed colony proposal, not leader");
                }
            }
        }
    }

    fn on_forward(&mut self, frame: ForwardFrame) {
        // Epoch mismatches mean the forwarder routed on stale state; our
        // own registry read below supersedes it either way.
        if let Some(first) = frame.cells.first() {
            let current = self.registry.cell_epoch(first).unwrap_or(Epoch::new(0));
            if frame.epoch != current {
                debug!(presented = %frame.epoch, %current, "stale forward epoch, re-resolving");
            }
        }
        self.route(frame.env, Some(frame.cells), None, frame.hops);
    }

    fn on_heartbeat(&mut self, node: NodeId, cluster_id: u128, config_hash: u64) {
        // Adopt the bootstrap node's cluster identity; refuse strangers.
        match self.cluster_id {
            None if node == self.bootstrap_node => {
                self.cluster_id = Some(cluster_id);
                info!(%node, "adopted cluster identity");
            }
            Some(ours) if ours != cluster_id => {
                warn!(%node, "heartbeat from foreign cluster ignored");
                return;
            }
            _ => {}
        }
        self.heartbeat_seen.insert(node, self.tick);

        // The cluster leader admits first-seen (or returning) nodes; the
        // registry itself enforces the application-set check.
        let needs_admission = self.registry.node(node).map_or(true, |r| !r.alive);
        if self.engine.is_leader(GroupId::CLUSTER) && needs_admission {
            self.propose_registry(RegistryCommand::NodeJoined { node, config_hash });
        }
    }

    // ------------------------------------------------------------------
    // Tick handling
    // ------------------------------------------------------------------

    /// Returns true when a draining shutdown has finished.
    fn handle_tick(&mut self) -> bool {
        self.tick += 1;

        let outputs = self.engine.tick();
        self.pending_outputs.extend(outputs);

        if self.tick % HEARTBEAT_WIRE_TICKS == 0 {
            if let Some(cluster_id) = self.cluster_id {
                let hb = WireMessage::Heartbeat {
                    node: self.config.node_id,
                    cluster_id,
                    config_hash: self.config_hash,
                };
                for peer in &self.config.peers {
                    self.outbox.push((peer.node_id, hb.clone()));
                }
            }
        }

        // Failure detection on the cluster leader.
        if self.engine.is_leader(GroupId::CLUSTER) {
            let dead: Vec<NodeId> = self
                .registry
                .live_nodes()
                .into_iter()
                .filter(|&node| {
                    let timeout = u64::from(self.config.timing.dead_timeout_ticks);
                    // A node never heard from counts from our own start.
                    let seen = self.heartbeat_seen.get(&node).copied().unwrap_or(0);
                    node != self.config.node_id && self.tick.saturating_sub(seen) > timeout
                })
                .collect();
            for node in dead {
                warn!(%node, "node missed heartbeats, declaring dead");
                self.propose_registry(RegistryCommand::NodeLeft { node });
            }

            if self.tick % u64::from(self.config.timing.rebalance_interval_ticks) == 0 {
                self.run_rebalance();
            }
        }

        // Claims that never answered get re-routed (and re-proposed).
        let overdue: Vec<PendingClaim> = {
            let tick = self.tick;
            let (overdue, keep): (Vec<_>, Vec<_>) = self
                .pending_claims
                .drain(..)
                .partition(|c| tick.saturating_sub(c.since_tick) > CLAIM_RETRY_TICKS);
            self.pending_claims = keep;
            overdue
        };
        for claim in overdue {
            debug!(trace = %claim.env.trace, "retrying unanswered claim");
            self.route(claim.env, None, claim.reply, claim.hops);
        }

        // Unrouted messages try again now that elections may have settled.
        for _ in 0..self.unrouted.len() {
            let Some(u) = self.unrouted.pop_front() else {
                break;
            };
            self.route(u.env, u.cells, u.reply, u.hops);
        }

        // Deferred colony proposals try again; stale ones are dropped
        // once no transfer could still be waiting on them.
        let deferred: Vec<(BeeId, Bytes, u64)> = std::mem::take(&mut self.deferred_colony);
        for (bee, encoded, since_tick) in deferred {
            if self.tick.saturating_sub(since_tick)
                > beehive_routing::TRANSFER_TIMEOUT_TICKS
            {
                debug!(%bee, "dropping stale deferred colony proposal");
                continue;
            }
            self.submit_colony_proposal(bee, encoded, since_tick);
        }

        // Transfer timeouts.
        let mut timed_out = Vec::new();
        for (i, (transfer, _)) in self.active_transfers.iter().enumerate() {
            if !transfer.phase.is_terminal() && transfer.is_timed_out(self.tick) {
                timed_out.push(i);
            }
        }
        for i in timed_out.into_iter().rev() {
            let (mut transfer, reply) = self.active_transfers.remove(i);
            warn!(from = %transfer.from_bee, to = %transfer.to_bee, "cell transfer timed out");
            let outputs = transfer.fail("timed out");
            self.exec_transfer_outputs(outputs, reply);
        }

        self.engine.sync();

        // Cooperative shutdown: stop intake, wait out the drain, move
        // leaderships away, exit.
        if let Some((deadline, _)) = &self.shutdown {
            if self.tick >= *deadline {
                for group in self.led_colony_groups() {
                    if let Some(target) = self.pick_leadership_refuge(group) {
                        let outputs = self.engine.transfer_leadership(group, target);
                        self.pending_outputs.extend(outputs);
                    }
                }
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Group output handling
    // ------------------------------------------------------------------

    fn drain_outputs(&mut self) {
        while let Some(output) = self.pending_outputs.pop_front() {
            self.handle_output(output);
        }
    }

    fn handle_output(&mut self, output: GroupOutput) {
        match output {
            GroupOutput::Send { to, messages } => {
                self.outbox.push((to, WireMessage::Groups(messages)));
            }
            GroupOutput::Committed {
                group, index, data, ..
            } => {
                if group == GroupId::CLUSTER {
                    match RegistryCommand::decode(data) {
                        Ok(cmd) => {
                            if let Some(event) = self.registry.apply(index.get(), &cmd) {
                                self.react_event(event);
                            }
                            let applied = self.registry.applied_index();
                            if applied % self.config.limits.snapshot_every_entries == 0 {
                                let state = self.registry.encode_snapshot();
                                if let Err(e) =
                                    self.engine.record_snapshot(GroupId::CLUSTER, applied, state)
                                {
                                    warn!(error = %e, "failed to snapshot registry");
                                }
                            }
                        }
                        Err(e) => warn!(index = index.get(), error = %e, "undecodable registry command"),
                    }
                } else if let Some(bee) = group.colony_bee() {
                    if !self.active_transfers.is_empty() {
                        self.note_colony_commit(bee, &data);
                    }
                    if let Some(local) = self.bees.get(&bee) {
                        let _ = local.tx.send(BeeCommand::Committed {
                            index: index.get(),
                            data,
                        });
                    }
                }
            }
            GroupOutput::BecameLeader { group, .. } => {
                if group == GroupId::CLUSTER {
                    self.on_cluster_leadership();
                } else if let Some(bee) = group.colony_bee() {
                    info!(%bee, "leading colony");
                    if let Some(local) = self.bees.get(&bee) {
                        let _ = local.tx.send(BeeCommand::LeaderChanged { is_leader: true });
                    }
                    self.propose_registry(RegistryCommand::AnnounceLeader {
                        bee,
                        leader: self.config.node_id,
                    });
                }
            }
            GroupOutput::SteppedDown { group } => {
                if let Some(bee) = group.colony_bee() {
                    if let Some(local) = self.bees.get(&bee) {
                        let _ = local.tx.send(BeeCommand::LeaderChanged { is_leader: false });
                    }
                }
            }
        }
    }

    fn on_cluster_leadership(&mut self) {
        info!(node = %self.config.node_id, "leading the cluster group");
        if !self.registered {
            self.registered = true;
            let apps: Vec<(AppName, u64)> = self
                .apps
                .values()
                .map(|app| (app.name.clone(), app.config_word()))
                .collect();
            for (app, config_word) in apps {
                self.propose_registry(RegistryCommand::RegisterApp { app, config_word });
            }
            self.propose_registry(RegistryCommand::NodeJoined {
                node: self.config.node_id,
                config_hash: self.config_hash,
            });
        }
    }

    // ------------------------------------------------------------------
    // Registry event reactions (colony manager)
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn react_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Claimed {
                bee,
                app,
                cells,
                node,
            } => {
                debug!(%bee, %app, %node, "claim committed");
                if node == self.config.node_id {
                    if let Err(e) = self.spawn_local_bee(bee, &app, vec![node]) {
                        error!(%bee, error = %e, "failed to spawn claimed bee");
                    }
                }
                self.leader_cache.put(
                    bee,
                    node,
                    Epoch::new(self.registry.applied_index()),
                    now_us(),
                );
                self.grow_underreplicated_colonies();
                self.resume_claims_touching(&cells);
            }
            RegistryEvent::ClaimRejected { owners } => {
                let cells: Vec<Cell> = owners.values().flatten().cloned().collect();
                self.resume_claims_touching(&cells);
            }
            RegistryEvent::BeeCreated { bee, app, node } => {
                if node == self.config.node_id {
                    if let Err(e) = self.spawn_local_bee(bee, &app, vec![node]) {
                        error!(%bee, error = %e, "failed to spawn created bee");
                    }
                }
                // A move waiting for its target starts now.
                if let Some(pos) = self
                    .pending_moves
                    .iter()
                    .position(|m| m.app == app && node == self.config.node_id)
                {
                    let pending = self.pending_moves.remove(pos);
                    let mut transfer =
                        CellTransfer::new(pending.cells, pending.from_bee, bee, self.tick);
                    let outputs = transfer.start();
                    self.active_transfers.push((transfer, pending.reply));
                    self.exec_transfer_outputs(outputs, None);
                }
            }
            RegistryEvent::Drained { bee, .. } => {
                let mut staged = Vec::new();
                for (transfer, _) in &mut self.active_transfers {
                    if transfer.from_bee == bee {
                        staged.extend(transfer.on_drain_committed());
                    }
                }
                self.exec_transfer_outputs(staged, None);
            }
            RegistryEvent::Transferred {
                from_bee, to_bee, ..
            } => {
                let mut staged = Vec::new();
                let mut done = Vec::new();
                for (i, (transfer, _)) in self.active_transfers.iter_mut().enumerate() {
                    if transfer.from_bee == from_bee && transfer.to_bee == to_bee {
                        staged.extend(transfer.on_transfer_committed());
                        done.push(i);
                    }
                }
                self.exec_transfer_outputs(staged, None);
                for i in done.into_iter().rev() {
                    let (_, reply) = self.active_transfers.remove(i);
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            RegistryEvent::Released { bee } => {
                self.leader_cache.invalidate(bee);
                self.stalled.remove(&bee);
                if let Some(local) = self.bees.remove(&bee) {
                    let _ = local.tx.send(BeeCommand::Shutdown);
                    let _ = self.engine.remove_group(GroupId::colony(bee));
                }
            }
            RegistryEvent::ColonyChanged { bee, members } => {
                self.on_colony_changed(bee, members);
            }
            RegistryEvent::LeaderAnnounced { bee, leader } => {
                self.leader_cache.put(
                    bee,
                    leader,
                    Epoch::new(self.registry.applied_index()),
                    now_us(),
                );
            }
            RegistryEvent::NodeJoined { node } => {
                debug!(%node, "node joined the cluster");
                // Colonies claimed before this node arrived may now be
                // able to reach their replication factor.
                self.grow_underreplicated_colonies();
            }
            RegistryEvent::JoinRefused {
                node,
                cluster_hash,
                joiner_hash,
            } => {
                if node == self.config.node_id {
                    error!(
                        cluster_hash,
                        joiner_hash, "this node's application set differs; refusing to serve"
                    );
                    self.refused = true;
                }
            }
            RegistryEvent::NodeLeft { node } => {
                self.on_node_left(node);
            }
            RegistryEvent::AppRegistered { app } => {
                debug!(%app, "application registered");
            }
            RegistryEvent::Rejected { error } => {
                debug!(%error, "registry command rejected");
            }
        }
    }

    /// The cluster leader grows colonies toward their app's replication
    /// factor as live nodes allow, one `SetColony` per bee.
    fn grow_underreplicated_colonies(&mut self) {
        if !self.engine.is_leader(GroupId::CLUSTER) {
            return;
        }

        let candidates: Vec<(BeeId, usize, Vec<NodeId>)> = self
            .registry
            .bees()
            .filter_map(|record| {
                let app = self.apps.get(&record.app)?;
                let want = usize::from(app.options.replication);
                (record.colony.len() < want).then(|| (record.bee, want, record.colony.clone()))
            })
            .collect();

        for (bee, want, colony) in candidates {
            let mut members = colony.clone();
            for node in self.registry.live_nodes() {
                if members.len() >= want {
                    break;
                }
                if !members.contains(&node) {
                    members.push(node);
                }
            }
            if members.len() > colony.len() {
                self.propose_registry(RegistryCommand::SetColony { bee, members });
            }
        }
    }

    fn on_colony_changed(&mut self, bee: BeeId, members: Vec<NodeId>) {
        let in_colony = members.contains(&self.config.node_id);
        let group = GroupId::colony(bee);

        if in_colony {
            if self.engine.has_group(group) {
                if let Err(e) = self.engine.set_members(group, members.clone()) {
                    warn!(%bee, error = %e, "failed to reconfigure colony group");
                }
            } else if let Some(record) = self.registry.bee(bee) {
                let app = record.app.clone();
                if let Err(e) = self.spawn_local_bee(bee, &app, members.clone()) {
                    error!(%bee, error = %e, "failed to join colony");
                }
            }
        } else if self.engine.has_group(group) {
            if let Some(local) = self.bees.remove(&bee) {
                let _ = local.tx.send(BeeCommand::Shutdown);
            }
            let _ = self.engine.remove_group(group);
        }

        // Quorum check: fewer live members than a majority stalls the bee.
        let live = members
            .iter()
            .filter(|&&n| {
                n == self.config.node_id
                    || self.registry.node(n).is_some_and(|r| r.alive)
            })
            .count();
        if live < members.len() / 2 + 1 {
            warn!(%bee, live, total = members.len(), "colony lost quorum, bee stalled");
            self.stalled.insert(bee);
        } else {
            self.stalled.remove(&bee);
        }
    }

    fn on_node_left(&mut self, node: NodeId) {
        self.leader_cache.invalidate_node(node);
        self.heartbeat_seen.remove(&node);

        if !self.engine.is_leader(GroupId::CLUSTER) {
            return;
        }

        // Repair every colony that replicated on the dead node.
        let affected: Vec<(BeeId, Vec<NodeId>)> = self
            .registry
            .bees_on_node(node)
            .into_iter()
            .filter_map(|bee| {
                self.registry
                    .bee(bee)
                    .map(|record| (bee, record.colony.clone()))
            })
            .collect();

        for (bee, colony) in affected {
            let mut members: Vec<NodeId> = colony.iter().copied().filter(|&n| n != node).collect();
            if let Some(replacement) =
                Rebalancer::pick_replacement(&self.registry, &members, &self.stats)
            {
                members.push(replacement);
            }
            if members.is_empty() {
                warn!(%bee, "colony has no survivors, bee stalled until recovery");
                self.stalled.insert(bee);
                continue;
            }
            self.propose_registry(RegistryCommand::SetColony { bee, members });
        }
    }

    // ------------------------------------------------------------------
    // Routing (component E)
    // ------------------------------------------------------------------

    fn route(
        &mut self,
        env: Envelope,
        known_cells: Option<Vec<Cell>>,
        reply: Option<DeliverReply>,
        hops: u8,
    ) {
        if self.shutdown.is_some() || self.refused {
            let err = if self.refused {
                HiveError::ConfigMismatch {
                    cluster: 0,
                    joiner: self.config_hash,
                }
            } else {
                HiveError::Shutdown
            };
            if let Some(reply) = reply {
                let _ = reply.send(Err(err));
            }
            return;
        }

        // 1. Handler lookup by type tag.
        let Some(app_name) = self.tag_index.get(&env.type_tag).cloned() else {
            warn!(tag = %env.type_tag, trace = %env.trace, "no handler for message, dropped");
            if let Some(reply) = reply {
                let _ = reply.send(Err(HiveError::NotFound {
                    resource: "handler",
                    id: 0,
                }));
            }
            return;
        };

        // 2. Map (or reuse the forwarder's cells).
        let cells: Vec<Cell> = match known_cells {
            Some(cells) if !cells.is_empty() => cells,
            _ => {
                let Some(mapped) = self.run_map(&app_name, &env) else {
                    warn!(tag = %env.type_tag, trace = %env.trace, "map returned no cells, dropped");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(HiveError::InvalidArgument {
                            name: "map",
                            reason: "returned no cells",
                        }));
                    }
                    return;
                };
                mapped.into_iter().collect()
            }
        };

        // 3. Resolve ownership.
        match self.registry.lookup(cells.iter()) {
            Resolution::AllSame(bee) => {
                self.dispatch_to_bee(bee, env, cells, reply, hops);
            }
            Resolution::Unowned(_) => {
                self.propose_registry(RegistryCommand::Claim {
                    cells: cells.clone(),
                    app: app_name,
                    candidate_node: self.config.node_id,
                });
                self.pending_claims.push(PendingClaim {
                    cells,
                    env,
                    reply,
                    hops,
                    since_tick: self.tick,
                });
            }
            Resolution::Split { owners, unowned } => {
                warn!(
                    trace = %env.trace,
                    owners = owners.len(),
                    unowned = unowned.len(),
                    "mapped cells span ownership classes, rejected"
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Err(HiveError::SplitCells { owners }));
                }
            }
        }
    }

    fn dispatch_to_bee(
        &mut self,
        bee: BeeId,
        env: Envelope,
        cells: Vec<Cell>,
        reply: Option<DeliverReply>,
        hops: u8,
    ) {
        if self.stalled.contains(&bee) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(HiveError::Stalled { bee }));
            }
            return;
        }

        // Emit-graph stats feed placement.
        if let Some(src) = env.from_bee {
            *self
                .stats
                .entry(src)
                .or_default()
                .emits_to
                .entry(bee)
                .or_default() += 1;
        }

        let group = GroupId::colony(bee);
        if self.bees.contains_key(&bee) && self.engine.is_leader(group) {
            self.stats.entry(bee).or_default().messages += 1;
            if let Some(local) = self.bees.get(&bee) {
                let _ = local.tx.send(BeeCommand::Deliver { env, cells, reply });
            }
            return;
        }

        // Remote (or not-yet-elected local) owner: forward to its leader.
        if hops >= u8::try_from(ROUTING_RETRIES_MAX).unwrap_or(3) {
            warn!(trace = %env.trace, %bee, "routing retries exhausted");
            if let Some(reply) = reply {
                let _ = reply.send(Err(HiveError::NotLeader {
                    group,
                    known_leader: self.colony_leader(bee),
                }));
            }
            return;
        }

        match self.colony_leader(bee) {
            Some(leader) if leader != self.config.node_id => {
                let epoch = cells
                    .first()
                    .and_then(|c| self.registry.cell_epoch(c))
                    .unwrap_or(Epoch::new(0));
                self.outbox.push((
                    leader,
                    WireMessage::Forward(ForwardFrame {
                        env,
                        cells,
                        epoch,
                        hops: hops + 1,
                    }),
                ));
            }
            _ => {
                // Leader unknown, or it is us but the colony group has not
                // elected yet. Park and retry next tick.
                self.unrouted.push_back(Unrouted {
                    env,
                    cells: Some(cells),
                    reply,
                    hops,
                });
            }
        }
    }

    fn run_map(&mut self, app_name: &AppName, env: &Envelope) -> Option<beehive_core::MappedCells> {
        if let Some(cached) = self.map_cache.get(&env.type_tag, &env.payload) {
            return Some(cached);
        }
        let app = self.apps.get(app_name)?;
        let handler = app.handler(&env.type_tag)?;
        let ctx = MapCtx {
            node_id: self.config.node_id,
        };
        let mapped = handler.map(env, &ctx)?;
        self.map_cache.put(&env.type_tag, &env.payload, mapped.clone());
        Some(mapped)
    }

    fn resume_claims_touching(&mut self, cells: &[Cell]) {
        let (resume, keep): (Vec<_>, Vec<_>) = self
            .pending_claims
            .drain(..)
            .partition(|c| c.cells.iter().any(|cell| cells.contains(cell)));
        self.pending_claims = keep;
        for claim in resume {
            self.route(claim.env, Some(claim.cells), claim.reply, claim.hops);
        }
    }

    fn colony_leader(&self, bee: BeeId) -> Option<NodeId> {
        // The engine's own view wins for local groups; otherwise the
        // cache, then the registry record.
        if let Some((_, _, Some(leader))) = self.engine.status(GroupId::colony(bee)) {
            return Some(leader);
        }
        if let Some((leader, _)) = self.leader_cache.get(bee, now_us()) {
            return Some(leader);
        }
        self.registry.bee(bee).and_then(|record| record.leader())
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    fn propose_registry(&mut self, cmd: RegistryCommand) {
        let encoded = cmd.encode();
        if self.engine.is_leader(GroupId::CLUSTER) {
            if let Some((_, outputs)) = self.engine.propose(GroupId::CLUSTER, encoded) {
                self.pending_outputs.extend(outputs);
            }
        } else {
            self.relay_registry_proposal(encoded);
        }
    }

    fn relay_registry_proposal(&mut self, encoded: Bytes) {
        match self.engine.status(GroupId::CLUSTER).and_then(|(_, _, l)| l) {
            Some(leader) if leader != self.config.node_id => {
                self.outbox
                    .push((leader, WireMessage::ProposeRegistry { cmd: encoded }));
            }
            _ => {
                debug!("cluster leader unknown, dropping registry proposal (caller retries)");
            }
        }
    }

    fn propose_colony_local(&mut self, bee: BeeId, entry: Bytes) -> Result<u64, HiveError> {
        let group = GroupId::colony(bee);
        if self.engine.is_leader(group) {
            match self.engine.propose(group, entry) {
                Some((index, outputs)) => {
                    self.pending_outputs.extend(outputs);
                    Ok(index.get())
                }
                None => Err(HiveError::NotLeader {
                    group,
                    known_leader: None,
                }),
            }
        } else {
            Err(HiveError::NotLeader {
                group,
                known_leader: self.engine.status(group).and_then(|(_, _, l)| l),
            })
        }
    }

    fn propose_colony_or_forward(&mut self, bee: BeeId, entry: ColonyEntry) {
        self.submit_colony_proposal(bee, entry.encode(), self.tick);
    }

    fn submit_colony_proposal(&mut self, bee: BeeId, encoded: Bytes, since_tick: u64) {
        if self.propose_colony_local(bee, encoded.clone()).is_ok() {
            return;
        }
        match self.colony_leader(bee) {
            Some(leader) if leader != self.config.node_id => {
                self.outbox
                    .push((leader, WireMessage::ProposeColony { bee, entry: encoded }));
            }
            _ => {
                // The colony has no elected leader yet (fresh group, or a
                // failover in progress). Retry on the tick until the
                // transfer's own timeout gives up.
                debug!(%bee, "colony leader unknown, deferring proposal");
                self.deferred_colony.push((bee, encoded, since_tick));
            }
        }
    }

    // ------------------------------------------------------------------
    // Transfers, placement, recovery
    // ------------------------------------------------------------------

    fn start_move(&mut self, cells: Vec<Cell>, reply: Option<OpReply>) {
        match self.registry.lookup(cells.iter()) {
            Resolution::AllSame(from_bee) => {
                let Some(app) = self.registry.bee(from_bee).map(|r| r.app.clone()) else {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(HiveError::NotFound {
                            resource: "bee",
                            id: from_bee.get(),
                        }));
                    }
                    return;
                };
                self.pending_moves.push(PendingMove {
                    cells,
                    from_bee,
                    app: app.clone(),
                    reply,
                });
                self.propose_registry(RegistryCommand::CreateBee {
                    app,
                    node: self.config.node_id,
                });
            }
            _ => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(HiveError::InvalidArgument {
                        name: "cells",
                        reason: "cells must share one owner",
                    }));
                }
            }
        }
    }

    /// Watches a colony's committed entries for the install step of an
    /// active transfer targeting that bee.
    fn note_colony_commit(&mut self, bee: BeeId, data: &Bytes) {
        let installing = self
            .active_transfers
            .iter()
            .any(|(t, _)| t.to_bee == bee);
        if !installing {
            return;
        }
        if let Ok(ColonyEntry::Control(beehive_state::ControlEntry::InstallCells { .. })) =
            ColonyEntry::decode(data.clone())
        {
            let mut staged = Vec::new();
            for (transfer, _) in &mut self.active_transfers {
                if transfer.to_bee == bee {
                    staged.extend(transfer.on_install_committed());
                }
            }
            self.exec_transfer_outputs(staged, None);
        }
    }

    fn on_quiesce_applied(&mut self, bee: BeeId, values: Vec<InstalledCell>) {
        let mut staged = Vec::new();
        for (transfer, _) in &mut self.active_transfers {
            if transfer.from_bee == bee {
                staged.extend(transfer.on_quiesce_committed(values.clone()));
            }
        }
        self.exec_transfer_outputs(staged, None);
    }

    fn exec_transfer_outputs(&mut self, outputs: Vec<TransferOutput>, reply: Option<OpReply>) {
        let mut reply = reply;
        for output in outputs {
            match output {
                TransferOutput::ProposeRegistry(cmd) => self.propose_registry(cmd),
                TransferOutput::ProposeColony { bee, entry } => {
                    self.propose_colony_or_forward(bee, entry);
                }
                TransferOutput::Completed => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
                TransferOutput::Failed { reason } => {
                    warn!(%reason, "cell transfer failed");
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(HiveError::InvalidArgument {
                            name: "transfer",
                            reason: "transfer failed",
                        }));
                    }
                }
            }
        }
    }

    fn run_rebalance(&mut self) {
        let actions = self.rebalancer.plan(&self.stats, &self.registry);
        for action in actions {
            match action {
                beehive_routing::PlacementAction::TransferLeadership { bee, to } => {
                    info!(%bee, %to, "placement: transferring colony leadership");
                    let group = GroupId::colony(bee);
                    if self.engine.is_leader(group) {
                        let outputs = self.engine.transfer_leadership(group, to);
                        self.pending_outputs.extend(outputs);
                    } else if let Some(leader) = self.colony_leader(bee) {
                        if leader != self.config.node_id {
                            self.outbox
                                .push((leader, WireMessage::TransferLead { group, target: to }));
                        }
                    }
                }
                beehive_routing::PlacementAction::ReplaceFollower { bee, remove, add } => {
                    if let Some(record) = self.registry.bee(bee) {
                        let mut members = record.colony.clone();
                        members.retain(|&n| n != remove);
                        if !members.contains(&add) {
                            members.push(add);
                        }
                        self.propose_registry(RegistryCommand::SetColony { bee, members });
                    }
                }
            }
        }
        self.stats.clear();
    }

    fn force_recover(&mut self, bee: BeeId) -> Result<(), HiveError> {
        if !self.stalled.contains(&bee) {
            return Err(HiveError::InvalidArgument {
                name: "bee",
                reason: "bee is not stalled",
            });
        }
        if !self.bees.contains_key(&bee) {
            return Err(HiveError::NotFound {
                resource: "local replica",
                id: bee.get(),
            });
        }
        // Collapse the colony to this surviving replica. Entries committed
        // on lost replicas after our last applied index are gone; that is
        // the documented cost of forced recovery.
        warn!(%bee, "forcing recovery from local replica");
        self.propose_registry(RegistryCommand::SetColony {
            bee,
            members: vec![self.config.node_id],
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local bee lifecycle
    // ------------------------------------------------------------------

    fn spawn_local_bee(
        &mut self,
        bee: BeeId,
        app_name: &AppName,
        members: Vec<NodeId>,
    ) -> Result<(), crate::error::RuntimeError> {
        if self.bees.contains_key(&bee) {
            return Ok(());
        }
        let Some(app) = self.apps.get(app_name).cloned() else {
            warn!(%bee, app = %app_name, "bee for unknown application, skipping");
            return Ok(());
        };

        let persistent = self.config.data_dir.is_some()
            && app.options.persistence != beehive_core::Persistence::Volatile;
        let group = GroupId::colony(bee);

        // Recover the machine from disk, then replay post-snapshot
        // entries into it.
        let recovered = self.engine.recover_group(group, persistent)?;
        let mut machine = match &recovered.snapshot {
            Some((_, data)) => BeeMachine::decode_snapshot(
                bee,
                self.config.limits.dedup_window as usize,
                data.clone(),
            )
            .unwrap_or_else(|e| {
                error!(%bee, error = %e, "bee snapshot unusable, starting empty");
                BeeMachine::new(bee, self.config.limits.dedup_window as usize)
            }),
            None => BeeMachine::new(bee, self.config.limits.dedup_window as usize),
        };
        let mut last_term = 0;
        for (index, term, data) in &recovered.entries {
            last_term = *term;
            if let Err(e) = machine.apply_bytes(*index, data.clone()) {
                warn!(%bee, index, error = %e, "skipping undecodable colony entry");
            }
        }

        self.engine.create_group(
            group,
            members,
            persistent,
            recovered.last_index(),
            last_term,
        )?;

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = BeeActor::new(
            app,
            machine,
            self.config.limits,
            persistent,
            self.cmd_tx.clone(),
            rx,
        );
        tokio::spawn(actor.run());
        self.bees.insert(bee, LocalBee { tx });
        info!(%bee, app = %app_name, "local bee running");
        Ok(())
    }

    fn read_cell(&mut self, cell: Cell, reply: ReadReply) {
        match self.registry.lookup([&cell]) {
            Resolution::AllSame(bee) => {
                if let Some(local) = self.bees.get(&bee) {
                    let _ = local.tx.send(BeeCommand::ReadCell { cell, reply });
                } else {
                    let _ = reply.send(Err(HiveError::NotLeader {
                        group: GroupId::colony(bee),
                        known_leader: self.colony_leader(bee),
                    }));
                }
            }
            _ => {
                let _ = reply.send(Ok(None));
            }
        }
    }

    fn led_colony_groups(&self) -> Vec<GroupId> {
        self.bees
            .keys()
            .map(|&bee| GroupId::colony(bee))
            .filter(|&group| self.engine.is_leader(group))
            .collect()
    }

    fn pick_leadership_refuge(&self, group: GroupId) -> Option<NodeId> {
        let bee = group.colony_bee()?;
        let record = self.registry.bee(bee)?;
        record
            .colony
            .iter()
            .copied()
            .find(|&n| n != self.config.node_id)
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    async fn flush_outbox(&mut self) {
        for (to, msg) in self.outbox.drain(..) {
            if let Err(e) = self.transport.send(to, msg).await {
                debug!(%to, error = %e, "send failed");
            }
        }
    }
}

impl<T: PeerTransport> std::fmt::Debug for NodeService<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeService")
            .field("node", &self.config.node_id)
            .field("bees", &self.bees.len())
            .field("tick", &self.tick)
            .finish()
    }
}
