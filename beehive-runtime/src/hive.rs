//! The runtime handle.
//!
//! A `Hive` is created at startup from a [`HiveConfig`] and the
//! applications it should serve; it is the explicit injection point for
//! messages and the operator surface. Everything goes through the node
//! service's command channel, so the handle is cheap to clone and safe to
//! share.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use beehive_core::{BeeId, Cell, Envelope, HiveError, MsgId, NodeId};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::config::HiveConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::handler::App;
use crate::service::{BeeInfo, NodeService, ServiceCommand};
use crate::transport::{Transport, TransportConfig};

/// Builder assembling a node from its configuration and applications.
pub struct HiveBuilder {
    config: HiveConfig,
    apps: Vec<App>,
}

impl HiveBuilder {
    /// Starts a builder from a configuration.
    #[must_use]
    pub const fn new(config: HiveConfig) -> Self {
        Self {
            config,
            apps: Vec::new(),
        }
    }

    /// Registers an application. Every node of a cluster must register the
    /// same set; joins with a different set are refused.
    #[must_use]
    pub fn app(mut self, app: App) -> Self {
        self.apps.push(app);
        self
    }

    /// Boots the node: binds the transport, recovers persisted state, and
    /// spawns the service loop.
    ///
    /// # Errors
    /// Returns an error if configuration, recovery, or binding fails.
    pub async fn start(self) -> RuntimeResult<Hive> {
        self.config.validate()?;

        let transport_config = TransportConfig {
            node_id: self.config.node_id,
            listen_addr: self.config.listen_addr,
            peers: self
                .config
                .peers
                .iter()
                .map(|p| (p.node_id, p.addr.clone()))
                .collect(),
        };
        let (transport, incoming_rx) = Transport::new(transport_config);
        let (handle, bound_addr) = transport.start().await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(4096);
        let service = NodeService::new(
            self.config.clone(),
            self.apps,
            handle.clone(),
            incoming_rx,
            cmd_rx,
            cmd_tx.clone(),
        )?;
        tokio::spawn(service.run());

        info!(node = %self.config.node_id, addr = %bound_addr, "hive started");
        Ok(Hive {
            node_id: self.config.node_id,
            cmd_tx,
            // Seed well past any counter a previous incarnation used, so
            // restarted nodes never reuse a message id still sitting in
            // some bee's dedup window.
            msg_counter: Arc::new(AtomicU64::new(boot_counter())),
        })
    }
}

/// Handle to a running node.
#[derive(Clone)]
pub struct Hive {
    node_id: NodeId,
    cmd_tx: mpsc::Sender<ServiceCommand>,
    msg_counter: Arc<AtomicU64>,
}

impl Hive {
    /// Returns this node's id.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Injects a message, returning once it is routed (not committed).
    ///
    /// # Errors
    /// Returns an error if the node is shutting down.
    pub async fn emit(
        &self,
        type_tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> RuntimeResult<MsgId> {
        let env = self.envelope(type_tag, payload);
        let id = env.id;
        self.cmd_tx
            .send(ServiceCommand::Inject { env, reply: None })
            .await?;
        Ok(id)
    }

    /// Injects a message and waits until its transaction commits (or the
    /// routing/handling error that stopped it).
    ///
    /// # Errors
    /// Returns the first error the message hit: routing, claim conflict
    /// fallout, transaction abort, timeout.
    pub async fn emit_wait(
        &self,
        type_tag: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> RuntimeResult<MsgId> {
        let env = self.envelope(type_tag, payload);
        let id = env.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Inject {
                env,
                reply: Some(reply_tx),
            })
            .await?;
        reply_rx.await?.map_err(RuntimeError::Hive)?;
        Ok(id)
    }

    /// Injects a message with a delivery deadline and waits for commit.
    ///
    /// # Errors
    /// As [`Self::emit_wait`], plus `Timeout` if the deadline expires.
    pub async fn emit_wait_deadline(
        &self,
        type_tag: impl Into<String>,
        payload: impl Into<Bytes>,
        deadline_us: u64,
    ) -> RuntimeResult<MsgId> {
        let env = self.envelope(type_tag, payload).with_deadline_us(deadline_us);
        let id = env.id;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Inject {
                env,
                reply: Some(reply_tx),
            })
            .await?;
        reply_rx.await?.map_err(RuntimeError::Hive)?;
        Ok(id)
    }

    /// Reads a cell's committed value from its owning bee, if that bee is
    /// local.
    ///
    /// # Errors
    /// Returns `NotLeader` if the owner lives elsewhere.
    pub async fn read_cell(
        &self,
        dict: impl Into<String>,
        key: impl Into<Bytes>,
    ) -> RuntimeResult<Option<Bytes>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ReadCell {
                cell: Cell::new(dict, key),
                reply: reply_tx,
            })
            .await?;
        reply_rx.await?.map_err(RuntimeError::Hive)
    }

    /// Lists every bee the registry knows about.
    ///
    /// # Errors
    /// Returns an error if the node has shut down.
    pub async fn list_bees(&self) -> RuntimeResult<Vec<BeeInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ListBees { reply: reply_tx })
            .await?;
        Ok(reply_rx.await?)
    }

    /// Moves cells out of their owning bee into a fresh bee hosted on
    /// this node, through the two-phase drain. Returns when the transfer
    /// completes.
    ///
    /// # Errors
    /// Returns an error if the cells span owners or the transfer fails.
    pub async fn move_cells(&self, cells: Vec<Cell>) -> RuntimeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::MoveCells {
                cells,
                reply: reply_tx,
            })
            .await?;
        reply_rx.await?.map_err(RuntimeError::Hive)
    }

    /// Forces recovery of a stalled bee from this node's replica,
    /// accepting the documented data loss.
    ///
    /// # Errors
    /// Returns an error if the bee is not stalled or has no replica here.
    pub async fn force_recover(&self, bee: BeeId) -> RuntimeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ForceRecover {
                bee,
                reply: reply_tx,
            })
            .await?;
        reply_rx.await?.map_err(RuntimeError::Hive)
    }

    /// Triggers a placement pass now instead of waiting for the interval.
    ///
    /// # Errors
    /// Returns an error if the node has shut down.
    pub async fn trigger_rebalance(&self) -> RuntimeResult<()> {
        self.cmd_tx.send(ServiceCommand::Rebalance).await?;
        Ok(())
    }

    /// Shuts the node down cooperatively: stops intake, drains in-flight
    /// transactions for a bounded time, transfers colony leaderships
    /// away, then stops.
    ///
    /// # Errors
    /// Returns an error if the service already exited.
    pub async fn shutdown(self) -> RuntimeResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Shutdown { reply: reply_tx })
            .await?;
        reply_rx.await?;
        Ok(())
    }

    fn envelope(&self, type_tag: impl Into<String>, payload: impl Into<Bytes>) -> Envelope {
        let counter = self.msg_counter.fetch_add(1, Ordering::Relaxed);
        Envelope::new(
            type_tag,
            payload,
            MsgId::compose(self.node_id, counter & ((1 << 40) - 1)),
        )
    }
}

impl std::fmt::Debug for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hive").field("node_id", &self.node_id).finish()
    }
}

/// Counter seed: milliseconds since the epoch, so restarts start far past
/// any previously issued counter.
fn boot_counter() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(0))
        .unwrap_or(0)
        & ((1 << 39) - 1)
}
