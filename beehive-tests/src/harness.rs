//! Cluster harness.
//!
//! Builds clusters of real node services wired over the loopback network,
//! and provides the polling helpers the scenarios lean on. Timeouts are
//! generous: elections and claims settle in ticks, not instants.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use beehive_core::{BeeId, Cell, Envelope, HiveError, MsgId, NodeId};
use beehive_runtime::{
    App, BeeInfo, HiveConfig, NodeService, ServiceCommand, TimingConfig,
};
use tokio::sync::{mpsc, oneshot};

use crate::loopback::LoopbackNet;

/// How long scenarios wait for cluster-wide conditions.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Process-global message counter, so a restarted node never reissues a
/// message id an earlier incarnation already used (the dedup window
/// would collapse it).
static NEXT_MSG_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One node under test.
pub struct TestNode {
    /// The node's id.
    pub node_id: NodeId,
    /// Command channel into its service loop.
    pub cmd_tx: mpsc::Sender<ServiceCommand>,
}

impl TestNode {
    /// Builds an envelope with a node-unique message id.
    #[must_use]
    pub fn envelope(&self, type_tag: &str, payload: impl Into<Bytes>) -> Envelope {
        let counter = NEXT_MSG_COUNTER.fetch_add(1, Ordering::Relaxed);
        Envelope::new(type_tag, payload, MsgId::compose(self.node_id, counter))
    }

    /// Injects a message and waits for its commit (or error).
    ///
    /// # Errors
    /// Returns the error the message hit, or `Shutdown` if the node died.
    pub async fn emit_wait(
        &self,
        type_tag: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), HiveError> {
        let env = self.envelope(type_tag, payload);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::Inject {
                env,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| HiveError::Shutdown)?;
        reply_rx.await.map_err(|_| HiveError::Shutdown)?
    }

    /// Injects without waiting.
    ///
    /// # Errors
    /// Returns `Shutdown` if the node died.
    pub async fn emit(&self, type_tag: &str, payload: impl Into<Bytes>) -> Result<(), HiveError> {
        let env = self.envelope(type_tag, payload);
        self.cmd_tx
            .send(ServiceCommand::Inject { env, reply: None })
            .await
            .map_err(|_| HiveError::Shutdown)
    }

    /// Reads a cell from this node, if its owner is local.
    ///
    /// # Errors
    /// Returns routing errors for remote owners.
    pub async fn read_cell(
        &self,
        dict: &str,
        key: impl Into<Bytes>,
    ) -> Result<Option<Bytes>, HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ReadCell {
                cell: Cell::new(dict, key),
                reply: reply_tx,
            })
            .await
            .map_err(|_| HiveError::Shutdown)?;
        reply_rx.await.map_err(|_| HiveError::Shutdown)?
    }

    /// Lists bees as this node sees them.
    ///
    /// # Errors
    /// Returns `Shutdown` if the node died.
    pub async fn list_bees(&self) -> Result<Vec<BeeInfo>, HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ListBees { reply: reply_tx })
            .await
            .map_err(|_| HiveError::Shutdown)?;
        reply_rx.await.map_err(|_| HiveError::Shutdown)
    }

    /// Moves cells to a fresh bee on this node.
    ///
    /// # Errors
    /// Returns the transfer error, if any.
    pub async fn move_cells(&self, cells: Vec<Cell>) -> Result<(), HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::MoveCells {
                cells,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HiveError::Shutdown)?;
        reply_rx.await.map_err(|_| HiveError::Shutdown)?
    }

    /// Forces recovery of a stalled bee.
    ///
    /// # Errors
    /// Returns the recovery error, if any.
    pub async fn force_recover(&self, bee: BeeId) -> Result<(), HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ServiceCommand::ForceRecover {
                bee,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HiveError::Shutdown)?;
        reply_rx.await.map_err(|_| HiveError::Shutdown)?
    }

    /// Shuts the node down cooperatively.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ServiceCommand::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// A cluster of test nodes over one loopback network.
pub struct TestCluster {
    /// The loopback network; disconnect nodes here to kill them.
    pub net: LoopbackNet,
    /// The nodes, in id order.
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Starts a cluster of `ids` nodes, each running `apps()`, with an
    /// optional data directory per node.
    ///
    /// # Panics
    /// Panics if a node fails to build.
    pub fn start(
        ids: &[u64],
        apps: impl Fn() -> Vec<App>,
        data_dirs: Option<&[PathBuf]>,
    ) -> Self {
        let net = LoopbackNet::new();
        let mut nodes = Vec::new();

        for (i, &id) in ids.iter().enumerate() {
            let node_id = NodeId::new(id);
            let mut config = HiveConfig::new(node_id, "127.0.0.1:0".parse().expect("addr"))
                .with_timing(TimingConfig::fast_for_testing());
            for &peer in ids {
                if peer != id {
                    // Addresses are meaningless on the loopback net.
                    config = config.with_peer(NodeId::new(peer), "loopback");
                }
            }
            if let Some(dirs) = data_dirs {
                config = config.with_data_dir(dirs[i].clone());
            }

            let node = start_node(&net, config, apps());
            nodes.push(node);
        }

        Self { net, nodes }
    }

    /// Kills a node abruptly: unplugs it from the network and drops its
    /// command channel usage. The service task keeps running but is
    /// unreachable, which is what a crashed peer looks like.
    pub fn kill(&self, node: NodeId) {
        self.net.disconnect(node);
    }

    /// Reads a counter from whichever node owns the cell.
    pub async fn read_counter(&self, dict: &str, key: &[u8]) -> Option<u64> {
        for node in &self.nodes {
            if let Ok(Some(value)) = node.read_cell(dict, key.to_vec()).await {
                return Some(crate::apps::counter_value(Some(&value)));
            }
        }
        None
    }
}

/// Starts one node on an existing loopback network.
///
/// # Panics
/// Panics if the service fails to build.
#[must_use]
pub fn start_node(net: &LoopbackNet, config: HiveConfig, apps: Vec<App>) -> TestNode {
    let node_id = config.node_id;
    let (transport, incoming_rx) = net.register(node_id);
    let (cmd_tx, cmd_rx) = mpsc::channel(4096);

    let service = NodeService::new(
        config,
        apps,
        transport,
        incoming_rx,
        cmd_rx,
        cmd_tx.clone(),
    )
    .expect("node service build");
    tokio::spawn(service.run());

    TestNode { node_id, cmd_tx }
}

/// Polls `probe` until it yields `Some`, or panics at the timeout.
///
/// # Panics
/// Panics if the condition does not hold within `timeout`.
pub async fn eventually<F, Fut, T>(timeout: Duration, what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Retries injection until the message commits, for scenarios that race
/// elections and failovers. Every retry re-sends the SAME envelope, so
/// the owning bee's dedup window collapses duplicates from attempts whose
/// reply was lost.
///
/// # Panics
/// Panics if no attempt succeeds within the timeout.
pub async fn emit_until_committed(node: &TestNode, type_tag: &str, payload: &[u8]) {
    let env = node.envelope(type_tag, payload.to_vec());
    eventually(SETTLE_TIMEOUT, "message commit", || {
        let env = env.clone();
        async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            node.cmd_tx
                .send(ServiceCommand::Inject {
                    env,
                    reply: Some(reply_tx),
                })
                .await
                .ok()?;
            reply_rx.await.ok()?.ok()
        }
    })
    .await;
}
