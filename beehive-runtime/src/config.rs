//! Node configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use beehive_core::{Limits, NodeId};

use crate::error::RuntimeError;

/// Configuration for one hive node.
#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// This node's unique identifier.
    pub node_id: NodeId,
    /// Address to bind for peer connections.
    pub listen_addr: SocketAddr,
    /// Seed peers to discover the cluster through.
    pub peers: Vec<PeerConfig>,
    /// Data directory for logs and snapshots. `None` disables persistence
    /// entirely (volatile node, handy in tests).
    pub data_dir: Option<PathBuf>,
    /// Timing configuration.
    pub timing: TimingConfig,
    /// Resource limits.
    pub limits: Limits,
}

impl HiveConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            peers: Vec::new(),
            data_dir: None,
            timing: TimingConfig::default(),
            limits: Limits::new(),
        }
    }

    /// Adds a seed peer.
    #[must_use]
    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            addr: addr.into(),
        });
        self
    }

    /// Sets the data directory, enabling persistence.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Returns all cluster node ids including self, sorted.
    #[must_use]
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.node_id];
        nodes.extend(self.peers.iter().map(|p| p.node_id));
        nodes.sort_by_key(|n| n.get());
        nodes.dedup();
        nodes
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is inconsistent.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.timing.validate()?;
        self.limits.validate().map_err(|e| RuntimeError::Config {
            reason: e.to_string(),
        })?;
        if self.peers.iter().any(|p| p.node_id == self.node_id) {
            return Err(RuntimeError::Config {
                reason: "own node id listed as a peer".into(),
            });
        }
        Ok(())
    }
}

/// Configuration for a peer node.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer's node ID.
    pub node_id: NodeId,
    /// Peer's address (`host:port`, resolved at connect time).
    pub addr: String,
}

/// Timing configuration.
///
/// All consensus timing is tick-based; the service loop fires one tick per
/// `tick_interval` and everything else counts ticks.
#[derive(Debug, Clone, Copy)]
pub struct TimingConfig {
    /// Interval between service ticks.
    pub tick_interval: Duration,
    /// Ticks without leader contact before an election may start.
    pub election_ticks: u32,
    /// Ticks between leader heartbeats.
    pub heartbeat_ticks: u32,
    /// Ticks without a node heartbeat before declaring it dead.
    pub dead_timeout_ticks: u32,
    /// Ticks between placement passes on the cluster leader.
    pub rebalance_interval_ticks: u32,
    /// Bounded wait when draining in-flight transactions at shutdown.
    pub shutdown_drain: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            election_ticks: 10,
            heartbeat_ticks: 1,
            dead_timeout_ticks: 50,
            rebalance_interval_ticks: 300,
            shutdown_drain: Duration::from_secs(5),
        }
    }
}

impl TimingConfig {
    /// Timing suitable for tests: fast ticks, fast failure detection.
    #[must_use]
    pub const fn fast_for_testing() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            election_ticks: 5,
            heartbeat_ticks: 1,
            dead_timeout_ticks: 20,
            rebalance_interval_ticks: 50,
            shutdown_drain: Duration::from_secs(1),
        }
    }

    /// Validates the timing configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is inconsistent.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.election_ticks <= self.heartbeat_ticks {
            return Err(RuntimeError::Config {
                reason: "election_ticks must be > heartbeat_ticks".into(),
            });
        }
        if self.dead_timeout_ticks <= self.election_ticks {
            return Err(RuntimeError::Config {
                reason: "dead_timeout_ticks must be > election_ticks".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timing_is_valid() {
        assert!(TimingConfig::default().validate().is_ok());
        assert!(TimingConfig::fast_for_testing().validate().is_ok());
    }

    #[test]
    fn test_self_as_peer_rejected() {
        let config = HiveConfig::new(NodeId::new(1), "127.0.0.1:0".parse().unwrap())
            .with_peer(NodeId::new(1), "127.0.0.1:9000");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cluster_nodes_sorted() {
        let config = HiveConfig::new(NodeId::new(2), "127.0.0.1:0".parse().unwrap())
            .with_peer(NodeId::new(3), "a")
            .with_peer(NodeId::new(1), "b");
        assert_eq!(
            config.cluster_nodes(),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );
    }
}
