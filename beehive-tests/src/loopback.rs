//! In-process loopback transport.
//!
//! Every registered node gets an inbox; sends look the destination up in
//! the shared hub and push straight into its channel. Unregistering a node
//! (or dropping its receiver) makes it unreachable, which is how tests
//! kill nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beehive_core::NodeId;
use beehive_runtime::{PeerTransport, TransportError, WireMessage};
use tokio::sync::mpsc;

/// Shared registry of node inboxes.
#[derive(Debug, Default, Clone)]
pub struct LoopbackNet {
    inboxes: Arc<Mutex<HashMap<NodeId, mpsc::Sender<WireMessage>>>>,
}

impl LoopbackNet {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node, returning its transport and inbound receiver.
    #[must_use]
    pub fn register(&self, node: NodeId) -> (LoopbackTransport, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(4096);
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.insert(node, tx);
        }
        (
            LoopbackTransport {
                node,
                net: self.clone(),
            },
            rx,
        )
    }

    /// Disconnects a node; frames to it are dropped from now on.
    pub fn disconnect(&self, node: NodeId) {
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.remove(&node);
        }
    }

    fn sender_for(&self, node: NodeId) -> Option<mpsc::Sender<WireMessage>> {
        self.inboxes.lock().ok()?.get(&node).cloned()
    }
}

/// One node's view of the loopback network.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    node: NodeId,
    net: LoopbackNet,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn send(
        &self,
        to: NodeId,
        msg: WireMessage,
    ) -> Result<(), TransportError> {
        // A disconnected node cannot reach anyone: its own frames vanish
        // too, like a crashed process.
        if self.net.sender_for(self.node).is_none() {
            return Ok(());
        }
        let Some(sender) = self.net.sender_for(to) else {
            // Dead or never-registered node: the frame vanishes, exactly
            // like a TCP send into a partition.
            return Ok(());
        };
        let _ = sender.send(msg).await;
        Ok(())
    }

    fn node_id(&self) -> NodeId {
        self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_deliver() {
        let net = LoopbackNet::new();
        let (t1, _rx1) = net.register(NodeId::new(1));
        let (_t2, mut rx2) = net.register(NodeId::new(2));

        let msg = WireMessage::Heartbeat {
            node: NodeId::new(1),
            cluster_id: 9,
            config_hash: 1,
        };
        t1.send(NodeId::new(2), msg.clone()).await.unwrap();

        assert_eq!(rx2.recv().await, Some(msg));
    }

    #[tokio::test]
    async fn test_disconnected_node_drops_frames() {
        let net = LoopbackNet::new();
        let (t1, _rx1) = net.register(NodeId::new(1));
        let (_t2, mut rx2) = net.register(NodeId::new(2));
        net.disconnect(NodeId::new(2));

        t1.send(
            NodeId::new(2),
            WireMessage::Heartbeat {
                node: NodeId::new(1),
                cluster_id: 9,
                config_hash: 1,
            },
        )
        .await
        .unwrap();

        // Nothing arrives and nothing errors.
        assert!(rx2.try_recv().is_err());
    }
}
