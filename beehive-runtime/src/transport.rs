//! TCP transport for node-to-node traffic.
//!
//! Each peer gets one outbound connection, established lazily on first
//! send and reconnected with exponential backoff on failure. Inbound
//! connections are accepted from any peer; frames are self-describing so
//! no handshake is needed beyond the heartbeat's cluster-id check.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use beehive_core::NodeId;
use socket2::{Domain, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::codec::{decode_frame, encode_frame, CodecError, WireMessage};

/// Read buffer size (1 MB).
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection timeout in milliseconds.
const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Maximum pending frames per peer.
const MAX_PENDING_FRAMES: usize = 1000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to bind the listener.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Failed to connect to a peer.
    #[error("failed to connect to peer {node_id} at {addr}: {source}")]
    ConnectFailed {
        /// The peer node ID.
        node_id: NodeId,
        /// The peer address.
        addr: String,
        /// The underlying error.
        source: std::io::Error,
    },

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is shut down.
    #[error("transport is shutdown")]
    Shutdown,

    /// The peer is not configured.
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// The peer's send queue is full.
    #[error("send queue full for peer {0}")]
    QueueFull(NodeId),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Point-to-point message delivery between nodes.
///
/// The trait seam lets tests swap the TCP transport for an in-process
/// loopback without touching the service loop.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Sends one wire message to a peer.
    async fn send(&self, to: NodeId, msg: WireMessage) -> TransportResult<()>;

    /// Returns this node's id.
    fn node_id(&self) -> NodeId;
}

/// State of one peer connection.
struct PeerConnection {
    sender: mpsc::Sender<WireMessage>,
}

/// Handle for sending through a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    node_id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, PeerConnection>>>,
    shutdown: Arc<Mutex<bool>>,
}

impl TransportHandle {
    /// Registers a peer discovered after startup.
    pub async fn add_peer(&self, node_id: NodeId, addr: String, shutdown: Arc<Mutex<bool>>) {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&node_id) {
            return;
        }
        let (tx, rx) = mpsc::channel(MAX_PENDING_FRAMES);
        peers.insert(node_id, PeerConnection { sender: tx });
        tokio::spawn(Transport::sender_loop(self.node_id, node_id, addr, rx, shutdown));
    }

    /// Returns true if the transport has shut down.
    pub async fn is_shutdown(&self) -> bool {
        *self.shutdown.lock().await
    }

    /// Flags the transport as shut down; sender loops exit on next send.
    pub async fn shutdown(&self) {
        *self.shutdown.lock().await = true;
    }
}

#[async_trait]
impl PeerTransport for TransportHandle {
    #[allow(clippy::significant_drop_tightening)]
    async fn send(&self, to: NodeId, msg: WireMessage) -> TransportResult<()> {
        debug_assert!(to != self.node_id, "cannot send to self");

        if *self.shutdown.lock().await {
            return Err(TransportError::Shutdown);
        }

        let peers = self.peers.read().await;
        let conn = peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        conn.sender
            .try_send(msg)
            .map_err(|_| TransportError::QueueFull(to))
    }

    fn node_id(&self) -> NodeId {
        self.node_id
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Known peers at startup.
    pub peers: Vec<(NodeId, String)>,
}

/// The TCP transport.
pub struct Transport {
    config: TransportConfig,
    peers: Arc<RwLock<HashMap<NodeId, PeerConnection>>>,
    incoming_tx: mpsc::Sender<WireMessage>,
    shutdown: Arc<Mutex<bool>>,
}

impl Transport {
    /// Creates a transport. Returns it plus the receiver of inbound
    /// messages.
    #[must_use]
    pub fn new(config: TransportConfig) -> (Self, mpsc::Receiver<WireMessage>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(4096);
        let transport = Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            incoming_tx,
            shutdown: Arc::new(Mutex::new(false)),
        };
        (transport, incoming_rx)
    }

    /// Starts listening and connecting, returning the send handle and the
    /// actually bound address (relevant when binding port 0).
    ///
    /// # Errors
    /// Returns an error if the listener cannot bind.
    pub async fn start(self) -> TransportResult<(TransportHandle, SocketAddr)> {
        let listener = create_reusable_listener(self.config.listen_addr).map_err(|e| {
            TransportError::BindFailed {
                addr: self.config.listen_addr,
                source: e,
            }
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            node_id = self.config.node_id.get(),
            addr = %local_addr,
            "transport listening"
        );

        let handle = TransportHandle {
            node_id: self.config.node_id,
            peers: Arc::clone(&self.peers),
            shutdown: Arc::clone(&self.shutdown),
        };

        for (peer_id, addr) in self.config.peers.clone() {
            handle
                .add_peer(peer_id, addr, Arc::clone(&self.shutdown))
                .await;
        }

        let incoming_tx = self.incoming_tx.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let node_id = self.config.node_id;
        tokio::spawn(async move {
            Self::accept_loop(listener, incoming_tx, shutdown, node_id).await;
        });

        Ok((handle, local_addr))
    }

    async fn accept_loop(
        listener: TcpListener,
        incoming_tx: mpsc::Sender<WireMessage>,
        shutdown: Arc<Mutex<bool>>,
        node_id: NodeId,
    ) {
        loop {
            if *shutdown.lock().await {
                info!(node_id = node_id.get(), "accept loop shutting down");
                break;
            }
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(node_id = node_id.get(), peer_addr = %peer_addr, "accepted connection");
                    let tx = incoming_tx.clone();
                    let shutdown = Arc::clone(&shutdown);
                    tokio::spawn(async move {
                        if let Err(e) = Self::receive_loop(stream, tx, shutdown).await {
                            debug!(peer_addr = %peer_addr, error = %e, "receive loop ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    async fn sender_loop(
        node_id: NodeId,
        peer_id: NodeId,
        addr: String,
        mut rx: mpsc::Receiver<WireMessage>,
        shutdown: Arc<Mutex<bool>>,
    ) {
        let mut stream: Option<TcpStream> = None;
        let mut reconnect_delay_ms: u64 = 100;
        const MAX_RECONNECT_DELAY_MS: u64 = 10_000;

        loop {
            if *shutdown.lock().await {
                debug!(node_id = node_id.get(), peer_id = peer_id.get(), "sender loop shutting down");
                break;
            }

            let Some(msg) = rx.recv().await else {
                break;
            };

            if stream.is_none() {
                match Self::connect(peer_id, &addr).await {
                    Ok(s) => {
                        stream = Some(s);
                        reconnect_delay_ms = 100;
                        info!(node_id = node_id.get(), peer_id = peer_id.get(), addr = %addr, "connected to peer");
                    }
                    Err(e) => {
                        warn!(peer_id = peer_id.get(), error = %e, "connect failed, will retry");
                        tokio::time::sleep(tokio::time::Duration::from_millis(reconnect_delay_ms))
                            .await;
                        reconnect_delay_ms = (reconnect_delay_ms * 2).min(MAX_RECONNECT_DELAY_MS);
                        continue;
                    }
                }
            }

            if let Some(ref mut s) = stream {
                let frame = encode_frame(&msg);
                let result = async {
                    s.write_all(&frame).await?;
                    s.flush().await
                }
                .await;

                if let Err(e) = result {
                    warn!(peer_id = peer_id.get(), error = %e, "send failed, reconnecting");
                    stream = None;
                }
            }
        }
    }

    async fn connect(peer_id: NodeId, addr: &str) -> TransportResult<TcpStream> {
        let timeout = tokio::time::Duration::from_millis(CONNECT_TIMEOUT_MS);
        let connect_future = async {
            let mut addrs = tokio::net::lookup_host(addr).await?;
            let resolved = addrs.next().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses found for {addr}"),
                )
            })?;
            TcpStream::connect(resolved).await
        };

        match tokio::time::timeout(timeout, connect_future).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(TransportError::ConnectFailed {
                node_id: peer_id,
                addr: addr.to_string(),
                source: e,
            }),
            Err(_) => Err(TransportError::ConnectFailed {
                node_id: peer_id,
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timed out"),
            }),
        }
    }

    async fn receive_loop(
        mut stream: TcpStream,
        incoming_tx: mpsc::Sender<WireMessage>,
        shutdown: Arc<Mutex<bool>>,
    ) -> TransportResult<()> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            if *shutdown.lock().await {
                break;
            }

            let bytes_read = stream.read_buf(&mut buffer).await?;
            if bytes_read == 0 {
                debug!("connection closed by peer");
                break;
            }

            loop {
                match decode_frame(&buffer) {
                    Ok((msg, consumed)) => {
                        let _ = buffer.split_to(consumed);
                        if incoming_tx.send(msg).await.is_err() {
                            return Ok(()); // receiver dropped
                        }
                    }
                    Err(CodecError::InsufficientData { .. }) => break,
                    Err(e) => {
                        warn!(error = %e, "failed to decode frame, dropping connection");
                        return Err(e.into());
                    }
                }
            }

            if buffer.capacity() > READ_BUFFER_SIZE * 2 {
                buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
            }
        }
        Ok(())
    }
}

/// Creates a TCP listener with `SO_REUSEADDR` enabled, so restarts can
/// rebind a port still in `TIME_WAIT`.
fn create_reusable_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_starts_and_reports_addr() {
        let config = TransportConfig {
            node_id: NodeId::new(1),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peers: Vec::new(),
        };
        let (transport, _incoming) = Transport::new(config);
        let (handle, addr) = transport.start().await.unwrap();

        assert_ne!(addr.port(), 0);
        assert!(!handle.is_shutdown().await);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let config = TransportConfig {
            node_id: NodeId::new(1),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peers: Vec::new(),
        };
        let (transport, _incoming) = Transport::new(config);
        let (handle, _addr) = transport.start().await.unwrap();

        let result = handle
            .send(
                NodeId::new(9),
                WireMessage::Heartbeat {
                    node: NodeId::new(1),
                    cluster_id: 1,
                    config_hash: 0,
                },
            )
            .await;
        assert!(matches!(result, Err(TransportError::UnknownPeer(_))));
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_frames() {
        // Receiver first.
        let (t2, mut incoming2) = Transport::new(TransportConfig {
            node_id: NodeId::new(2),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peers: Vec::new(),
        });
        let (_h2, addr2) = t2.start().await.unwrap();

        // Sender with the receiver as peer.
        let (t1, _incoming1) = Transport::new(TransportConfig {
            node_id: NodeId::new(1),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            peers: vec![(NodeId::new(2), addr2.to_string())],
        });
        let (h1, _addr1) = t1.start().await.unwrap();

        let msg = WireMessage::Heartbeat {
            node: NodeId::new(1),
            cluster_id: 42,
            config_hash: 7,
        };
        h1.send(NodeId::new(2), msg.clone()).await.unwrap();

        let received =
            tokio::time::timeout(tokio::time::Duration::from_secs(2), incoming2.recv())
                .await
                .expect("timeout waiting for frame")
                .expect("channel closed");
        assert_eq!(received, msg);
    }
}
