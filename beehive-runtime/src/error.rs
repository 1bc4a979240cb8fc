//! Runtime error types.

use beehive_core::HiveError;
use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from the node runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A core error surfaced through the runtime.
    #[error(transparent)]
    Hive(#[from] HiveError),

    /// The service loop is gone (node shut down).
    #[error("node service has shut down")]
    ServiceGone,

    /// A reply channel was dropped before answering.
    #[error("reply channel closed")]
    ReplyDropped,

    /// Transport failure.
    #[error("transport: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Storage failure.
    #[error("storage: {0}")]
    Storage(#[from] beehive_wal::WalError),

    /// Consensus engine error.
    #[error("consensus: {0}")]
    Consensus(#[from] beehive_raft::MultiRaftError),

    /// Configuration rejected.
    #[error("config: {reason}")]
    Config {
        /// Why the configuration was rejected.
        reason: String,
    },
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RuntimeError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ServiceGone
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for RuntimeError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ReplyDropped
    }
}
