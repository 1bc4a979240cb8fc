//! Errors surfaced by the Beehive core.
//!
//! All errors are handled explicitly. Retries are bounded and transparent
//! only for transient routing and claim-conflict errors; everything else
//! surfaces to the sender's reply channel and is logged with bee id and
//! trace id.

use std::collections::BTreeMap;
use std::fmt;

use crate::cell::Cell;
use crate::types::{BeeId, Epoch, GroupId, NodeId};

/// The result type for Beehive operations.
pub type Result<T> = std::result::Result<T, HiveError>;

/// Errors that can surface from the Beehive core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HiveError {
    /// `map` returned cells owned by different bees; the invocation is
    /// rejected rather than silently split.
    SplitCells {
        /// The owners and the cells each holds.
        owners: BTreeMap<BeeId, Vec<Cell>>,
    },

    /// A concurrent claim committed first. The router retries via lookup.
    Conflict {
        /// The owners observed at apply time.
        owners: BTreeMap<BeeId, Vec<Cell>>,
    },

    /// Routing reached a node that no longer leads the colony.
    NotLeader {
        /// The colony group that was addressed.
        group: GroupId,
        /// The leader known to the replying node, if any.
        known_leader: Option<NodeId>,
    },

    /// A forwarder used a stale registry epoch.
    EpochStale {
        /// The epoch the forwarder presented.
        presented: Epoch,
        /// The current epoch at the owner.
        current: Epoch,
    },

    /// The read set was invalidated `max_retries` times.
    TransactionAborted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The staged transaction exceeded the configured size cap.
    TransactionTooLarge {
        /// Staged size in bytes.
        size: u64,
        /// The configured cap.
        max: u64,
    },

    /// The message deadline expired before the transaction committed.
    Timeout {
        /// What was being waited on.
        operation: &'static str,
        /// How long we waited (in microseconds).
        waited_us: u64,
    },

    /// The bee's colony lost quorum; its cells are unavailable until an
    /// operator forces recovery from a surviving snapshot.
    Stalled {
        /// The stalled bee.
        bee: BeeId,
    },

    /// The handler's `rcv` reported failure; the transaction was
    /// discarded and the message re-queued or dropped per app policy.
    HandlerFailed {
        /// The handler's reason.
        reason: String,
    },

    /// The joining node's application set differs from the cluster's.
    ConfigMismatch {
        /// Cluster-side configuration hash.
        cluster: u64,
        /// Joiner-side configuration hash.
        joiner: u64,
    },

    /// An invalid argument was provided.
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// The requested resource was not found.
    NotFound {
        /// The type of resource.
        resource: &'static str,
        /// An identifier for the resource.
        id: u64,
    },

    /// A resource limit was exceeded.
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// The runtime is shutting down.
    Shutdown,
}

impl HiveError {
    /// Returns true if the router may retry this error transparently.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::NotLeader { .. } | Self::EpochStale { .. }
        )
    }
}

impl fmt::Display for HiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SplitCells { owners } => {
                write!(f, "mapped cells span {} bees", owners.len())
            }
            Self::Conflict { owners } => {
                write!(f, "claim lost to concurrent owner(s): {}", owners.len())
            }
            Self::NotLeader { group, known_leader } => match known_leader {
                Some(node) => write!(f, "not leader for {group}, leader is {node}"),
                None => write!(f, "not leader for {group}, leader unknown"),
            },
            Self::EpochStale { presented, current } => {
                write!(f, "stale epoch {presented}, current is {current}")
            }
            Self::TransactionAborted { attempts } => {
                write!(f, "transaction aborted after {attempts} attempts")
            }
            Self::TransactionTooLarge { size, max } => {
                write!(f, "transaction too large: {size} bytes (max {max})")
            }
            Self::Timeout { operation, waited_us } => {
                write!(f, "timeout: {operation} after {waited_us}us")
            }
            Self::Stalled { bee } => write!(f, "{bee} lost quorum and is stalled"),
            Self::HandlerFailed { reason } => write!(f, "handler failed: {reason}"),
            Self::ConfigMismatch { cluster, joiner } => {
                write!(
                    f,
                    "application sets differ: cluster {cluster:#x}, joiner {joiner:#x}"
                )
            }
            Self::InvalidArgument { name, reason } => {
                write!(f, "invalid argument '{name}': {reason}")
            }
            Self::NotFound { resource, id } => write!(f, "{resource} not found: {id}"),
            Self::LimitExceeded { limit, max, actual } => {
                write!(f, "limit exceeded: {limit} (max={max}, actual={actual})")
            }
            Self::Shutdown => write!(f, "runtime is shutting down"),
        }
    }
}

impl std::error::Error for HiveError {}
