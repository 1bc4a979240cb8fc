//! Beehive Routing - routing policy and cell placement.
//!
//! This crate holds the sans-IO halves of message routing: the leader cache
//! that remembers which node leads each colony, the map cache that skips
//! re-running deterministic `map` functions, the advisory placement scorer,
//! and the coordinator that drives a cell transfer through its two-phase
//! drain.
//!
//! The async router in the runtime crate consults these and owns all I/O.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod leader_cache;
mod map_cache;
mod placement;
mod transfer;

pub use leader_cache::{LeaderCache, LeaderCacheConfig};
pub use map_cache::MapCache;
pub use placement::{BeeStats, PlacementAction, PlacementConfig, Rebalancer};
pub use transfer::{
    CellTransfer, TransferOutput, TransferPhase, MAX_CONCURRENT_TRANSFERS,
    TRANSFER_TIMEOUT_TICKS,
};

/// Maximum transparent routing retries on stale leaders or lost claims.
pub const ROUTING_RETRIES_MAX: u32 = 3;
