//! Beehive Registry - the replicated cluster state machine.
//!
//! The registry is the single source of truth for cell ownership: the map
//! `cell -> (bee_id, epoch)` plus its reverse index, node membership, and
//! the application table. It is replicated by the cluster consensus group;
//! every mutation is a [`RegistryCommand`] proposed to that group and
//! applied deterministically on each node in commit order.
//!
//! Lookups are local reads of the latest applied state. Claims linearize by
//! commit order: the first claim proposal to commit wins; losers observe a
//! conflict and re-route.
//!
//! # Design
//!
//! - **Single owner**: a cell maps to at most one live bee, by construction
//! - **Epochs**: every ownership change bumps the cell's epoch so stale
//!   forwarders can detect and refresh
//! - **Two-phase moves**: cells move between bees only through drain, then
//!   transfer

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod command;
mod state;

pub use command::{CodecError, RegistryCommand};
pub use state::{
    BeeRecord, NodeRecord, RegistryError, RegistryEvent, RegistryState, Resolution,
};
