//! Beehive Core - Strongly-typed identifiers and shared types for Beehive.
//!
//! This crate provides the types every other Beehive crate speaks in: typed
//! ids, dictionary cells, messages, application descriptors, resource limits,
//! and the surface error enum. It performs no I/O.
//!
//! # Design Principles
//!
//! - **Strongly-typed IDs**: Prevent mixing up `NodeId` with `BeeId`
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod app;
mod cell;
mod error;
mod limits;
mod message;
mod types;

pub use app::{AppName, AppOptions, OutboundPolicy, Persistence};
pub use cell::{Cell, MappedCells};
pub use error::{HiveError, Result};
pub use limits::Limits;
pub use message::{Envelope, MsgId, TraceId};
pub use types::{BeeId, Epoch, GroupId, LogIndex, NodeId, TermId, TxnSeq};
