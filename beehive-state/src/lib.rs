//! Beehive State - the replicated state machine of one bee.
//!
//! A bee owns a set of dictionary cells and mutates them only by applying
//! committed transaction entries from its colony's consensus group. The
//! apply path validates each transaction's read set against current cell
//! versions, deduplicates redelivered messages through a bounded window,
//! and stamps outbound emits with a monotone sequence so downstream routers
//! can deliver them FIFO per `(source_bee, dest)` pair.
//!
//! Nothing a handler does is externally visible until its transaction entry
//! commits: writes stay staged in the [`Transaction`], and emits leave the
//! machine only from the committed-apply path.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod dict;
mod machine;
mod txn;

pub use dict::Dictionaries;
pub use machine::{ApplyOutcome, BeeMachine, StampedEmit};
pub use txn::{ColonyEntry, ControlEntry, EmitRecord, InstalledCell, Transaction, TxnCodecError, WriteOp};
