//! Beehive Tests - multi-node scenario tests.
//!
//! Nodes run as real service loops wired together through an in-process
//! loopback transport, so whole-cluster scenarios (claims, conflicts,
//! forwarding, failover, transfers, restarts) run in one process with no
//! sockets. Tests are organized by scenario family:
//!
//! - `loopback`: the in-process transport hub
//! - `harness`: cluster assembly and polling helpers
//! - `apps`: the counter and chain applications the scenarios drive

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod apps;
pub mod harness;
pub mod loopback;

// Scenario modules (only compiled for tests).
#[cfg(test)]
mod cluster_tests;
#[cfg(test)]
mod persistence_tests;
#[cfg(test)]
mod single_node_tests;
#[cfg(test)]
mod transfer_tests;
