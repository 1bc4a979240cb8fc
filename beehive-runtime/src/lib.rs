//! Beehive Runtime - the node that makes the pieces move.
//!
//! This crate assembles the sans-IO components into a running hive: the
//! consensus group engine with durable logs, the TCP transport, the node
//! service loop (router, colony manager, failure detector, placement), the
//! per-bee actors that execute handlers, and the [`Hive`] handle an
//! application drives it all through.
//!
//! # Starting a node
//!
//! ```ignore
//! let app = App::new("counter", AppOptions::default())
//!     .handle("hello", Arc::new(CounterHandler));
//!
//! let hive = HiveBuilder::new(HiveConfig::new(NodeId::new(1), addr))
//!     .app(app)
//!     .start()
//!     .await?;
//!
//! hive.emit("hello", "A").await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod bee;
mod codec;
mod config;
mod error;
mod group;
mod handler;
mod hive;
mod service;
mod transport;

pub use bee::{BeeCommand, DeliverReply, ReadReply};
pub use codec::{CodecError, ForwardFrame, WireMessage};
pub use config::{HiveConfig, PeerConfig, TimingConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use group::{GroupEngine, GroupOutput, RecoveredGroup};
pub use handler::{App, DictHandle, Handler, HandlerError, MapCtx, RcvCtx};
pub use hive::{Hive, HiveBuilder};
pub use service::{BeeInfo, NodeService, OpReply, ServiceCommand};
pub use transport::{PeerTransport, Transport, TransportConfig, TransportError, TransportHandle};
