//! Messages flowing through the hive.
//!
//! An envelope is immutable once enqueued. The payload is opaque to the
//! runtime; only the handler bound to `type_tag` interprets it.

use std::fmt;

use bytes::Bytes;

use crate::types::{BeeId, NodeId, TxnSeq};

/// Cluster-unique message identifier.
///
/// Composed from the originating node and a node-local counter so that two
/// nodes never allocate the same id. Bees record recently applied ids in a
/// bounded window to deduplicate at-least-once redelivery.
///
/// Emitted messages use a separate id space (top bit set) derived from
/// `(bee_id, txn_seq)`, which keeps replayed emits identical to the
/// originals.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct MsgId(u64);

/// Number of low bits holding the node-local counter.
const MSG_ID_COUNTER_BITS: u64 = 40;

/// Top bit marking ids of bee-emitted messages.
const MSG_ID_EMIT_BIT: u64 = 1 << 63;

impl MsgId {
    /// Creates a message id from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Composes a message id from the originating node and a local counter.
    ///
    /// # Panics
    /// Panics if the counter exceeds the 40-bit counter space.
    #[must_use]
    pub const fn compose(node: NodeId, counter: u64) -> Self {
        assert!(counter < (1 << MSG_ID_COUNTER_BITS), "message counter overflow");
        Self((node.get() << MSG_ID_COUNTER_BITS) | counter)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Composes the id of a message emitted by a bee.
    ///
    /// Deterministic in `(bee, seq)` so that log replay regenerates the
    /// same ids the live run produced.
    ///
    /// # Panics
    /// Panics if the sequence exceeds the 40-bit sequence space.
    #[must_use]
    pub const fn emitted(bee: BeeId, seq: TxnSeq) -> Self {
        assert!(seq.get() < (1 << MSG_ID_COUNTER_BITS), "emit sequence overflow");
        assert!(bee.get() < (1 << 23), "bee id exceeds emit id space");
        Self(MSG_ID_EMIT_BIT | (bee.get() << MSG_ID_COUNTER_BITS) | seq.get())
    }

    /// Returns the originating node encoded in this id.
    ///
    /// Only meaningful for externally injected ids (emit bit clear).
    #[must_use]
    pub const fn node(self) -> NodeId {
        NodeId::new((self.0 & !MSG_ID_EMIT_BIT) >> MSG_ID_COUNTER_BITS)
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg({:#x})", self.0)
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{:x}", self.0)
    }
}

/// Trace identifier propagated from a message to everything it causes.
///
/// The first message in a causal chain sets the trace; emits inherit it.
/// Carried in every error log alongside the bee id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct TraceId(u64);

impl TraceId {
    /// Creates a trace id from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace({:#x})", self.0)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trace-{:x}", self.0)
    }
}

/// A message as routed through the hive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Stable handler dispatch tag.
    pub type_tag: String,
    /// Opaque payload; only the handler interprets it.
    pub payload: Bytes,
    /// The bee that emitted this message, if any.
    pub from_bee: Option<BeeId>,
    /// Cluster-unique message id, used for replay dedup.
    pub id: MsgId,
    /// Trace id propagated along the causal chain.
    pub trace: TraceId,
    /// Optional deadline in microseconds since the hive's epoch. Expiring
    /// before the transaction commits aborts the in-flight transaction.
    pub deadline_us: Option<u64>,
}

impl Envelope {
    /// Creates a new externally injected envelope.
    #[must_use]
    pub fn new(type_tag: impl Into<String>, payload: impl Into<Bytes>, id: MsgId) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload: payload.into(),
            from_bee: None,
            id,
            trace: TraceId::new(id.get()),
            deadline_us: None,
        }
    }

    /// Sets a delivery deadline.
    #[must_use]
    pub const fn with_deadline_us(mut self, deadline_us: u64) -> Self {
        self.deadline_us = Some(deadline_us);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_id_compose() {
        let id = MsgId::compose(NodeId::new(3), 17);
        assert_eq!(id.node(), NodeId::new(3));
        assert_ne!(id, MsgId::compose(NodeId::new(4), 17));
        assert_ne!(id, MsgId::compose(NodeId::new(3), 18));
    }

    #[test]
    #[should_panic(expected = "message counter overflow")]
    fn test_msg_id_counter_overflow_panics() {
        let _ = MsgId::compose(NodeId::new(1), 1 << 40);
    }

    #[test]
    fn test_envelope_defaults() {
        let id = MsgId::compose(NodeId::new(1), 1);
        let env = Envelope::new("hello", &b"A"[..], id);

        assert_eq!(env.type_tag, "hello");
        assert!(env.from_bee.is_none());
        assert!(env.deadline_us.is_none());
        assert_eq!(env.trace.get(), id.get());
    }
}
