//! The handler contract.
//!
//! An application binds message type tags to handlers. Each handler is two
//! functions: `map` declares which cells a message needs, and `rcv` mutates
//! those cells and emits further messages. Both receive explicit context
//! values scoped to the invocation; the contexts stage everything in the
//! transaction buffer and become invalid when the handler returns.
//!
//! Contracts the runtime relies on:
//! - `map` is pure, total, and deterministic in the message
//! - `rcv` is deterministic in (message, cells read, bee id, supplied
//!   clock) and performs no uncontrolled I/O

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use beehive_core::{AppName, AppOptions, BeeId, Cell, Envelope, MappedCells, NodeId};
use beehive_state::{Dictionaries, EmitRecord, Transaction, WriteOp};

/// A handler failure reported by `rcv`.
///
/// Failures discard the transaction; the message is re-queued or dropped
/// per the application's outbound policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    /// What went wrong, in the handler's words.
    pub reason: String,
}

impl HandlerError {
    /// Creates a handler error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failed: {}", self.reason)
    }
}

impl std::error::Error for HandlerError {}

/// Context passed to `map`.
#[derive(Debug, Clone, Copy)]
pub struct MapCtx {
    /// The local node (informational; `map` must not branch on it for
    /// cell selection).
    pub node_id: NodeId,
}

/// Context passed to `rcv`, scoped to one transaction.
///
/// Reads record observed versions into the read set; writes and emits are
/// staged and become visible only if the transaction commits.
pub struct RcvCtx<'a> {
    bee: BeeId,
    now_us: u64,
    dicts: &'a Dictionaries,
    txn: &'a mut Transaction,
}

impl<'a> RcvCtx<'a> {
    /// Creates a context over a bee's dictionaries and a fresh transaction.
    #[must_use]
    pub fn new(bee: BeeId, now_us: u64, dicts: &'a Dictionaries, txn: &'a mut Transaction) -> Self {
        Self {
            bee,
            now_us,
            dicts,
            txn,
        }
    }

    /// Returns the owning bee's id.
    #[must_use]
    pub const fn bee_id(&self) -> BeeId {
        self.bee
    }

    /// Returns the wall clock supplied to this invocation, in
    /// microseconds. Handlers must use this instead of reading time
    /// themselves, or replay diverges.
    #[must_use]
    pub const fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Opens a dictionary by name.
    #[must_use]
    pub fn dict(&mut self, name: &str) -> DictHandle<'_, 'a> {
        DictHandle {
            name: name.to_owned(),
            ctx: self,
        }
    }

    /// Stages an outbound message.
    pub fn emit(&mut self, type_tag: impl Into<String>, payload: impl Into<Bytes>) {
        self.txn.emits.push(EmitRecord {
            type_tag: type_tag.into(),
            payload: payload.into(),
        });
    }

    fn get(&mut self, cell: &Cell) -> Option<Bytes> {
        // Read-your-writes: staged writes shadow the committed state.
        for (written, op) in self.txn.writes.iter().rev() {
            if written == cell {
                return match op {
                    WriteOp::Put(value) => Some(value.clone()),
                    WriteOp::Del => None,
                };
            }
        }

        let (value, version) = self.dicts.get(cell);
        // Record the observed version once per cell.
        if !self.txn.reads.iter().any(|(c, _)| c == cell) {
            self.txn.reads.push((cell.clone(), version));
        }
        value.cloned()
    }

    fn put(&mut self, cell: Cell, value: Bytes) {
        self.txn.writes.push((cell, WriteOp::Put(value)));
    }

    fn del(&mut self, cell: Cell) {
        self.txn.writes.push((cell, WriteOp::Del));
    }
}

/// A named dictionary scoped to one `rcv` invocation.
pub struct DictHandle<'h, 'a> {
    name: String,
    ctx: &'h mut RcvCtx<'a>,
}

impl DictHandle<'_, '_> {
    /// Reads a key, recording the observed version in the read set.
    pub fn get(&mut self, key: impl Into<Bytes>) -> Option<Bytes> {
        let cell = Cell::new(self.name.clone(), key);
        self.ctx.get(&cell)
    }

    /// Stages a write.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        let cell = Cell::new(self.name.clone(), key);
        self.ctx.put(cell, value.into());
    }

    /// Stages a delete.
    pub fn del(&mut self, key: impl Into<Bytes>) {
        let cell = Cell::new(self.name.clone(), key);
        self.ctx.del(cell);
    }
}

/// A message handler: the `(map, rcv)` pair bound to a type tag.
pub trait Handler: Send + Sync {
    /// Declares the cells this message needs. Returning `None` means the
    /// message maps to nothing and is dropped (a handler bug, logged).
    fn map(&self, env: &Envelope, ctx: &MapCtx) -> Option<MappedCells>;

    /// Processes the message against the mapped cells.
    ///
    /// # Errors
    /// A returned error discards the transaction: no dictionary change,
    /// no emits.
    fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError>;
}

/// An application: a named set of handlers plus options, identical on
/// every node.
pub struct App {
    /// The application name.
    pub name: AppName,
    /// Recognized options.
    pub options: AppOptions,
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl App {
    /// Creates an application.
    #[must_use]
    pub fn new(name: impl Into<AppName>, options: AppOptions) -> Self {
        Self {
            name: name.into(),
            options,
            handlers: HashMap::new(),
        }
    }

    /// Binds a handler to a message type tag.
    ///
    /// # Panics
    /// Panics if the tag is already bound (same-named handlers on one app
    /// are a registration bug, caught at startup).
    #[must_use]
    pub fn handle(mut self, type_tag: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        let tag = type_tag.into();
        let previous = self.handlers.insert(tag.clone(), handler);
        assert!(previous.is_none(), "type tag '{tag}' bound twice");
        self
    }

    /// Returns the handler for a tag.
    #[must_use]
    pub fn handler(&self, type_tag: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(type_tag)
    }

    /// Iterates the bound type tags in sorted order.
    #[must_use]
    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Folds the app's name, options, and tags into a hash word, compared
    /// across nodes at join time.
    #[must_use]
    pub fn config_word(&self) -> u64 {
        let mut word = self.options.config_word();
        for byte in self.name.as_str().bytes() {
            word = word.rotate_left(7) ^ u64::from(byte);
        }
        for tag in self.type_tags() {
            for byte in tag.bytes() {
                word = word.rotate_left(7) ^ u64::from(byte);
            }
            word = word.rotate_left(13);
        }
        word
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("type_tags", &self.type_tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beehive_core::{MsgId, TraceId};

    struct Counter;

    impl Handler for Counter {
        fn map(&self, env: &Envelope, _ctx: &MapCtx) -> Option<MappedCells> {
            Some(MappedCells::single(Cell::new(
                "hello",
                env.payload.clone(),
            )))
        }

        fn rcv(&self, env: &Envelope, ctx: &mut RcvCtx<'_>) -> Result<(), HandlerError> {
            let key = env.payload.clone();
            let count = ctx
                .dict("hello")
                .get(key.clone())
                .map_or(0u64, |v| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&v);
                    u64::from_le_bytes(bytes)
                });
            ctx.dict("hello")
                .put(key, (count + 1).to_le_bytes().to_vec());
            Ok(())
        }
    }

    fn env(payload: &str) -> Envelope {
        Envelope::new("hello", payload.as_bytes().to_vec(), MsgId::new(1))
    }

    #[test]
    fn test_rcv_records_reads_and_stages_writes() {
        let dicts = Dictionaries::new();
        let mut txn = Transaction::new(MsgId::new(1), TraceId::new(1));
        let mut ctx = RcvCtx::new(BeeId::new(1), 0, &dicts, &mut txn);

        Counter.rcv(&env("A"), &mut ctx).unwrap();

        assert_eq!(txn.reads.len(), 1);
        assert_eq!(txn.reads[0].1, 0); // absent cell observed at version 0
        assert_eq!(txn.writes.len(), 1);
        // Nothing touched the dictionaries themselves.
        assert!(dicts.is_empty());
    }

    #[test]
    fn test_read_your_writes() {
        let dicts = Dictionaries::new();
        let mut txn = Transaction::new(MsgId::new(1), TraceId::new(1));
        let mut ctx = RcvCtx::new(BeeId::new(1), 0, &dicts, &mut txn);

        ctx.dict("d").put("k", "staged");
        assert_eq!(ctx.dict("d").get("k"), Some(Bytes::from("staged")));

        ctx.dict("d").del("k");
        assert_eq!(ctx.dict("d").get("k"), None);

        // The shadowed read recorded no read-set entry (it never reached
        // the committed state).
        assert!(txn.reads.is_empty());
    }

    #[test]
    fn test_emit_staged_in_order() {
        let dicts = Dictionaries::new();
        let mut txn = Transaction::new(MsgId::new(1), TraceId::new(1));
        let mut ctx = RcvCtx::new(BeeId::new(1), 0, &dicts, &mut txn);

        ctx.emit("a", &b"1"[..]);
        ctx.emit("b", &b"2"[..]);

        assert_eq!(txn.emits.len(), 2);
        assert_eq!(txn.emits[0].type_tag, "a");
        assert_eq!(txn.emits[1].type_tag, "b");
    }

    #[test]
    fn test_app_config_word_sensitive_to_tags() {
        let a = App::new("app", AppOptions::default()).handle("x", Arc::new(Counter));
        let b = App::new("app", AppOptions::default()).handle("y", Arc::new(Counter));
        let c = App::new("app", AppOptions::default()).handle("x", Arc::new(Counter));

        assert_ne!(a.config_word(), b.config_word());
        assert_eq!(a.config_word(), c.config_word());
    }

    #[test]
    #[should_panic(expected = "bound twice")]
    fn test_duplicate_tag_panics() {
        let _ = App::new("app", AppOptions::default())
            .handle("x", Arc::new(Counter))
            .handle("x", Arc::new(Counter));
    }
}
