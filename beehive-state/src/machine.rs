//! The bee state machine applier.
//!
//! Consumes committed [`ColonyEntry`] values in log order. Only the apply
//! path mutates dictionaries or releases emits, so replaying the same log
//! from the same snapshot reproduces the same state and the same emit
//! sequence on every replica.

use std::collections::{HashSet, VecDeque};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{BeeId, Cell, MsgId, TraceId, TxnSeq};
use tracing::{debug, warn};

use crate::dict::Dictionaries;
use crate::txn::{ColonyEntry, ControlEntry, EmitRecord, Transaction, TxnCodecError, WriteOp};

/// An emit released by a committed transaction, stamped for FIFO delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedEmit {
    /// The emitting bee.
    pub from_bee: BeeId,
    /// Monotone per-bee sequence; routers deliver per-pair FIFO by it.
    pub seq: TxnSeq,
    /// Deterministic id of the emitted message.
    pub msg_id: MsgId,
    /// Trace inherited from the causing transaction.
    pub trace: TraceId,
    /// The emitted record.
    pub record: EmitRecord,
}

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The transaction applied; these emits are now released.
    Committed {
        /// Emits in list order, stamped with consecutive sequences.
        emits: Vec<StampedEmit>,
    },
    /// The read set no longer matched; nothing changed. The executor
    /// retries with refreshed reads up to its bound.
    ReadSetInvalid {
        /// The first stale cell.
        cell: Cell,
        /// The version the transaction observed.
        observed: u64,
        /// The version at apply time.
        current: u64,
    },
    /// The message id was in the dedup window; redelivery skipped.
    Duplicate,
    /// A control entry applied.
    ControlApplied,
    /// A transaction touched a quiesced cell; the caller re-queues it
    /// until the transfer lands.
    Quiesced {
        /// The quiesced cell that blocked the transaction.
        cell: Cell,
    },
}

/// Bounded window of recently applied message ids.
///
/// Sized in entries; eviction is FIFO. Redelivered messages inside the
/// window are dropped, which bounds duplicate application under the
/// at-least-once emit policy.
#[derive(Debug, Default, Clone)]
struct DedupWindow {
    order: VecDeque<MsgId>,
    members: HashSet<MsgId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: MsgId) -> bool {
        self.members.contains(&id)
    }

    fn record(&mut self, id: MsgId) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = MsgId> + '_ {
        self.order.iter().copied()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// The replicated state machine of one bee.
#[derive(Debug)]
pub struct BeeMachine {
    /// The bee this machine belongs to.
    bee: BeeId,
    /// Its dictionaries.
    dicts: Dictionaries,
    /// Replay-dedup window of applied message ids.
    dedup: DedupWindow,
    /// Next emit sequence to assign.
    next_emit_seq: TxnSeq,
    /// Cells currently quiesced by a drain.
    quiesced: std::collections::BTreeSet<Cell>,
    /// Highest entry index applied.
    applied_index: u64,
}

impl BeeMachine {
    /// Creates a fresh machine.
    #[must_use]
    pub fn new(bee: BeeId, dedup_capacity: usize) -> Self {
        Self {
            bee,
            dicts: Dictionaries::new(),
            dedup: DedupWindow::new(dedup_capacity),
            next_emit_seq: TxnSeq::new(0),
            quiesced: std::collections::BTreeSet::new(),
            applied_index: 0,
        }
    }

    /// Returns the bee id.
    #[must_use]
    pub const fn bee(&self) -> BeeId {
        self.bee
    }

    /// Returns the dictionaries for reads.
    #[must_use]
    pub const fn dicts(&self) -> &Dictionaries {
        &self.dicts
    }

    /// Returns the highest applied entry index.
    #[must_use]
    pub const fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Returns the next emit sequence (for inspection and snapshots).
    #[must_use]
    pub const fn next_emit_seq(&self) -> TxnSeq {
        self.next_emit_seq
    }

    /// Returns true if the cell is currently quiesced.
    #[must_use]
    pub fn is_quiesced(&self, cell: &Cell) -> bool {
        self.quiesced.contains(cell)
    }

    /// Applies a committed entry at `index`.
    ///
    /// Duplicate deliveries (same or lower index) return `Duplicate`
    /// without touching state, keeping the applier idempotent under the
    /// wrapper's at-least-once contract.
    pub fn apply(&mut self, index: u64, entry: &ColonyEntry) -> ApplyOutcome {
        if index <= self.applied_index {
            debug!(bee = %self.bee, index, applied = self.applied_index, "duplicate entry skipped");
            return ApplyOutcome::Duplicate;
        }
        self.applied_index = index;

        match entry {
            ColonyEntry::Txn(txn) => self.apply_txn(txn),
            ColonyEntry::Control(control) => self.apply_control(control),
        }
    }

    /// Decodes and applies raw committed bytes.
    ///
    /// # Errors
    /// Returns the codec error if the entry does not decode.
    pub fn apply_bytes(&mut self, index: u64, data: Bytes) -> Result<ApplyOutcome, TxnCodecError> {
        let entry = ColonyEntry::decode(data)?;
        Ok(self.apply(index, &entry))
    }

    fn apply_txn(&mut self, txn: &Transaction) -> ApplyOutcome {
        // Redelivered messages are dropped before any validation; their
        // effects are already in the state.
        if self.dedup.contains(txn.msg_id) {
            debug!(bee = %self.bee, msg_id = %txn.msg_id, "duplicate message dropped");
            return ApplyOutcome::Duplicate;
        }

        // A transaction touching a quiesced cell waits out the transfer.
        let touched = txn
            .reads
            .iter()
            .map(|(cell, _)| cell)
            .chain(txn.writes.iter().map(|(cell, _)| cell));
        for cell in touched {
            if self.quiesced.contains(cell) {
                return ApplyOutcome::Quiesced { cell: cell.clone() };
            }
        }

        // Validate the read set: every observed version must still hold.
        for (cell, observed) in &txn.reads {
            let current = self.dicts.version(cell);
            if current != *observed {
                return ApplyOutcome::ReadSetInvalid {
                    cell: cell.clone(),
                    observed: *observed,
                    current,
                };
            }
        }

        // Apply writes in handler order, bumping versions.
        for (cell, op) in &txn.writes {
            match op {
                WriteOp::Put(value) => self.dicts.put(cell.clone(), value.clone()),
                WriteOp::Del => self.dicts.del(cell),
            }
        }

        // Stamp emits with consecutive sequences; they are released only
        // now, from the committed-apply path.
        let mut emits = Vec::with_capacity(txn.emits.len());
        for record in &txn.emits {
            let seq = self.next_emit_seq;
            self.next_emit_seq = seq.next();
            emits.push(StampedEmit {
                from_bee: self.bee,
                seq,
                msg_id: MsgId::emitted(self.bee, seq),
                trace: txn.trace,
                record: record.clone(),
            });
        }

        self.dedup.record(txn.msg_id);
        ApplyOutcome::Committed { emits }
    }

    fn apply_control(&mut self, control: &ControlEntry) -> ApplyOutcome {
        match control {
            ControlEntry::Quiesce { cells } => {
                for cell in cells {
                    self.quiesced.insert(cell.clone());
                }
            }
            ControlEntry::Unquiesce { cells } => {
                for cell in cells {
                    self.quiesced.remove(cell);
                }
            }
            ControlEntry::InstallCells { cells } => {
                for installed in cells {
                    self.dicts.install(
                        installed.cell.clone(),
                        installed.value.clone(),
                        installed.version,
                    );
                }
            }
            ControlEntry::RemoveCells { cells } => {
                for cell in cells {
                    self.dicts.evict(cell);
                    self.quiesced.remove(cell);
                }
            }
            ControlEntry::SnapshotMark => {}
        }
        ApplyOutcome::ControlApplied
    }

    /// Serializes the machine for a colony snapshot: cells with versions,
    /// the dedup window, the emit sequence, and the applied index.
    #[must_use]
    pub fn encode_snapshot(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.applied_index);
        buf.put_u64_le(self.next_emit_seq.get());

        let versioned: Vec<_> = self.dicts.iter_versions().collect();
        buf.put_u32_le(u32::try_from(versioned.len()).unwrap_or(u32::MAX));
        for (cell, version) in versioned {
            put_cell(&mut buf, cell);
            buf.put_u64_le(version);
            match self.dicts.get(cell).0 {
                Some(value) => {
                    buf.put_u8(1);
                    buf.put_u32_le(u32::try_from(value.len()).unwrap_or(u32::MAX));
                    buf.put_slice(value);
                }
                None => buf.put_u8(0),
            }
        }

        buf.put_u32_le(u32::try_from(self.quiesced.len()).unwrap_or(u32::MAX));
        for cell in &self.quiesced {
            put_cell(&mut buf, cell);
        }

        buf.put_u32_le(u32::try_from(self.dedup.len()).unwrap_or(u32::MAX));
        for id in self.dedup.iter() {
            buf.put_u64_le(id.get());
        }

        buf.freeze()
    }

    /// Rebuilds a machine from snapshot bytes.
    ///
    /// # Errors
    /// Returns an error if the snapshot is malformed.
    pub fn decode_snapshot(
        bee: BeeId,
        dedup_capacity: usize,
        mut buf: Bytes,
    ) -> Result<Self, TxnCodecError> {
        let mut machine = Self::new(bee, dedup_capacity);
        machine.applied_index = get_u64(&mut buf)?;
        machine.next_emit_seq = TxnSeq::new(get_u64(&mut buf)?);

        let cell_count = get_u32(&mut buf)? as usize;
        for _ in 0..cell_count {
            let cell = get_cell(&mut buf)?;
            let version = get_u64(&mut buf)?;
            let value = match get_u8(&mut buf)? {
                1 => {
                    let len = get_u32(&mut buf)? as usize;
                    if buf.remaining() < len {
                        return Err(TxnCodecError::Truncated { needed: len });
                    }
                    Some(buf.copy_to_bytes(len))
                }
                _ => None,
            };
            machine.dicts.install(cell, value, version);
        }

        let quiesced_count = get_u32(&mut buf)? as usize;
        for _ in 0..quiesced_count {
            machine.quiesced.insert(get_cell(&mut buf)?);
        }

        let dedup_count = get_u32(&mut buf)? as usize;
        for _ in 0..dedup_count {
            machine.dedup.record(MsgId::new(get_u64(&mut buf)?));
        }

        if buf.has_remaining() {
            warn!(bee = %bee, trailing = buf.remaining(), "trailing bytes in snapshot");
        }
        Ok(machine)
    }
}

fn put_cell(buf: &mut BytesMut, cell: &Cell) {
    buf.put_u16_le(u16::try_from(cell.dict.len()).unwrap_or(u16::MAX));
    buf.put_slice(cell.dict.as_bytes());
    buf.put_u32_le(u32::try_from(cell.key.len()).unwrap_or(u32::MAX));
    buf.put_slice(&cell.key);
}

fn get_cell(buf: &mut Bytes) -> Result<Cell, TxnCodecError> {
    if buf.remaining() < 2 {
        return Err(TxnCodecError::Truncated { needed: 2 });
    }
    let dict_len = buf.get_u16_le() as usize;
    if buf.remaining() < dict_len {
        return Err(TxnCodecError::Truncated { needed: dict_len });
    }
    let dict = String::from_utf8(buf.copy_to_bytes(dict_len).to_vec())
        .map_err(|_| TxnCodecError::InvalidUtf8)?;
    let key_len = get_u32(buf)? as usize;
    if buf.remaining() < key_len {
        return Err(TxnCodecError::Truncated { needed: key_len });
    }
    let key = buf.copy_to_bytes(key_len);
    Ok(Cell { dict, key })
}

fn get_u8(buf: &mut Bytes) -> Result<u8, TxnCodecError> {
    if !buf.has_remaining() {
        return Err(TxnCodecError::Truncated { needed: 1 });
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, TxnCodecError> {
    if buf.remaining() < 4 {
        return Err(TxnCodecError::Truncated { needed: 4 });
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, TxnCodecError> {
    if buf.remaining() < 8 {
        return Err(TxnCodecError::Truncated { needed: 8 });
    }
    Ok(buf.get_u64_le())
}
