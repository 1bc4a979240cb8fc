//! Transaction and control entries for a colony's log.
//!
//! One handler invocation produces exactly one transaction entry: the read
//! set with observed versions, the staged writes, and the staged emits.
//! Control entries carry quiesce/unquiesce and cell movement for transfers.
//! Both are framed with a one-byte tag and hand-rolled little-endian
//! fields, since they travel as opaque consensus payloads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{Cell, MsgId, TraceId};

/// Entry tags on the wire.
const TAG_TXN: u8 = 1;
const TAG_CONTROL: u8 = 2;

/// Control sub-tags.
const CTL_QUIESCE: u8 = 1;
const CTL_UNQUIESCE: u8 = 2;
const CTL_INSTALL_CELLS: u8 = 3;
const CTL_REMOVE_CELLS: u8 = 4;
const CTL_SNAPSHOT_MARK: u8 = 5;

/// A staged dictionary write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set the cell to a value.
    Put(Bytes),
    /// Delete the cell.
    Del,
}

/// An outbound message staged by `rcv`, released only on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitRecord {
    /// Handler dispatch tag of the emitted message.
    pub type_tag: String,
    /// Emitted payload.
    pub payload: Bytes,
}

/// One handler invocation, captured for atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// The message that triggered the invocation; recorded in the dedup
    /// window at apply time.
    pub msg_id: MsgId,
    /// Trace propagated to everything this transaction causes.
    pub trace: TraceId,
    /// Cells actually read, with the versions observed.
    pub reads: Vec<(Cell, u64)>,
    /// Staged writes, in handler order.
    pub writes: Vec<(Cell, WriteOp)>,
    /// Staged emits, in handler order.
    pub emits: Vec<EmitRecord>,
}

impl Transaction {
    /// Creates an empty transaction for a message.
    #[must_use]
    pub const fn new(msg_id: MsgId, trace: TraceId) -> Self {
        Self {
            msg_id,
            trace,
            reads: Vec::new(),
            writes: Vec::new(),
            emits: Vec::new(),
        }
    }

    /// Returns the staged size in bytes (writes plus emits), used against
    /// the transaction size cap.
    #[must_use]
    pub fn staged_bytes(&self) -> u64 {
        let writes: u64 = self
            .writes
            .iter()
            .map(|(cell, op)| {
                let value = match op {
                    WriteOp::Put(v) => v.len() as u64,
                    WriteOp::Del => 0,
                };
                cell.dict.len() as u64 + cell.key.len() as u64 + value
            })
            .sum();
        let emits: u64 = self
            .emits
            .iter()
            .map(|e| e.type_tag.len() as u64 + e.payload.len() as u64)
            .sum();
        writes + emits
    }

    /// Returns true if the transaction stages no writes and no emits.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.emits.is_empty()
    }
}

/// A cell arriving from a transfer, with its value and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledCell {
    /// The cell.
    pub cell: Cell,
    /// Its value, if it held one.
    pub value: Option<Bytes>,
    /// Its version at the source.
    pub version: u64,
}

/// Control entries interleaved with transactions in a colony's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEntry {
    /// Stop processing messages for these cells (drain phase one).
    Quiesce {
        /// The cells to stop serving.
        cells: Vec<Cell>,
    },
    /// Resume processing messages for these cells (aborted drain).
    Unquiesce {
        /// The cells to resume serving.
        cells: Vec<Cell>,
    },
    /// Install cells arriving from a registry transfer.
    InstallCells {
        /// The cells with their values and versions.
        cells: Vec<InstalledCell>,
    },
    /// Drop cells transferred away.
    RemoveCells {
        /// The cells to drop.
        cells: Vec<Cell>,
    },
    /// Marks that a snapshot was cut at this index.
    SnapshotMark,
}

/// Any entry in a colony's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColonyEntry {
    /// A handler invocation.
    Txn(Transaction),
    /// A control action.
    Control(ControlEntry),
}

impl ColonyEntry {
    /// Encodes the entry for proposal.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Txn(txn) => {
                buf.put_u8(TAG_TXN);
                buf.put_u64_le(txn.msg_id.get());
                buf.put_u64_le(txn.trace.get());

                buf.put_u32_le(len_u32(txn.reads.len()));
                for (cell, version) in &txn.reads {
                    put_cell(&mut buf, cell);
                    buf.put_u64_le(*version);
                }

                buf.put_u32_le(len_u32(txn.writes.len()));
                for (cell, op) in &txn.writes {
                    put_cell(&mut buf, cell);
                    match op {
                        WriteOp::Put(value) => {
                            buf.put_u8(1);
                            buf.put_u32_le(len_u32(value.len()));
                            buf.put_slice(value);
                        }
                        WriteOp::Del => buf.put_u8(0),
                    }
                }

                buf.put_u32_le(len_u32(txn.emits.len()));
                for emit in &txn.emits {
                    put_string(&mut buf, &emit.type_tag);
                    buf.put_u32_le(len_u32(emit.payload.len()));
                    buf.put_slice(&emit.payload);
                }
            }
            Self::Control(control) => {
                buf.put_u8(TAG_CONTROL);
                match control {
                    ControlEntry::Quiesce { cells } => {
                        buf.put_u8(CTL_QUIESCE);
                        put_cells(&mut buf, cells);
                    }
                    ControlEntry::Unquiesce { cells } => {
                        buf.put_u8(CTL_UNQUIESCE);
                        put_cells(&mut buf, cells);
                    }
                    ControlEntry::InstallCells { cells } => {
                        buf.put_u8(CTL_INSTALL_CELLS);
                        buf.put_u32_le(len_u32(cells.len()));
                        for installed in cells {
                            put_cell(&mut buf, &installed.cell);
                            match &installed.value {
                                Some(value) => {
                                    buf.put_u8(1);
                                    buf.put_u32_le(len_u32(value.len()));
                                    buf.put_slice(value);
                                }
                                None => buf.put_u8(0),
                            }
                            buf.put_u64_le(installed.version);
                        }
                    }
                    ControlEntry::RemoveCells { cells } => {
                        buf.put_u8(CTL_REMOVE_CELLS);
                        put_cells(&mut buf, cells);
                    }
                    ControlEntry::SnapshotMark => buf.put_u8(CTL_SNAPSHOT_MARK),
                }
            }
        }
        buf.freeze()
    }

    /// Decodes an entry from committed bytes.
    ///
    /// # Errors
    /// Returns an error on truncation or unknown tags.
    pub fn decode(mut buf: Bytes) -> Result<Self, TxnCodecError> {
        let tag = get_u8(&mut buf)?;
        match tag {
            TAG_TXN => {
                let msg_id = MsgId::new(get_u64(&mut buf)?);
                let trace = TraceId::new(get_u64(&mut buf)?);

                let read_count = get_u32(&mut buf)? as usize;
                let mut reads = Vec::with_capacity(read_count.min(1024));
                for _ in 0..read_count {
                    let cell = get_cell(&mut buf)?;
                    let version = get_u64(&mut buf)?;
                    reads.push((cell, version));
                }

                let write_count = get_u32(&mut buf)? as usize;
                let mut writes = Vec::with_capacity(write_count.min(1024));
                for _ in 0..write_count {
                    let cell = get_cell(&mut buf)?;
                    let op = match get_u8(&mut buf)? {
                        1 => {
                            let len = get_u32(&mut buf)? as usize;
                            WriteOp::Put(get_bytes(&mut buf, len)?)
                        }
                        0 => WriteOp::Del,
                        other => return Err(TxnCodecError::UnknownTag { tag: other }),
                    };
                    writes.push((cell, op));
                }

                let emit_count = get_u32(&mut buf)? as usize;
                let mut emits = Vec::with_capacity(emit_count.min(1024));
                for _ in 0..emit_count {
                    let type_tag = get_string(&mut buf)?;
                    let len = get_u32(&mut buf)? as usize;
                    let payload = get_bytes(&mut buf, len)?;
                    emits.push(EmitRecord { type_tag, payload });
                }

                Ok(Self::Txn(Transaction {
                    msg_id,
                    trace,
                    reads,
                    writes,
                    emits,
                }))
            }
            TAG_CONTROL => {
                let sub = get_u8(&mut buf)?;
                let control = match sub {
                    CTL_QUIESCE => ControlEntry::Quiesce {
                        cells: get_cells(&mut buf)?,
                    },
                    CTL_UNQUIESCE => ControlEntry::Unquiesce {
                        cells: get_cells(&mut buf)?,
                    },
                    CTL_INSTALL_CELLS => {
                        let count = get_u32(&mut buf)? as usize;
                        let mut cells = Vec::with_capacity(count.min(1024));
                        for _ in 0..count {
                            let cell = get_cell(&mut buf)?;
                            let value = match get_u8(&mut buf)? {
                                1 => {
                                    let len = get_u32(&mut buf)? as usize;
                                    Some(get_bytes(&mut buf, len)?)
                                }
                                _ => None,
                            };
                            let version = get_u64(&mut buf)?;
                            cells.push(InstalledCell {
                                cell,
                                value,
                                version,
                            });
                        }
                        ControlEntry::InstallCells { cells }
                    }
                    CTL_REMOVE_CELLS => ControlEntry::RemoveCells {
                        cells: get_cells(&mut buf)?,
                    },
                    CTL_SNAPSHOT_MARK => ControlEntry::SnapshotMark,
                    other => return Err(TxnCodecError::UnknownTag { tag: other }),
                };
                Ok(Self::Control(control))
            }
            other => Err(TxnCodecError::UnknownTag { tag: other }),
        }
    }
}

/// Codec errors for colony entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnCodecError {
    /// The buffer ended early.
    Truncated {
        /// Bytes that were needed.
        needed: usize,
    },
    /// Unknown entry or op tag.
    UnknownTag {
        /// The tag found.
        tag: u8,
    },
    /// A string field was not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for TxnCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed } => write!(f, "truncated entry: needed {needed} bytes"),
            Self::UnknownTag { tag } => write!(f, "unknown entry tag: {tag}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for TxnCodecError {}

#[allow(clippy::cast_possible_truncation)]
fn len_u32(len: usize) -> u32 {
    len as u32
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(u16::try_from(s.len()).unwrap_or(u16::MAX));
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, TxnCodecError> {
    if buf.remaining() < 2 {
        return Err(TxnCodecError::Truncated { needed: 2 });
    }
    let len = buf.get_u16_le() as usize;
    let bytes = get_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| TxnCodecError::InvalidUtf8)
}

fn put_cell(buf: &mut BytesMut, cell: &Cell) {
    put_string(buf, &cell.dict);
    buf.put_u32_le(len_u32(cell.key.len()));
    buf.put_slice(&cell.key);
}

fn get_cell(buf: &mut Bytes) -> Result<Cell, TxnCodecError> {
    let dict = get_string(buf)?;
    let len = get_u32(buf)? as usize;
    let key = get_bytes(buf, len)?;
    Ok(Cell { dict, key })
}

fn put_cells(buf: &mut BytesMut, cells: &[Cell]) {
    buf.put_u32_le(len_u32(cells.len()));
    for cell in cells {
        put_cell(buf, cell);
    }
}

fn get_cells(buf: &mut Bytes) -> Result<Vec<Cell>, TxnCodecError> {
    let count = get_u32(buf)? as usize;
    let mut cells = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        cells.push(get_cell(buf)?);
    }
    Ok(cells)
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, TxnCodecError> {
    if buf.remaining() < len {
        return Err(TxnCodecError::Truncated { needed: len });
    }
    Ok(buf.copy_to_bytes(len))
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

#[cfg(test)]
mod tests {
    use super::*;
    use beehive_core::{BeeId, NodeId, TxnSeq};

    fn cell(key: &str) -> Cell {
        Cell::new("d", key.as_bytes().to_vec())
    }

    fn sample_txn() -> Transaction {
        let mut txn = Transaction::new(
            MsgId::compose(NodeId::new(1), 7),
            TraceId::new(99),
        );
        txn.reads.push((cell("a"), 3));
        txn.reads.push((cell("b"), 0));
        txn.writes.push((cell("a"), WriteOp::Put(Bytes::from("v"))));
        txn.writes.push((cell("b"), WriteOp::Del));
        txn.emits.push(EmitRecord {
            type_tag: "next".into(),
            payload: Bytes::from("p"),
        });
        txn
    }

    #[test]
    fn test_txn_roundtrip() {
        let entry = ColonyEntry::Txn(sample_txn());
        let decoded = ColonyEntry::decode(entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_control_roundtrip() {
        let entries = vec![
            ColonyEntry::Control(ControlEntry::Quiesce {
                cells: vec![cell("a"), cell("b")],
            }),
            ColonyEntry::Control(ControlEntry::Unquiesce {
                cells: vec![cell("a")],
            }),
            ColonyEntry::Control(ControlEntry::InstallCells {
                cells: vec![
                    InstalledCell {
                        cell: cell("x"),
                        value: Some(Bytes::from("v")),
                        version: 4,
                    },
                    InstalledCell {
                        cell: cell("y"),
                        value: None,
                        version: 2,
                    },
                ],
            }),
            ColonyEntry::Control(ControlEntry::RemoveCells {
                cells: vec![cell("x")],
            }),
            ColonyEntry::Control(ControlEntry::SnapshotMark),
        ];

        for entry in entries {
            let decoded = ColonyEntry::decode(entry.encode()).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_staged_bytes_counts_writes_and_emits() {
        let txn = sample_txn();
        // write "a" put: 1+1+1 = 3; write "b" del: 1+1 = 2;
        // emit: 4 + 1 = 5.
        assert_eq!(txn.staged_bytes(), 10);
    }

    #[test]
    fn test_emitted_msg_id_deterministic() {
        let a = MsgId::emitted(BeeId::new(5), TxnSeq::new(10));
        let b = MsgId::emitted(BeeId::new(5), TxnSeq::new(10));
        let c = MsgId::emitted(BeeId::new(5), TxnSeq::new(11));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, MsgId::compose(NodeId::new(5), 10));
    }

    #[test]
    fn test_truncated_rejected() {
        let entry = ColonyEntry::Txn(sample_txn());
        let encoded = entry.encode();
        let truncated = encoded.slice(..encoded.len() / 2);
        assert!(ColonyEntry::decode(truncated).is_err());
    }
}
