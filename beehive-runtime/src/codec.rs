//! Wire codec for node-to-node traffic.
//!
//! Every frame on a peer connection is `len:u32 | kind:u8 | body`, with
//! `len` counting the kind byte and body. Bodies are hand-framed
//! little-endian, like every other Beehive format.
//!
//! Frame kinds: consensus message batches, forwarded application messages,
//! node heartbeats, and leadership-transfer requests.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{
    BeeId, Cell, Envelope, Epoch, GroupId, LogIndex, MsgId, NodeId, TermId, TraceId,
};
use beehive_raft::{
    AppendEntriesRequest, AppendEntriesResponse, GroupMessage, LogEntry, Message,
    RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest,
};
use thiserror::Error;

/// Maximum frame body size (16 MB).
pub const FRAME_BODY_BYTES_MAX: u32 = 16 * 1024 * 1024;

/// Frame kinds.
const KIND_GROUP_BATCH: u8 = 1;
const KIND_FORWARD: u8 = 2;
const KIND_HEARTBEAT: u8 = 3;
const KIND_TRANSFER_LEAD: u8 = 4;
const KIND_PROPOSE_REGISTRY: u8 = 5;
const KIND_PROPOSE_COLONY: u8 = 6;

/// Raft message tags.
const MSG_REQUEST_VOTE: u8 = 1;
const MSG_REQUEST_VOTE_RESP: u8 = 2;
const MSG_APPEND_ENTRIES: u8 = 3;
const MSG_APPEND_ENTRIES_RESP: u8 = 4;
const MSG_TIMEOUT_NOW: u8 = 5;

/// Codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// More bytes are needed to decode a full frame.
    #[error("insufficient data: need {needed} bytes")]
    InsufficientData {
        /// Bytes needed beyond what is buffered.
        needed: usize,
    },
    /// A frame declared an oversize body.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared size.
        size: u32,
        /// Maximum allowed.
        max: u32,
    },
    /// Unknown frame kind or message tag.
    #[error("unknown tag: {tag}")]
    UnknownTag {
        /// The tag found.
        tag: u8,
    },
    /// A string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// A message arriving from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// A batch of consensus messages for local groups.
    Groups(Vec<GroupMessage>),
    /// An application message forwarded to the owner's leader node.
    Forward(ForwardFrame),
    /// A liveness heartbeat.
    Heartbeat {
        /// The sending node.
        node: NodeId,
        /// The sender's cluster identity; mismatches refuse the peer.
        cluster_id: u128,
        /// Hash of the sender's application set, checked at join.
        config_hash: u64,
    },
    /// Ask the receiving node (leader of `group`) to transfer leadership.
    TransferLead {
        /// The consensus group.
        group: GroupId,
        /// The node to transfer to.
        target: NodeId,
    },
    /// A registry command relayed to the cluster leader for proposal.
    ProposeRegistry {
        /// The encoded command.
        cmd: Bytes,
    },
    /// A colony entry relayed to the colony's leader for proposal.
    ProposeColony {
        /// The colony's bee.
        bee: BeeId,
        /// The encoded entry.
        entry: Bytes,
    },
}

/// A forwarded application message with its routing evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFrame {
    /// The message.
    pub env: Envelope,
    /// The mapped cells, so the receiver skips re-running `map`.
    pub cells: Vec<Cell>,
    /// The registry epoch the forwarder routed at (first cell's epoch).
    pub epoch: Epoch,
    /// Forwarding hops so far; bounded to stop routing loops.
    pub hops: u8,
}

/// Encodes a wire message into one length-prefixed frame.
#[must_use]
pub fn encode_frame(msg: &WireMessage) -> Bytes {
    let mut body = BytesMut::new();
    match msg {
        WireMessage::Groups(messages) => {
            body.put_u8(KIND_GROUP_BATCH);
            body.put_u32_le(u32::try_from(messages.len()).unwrap_or(u32::MAX));
            for gm in messages {
                body.put_u64_le(gm.group_id.get());
                encode_message(&mut body, &gm.message);
            }
        }
        WireMessage::Forward(frame) => {
            body.put_u8(KIND_FORWARD);
            encode_envelope(&mut body, &frame.env);
            body.put_u32_le(u32::try_from(frame.cells.len()).unwrap_or(u32::MAX));
            for cell in &frame.cells {
                put_cell(&mut body, cell);
            }
            body.put_u64_le(frame.epoch.get());
            body.put_u8(frame.hops);
        }
        WireMessage::Heartbeat {
            node,
            cluster_id,
            config_hash,
        } => {
            body.put_u8(KIND_HEARTBEAT);
            body.put_u64_le(node.get());
            body.put_u128_le(*cluster_id);
            body.put_u64_le(*config_hash);
        }
        WireMessage::TransferLead { group, target } => {
            body.put_u8(KIND_TRANSFER_LEAD);
            body.put_u64_le(group.get());
            body.put_u64_le(target.get());
        }
        WireMessage::ProposeRegistry { cmd } => {
            body.put_u8(KIND_PROPOSE_REGISTRY);
            body.put_u32_le(u32::try_from(cmd.len()).unwrap_or(u32::MAX));
            body.put_slice(cmd);
        }
        WireMessage::ProposeColony { bee, entry } => {
            body.put_u8(KIND_PROPOSE_COLONY);
            body.put_u64_le(bee.get());
            body.put_u32_le(u32::try_from(entry.len()).unwrap_or(u32::MAX));
            body.put_slice(entry);
        }
    }

    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32_le(u32::try_from(body.len()).unwrap_or(u32::MAX));
    frame.put_slice(&body);
    frame.freeze()
}

/// Tries to decode one frame from the buffer.
///
/// Returns the message and the total bytes consumed, or
/// `InsufficientData` when the buffer holds only part of a frame.
///
/// # Errors
/// Returns an error on a malformed or oversize frame.
pub fn decode_frame(buf: &[u8]) -> Result<(WireMessage, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::InsufficientData { needed: 4 - buf.len() });
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > FRAME_BODY_BYTES_MAX {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: FRAME_BODY_BYTES_MAX,
        });
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Err(CodecError::InsufficientData {
            needed: total - buf.len(),
        });
    }

    let mut body = Bytes::copy_from_slice(&buf[4..total]);
    let kind = get_u8(&mut body)?;
    let msg = match kind {
        KIND_GROUP_BATCH => {
            let count = get_u32(&mut body)? as usize;
            let mut messages = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let group_id = GroupId::new(get_u64(&mut body)?);
                let message = decode_message(&mut body)?;
                messages.push(GroupMessage::new(group_id, message));
            }
            WireMessage::Groups(messages)
        }
        KIND_FORWARD => {
            let env = decode_envelope(&mut body)?;
            let count = get_u32(&mut body)? as usize;
            let mut cells = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                cells.push(get_cell(&mut body)?);
            }
            let epoch = Epoch::new(get_u64(&mut body)?);
            let hops = get_u8(&mut body)?;
            WireMessage::Forward(ForwardFrame {
                env,
                cells,
                epoch,
                hops,
            })
        }
        KIND_HEARTBEAT => WireMessage::Heartbeat {
            node: NodeId::new(get_u64(&mut body)?),
            cluster_id: get_u128(&mut body)?,
            config_hash: get_u64(&mut body)?,
        },
        KIND_TRANSFER_LEAD => WireMessage::TransferLead {
            group: GroupId::new(get_u64(&mut body)?),
            target: NodeId::new(get_u64(&mut body)?),
        },
        KIND_PROPOSE_REGISTRY => {
            let len = get_u32(&mut body)? as usize;
            WireMessage::ProposeRegistry {
                cmd: get_bytes(&mut body, len)?,
            }
        }
        KIND_PROPOSE_COLONY => {
            let bee = BeeId::new(get_u64(&mut body)?);
            let len = get_u32(&mut body)? as usize;
            WireMessage::ProposeColony {
                bee,
                entry: get_bytes(&mut body, len)?,
            }
        }
        tag => return Err(CodecError::UnknownTag { tag }),
    };
    Ok((msg, total))
}

fn encode_message(buf: &mut BytesMut, msg: &Message) {
    match msg {
        Message::RequestVote(r) => {
            buf.put_u8(MSG_REQUEST_VOTE);
            buf.put_u64_le(r.term.get());
            buf.put_u64_le(r.candidate_id.get());
            buf.put_u64_le(r.to.get());
            buf.put_u64_le(r.last_log_index.get());
            buf.put_u64_le(r.last_log_term.get());
        }
        Message::RequestVoteResponse(r) => {
            buf.put_u8(MSG_REQUEST_VOTE_RESP);
            buf.put_u64_le(r.term.get());
            buf.put_u64_le(r.from.get());
            buf.put_u64_le(r.to.get());
            buf.put_u8(u8::from(r.vote_granted));
        }
        Message::AppendEntries(r) => {
            buf.put_u8(MSG_APPEND_ENTRIES);
            buf.put_u64_le(r.term.get());
            buf.put_u64_le(r.leader_id.get());
            buf.put_u64_le(r.to.get());
            buf.put_u64_le(r.prev_log_index.get());
            buf.put_u64_le(r.prev_log_term.get());
            buf.put_u64_le(r.leader_commit.get());
            buf.put_u32_le(u32::try_from(r.entries.len()).unwrap_or(u32::MAX));
            for entry in &r.entries {
                buf.put_u64_le(entry.term.get());
                buf.put_u64_le(entry.index.get());
                buf.put_u32_le(u32::try_from(entry.data.len()).unwrap_or(u32::MAX));
                buf.put_slice(&entry.data);
            }
        }
        Message::AppendEntriesResponse(r) => {
            buf.put_u8(MSG_APPEND_ENTRIES_RESP);
            buf.put_u64_le(r.term.get());
            buf.put_u64_le(r.from.get());
            buf.put_u64_le(r.to.get());
            buf.put_u8(u8::from(r.success));
            buf.put_u64_le(r.match_index.get());
        }
        Message::TimeoutNow(r) => {
            buf.put_u8(MSG_TIMEOUT_NOW);
            buf.put_u64_le(r.term.get());
            buf.put_u64_le(r.from.get());
            buf.put_u64_le(r.to.get());
        }
    }
}

fn decode_message(buf: &mut Bytes) -> Result<Message, CodecError> {
    let tag = get_u8(buf)?;
    let msg = match tag {
        MSG_REQUEST_VOTE => Message::RequestVote(RequestVoteRequest::new(
            TermId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            LogIndex::new(get_u64(buf)?),
            TermId::new(get_u64(buf)?),
        )),
        MSG_REQUEST_VOTE_RESP => Message::RequestVoteResponse(RequestVoteResponse::new(
            TermId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            get_u8(buf)? != 0,
        )),
        MSG_APPEND_ENTRIES => {
            let term = TermId::new(get_u64(buf)?);
            let leader_id = NodeId::new(get_u64(buf)?);
            let to = NodeId::new(get_u64(buf)?);
            let prev_log_index = LogIndex::new(get_u64(buf)?);
            let prev_log_term = TermId::new(get_u64(buf)?);
            let leader_commit = LogIndex::new(get_u64(buf)?);
            let count = get_u32(buf)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let entry_term = TermId::new(get_u64(buf)?);
                let entry_index = LogIndex::new(get_u64(buf)?);
                let len = get_u32(buf)? as usize;
                let data = get_bytes(buf, len)?;
                entries.push(LogEntry::new(entry_term, entry_index, data));
            }
            Message::AppendEntries(AppendEntriesRequest::new(
                term,
                leader_id,
                to,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ))
        }
        MSG_APPEND_ENTRIES_RESP => Message::AppendEntriesResponse(AppendEntriesResponse::new(
            TermId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            get_u8(buf)? != 0,
            LogIndex::new(get_u64(buf)?),
        )),
        MSG_TIMEOUT_NOW => Message::TimeoutNow(TimeoutNowRequest::new(
            TermId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
            NodeId::new(get_u64(buf)?),
        )),
        tag => return Err(CodecError::UnknownTag { tag }),
    };
    Ok(msg)
}

fn encode_envelope(buf: &mut BytesMut, env: &Envelope) {
    put_string(buf, &env.type_tag);
    buf.put_u32_le(u32::try_from(env.payload.len()).unwrap_or(u32::MAX));
    buf.put_slice(&env.payload);
    match env.from_bee {
        Some(bee) => {
            buf.put_u8(1);
            buf.put_u64_le(bee.get());
        }
        None => buf.put_u8(0),
    }
    buf.put_u64_le(env.id.get());
    buf.put_u64_le(env.trace.get());
    match env.deadline_us {
        Some(deadline) => {
            buf.put_u8(1);
            buf.put_u64_le(deadline);
        }
        None => buf.put_u8(0),
    }
}

fn decode_envelope(buf: &mut Bytes) -> Result<Envelope, CodecError> {
    let type_tag = get_string(buf)?;
    let len = get_u32(buf)? as usize;
    let payload = get_bytes(buf, len)?;
    let from_bee = match get_u8(buf)? {
        1 => Some(BeeId::new(get_u64(buf)?)),
        _ => None,
    };
    let id = MsgId::new(get_u64(buf)?);
    let trace = TraceId::new(get_u64(buf)?);
    let deadline_us = match get_u8(buf)? {
        1 => Some(get_u64(buf)?),
        _ => None,
    };
    Ok(Envelope {
        type_tag,
        payload,
        from_bee,
        id,
        trace,
        deadline_us,
    })
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(u16::try_from(s.len()).unwrap_or(u16::MAX));
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::InsufficientData { needed: 2 });
    }
    let len = buf.get_u16_le() as usize;
    let bytes = get_bytes(buf, len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn put_cell(buf: &mut BytesMut, cell: &Cell) {
    put_string(buf, &cell.dict);
    buf.put_u32_le(u32::try_from(cell.key.len()).unwrap_or(u32::MAX));
    buf.put_slice(&cell.key);
}

fn get_cell(buf: &mut Bytes) -> Result<Cell, CodecError> {
    let dict = get_string(buf)?;
    let len = get_u32(buf)? as usize;
    let key = get_bytes(buf, len)?;
    Ok(Cell { dict, key })
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::InsufficientData {
            needed: len - buf.remaining(),
        });
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if !buf.has_remaining() {
        return Err(CodecError::InsufficientData { needed: 1 });
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::InsufficientData { needed: 4 });
    }
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::InsufficientData { needed: 8 });
    }
    Ok(buf.get_u64_le())
}

fn get_u128(buf: &mut Bytes) -> Result<u128, CodecError> {
    if buf.remaining() < 16 {
        return Err(CodecError::InsufficientData { needed: 16 });
    }
    Ok(buf.get_u128_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &WireMessage) -> WireMessage {
        let frame = encode_frame(msg);
        let (decoded, consumed) = decode_frame(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        decoded
    }

    #[test]
    fn test_group_batch_roundtrip() {
        let msg = WireMessage::Groups(vec![
            GroupMessage::new(
                GroupId::new(1),
                Message::RequestVote(RequestVoteRequest::new(
                    TermId::new(2),
                    NodeId::new(1),
                    NodeId::new(3),
                    LogIndex::new(9),
                    TermId::new(1),
                )),
            ),
            GroupMessage::new(
                GroupId::new(7),
                Message::AppendEntries(AppendEntriesRequest::new(
                    TermId::new(4),
                    NodeId::new(2),
                    NodeId::new(3),
                    LogIndex::new(5),
                    TermId::new(3),
                    vec![LogEntry::new(
                        TermId::new(4),
                        LogIndex::new(6),
                        Bytes::from("cmd"),
                    )],
                    LogIndex::new(5),
                )),
            ),
        ]);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_forward_roundtrip() {
        let env = Envelope::new("hello", &b"A"[..], MsgId::new(99)).with_deadline_us(1234);
        let msg = WireMessage::Forward(ForwardFrame {
            env,
            cells: vec![Cell::new("hello", &b"A"[..])],
            epoch: Epoch::new(3),
            hops: 1,
        });
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let msg = WireMessage::Heartbeat {
            node: NodeId::new(5),
            cluster_id: 0x0123_4567_89AB_CDEF_0011_2233_4455_6677,
            config_hash: 42,
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_transfer_lead_roundtrip() {
        let msg = WireMessage::TransferLead {
            group: GroupId::colony(BeeId::new(4)),
            target: NodeId::new(2),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_partial_frame_wants_more() {
        let frame = encode_frame(&WireMessage::Heartbeat {
            node: NodeId::new(1),
            cluster_id: 1,
            config_hash: 0,
        });
        let result = decode_frame(&frame[..frame.len() - 3]);
        assert!(matches!(result, Err(CodecError::InsufficientData { .. })));
    }

    #[test]
    fn test_two_frames_in_buffer() {
        let a = encode_frame(&WireMessage::Heartbeat {
            node: NodeId::new(1),
            cluster_id: 1,
            config_hash: 0,
        });
        let b = encode_frame(&WireMessage::TransferLead {
            group: GroupId::new(9),
            target: NodeId::new(2),
        });
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);

        let (first, consumed) = decode_frame(&buf).unwrap();
        assert!(matches!(first, WireMessage::Heartbeat { .. }));
        let (second, _) = decode_frame(&buf[consumed..]).unwrap();
        assert!(matches!(second, WireMessage::TransferLead { .. }));
    }
}
