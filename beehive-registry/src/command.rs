//! Registry commands and their wire codec.
//!
//! Commands are proposed to the cluster consensus group as opaque bytes and
//! decoded again at apply time on every node, so the encoding must be
//! deterministic and self-delimiting. All integers are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use beehive_core::{AppName, BeeId, Cell, NodeId};

/// Command tags on the wire.
const TAG_CLAIM: u8 = 1;
const TAG_CREATE_BEE: u8 = 2;
const TAG_DRAIN: u8 = 3;
const TAG_TRANSFER: u8 = 4;
const TAG_RELEASE: u8 = 5;
const TAG_NODE_JOINED: u8 = 6;
const TAG_NODE_LEFT: u8 = 7;
const TAG_SET_COLONY: u8 = 8;
const TAG_ANNOUNCE_LEADER: u8 = 9;
const TAG_REGISTER_APP: u8 = 10;

/// A mutation of the registry, replicated through the cluster group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    /// Bind an unowned cell set to a fresh bee.
    ///
    /// Rejected at apply time if any cell is already owned; the first claim
    /// to commit wins.
    Claim {
        /// The cells to bind.
        cells: Vec<Cell>,
        /// The application the new bee belongs to.
        app: AppName,
        /// Placement hint: the node that proposed the claim.
        candidate_node: NodeId,
    },

    /// Create an empty bee as a transfer target for placement.
    CreateBee {
        /// The application the bee belongs to.
        app: AppName,
        /// The node that will lead the new bee's colony.
        node: NodeId,
    },

    /// Phase one of a move: mark cells of a bee as draining. The owning
    /// bee stops accepting messages for them once it applies the matching
    /// control entry.
    Drain {
        /// The cells to drain.
        cells: Vec<Cell>,
        /// Their current owner.
        from_bee: BeeId,
    },

    /// Phase two of a move: rebind drained cells to another existing bee,
    /// bumping each cell's epoch.
    Transfer {
        /// The cells to move.
        cells: Vec<Cell>,
        /// The current owner.
        from_bee: BeeId,
        /// The new owner.
        to_bee: BeeId,
    },

    /// Unbind every cell of a bee and retire its id.
    Release {
        /// The bee to release.
        bee: BeeId,
    },

    /// A node joined the cluster.
    NodeJoined {
        /// The node.
        node: NodeId,
        /// Hash of the node's application set; joins with a different hash
        /// than the cluster's are refused.
        config_hash: u64,
    },

    /// A node left or was declared dead.
    NodeLeft {
        /// The node.
        node: NodeId,
    },

    /// Replace a bee's colony membership.
    SetColony {
        /// The bee.
        bee: BeeId,
        /// The replica nodes, leader first.
        members: Vec<NodeId>,
    },

    /// A new colony leader announces itself, bumping the epochs of the
    /// bee's cells so forwarders refresh.
    AnnounceLeader {
        /// The bee.
        bee: BeeId,
        /// The new leader node.
        leader: NodeId,
    },

    /// Record an application in the cluster's application table.
    RegisterApp {
        /// The application name.
        app: AppName,
        /// Its configuration word (options folded to u64).
        config_word: u64,
    },
}

impl RegistryCommand {
    /// Encodes the command for proposal.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::Claim {
                cells,
                app,
                candidate_node,
            } => {
                buf.put_u8(TAG_CLAIM);
                put_cells(&mut buf, cells);
                put_string(&mut buf, app.as_str());
                buf.put_u64_le(candidate_node.get());
            }
            Self::CreateBee { app, node } => {
                buf.put_u8(TAG_CREATE_BEE);
                put_string(&mut buf, app.as_str());
                buf.put_u64_le(node.get());
            }
            Self::Drain { cells, from_bee } => {
                buf.put_u8(TAG_DRAIN);
                put_cells(&mut buf, cells);
                buf.put_u64_le(from_bee.get());
            }
            Self::Transfer {
                cells,
                from_bee,
                to_bee,
            } => {
                buf.put_u8(TAG_TRANSFER);
                put_cells(&mut buf, cells);
                buf.put_u64_le(from_bee.get());
                buf.put_u64_le(to_bee.get());
            }
            Self::Release { bee } => {
                buf.put_u8(TAG_RELEASE);
                buf.put_u64_le(bee.get());
            }
            Self::NodeJoined { node, config_hash } => {
                buf.put_u8(TAG_NODE_JOINED);
                buf.put_u64_le(node.get());
                buf.put_u64_le(*config_hash);
            }
            Self::NodeLeft { node } => {
                buf.put_u8(TAG_NODE_LEFT);
                buf.put_u64_le(node.get());
            }
            Self::SetColony { bee, members } => {
                buf.put_u8(TAG_SET_COLONY);
                buf.put_u64_le(bee.get());
                buf.put_u32_le(u32::try_from(members.len()).unwrap_or(u32::MAX));
                for member in members {
                    buf.put_u64_le(member.get());
                }
            }
            Self::AnnounceLeader { bee, leader } => {
                buf.put_u8(TAG_ANNOUNCE_LEADER);
                buf.put_u64_le(bee.get());
                buf.put_u64_le(leader.get());
            }
            Self::RegisterApp { app, config_word } => {
                buf.put_u8(TAG_REGISTER_APP);
                put_string(&mut buf, app.as_str());
                buf.put_u64_le(*config_word);
            }
        }
        buf.freeze()
    }

    /// Decodes a command from committed entry bytes.
    ///
    /// # Errors
    /// Returns an error on truncation or an unknown tag.
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated { needed: 1 });
        }
        let tag = buf.get_u8();
        match tag {
            TAG_CLAIM => {
                let cells = get_cells(&mut buf)?;
                let app = AppName::new(get_string(&mut buf)?);
                let candidate_node = NodeId::new(get_u64(&mut buf)?);
                Ok(Self::Claim {
                    cells,
                    app,
                    candidate_node,
                })
            }
            TAG_CREATE_BEE => {
                let app = AppName::new(get_string(&mut buf)?);
                let node = NodeId::new(get_u64(&mut buf)?);
                Ok(Self::CreateBee { app, node })
            }
            TAG_DRAIN => {
                let cells = get_cells(&mut buf)?;
                let from_bee = BeeId::new(get_u64(&mut buf)?);
                Ok(Self::Drain { cells, from_bee })
            }
            TAG_TRANSFER => {
                let cells = get_cells(&mut buf)?;
                let from_bee = BeeId::new(get_u64(&mut buf)?);
                let to_bee = BeeId::new(get_u64(&mut buf)?);
                Ok(Self::Transfer {
                    cells,
                    from_bee,
                    to_bee,
                })
            }
            TAG_RELEASE => Ok(Self::Release {
                bee: BeeId::new(get_u64(&mut buf)?),
            }),
            TAG_NODE_JOINED => Ok(Self::NodeJoined {
                node: NodeId::new(get_u64(&mut buf)?),
                config_hash: get_u64(&mut buf)?,
            }),
            TAG_NODE_LEFT => Ok(Self::NodeLeft {
                node: NodeId::new(get_u64(&mut buf)?),
            }),
            TAG_SET_COLONY => {
                let bee = BeeId::new(get_u64(&mut buf)?);
                let count = get_u32(&mut buf)?;
                let mut members = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    members.push(NodeId::new(get_u64(&mut buf)?));
                }
                Ok(Self::SetColony { bee, members })
            }
            TAG_ANNOUNCE_LEADER => Ok(Self::AnnounceLeader {
                bee: BeeId::new(get_u64(&mut buf)?),
                leader: NodeId::new(get_u64(&mut buf)?),
            }),
            TAG_REGISTER_APP => Ok(Self::RegisterApp {
                app: AppName::new(get_string(&mut buf)?),
                config_word: get_u64(&mut buf)?,
            }),
            _ => Err(CodecError::UnknownTag { tag }),
        }
    }
}

/// Codec errors for registry commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended early.
    Truncated {
        /// Bytes that were needed.
        needed: usize,
    },
    /// Unknown command tag.
    UnknownTag {
        /// The tag found.
        tag: u8,
    },
    /// A string field was not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed } => write!(f, "truncated command: needed {needed} bytes"),
            Self::UnknownTag { tag } => write!(f, "unknown command tag: {tag}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for CodecError {}

pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16_le(u16::try_from(s.len()).unwrap_or(u16::MAX));
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated { needed: len });
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

pub(crate) fn put_cell(buf: &mut BytesMut, cell: &Cell) {
    put_string(buf, &cell.dict);
    buf.put_u32_le(u32::try_from(cell.key.len()).unwrap_or(u32::MAX));
    buf.put_slice(&cell.key);
}

pub(crate) fn get_cell(buf: &mut Bytes) -> Result<Cell, CodecError> {
    let dict = get_string(buf)?;
    let key_len = get_u32(buf)? as usize;
    if buf.remaining() < key_len {
        return Err(CodecError::Truncated { needed: key_len });
    }
    let key = buf.copy_to_bytes(key_len);
    Ok(Cell { dict, key })
}

pub(crate) fn put_cells(buf: &mut BytesMut, cells: &[Cell]) {
    buf.put_u32_le(u32::try_from(cells.len()).unwrap_or(u32::MAX));
    for cell in cells {
        put_cell(buf, cell);
    }
}

pub(crate) fn get_cells(buf: &mut Bytes) -> Result<Vec<Cell>, CodecError> {
    let count = get_u32(buf)? as usize;
    let mut cells = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        cells.push(get_cell(buf)?);
    }
    Ok(cells)
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated { needed: 2 });
    }
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated { needed: 4 });
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated { needed: 8 });
    }
    Ok(buf.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(dict: &str, key: &str) -> Cell {
        Cell::new(dict, key.as_bytes().to_vec())
    }

    #[test]
    fn test_claim_roundtrip() {
        let cmd = RegistryCommand::Claim {
            cells: vec![cell("hello", "A"), cell("hello", "B")],
            app: AppName::new("counter"),
            candidate_node: NodeId::new(3),
        };
        let decoded = RegistryCommand::decode(cmd.encode()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_all_commands_roundtrip() {
        let commands = vec![
            RegistryCommand::CreateBee {
                app: AppName::new("a"),
                node: NodeId::new(1),
            },
            RegistryCommand::Drain {
                cells: vec![cell("d", "k")],
                from_bee: BeeId::new(10),
            },
            RegistryCommand::Transfer {
                cells: vec![cell("d", "k")],
                from_bee: BeeId::new(10),
                to_bee: BeeId::new(11),
            },
            RegistryCommand::Release { bee: BeeId::new(4) },
            RegistryCommand::NodeJoined {
                node: NodeId::new(2),
                config_hash: 0xDEAD_BEEF,
            },
            RegistryCommand::NodeLeft { node: NodeId::new(2) },
            RegistryCommand::SetColony {
                bee: BeeId::new(5),
                members: vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)],
            },
            RegistryCommand::AnnounceLeader {
                bee: BeeId::new(5),
                leader: NodeId::new(2),
            },
            RegistryCommand::RegisterApp {
                app: AppName::new("counter"),
                config_word: 42,
            },
        ];

        for cmd in commands {
            let decoded = RegistryCommand::decode(cmd.encode()).unwrap();
            assert_eq!(decoded, cmd);
        }
    }

    #[test]
    fn test_truncated_rejected() {
        let cmd = RegistryCommand::Release { bee: BeeId::new(4) };
        let encoded = cmd.encode();
        let truncated = encoded.slice(..encoded.len() - 2);

        assert!(matches!(
            RegistryCommand::decode(truncated),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let buf = Bytes::from_static(&[0xFF, 0, 0]);
        assert!(matches!(
            RegistryCommand::decode(buf),
            Err(CodecError::UnknownTag { tag: 0xFF })
        ));
    }

    #[test]
    fn test_binary_key_roundtrip() {
        let cmd = RegistryCommand::Claim {
            cells: vec![Cell::new("d", vec![0u8, 255, 7, 0])],
            app: AppName::new("bin"),
            candidate_node: NodeId::new(1),
        };
        let decoded = RegistryCommand::decode(cmd.encode()).unwrap();
        assert_eq!(decoded, cmd);
    }
}
