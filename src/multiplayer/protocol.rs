use std::io::{Cursor, Error, ErrorKind, Read, Result};

use crate::constants::MAX_FRAME_SIZE;
use crate::core::{ClientId, TileId};

/// Whether a chat line came from a player or from the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Player = 0,
    System = 1,
}

impl ChatKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChatKind::Player),
            1 => Ok(ChatKind::System),
            _ => Err(Error::new(ErrorKind::InvalidData, "Unknown chat kind")),
        }
    }
}

/// Every message exchanged between server and clients. Reliable server
/// messages carry the recipient session's sequence number in `seq`.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Handshake {
        username: String,
    },
    HandshakeAck {
        seq: u64,
        client_id: ClientId,
        udp_token: u64,
        chunk_size: u16,
        seed: u64,
    },
    PositionUpdate {
        client_id: ClientId,
        x: f32,
        y: f32,
    },
    UdpPosition {
        client_id: ClientId,
        token: u64,
        x: f32,
        y: f32,
    },
    ChunkData {
        seq: u64,
        chunk_x: i32,
        chunk_y: i32,
        tiles: Vec<TileId>,
    },
    ChunkUnload {
        seq: u64,
        chunk_x: i32,
        chunk_y: i32,
    },
    ChatBroadcast {
        seq: u64,
        sender: String,
        content: String,
        timestamp: i64,
        kind: ChatKind,
    },
    PeerLeft {
        seq: u64,
        client_id: ClientId,
    },
    Disconnect {
        reason: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl Packet {
    fn packet_id(&self) -> u8 {
        match self {
            Packet::Handshake { .. } => 0x01,
            Packet::HandshakeAck { .. } => 0x02,
            Packet::PositionUpdate { .. } => 0x10,
            Packet::UdpPosition { .. } => 0x11,
            Packet::ChunkData { .. } => 0x20,
            Packet::ChunkUnload { .. } => 0x21,
            Packet::ChatBroadcast { .. } => 0x30,
            Packet::PeerLeft { .. } => 0x31,
            Packet::Disconnect { .. } => 0x40,
            Packet::Ping { .. } => 0xFE,
            Packet::Pong { .. } => 0xFF,
        }
    }

    /// Name used in logs and protocol errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "Handshake",
            Packet::HandshakeAck { .. } => "HandshakeAck",
            Packet::PositionUpdate { .. } => "PositionUpdate",
            Packet::UdpPosition { .. } => "UdpPosition",
            Packet::ChunkData { .. } => "ChunkData",
            Packet::ChunkUnload { .. } => "ChunkUnload",
            Packet::ChatBroadcast { .. } => "ChatBroadcast",
            Packet::PeerLeft { .. } => "PeerLeft",
            Packet::Disconnect { .. } => "Disconnect",
            Packet::Ping { .. } => "Ping",
            Packet::Pong { .. } => "Pong",
        }
    }

    /// Position traffic may be dropped; everything else is delivered in order.
    pub fn is_reliable(&self) -> bool {
        !matches!(
            self,
            Packet::PositionUpdate { .. } | Packet::UdpPosition { .. }
        )
    }

    /// Sequence number of a reliable server message, if the kind has one.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Packet::HandshakeAck { seq, .. }
            | Packet::ChunkData { seq, .. }
            | Packet::ChunkUnload { seq, .. }
            | Packet::ChatBroadcast { seq, .. }
            | Packet::PeerLeft { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Stamp a sequence number; returns false for kinds without one.
    pub fn set_seq(&mut self, value: u64) -> bool {
        match self {
            Packet::HandshakeAck { seq, .. }
            | Packet::ChunkData { seq, .. }
            | Packet::ChunkUnload { seq, .. }
            | Packet::ChatBroadcast { seq, .. }
            | Packet::PeerLeft { seq, .. } => {
                *seq = value;
                true
            }
            _ => false,
        }
    }

    /// Encode as one frame: u16 length, u8 kind, little-endian body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        buf.push(self.packet_id());

        match self {
            Packet::Handshake { username } => {
                write_string(&mut buf, username)?;
            }
            Packet::HandshakeAck {
                seq,
                client_id,
                udp_token,
                chunk_size,
                seed,
            } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&client_id.to_le_bytes());
                buf.extend_from_slice(&udp_token.to_le_bytes());
                buf.extend_from_slice(&chunk_size.to_le_bytes());
                buf.extend_from_slice(&seed.to_le_bytes());
            }
            Packet::PositionUpdate { client_id, x, y } => {
                buf.extend_from_slice(&client_id.to_le_bytes());
                buf.extend_from_slice(&x.to_le_bytes());
                buf.extend_from_slice(&y.to_le_bytes());
            }
            Packet::UdpPosition {
                client_id,
                token,
                x,
                y,
            } => {
                buf.extend_from_slice(&client_id.to_le_bytes());
                buf.extend_from_slice(&token.to_le_bytes());
                buf.extend_from_slice(&x.to_le_bytes());
                buf.extend_from_slice(&y.to_le_bytes());
            }
            Packet::ChunkData {
                seq,
                chunk_x,
                chunk_y,
                tiles,
            } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&chunk_x.to_le_bytes());
                buf.extend_from_slice(&chunk_y.to_le_bytes());
                buf.extend_from_slice(&(tiles.len() as u32).to_le_bytes());
                for tile in tiles {
                    buf.extend_from_slice(&tile.to_le_bytes());
                }
            }
            Packet::ChunkUnload {
                seq,
                chunk_x,
                chunk_y,
            } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&chunk_x.to_le_bytes());
                buf.extend_from_slice(&chunk_y.to_le_bytes());
            }
            Packet::ChatBroadcast {
                seq,
                sender,
                content,
                timestamp,
                kind,
            } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                write_string(&mut buf, sender)?;
                write_string(&mut buf, content)?;
                buf.extend_from_slice(&timestamp.to_le_bytes());
                buf.push(*kind as u8);
            }
            Packet::PeerLeft { seq, client_id } => {
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(&client_id.to_le_bytes());
            }
            Packet::Disconnect { reason } => {
                write_string(&mut buf, reason)?;
            }
            Packet::Ping { timestamp } | Packet::Pong { timestamp } => {
                buf.extend_from_slice(&timestamp.to_le_bytes());
            }
        }

        if buf.len() > MAX_FRAME_SIZE {
            return Err(Error::new(ErrorKind::InvalidInput, "Packet too large"));
        }
        let len = buf.len() as u16;
        let mut result = Vec::with_capacity(2 + buf.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend(buf);
        Ok(result)
    }

    /// Decode exactly one frame. Truncated frames, unknown kinds and
    /// trailing bytes are all rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::new(ErrorKind::InvalidData, "Packet too short"));
        }

        let mut cursor = Cursor::new(data);

        let len = read_u16(&mut cursor)? as usize;
        if len + 2 != data.len() {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "Length prefix does not match frame",
            ));
        }
        let id = read_u8(&mut cursor)?;

        let packet = match id {
            0x01 => Packet::Handshake {
                username: read_string(&mut cursor)?,
            },
            0x02 => Packet::HandshakeAck {
                seq: read_u64(&mut cursor)?,
                client_id: read_u32(&mut cursor)?,
                udp_token: read_u64(&mut cursor)?,
                chunk_size: read_u16(&mut cursor)?,
                seed: read_u64(&mut cursor)?,
            },
            0x10 => Packet::PositionUpdate {
                client_id: read_u32(&mut cursor)?,
                x: read_f32(&mut cursor)?,
                y: read_f32(&mut cursor)?,
            },
            0x11 => Packet::UdpPosition {
                client_id: read_u32(&mut cursor)?,
                token: read_u64(&mut cursor)?,
                x: read_f32(&mut cursor)?,
                y: read_f32(&mut cursor)?,
            },
            0x20 => {
                let seq = read_u64(&mut cursor)?;
                let chunk_x = read_i32(&mut cursor)?;
                let chunk_y = read_i32(&mut cursor)?;
                let count = read_u32(&mut cursor)? as usize;
                // Each tile needs two bytes; bound the allocation by what is left
                let remaining = data.len() - cursor.position() as usize;
                if count > remaining / 2 {
                    return Err(Error::new(ErrorKind::InvalidData, "Tile count exceeds frame"));
                }
                let mut tiles = Vec::with_capacity(count);
                for _ in 0..count {
                    tiles.push(read_u16(&mut cursor)?);
                }
                Packet::ChunkData {
                    seq,
                    chunk_x,
                    chunk_y,
                    tiles,
                }
            }
            0x21 => Packet::ChunkUnload {
                seq: read_u64(&mut cursor)?,
                chunk_x: read_i32(&mut cursor)?,
                chunk_y: read_i32(&mut cursor)?,
            },
            0x30 => Packet::ChatBroadcast {
                seq: read_u64(&mut cursor)?,
                sender: read_string(&mut cursor)?,
                content: read_string(&mut cursor)?,
                timestamp: read_i64(&mut cursor)?,
                kind: ChatKind::from_u8(read_u8(&mut cursor)?)?,
            },
            0x31 => Packet::PeerLeft {
                seq: read_u64(&mut cursor)?,
                client_id: read_u32(&mut cursor)?,
            },
            0x40 => Packet::Disconnect {
                reason: read_string(&mut cursor)?,
            },
            0xFE => Packet::Ping {
                timestamp: read_u64(&mut cursor)?,
            },
            0xFF => Packet::Pong {
                timestamp: read_u64(&mut cursor)?,
            },
            _ => return Err(Error::new(ErrorKind::InvalidData, "Unknown packet ID")),
        };

        if cursor.position() as usize != data.len() {
            return Err(Error::new(ErrorKind::InvalidData, "Trailing bytes after packet"));
        }
        Ok(packet)
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    let len = u16::try_from(bytes.len())
        .map_err(|_| Error::new(ErrorKind::InvalidInput, "String too long"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = read_u16(cursor)? as usize;

    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;

    String::from_utf8(buf).map_err(|_| Error::new(ErrorKind::InvalidData, "Invalid UTF-8"))
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut byte = [0u8; 1];
    cursor.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    let mut bytes = [0u8; 2];
    cursor.read_exact(&mut bytes)?;
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let mut bytes = [0u8; 8];
    cursor.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    let mut bytes = [0u8; 8];
    cursor.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

fn read_f32(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    let mut bytes = [0u8; 4];
    cursor.read_exact(&mut bytes)?;
    Ok(f32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_data_roundtrip() {
        let packet = Packet::ChunkData {
            seq: 7,
            chunk_x: -2,
            chunk_y: 31,
            tiles: (0..256).map(|i| (i % 11) as TileId).collect(),
        };

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]) as usize, bytes.len() - 2);
        assert_eq!(bytes[2], 0x20);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_chat_roundtrip() {
        let packet = Packet::ChatBroadcast {
            seq: 3,
            sender: "alice".to_string(),
            content: "héllo, world".to_string(),
            timestamp: 1_700_000_000_123,
            kind: ChatKind::System,
        };
        let decoded = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_rejects_truncated_and_trailing() {
        let bytes = Packet::Ping { timestamp: 9 }.to_bytes().unwrap();

        let mut truncated = bytes[..bytes.len() - 1].to_vec();
        truncated[0] -= 1;
        assert!(Packet::from_bytes(&truncated).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        trailing[0] += 1;
        assert!(Packet::from_bytes(&trailing).is_err());

        assert!(Packet::from_bytes(&[1, 0, 0x99]).is_err());
        assert!(Packet::from_bytes(&[0, 0]).is_err());
    }

    #[test]
    fn test_rejects_bogus_tile_count() {
        let mut bytes = Packet::ChunkData {
            seq: 1,
            chunk_x: 0,
            chunk_y: 0,
            tiles: vec![1, 2],
        }
        .to_bytes()
        .unwrap();
        // Overwrite the tile count (after len, id, seq, x, y)
        bytes[19..23].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Packet::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let packet = Packet::ChunkData {
            seq: 1,
            chunk_x: 0,
            chunk_y: 0,
            tiles: vec![0; MAX_FRAME_SIZE],
        };
        assert!(packet.to_bytes().is_err());
    }

    #[test]
    fn test_seq_only_on_reliable_server_messages() {
        let mut unload = Packet::ChunkUnload {
            seq: 0,
            chunk_x: 1,
            chunk_y: 1,
        };
        assert!(unload.set_seq(12));
        assert_eq!(unload.seq(), Some(12));

        let mut ping = Packet::Ping { timestamp: 0 };
        assert!(!ping.set_seq(1));
        assert_eq!(ping.seq(), None);
    }
}
