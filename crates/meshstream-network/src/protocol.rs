//! Protocol messages and framing for meshstream
//!
//! Every message starts with a single command byte. Multi-byte integers are
//! little-endian. Vertex-stream packets are carried through untouched; their
//! layout belongs to the frame codec.

use crate::NetworkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshstream_assets::{AssetHash, AssetKind, ConfigBlob};
use meshstream_codec::frame::{FRAGMENT_TYPE, KEYFRAME_TYPE};

/// Payload bytes per asset chunk
pub const CHUNK_SIZE: usize = 48 * 1024;

/// Header in front of every chunk or miss response
pub const CHUNK_HEADER_LEN: usize = 5;

pub const FETCH_LEN: usize = 10;

/// Largest frame accepted from a length-prefixed stream
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Leading command byte of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Config,
    Chunk(AssetKind),
    Miss(AssetKind),
    ResendConfig,
    Fetch(AssetKind),
    Keyframe,
    Fragment,
    Ready,
    Ack,
    ServerClose,
}

impl Command {
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Config => 0x01,
            Command::Chunk(kind) => 0x02 + kind_offset(kind),
            Command::ResendConfig => 0x11,
            Command::Fetch(kind) => 0x12 + kind_offset(kind),
            Command::Miss(kind) => 0x22 + kind_offset(kind),
            Command::Keyframe => KEYFRAME_TYPE,
            Command::Fragment => FRAGMENT_TYPE,
            Command::Ready => 0x30,
            Command::Ack => 0x31,
            Command::ServerClose => 0xFF,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        let command = match byte {
            0x01 => Command::Config,
            0x02..=0x04 => Command::Chunk(offset_kind(byte - 0x02)?),
            0x11 => Command::ResendConfig,
            0x12..=0x14 => Command::Fetch(offset_kind(byte - 0x12)?),
            0x22..=0x24 => Command::Miss(offset_kind(byte - 0x22)?),
            KEYFRAME_TYPE => Command::Keyframe,
            FRAGMENT_TYPE => Command::Fragment,
            0x30 => Command::Ready,
            0x31 => Command::Ack,
            0xFF => Command::ServerClose,
            _ => return None,
        };
        Some(command)
    }
}

fn kind_offset(kind: AssetKind) -> u8 {
    match kind {
        AssetKind::Mesh => 0,
        AssetKind::Material => 1,
        AssetKind::Texture => 2,
    }
}

fn offset_kind(offset: u8) -> Option<AssetKind> {
    match offset {
        0 => Some(AssetKind::Mesh),
        1 => Some(AssetKind::Material),
        2 => Some(AssetKind::Texture),
        _ => None,
    }
}

/// Messages exchanged between sender and receiver
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Asset advertisement pushed on connect
    Config(ConfigBlob),

    /// Receiver asks for the advertisement again
    ResendConfig,

    /// Receiver asks for one blob
    Fetch {
        kind: AssetKind,
        hash: AssetHash,
        object_id: u8,
    },

    /// One piece of a blob. `index` is 1-based.
    Chunk {
        kind: AssetKind,
        object_id: u8,
        total: u8,
        index: u8,
        payload: Bytes,
    },

    /// Sender has no blob with the requested hash
    Miss { kind: AssetKind, object_id: u8 },

    /// Keyframe or fragment packet, header included
    Frame(Bytes),

    /// Receiver finished syncing and can take the vertex stream
    Ready { accepts_compression: bool },

    /// Receiver consumed one vertex-stream packet
    Ack,

    /// Sender is shutting down
    ServerClose,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Config(_) => Command::Config,
            Message::ResendConfig => Command::ResendConfig,
            Message::Fetch { kind, .. } => Command::Fetch(*kind),
            Message::Chunk { kind, .. } => Command::Chunk(*kind),
            Message::Miss { kind, .. } => Command::Miss(*kind),
            Message::Frame(packet) => match packet.first() {
                Some(&FRAGMENT_TYPE) => Command::Fragment,
                _ => Command::Keyframe,
            },
            Message::Ready { .. } => Command::Ready,
            Message::Ack => Command::Ack,
            Message::ServerClose => Command::ServerClose,
        }
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Bytes, NetworkError> {
        let command = self.command().to_byte();
        let bytes = match self {
            Message::Frame(packet) => return Ok(packet.clone()),
            Message::Config(config) => {
                let body = config.encode()?;
                let mut buf = BytesMut::with_capacity(1 + body.len());
                buf.put_u8(command);
                buf.extend_from_slice(&body);
                buf
            }
            Message::ResendConfig => {
                let mut buf = BytesMut::with_capacity(FETCH_LEN);
                buf.put_u8(command);
                buf.put_bytes(0, FETCH_LEN - 1);
                buf
            }
            Message::Fetch {
                hash, object_id, ..
            } => {
                let mut buf = BytesMut::with_capacity(FETCH_LEN);
                buf.put_u8(command);
                // Timestamp slot, unused
                buf.put_u32_le(0);
                buf.put_u32_le(hash.0);
                buf.put_u8(*object_id);
                buf
            }
            Message::Chunk {
                object_id,
                total,
                index,
                payload,
                ..
            } => {
                let mut buf = BytesMut::with_capacity(CHUNK_HEADER_LEN + payload.len());
                buf.put_slice(&[command, *object_id, *total, *index, 0]);
                buf.extend_from_slice(payload);
                buf
            }
            Message::Miss { object_id, .. } => {
                BytesMut::from(&[command, *object_id, 0, 0, 0][..])
            }
            Message::Ready {
                accepts_compression,
            } => BytesMut::from(&[command, u8::from(*accepts_compression), 0, 0, 0][..]),
            Message::Ack => BytesMut::from(&[command, 0, 0, 0, 0][..]),
            Message::ServerClose => BytesMut::from(&[command, 0][..]),
        };
        Ok(bytes.freeze())
    }

    /// Deserialize message from bytes
    pub fn from_bytes(bytes: Bytes) -> Result<Self, NetworkError> {
        let Some(&first) = bytes.first() else {
            return Err(NetworkError::MalformedPacket("empty message".to_string()));
        };
        let command = Command::from_byte(first).ok_or_else(|| {
            NetworkError::MalformedPacket(format!("unknown command {first:#04x}"))
        })?;

        let message = match command {
            Command::Keyframe | Command::Fragment => Message::Frame(bytes),
            Command::Config => Message::Config(ConfigBlob::decode(&bytes[1..])?),
            Command::ResendConfig => Message::ResendConfig,
            Command::Fetch(kind) => {
                require(&bytes, FETCH_LEN, "fetch request")?;
                let mut buf = &bytes[5..FETCH_LEN];
                let hash = AssetHash(buf.get_u32_le());
                let object_id = buf.get_u8();
                Message::Fetch {
                    kind,
                    hash,
                    object_id,
                }
            }
            Command::Chunk(kind) => {
                require(&bytes, CHUNK_HEADER_LEN, "chunk header")?;
                let (object_id, total, index) = (bytes[1], bytes[2], bytes[3]);
                if total == 0 || index == 0 || index > total {
                    return Err(NetworkError::MalformedPacket(format!(
                        "chunk {index} of {total}"
                    )));
                }
                Message::Chunk {
                    kind,
                    object_id,
                    total,
                    index,
                    payload: bytes.slice(CHUNK_HEADER_LEN..),
                }
            }
            Command::Miss(kind) => {
                require(&bytes, 2, "miss response")?;
                Message::Miss {
                    kind,
                    object_id: bytes[1],
                }
            }
            Command::Ready => {
                require(&bytes, 2, "ready")?;
                Message::Ready {
                    accepts_compression: bytes[1] == 0x01,
                }
            }
            Command::Ack => Message::Ack,
            Command::ServerClose => Message::ServerClose,
        };
        Ok(message)
    }

    /// Whether this message belongs to the vertex stream
    pub fn is_stream(&self) -> bool {
        matches!(self, Message::Frame(_))
    }
}

fn require(bytes: &[u8], len: usize, what: &str) -> Result<(), NetworkError> {
    if bytes.len() < len {
        return Err(NetworkError::MalformedPacket(format!(
            "{what} needs {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

/// Length-prefixed framing for message streams
pub struct FramedCodec;

impl FramedCodec {
    /// Encode a payload with length prefix
    pub fn encode(payload: &[u8], buf: &mut BytesMut) -> Result<(), NetworkError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(NetworkError::MalformedPacket(format!(
                "frame of {} bytes is too large",
                payload.len()
            )));
        }

        // 4-byte length prefix (big-endian)
        buf.reserve(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);

        Ok(())
    }

    /// Decode one payload from buffer.
    /// Returns Some(payload) if a complete frame is available, None if more data needed
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, NetworkError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > MAX_FRAME_LEN {
            return Err(NetworkError::MalformedPacket(format!(
                "frame length {length} exceeds limit"
            )));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        buf.advance(4);
        Ok(Some(buf.split_to(length).freeze()))
    }
}

/// Message statistics for debugging/monitoring
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl MessageStats {
    pub fn record_sent(&mut self, len: usize) {
        self.messages_sent += 1;
        self.bytes_sent += len as u64;
    }

    pub fn record_received(&mut self, len: usize) {
        self.messages_received += 1;
        self.bytes_received += len as u64;
    }
}
