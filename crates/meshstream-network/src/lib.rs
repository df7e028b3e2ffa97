//! Message transport for meshstream
//!
//! Provides the wire command table, a message-channel abstraction with
//! in-memory and QUIC implementations, and per-connection flow control for the
//! vertex stream.

pub mod channel;
pub mod flow;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use channel::{ChannelEvent, ConnectionId, EventReceiver, MessageChannel};
pub use flow::{ConnectionState, ConnectionTable, StreamChannel, MAX_OUTSTANDING};
pub use memory::MemoryChannel;
pub use protocol::{Command, FramedCodec, Message, MessageStats, CHUNK_SIZE};
pub use transport::{QuicChannel, StreamTransportConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Connection {0} is not open")]
    NotConnected(ConnectionId),

    #[error("No connection available")]
    NoConnection,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Asset of {len} bytes needs more than 255 chunks")]
    AssetTooLarge { len: usize },

    #[error("Asset error: {0}")]
    Asset(#[from] meshstream_assets::AssetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
