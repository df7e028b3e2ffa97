//! Message-channel abstraction shared by all transports

use crate::protocol::MessageStats;
use crate::NetworkError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

/// Transport-assigned identity of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle and data events raised by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Listening side is up and accepting connections
    ServerInitialized,
    /// Listening side stopped
    ServerClosed,
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    /// One complete message, boundaries preserved
    Message(ConnectionId, Bytes),
}

pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;
pub(crate) type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// Boundary-preserving message transport with an optional reliable class
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Send one message. Unreliable messages may be dropped or reordered by
    /// the transport.
    async fn send(
        &self,
        connection: ConnectionId,
        payload: Bytes,
        reliable: bool,
    ) -> Result<(), NetworkError>;

    /// Currently open connections
    fn connections(&self) -> Vec<ConnectionId>;

    /// Close one connection. A `Disconnected` event follows.
    async fn disconnect(&self, connection: ConnectionId);

    /// Close every connection and stop accepting new ones
    async fn close(&self);

    fn stats(&self) -> MessageStats;
}
