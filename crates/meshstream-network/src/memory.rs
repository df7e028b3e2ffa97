//! In-process channel for tests and single-process demos
//!
//! One listening channel accepts any number of connecting channels. Delivery
//! is always in order and lossless; unreliable sends behave like reliable ones.

use crate::channel::{ChannelEvent, ConnectionId, EventReceiver, EventSender, MessageChannel};
use crate::protocol::MessageStats;
use crate::NetworkError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

struct Peer {
    events: EventSender,
    /// Our id as known by the peer
    remote_id: ConnectionId,
    peers: Arc<Mutex<HashMap<ConnectionId, Peer>>>,
    stats: Arc<Mutex<MessageStats>>,
}

/// Endpoint of an in-memory message channel
#[derive(Clone)]
pub struct MemoryChannel {
    events: EventSender,
    peers: Arc<Mutex<HashMap<ConnectionId, Peer>>>,
    stats: Arc<Mutex<MessageStats>>,
    ids: Arc<AtomicU64>,
    listening: bool,
}

impl MemoryChannel {
    fn endpoint(ids: Arc<AtomicU64>, listening: bool) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let channel = Self {
            events,
            peers: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(MessageStats::default())),
            ids,
            listening,
        };
        (channel, rx)
    }

    /// Create a listening endpoint
    pub fn listen() -> (Self, EventReceiver) {
        let (channel, rx) = Self::endpoint(Arc::new(AtomicU64::new(1)), true);
        let _ = channel.events.send(ChannelEvent::ServerInitialized);
        (channel, rx)
    }

    /// Open a new endpoint connected to this one
    pub fn connect(&self) -> (Self, EventReceiver) {
        let (client, rx) = Self::endpoint(Arc::clone(&self.ids), false);

        let id_at_server = ConnectionId(self.ids.fetch_add(1, Ordering::Relaxed));
        let id_at_client = ConnectionId(self.ids.fetch_add(1, Ordering::Relaxed));

        self.peers.lock().insert(
            id_at_server,
            Peer {
                events: client.events.clone(),
                remote_id: id_at_client,
                peers: Arc::clone(&client.peers),
                stats: Arc::clone(&client.stats),
            },
        );
        client.peers.lock().insert(
            id_at_client,
            Peer {
                events: self.events.clone(),
                remote_id: id_at_server,
                peers: Arc::clone(&self.peers),
                stats: Arc::clone(&self.stats),
            },
        );

        debug!("Memory connection {id_at_server} <-> {id_at_client}");
        let _ = self.events.send(ChannelEvent::Connected(id_at_server));
        let _ = client.events.send(ChannelEvent::Connected(id_at_client));
        (client, rx)
    }

    fn drop_connection(&self, connection: ConnectionId) {
        let Some(peer) = self.peers.lock().remove(&connection) else {
            return;
        };
        if peer.peers.lock().remove(&peer.remote_id).is_some() {
            let _ = peer.events.send(ChannelEvent::Disconnected(peer.remote_id));
        }
        let _ = self.events.send(ChannelEvent::Disconnected(connection));
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn send(
        &self,
        connection: ConnectionId,
        payload: Bytes,
        _reliable: bool,
    ) -> Result<(), NetworkError> {
        let peers = self.peers.lock();
        let peer = peers
            .get(&connection)
            .ok_or(NetworkError::NotConnected(connection))?;

        let len = payload.len();
        peer.events
            .send(ChannelEvent::Message(peer.remote_id, payload))
            .map_err(|_| NetworkError::NotConnected(connection))?;
        trace!("Sent {len} bytes to {connection}");

        self.stats.lock().record_sent(len);
        peer.stats.lock().record_received(len);
        Ok(())
    }

    fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.peers.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    async fn disconnect(&self, connection: ConnectionId) {
        self.drop_connection(connection);
    }

    async fn close(&self) {
        for connection in self.connections() {
            self.drop_connection(connection);
        }
        if self.listening {
            let _ = self.events.send(ChannelEvent::ServerClosed);
        }
    }

    fn stats(&self) -> MessageStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (server, mut server_rx) = MemoryChannel::listen();
        let (client, mut client_rx) = server.connect();

        assert_eq!(server_rx.recv().await, Some(ChannelEvent::ServerInitialized));
        let Some(ChannelEvent::Connected(at_server)) = server_rx.recv().await else {
            panic!("expected connect on server");
        };
        let Some(ChannelEvent::Connected(at_client)) = client_rx.recv().await else {
            panic!("expected connect on client");
        };

        client
            .send(at_client, Bytes::from_static(&[0x31, 0, 0, 0, 0]), true)
            .await
            .unwrap();
        assert_eq!(
            server_rx.recv().await,
            Some(ChannelEvent::Message(
                at_server,
                Bytes::from_static(&[0x31, 0, 0, 0, 0])
            ))
        );
        assert_eq!(client.stats().messages_sent, 1);
        assert_eq!(server.stats().bytes_received, 5);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_both_sides() {
        let (server, mut server_rx) = MemoryChannel::listen();
        let (client, mut client_rx) = server.connect();
        let _ = server_rx.recv().await;
        let _ = server_rx.recv().await;
        let _ = client_rx.recv().await;

        let at_server = server.connections()[0];
        server.disconnect(at_server).await;

        assert_eq!(
            server_rx.recv().await,
            Some(ChannelEvent::Disconnected(at_server))
        );
        assert!(matches!(
            client_rx.recv().await,
            Some(ChannelEvent::Disconnected(_))
        ));
        assert!(client.connections().is_empty());
        assert!(matches!(
            server.send(at_server, Bytes::new(), true).await,
            Err(NetworkError::NotConnected(_))
        ));
    }
}
