//! Per-connection flow control for the vertex stream
//!
//! Every stream packet sent raises the connection's queue depth and every ack
//! lowers it. Once more than [`MAX_OUTSTANDING`] packets are unacknowledged the
//! connection enters a temporal stop and receives no stream packets until its
//! depth falls back under one. Other connections are unaffected.

use crate::channel::{ConnectionId, MessageChannel};
use crate::protocol::Message;
use crate::NetworkError;
use bytes::Bytes;
use meshstream_codec::{EncodedFrame, FrameKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Unacknowledged stream packets tolerated before the temporal stop
pub const MAX_OUTSTANDING: i32 = 10;

/// Flow-control state of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub ready_for_stream: bool,
    pub compress_stream: bool,
    pub temporal_stop: bool,
    pub send_queue_depth: i32,
    /// Fragments are withheld until a keyframe reaches this connection
    pub awaiting_keyframe: bool,
}

impl ConnectionState {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            ready_for_stream: false,
            compress_stream: false,
            temporal_stop: false,
            send_queue_depth: 0,
            awaiting_keyframe: true,
        }
    }

    /// Receiver finished syncing. Resets the window.
    pub fn on_ready(&mut self, accepts_compression: bool) {
        self.ready_for_stream = true;
        self.compress_stream = accepts_compression;
        self.temporal_stop = false;
        self.send_queue_depth = 0;
        self.awaiting_keyframe = true;
    }

    pub fn on_ack(&mut self) {
        self.send_queue_depth = (self.send_queue_depth - 1).max(0);
        if self.temporal_stop && self.send_queue_depth < 1 {
            self.temporal_stop = false;
            self.send_queue_depth = 0;
        }
    }

    /// Count one stream packet handed to the transport
    pub fn record_send(&mut self) {
        self.send_queue_depth += 1;
        if self.send_queue_depth > MAX_OUTSTANDING {
            self.temporal_stop = true;
        }
    }

    pub fn can_stream(&self) -> bool {
        self.ready_for_stream && !self.temporal_stop
    }
}

/// Flow-control states keyed by connection
#[derive(Debug, Default)]
pub struct ConnectionTable {
    states: HashMap<ConnectionId, ConnectionState>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. An existing entry is reset.
    pub fn insert(&mut self, id: ConnectionId) {
        self.states.insert(id, ConnectionState::new(id));
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionState> {
        self.states.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.states.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionState> {
        self.states.get_mut(&id)
    }

    /// Connection ids in ascending order
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.states.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Message channel wrapper that paces the vertex stream per connection
pub struct StreamChannel<C: MessageChannel> {
    channel: Arc<C>,
    table: ConnectionTable,
    reliable: bool,
}

impl<C: MessageChannel> StreamChannel<C> {
    /// Stream packets go out on the reliable class unless changed with
    /// [`StreamChannel::with_reliable_stream`].
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            table: ConnectionTable::new(),
            reliable: true,
        }
    }

    pub fn with_reliable_stream(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn state(&self, id: ConnectionId) -> Option<&ConnectionState> {
        self.table.get(id)
    }

    pub fn on_connected(&mut self, id: ConnectionId) {
        info!("Connection {id} joined");
        self.table.insert(id);
    }

    pub fn on_disconnected(&mut self, id: ConnectionId) {
        if self.table.remove(id).is_some() {
            info!("Connection {id} left");
        }
    }

    /// Apply a ready or ack message. Returns false for any other message.
    pub fn handle_control(&mut self, id: ConnectionId, message: &Message) -> bool {
        let Some(state) = self.table.get_mut(id) else {
            if matches!(message, Message::Ready { .. } | Message::Ack) {
                warn!("Flow control message from unknown connection {id}");
                return true;
            }
            return false;
        };

        match message {
            Message::Ready {
                accepts_compression,
            } => {
                info!("Connection {id} ready for stream (compression: {accepts_compression})");
                state.on_ready(*accepts_compression);
                true
            }
            Message::Ack => {
                let was_stopped = state.temporal_stop;
                state.on_ack();
                if was_stopped && !state.temporal_stop {
                    debug!("Connection {id} resumed");
                }
                true
            }
            _ => false,
        }
    }

    /// Connections currently taking stream packets
    pub fn streamable(&self) -> usize {
        self.table
            .states
            .values()
            .filter(|state| state.can_stream())
            .count()
    }

    /// Whether some streamable connection still waits for a keyframe
    pub fn needs_keyframe(&self) -> bool {
        self.table
            .states
            .values()
            .any(|state| state.can_stream() && state.awaiting_keyframe)
    }

    /// Send a non-stream message to one connection on the reliable class
    pub async fn send_to(&self, id: ConnectionId, message: &Message) -> Result<(), NetworkError> {
        self.channel.send(id, message.to_bytes()?, true).await
    }

    /// Send a non-stream message to every tracked connection. Returns how many
    /// sends succeeded.
    pub async fn broadcast(&self, message: &Message) -> Result<usize, NetworkError> {
        let bytes = message.to_bytes()?;
        let mut delivered = 0;
        for id in self.table.ids() {
            match self.channel.send(id, bytes.clone(), true).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {id} failed: {e}"),
            }
        }
        Ok(delivered)
    }

    /// Deliver one encoded frame to every connection that can take it.
    ///
    /// Connections that are not ready or are stopped are skipped. Each peer
    /// gets the compressed body only if it asked for one. Returns the number of
    /// connections the packet was handed to.
    pub async fn send_vertex_stream(&mut self, frame: &EncodedFrame) -> Result<usize, NetworkError> {
        if self.table.is_empty() {
            return Err(NetworkError::NoConnection);
        }

        let is_keyframe = frame.kind == FrameKind::Keyframe;
        let mut raw: Option<Bytes> = None;
        let mut compressed: Option<Bytes> = None;
        let mut delivered = 0;

        for id in self.table.ids() {
            let Some(state) = self.table.get_mut(id) else {
                continue;
            };
            if !state.ready_for_stream {
                continue;
            }
            if state.temporal_stop {
                trace!("Connection {id} stopped at depth {}", state.send_queue_depth);
                state.awaiting_keyframe = true;
                continue;
            }
            if state.awaiting_keyframe && !is_keyframe {
                continue;
            }

            let packet = if state.compress_stream {
                compressed.get_or_insert_with(|| frame.to_packet(true)).clone()
            } else {
                raw.get_or_insert_with(|| frame.to_packet(false)).clone()
            };

            match self.channel.send(id, packet, self.reliable).await {
                Ok(()) => {
                    state.record_send();
                    if is_keyframe {
                        state.awaiting_keyframe = false;
                    }
                    if state.temporal_stop {
                        debug!("Connection {id} entered temporal stop");
                    }
                    delivered += 1;
                }
                Err(e) => {
                    warn!("Stream send to {id} failed: {e}");
                    state.awaiting_keyframe = true;
                }
            }
        }

        Ok(delivered)
    }
}
