//! Sender session: serves assets and streams encoded frames to every receiver

use anyhow::{Context, Result};
use meshstream_assets::{AssetHash, AssetStore};
use meshstream_codec::{
    CompressionAlgorithm, FrameEncoder, FrameKind, MeshSample, Position, TileGrid,
};
use meshstream_network::{
    ChannelEvent, ConnectionId, EventReceiver, Message, MessageChannel, NetworkError,
    StreamChannel,
};
use meshstream_sync::AssetPublisher;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Produces the animated meshes to stream, one call per tick
pub trait MeshSource: Send {
    /// Put every asset the stream needs into `store`. Returns one mesh hash
    /// per sampled mesh, in the order [`MeshSource::sample`] yields them;
    /// identical meshes repeat their hash.
    fn publish_assets(&self, store: &AssetStore) -> Result<Vec<AssetHash>>;

    /// Sample every mesh at `elapsed` since the session started, plus the root
    /// position
    fn sample(&mut self, elapsed: Duration) -> (Vec<MeshSample>, Position);
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub grid: TileGrid,
    pub frame_interval: Duration,
    pub subframes_per_keyframe: u32,
    /// `None` always sends raw bodies
    pub compression: Option<CompressionAlgorithm>,
    pub reliable_stream: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            grid: TileGrid::default(),
            frame_interval: Duration::from_millis(100),
            subframes_per_keyframe: 4,
            compression: Some(CompressionAlgorithm::Zstd),
            reliable_stream: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SenderStats {
    pub keyframes: u64,
    pub fragments: u64,
    /// Frame packets handed to connections
    pub deliveries: u64,
    pub assets_served: u64,
}

pub struct Sender<C: MessageChannel, S: MeshSource> {
    config: SenderConfig,
    stream: StreamChannel<C>,
    publisher: AssetPublisher,
    encoder: FrameEncoder,
    source: S,
    stats: SenderStats,
}

impl<C: MessageChannel, S: MeshSource> Sender<C, S> {
    /// Publishes the source's assets into `store` and snapshots the
    /// advertisement; assets added later are not announced.
    pub fn new(
        config: SenderConfig,
        channel: Arc<C>,
        store: Arc<AssetStore>,
        source: S,
    ) -> Result<Self> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let meshes = source
            .publish_assets(&store)
            .context("Failed to publish stream assets")?;
        let publisher = AssetPublisher::new(store, config.grid, timestamp, &meshes)
            .context("Failed to build asset advertisement")?;
        let encoder = FrameEncoder::new(config.grid, config.subframes_per_keyframe)
            .with_compression(config.compression);
        let stream = StreamChannel::new(channel).with_reliable_stream(config.reliable_stream);

        Ok(Self {
            config,
            stream,
            publisher,
            encoder,
            source,
            stats: SenderStats::default(),
        })
    }

    pub fn stats(&self) -> &SenderStats {
        &self.stats
    }

    /// Serve events and stream frames until `shutdown` resolves, then tell
    /// every receiver and close the channel.
    pub async fn run(
        mut self,
        mut events: EventReceiver,
        shutdown: impl Future<Output = ()>,
    ) -> Result<SenderStats> {
        let started = Instant::now();
        let mut ticker = time::interval(self.config.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("Channel event stream ended");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.tick(started.elapsed()).await {
                        error!("Frame tick failed: {e}");
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutting down sender");
                    break;
                }
            }
        }

        match self.stream.broadcast(&Message::ServerClose).await {
            Ok(n) => debug!("Sent close to {n} receivers"),
            Err(e) => warn!("Failed to announce shutdown: {e}"),
        }
        self.stream.channel().close().await;
        info!(
            "Sender finished: {} keyframes, {} fragments, {} deliveries",
            self.stats.keyframes, self.stats.fragments, self.stats.deliveries
        );
        Ok(self.stats)
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::ServerInitialized => info!("Sender listening"),
            ChannelEvent::ServerClosed => info!("Sender channel closed"),
            ChannelEvent::Connected(id) => {
                self.stream.on_connected(id);
                // Every new connection gets the advertisement unasked
                if let Err(e) = self
                    .stream
                    .send_to(id, &self.publisher.config_message())
                    .await
                {
                    warn!("Failed to push config to {id}: {e}");
                }
            }
            ChannelEvent::Disconnected(id) => self.stream.on_disconnected(id),
            ChannelEvent::Message(id, bytes) => match Message::from_bytes(bytes) {
                Ok(message) => self.handle_message(id, message).await,
                Err(e) => warn!("Dropping message from {id}: {e}"),
            },
        }
    }

    async fn handle_message(&mut self, id: ConnectionId, message: Message) {
        if self.stream.handle_control(id, &message) {
            return;
        }

        match self.publisher.respond(&message) {
            Ok(Some(responses)) => {
                if matches!(message, Message::Fetch { .. }) {
                    self.stats.assets_served += 1;
                }
                for response in responses {
                    if let Err(e) = self.stream.send_to(id, &response).await {
                        warn!("Failed to answer {id}: {e}");
                        break;
                    }
                }
            }
            Ok(None) => debug!("Ignoring {:?} from {id}", message.command()),
            Err(e) => warn!("Cannot answer {:?} from {id}: {e}", message.command()),
        }
    }

    /// Encode and send one frame if anyone can take it
    async fn tick(&mut self, elapsed: Duration) -> Result<(), NetworkError> {
        if self.stream.streamable() == 0 {
            return Ok(());
        }
        if self.stream.needs_keyframe() {
            self.encoder.force_keyframe();
        }

        let (samples, position) = self.source.sample(elapsed);
        let frame = match self.encoder.encode(samples, position) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode frame: {e}");
                return Ok(());
            }
        };

        match frame.kind {
            FrameKind::Keyframe => self.stats.keyframes += 1,
            FrameKind::Fragment => self.stats.fragments += 1,
        }
        let delivered = self.stream.send_vertex_stream(&frame).await?;
        self.stats.deliveries += delivered as u64;
        trace!(
            "Frame #{} ({:?}) delivered to {delivered} receivers",
            frame.timestamp,
            frame.kind
        );
        Ok(())
    }
}
