//! Receiver session: syncs assets from one sender, then decodes and smooths
//! its vertex stream

use anyhow::Result;
use meshstream_assets::{AssetStore, ShaderTable};
use meshstream_codec::{AppliedFrame, FrameDecoder, PlaybackConfig, PlaybackState, RenderFrame};
use meshstream_network::{ChannelEvent, ConnectionId, EventReceiver, Message, MessageChannel};
use meshstream_sync::{AssetFetcher, FetcherConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub interpolate: bool,
    pub time_span: Duration,
    pub lag_threshold: Duration,
    pub request_timeout: Duration,
    pub send_retry_backoff: Duration,
    pub max_miss_retries: Option<u32>,
    pub accept_compression: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        let fetcher = FetcherConfig::default();
        let playback = PlaybackConfig::default();
        Self {
            interpolate: playback.interpolate,
            time_span: playback.time_span,
            lag_threshold: playback.lag_threshold,
            request_timeout: fetcher.request_timeout,
            send_retry_backoff: fetcher.send_retry_backoff,
            max_miss_retries: fetcher.max_miss_retries,
            accept_compression: fetcher.accept_compression,
        }
    }
}

impl ReceiverConfig {
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            request_timeout: self.request_timeout,
            send_retry_backoff: self.send_retry_backoff,
            max_miss_retries: self.max_miss_retries,
            accept_compression: self.accept_compression,
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            interpolate: self.interpolate,
            time_span: self.time_span,
            lag_threshold: self.lag_threshold,
            ..PlaybackConfig::default()
        }
    }
}

/// Session milestones reported to the embedding application
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    Connected(ConnectionId),
    /// Sync finished; frames are decoded from now on. One vertex count per
    /// stream mesh, 0 for a mesh that could not be mirrored.
    AssetsReady { vertex_counts: Vec<usize> },
    Frame(AppliedFrame),
    ServerClosed,
    Disconnected(ConnectionId),
}

pub struct Receiver<C: MessageChannel> {
    config: ReceiverConfig,
    channel: Arc<C>,
    connection: Option<ConnectionId>,
    fetcher: AssetFetcher,
    decoder: Option<FrameDecoder>,
    playback: PlaybackState,
    events: mpsc::UnboundedSender<ReceiverEvent>,
    render: watch::Sender<Option<RenderFrame>>,
}

impl<C: MessageChannel> Receiver<C> {
    /// `store` survives reconnects so blobs are fetched at most once
    pub fn new(
        config: ReceiverConfig,
        channel: Arc<C>,
        store: Arc<AssetStore>,
        shaders: ShaderTable,
    ) -> (Self, mpsc::UnboundedReceiver<ReceiverEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (render, _) = watch::channel(None);
        let receiver = Self {
            fetcher: AssetFetcher::new(config.fetcher_config(), store, shaders),
            playback: PlaybackState::new(config.playback_config()),
            config,
            channel,
            connection: None,
            decoder: None,
            events,
            render,
        };
        (receiver, events_rx)
    }

    /// Latest blended vertex buffers, updated while interpolating
    pub fn subscribe_render(&self) -> watch::Receiver<Option<RenderFrame>> {
        self.render.subscribe()
    }

    pub fn fetcher(&self) -> &AssetFetcher {
        &self.fetcher
    }

    pub fn decoder(&self) -> Option<&FrameDecoder> {
        self.decoder.as_ref()
    }

    pub async fn run(
        mut self,
        mut events: EventReceiver,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let mut render_tick = time::interval(self.config.time_span.max(Duration::from_millis(1)));
        render_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_render = Instant::now();
        tokio::pin!(shutdown);

        loop {
            let deadline = self.fetcher.next_deadline();
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

                _ = sleep_until(deadline) => {
                    if let Some(message) = self.fetcher.poll(Instant::now()) {
                        self.send(message).await;
                    }
                }

                _ = render_tick.tick() => {
                    let now = Instant::now();
                    self.render(now - last_render);
                    last_render = now;
                }

                _ = &mut shutdown => {
                    info!("Shutting down receiver");
                    break;
                }
            }
        }

        self.channel.close().await;
        Ok(())
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected(id) => {
                info!("Connected to sender as {id}");
                self.connection = Some(id);
                self.reset_session();
                self.emit(ReceiverEvent::Connected(id));
            }
            ChannelEvent::Disconnected(id) => {
                if self.connection == Some(id) {
                    info!("Sender connection {id} lost");
                    self.connection = None;
                    self.reset_session();
                    self.emit(ReceiverEvent::Disconnected(id));
                }
            }
            ChannelEvent::Message(id, bytes) => match Message::from_bytes(bytes) {
                Ok(message) => self.handle_message(id, message).await,
                Err(e) => warn!("Dropping message from {id}: {e}"),
            },
            ChannelEvent::ServerInitialized | ChannelEvent::ServerClosed => {}
        }
    }

    async fn handle_message(&mut self, id: ConnectionId, message: Message) {
        match message {
            Message::Frame(packet) => {
                self.apply_frame(&packet);
                // Every stream packet is acknowledged, decodable or not
                self.send(Message::Ack).await;
            }
            Message::ServerClose => {
                info!("Sender {id} is shutting down");
                self.reset_session();
                self.emit(ReceiverEvent::ServerClosed);
            }
            Message::Config(_) | Message::Chunk { .. } | Message::Miss { .. } => {
                if matches!(message, Message::Config(_)) {
                    self.decoder = None;
                }
                let now = Instant::now();
                match self.fetcher.on_message(&message, now) {
                    Ok(Some(reply)) => self.send(reply).await,
                    Ok(None) => {}
                    Err(e) => warn!("Sync: {e}"),
                }
                if let Some(next) = self.fetcher.poll(now) {
                    self.send(next).await;
                }
                self.check_ready();
            }
            other => debug!("Ignoring {:?} from {id}", other.command()),
        }
    }

    fn check_ready(&mut self) {
        if self.decoder.is_some() || !self.fetcher.is_ready() {
            return;
        }
        let Some(grid) = self.fetcher.grid() else {
            return;
        };
        let slots = self.fetcher.vertex_counts();
        let missing = slots.iter().filter(|slot| slot.is_none()).count();
        if missing > 0 {
            warn!("{missing} of {} meshes unavailable, their vertices are dropped", slots.len());
        }
        info!("Stream ready for {} meshes", slots.len());
        self.decoder = Some(FrameDecoder::with_mesh_slots(grid, &slots));
        self.playback = PlaybackState::new(self.config.playback_config());
        self.emit(ReceiverEvent::AssetsReady {
            vertex_counts: slots.into_iter().map(|slot| slot.unwrap_or(0)).collect(),
        });
    }

    fn apply_frame(&mut self, packet: &[u8]) {
        let Some(decoder) = self.decoder.as_mut() else {
            debug!("Frame before assets are ready, dropped");
            return;
        };
        match decoder.apply(packet) {
            Ok(applied) => {
                trace!(
                    "Applied {:?} #{} ({} vertices)",
                    applied.kind,
                    applied.timestamp,
                    applied.vertices
                );
                self.playback.on_update(applied.kind);
                self.publish_render();
                self.emit(ReceiverEvent::Frame(applied));
            }
            Err(e) => warn!("Frame rejected: {e}"),
        }
    }

    fn render(&mut self, elapsed: Duration) {
        if self.decoder.is_none() {
            return;
        }
        let before = self.playback.weight();
        if self.playback.advance(elapsed) != before {
            self.publish_render();
        }
    }

    fn publish_render(&self) {
        if let Some(decoder) = &self.decoder {
            self.render.send_replace(Some(self.playback.render(decoder)));
        }
    }

    fn reset_session(&mut self) {
        self.fetcher.reset();
        self.decoder = None;
        self.render.send_replace(None);
    }

    async fn send(&mut self, message: Message) {
        let from_fetcher = matches!(message, Message::Fetch { .. } | Message::Ready { .. });
        let result = match (self.connection, message.to_bytes()) {
            (Some(id), Ok(bytes)) => self.channel.send(id, bytes, true).await,
            (None, _) => Err(meshstream_network::NetworkError::NoConnection),
            (_, Err(e)) => Err(e),
        };

        if let Err(e) = result {
            warn!("Send failed: {e}");
            if from_fetcher {
                self.fetcher.on_send_failed(Instant::now());
            }
        }
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
