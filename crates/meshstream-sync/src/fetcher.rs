//! Receiver side of asset synchronization
//!
//! A pure state machine: callers feed it incoming messages and the current
//! time, and send whatever message it hands back. Requests go out strictly one
//! at a time:
//!
//! ```text
//! AwaitingConfig --config--> RequestingAssets --queue empty--> StreamReady
//!        ^                                                         |
//!        +------------------- reset (disconnect, 0xFF) ------------+
//! ```

use crate::reassembly::Reassembly;
use crate::SyncError;
use bytes::Bytes;
use meshstream_assets::{AssetHash, AssetKind, AssetMirror, AssetStore, ConfigBlob, ShaderTable};
use meshstream_codec::TileGrid;
use meshstream_network::Message;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// How long to wait for a complete response before re-requesting
    pub request_timeout: Duration,
    /// Delay before retrying a request that could not be sent
    pub send_retry_backoff: Duration,
    /// Give up on a blob after this many misses. `None` retries forever.
    pub max_miss_retries: Option<u32>,
    /// Ask the sender for compressed frames
    pub accept_compression: bool,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            send_retry_backoff: Duration::from_secs(2),
            max_miss_retries: None,
            accept_compression: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    AwaitingConfig,
    RequestingAssets,
    StreamReady,
}

/// One advertised blob to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub kind: AssetKind,
    pub hash: AssetHash,
    pub object_id: u8,
}

impl FetchRequest {
    pub fn to_message(&self) -> Message {
        Message::Fetch {
            kind: self.kind,
            hash: self.hash,
            object_id: self.object_id,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    request: FetchRequest,
    reassembly: Reassembly,
    deadline: Instant,
    /// Set after a failed send
    retry_at: Option<Instant>,
    misses: u32,
    attempts: u32,
}

/// Receiver-side sync session for one sender
pub struct AssetFetcher {
    config: FetcherConfig,
    store: Arc<AssetStore>,
    mirror: AssetMirror,
    phase: FetchPhase,
    advert: Option<ConfigBlob>,
    queue: VecDeque<FetchRequest>,
    current: Option<InFlight>,
    unavailable: Vec<FetchRequest>,
    transferred: usize,
    /// The ready message could not be sent; resend it at this time
    ready_retry_at: Option<Instant>,
}

impl AssetFetcher {
    /// `store` keeps verified blobs across sessions so they are never fetched
    /// twice.
    pub fn new(config: FetcherConfig, store: Arc<AssetStore>, shaders: ShaderTable) -> Self {
        Self {
            config,
            store,
            mirror: AssetMirror::new(shaders),
            phase: FetchPhase::AwaitingConfig,
            advert: None,
            queue: VecDeque::new(),
            current: None,
            unavailable: Vec::new(),
            transferred: 0,
            ready_retry_at: None,
        }
    }

    pub fn phase(&self) -> FetchPhase {
        self.phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase == FetchPhase::StreamReady
    }

    pub fn mirror(&self) -> &AssetMirror {
        &self.mirror
    }

    pub fn store(&self) -> &Arc<AssetStore> {
        &self.store
    }

    /// Last advertisement received
    pub fn advert(&self) -> Option<&ConfigBlob> {
        self.advert.as_ref()
    }

    pub fn grid(&self) -> Option<TileGrid> {
        self.advert.as_ref().map(|config| config.grid)
    }

    /// Vertex count per advertised mesh id, `None` for meshes that could not
    /// be mirrored
    pub fn vertex_counts(&self) -> Vec<Option<usize>> {
        let slots = self.advert.as_ref().map_or(0, |config| config.meshes.len());
        self.mirror.vertex_counts(slots)
    }

    /// Requests not yet completed, the in-flight one included
    pub fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.current.is_some())
    }

    /// The request currently waiting for a response
    pub fn in_flight(&self) -> Option<FetchRequest> {
        self.current.as_ref().map(|inflight| inflight.request)
    }

    /// Blobs given up on after too many misses
    pub fn unavailable(&self) -> &[FetchRequest] {
        &self.unavailable
    }

    /// Blobs received over the wire, as opposed to found locally
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// When [`AssetFetcher::poll`] next has something to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.current
            .as_ref()
            .map(|inflight| inflight.retry_at.unwrap_or(inflight.deadline))
            .or(self.ready_retry_at)
    }

    /// Feed one message from the sender. Returns the message to send next.
    pub fn on_message(
        &mut self,
        message: &Message,
        now: Instant,
    ) -> Result<Option<Message>, SyncError> {
        match message {
            Message::Config(config) => Ok(self.on_config(config.clone(), now)),
            Message::Chunk {
                kind,
                object_id,
                total,
                index,
                payload,
            } => self.on_chunk(*kind, *object_id, *total, *index, payload, now),
            Message::Miss { kind, object_id } => self.on_miss(*kind, *object_id, now),
            _ => Ok(None),
        }
    }

    /// Start a sync round for a new advertisement. Any round in progress is
    /// abandoned.
    pub fn on_config(&mut self, config: ConfigBlob, now: Instant) -> Option<Message> {
        info!(
            "Config #{}: {} assets advertised",
            config.timestamp,
            config.asset_count()
        );
        self.cancel();
        self.queue = config
            .entries()
            .map(|(kind, object_id, hash)| FetchRequest {
                kind,
                hash,
                object_id,
            })
            .collect();
        self.advert = Some(config);
        self.phase = FetchPhase::RequestingAssets;
        self.advance(now)
    }

    fn on_chunk(
        &mut self,
        kind: AssetKind,
        object_id: u8,
        total: u8,
        index: u8,
        payload: &Bytes,
        now: Instant,
    ) -> Result<Option<Message>, SyncError> {
        let Some(inflight) = self.current.as_mut() else {
            return Err(SyncError::UnexpectedChunk {
                kind,
                object_id,
                reason: "no request in flight".to_string(),
            });
        };

        let Some(blob) = inflight
            .reassembly
            .push(kind, object_id, total, index, payload)?
        else {
            inflight.deadline = now + self.config.request_timeout;
            return Ok(None);
        };

        let request = inflight.request;
        let actual = AssetHash::of(&blob);
        if actual != request.hash {
            warn!(
                "{} #{} arrived with hash {actual}, expected {}",
                request.kind, request.object_id, request.hash
            );
            return self.retry_current(now);
        }

        debug!(
            "Received {} #{} ({} bytes)",
            request.kind,
            request.object_id,
            blob.len()
        );
        self.store.put(request.kind, blob.clone());
        self.transferred += 1;
        self.current = None;

        self.commit(request, &blob)?;
        Ok(self.advance(now))
    }

    fn on_miss(
        &mut self,
        kind: AssetKind,
        object_id: u8,
        now: Instant,
    ) -> Result<Option<Message>, SyncError> {
        match self.in_flight() {
            Some(request) if request.kind == kind && request.object_id == object_id => {
                warn!("Sender is missing {kind} {}", request.hash);
                self.retry_current(now)
            }
            _ => Err(SyncError::UnexpectedChunk {
                kind,
                object_id,
                reason: "miss for a request not in flight".to_string(),
            }),
        }
    }

    /// Re-request the in-flight blob after a miss or a corrupt transfer
    fn retry_current(&mut self, now: Instant) -> Result<Option<Message>, SyncError> {
        let Some(inflight) = self.current.as_mut() else {
            return Ok(None);
        };
        inflight.misses += 1;

        if let Some(max) = self.config.max_miss_retries {
            if inflight.misses > max {
                let request = inflight.request;
                let attempts = inflight.attempts;
                error!(
                    "Giving up on {} {} after {attempts} attempts",
                    request.kind, request.hash
                );
                self.current = None;
                self.unavailable.push(request);
                return Err(SyncError::AssetUnavailable {
                    kind: request.kind,
                    hash: request.hash,
                    attempts,
                });
            }
        }

        Ok(self.resend(now))
    }

    fn resend(&mut self, now: Instant) -> Option<Message> {
        let timeout = self.config.request_timeout;
        let inflight = self.current.as_mut()?;
        inflight.reassembly.reset();
        inflight.deadline = now + timeout;
        inflight.retry_at = None;
        inflight.attempts += 1;
        debug!(
            "Re-requesting {} #{} (attempt {})",
            inflight.request.kind, inflight.request.object_id, inflight.attempts
        );
        Some(inflight.request.to_message())
    }

    /// The last message handed out (a fetch, or the ready message) could not
    /// be sent. Retry after the backoff.
    pub fn on_send_failed(&mut self, now: Instant) {
        let retry_at = now + self.config.send_retry_backoff;
        match self.current.as_mut() {
            Some(inflight) => inflight.retry_at = Some(retry_at),
            None if self.phase == FetchPhase::StreamReady => self.ready_retry_at = Some(retry_at),
            None => {}
        }
    }

    /// Drive timeouts and queued requests. Returns the message to send next.
    pub fn poll(&mut self, now: Instant) -> Option<Message> {
        match self.phase {
            FetchPhase::AwaitingConfig => return None,
            FetchPhase::StreamReady => {
                return match self.ready_retry_at {
                    Some(at) if now >= at => {
                        self.ready_retry_at = None;
                        debug!("Resending ready");
                        Some(self.ready_message())
                    }
                    _ => None,
                };
            }
            FetchPhase::RequestingAssets => {}
        }

        let Some(inflight) = self.current.as_ref() else {
            return self.advance(now);
        };
        let (retry_at, deadline, request) = (inflight.retry_at, inflight.deadline, inflight.request);

        match retry_at {
            Some(at) if now >= at => self.resend(now),
            Some(_) => None,
            None if now >= deadline => {
                warn!("Request for {} #{} timed out", request.kind, request.object_id);
                self.resend(now)
            }
            None => None,
        }
    }

    /// Drop the session: in-flight reassembly, queue and mirror. The local
    /// store is kept.
    pub fn reset(&mut self) {
        if self.phase != FetchPhase::AwaitingConfig {
            info!("Sync session reset");
        }
        self.cancel();
        self.advert = None;
        self.phase = FetchPhase::AwaitingConfig;
    }

    fn cancel(&mut self) {
        self.current = None;
        self.ready_retry_at = None;
        self.queue.clear();
        self.unavailable.clear();
        self.mirror.clear();
    }

    /// Issue the next request, skipping blobs already held locally. Returns
    /// the ready message once the queue runs dry.
    fn advance(&mut self, now: Instant) -> Option<Message> {
        while let Some(request) = self.queue.pop_front() {
            match self.store.get(request.kind, request.hash) {
                Ok(blob) => {
                    debug!("{} {} already held locally", request.kind, request.hash);
                    if let Err(e) = self.commit(request, &blob) {
                        error!("Local {} {} is unusable: {e}", request.kind, request.hash);
                    }
                }
                Err(_) => {
                    debug!("Requesting {} #{}", request.kind, request.object_id);
                    self.current = Some(InFlight {
                        request,
                        reassembly: Reassembly::new(request.kind, request.object_id),
                        deadline: now + self.config.request_timeout,
                        retry_at: None,
                        misses: 0,
                        attempts: 1,
                    });
                    return Some(request.to_message());
                }
            }
        }

        self.phase = FetchPhase::StreamReady;
        info!(
            "Assets synchronized: {} meshes, {} materials, {} textures",
            self.mirror.mesh_count(),
            self.mirror.material_count(),
            self.mirror.texture_count()
        );
        Some(self.ready_message())
    }

    fn ready_message(&self) -> Message {
        Message::Ready {
            accepts_compression: self.config.accept_compression,
        }
    }

    fn commit(&mut self, request: FetchRequest, blob: &[u8]) -> Result<(), SyncError> {
        self.mirror.commit(request.kind, request.object_id, blob)?;
        Ok(())
    }
}
