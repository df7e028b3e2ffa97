//! Asset synchronization between a sender and its receivers
//!
//! The sender side ([`AssetPublisher`]) answers fetch requests from its
//! [`AssetStore`](meshstream_assets::AssetStore) with chunked blobs. The
//! receiver side ([`AssetFetcher`]) walks the advertised hash list one request
//! at a time, reassembles and verifies each blob, and signals readiness once
//! every asset is mirrored locally.

pub mod fetcher;
pub mod publisher;
pub mod reassembly;

pub use fetcher::{AssetFetcher, FetchPhase, FetchRequest, FetcherConfig};
pub use publisher::{chunk_blob, AssetPublisher};
pub use reassembly::Reassembly;

use meshstream_assets::{AssetHash, AssetKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unexpected chunk for {kind} #{object_id}: {reason}")]
    UnexpectedChunk {
        kind: AssetKind,
        object_id: u8,
        reason: String,
    },

    #[error("Sender has no {kind} asset {hash} after {attempts} attempts")]
    AssetUnavailable {
        kind: AssetKind,
        hash: AssetHash,
        attempts: u32,
    },

    #[error("Asset error: {0}")]
    Asset(#[from] meshstream_assets::AssetError),

    #[error("Network error: {0}")]
    Network(#[from] meshstream_network::NetworkError),
}
