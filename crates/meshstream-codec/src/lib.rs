//! Vertex stream encoding for meshstream
//!
//! Quantizes skinned-mesh vertices onto a tile grid, builds keyframe and
//! fragment packets, and smooths decoded frames for rendering.

pub mod compress;
pub mod frame;
pub mod playback;
pub mod quantize;
pub mod tiling;

pub use compress::{CompressionAlgorithm, Compressor};
pub use frame::{
    AppliedFrame, EncodedFrame, FrameDecoder, FrameEncoder, FrameHeader, FrameKind, LinedIndex,
    MeshSample, VertexRef,
};
pub use playback::{PlaybackConfig, PlaybackPhase, PlaybackState, RenderFrame};
pub use quantize::{LocalOffset, Position, TileGrid, TileId};
pub use tiling::{CpuTiler, Tiler, Transform};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Decompression failure: {0}")]
    DecompressionFailure(String),

    #[error("Fragment received before any keyframe")]
    FragmentBeforeKeyframe,

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Vertex {vertex} of mesh {mesh} is outside the local buffers")]
    VertexOutOfRange { mesh: u8, vertex: u16 },

    #[error("{0} meshes exceed the one-byte mesh index")]
    TooManyMeshes(usize),
}
