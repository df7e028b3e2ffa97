//! Content-addressed asset storage for meshstream
//!
//! Meshes, materials and textures are serialized into blobs keyed by the
//! CRC32 of their bytes. The sender advertises its blobs in a config blob and
//! receivers mirror the decoded assets locally.

pub mod blob;
pub mod config;
pub mod mirror;
pub mod store;

pub use blob::{MaterialBlob, MaterialProperty, MeshBlob, PropertyValue, TextureBlob};
pub use config::ConfigBlob;
pub use mirror::{AssetMirror, MirroredMesh, ResolvedMaterial, ShaderTable};
pub use store::{AssetHash, AssetKind, AssetStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Malformed blob: {0}")]
    MalformedBlob(String),

    #[error("{count} {kind} assets exceed the one-byte count")]
    TooManyAssets { kind: AssetKind, count: usize },

    #[error("Texture decode failed: {0}")]
    TextureDecode(String),

    #[error("No {kind} asset with hash {hash}")]
    NotFound { kind: AssetKind, hash: AssetHash },
}
