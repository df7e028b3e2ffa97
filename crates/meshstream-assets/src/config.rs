//! Sender advertisement pushed to every new connection
//!
//! Body layout (the leading command byte is added by the message codec):
//!
//! ```text
//! timestamp u32 LE, areaRange u8, packageSize u8,
//! textureCount u8, materialCount u8, meshCount u8,
//! hashes u32 LE: textures, then materials, then meshes
//! ```

use crate::store::{AssetHash, AssetKind, AssetStore};
use crate::AssetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshstream_codec::TileGrid;

const FIXED_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob {
    pub timestamp: u32,
    pub grid: TileGrid,
    pub textures: Vec<AssetHash>,
    pub materials: Vec<AssetHash>,
    pub meshes: Vec<AssetHash>,
}

impl ConfigBlob {
    /// Snapshot the textures and materials in `store` and list `meshes` as
    /// given.
    ///
    /// `meshes` holds one hash per streamed mesh in stream order, so object id
    /// `i` is mesh index `i` in every frame. Identical meshes repeat their
    /// hash. Each must already be in `store`.
    pub fn from_store(
        store: &AssetStore,
        grid: TileGrid,
        timestamp: u32,
        meshes: &[AssetHash],
    ) -> Result<Self, AssetError> {
        if let Some(hash) = meshes.iter().find(|h| !store.contains(AssetKind::Mesh, **h)) {
            return Err(AssetError::NotFound {
                kind: AssetKind::Mesh,
                hash: *hash,
            });
        }
        let blob = Self {
            timestamp,
            grid,
            textures: store.hashes(AssetKind::Texture),
            materials: store.hashes(AssetKind::Material),
            meshes: meshes.to_vec(),
        };
        blob.check_counts()?;
        Ok(blob)
    }

    pub fn hashes(&self, kind: AssetKind) -> &[AssetHash] {
        match kind {
            AssetKind::Mesh => &self.meshes,
            AssetKind::Material => &self.materials,
            AssetKind::Texture => &self.textures,
        }
    }

    /// Every advertised blob as `(kind, object id, hash)`, textures first
    pub fn entries(&self) -> impl Iterator<Item = (AssetKind, u8, AssetHash)> + '_ {
        AssetKind::SYNC_ORDER.into_iter().flat_map(move |kind| {
            self.hashes(kind)
                .iter()
                .enumerate()
                .map(move |(id, hash)| (kind, id as u8, *hash))
        })
    }

    pub fn asset_count(&self) -> usize {
        self.textures.len() + self.materials.len() + self.meshes.len()
    }

    fn check_counts(&self) -> Result<(), AssetError> {
        for kind in AssetKind::SYNC_ORDER {
            let count = self.hashes(kind).len();
            if count > usize::from(u8::MAX) {
                return Err(AssetError::TooManyAssets { kind, count });
            }
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes, AssetError> {
        self.check_counts()?;
        let mut buf = BytesMut::with_capacity(FIXED_LEN + 4 * self.asset_count());
        buf.put_u32_le(self.timestamp);
        buf.put_u8(self.grid.area_range);
        buf.put_u8(self.grid.package_size);
        for kind in AssetKind::SYNC_ORDER {
            buf.put_u8(self.hashes(kind).len() as u8);
        }
        for kind in AssetKind::SYNC_ORDER {
            for hash in self.hashes(kind) {
                buf.put_u32_le(hash.0);
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(body: &[u8]) -> Result<Self, AssetError> {
        if body.len() < FIXED_LEN {
            return Err(AssetError::MalformedBlob(format!(
                "config of {} bytes is shorter than its fixed part",
                body.len()
            )));
        }
        let mut buf = body;
        let timestamp = buf.get_u32_le();
        let grid = TileGrid::new(buf.get_u8(), buf.get_u8());
        let counts = [buf.get_u8(), buf.get_u8(), buf.get_u8()];

        let total: usize = counts.iter().map(|c| usize::from(*c)).sum();
        if buf.remaining() != total * 4 {
            return Err(AssetError::MalformedBlob(format!(
                "config lists {total} hashes but carries {} hash bytes",
                buf.remaining()
            )));
        }

        let mut read = |count: u8| -> Vec<AssetHash> {
            (0..count).map(|_| AssetHash(buf.get_u32_le())).collect()
        };
        let textures = read(counts[0]);
        let materials = read(counts[1]);
        let meshes = read(counts[2]);

        Ok(Self {
            timestamp,
            grid,
            textures,
            materials,
            meshes,
        })
    }
}
