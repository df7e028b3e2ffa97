//! CRC32-addressed blob store

use crate::AssetError;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetKind {
    Mesh,
    Material,
    Texture,
}

impl AssetKind {
    /// Order in which kinds are advertised and fetched
    pub const SYNC_ORDER: [AssetKind; 3] = [AssetKind::Texture, AssetKind::Material, AssetKind::Mesh];

    fn slot(self) -> usize {
        match self {
            AssetKind::Mesh => 0,
            AssetKind::Material => 1,
            AssetKind::Texture => 2,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AssetKind::Mesh => "mesh",
            AssetKind::Material => "material",
            AssetKind::Texture => "texture",
        })
    }
}

/// CRC32 of a serialized blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetHash(pub u32);

impl AssetHash {
    pub fn of(bytes: &[u8]) -> Self {
        AssetHash(crc32fast::hash(bytes))
    }
}

impl fmt::Display for AssetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Default)]
struct StoreInner {
    blobs: HashMap<(AssetKind, AssetHash), Bytes>,
    order: [Vec<AssetHash>; 3],
}

/// Append-only blob store shared between sessions.
///
/// Entries are never rewritten or removed. Two payloads with the same CRC32
/// collide silently: the first one stored is kept.
#[derive(Default)]
pub struct AssetStore {
    inner: RwLock<StoreInner>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under its CRC32 and return the hash. A payload whose hash
    /// is already present is not stored again.
    pub fn put(&self, kind: AssetKind, bytes: impl Into<Bytes>) -> AssetHash {
        let bytes = bytes.into();
        let hash = AssetHash::of(&bytes);

        let mut inner = self.inner.write();
        if inner.blobs.contains_key(&(kind, hash)) {
            trace!("{kind} {hash} already stored");
            return hash;
        }
        debug!("Stored {kind} {hash} ({} bytes)", bytes.len());
        inner.blobs.insert((kind, hash), bytes);
        inner.order[kind.slot()].push(hash);
        hash
    }

    pub fn get(&self, kind: AssetKind, hash: AssetHash) -> Result<Bytes, AssetError> {
        self.inner
            .read()
            .blobs
            .get(&(kind, hash))
            .cloned()
            .ok_or(AssetError::NotFound { kind, hash })
    }

    pub fn contains(&self, kind: AssetKind, hash: AssetHash) -> bool {
        self.inner.read().blobs.contains_key(&(kind, hash))
    }

    /// Hashes of one kind in insertion order
    pub fn hashes(&self, kind: AssetKind) -> Vec<AssetHash> {
        self.inner.read().order[kind.slot()].clone()
    }

    pub fn len(&self, kind: AssetKind) -> usize {
        self.inner.read().order[kind.slot()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_crc32() {
        // Standard CRC-32 check value
        assert_eq!(AssetHash::of(b"123456789"), AssetHash(0xCBF4_3926));
        assert_eq!(AssetHash(0xAABBCCDD).to_string(), "0xaabbccdd");
    }

    #[test]
    fn test_kinds_are_separate() {
        let store = AssetStore::new();
        let hash = store.put(AssetKind::Mesh, &b"blob"[..]);
        assert!(store.contains(AssetKind::Mesh, hash));
        assert!(!store.contains(AssetKind::Texture, hash));
        assert!(matches!(
            store.get(AssetKind::Texture, hash),
            Err(AssetError::NotFound { .. })
        ));
    }

    #[test]
    fn test_insertion_order_kept() {
        let store = AssetStore::new();
        let a = store.put(AssetKind::Material, &b"a"[..]);
        let b = store.put(AssetKind::Material, &b"b"[..]);
        store.put(AssetKind::Material, &b"a"[..]);
        assert_eq!(store.hashes(AssetKind::Material), vec![a, b]);
        assert_eq!(store.len(AssetKind::Material), 2);
    }
}
