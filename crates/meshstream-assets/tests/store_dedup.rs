use meshstream_assets::{AssetError, AssetHash, AssetKind, AssetStore, ConfigBlob};
use meshstream_codec::TileGrid;
use std::sync::Arc;
use std::thread;

#[test]
fn same_payload_twice_yields_one_blob() {
    let store = AssetStore::new();
    let payload = vec![9u8; 1000];
    let first = store.put(AssetKind::Texture, payload.clone());
    let second = store.put(AssetKind::Texture, payload.clone());

    assert_eq!(first, second);
    assert_eq!(store.hashes(AssetKind::Texture), vec![first]);
    assert_eq!(&store.get(AssetKind::Texture, first).unwrap()[..], &payload[..]);
}

#[test]
fn first_writer_wins_on_hash_bucket() {
    let store = AssetStore::new();
    let hash = store.put(AssetKind::Mesh, &b"original"[..]);
    // Same bytes under another kind do not disturb the mesh entry
    store.put(AssetKind::Material, &b"original"[..]);
    store.put(AssetKind::Mesh, &b"original"[..]);
    assert_eq!(&store.get(AssetKind::Mesh, hash).unwrap()[..], b"original");
    assert_eq!(store.len(AssetKind::Mesh), 1);
}

#[test]
fn concurrent_writers_and_readers() {
    let store = Arc::new(AssetStore::new());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50u32 {
                    // Half the payloads are shared between threads
                    let payload = if i % 2 == 0 { i } else { i * 1000 + t };
                    let hash = store.put(AssetKind::Material, payload.to_le_bytes().to_vec());
                    assert!(store.contains(AssetKind::Material, hash));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 25 shared payloads plus 25 distinct ones per thread
    assert_eq!(store.len(AssetKind::Material), 25 + 25 * 8);
}

#[test]
fn config_reflects_store_contents() {
    let store = AssetStore::new();
    let tex = store.put(AssetKind::Texture, &b"tex"[..]);
    let mat = store.put(AssetKind::Material, &b"mat"[..]);
    let mesh_a = store.put(AssetKind::Mesh, &b"mesh a"[..]);
    let mesh_b = store.put(AssetKind::Mesh, &b"mesh b"[..]);

    let config =
        ConfigBlob::from_store(&store, TileGrid::new(2, 64), 42, &[mesh_a, mesh_b]).unwrap();
    let decoded = ConfigBlob::decode(&config.encode().unwrap()).unwrap();

    assert_eq!(decoded.timestamp, 42);
    assert_eq!(decoded.grid, TileGrid::new(2, 64));
    assert_eq!(decoded.textures, vec![tex]);
    assert_eq!(decoded.materials, vec![mat]);
    assert_eq!(decoded.meshes, vec![mesh_a, mesh_b]);
    assert_ne!(mesh_a, AssetHash(0));
}

#[test]
fn config_lists_identical_meshes_once_per_stream_slot() {
    let store = AssetStore::new();
    let cloth = store.put(AssetKind::Mesh, &b"cloth"[..]);
    let cape = store.put(AssetKind::Mesh, &b"cape"[..]);
    // The second cloth is byte-identical and deduplicated in the store
    assert_eq!(store.put(AssetKind::Mesh, &b"cloth"[..]), cloth);

    let config = ConfigBlob::from_store(&store, TileGrid::default(), 1, &[cloth, cape, cloth]).unwrap();
    assert_eq!(store.len(AssetKind::Mesh), 2);
    assert_eq!(config.meshes, vec![cloth, cape, cloth]);

    let ids: Vec<_> = config
        .entries()
        .filter(|(kind, _, _)| *kind == AssetKind::Mesh)
        .map(|(_, id, hash)| (id, hash))
        .collect();
    assert_eq!(ids, vec![(0, cloth), (1, cape), (2, cloth)]);
}

#[test]
fn config_rejects_mesh_missing_from_store() {
    let store = AssetStore::new();
    let err = ConfigBlob::from_store(&store, TileGrid::default(), 1, &[AssetHash(7)]).unwrap_err();
    assert!(matches!(
        err,
        AssetError::NotFound { kind: AssetKind::Mesh, hash: AssetHash(7) }
    ));
}

mod properties {
    use meshstream_assets::{AssetHash, AssetKind, AssetStore};
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn stored_blobs_are_keyed_by_their_crc(blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..16)) {
            let store = AssetStore::new();
            for blob in &blobs {
                let hash = store.put(AssetKind::Mesh, blob.clone());
                prop_assert_eq!(hash, AssetHash::of(blob));
                prop_assert!(store.contains(AssetKind::Mesh, hash));
            }

            let mut distinct: Vec<_> = blobs.iter().map(|b| AssetHash::of(b)).collect();
            distinct.sort_unstable_by_key(|h| h.0);
            distinct.dedup();
            prop_assert_eq!(store.len(AssetKind::Mesh), distinct.len());
        }
    }
}
