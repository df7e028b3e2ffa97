use bytes::Bytes;
use meshstream_assets::{AssetHash, AssetKind, AssetStore, ConfigBlob, ShaderTable};
use meshstream_codec::TileGrid;
use meshstream_network::{Message, CHUNK_SIZE};
use meshstream_sync::{AssetFetcher, AssetPublisher, FetchPhase, FetcherConfig, SyncError};
use meshstream_test_utils::{init_test_logging, populated_store, AssetSet};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::time::Instant;

/// Push a message through its wire form
fn wire(message: &Message) -> Message {
    Message::from_bytes(message.to_bytes().unwrap()).unwrap()
}

#[derive(Default)]
struct Transcript {
    fetches: Vec<(AssetKind, u8)>,
    chunks: usize,
    misses: usize,
    ready: Option<bool>,
}

/// Run requests and responses until the fetcher stops asking
fn run(
    publisher: &AssetPublisher,
    fetcher: &mut AssetFetcher,
    first: Option<Message>,
) -> Result<Transcript, SyncError> {
    let mut transcript = Transcript::default();
    let mut outgoing = first;

    while let Some(request) = outgoing.take() {
        let request = wire(&request);
        match &request {
            Message::Ready {
                accepts_compression,
            } => {
                transcript.ready = Some(*accepts_compression);
                break;
            }
            Message::Fetch {
                kind, object_id, ..
            } => {
                // One request at a time
                assert_eq!(fetcher.in_flight().map(|r| r.object_id), Some(*object_id));
                transcript.fetches.push((*kind, *object_id));
            }
            _ => {}
        }

        let responses = publisher.respond(&request)?.unwrap_or_default();
        for response in responses {
            match &response {
                Message::Chunk { .. } => transcript.chunks += 1,
                Message::Miss { .. } => transcript.misses += 1,
                _ => {}
            }
            if let Some(next) = fetcher.on_message(&wire(&response), Instant::now())? {
                assert!(outgoing.is_none(), "fetcher issued two requests at once");
                outgoing = Some(next);
            }
        }
    }
    Ok(transcript)
}

fn new_fetcher(config: FetcherConfig) -> AssetFetcher {
    AssetFetcher::new(config, Arc::new(AssetStore::new()), ShaderTable::default())
}

#[test]
fn test_full_sync_in_kind_order() {
    init_test_logging();
    let (store, set) = populated_store(&[(4, 4), (3, 5)]);
    let publisher = AssetPublisher::new(store, TileGrid::default(), 9, &set.mesh_hashes()).unwrap();
    let mut fetcher = new_fetcher(FetcherConfig::default());

    let config = wire(&publisher.config_message());
    let first = fetcher.on_message(&config, Instant::now()).unwrap();
    let transcript = run(&publisher, &mut fetcher, first).unwrap();

    assert_eq!(
        transcript.fetches,
        vec![
            (AssetKind::Texture, 0),
            (AssetKind::Material, 0),
            (AssetKind::Mesh, 0),
            (AssetKind::Mesh, 1),
        ]
    );
    assert_eq!(transcript.ready, Some(true));
    assert_eq!(transcript.misses, 0);
    assert!(fetcher.is_ready());

    assert_eq!(fetcher.vertex_counts(), vec![Some(16), Some(15)]);
    let mirror = fetcher.mirror();
    assert!(mirror.texture("checker").is_some());
    let skin = mirror.material("skin").unwrap();
    assert_eq!(skin.shader, "Standard");
    assert!(skin.missing_textures.is_empty());
    assert!(mirror
        .meshes()
        .all(|mesh| mesh.materials == vec![Some("skin".to_string())]));

    for (hash, _) in &set.meshes {
        assert!(fetcher.store().contains(AssetKind::Mesh, *hash));
    }
    assert_eq!(fetcher.transferred(), 4);
}

#[test]
fn test_local_blobs_are_not_requested_again() {
    let (store, set) = populated_store(&[(4, 4)]);
    let publisher = AssetPublisher::new(store, TileGrid::default(), 1, &set.mesh_hashes()).unwrap();
    let mut fetcher = new_fetcher(FetcherConfig::default());

    let first = fetcher.on_message(&publisher.config_message(), Instant::now()).unwrap();
    run(&publisher, &mut fetcher, first).unwrap();
    assert_eq!(fetcher.transferred(), 3);

    // Reconnect: same local store, fresh session
    fetcher.reset();
    assert_eq!(fetcher.mirror().mesh_count(), 0);
    let first = fetcher.on_message(&publisher.config_message(), Instant::now()).unwrap();
    assert_eq!(
        first,
        Some(Message::Ready {
            accepts_compression: true
        })
    );
    assert_eq!(fetcher.transferred(), 3);
    assert_eq!(fetcher.mirror().mesh_count(), 1);
}

/// Noise does not compress, so the PNG spans several chunks
fn noise_texture() -> Bytes {
    let mut state = 0x1234_5678u32;
    let image = image::RgbaImage::from_fn(256, 256, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        image::Rgba(state.to_le_bytes())
    });
    let texture = meshstream_assets::TextureBlob::from_rgba("noise", &image)
        .unwrap()
        .encode();
    assert!(texture.len() > CHUNK_SIZE * 2);
    texture
}

#[test]
fn test_multi_chunk_texture() {
    let texture = noise_texture();
    let store = Arc::new(AssetStore::new());
    store.put(AssetKind::Texture, texture.clone());
    let publisher = AssetPublisher::new(store, TileGrid::default(), 1, &[]).unwrap();
    let mut fetcher = new_fetcher(FetcherConfig::default());

    let first = fetcher.on_message(&publisher.config_message(), Instant::now()).unwrap();
    let transcript = run(&publisher, &mut fetcher, first).unwrap();

    assert_eq!(transcript.chunks, texture.len().div_ceil(CHUNK_SIZE));
    assert_eq!(fetcher.mirror().texture("noise").unwrap().dimensions(), (256, 256));
}

#[test]
fn test_disconnect_mid_transfer_discards_partial_blob() {
    init_test_logging();
    let texture = noise_texture();
    let hash = AssetHash::of(&texture);
    let store = Arc::new(AssetStore::new());
    store.put(AssetKind::Texture, texture);
    let publisher = AssetPublisher::new(store, TileGrid::default(), 1, &[]).unwrap();
    let mut fetcher = new_fetcher(FetcherConfig::default());
    let now = Instant::now();

    let fetch = fetcher.on_message(&publisher.config_message(), now).unwrap().unwrap();
    let chunks = publisher.respond(&fetch).unwrap().unwrap();
    assert!(chunks.len() > 2);
    for chunk in &chunks[..2] {
        assert_eq!(fetcher.on_message(&wire(chunk), now).unwrap(), None);
    }

    fetcher.reset();
    assert!(fetcher.in_flight().is_none());
    assert_eq!(fetcher.phase(), FetchPhase::AwaitingConfig);
    assert!(!fetcher.store().contains(AssetKind::Texture, hash));
    assert_eq!(fetcher.transferred(), 0);

    // A chunk still on the wire from the old session is refused
    assert!(matches!(
        fetcher.on_message(&wire(&chunks[2]), now),
        Err(SyncError::UnexpectedChunk { .. })
    ));

    // Reconnect: the same request starts over from the first chunk
    let refetch = fetcher.on_message(&publisher.config_message(), now).unwrap();
    assert_eq!(refetch, Some(fetch));
    let transcript = run(&publisher, &mut fetcher, refetch).unwrap();
    assert_eq!(transcript.chunks, chunks.len());
    assert_eq!(transcript.ready, Some(true));
    assert_eq!(fetcher.transferred(), 1);
    assert!(fetcher.store().contains(AssetKind::Texture, hash));
    assert_eq!(fetcher.mirror().texture("noise").unwrap().dimensions(), (256, 256));
}

#[test]
fn test_miss_then_resend_succeeds_once_blob_exists() {
    let set = AssetSet::new(&[]);
    let (hash, texture) = set.texture.clone();

    // The sender advertises a texture it does not hold yet
    let sender_store = Arc::new(AssetStore::new());
    let publisher =
        AssetPublisher::new(Arc::clone(&sender_store), TileGrid::default(), 1, &[]).unwrap();
    let advert = ConfigBlob {
        timestamp: 1,
        grid: TileGrid::default(),
        textures: vec![hash],
        materials: Vec::new(),
        meshes: Vec::new(),
    };
    let mut fetcher = new_fetcher(FetcherConfig::default());
    let fetch = fetcher.on_config(advert, Instant::now()).unwrap();

    let miss = publisher.respond(&fetch).unwrap().unwrap();
    assert_eq!(miss[0].to_bytes().unwrap().as_ref(), &[0x24, 0, 0, 0, 0]);

    let resend = fetcher.on_message(&wire(&miss[0]), Instant::now()).unwrap();
    assert_eq!(resend, Some(fetch));

    sender_store.put(AssetKind::Texture, texture);
    let transcript = run(&publisher, &mut fetcher, resend).unwrap();
    assert_eq!(transcript.fetches.len(), 1);
    assert_eq!(transcript.misses, 0);
    assert_eq!(transcript.ready, Some(true));
}

#[test]
fn test_bounded_miss_retries_give_up() {
    let publisher =
        AssetPublisher::new(Arc::new(AssetStore::new()), TileGrid::default(), 1, &[]).unwrap();
    let advert = ConfigBlob {
        timestamp: 1,
        grid: TileGrid::default(),
        textures: Vec::new(),
        materials: Vec::new(),
        meshes: vec![AssetHash(0xAABBCCDD)],
    };
    let mut fetcher = new_fetcher(FetcherConfig {
        max_miss_retries: Some(2),
        ..FetcherConfig::default()
    });

    let mut outgoing = fetcher.on_config(advert, Instant::now());
    let mut sent = 0;
    let error = loop {
        let request = outgoing.take().expect("fetcher went quiet");
        sent += 1;
        let miss = publisher.respond(&request).unwrap().unwrap();
        match fetcher.on_message(&miss[0], Instant::now()) {
            Ok(next) => outgoing = next,
            Err(e) => break e,
        }
    };

    assert_eq!(sent, 3);
    assert!(matches!(
        error,
        SyncError::AssetUnavailable {
            kind: AssetKind::Mesh,
            hash: AssetHash(0xAABBCCDD),
            attempts: 3
        }
    ));
    assert_eq!(fetcher.unavailable().len(), 1);

    // The queue moves on without the missing mesh
    assert_eq!(
        fetcher.poll(Instant::now()),
        Some(Message::Ready {
            accepts_compression: true
        })
    );
    assert_eq!(fetcher.phase(), FetchPhase::StreamReady);
}

#[test]
fn test_corrupt_blob_is_requested_again() {
    let set = AssetSet::new(&[(2, 2)]);
    let (hash, mesh) = set.meshes[0].clone();
    let advert = ConfigBlob {
        timestamp: 1,
        grid: TileGrid::default(),
        textures: Vec::new(),
        materials: Vec::new(),
        meshes: vec![hash],
    };
    let mut fetcher = new_fetcher(FetcherConfig::default());
    let fetch = fetcher.on_config(advert, Instant::now());

    let mut corrupted = mesh.to_vec();
    corrupted[0] ^= 0xFF;
    let chunk = Message::Chunk {
        kind: AssetKind::Mesh,
        object_id: 0,
        total: 1,
        index: 1,
        payload: Bytes::from(corrupted),
    };
    assert_eq!(fetcher.on_message(&chunk, Instant::now()).unwrap(), fetch);
    assert!(!fetcher.store().contains(AssetKind::Mesh, hash));
}

#[test]
fn test_resend_config_answered() {
    let (store, set) = populated_store(&[(2, 2)]);
    let publisher = AssetPublisher::new(store, TileGrid::new(8, 200), 5, &set.mesh_hashes()).unwrap();
    let response = publisher.respond(&wire(&Message::ResendConfig)).unwrap().unwrap();
    match &response[..] {
        [Message::Config(config)] => {
            assert_eq!(config.grid, TileGrid::new(8, 200));
            assert_eq!(config.asset_count(), 3);
        }
        other => panic!("unexpected response {other:?}"),
    }
}
