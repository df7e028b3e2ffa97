use bytes::Bytes;
use meshstream_assets::AssetKind;
use meshstream_network::{Message, NetworkError, CHUNK_SIZE};
use meshstream_sync::{chunk_blob, Reassembly};
use test_case::test_case;

#[test_case(0, 1 ; "empty")]
#[test_case(1, 1 ; "one byte")]
#[test_case(CHUNK_SIZE, 1 ; "exactly one chunk")]
#[test_case(CHUNK_SIZE + 1, 2 ; "one byte over")]
#[test_case(CHUNK_SIZE * 255, 255 ; "largest allowed")]
fn test_chunk_count(len: usize, expected: usize) {
    let blob = Bytes::from(vec![0xA5u8; len]);
    let chunks = chunk_blob(AssetKind::Texture, 1, &blob).unwrap();
    assert_eq!(chunks.len(), expected);

    // Headers carry 1-based indices and the shared total
    for (i, chunk) in chunks.iter().enumerate() {
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[1], 1);
        assert_eq!(usize::from(bytes[2]), expected);
        assert_eq!(usize::from(bytes[3]), i + 1);
        assert_eq!(bytes[4], 0);
    }
}

#[test]
fn test_too_many_chunks() {
    let blob = Bytes::from(vec![0u8; CHUNK_SIZE * 255 + 1]);
    assert!(matches!(
        chunk_blob(AssetKind::Mesh, 0, &blob),
        Err(NetworkError::AssetTooLarge { len }) if len == CHUNK_SIZE * 255 + 1
    ));
}

#[test_case(10 ; "small")]
#[test_case(CHUNK_SIZE * 3 + 17 ; "several chunks")]
fn test_chunks_reassemble(len: usize) {
    let blob = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>());
    let mut reassembly = Reassembly::new(AssetKind::Material, 4);
    let mut complete = None;

    for chunk in chunk_blob(AssetKind::Material, 4, &blob).unwrap() {
        let Message::Chunk {
            kind,
            object_id,
            total,
            index,
            payload,
        } = Message::from_bytes(chunk.to_bytes().unwrap()).unwrap()
        else {
            panic!("not a chunk");
        };
        assert!(complete.is_none());
        complete = reassembly
            .push(kind, object_id, total, index, &payload)
            .unwrap();
    }

    assert_eq!(complete, Some(blob));
}
