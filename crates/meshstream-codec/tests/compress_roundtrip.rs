use meshstream_codec::compress::{CompressionAlgorithm, Compressor};
use meshstream_codec::CodecError;

#[test]
fn compressor_roundtrip_frame_bodies() {
    // A fragment body of mostly-still vertices and a noisy keyframe body
    let still = [128u8, 128, 128].repeat(2048);
    let noisy: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();

    for alg in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
        let c = Compressor::new(alg);
        for data in [still.as_slice(), noisy.as_slice(), &[][..]] {
            let compressed = c.compress(data).expect("compress");
            let decompressed = c.decompress(&compressed).expect("decompress");
            assert_eq!(decompressed.as_slice(), data);
        }
    }
}

#[test]
fn garbage_input_is_a_decompression_failure() {
    for alg in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
        let result = Compressor::new(alg).decompress(&[0x01, 0x00, 0x00, 0x00, 0xFF, 0xFE]);
        assert!(
            matches!(result, Err(CodecError::DecompressionFailure(_))),
            "{alg:?} accepted garbage"
        );
    }
}
