//! Frame body compression
//!
//! A frame body is either raw or compressed whole. The header's compression
//! flag names the algorithm, so a receiver never has to guess.

use crate::CodecError;
use std::io::{Read, Write};

/// Upper bound on an expanded frame body
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// Vertex bodies are small, so zstd can afford a higher level than its default
const ZSTD_LEVEL: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CompressionAlgorithm {
    /// Smaller keyframes
    #[cfg_attr(feature = "clap", value(name = "zstd"))]
    Zstd,
    /// Cheaper on the sender
    #[cfg_attr(feature = "clap", value(name = "lz4"))]
    Lz4,
}

impl CompressionAlgorithm {
    /// Value written into the frame header's compression flag
    pub fn wire_id(self) -> u8 {
        match self {
            CompressionAlgorithm::Zstd => 0x01,
            CompressionAlgorithm::Lz4 => 0x02,
        }
    }

    /// Parse a frame header compression flag. `Ok(None)` means a raw body.
    pub fn from_wire_id(id: u8) -> Result<Option<Self>, CodecError> {
        match id {
            0x00 => Ok(None),
            0x01 => Ok(Some(CompressionAlgorithm::Zstd)),
            0x02 => Ok(Some(CompressionAlgorithm::Lz4)),
            other => Err(CodecError::MalformedPacket(format!(
                "unknown compression flag {other:#04x}"
            ))),
        }
    }
}

/// Compresses and expands frame bodies with one algorithm
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
}

impl Compressor {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn compress(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => compress_zstd(body),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(body)),
        }
    }

    /// Expand a received body, at most [`MAX_DECOMPRESSED_LEN`] bytes. Every
    /// failure maps to [`CodecError::DecompressionFailure`] so the frame can be
    /// dropped without touching decoder state.
    pub fn decompress(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => decompress_zstd(body),
            CompressionAlgorithm::Lz4 => decompress_lz4(body),
        }
    }
}

fn compress_zstd(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)
        .map_err(|e| CodecError::CompressionError(format!("zstd encoder: {e}")))?;
    encoder
        .write_all(body)
        .map_err(|e| CodecError::CompressionError(format!("zstd write: {e}")))?;
    encoder
        .finish()
        .map_err(|e| CodecError::CompressionError(format!("zstd finish: {e}")))
}

fn decompress_zstd(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let decoder = zstd::Decoder::new(body)
        .map_err(|e| CodecError::DecompressionFailure(format!("zstd decoder: {e}")))?;

    let mut expanded = Vec::new();
    decoder
        .take(MAX_DECOMPRESSED_LEN as u64 + 1)
        .read_to_end(&mut expanded)
        .map_err(|e| CodecError::DecompressionFailure(format!("zstd body: {e}")))?;

    if expanded.len() > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::DecompressionFailure(format!(
            "zstd body expands past {MAX_DECOMPRESSED_LEN} bytes"
        )));
    }
    Ok(expanded)
}

fn decompress_lz4(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    // lz4_flex allocates from the size prefix, so bound it first
    let prefix: [u8; 4] = body
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| CodecError::DecompressionFailure("lz4 size prefix missing".into()))?;
    let declared = u32::from_le_bytes(prefix) as usize;
    if declared > MAX_DECOMPRESSED_LEN {
        return Err(CodecError::DecompressionFailure(format!(
            "lz4 body declares {declared} bytes"
        )));
    }

    lz4_flex::decompress_size_prepended(body)
        .map_err(|e| CodecError::DecompressionFailure(format!("lz4 body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_still_fragment_body_shrinks() {
        // Near-zero deltas all encode close to 128
        let body = [128u8, 128, 129, 127, 128, 128].repeat(200);
        for algorithm in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
            let compressor = Compressor::new(algorithm);
            let packed = compressor.compress(&body).unwrap();
            assert!(packed.len() < body.len(), "{algorithm:?}");
            assert_eq!(compressor.decompress(&packed).unwrap(), body);
        }
    }

    #[test]
    fn test_wire_ids() {
        for alg in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
            assert_eq!(
                CompressionAlgorithm::from_wire_id(alg.wire_id()).unwrap(),
                Some(alg)
            );
        }
        assert_eq!(CompressionAlgorithm::from_wire_id(0).unwrap(), None);
        assert!(CompressionAlgorithm::from_wire_id(7).is_err());
    }

    #[test]
    fn test_lz4_oversized_prefix_rejected() {
        let compressor = Compressor::new(CompressionAlgorithm::Lz4);
        let bogus = [0xFF, 0xFF, 0xFF, 0x7F, 0x00];
        assert!(matches!(
            compressor.decompress(&bogus),
            Err(CodecError::DecompressionFailure(_))
        ));
    }
}
