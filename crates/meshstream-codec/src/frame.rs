//! Keyframe and fragment packets
//!
//! Every vertex-stream packet starts with a 21-byte header:
//!
//! ```text
//! [0]      type (0x0F keyframe, 0x0E fragment)
//! [1..5]   timestamp, u32 LE
//! [5..8]   tile count, u24 LE (0 for fragments)
//! [8]      compression flag (0 raw, 1 zstd, 2 lz4)
//! [9..21]  root translation, 3 x f32 LE
//! ```
//!
//! A keyframe body is a sequence of tile blocks, each a 3-byte tile coordinate,
//! a u24 vertex count and 5-byte vertex records. A fragment body holds one
//! 3-byte delta per entry of the [`LinedIndex`] built by the last keyframe.

use crate::compress::{CompressionAlgorithm, Compressor};
use crate::quantize::{
    decode_fragment_delta, dequantize, encode_fragment_delta, LocalOffset, Position, TileGrid,
    TileId,
};
use crate::tiling::{CpuTiler, Tiler, Transform};
use crate::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

pub const KEYFRAME_TYPE: u8 = 0x0F;
pub const FRAGMENT_TYPE: u8 = 0x0E;

pub const FRAME_HEADER_LEN: usize = 21;
pub const TILE_HEADER_LEN: usize = 6;
pub const VERTEX_RECORD_LEN: usize = 5;
pub const DELTA_RECORD_LEN: usize = 3;

const MAX_U24: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Keyframe,
    Fragment,
}

impl FrameKind {
    pub fn type_byte(self) -> u8 {
        match self {
            FrameKind::Keyframe => KEYFRAME_TYPE,
            FrameKind::Fragment => FRAGMENT_TYPE,
        }
    }

    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            KEYFRAME_TYPE => Some(FrameKind::Keyframe),
            FRAGMENT_TYPE => Some(FrameKind::Fragment),
            _ => None,
        }
    }
}

/// A vertex slot addressed by mesh and vertex index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexRef {
    pub mesh: u8,
    pub vertex: u16,
}

impl VertexRef {
    pub fn new(mesh: u8, vertex: u16) -> Self {
        Self { mesh, vertex }
    }
}

/// Vertex order established by a keyframe and consumed by every fragment
/// until the next keyframe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinedIndex {
    entries: Vec<VertexRef>,
}

impl LinedIndex {
    pub fn push(&mut self, vertex: VertexRef) {
        self.entries.push(vertex);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VertexRef> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[VertexRef] {
        &self.entries
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub timestamp: u32,
    pub tile_count: u32,
    pub compression: Option<CompressionAlgorithm>,
    pub position: Position,
}

impl FrameHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind.type_byte());
        buf.put_u32_le(self.timestamp);
        buf.put_uint_le(u64::from(self.tile_count & MAX_U24), 3);
        buf.put_u8(self.compression.map_or(0, CompressionAlgorithm::wire_id));
        for axis in self.position {
            buf.put_f32_le(axis);
        }
    }

    pub fn parse(packet: &[u8]) -> Result<Self, CodecError> {
        if packet.len() < FRAME_HEADER_LEN {
            return Err(CodecError::MalformedPacket(format!(
                "{} bytes is shorter than the frame header",
                packet.len()
            )));
        }

        let mut buf = &packet[..FRAME_HEADER_LEN];
        let type_byte = buf.get_u8();
        let kind = FrameKind::from_type_byte(type_byte).ok_or_else(|| {
            CodecError::MalformedPacket(format!("unknown frame type {type_byte:#04x}"))
        })?;
        let timestamp = buf.get_u32_le();
        let tile_count = buf.get_uint_le(3) as u32;
        let compression = CompressionAlgorithm::from_wire_id(buf.get_u8())?;
        let position = [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()];

        Ok(Self {
            kind,
            timestamp,
            tile_count,
            compression,
            position,
        })
    }
}

/// One mesh as sampled by the sender for a tick
#[derive(Debug, Clone, PartialEq)]
pub struct MeshSample {
    /// Mesh-local vertex positions
    pub vertices: Vec<Position>,
    /// Mesh transform relative to the streamed root
    pub transform: Transform,
}

/// A frame ready to go out, in raw and optionally compressed form
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub kind: FrameKind,
    pub timestamp: u32,
    pub tile_count: u32,
    pub position: Position,
    pub raw: Bytes,
    pub compressed: Option<(CompressionAlgorithm, Bytes)>,
}

impl EncodedFrame {
    /// Serialize with the compressed body when the peer accepts it and one was
    /// prepared, the raw body otherwise.
    pub fn to_packet(&self, use_compression: bool) -> Bytes {
        let (compression, body) = match (&self.compressed, use_compression) {
            (Some((alg, bytes)), true) => (Some(*alg), bytes),
            _ => (None, &self.raw),
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameHeader {
            kind: self.kind,
            timestamp: self.timestamp,
            tile_count: self.tile_count,
            compression,
            position: self.position,
        }
        .write_to(&mut buf);
        buf.extend_from_slice(body);
        buf.freeze()
    }
}

/// Sender-side frame builder with keyframe cadence
pub struct FrameEncoder<T: Tiler = CpuTiler> {
    grid: TileGrid,
    subframes_per_keyframe: u32,
    frame_counter: u32,
    timestamp: u32,
    lined_index: LinedIndex,
    previous: Vec<MeshSample>,
    tiler: T,
    compressor: Option<Compressor>,
}

impl FrameEncoder<CpuTiler> {
    pub fn new(grid: TileGrid, subframes_per_keyframe: u32) -> Self {
        Self::with_tiler(grid, subframes_per_keyframe, CpuTiler)
    }
}

impl<T: Tiler> FrameEncoder<T> {
    pub fn with_tiler(grid: TileGrid, subframes_per_keyframe: u32, tiler: T) -> Self {
        Self {
            grid,
            subframes_per_keyframe,
            frame_counter: 0,
            timestamp: 0,
            lined_index: LinedIndex::default(),
            previous: Vec::new(),
            tiler,
            compressor: None,
        }
    }

    /// Also prepare a compressed body for every frame
    pub fn with_compression(mut self, algorithm: Option<CompressionAlgorithm>) -> Self {
        self.compressor = algorithm.map(Compressor::new);
        self
    }

    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    pub fn lined_index(&self) -> &LinedIndex {
        &self.lined_index
    }

    /// Make the next encoded frame a keyframe
    pub fn force_keyframe(&mut self) {
        self.frame_counter = 0;
    }

    /// Encode one tick. Every `subframes_per_keyframe + 1`-th call produces a
    /// keyframe, the others produce fragments against the previous tick.
    pub fn encode(
        &mut self,
        samples: Vec<MeshSample>,
        position: Position,
    ) -> Result<EncodedFrame, CodecError> {
        let kind = if self.frame_counter == 0 || self.previous.len() != samples.len() {
            FrameKind::Keyframe
        } else {
            FrameKind::Fragment
        };

        let (body, tile_count) = match kind {
            FrameKind::Keyframe => {
                let (body, tile_count, lined_index) = self.build_keyframe(&samples)?;
                self.lined_index = lined_index;
                self.frame_counter = 0;
                (body, tile_count)
            }
            FrameKind::Fragment => (self.build_fragment(&samples), 0),
        };

        let compressed = match &self.compressor {
            Some(compressor) => match compressor.compress(&body) {
                Ok(bytes) => Some((compressor.algorithm(), Bytes::from(bytes))),
                Err(e) => {
                    warn!("Compression failed, frame goes out raw: {e}");
                    None
                }
            },
            None => None,
        };

        let frame = EncodedFrame {
            kind,
            timestamp: self.timestamp,
            tile_count,
            position,
            raw: body.freeze(),
            compressed,
        };
        trace!(
            "Encoded {:?} #{} ({} bytes raw, {} tiles)",
            frame.kind,
            frame.timestamp,
            frame.raw.len(),
            frame.tile_count
        );

        self.previous = samples;
        self.timestamp = self.timestamp.wrapping_add(1);
        self.frame_counter = (self.frame_counter + 1) % self.subframes_per_keyframe.saturating_add(1);

        Ok(frame)
    }

    fn build_keyframe(
        &self,
        samples: &[MeshSample],
    ) -> Result<(BytesMut, u32, LinedIndex), CodecError> {
        let mut blocks: BTreeMap<u32, (TileId, Vec<(VertexRef, LocalOffset)>)> = BTreeMap::new();

        for (mesh_index, sample) in samples.iter().enumerate() {
            let mesh =
                u8::try_from(mesh_index).map_err(|_| CodecError::TooManyMeshes(samples.len()))?;
            let tiled = self
                .tiler
                .tile(&sample.vertices, &sample.transform, self.grid);

            for (vertex_index, tiled_vertex) in tiled.into_iter().enumerate() {
                let Some(tiled_vertex) = tiled_vertex else {
                    continue;
                };
                if tiled_vertex.tile.is_excluded() {
                    continue;
                }
                let Ok(vertex) = u16::try_from(vertex_index) else {
                    break;
                };
                blocks
                    .entry(self.grid.pack(tiled_vertex.tile))
                    .or_insert_with(|| (tiled_vertex.tile, Vec::new()))
                    .1
                    .push((VertexRef::new(mesh, vertex), tiled_vertex.local));
            }
        }

        let mut body = BytesMut::new();
        let mut lined_index = LinedIndex::default();
        for (tile, records) in blocks.values() {
            let count = u32::try_from(records.len())
                .ok()
                .filter(|c| *c <= MAX_U24)
                .ok_or_else(|| {
                    CodecError::MalformedPacket(format!(
                        "tile holds {} vertices, more than a u24 count",
                        records.len()
                    ))
                })?;

            body.put_slice(&tile.to_array());
            body.put_uint_le(u64::from(count), 3);
            for (vertex_ref, local) in records {
                body.put_u16_le(vertex_ref.vertex);
                body.put_u8(vertex_ref.mesh);
                body.put_u16_le(local.pack());
                lined_index.push(*vertex_ref);
            }
        }

        Ok((body, blocks.len() as u32, lined_index))
    }

    fn build_fragment(&self, samples: &[MeshSample]) -> BytesMut {
        let deltas: Vec<Vec<Position>> = samples
            .iter()
            .zip(&self.previous)
            .map(|(now, before)| {
                self.tiler.diff(
                    &now.vertices,
                    &before.vertices,
                    &now.transform,
                    &before.transform,
                )
            })
            .collect();

        let mut body = BytesMut::with_capacity(self.lined_index.len() * DELTA_RECORD_LEN);
        for vertex_ref in self.lined_index.iter() {
            let delta = deltas
                .get(usize::from(vertex_ref.mesh))
                .and_then(|mesh| mesh.get(usize::from(vertex_ref.vertex)))
                .copied()
                .unwrap_or([0.0; 3]);
            for axis in delta {
                body.put_u8(encode_fragment_delta(axis));
            }
        }
        body
    }
}

/// Result of applying one packet on the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFrame {
    pub kind: FrameKind,
    pub timestamp: u32,
    /// Vertex slots written by this frame
    pub vertices: usize,
}

/// Receiver-side vertex buffers rebuilt from keyframes and fragments
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    grid: TileGrid,
    current: Vec<Vec<Position>>,
    previous: Vec<Vec<Position>>,
    position: Position,
    previous_position: Position,
    lined_index: LinedIndex,
    has_keyframe: bool,
    /// Mesh slots with no synchronized asset
    absent: Vec<bool>,
}

impl FrameDecoder {
    /// Buffers are sized once from the synchronized mesh assets
    pub fn new(grid: TileGrid, vertex_counts: &[usize]) -> Self {
        let slots: Vec<Option<usize>> = vertex_counts.iter().copied().map(Some).collect();
        Self::with_mesh_slots(grid, &slots)
    }

    /// One slot per mesh index in the stream. Vertices addressed to a `None`
    /// slot are accepted and dropped, so the remaining meshes still decode.
    pub fn with_mesh_slots(grid: TileGrid, slots: &[Option<usize>]) -> Self {
        let current: Vec<Vec<Position>> = slots
            .iter()
            .map(|count| vec![[0.0; 3]; count.unwrap_or(0)])
            .collect();
        Self {
            grid,
            previous: current.clone(),
            current,
            position: [0.0; 3],
            previous_position: [0.0; 3],
            lined_index: LinedIndex::default(),
            has_keyframe: false,
            absent: slots.iter().map(Option::is_none).collect(),
        }
    }

    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    pub fn current(&self) -> &[Vec<Position>] {
        &self.current
    }

    /// Buffers as they were before the most recent frame
    pub fn previous(&self) -> &[Vec<Position>] {
        &self.previous
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn previous_position(&self) -> Position {
        self.previous_position
    }

    pub fn lined_index(&self) -> &LinedIndex {
        &self.lined_index
    }

    pub fn has_keyframe(&self) -> bool {
        self.has_keyframe
    }

    /// Forget the current keyframe epoch; fragments are ignored until the next keyframe
    pub fn reset_epoch(&mut self) {
        self.lined_index.clear();
        self.has_keyframe = false;
    }

    /// Apply one vertex-stream packet. On any error the buffers are left
    /// untouched.
    pub fn apply(&mut self, packet: &[u8]) -> Result<AppliedFrame, CodecError> {
        let header = FrameHeader::parse(packet)?;
        let payload = &packet[FRAME_HEADER_LEN..];

        let expanded: Vec<u8>;
        let body: &[u8] = match header.compression {
            Some(algorithm) => {
                expanded = Compressor::new(algorithm).decompress(payload)?;
                &expanded
            }
            None => payload,
        };

        let applied = match header.kind {
            FrameKind::Keyframe => self.apply_keyframe(&header, body)?,
            FrameKind::Fragment => self.apply_fragment(&header, body)?,
        };
        debug!(
            "Applied {:?} #{} to {} vertices",
            applied.kind, applied.timestamp, applied.vertices
        );
        Ok(applied)
    }

    fn apply_keyframe(
        &mut self,
        header: &FrameHeader,
        body: &[u8],
    ) -> Result<AppliedFrame, CodecError> {
        let mut buf = body;
        let mut staged = Vec::new();
        let mut lined_index = LinedIndex::default();

        for _ in 0..header.tile_count {
            ensure_remaining(buf, TILE_HEADER_LEN, "tile header")?;
            let tile = TileId::new(buf.get_u8(), buf.get_u8(), buf.get_u8());
            let count = buf.get_uint_le(3) as usize;
            ensure_remaining(buf, count * VERTEX_RECORD_LEN, "vertex records")?;

            for _ in 0..count {
                let vertex = buf.get_u16_le();
                let mesh = buf.get_u8();
                let local = LocalOffset::unpack(buf.get_u16_le());
                let vertex_ref = VertexRef::new(mesh, vertex);
                if self.check_slot(vertex_ref)? {
                    staged.push((vertex_ref, dequantize(tile, local, self.grid)));
                }
                lined_index.push(vertex_ref);
            }
        }

        if buf.has_remaining() {
            return Err(CodecError::MalformedPacket(format!(
                "{} trailing bytes after {} tiles",
                buf.remaining(),
                header.tile_count
            )));
        }

        self.snapshot();
        for (vertex_ref, position) in &staged {
            self.current[usize::from(vertex_ref.mesh)][usize::from(vertex_ref.vertex)] = *position;
        }
        self.lined_index = lined_index;
        self.position = header.position;
        self.has_keyframe = true;

        Ok(AppliedFrame {
            kind: FrameKind::Keyframe,
            timestamp: header.timestamp,
            vertices: staged.len(),
        })
    }

    fn apply_fragment(
        &mut self,
        header: &FrameHeader,
        body: &[u8],
    ) -> Result<AppliedFrame, CodecError> {
        if !self.has_keyframe {
            return Err(CodecError::FragmentBeforeKeyframe);
        }

        let expected = self.lined_index.len() * DELTA_RECORD_LEN;
        if body.len() != expected {
            return Err(CodecError::MalformedPacket(format!(
                "fragment body is {} bytes, keyframe epoch expects {expected}",
                body.len()
            )));
        }

        self.snapshot();
        // Slots were bounds-checked when the keyframe built the index; only
        // absent meshes miss here
        for (vertex_ref, record) in self
            .lined_index
            .iter()
            .zip(body.chunks_exact(DELTA_RECORD_LEN))
        {
            let Some(slot) = self
                .current
                .get_mut(usize::from(vertex_ref.mesh))
                .and_then(|mesh| mesh.get_mut(usize::from(vertex_ref.vertex)))
            else {
                continue;
            };
            for axis in 0..3 {
                slot[axis] += decode_fragment_delta(record[axis]);
            }
        }
        self.position = header.position;

        Ok(AppliedFrame {
            kind: FrameKind::Fragment,
            timestamp: header.timestamp,
            vertices: self.lined_index.len(),
        })
    }

    /// `Ok(false)` for a vertex of an absent mesh
    fn check_slot(&self, vertex_ref: VertexRef) -> Result<bool, CodecError> {
        let mesh = usize::from(vertex_ref.mesh);
        if self.absent.get(mesh).copied().unwrap_or(false) {
            return Ok(false);
        }
        let in_range = self
            .current
            .get(mesh)
            .is_some_and(|buffer| usize::from(vertex_ref.vertex) < buffer.len());
        if in_range {
            Ok(true)
        } else {
            Err(CodecError::VertexOutOfRange {
                mesh: vertex_ref.mesh,
                vertex: vertex_ref.vertex,
            })
        }
    }

    fn snapshot(&mut self) {
        self.previous.clone_from(&self.current);
        self.previous_position = self.position;
    }
}

fn ensure_remaining(buf: &[u8], needed: usize, what: &str) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::MalformedPacket(format!(
            "{what}: need {needed} bytes, {} left",
            buf.len()
        )));
    }
    Ok(())
}

/// Type byte of a vertex-stream packet without parsing the rest
pub fn peek_kind(packet: &[u8]) -> Option<FrameKind> {
    packet.first().copied().and_then(FrameKind::from_type_byte)
}
