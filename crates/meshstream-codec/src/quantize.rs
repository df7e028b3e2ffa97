//! Tile-grid quantization of vertex positions
//!
//! A position is split into a coarse tile coordinate (one byte per axis) and a
//! 5-bit offset inside that tile. Fragment deltas use a single byte per axis on
//! a signed power curve that is finer near zero.

/// A position in the sender's root-relative space
pub type Position = [f32; 3];

/// Tile axis value reserved for "vertex excluded"
pub const EXCLUDED_AXIS: u8 = 255;

/// Fractional steps per tile axis (5 bits)
pub const LOCAL_STEPS: u8 = 32;

/// Largest tile-grid edge that still fits one byte per axis
pub const MAX_PACKAGE_SIZE: u8 = 255;

/// Tile grid parameterization shared by sender and receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    /// Quantization resolution inside a tile
    pub area_range: u8,
    /// Tiles per axis
    pub package_size: u8,
}

impl Default for TileGrid {
    fn default() -> Self {
        Self {
            area_range: 4,
            package_size: 128,
        }
    }
}

impl TileGrid {
    /// Create a grid. A zero area range is raised to 1.
    pub fn new(area_range: u8, package_size: u8) -> Self {
        Self {
            area_range: area_range.max(1),
            package_size,
        }
    }

    /// Half the grid edge, in tiles
    pub fn half(&self) -> i32 {
        i32::from(self.package_size) / 2
    }

    /// Tiles per world unit. Integer division, never below 1.
    pub fn quantum(&self) -> i32 {
        (self.half() / i32::from(self.area_range.max(1))).max(1)
    }

    /// Largest absolute error of a keyframe round trip, per axis
    pub fn resolution(&self) -> f32 {
        1.0 / (f32::from(LOCAL_STEPS) * self.quantum() as f32)
    }

    /// Pack a tile id into its 24-bit mapping key
    pub fn pack(&self, tile: TileId) -> u32 {
        let size = u32::from(self.package_size);
        u32::from(tile.x) + u32::from(tile.y) * size + u32::from(tile.z) * size * size
    }
}

/// Coarse tile coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileId {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl TileId {
    pub const EXCLUDED: TileId = TileId {
        x: EXCLUDED_AXIS,
        y: EXCLUDED_AXIS,
        z: EXCLUDED_AXIS,
    };

    pub fn new(x: u8, y: u8, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Any axis carrying the sentinel marks the vertex as not representable
    pub fn is_excluded(&self) -> bool {
        self.x == EXCLUDED_AXIS || self.y == EXCLUDED_AXIS || self.z == EXCLUDED_AXIS
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.x, self.y, self.z]
    }
}

/// 5-bit offset inside a tile, one value per axis in `0..32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalOffset {
    pub x: u8,
    pub y: u8,
    pub z: u8,
}

impl LocalOffset {
    /// Returns `None` when any axis is outside `0..32`
    pub fn new(x: u8, y: u8, z: u8) -> Option<Self> {
        (x < LOCAL_STEPS && y < LOCAL_STEPS && z < LOCAL_STEPS).then_some(Self { x, y, z })
    }

    /// Bits `[0:5)` x, `[5:10)` y, `[10:15)` z
    pub fn pack(&self) -> u16 {
        u16::from(self.x & 0x1F) | (u16::from(self.y & 0x1F) << 5) | (u16::from(self.z & 0x1F) << 10)
    }

    pub fn unpack(packed: u16) -> Self {
        Self {
            x: (packed & 0x1F) as u8,
            y: ((packed >> 5) & 0x1F) as u8,
            z: ((packed >> 10) & 0x1F) as u8,
        }
    }

    pub fn to_array(self) -> [u8; 3] {
        [self.x, self.y, self.z]
    }
}

/// Quantize a transformed position. Returns `None` when the position falls
/// outside the grid and must be excluded from the keyframe.
pub fn quantize(position: Position, grid: TileGrid) -> Option<(TileId, LocalOffset)> {
    let quantum = grid.quantum() as f32;
    let half = i64::from(grid.half());
    let mut tile = [0u8; 3];
    let mut local = [0u8; 3];

    for axis in 0..3 {
        let scaled = position[axis] * quantum;
        if !scaled.is_finite() {
            return None;
        }
        let coarse = scaled.floor();
        let coord = coarse as i64 + half;
        if coord < 0 || coord >= i64::from(grid.package_size) || coord >= i64::from(EXCLUDED_AXIS)
        {
            return None;
        }
        let fraction = ((scaled - coarse) * f32::from(LOCAL_STEPS)).floor() as i32;
        tile[axis] = coord as u8;
        local[axis] = fraction.clamp(0, i32::from(LOCAL_STEPS) - 1) as u8;
    }

    Some((
        TileId::new(tile[0], tile[1], tile[2]),
        LocalOffset {
            x: local[0],
            y: local[1],
            z: local[2],
        },
    ))
}

/// Inverse of [`quantize`]
pub fn dequantize(tile: TileId, local: LocalOffset, grid: TileGrid) -> Position {
    let quantum = grid.quantum() as f32;
    let half = grid.half();
    let tile = tile.to_array();
    let local = local.to_array();
    let mut out = [0.0f32; 3];
    for axis in 0..3 {
        out[axis] = (i32::from(tile[axis]) - half) as f32 / quantum
            + f32::from(local[axis]) / (f32::from(LOCAL_STEPS) * quantum);
    }
    out
}

/// Decode one fragment delta byte: `d = (b - 128) / 128`, result `sign(d) * d²`
pub fn decode_fragment_delta(byte: u8) -> f32 {
    let d = (f32::from(byte) - 128.0) / 128.0;
    d * d.abs()
}

/// Encode a per-axis delta on the power curve. Values beyond the curve's range
/// saturate; NaN encodes as zero.
pub fn encode_fragment_delta(delta: f32) -> u8 {
    if delta.is_nan() {
        return 128;
    }
    let curve = delta.signum() * delta.abs().sqrt();
    (128.0 + 128.0 * curve).round().clamp(0.0, 255.0) as u8
}
