//! Tiling and diff kernels
//!
//! The sender maps each mesh's vertices through its transform into tile space
//! (keyframes) or into per-vertex displacement (fragments). The heavy lifting is
//! normally done on the GPU; [`CpuTiler`] is the reference implementation used
//! when no accelerator is available.

use crate::quantize::{quantize, LocalOffset, Position, TileGrid, TileId};
use tracing::{trace, warn};

/// Aligned buffer bucket for a kernel dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchBucket {
    /// Vertex buffer length after padding
    pub aligned: usize,
    /// Kernel entry point sized for this bucket
    pub kernel: &'static str,
    /// Thread groups to dispatch
    pub groups: u32,
}

const fn bucket(aligned: usize, kernel: &'static str, groups: u32) -> DispatchBucket {
    DispatchBucket {
        aligned,
        kernel,
        groups,
    }
}

/// Sorted by `aligned`
pub const DISPATCH_BUCKETS: [DispatchBucket; 13] = [
    bucket(16, "cs_main8", 2),
    bucket(32, "cs_main8", 4),
    bucket(64, "cs_main32", 2),
    bucket(128, "cs_main32", 4),
    bucket(256, "cs_main128", 2),
    bucket(512, "cs_main128", 4),
    bucket(1024, "cs_main512", 2),
    bucket(2048, "cs_main512", 4),
    bucket(4096, "cs_main512", 8),
    bucket(8192, "cs_main512", 16),
    bucket(16384, "cs_main512", 32),
    bucket(32768, "cs_main512", 64),
    bucket(65536, "cs_main512", 128),
];

/// Smallest bucket that holds `vertex_count` vertices, or `None` when the mesh
/// is too large to stream.
pub fn dispatch_bucket(vertex_count: usize) -> Option<&'static DispatchBucket> {
    let index = DISPATCH_BUCKETS.partition_point(|b| b.aligned < vertex_count);
    DISPATCH_BUCKETS.get(index)
}

/// Row-major 4x4 affine transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub rows: [[f32; 4]; 4],
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            rows: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    pub fn from_translation(t: Position) -> Self {
        let mut m = Self::identity();
        m.rows[0][3] = t[0];
        m.rows[1][3] = t[1];
        m.rows[2][3] = t[2];
        m
    }

    /// Rotation from a unit quaternion `[x, y, z, w]` followed by a translation
    pub fn from_rotation_translation(q: [f32; 4], t: Position) -> Self {
        let [x, y, z, w] = q;
        let (xx, yy, zz) = (x * x, y * y, z * z);
        let (xy, xz, yz) = (x * y, x * z, y * z);
        let (wx, wy, wz) = (w * x, w * y, w * z);
        Self {
            rows: [
                [1.0 - 2.0 * (yy + zz), 2.0 * (xy - wz), 2.0 * (xz + wy), t[0]],
                [2.0 * (xy + wz), 1.0 - 2.0 * (xx + zz), 2.0 * (yz - wx), t[1]],
                [2.0 * (xz - wy), 2.0 * (yz + wx), 1.0 - 2.0 * (xx + yy), t[2]],
                [0.0, 0.0, 0.0, 1.0],
            ],
        }
    }

    pub fn transform_point(&self, p: Position) -> Position {
        let r = &self.rows;
        [
            r[0][0] * p[0] + r[0][1] * p[1] + r[0][2] * p[2] + r[0][3],
            r[1][0] * p[0] + r[1][1] * p[1] + r[1][2] * p[2] + r[1][3],
            r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + r[2][3],
        ]
    }
}

/// One vertex after tiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledVertex {
    pub tile: TileId,
    pub local: LocalOffset,
}

/// Tiling and diff kernels. Output is aligned element-for-element with the
/// input vertex slice.
pub trait Tiler {
    /// Map vertices into tile space. `None` marks an excluded vertex.
    fn tile(
        &self,
        vertices: &[Position],
        transform: &Transform,
        grid: TileGrid,
    ) -> Vec<Option<TiledVertex>>;

    /// Displacement of every vertex from its previous transformed position
    fn diff(
        &self,
        vertices: &[Position],
        old_vertices: &[Position],
        transform: &Transform,
        old_transform: &Transform,
    ) -> Vec<Position>;
}

/// Reference kernels running on the CPU
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTiler;

impl Tiler for CpuTiler {
    fn tile(
        &self,
        vertices: &[Position],
        transform: &Transform,
        grid: TileGrid,
    ) -> Vec<Option<TiledVertex>> {
        let Some(bucket) = dispatch_bucket(vertices.len()) else {
            warn!(
                "Mesh with {} vertices exceeds the largest dispatch bucket, excluding it",
                vertices.len()
            );
            return vec![None; vertices.len()];
        };
        trace!(
            kernel = bucket.kernel,
            groups = bucket.groups,
            aligned = bucket.aligned,
            "tiling {} vertices",
            vertices.len()
        );

        vertices
            .iter()
            .map(|v| {
                quantize(transform.transform_point(*v), grid)
                    .map(|(tile, local)| TiledVertex { tile, local })
            })
            .collect()
    }

    fn diff(
        &self,
        vertices: &[Position],
        old_vertices: &[Position],
        transform: &Transform,
        old_transform: &Transform,
    ) -> Vec<Position> {
        vertices
            .iter()
            .enumerate()
            .map(|(i, v)| match old_vertices.get(i) {
                Some(old) => {
                    let now = transform.transform_point(*v);
                    let before = old_transform.transform_point(*old);
                    [now[0] - before[0], now[1] - before[1], now[2] - before[2]]
                }
                None => [0.0; 3],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_bucket_thresholds() {
        assert_eq!(dispatch_bucket(0).unwrap().aligned, 16);
        assert_eq!(dispatch_bucket(16).unwrap().aligned, 16);
        assert_eq!(dispatch_bucket(17).unwrap().aligned, 32);
        assert_eq!(dispatch_bucket(3000).unwrap().kernel, "cs_main512");
        assert_eq!(dispatch_bucket(65536).unwrap().groups, 128);
        assert!(dispatch_bucket(65537).is_none());
    }

    #[test]
    fn test_buckets_sorted() {
        assert!(DISPATCH_BUCKETS.windows(2).all(|w| w[0].aligned < w[1].aligned));
    }

    #[test]
    fn test_rotation_quarter_turn() {
        let s = std::f32::consts::FRAC_1_SQRT_2;
        // 90 degrees about +Y
        let t = Transform::from_rotation_translation([0.0, s, 0.0, s], [0.0, 2.0, 0.0]);
        let p = t.transform_point([1.0, 0.0, 0.0]);
        assert!(p[0].abs() < 1e-5);
        assert!((p[1] - 2.0).abs() < 1e-5);
        assert!((p[2] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_diff_applies_both_transforms() {
        let tiler = CpuTiler;
        let old = [[0.0, 0.0, 0.0]];
        let new = [[0.5, 0.0, 0.0]];
        let d = tiler.diff(
            &new,
            &old,
            &Transform::from_translation([1.0, 0.0, 0.0]),
            &Transform::identity(),
        );
        assert_eq!(d, vec![[1.5, 0.0, 0.0]]);
    }

    #[test]
    fn test_tile_output_aligned_with_input() {
        let tiler = CpuTiler;
        let verts = [[0.0, 0.0, 0.0], [100.0, 0.0, 0.0], [0.1, 0.1, 0.1]];
        let out = tiler.tile(&verts, &Transform::identity(), TileGrid::default());
        assert_eq!(out.len(), 3);
        assert!(out[0].is_some());
        assert!(out[1].is_none());
        assert!(out[2].is_some());
    }
}
