//! Synthetic animated mesh set used by the sender binary and the tests

use crate::sender::MeshSource;
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use meshstream_assets::{
    AssetHash, AssetKind, AssetStore, MaterialBlob, MaterialProperty, MeshBlob, PropertyValue,
    TextureBlob,
};
use meshstream_codec::{MeshSample, Position, Transform};
use std::time::Duration;

pub const TEXTURE_NAME: &str = "demo_gradient";
pub const MATERIAL_NAME: &str = "demo_skin";

/// A rectangular cloth of `cols x rows` vertices
#[derive(Debug, Clone, Copy)]
pub struct Cloth {
    pub cols: u16,
    pub rows: u16,
    pub spacing: f32,
    pub offset: Position,
}

impl Cloth {
    pub fn vertex_count(&self) -> usize {
        usize::from(self.cols) * usize::from(self.rows)
    }

    fn blob(&self) -> MeshBlob {
        let (cols, rows) = (self.cols, self.rows);
        let mut indices = Vec::with_capacity(usize::from(cols - 1) * usize::from(rows - 1) * 6);
        for y in 0..rows - 1 {
            for x in 0..cols - 1 {
                let i = y * cols + x;
                indices.extend_from_slice(&[i, i + cols, i + 1, i + 1, i + cols, i + cols + 1]);
            }
        }
        let uv = (0..rows)
            .flat_map(|y| {
                (0..cols).map(move |x| {
                    [
                        f32::from(x) / f32::from(cols - 1),
                        f32::from(y) / f32::from(rows - 1),
                    ]
                })
            })
            .collect();

        MeshBlob {
            vertex_count: cols * rows,
            submeshes: vec![indices],
            uvs: [uv, Vec::new(), Vec::new(), Vec::new()],
            material_names: vec![MATERIAL_NAME.to_string()],
        }
    }

    /// Vertices waving along Z
    fn wave(&self, t: f32) -> Vec<Position> {
        (0..self.rows)
            .flat_map(|y| {
                (0..self.cols).map(move |x| {
                    let fx = f32::from(x) * self.spacing;
                    let fy = f32::from(y) * self.spacing;
                    let z = (fx * 3.0 + t * 2.0).sin() * 0.15 * (fx / (self.spacing * 8.0)).min(1.0);
                    [
                        self.offset[0] + fx,
                        self.offset[1] + fy,
                        self.offset[2] + z,
                    ]
                })
            })
            .collect()
    }
}

/// Mesh source animating a set of cloths while drifting the root
#[derive(Debug, Clone)]
pub struct DemoSource {
    cloths: Vec<Cloth>,
}

impl DemoSource {
    pub fn new(cloths: Vec<Cloth>) -> Self {
        Self { cloths }
    }

    pub fn cloths(&self) -> &[Cloth] {
        &self.cloths
    }
}

impl Default for DemoSource {
    fn default() -> Self {
        Self::new(vec![
            Cloth {
                cols: 24,
                rows: 16,
                spacing: 0.05,
                offset: [-0.6, 0.0, 0.0],
            },
            Cloth {
                cols: 8,
                rows: 8,
                spacing: 0.04,
                offset: [0.4, 0.2, 0.1],
            },
        ])
    }
}

impl MeshSource for DemoSource {
    fn publish_assets(&self, store: &AssetStore) -> Result<Vec<AssetHash>> {
        let texture = RgbaImage::from_fn(32, 32, |x, y| {
            Rgba([(x * 8) as u8, (y * 8) as u8, 160, 255])
        });
        let texture = TextureBlob::from_rgba(TEXTURE_NAME, &texture)
            .context("Failed to encode demo texture")?;
        store.put(AssetKind::Texture, texture.encode());

        let material = MaterialBlob {
            name: MATERIAL_NAME.to_string(),
            properties: vec![
                MaterialProperty::new("_Color", PropertyValue::Color([0.9, 0.7, 0.6, 1.0])),
                MaterialProperty::new("_Glossiness", PropertyValue::Range(0.3)),
                MaterialProperty::new("_MainTex", PropertyValue::Texture(TEXTURE_NAME.to_string())),
            ],
        };
        store.put(
            AssetKind::Material,
            material.encode().context("Failed to encode demo material")?,
        );

        // Same-sized cloths share one stored blob but keep a slot each
        self.cloths
            .iter()
            .map(|cloth| {
                let mesh = cloth.blob().encode().context("Failed to encode demo mesh")?;
                Ok(store.put(AssetKind::Mesh, mesh))
            })
            .collect()
    }

    fn sample(&mut self, elapsed: Duration) -> (Vec<MeshSample>, Position) {
        let t = elapsed.as_secs_f32();
        let samples = self
            .cloths
            .iter()
            .map(|cloth| MeshSample {
                vertices: cloth.wave(t),
                transform: Transform::identity(),
            })
            .collect();
        (samples, [(t * 0.5).sin() * 0.2, 0.0, 0.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assets_are_distinct() {
        let store = AssetStore::new();
        let source = DemoSource::default();
        let meshes = source.publish_assets(&store).unwrap();
        assert_eq!(store.len(AssetKind::Texture), 1);
        assert_eq!(store.len(AssetKind::Material), 1);
        assert_eq!(store.len(AssetKind::Mesh), 2);
        assert_eq!(meshes.len(), 2);
    }

    #[test]
    fn test_identical_cloths_keep_a_slot_each() {
        let store = AssetStore::new();
        let cloth = Cloth {
            cols: 4,
            rows: 4,
            spacing: 0.1,
            offset: [0.0; 3],
        };
        let twin = Cloth {
            offset: [1.0, 0.0, 0.0],
            ..cloth
        };
        let meshes = DemoSource::new(vec![cloth, twin]).publish_assets(&store).unwrap();
        assert_eq!(meshes.len(), 2);
        assert_eq!(meshes[0], meshes[1]);
        assert_eq!(store.len(AssetKind::Mesh), 1);
    }

    #[test]
    fn test_sample_matches_topology() {
        let mut source = DemoSource::default();
        let (samples, _) = source.sample(Duration::from_millis(250));
        for (sample, cloth) in samples.iter().zip(source.cloths()) {
            assert_eq!(sample.vertices.len(), cloth.vertex_count());
        }
    }
}
