use bytes::Bytes;
use image::{Rgba, RgbaImage};
use meshstream_assets::{
    AssetHash, AssetKind, AssetStore, MaterialBlob, MaterialProperty, MeshBlob, PropertyValue,
    TextureBlob,
};
use meshstream_codec::{MeshSample, Position, Transform};
use std::sync::Arc;

/// A flat `cols x rows` vertex grid in the XY plane, two triangles per cell
pub fn grid_mesh(cols: u16, rows: u16, material: &str) -> MeshBlob {
    let cols = cols.max(2);
    let rows = rows.max(2);
    let mut indices = Vec::new();
    for y in 0..rows - 1 {
        for x in 0..cols - 1 {
            let i = y * cols + x;
            indices.extend_from_slice(&[i, i + cols, i + 1, i + 1, i + cols, i + cols + 1]);
        }
    }

    let uv0 = (0..rows)
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
        uvs: [uv0, Vec::new(), Vec::new(), Vec::new()],
        material_names: vec![material.to_string()],
    }
}

/// Vertex positions of [`grid_mesh`], displaced along Z by `phase`
pub fn grid_positions(cols: u16, rows: u16, spacing: f32, phase: f32) -> Vec<Position> {
    let cols = cols.max(2);
    let rows = rows.max(2);
    (0..rows)
        .flat_map(|y| {
            (0..cols).map(move |x| {
                let (fx, fy) = (f32::from(x) * spacing, f32::from(y) * spacing);
                [fx, fy, (fx * 2.0 + phase).sin() * 0.1]
            })
        })
        .collect()
}

pub fn grid_sample(cols: u16, rows: u16, phase: f32) -> MeshSample {
    MeshSample {
        vertices: grid_positions(cols, rows, 0.1, phase),
        transform: Transform::identity(),
    }
}

pub fn checker_texture(name: &str, size: u32) -> TextureBlob {
    let image = RgbaImage::from_fn(size, size, |x, y| {
        if (x + y) % 2 == 0 {
            Rgba([255, 255, 255, 255])
        } else {
            Rgba([20, 20, 20, 255])
        }
    });
    TextureBlob::from_rgba(name, &image).expect("encode fixture texture")
}

pub fn textured_material(name: &str, texture: &str) -> MaterialBlob {
    MaterialBlob {
        name: name.to_string(),
        properties: vec![
            MaterialProperty::new("_Color", PropertyValue::Color([1.0, 0.8, 0.6, 1.0])),
            MaterialProperty::new("_Glossiness", PropertyValue::Range(0.5)),
            MaterialProperty::new("_MainTex", PropertyValue::Texture(texture.to_string())),
        ],
    }
}

/// Hashes and encoded bytes of the fixture asset set
#[derive(Debug, Clone)]
pub struct AssetSet {
    pub texture: (AssetHash, Bytes),
    pub material: (AssetHash, Bytes),
    pub meshes: Vec<(AssetHash, Bytes)>,
}

impl AssetSet {
    /// One texture, one material and `mesh_sizes.len()` grid meshes
    pub fn new(mesh_sizes: &[(u16, u16)]) -> Self {
        let texture = checker_texture("checker", 8).encode();
        let material = textured_material("skin", "checker")
            .encode()
            .expect("encode fixture material");
        let meshes = mesh_sizes
            .iter()
            .map(|(cols, rows)| {
                let bytes = grid_mesh(*cols, *rows, "skin")
                    .encode()
                    .expect("encode fixture mesh");
                (AssetHash::of(&bytes), bytes)
            })
            .collect();

        Self {
            texture: (AssetHash::of(&texture), texture),
            material: (AssetHash::of(&material), material),
            meshes,
        }
    }

    /// Mesh hashes in stream order
    pub fn mesh_hashes(&self) -> Vec<AssetHash> {
        self.meshes.iter().map(|(hash, _)| *hash).collect()
    }

    pub fn add_to(&self, store: &AssetStore) {
        store.put(AssetKind::Texture, self.texture.1.clone());
        store.put(AssetKind::Material, self.material.1.clone());
        for (_, mesh) in &self.meshes {
            store.put(AssetKind::Mesh, mesh.clone());
        }
    }
}

/// A store holding the fixture set with the given mesh sizes
pub fn populated_store(mesh_sizes: &[(u16, u16)]) -> (Arc<AssetStore>, AssetSet) {
    let set = AssetSet::new(mesh_sizes);
    let store = Arc::new(AssetStore::new());
    set.add_to(&store);
    (store, set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grid_mesh_shape() {
        let mesh = grid_mesh(3, 2, "m");
        assert_eq!(mesh.vertex_count, 6);
        assert_eq!(mesh.submeshes[0].len(), 2 * 6);
        assert_eq!(mesh.uvs[0].len(), 6);
        assert_eq!(grid_positions(3, 2, 0.1, 0.0).len(), 6);
    }

    #[test]
    fn test_populated_store() {
        let (store, set) = populated_store(&[(4, 4), (2, 2)]);
        assert_eq!(store.len(AssetKind::Mesh), 2);
        assert!(store.contains(AssetKind::Texture, set.texture.0));
        assert!(store.contains(AssetKind::Material, set.material.0));
        assert_eq!(set.mesh_hashes().len(), 2);
    }
}
