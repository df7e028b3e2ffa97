//! Receiver-side copies of the sender's assets

use crate::blob::{MaterialBlob, MaterialProperty, MeshBlob, TextureBlob};
use crate::store::AssetKind;
use crate::AssetError;
use image::RgbaImage;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Maps material names to locally available shaders
#[derive(Debug, Clone)]
pub struct ShaderTable {
    shaders: HashMap<String, String>,
    default_shader: String,
}

impl ShaderTable {
    pub fn new(default_shader: impl Into<String>) -> Self {
        Self {
            shaders: HashMap::new(),
            default_shader: default_shader.into(),
        }
    }

    pub fn with(mut self, material: impl Into<String>, shader: impl Into<String>) -> Self {
        self.shaders.insert(material.into(), shader.into());
        self
    }

    /// Shader for `material`, or the default shader when none is registered
    pub fn resolve(&self, material: &str) -> &str {
        self.shaders
            .get(material)
            .map(String::as_str)
            .unwrap_or(&self.default_shader)
    }

    pub fn default_shader(&self) -> &str {
        &self.default_shader
    }
}

impl Default for ShaderTable {
    fn default() -> Self {
        Self::new("Standard")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMaterial {
    pub name: String,
    pub shader: String,
    pub properties: Vec<MaterialProperty>,
    /// Texture references with no matching mirrored texture
    pub missing_textures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirroredMesh {
    pub blob: MeshBlob,
    /// Per submesh, the material name when that material is mirrored
    pub materials: Vec<Option<String>>,
}

/// Decoded assets in the shape the renderer consumes
#[derive(Debug, Default)]
pub struct AssetMirror {
    shaders: ShaderTable,
    textures: HashMap<String, RgbaImage>,
    materials: HashMap<String, ResolvedMaterial>,
    meshes: BTreeMap<u8, MirroredMesh>,
}

impl AssetMirror {
    pub fn new(shaders: ShaderTable) -> Self {
        Self {
            shaders,
            ..Default::default()
        }
    }

    /// Decode a complete blob and add it to the matching collection. Textures
    /// and materials keep the first entry seen for a name.
    pub fn commit(&mut self, kind: AssetKind, object_id: u8, bytes: &[u8]) -> Result<(), AssetError> {
        match kind {
            AssetKind::Texture => {
                let blob = TextureBlob::decode(bytes)?;
                let image = blob.to_rgba()?;
                debug!(
                    "Mirrored texture {:?} ({}x{})",
                    blob.name,
                    image.width(),
                    image.height()
                );
                self.textures.entry(blob.name).or_insert(image);
            }
            AssetKind::Material => {
                let blob = MaterialBlob::decode(bytes)?;
                let resolved = self.resolve_material(blob);
                debug!(
                    "Mirrored material {:?} with shader {:?}",
                    resolved.name, resolved.shader
                );
                self.materials.entry(resolved.name.clone()).or_insert(resolved);
            }
            AssetKind::Mesh => {
                let blob = MeshBlob::decode(bytes)?;
                let materials = blob
                    .material_names
                    .iter()
                    .map(|name| {
                        let found = self.materials.contains_key(name);
                        if !found {
                            warn!("Mesh {object_id} uses unknown material {name:?}");
                        }
                        found.then(|| name.clone())
                    })
                    .collect();
                debug!(
                    "Mirrored mesh {object_id} ({} vertices, {} submeshes)",
                    blob.vertex_count,
                    blob.submeshes.len()
                );
                self.meshes.insert(object_id, MirroredMesh { blob, materials });
            }
        }
        Ok(())
    }

    fn resolve_material(&self, blob: MaterialBlob) -> ResolvedMaterial {
        let missing_textures = blob
            .texture_refs()
            .filter(|name| !self.textures.contains_key(*name))
            .map(str::to_owned)
            .collect();
        ResolvedMaterial {
            shader: self.shaders.resolve(&blob.name).to_owned(),
            name: blob.name,
            properties: blob.properties,
            missing_textures,
        }
    }

    pub fn texture(&self, name: &str) -> Option<&RgbaImage> {
        self.textures.get(name)
    }

    pub fn material(&self, name: &str) -> Option<&ResolvedMaterial> {
        self.materials.get(name)
    }

    /// Meshes ordered by object id, matching the stream's mesh indices
    pub fn meshes(&self) -> impl Iterator<Item = &MirroredMesh> {
        self.meshes.values()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Vertex buffer size for each of `mesh_slots` object ids, `None` where
    /// that mesh is not mirrored. Index `i` is mesh `i` of the stream.
    pub fn vertex_counts(&self, mesh_slots: usize) -> Vec<Option<usize>> {
        (0..mesh_slots)
            .map(|id| {
                u8::try_from(id)
                    .ok()
                    .and_then(|id| self.meshes.get(&id))
                    .map(|m| usize::from(m.blob.vertex_count))
            })
            .collect()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }

    pub fn clear(&mut self) {
        self.textures.clear();
        self.materials.clear();
        self.meshes.clear();
    }
}
