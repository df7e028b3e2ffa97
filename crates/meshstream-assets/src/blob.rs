//! Serialized mesh, material and texture blobs
//!
//! Names are stored as 64 UTF-16LE code units (128 bytes), zero padded.
//! All integers and floats are little-endian.

use crate::AssetError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder, ImageFormat, RgbaImage};

pub const NAME_UNITS: usize = 64;
pub const NAME_LEN: usize = NAME_UNITS * 2;

/// Number of UV channels a mesh blob can carry
pub const UV_CHANNELS: usize = 4;

fn put_name(buf: &mut BytesMut, name: &str) {
    let mut units = 0;
    for unit in name.encode_utf16().take(NAME_UNITS) {
        buf.put_u16_le(unit);
        units += 1;
    }
    buf.put_bytes(0, (NAME_UNITS - units) * 2);
}

fn get_name(buf: &mut &[u8]) -> Result<String, AssetError> {
    need(*buf, NAME_LEN, "name")?;
    let units: Vec<u16> = (0..NAME_UNITS).map(|_| buf.get_u16_le()).collect();
    let end = units.iter().position(|u| *u == 0).unwrap_or(NAME_UNITS);
    Ok(String::from_utf16_lossy(&units[..end]))
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<(), AssetError> {
    if buf.len() < len {
        return Err(AssetError::MalformedBlob(format!(
            "{what}: need {len} bytes, {} left",
            buf.len()
        )));
    }
    Ok(())
}

/// Mesh topology shipped once per mesh; vertex positions arrive through the stream
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshBlob {
    pub vertex_count: u16,
    /// Triangle index list per submesh
    pub submeshes: Vec<Vec<u16>>,
    pub uvs: [Vec<[f32; 2]>; UV_CHANNELS],
    /// Material name per submesh
    pub material_names: Vec<String>,
}

impl MeshBlob {
    pub fn encode(&self) -> Result<Bytes, AssetError> {
        if self.material_names.len() != self.submeshes.len() {
            return Err(AssetError::MalformedBlob(format!(
                "{} submeshes but {} material names",
                self.submeshes.len(),
                self.material_names.len()
            )));
        }
        let submesh_count = to_u16(self.submeshes.len(), "submesh count")?;

        let mut buf = BytesMut::new();
        buf.put_u16_le(self.vertex_count);
        buf.put_u16_le(submesh_count);
        for channel in &self.uvs {
            buf.put_u16_le(to_u16(channel.len() * 2, "uv float count")?);
        }
        for indices in &self.submeshes {
            buf.put_u16_le(to_u16(indices.len(), "index count")?);
        }
        for indices in &self.submeshes {
            for index in indices {
                buf.put_u16_le(*index);
            }
        }
        for channel in &self.uvs {
            for [u, v] in channel {
                buf.put_f32_le(*u);
                buf.put_f32_le(*v);
            }
        }
        for name in &self.material_names {
            put_name(&mut buf, name);
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, AssetError> {
        let mut buf = data;
        need(buf, 4 + 2 * UV_CHANNELS, "mesh header")?;
        let vertex_count = buf.get_u16_le();
        let submesh_count = usize::from(buf.get_u16_le());
        let uv_floats: Vec<usize> = (0..UV_CHANNELS).map(|_| usize::from(buf.get_u16_le())).collect();

        need(buf, submesh_count * 2, "index counts")?;
        let index_counts: Vec<usize> = (0..submesh_count).map(|_| usize::from(buf.get_u16_le())).collect();

        let mut submeshes = Vec::with_capacity(submesh_count);
        for count in index_counts {
            need(buf, count * 2, "indices")?;
            let indices: Vec<u16> = (0..count).map(|_| buf.get_u16_le()).collect();
            if let Some(bad) = indices.iter().find(|i| **i >= vertex_count) {
                return Err(AssetError::MalformedBlob(format!(
                    "index {bad} outside {vertex_count} vertices"
                )));
            }
            submeshes.push(indices);
        }

        let mut uvs: [Vec<[f32; 2]>; UV_CHANNELS] = Default::default();
        for (channel, floats) in uvs.iter_mut().zip(uv_floats) {
            if floats % 2 != 0 {
                return Err(AssetError::MalformedBlob(format!(
                    "odd uv float count {floats}"
                )));
            }
            need(buf, floats * 4, "uvs")?;
            *channel = (0..floats / 2)
                .map(|_| [buf.get_f32_le(), buf.get_f32_le()])
                .collect();
        }

        let mut material_names = Vec::with_capacity(submesh_count);
        for _ in 0..submesh_count {
            material_names.push(get_name(&mut buf)?);
        }

        if buf.has_remaining() {
            return Err(AssetError::MalformedBlob(format!(
                "{} trailing bytes after mesh",
                buf.remaining()
            )));
        }

        Ok(Self {
            vertex_count,
            submeshes,
            uvs,
            material_names,
        })
    }
}

fn to_u16(value: usize, what: &str) -> Result<u16, AssetError> {
    u16::try_from(value)
        .map_err(|_| AssetError::MalformedBlob(format!("{what} {value} does not fit in u16")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Color([f32; 4]),
    Vector([f32; 4]),
    Float(f32),
    Range(f32),
    /// Name of a texture in the same asset set
    Texture(String),
}

impl PropertyValue {
    fn type_byte(&self) -> u8 {
        match self {
            PropertyValue::Color(_) => 0,
            PropertyValue::Vector(_) => 1,
            PropertyValue::Float(_) => 2,
            PropertyValue::Range(_) => 3,
            PropertyValue::Texture(_) => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialProperty {
    pub name: String,
    pub value: PropertyValue,
}

impl MaterialProperty {
    pub fn new(name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Material name plus its shader property table
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterialBlob {
    pub name: String,
    pub properties: Vec<MaterialProperty>,
}

impl MaterialBlob {
    pub fn encode(&self) -> Result<Bytes, AssetError> {
        let count = u8::try_from(self.properties.len()).map_err(|_| {
            AssetError::MalformedBlob(format!("{} material properties", self.properties.len()))
        })?;

        let mut buf = BytesMut::new();
        put_name(&mut buf, &self.name);
        buf.put_u8(count);
        for property in &self.properties {
            buf.put_u8(property.value.type_byte());
            put_name(&mut buf, &property.name);
            match &property.value {
                PropertyValue::Color(v) | PropertyValue::Vector(v) => {
                    for c in v {
                        buf.put_f32_le(*c);
                    }
                }
                PropertyValue::Float(f) | PropertyValue::Range(f) => buf.put_f32_le(*f),
                PropertyValue::Texture(name) => put_name(&mut buf, name),
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, AssetError> {
        let mut buf = data;
        let name = get_name(&mut buf)?;
        need(buf, 1, "property count")?;
        let count = buf.get_u8();

        let mut properties = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            need(buf, 1, "property type")?;
            let type_byte = buf.get_u8();
            let property_name = get_name(&mut buf)?;
            let value = match type_byte {
                0 | 1 => {
                    need(buf, 16, "vector value")?;
                    let v = [buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le(), buf.get_f32_le()];
                    if type_byte == 0 {
                        PropertyValue::Color(v)
                    } else {
                        PropertyValue::Vector(v)
                    }
                }
                2 | 3 => {
                    need(buf, 4, "float value")?;
                    let f = buf.get_f32_le();
                    if type_byte == 2 {
                        PropertyValue::Float(f)
                    } else {
                        PropertyValue::Range(f)
                    }
                }
                4 => PropertyValue::Texture(get_name(&mut buf)?),
                other => {
                    return Err(AssetError::MalformedBlob(format!(
                        "unknown property type {other}"
                    )))
                }
            };
            properties.push(MaterialProperty {
                name: property_name,
                value,
            });
        }

        Ok(Self { name, properties })
    }

    /// Texture names this material refers to
    pub fn texture_refs(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().filter_map(|p| match &p.value {
            PropertyValue::Texture(name) => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Texture name followed by PNG bytes
#[derive(Debug, Clone, PartialEq)]
pub struct TextureBlob {
    pub name: String,
    pub png: Bytes,
}

impl TextureBlob {
    pub fn from_rgba(name: impl Into<String>, image: &RgbaImage) -> Result<Self, AssetError> {
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgba8)
            .map_err(|e| AssetError::TextureDecode(format!("PNG encoding failed: {e}")))?;
        Ok(Self {
            name: name.into(),
            png: Bytes::from(png),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NAME_LEN + self.png.len());
        put_name(&mut buf, &self.name);
        buf.extend_from_slice(&self.png);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, AssetError> {
        let mut buf = data;
        let name = get_name(&mut buf)?;
        Ok(Self {
            name,
            png: Bytes::copy_from_slice(buf),
        })
    }

    pub fn to_rgba(&self) -> Result<RgbaImage, AssetError> {
        image::load_from_memory_with_format(&self.png, ImageFormat::Png)
            .map(|img| img.to_rgba8())
            .map_err(|e| AssetError::TextureDecode(format!("{}: {e}", self.name)))
    }
}
