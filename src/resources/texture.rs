//! Texture loading and upload

use crate::backend::traits::*;
use crate::backend::types::*;
use glam::Vec4;
use image::{DynamicImage, GenericImageView};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TextureLoadError {
    #[error("Failed to decode '{name}': {source}")]
    Decode {
        name: String,
        #[source]
        source: image::ImageError,
    },
}

/// Decoded texel data ready for upload
#[derive(Debug, Clone)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub data: Vec<u8>,
    pub name: String,
}

impl TextureData {
    /// Load an sRGB color texture from an image file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TextureLoadError> {
        Self::from_file_with_format(path, TextureFormat::Rgba8UnormSrgb)
    }

    /// Load a texture holding linear data (metallic, roughness, normals)
    pub fn from_file_linear<P: AsRef<Path>>(path: P) -> Result<Self, TextureLoadError> {
        Self::from_file_with_format(path, TextureFormat::Rgba8Unorm)
    }

    fn from_file_with_format<P: AsRef<Path>>(
        path: P,
        format: TextureFormat,
    ) -> Result<Self, TextureLoadError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        let img = image::open(path).map_err(|source| TextureLoadError::Decode {
            name: name.clone(),
            source,
        })?;
        Ok(Self::from_image(img, &name, format))
    }

    /// Decode an encoded image held in memory
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, TextureLoadError> {
        let img = image::load_from_memory(bytes).map_err(|source| TextureLoadError::Decode {
            name: name.to_string(),
            source,
        })?;
        Ok(Self::from_image(img, name, TextureFormat::Rgba8UnormSrgb))
    }

    fn from_image(img: DynamicImage, name: &str, format: TextureFormat) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            format,
            data: img.to_rgba8().into_raw(),
            name: name.to_string(),
        }
    }

    /// 1x1 RGBA32F texture holding a constant vector
    pub fn constant_rgba32f(value: Vec4, name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::Rgba32Float,
            data: bytemuck::bytes_of(&value).to_vec(),
            name: name.to_string(),
        }
    }

    /// 1x1 R32F texture holding a constant scalar
    pub fn constant_r32f(value: f32, name: &str) -> Self {
        Self {
            width: 1,
            height: 1,
            format: TextureFormat::R32Float,
            data: value.to_ne_bytes().to_vec(),
            name: name.to_string(),
        }
    }

    /// Checkerboard of 8x8 pixel squares, handy for debugging UVs
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if even { &color1 } else { &color2 });
            }
        }

        Self {
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            data,
            name: "checkerboard".to_string(),
        }
    }
}

/// Sampled texture resident on the GPU
#[derive(Debug, Clone)]
pub struct GpuTexture {
    pub handle: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub name: String,
}

impl GpuTexture {
    /// Create the texture and upload its texels
    pub fn create<B: GraphicsBackend>(backend: &mut B, data: &TextureData) -> BackendResult<Self> {
        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(data.name.clone()),
            width: data.width,
            height: data.height,
            format: data.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(handle, &data.data, data.width, data.height)?;
        let view = backend.create_texture_view(handle)?;

        Ok(Self {
            handle,
            view,
            width: data.width,
            height: data.height,
            format: data.format,
            name: data.name.clone(),
        })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(feature = "headless")]
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_constant_textures_are_single_texel() {
        let albedo = TextureData::constant_rgba32f(Vec4::new(0.8, 0.2, 0.1, 1.0), "albedo");
        assert_eq!((albedo.width, albedo.height), (1, 1));
        assert_eq!(albedo.data.len(), 16);

        let roughness = TextureData::constant_r32f(0.5, "roughness");
        assert_eq!(roughness.data, 0.5f32.to_ne_bytes().to_vec());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(TextureData::from_bytes(&[1, 2, 3], "garbage").is_err());
    }

    #[test]
    #[cfg(feature = "headless")]
    fn test_upload_and_destroy() {
        let mut backend = HeadlessBackend::default();
        let before = backend.live_objects();
        let texture = GpuTexture::create(
            &mut backend,
            &TextureData::checkerboard(16, [255; 4], [0, 0, 0, 255]),
        )
        .unwrap();
        assert_eq!(backend.texture_uploads(texture.handle), 1);

        texture.destroy(&mut backend);
        assert_eq!(backend.live_objects(), before);
    }
}
