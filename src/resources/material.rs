//! Materials for the forward pass
//!
//! A material binds one uniform block and five texture maps. Slots without an
//! authored texture are filled with a 1x1 texture carrying the material's
//! scalar or vector value, so the shader always samples.

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::{GpuTexture, TextureData};
use crate::scene::TextureId;
use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// How the fragment shader derives the shading normal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum NormalMapMode {
    #[default]
    VertexNormals = 0,
    NormalMap = 1,
    BumpMap = 2,
}

/// Convention of the roughness slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum RoughnessMode {
    #[default]
    Roughness = 0,
    /// Stored as glossiness, inverted in the shader
    Glossiness = 1,
}

/// Texture slots of a material, in binding order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaterialSlot {
    Albedo = 0,
    Metallic = 1,
    Roughness = 2,
    AmbientOcclusion = 3,
    Normal = 4,
}

impl MaterialSlot {
    pub const ALL: [MaterialSlot; 5] = [
        MaterialSlot::Albedo,
        MaterialSlot::Metallic,
        MaterialSlot::Roughness,
        MaterialSlot::AmbientOcclusion,
        MaterialSlot::Normal,
    ];

    /// Binding of the slot's texture; binding 0 is the uniform block
    pub fn texture_binding(self) -> u32 {
        1 + 2 * self as u32
    }

    pub fn sampler_binding(self) -> u32 {
        self.texture_binding() + 1
    }

    pub fn name(self) -> &'static str {
        match self {
            MaterialSlot::Albedo => "albedo",
            MaterialSlot::Metallic => "metallic",
            MaterialSlot::Roughness => "roughness",
            MaterialSlot::AmbientOcclusion => "ambient",
            MaterialSlot::Normal => "normal",
        }
    }
}

/// Uniform block at binding 0 of the material set
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MaterialAux {
    pub normal_map_mode: u32,
    pub roughness_glossy_mode: u32,
    pub _pad: [u32; 2],
}

/// Layout of a material bind group: the aux uniform, then a texture and a
/// sampler per slot.
pub fn material_layout_entries() -> Vec<BindGroupLayoutEntry> {
    let mut entries = vec![BindGroupLayoutEntry {
        binding: 0,
        visibility: ShaderStageFlags::FRAGMENT,
        ty: BindingType::UniformBuffer,
    }];
    for slot in MaterialSlot::ALL {
        entries.push(BindGroupLayoutEntry {
            binding: slot.texture_binding(),
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Texture,
        });
        entries.push(BindGroupLayoutEntry {
            binding: slot.sampler_binding(),
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Sampler,
        });
    }
    entries
}

/// Surface description authored by the scene
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    pub albedo: Vec3,
    pub metallic: f32,
    pub roughness: f32,
    pub ambient: f32,
    pub textures: [Option<TextureId>; 5],
    pub normal_map_mode: NormalMapMode,
    pub roughness_mode: RoughnessMode,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            albedo: Vec3::splat(0.8),
            metallic: 0.0,
            roughness: 0.5,
            ambient: 1.0,
            textures: [None; 5],
            normal_map_mode: NormalMapMode::VertexNormals,
            roughness_mode: RoughnessMode::Roughness,
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_albedo(mut self, albedo: Vec3) -> Self {
        self.albedo = albedo;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic;
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness;
        self
    }

    pub fn with_ambient(mut self, ambient: f32) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn with_texture(mut self, slot: MaterialSlot, texture: TextureId) -> Self {
        self.textures[slot as usize] = Some(texture);
        self
    }

    /// Use a normal map; `bump` selects a height map instead
    pub fn with_normal_map(mut self, texture: TextureId, bump: bool) -> Self {
        self.textures[MaterialSlot::Normal as usize] = Some(texture);
        self.normal_map_mode = if bump {
            NormalMapMode::BumpMap
        } else {
            NormalMapMode::NormalMap
        };
        self
    }

    pub fn with_roughness_mode(mut self, mode: RoughnessMode) -> Self {
        self.roughness_mode = mode;
        self
    }

    pub fn texture(&self, slot: MaterialSlot) -> Option<TextureId> {
        self.textures[slot as usize]
    }

    pub fn aux(&self) -> MaterialAux {
        MaterialAux {
            normal_map_mode: self.normal_map_mode as u32,
            roughness_glossy_mode: self.roughness_mode as u32,
            _pad: [0; 2],
        }
    }

    /// 1x1 stand-in for an empty slot
    pub fn fallback_texture(&self, slot: MaterialSlot) -> TextureData {
        let name = format!("{} {} constant", self.name, slot.name());
        match slot {
            MaterialSlot::Albedo => TextureData::constant_rgba32f(self.albedo.extend(1.0), &name),
            MaterialSlot::Metallic => TextureData::constant_r32f(self.metallic, &name),
            MaterialSlot::Roughness => TextureData::constant_r32f(self.roughness, &name),
            MaterialSlot::AmbientOcclusion => TextureData::constant_r32f(self.ambient, &name),
            MaterialSlot::Normal => TextureData::constant_r32f(0.0, &name),
        }
    }

    // Presets

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic").with_albedo(color).with_roughness(0.4)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_albedo(color)
            .with_metallic(1.0)
            .with_roughness(roughness)
    }

    pub fn gold() -> Self {
        Self::metal(Vec3::new(1.0, 0.766, 0.336), 0.3)
    }

    pub fn copper() -> Self {
        Self::metal(Vec3::new(0.955, 0.637, 0.538), 0.4)
    }

    pub fn rubber(color: Vec3) -> Self {
        Self::new("rubber").with_albedo(color).with_roughness(0.9)
    }
}

/// Samplers shared by every material
#[derive(Debug, Clone, Copy)]
pub struct MaterialSamplers {
    /// Linear repeat sampler for authored textures
    pub texture: SamplerHandle,
    /// Nearest repeat sampler for 1x1 constants
    pub constant: SamplerHandle,
}

impl MaterialSamplers {
    pub fn create<B: GraphicsBackend>(backend: &mut B) -> BackendResult<Self> {
        let texture = backend.create_sampler(&SamplerDescriptor {
            label: Some("material texture sampler".into()),
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            ..Default::default()
        })?;
        let constant = backend.create_sampler(&SamplerDescriptor {
            label: Some("material constant sampler".into()),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            address_mode_u: AddressMode::Repeat,
            address_mode_v: AddressMode::Repeat,
            address_mode_w: AddressMode::Repeat,
            compare: None,
        })?;
        Ok(Self { texture, constant })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_sampler(self.constant);
        backend.destroy_sampler(self.texture);
    }
}

/// Material resident on the GPU: aux uniform, owned fallbacks, bind group
#[derive(Debug)]
pub struct GpuMaterial {
    pub aux_buffer: BufferHandle,
    pub fallbacks: Vec<GpuTexture>,
    pub bind_group: BindGroupHandle,
}

impl GpuMaterial {
    /// `authored` holds the view of each slot's scene texture, if any.
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        material: &Material,
        authored: [Option<TextureViewHandle>; 5],
        samplers: &MaterialSamplers,
        layout: BindGroupLayoutHandle,
    ) -> BackendResult<Self> {
        let aux_buffer = backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} aux", material.name)),
                size: std::mem::size_of::<MaterialAux>() as u64,
                usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            },
            bytemuck::bytes_of(&material.aux()),
        )?;

        let mut fallbacks = Vec::new();
        let mut entries = vec![(
            0,
            BindGroupEntry::Buffer {
                buffer: aux_buffer,
                offset: 0,
                size: None,
            },
        )];
        for slot in MaterialSlot::ALL {
            let (view, sampler) = match authored[slot as usize] {
                Some(view) => (view, samplers.texture),
                None => {
                    let texture = GpuTexture::create(backend, &material.fallback_texture(slot))?;
                    let view = texture.view;
                    fallbacks.push(texture);
                    (view, samplers.constant)
                }
            };
            entries.push((slot.texture_binding(), BindGroupEntry::Texture(view)));
            entries.push((slot.sampler_binding(), BindGroupEntry::Sampler(sampler)));
        }

        let bind_group = backend.create_bind_group(layout, &entries)?;
        log::debug!(
            "Created material '{}' ({} constant slots)",
            material.name,
            fallbacks.len()
        );

        Ok(Self {
            aux_buffer,
            fallbacks,
            bind_group,
        })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_bind_group(self.bind_group);
        for texture in &self.fallbacks {
            texture.destroy(backend);
        }
        backend.destroy_buffer(self.aux_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(feature = "headless")]
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_slot_bindings_are_disjoint() {
        let mut bindings: Vec<u32> = material_layout_entries().iter().map(|e| e.binding).collect();
        bindings.sort_unstable();
        assert_eq!(bindings, (0..11).collect::<Vec<_>>());
        assert_eq!(MaterialSlot::Normal.texture_binding(), 9);
        assert_eq!(MaterialSlot::Normal.sampler_binding(), 10);
    }

    #[test]
    fn test_aux_flags() {
        let material = Material::new("brick")
            .with_normal_map(TextureId(0), true)
            .with_roughness_mode(RoughnessMode::Glossiness);
        assert_eq!(
            material.aux(),
            MaterialAux {
                normal_map_mode: 2,
                roughness_glossy_mode: 1,
                _pad: [0; 2],
            }
        );
        assert_eq!(std::mem::size_of::<MaterialAux>(), 16);
    }

    #[test]
    fn test_fallback_carries_scalar_values() {
        let material = Material::new("m")
            .with_albedo(Vec3::new(0.1, 0.2, 0.3))
            .with_roughness(0.75);
        let albedo = material.fallback_texture(MaterialSlot::Albedo);
        assert_eq!(albedo.format, TextureFormat::Rgba32Float);
        assert_eq!(
            bytemuck::pod_collect_to_vec::<u8, f32>(&albedo.data),
            vec![0.1, 0.2, 0.3, 1.0]
        );
        let roughness = material.fallback_texture(MaterialSlot::Roughness);
        assert_eq!(roughness.format, TextureFormat::R32Float);
        assert_eq!(roughness.data, 0.75f32.to_ne_bytes().to_vec());
    }

    #[test]
    #[cfg(feature = "headless")]
    fn test_missing_slots_get_fallbacks() {
        let mut backend = HeadlessBackend::default();
        let layout = backend
            .create_bind_group_layout(&material_layout_entries())
            .unwrap();
        let samplers = MaterialSamplers::create(&mut backend).unwrap();
        let authored = GpuTexture::create(
            &mut backend,
            &TextureData::checkerboard(8, [255; 4], [0, 0, 0, 255]),
        )
        .unwrap();

        let mut views = [None; 5];
        views[MaterialSlot::Albedo as usize] = Some(authored.view);
        let material = GpuMaterial::create(
            &mut backend,
            &Material::default(),
            views,
            &samplers,
            layout,
        )
        .unwrap();
        assert_eq!(material.fallbacks.len(), 4);

        let before_destroy = backend.live_objects().textures;
        material.destroy(&mut backend);
        assert_eq!(backend.live_objects().textures, before_destroy - 4);
    }
}
