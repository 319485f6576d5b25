//! Scene management
//!
//! [`Scene`] owns meshes, textures, materials, objects and lights in flat
//! registries addressed by opaque ids. GPU copies are created by
//! [`Scene::upload`] and live until [`Scene::destroy`].

mod bounds;
mod camera;
mod light;
mod transform;

pub use bounds::*;
pub use camera::*;
pub use light::*;
pub use transform::*;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::{
    GpuBuffer, GpuMaterial, GpuMesh, GpuTexture, Material, MaterialSamplers, MaterialSlot, Mesh,
    TextureData,
};
use glam::{Mat4, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightId(pub(crate) usize);

/// A mesh placed in the world with a material
#[derive(Debug, Clone)]
pub struct SceneObject {
    pub mesh: MeshId,
    pub material: MaterialId,
    pub transform: Transform,
}

/// Everything a stage needs to issue one indexed draw
#[derive(Debug, Clone, Copy)]
pub struct DrawItem {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
    pub model: Mat4,
    pub material: BindGroupHandle,
}

struct SceneGpu {
    meshes: Vec<GpuMesh>,
    textures: Vec<GpuTexture>,
    materials: Vec<GpuMaterial>,
    samplers: MaterialSamplers,
    directional_light: GpuBuffer<DirectionalLight>,
    point_lights: GpuBuffer<PointLight>,
}

/// Scene registry
pub struct Scene {
    meshes: Vec<Mesh>,
    textures: Vec<TextureData>,
    materials: Vec<Material>,
    objects: Vec<SceneObject>,
    point_lights: Vec<PointLight>,
    directional_light: DirectionalLight,
    lights_dirty: bool,
    gpu: Option<SceneGpu>,
}

impl Scene {
    pub fn new() -> Self {
        Self {
            meshes: Vec::new(),
            textures: Vec::new(),
            materials: Vec::new(),
            objects: Vec::new(),
            point_lights: Vec::new(),
            directional_light: DirectionalLight::default(),
            lights_dirty: false,
            gpu: None,
        }
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.meshes.push(mesh);
        MeshId(self.meshes.len() - 1)
    }

    pub fn add_texture(&mut self, texture: TextureData) -> TextureId {
        self.textures.push(texture);
        TextureId(self.textures.len() - 1)
    }

    pub fn add_material(&mut self, material: Material) -> BackendResult<MaterialId> {
        for texture in material.textures.iter().flatten() {
            if texture.0 >= self.textures.len() {
                return Err(BackendError::InvalidHandle(format!(
                    "material '{}' references missing {:?}",
                    material.name, texture
                )));
            }
        }
        self.materials.push(material);
        Ok(MaterialId(self.materials.len() - 1))
    }

    pub fn add_object(
        &mut self,
        mesh: MeshId,
        material: MaterialId,
        transform: Transform,
    ) -> BackendResult<ObjectId> {
        if mesh.0 >= self.meshes.len() || material.0 >= self.materials.len() {
            return Err(BackendError::InvalidHandle(format!(
                "object references missing {:?} or {:?}",
                mesh, material
            )));
        }
        self.objects.push(SceneObject {
            mesh,
            material,
            transform,
        });
        Ok(ObjectId(self.objects.len() - 1))
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut SceneObject> {
        self.objects.get_mut(id.0)
    }

    pub fn objects(&self) -> &[SceneObject] {
        &self.objects
    }

    pub fn set_directional_light(&mut self, direction: Vec3, color: Vec3, intensity: f32) {
        self.directional_light = DirectionalLight::new(direction, color, intensity);
        self.lights_dirty = true;
    }

    pub fn directional_light(&self) -> &DirectionalLight {
        &self.directional_light
    }

    pub fn add_point_light(
        &mut self,
        position: Vec3,
        color: Vec3,
        radius: f32,
        intensity: f32,
    ) -> LightId {
        self.point_lights
            .push(PointLight::new(position, color, radius, intensity));
        self.lights_dirty = true;
        LightId(self.point_lights.len() - 1)
    }

    /// Mutable access marks the light buffers for re-upload
    pub fn point_light_mut(&mut self, id: LightId) -> Option<&mut PointLight> {
        self.lights_dirty = true;
        self.point_lights.get_mut(id.0)
    }

    pub fn point_lights(&self) -> &[PointLight] {
        &self.point_lights
    }

    pub fn point_light_count(&self) -> u32 {
        self.point_lights.len() as u32
    }

    /// Whether light data changed since the last [`Scene::update_light_buffers`]
    pub fn lights_dirty(&self) -> bool {
        self.lights_dirty
    }

    /// World-space bounds of every object
    pub fn bounds(&self) -> Aabb {
        self.objects.iter().fold(Aabb::EMPTY, |mut bounds, object| {
            if let Some(mesh) = self.meshes.get(object.mesh.0) {
                bounds.expand(&object.transform.world_bounds(&mesh.bounds()));
            }
            bounds
        })
    }

    pub fn is_uploaded(&self) -> bool {
        self.gpu.is_some()
    }

    /// Whether meshes, textures or materials were added since the last
    /// [`Scene::upload`]
    pub fn has_pending_uploads(&self) -> bool {
        match self.gpu.as_ref() {
            None => true,
            Some(gpu) => {
                gpu.meshes.len() < self.meshes.len()
                    || gpu.textures.len() < self.textures.len()
                    || gpu.materials.len() < self.materials.len()
            }
        }
    }

    /// Upload everything added since the previous call. Materials are bound
    /// against `material_layout`; the point light buffer is sized for at
    /// least `point_light_capacity` lights.
    pub fn upload<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        material_layout: BindGroupLayoutHandle,
        point_light_capacity: usize,
    ) -> BackendResult<()> {
        if self.gpu.is_none() {
            let samplers = MaterialSamplers::create(backend)?;
            let directional_light = GpuBuffer::with_data(
                backend,
                "directional light",
                &[self.directional_light],
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )?;
            let point_lights = GpuBuffer::new(
                backend,
                "point lights",
                point_light_capacity.max(self.point_lights.len()),
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )?;
            point_lights.write(backend, 0, &self.point_lights)?;
            self.gpu = Some(SceneGpu {
                meshes: Vec::new(),
                textures: Vec::new(),
                materials: Vec::new(),
                samplers,
                directional_light,
                point_lights,
            });
            self.lights_dirty = false;
        }
        let Some(gpu) = self.gpu.as_mut() else {
            return Ok(());
        };

        for mesh in &self.meshes[gpu.meshes.len()..] {
            gpu.meshes.push(GpuMesh::upload(backend, mesh)?);
        }
        for texture in &self.textures[gpu.textures.len()..] {
            gpu.textures.push(GpuTexture::create(backend, texture)?);
        }
        for material in &self.materials[gpu.materials.len()..] {
            let authored = MaterialSlot::ALL.map(|slot| {
                material
                    .texture(slot)
                    .and_then(|id| gpu.textures.get(id.0))
                    .map(|texture| texture.view)
            });
            gpu.materials.push(GpuMaterial::create(
                backend,
                material,
                authored,
                &gpu.samplers,
                material_layout,
            )?);
        }

        log::info!(
            "Scene uploaded: {} meshes, {} textures, {} materials, {} point lights",
            gpu.meshes.len(),
            gpu.textures.len(),
            gpu.materials.len(),
            self.point_lights.len()
        );
        Ok(())
    }

    /// Rewrite the light buffers. The point light buffer is recreated when
    /// `rebuild` is set or the lights outgrew it. Returns whether its
    /// handle changed. Callers must make sure no submitted frame still reads
    /// the buffers.
    pub fn update_light_buffers<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        rebuild: bool,
    ) -> BackendResult<bool> {
        let Some(gpu) = self.gpu.as_mut() else {
            return Err(BackendError::InvalidHandle(
                "light buffers updated before scene upload".into(),
            ));
        };

        gpu.directional_light
            .write(backend, 0, &[self.directional_light])?;

        let recreate = rebuild || self.point_lights.len() > gpu.point_lights.capacity();
        if recreate {
            let capacity = gpu.point_lights.capacity().max(self.point_lights.len());
            let replacement = GpuBuffer::new(
                backend,
                "point lights",
                capacity,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )?;
            std::mem::replace(&mut gpu.point_lights, replacement).destroy(backend);
            log::debug!("Recreated point light buffer for {} lights", capacity);
        }
        gpu.point_lights.write(backend, 0, &self.point_lights)?;
        self.lights_dirty = false;
        Ok(recreate)
    }

    pub fn point_light_buffer(&self) -> Option<&GpuBuffer<PointLight>> {
        self.gpu.as_ref().map(|gpu| &gpu.point_lights)
    }

    pub fn directional_light_buffer(&self) -> Option<&GpuBuffer<DirectionalLight>> {
        self.gpu.as_ref().map(|gpu| &gpu.directional_light)
    }

    /// Draws for every uploaded object, in insertion order
    pub fn draw_items(&self) -> Vec<DrawItem> {
        let Some(gpu) = self.gpu.as_ref() else {
            return Vec::new();
        };
        self.objects
            .iter()
            .filter_map(|object| {
                let mesh = gpu.meshes.get(object.mesh.0)?;
                let material = gpu.materials.get(object.material.0)?;
                Some(DrawItem {
                    vertex_buffer: mesh.vertex_buffer,
                    index_buffer: mesh.index_buffer,
                    index_count: mesh.index_count,
                    model: object.transform.matrix(),
                    material: material.bind_group,
                })
            })
            .collect()
    }

    /// Release every GPU resource, newest first
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        let Some(gpu) = self.gpu.take() else {
            return;
        };
        for material in gpu.materials.iter().rev() {
            material.destroy(backend);
        }
        for texture in gpu.textures.iter().rev() {
            texture.destroy(backend);
        }
        for mesh in gpu.meshes.iter().rev() {
            mesh.destroy(backend);
        }
        gpu.point_lights.destroy(backend);
        gpu.directional_light.destroy(backend);
        gpu.samplers.destroy(backend);
        log::debug!("Scene GPU resources released");
    }
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::material_layout_entries;

    fn uploaded_scene(backend: &mut HeadlessBackend) -> Scene {
        let mut scene = Scene::new();
        let cube = scene.add_mesh(Mesh::cube());
        let material = scene.add_material(Material::gold()).unwrap();
        scene
            .add_object(cube, material, Transform::from_position(Vec3::new(2.0, 0.0, 0.0)))
            .unwrap();
        scene.add_point_light(Vec3::ZERO, Vec3::ONE, 5.0, 1.0);
        let layout = backend
            .create_bind_group_layout(&material_layout_entries())
            .unwrap();
        scene.upload(backend, layout, 4).unwrap();
        scene
    }

    #[test]
    fn test_rejects_dangling_ids() {
        let mut scene = Scene::new();
        let material = Material::new("broken").with_texture(MaterialSlot::Albedo, TextureId(3));
        assert!(scene.add_material(material).is_err());
        assert!(scene
            .add_object(MeshId(0), MaterialId(0), Transform::default())
            .is_err());
    }

    #[test]
    fn test_bounds_follow_transforms() {
        let mut scene = Scene::new();
        assert!(scene.bounds().is_empty());
        let cube = scene.add_mesh(Mesh::cube());
        let material = scene.add_material(Material::default()).unwrap();
        scene
            .add_object(cube, material, Transform::from_position(Vec3::new(2.0, 0.0, 0.0)))
            .unwrap();
        scene
            .add_object(cube, material, Transform::from_position(Vec3::new(0.0, 0.0, -4.0)))
            .unwrap();
        let bounds = scene.bounds();
        assert!(bounds.min.abs_diff_eq(Vec3::new(-0.5, -0.5, -4.5), 1e-5));
        assert!(bounds.max.abs_diff_eq(Vec3::new(2.5, 0.5, 0.5), 1e-5));
    }

    #[test]
    fn test_upload_produces_draw_items() {
        let mut backend = HeadlessBackend::default();
        let scene = uploaded_scene(&mut backend);
        let items = scene.draw_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].index_count, 36);
        assert_eq!(scene.point_light_buffer().map(|b| b.capacity()), Some(4));
    }

    #[test]
    fn test_upload_picks_up_late_additions() {
        let mut backend = HeadlessBackend::default();
        let mut scene = uploaded_scene(&mut backend);
        assert!(!scene.has_pending_uploads());
        let light_buffer = scene.point_light_buffer().map(|b| b.handle());

        let sphere = scene.add_mesh(Mesh::sphere(8, 4));
        let material = scene.add_material(Material::plastic(Vec3::Y)).unwrap();
        scene
            .add_object(sphere, material, Transform::from_position(Vec3::new(-2.0, 0.0, 0.0)))
            .unwrap();
        assert!(scene.has_pending_uploads());
        assert_eq!(scene.draw_items().len(), 1);

        let layout = backend
            .create_bind_group_layout(&material_layout_entries())
            .unwrap();
        scene.upload(&mut backend, layout, 4).unwrap();
        assert!(!scene.has_pending_uploads());
        assert_eq!(scene.draw_items().len(), 2);
        // The shared buffers are created once
        assert_eq!(scene.point_light_buffer().map(|b| b.handle()), light_buffer);
    }

    #[test]
    fn test_light_buffer_grows_when_outgrown() {
        let mut backend = HeadlessBackend::default();
        let mut scene = uploaded_scene(&mut backend);
        let first = scene.point_light_buffer().map(|b| b.handle());

        scene.add_point_light(Vec3::X, Vec3::ONE, 1.0, 1.0);
        assert!(scene.lights_dirty());
        assert!(!scene.update_light_buffers(&mut backend, false).unwrap());
        assert_eq!(scene.point_light_buffer().map(|b| b.handle()), first);

        for i in 0..3 {
            scene.add_point_light(Vec3::splat(i as f32), Vec3::ONE, 1.0, 1.0);
        }
        assert!(scene.update_light_buffers(&mut backend, false).unwrap());
        let buffer = scene.point_light_buffer().unwrap();
        assert_eq!(buffer.capacity(), 5);
        assert_eq!(buffer.read(&backend).unwrap(), scene.point_lights().to_vec());
        assert!(!scene.lights_dirty());
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut backend = HeadlessBackend::default();
        let mut scene = uploaded_scene(&mut backend);
        scene.destroy(&mut backend);
        let live = backend.live_objects();
        assert_eq!(
            (live.buffers, live.textures, live.texture_views, live.samplers, live.bind_groups),
            (0, 0, 3, 0, 0)
        );
    }
}
