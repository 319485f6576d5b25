//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use clustered_renderer::resources::{Material, Mesh};
use clustered_renderer::scene::Transform;
use clustered_renderer::{Camera, FrameOrchestrator, HeadlessBackend, RendererConfig, Scene};
use glam::Vec3;

/// Route `log` output through the test harness; repeated calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A floor, a cube and `lights` point lights strung along the view axis.
pub fn test_scene(lights: u32) -> Scene {
    let mut scene = Scene::new();
    let floor = scene.add_mesh(Mesh::plane(20.0, 20.0, 1));
    let cube = scene.add_mesh(Mesh::cube());
    let material = scene.add_material(Material::plastic(Vec3::splat(0.8))).unwrap();

    scene
        .add_object(floor, material, Transform::from_position(Vec3::new(0.0, -1.0, 0.0)))
        .unwrap();
    scene
        .add_object(cube, material, Transform::from_position(Vec3::new(0.0, 0.0, -5.0)))
        .unwrap();

    for i in 0..lights {
        scene.add_point_light(
            Vec3::new((i % 4) as f32 - 1.5, 0.5, -2.0 - i as f32),
            Vec3::ONE,
            2.0,
            1.0,
        );
    }
    scene
}

/// Camera at the origin looking down -Z.
pub fn test_camera() -> Camera {
    Camera::new(Vec3::ZERO, Vec3::Y, -90.0, 0.0)
}

/// Everything a frame needs, torn down in the right order on [`Harness::finish`].
pub struct Harness {
    pub backend: HeadlessBackend,
    pub orchestrator: FrameOrchestrator,
    pub scene: Scene,
    pub camera: Camera,
}

impl Harness {
    pub fn new(width: u32, height: u32, config: &RendererConfig, lights: u32) -> Self {
        init_logging();
        let mut backend = HeadlessBackend::new(width, height);
        let orchestrator = FrameOrchestrator::new(&mut backend, config).unwrap();
        Self {
            backend,
            orchestrator,
            scene: test_scene(lights),
            camera: test_camera(),
        }
    }

    pub fn render(&mut self) -> clustered_renderer::FrameStatus {
        self.orchestrator
            .render_frame(&mut self.backend, &mut self.scene, &mut self.camera)
            .unwrap()
    }

    pub fn finish(mut self) {
        self.orchestrator.destroy(&mut self.backend).unwrap();
        self.scene.destroy(&mut self.backend);
    }
}
