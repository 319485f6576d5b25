//! Clustered Renderer - a clustered forward renderer on Vulkan
//!
//! Each frame runs three GPU stages chained by semaphores:
//!
//! 1. **Depth prepass**: renders scene depth into a shared depth texture.
//! 2. **Light clustering**: a compute pass that assigns point lights to a
//!    view-space grid of clusters (16x9x24 by default, exponential depth
//!    slices) and writes compact per-cluster light lists.
//! 3. **Forward lighting**: shades each fragment against only the lights in
//!    its cluster, into an MSAA target resolved into the swapchain image.
//!
//! Every stage keeps `frames_in_flight` command lists guarded by fences, so
//! the CPU may record frame N+1 while the GPU executes frame N. Surface
//! staleness (resize, out-of-date swapchain) rebuilds the size-dependent
//! resources and skips the frame instead of failing.
//!
//! # Backends
//! - [`VulkanBackend`]: ash, gpu-allocator and naga (WGSL to SPIR-V).
//! - `HeadlessBackend` (default `headless` feature): no GPU; simulates queue
//!   ordering, semaphores, fences and surface staleness so the frame pipeline
//!   can be tested.
//!
//! # Example
//!
//! ```
//! # #[cfg(feature = "headless")]
//! # fn main() {
//! use clustered_renderer::{
//!     Camera, FrameOrchestrator, FrameStatus, HeadlessBackend, RendererConfig, Scene,
//! };
//! use clustered_renderer::resources::{Material, Mesh};
//! use clustered_renderer::scene::Transform;
//! use glam::Vec3;
//!
//! let mut backend = HeadlessBackend::default();
//! let config = RendererConfig::default();
//! let mut renderer = FrameOrchestrator::new(&mut backend, &config).unwrap();
//!
//! let mut scene = Scene::new();
//! let cube = scene.add_mesh(Mesh::cube());
//! let gold = scene.add_material(Material::gold()).unwrap();
//! scene.add_object(cube, gold, Transform::new()).unwrap();
//! scene.add_point_light(Vec3::new(0.0, 1.0, 2.0), Vec3::ONE, 5.0, 1.0);
//!
//! let mut camera = Camera::new(Vec3::new(0.0, 0.0, 5.0), Vec3::Y, -90.0, 0.0);
//! let status = renderer.render_frame(&mut backend, &mut scene, &mut camera).unwrap();
//! assert_eq!(status, FrameStatus::Presented);
//!
//! renderer.destroy(&mut backend).unwrap();
//! scene.destroy(&mut backend);
//! # }
//! # #[cfg(not(feature = "headless"))]
//! # fn main() {}
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod frame;
pub mod pipeline;
pub mod resources;
pub mod scene;
pub mod window;

pub use backend::{BackendError, BackendResult, GraphicsBackend, VulkanBackend};
#[cfg(feature = "headless")]
pub use backend::HeadlessBackend;
pub use config::{ClusterGridConfig, RendererConfig};
pub use engine::{Engine, EngineError};
pub use frame::{FrameOrchestrator, FrameStatus};
pub use scene::{Camera, Scene};
pub use window::Window;
