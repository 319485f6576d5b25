//! Frame orchestration for the clustered forward pipeline.
//!
//! [`FrameOrchestrator`] owns the three stages, the size-dependent
//! attachments they share and one [`FrameSync`] per frame-in-flight slot.
//! Each call to [`FrameOrchestrator::render_frame`] renders and presents a
//! single frame.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         FrameOrchestrator                            │
//! │                                                                      │
//! │  slot f = frame % frames_in_flight                                   │
//! │                                                                      │
//! │  acquire ──image acquired[f]──► depth prepass                        │
//! │                                     │ depth complete                 │
//! │                                     ▼                                │
//! │                               cluster culling                        │
//! │                                     │ cluster culling complete       │
//! │                                     ▼                                │
//! │                               forward lighting ──► present           │
//! │                                        forward lighting complete     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Synchronization
//!
//! | Edge | Primitive | Wait stage |
//! |------|-----------|------------|
//! | acquire → depth prepass | `image acquired [f]` semaphore | early fragment tests |
//! | depth prepass → culling | `depth prepass complete` semaphore | compute shader |
//! | culling → forward | `cluster culling complete` semaphore | early fragment tests onward |
//! | forward → present | `forward lighting complete` semaphore | presentation engine |
//! | slot reuse | one fence per stage and slot | CPU |
//!
//! Within a frame nothing blocks the CPU: stage order is carried entirely by
//! the semaphore chain. Across frames, a stage waits on its own fence for
//! slot `f` before re-recording that slot's command list, so at most
//! `frames_in_flight` submissions per stage are ever pending.
//!
//! # Frame overlap
//!
//! ```text
//! Time ──────────────────────────────────────────────────────────►
//!
//! CPU:  [Record 0][Record 1][wait f0][Record 2][wait f1][Record 3]
//!            │         │                 │                 │
//! GPU:       └─[Execute 0]──[Execute 1]──[Execute 2]──[Execute 3]
//! ```
//!
//! # Surface staleness
//!
//! An out-of-date surface at acquire rebuilds every size-dependent resource
//! and skips the frame without advancing the slot. Out-of-date or
//! suboptimal presentation, a suboptimal acquire and an explicit
//! [`FrameOrchestrator::notify_resized`] rebuild after the frame is
//! presented. A rebuild always starts from an idle device.
//!
//! # Shutdown
//!
//! Call [`FrameOrchestrator::destroy`] before the backend goes away. It waits
//! for the device to go idle and releases everything in reverse creation
//! order.

mod slots;

pub use slots::*;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config::RendererConfig;
use crate::pipeline::forward_pass::ForwardInputs;
use crate::pipeline::{ClusterBuilder, DepthPrepassStage, ForwardLightingStage};
use crate::resources::{PerFrame, SharedAttachments};
use crate::scene::{Camera, ProjectionKey, Scene};

/// Outcome of [`FrameOrchestrator::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was rendered and queued for presentation
    Presented,
    /// The surface was stale or minimized; nothing was submitted
    Skipped,
}

/// Sequences depth prepass, light culling and forward lighting for every
/// frame and recovers from surface changes.
pub struct FrameOrchestrator {
    config: RendererConfig,
    depth_format: TextureFormat,
    samples: u32,
    attachments: SharedAttachments,
    depth: DepthPrepassStage,
    clusters: ClusterBuilder,
    forward: ForwardLightingStage,
    sync: PerFrame<FrameSync>,
    slots: FrameSlots,
    /// Projection the cluster bounds were last computed for
    projection_key: Option<ProjectionKey>,
    /// Extent reported by the window system, applied at the next rebuild
    pending_resize: Option<(u32, u32)>,
}

impl FrameOrchestrator {
    /// Validate `config` and build every stage against the backend's
    /// current swapchain.
    ///
    /// The MSAA sample count is clamped to what the device supports. A
    /// device without a usable depth format is a fatal
    /// [`BackendError::Unsupported`].
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        config: &RendererConfig,
    ) -> BackendResult<Self> {
        config.validate()?;

        let depth_format = backend.find_depth_format()?;
        let max_samples = backend.max_msaa_samples().max(1);
        let samples = if config.msaa_samples > max_samples {
            log::warn!(
                "{}x MSAA unsupported, falling back to {}x",
                config.msaa_samples,
                max_samples
            );
            max_samples
        } else {
            config.msaa_samples
        };
        let color_format = backend.swapchain_format();
        let extent = backend.surface_size();
        let frames_in_flight = config.frames_in_flight as usize;

        let attachments = SharedAttachments::create(
            backend,
            extent,
            depth_format,
            color_format,
            samples,
        )?;
        let mut depth = DepthPrepassStage::new(backend, depth_format, samples, frames_in_flight)?;
        let clusters = ClusterBuilder::new(backend, config)?;
        let mut forward = ForwardLightingStage::new(
            backend,
            color_format,
            depth_format,
            samples,
            frames_in_flight,
            config.clear_color,
        )?;
        depth.rebuild(backend, &attachments)?;
        forward.rebuild(backend, &attachments)?;
        let sync = PerFrame::try_new(frames_in_flight, |slot| FrameSync::create(backend, slot))?;

        log::info!(
            "Frame orchestrator ready: {}x{}, {} frames in flight, {:?} depth, {}x MSAA",
            attachments.extent.0,
            attachments.extent.1,
            frames_in_flight,
            depth_format,
            samples
        );

        Ok(Self {
            config: config.clone(),
            depth_format,
            samples,
            attachments,
            depth,
            clusters,
            forward,
            sync,
            slots: FrameSlots::new(frames_in_flight),
            projection_key: None,
            pending_resize: None,
        })
    }

    /// Record that the window system resized the surface. The rebuild
    /// happens at the next frame boundary that notices it.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        log::debug!("Surface resize to {}x{} requested", width, height);
        self.pending_resize = Some((width, height));
    }

    /// Render and present one frame of `scene` seen through `camera`.
    ///
    /// Uploads scene content added since the previous frame and re-uploads
    /// light data that changed. The camera's viewport follows the swapchain
    /// extent. Surface staleness is recovered here and reported as
    /// [`FrameStatus::Skipped`], never as an error.
    pub fn render_frame<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        scene: &mut Scene,
        camera: &mut Camera,
    ) -> BackendResult<FrameStatus> {
        if matches!(self.pending_resize, Some((0, _)) | Some((_, 0))) {
            return Ok(FrameStatus::Skipped);
        }

        let slot = self.slots.begin_frame();
        backend.wait_fence(self.forward.frame_fence(slot))?;

        let image_acquired = self.sync.get(slot).image_acquired;
        let (image_index, suboptimal) = match backend.acquire_next_image(image_acquired)? {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::warn!("Surface out of date at acquire, rebuilding");
                self.slots.cancel_frame();
                self.rebuild(backend, camera)?;
                return Ok(FrameStatus::Skipped);
            }
        };

        self.prepare_scene(backend, scene, camera)?;

        let sync = self.sync.get(slot);
        sync.globals
            .write(backend, 0, &[camera.uniforms(self.visible_light_count(scene))])?;
        let (Some(point_lights), Some(directional_light)) =
            (scene.point_light_buffer(), scene.directional_light_buffer())
        else {
            return Err(BackendError::InvalidHandle(
                "scene light buffers missing after upload".into(),
            ));
        };
        let items = scene.draw_items();

        let depth_complete = self.depth.record(
            backend,
            slot,
            &sync.globals,
            &items,
            SemaphoreWait {
                semaphore: image_acquired,
                stage: PipelineStage::EARLY_FRAGMENT_TESTS,
            },
        )?;
        let cluster_complete = self.clusters.compute_cluster_lights(
            backend,
            slot,
            &sync.globals,
            point_lights,
            SemaphoreWait {
                semaphore: depth_complete,
                stage: PipelineStage::COMPUTE_SHADER,
            },
        )?;
        let inputs = ForwardInputs {
            globals: &sync.globals,
            directional_light,
            point_lights,
            clusters: &self.clusters,
        };
        let render_complete = self.forward.record(
            backend,
            slot,
            image_index,
            &inputs,
            &items,
            SemaphoreWait {
                semaphore: cluster_complete,
                stage: PipelineStage::FRAGMENT_SHADER
                    | PipelineStage::EARLY_FRAGMENT_TESTS
                    | PipelineStage::COLOR_ATTACHMENT_OUTPUT,
            },
        )?;

        let presented = backend.present(image_index, render_complete)?;
        self.slots.end_frame();

        let stale = match presented {
            PresentOutcome::Presented => suboptimal,
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => true,
        };
        if stale || self.pending_resize.is_some() {
            log::warn!(
                "Surface changed at present ({:?}, suboptimal acquire: {}), rebuilding",
                presented,
                suboptimal
            );
            self.rebuild(backend, camera)?;
        }
        Ok(FrameStatus::Presented)
    }

    /// Upload scene content added since the last frame, refresh changed light
    /// data and recompute cluster bounds when the projection moved.
    fn prepare_scene<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        scene: &mut Scene,
        camera: &mut Camera,
    ) -> BackendResult<()> {
        if scene.has_pending_uploads() {
            scene.upload(
                backend,
                self.forward.material_layout(),
                self.config.max_point_lights as usize,
            )?;
        }
        if scene.lights_dirty() {
            backend.wait_idle()?;
            if scene.update_light_buffers(backend, false)? {
                log::debug!("Point light buffer replaced");
            }
        }

        let (width, height) = self.attachments.extent;
        if camera.viewport_size() != (width, height) {
            camera.update_viewport_size(width, height);
        }
        let key = camera.projection_key();
        if self.projection_key != Some(key) {
            if self.projection_key.is_some() {
                backend.wait_idle()?;
            }
            let rebuild_buffers = self.clusters.aabb_buffer().is_none();
            self.clusters
                .compute_cluster_grids(backend, camera, rebuild_buffers)?;
            self.projection_key = Some(key);
        }
        Ok(())
    }

    fn visible_light_count(&self, scene: &Scene) -> u32 {
        let capacity = scene
            .point_light_buffer()
            .map_or(0, |buffer| buffer.capacity() as u32);
        scene.point_light_count().min(capacity)
    }

    /// Rebuild everything that depends on the surface extent: swapchain,
    /// shared attachments, render passes, framebuffers and cluster bounds.
    fn rebuild<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        camera: &mut Camera,
    ) -> BackendResult<()> {
        let (width, height) = self.pending_resize.unwrap_or(self.attachments.extent);
        if width == 0 || height == 0 {
            log::debug!("Surface minimized, postponing rebuild");
            return Ok(());
        }

        backend.wait_idle()?;
        let extent = backend.recreate_swapchain(width, height)?;
        self.pending_resize = None;

        let color_format = backend.swapchain_format();
        let attachments = SharedAttachments::create(
            backend,
            extent,
            self.depth_format,
            color_format,
            self.samples,
        )?;
        std::mem::replace(&mut self.attachments, attachments).destroy(backend);
        self.depth.rebuild(backend, &self.attachments)?;
        self.forward.rebuild(backend, &self.attachments)?;

        camera.update_viewport_size(extent.0, extent.1);
        self.clusters.compute_cluster_grids(backend, camera, true)?;
        self.projection_key = Some(camera.projection_key());

        log::info!("Rebuilt size-dependent resources at {}x{}", extent.0, extent.1);
        Ok(())
    }

    /// Frames rendered so far, skipped frames excluded
    pub fn frame_count(&self) -> u64 {
        self.slots.frame_count()
    }

    pub fn current_slot(&self) -> usize {
        self.slots.current_slot()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.frames_in_flight()
    }

    /// Extent of the current attachments
    pub fn extent(&self) -> (u32, u32) {
        self.attachments.extent
    }

    /// Sample count actually in use after clamping
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Layout materials must be created against
    pub fn material_layout(&self) -> BindGroupLayoutHandle {
        self.forward.material_layout()
    }

    pub fn clusters(&self) -> &ClusterBuilder {
        &self.clusters
    }

    pub fn depth_prepass(&self) -> &DepthPrepassStage {
        &self.depth
    }

    pub fn forward_lighting(&self) -> &ForwardLightingStage {
        &self.forward
    }

    /// Wait for the device and release every resource the orchestrator owns.
    /// The scene is released separately.
    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) -> BackendResult<()> {
        backend.wait_idle()?;
        for sync in self.sync.drain() {
            sync.destroy(backend);
        }
        self.forward.destroy(backend);
        self.clusters.destroy(backend);
        self.depth.destroy(backend);
        self.attachments.destroy(backend);
        log::debug!("Frame orchestrator destroyed after {} frames", self.frame_count());
        Ok(())
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::{Material, Mesh};
    use crate::scene::Transform;
    use glam::Vec3;

    fn scene() -> Scene {
        let mut scene = Scene::new();
        let cube = scene.add_mesh(Mesh::cube());
        let material = scene.add_material(Material::default()).unwrap();
        scene
            .add_object(cube, material, Transform::from_position(Vec3::new(0.0, 0.0, -5.0)))
            .unwrap();
        scene.add_point_light(Vec3::new(0.0, 1.0, -4.0), Vec3::ONE, 3.0, 1.0);
        scene
    }

    #[test]
    fn test_msaa_clamped_to_device() {
        let mut backend = HeadlessBackend::new(640, 480);
        backend.set_max_msaa_samples(2);
        let mut orchestrator =
            FrameOrchestrator::new(&mut backend, &RendererConfig::default()).unwrap();
        assert_eq!(orchestrator.samples(), 2);
        orchestrator.destroy(&mut backend).unwrap();
    }

    #[test]
    fn test_missing_depth_format_is_unsupported() {
        let mut backend = HeadlessBackend::new(640, 480);
        backend.set_supported_depth_formats(Vec::new());
        let result = FrameOrchestrator::new(&mut backend, &RendererConfig::default());
        assert!(matches!(result, Err(BackendError::Unsupported(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut backend = HeadlessBackend::new(640, 480);
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert!(matches!(
            FrameOrchestrator::new(&mut backend, &config),
            Err(BackendError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_first_frame_uploads_and_sizes_camera() {
        let mut backend = HeadlessBackend::new(640, 480);
        let mut orchestrator =
            FrameOrchestrator::new(&mut backend, &RendererConfig::default()).unwrap();
        let mut scene = scene();
        let mut camera = Camera::default();

        let status = orchestrator
            .render_frame(&mut backend, &mut scene, &mut camera)
            .unwrap();
        assert_eq!(status, FrameStatus::Presented);
        assert!(scene.is_uploaded());
        assert_eq!(camera.viewport_size(), (640, 480));
        assert_eq!(orchestrator.clusters().generation(), 1);
        assert_eq!(backend.presented_frames(), 1);
        assert_eq!(orchestrator.current_slot(), 1);

        orchestrator.destroy(&mut backend).unwrap();
        scene.destroy(&mut backend);
    }

    #[test]
    fn test_minimized_surface_skips() {
        let mut backend = HeadlessBackend::new(640, 480);
        let mut orchestrator =
            FrameOrchestrator::new(&mut backend, &RendererConfig::default()).unwrap();
        let mut scene = scene();
        let mut camera = Camera::default();

        orchestrator.notify_resized(0, 0);
        let status = orchestrator
            .render_frame(&mut backend, &mut scene, &mut camera)
            .unwrap();
        assert_eq!(status, FrameStatus::Skipped);
        assert!(backend.submissions().is_empty());
        assert_eq!(orchestrator.frame_count(), 0);
    }

    #[test]
    fn test_light_change_reaches_gpu_buffer() {
        let mut backend = HeadlessBackend::new(640, 480);
        let mut orchestrator =
            FrameOrchestrator::new(&mut backend, &RendererConfig::default()).unwrap();
        let mut scene = scene();
        let mut camera = Camera::default();
        orchestrator
            .render_frame(&mut backend, &mut scene, &mut camera)
            .unwrap();

        let light = scene.add_point_light(Vec3::X, Vec3::ONE, 1.0, 2.0);
        orchestrator
            .render_frame(&mut backend, &mut scene, &mut camera)
            .unwrap();
        assert!(!scene.lights_dirty());
        let uploaded = scene.point_light_buffer().unwrap().read(&backend).unwrap();
        assert_eq!(uploaded[light.0], scene.point_lights()[light.0]);
    }
}
