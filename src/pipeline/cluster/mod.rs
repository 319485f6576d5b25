//! Cluster light culling
//!
//! [`ClusterBuilder`] owns the view-space cluster bounds and drives the
//! compute pass that fills the light grid. The bounds depend only on the
//! projection and the output size, so they are rebuilt on demand by
//! [`ClusterBuilder::compute_cluster_grids`]. Light assignment runs every
//! frame through [`ClusterBuilder::compute_cluster_lights`], writing into the
//! light grid and index list of the current frame slot.

mod cull;
mod grid;
mod shader;

pub use cull::*;
pub use grid::*;
pub use shader::CLUSTER_CULL_SHADER;

use super::{shader_source, StageFrame, StageState};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config::RendererConfig;
use crate::resources::{GpuBuffer, PerFrame};
use crate::scene::{Camera, GlobalUniforms, GpuAabb, PointLight};

const CULL_LABEL: &str = "cluster culling";

/// Buffers rebound whenever one of them is replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BindingKey {
    grid_generation: u64,
    lights: BufferHandle,
    globals: BufferHandle,
}

struct GridBuffers {
    aabbs: GpuBuffer<GpuAabb>,
    gen: GpuBuffer<ClusterGenData>,
}

/// Culling outputs and submission state of one frame slot
struct ClusterFrame {
    stage: StageFrame,
    light_grid: GpuBuffer<LightGridEntry>,
    light_indices: GpuBuffer<u32>,
    /// Next free slot in `light_indices`, reset before every dispatch
    counter: GpuBuffer<u32>,
    bind_group: Option<(BindingKey, BindGroupHandle)>,
}

impl ClusterFrame {
    fn create<B: GraphicsBackend>(backend: &mut B, grid: &ClusterGrid) -> BackendResult<Self> {
        Ok(Self {
            stage: StageFrame::create(backend, CULL_LABEL, QueueKind::Compute)?,
            light_grid: GpuBuffer::new(
                backend,
                "light grid",
                grid.cluster_count() as usize,
                BufferUsage::STORAGE,
            )?,
            light_indices: GpuBuffer::new(
                backend,
                "light indices",
                grid.light_index_capacity() as usize,
                BufferUsage::STORAGE,
            )?,
            counter: GpuBuffer::new(
                backend,
                "light index counter",
                1,
                BufferUsage::STORAGE | BufferUsage::COPY_DST,
            )?,
            bind_group: None,
        })
    }

    fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        if let Some((_, bind_group)) = self.bind_group {
            backend.destroy_bind_group(bind_group);
        }
        self.counter.destroy(backend);
        self.light_indices.destroy(backend);
        self.light_grid.destroy(backend);
        self.stage.destroy(backend);
    }
}

/// Builds cluster bounds and assigns lights to clusters on the GPU
pub struct ClusterBuilder {
    grid: ClusterGrid,
    gen_data: Option<ClusterGenData>,
    buffers: Option<GridBuffers>,
    /// Bumped whenever the grid buffers are reallocated
    generation: u64,
    layout: BindGroupLayoutHandle,
    pipeline: ComputePipelineHandle,
    frames: PerFrame<ClusterFrame>,
    state: StageState,
}

impl ClusterBuilder {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        config: &RendererConfig,
    ) -> BackendResult<Self> {
        let grid = ClusterGrid::new(config.cluster_grid, config.max_lights_per_cluster);

        let layout = backend.create_bind_group_layout(&Self::layout_entries())?;
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("cluster light culling".into()),
            shader: shader_source(CLUSTER_CULL_SHADER),
            entry_point: "cs_main".into(),
            bind_group_layouts: vec![layout],
            push_constant_ranges: Vec::new(),
        })?;
        let frames = PerFrame::try_new(config.frames_in_flight as usize, |_| {
            ClusterFrame::create(backend, &grid)
        })?;

        let dims = grid.dims();
        log::info!(
            "Cluster grid {}x{}x{} ({} clusters, {} lights each)",
            dims.x,
            dims.y,
            dims.z,
            grid.cluster_count(),
            grid.max_lights_per_cluster()
        );

        Ok(Self {
            grid,
            gen_data: None,
            buffers: None,
            generation: 0,
            layout,
            pipeline,
            frames,
            state: StageState::Uninitialized,
        })
    }

    fn layout_entries() -> Vec<BindGroupLayoutEntry> {
        let storage = |binding, read_only| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::COMPUTE,
            ty: BindingType::StorageBuffer { read_only },
        };
        let uniform = |binding| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::COMPUTE,
            ty: BindingType::UniformBuffer,
        };
        vec![
            uniform(0),
            storage(1, true),
            uniform(2),
            storage(3, true),
            storage(4, false),
            storage(5, false),
            storage(6, false),
        ]
    }

    /// Recompute the bounds of every cluster from the camera's projection
    /// and viewport, and upload them with the matching [`ClusterGenData`].
    ///
    /// With `rebuild_buffers` the grid buffers are destroyed and reallocated
    /// first; otherwise they are overwritten in place. Either way no
    /// submitted frame may still read them.
    pub fn compute_cluster_grids<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        camera: &Camera,
        rebuild_buffers: bool,
    ) -> BackendResult<()> {
        let (near, far) = (camera.near_plane, camera.far_plane);
        if !(near > 0.0 && far > near && far.is_finite()) {
            return Err(BackendError::InvalidConfig(format!(
                "clip planes near={} far={} must satisfy 0 < near < far",
                near, far
            )));
        }
        let gen_data = self.grid.gen_data(camera);
        let aabbs = self.grid.build_aabbs(&gen_data);

        if rebuild_buffers || self.buffers.is_none() {
            if let Some(old) = self.buffers.take() {
                old.aabbs.destroy(backend);
                old.gen.destroy(backend);
            }
            self.buffers = Some(GridBuffers {
                aabbs: GpuBuffer::new(
                    backend,
                    "cluster aabbs",
                    aabbs.len(),
                    BufferUsage::STORAGE | BufferUsage::COPY_DST,
                )?,
                gen: GpuBuffer::new(
                    backend,
                    "cluster gen data",
                    1,
                    BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                )?,
            });
            self.generation += 1;
        }

        let Some(buffers) = self.buffers.as_ref() else {
            return Err(BackendError::BufferCreationFailed(
                "cluster grid buffers missing".into(),
            ));
        };
        buffers.aabbs.write(backend, 0, &aabbs)?;
        buffers.gen.write(backend, 0, &[gen_data])?;

        log::debug!(
            "Cluster bounds computed for {}x{} (tile {}x{} px)",
            gen_data.screen_width,
            gen_data.screen_height,
            gen_data.tile_size_px[0],
            gen_data.tile_size_px[1]
        );
        self.gen_data = Some(gen_data);
        self.state = StageState::Ready;
        Ok(())
    }

    /// Record and submit light assignment for frame slot `slot`.
    ///
    /// Waits for the slot's previous culling work, resets the index counter,
    /// dispatches one workgroup per cluster and submits behind `wait`.
    /// Returns the semaphore signaled on completion.
    pub fn compute_cluster_lights<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        slot: usize,
        globals: &GpuBuffer<GlobalUniforms>,
        lights: &GpuBuffer<PointLight>,
        wait: SemaphoreWait,
    ) -> BackendResult<SemaphoreHandle> {
        if self.state == StageState::Uninitialized {
            return Err(BackendError::CommandRecordingFailed(
                "light culling before cluster bounds were computed".into(),
            ));
        }
        let Some(buffers) = self.buffers.as_ref() else {
            return Err(BackendError::CommandRecordingFailed(
                "cluster grid buffers missing".into(),
            ));
        };
        let key = BindingKey {
            grid_generation: self.generation,
            lights: lights.handle(),
            globals: globals.handle(),
        };

        let frame = self.frames.get_mut(slot);
        let cmd = frame.stage.begin(backend)?;
        self.state = StageState::Recording;

        let bind_group = match frame.bind_group {
            Some((bound, bind_group)) if bound == key => bind_group,
            _ => {
                if let Some((_, old)) = frame.bind_group.take() {
                    backend.destroy_bind_group(old);
                }
                let bind_group = backend.create_bind_group(
                    self.layout,
                    &[
                        (0, globals.binding()),
                        (1, buffers.aabbs.binding()),
                        (2, buffers.gen.binding()),
                        (3, lights.binding()),
                        (4, frame.light_indices.binding()),
                        (5, frame.light_grid.binding()),
                        (6, frame.counter.binding()),
                    ],
                )?;
                log::trace!("Cluster culling bind group rebuilt for slot {}", slot);
                frame.bind_group = Some((key, bind_group));
                bind_group
            }
        };

        let dims = self.grid.dims();
        backend.cmd_fill_buffer(cmd, frame.counter.handle(), 0, frame.counter.byte_size(), 0)?;
        backend.cmd_bind_compute_pipeline(cmd, self.pipeline)?;
        backend.cmd_set_bind_group(cmd, PipelineBinding::Compute(self.pipeline), 0, bind_group)?;
        backend.cmd_dispatch(cmd, dims.x, dims.y, dims.z)?;

        let complete = frame.stage.submit(backend, &[wait])?;
        self.state = StageState::Submitted;
        Ok(complete)
    }

    pub fn grid(&self) -> &ClusterGrid {
        &self.grid
    }

    /// Grid parameters of the last [`ClusterBuilder::compute_cluster_grids`]
    pub fn gen_data(&self) -> Option<&ClusterGenData> {
        self.gen_data.as_ref()
    }

    /// Changes whenever the grid buffers are reallocated
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn aabb_buffer(&self) -> Option<&GpuBuffer<GpuAabb>> {
        self.buffers.as_ref().map(|buffers| &buffers.aabbs)
    }

    pub fn gen_buffer(&self) -> Option<&GpuBuffer<ClusterGenData>> {
        self.buffers.as_ref().map(|buffers| &buffers.gen)
    }

    pub fn light_grid(&self, slot: usize) -> &GpuBuffer<LightGridEntry> {
        &self.frames.get(slot).light_grid
    }

    pub fn light_indices(&self, slot: usize) -> &GpuBuffer<u32> {
        &self.frames.get(slot).light_indices
    }

    pub fn counter(&self, slot: usize) -> &GpuBuffer<u32> {
        &self.frames.get(slot).counter
    }

    /// Read back the light grid and index list of a slot. The slot's work
    /// must have completed.
    pub fn read_assignment<B: GraphicsBackend>(
        &self,
        backend: &B,
        slot: usize,
    ) -> BackendResult<LightAssignment> {
        let frame = self.frames.get(slot);
        Ok(LightAssignment {
            grid: frame.light_grid.read(backend)?,
            indices: frame.light_indices.read(backend)?,
        })
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for frame in self.frames.drain() {
            frame.destroy(backend);
        }
        if let Some(buffers) = self.buffers.take() {
            buffers.aabbs.destroy(backend);
            buffers.gen.destroy(backend);
        }
        backend.destroy_compute_pipeline(self.pipeline);
        backend.destroy_bind_group_layout(self.layout);
        self.state = StageState::Uninitialized;
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::headless::RecordedCommand;
    use crate::backend::HeadlessBackend;

    fn setup() -> (HeadlessBackend, ClusterBuilder, Camera) {
        let mut backend = HeadlessBackend::new(1280, 720);
        let config = RendererConfig::default();
        let builder = ClusterBuilder::new(&mut backend, &config).unwrap();
        let mut camera = Camera::default();
        camera.update_viewport_size(1280, 720);
        (backend, builder, camera)
    }

    /// Submit an empty list that signals a fresh semaphore, standing in for
    /// the depth prepass.
    fn signaled(backend: &mut HeadlessBackend) -> SemaphoreWait {
        let semaphore = backend.create_semaphore("depth complete").unwrap();
        let cmd = backend
            .create_command_list("depth", QueueKind::Graphics)
            .unwrap();
        backend.begin_command_list(cmd).unwrap();
        backend.end_command_list(cmd).unwrap();
        backend
            .submit(&Submission {
                command_lists: vec![cmd],
                signals: vec![semaphore],
                ..Default::default()
            })
            .unwrap();
        SemaphoreWait {
            semaphore,
            stage: PipelineStage::COMPUTE_SHADER,
        }
    }

    #[test]
    fn test_culling_requires_bounds() {
        let (mut backend, mut builder, camera) = setup();
        let globals = GpuBuffer::with_data(
            &mut backend,
            "globals",
            &[camera.uniforms(0)],
            BufferUsage::UNIFORM,
        )
        .unwrap();
        let lights =
            GpuBuffer::<PointLight>::new(&mut backend, "lights", 4, BufferUsage::STORAGE).unwrap();
        let wait = signaled(&mut backend);
        assert!(builder
            .compute_cluster_lights(&mut backend, 0, &globals, &lights, wait)
            .is_err());
        assert_eq!(builder.state(), StageState::Uninitialized);
    }

    #[test]
    fn test_bounds_reject_degenerate_clip_planes() {
        let (mut backend, mut builder, mut camera) = setup();
        for (near, far) in [(0.0, 100.0), (-1.0, 100.0), (5.0, 5.0), (10.0, 1.0)] {
            camera.near_plane = near;
            camera.far_plane = far;
            assert!(matches!(
                builder.compute_cluster_grids(&mut backend, &camera, false),
                Err(BackendError::InvalidConfig(_))
            ));
        }
        assert!(builder.aabb_buffer().is_none());
        assert!(builder.gen_data().is_none());

        camera.near_plane = 0.1;
        camera.far_plane = 100.0;
        builder.compute_cluster_grids(&mut backend, &camera, false).unwrap();
        let gen = builder.gen_data().unwrap();
        assert!(gen.z_near.is_finite() && gen.z_far.is_finite());
    }

    #[test]
    fn test_rebuild_reallocates_in_place_write_does_not() {
        let (mut backend, mut builder, camera) = setup();
        builder.compute_cluster_grids(&mut backend, &camera, false).unwrap();
        let first = builder.aabb_buffer().unwrap().handle();
        assert_eq!(builder.generation(), 1);

        builder.compute_cluster_grids(&mut backend, &camera, false).unwrap();
        assert_eq!(builder.aabb_buffer().unwrap().handle(), first);
        assert_eq!(builder.generation(), 1);

        builder.compute_cluster_grids(&mut backend, &camera, true).unwrap();
        assert_ne!(builder.aabb_buffer().unwrap().handle(), first);
        assert_eq!(builder.generation(), 2);
        assert_eq!(
            builder.aabb_buffer().unwrap().capacity(),
            builder.grid().cluster_count() as usize
        );
    }

    #[test]
    fn test_dispatch_covers_grid_and_resets_counter() {
        let (mut backend, mut builder, camera) = setup();
        builder.compute_cluster_grids(&mut backend, &camera, false).unwrap();
        let globals = GpuBuffer::with_data(
            &mut backend,
            "globals",
            &[camera.uniforms(1)],
            BufferUsage::UNIFORM,
        )
        .unwrap();
        let lights =
            GpuBuffer::<PointLight>::new(&mut backend, "lights", 4, BufferUsage::STORAGE).unwrap();

        builder.counter(0).write(&mut backend, 0, &[1234]).unwrap();
        let wait = signaled(&mut backend);
        let complete = builder
            .compute_cluster_lights(&mut backend, 0, &globals, &lights, wait)
            .unwrap();
        assert_eq!(builder.state(), StageState::Submitted);
        assert_eq!(builder.counter(0).read(&backend).unwrap(), vec![0]);

        let cmd = backend.command_lists_labeled(CULL_LABEL)[0];
        let commands = backend.recorded_commands(cmd).unwrap();
        assert!(matches!(commands[0], RecordedCommand::FillBuffer { value: 0, .. }));
        assert_eq!(commands.last(), Some(&RecordedCommand::Dispatch(16, 9, 24)));

        let record = backend.submissions().last().unwrap();
        assert_eq!(record.queue, QueueKind::Compute);
        assert_eq!(
            record.waits,
            vec![("depth complete".to_string(), PipelineStage::COMPUTE_SHADER)]
        );
        assert_eq!(record.signals, vec!["cluster culling complete".to_string()]);
        assert_ne!(complete, wait.semaphore);
    }

    #[test]
    fn test_bind_group_follows_light_buffer() {
        let (mut backend, mut builder, camera) = setup();
        builder.compute_cluster_grids(&mut backend, &camera, false).unwrap();
        let globals = GpuBuffer::with_data(
            &mut backend,
            "globals",
            &[camera.uniforms(0)],
            BufferUsage::UNIFORM,
        )
        .unwrap();
        let lights =
            GpuBuffer::<PointLight>::new(&mut backend, "lights", 4, BufferUsage::STORAGE).unwrap();

        let wait = signaled(&mut backend);
        builder
            .compute_cluster_lights(&mut backend, 0, &globals, &lights, wait)
            .unwrap();
        let bind_groups = backend.live_objects().bind_groups;

        backend.wait_idle().unwrap();
        let replacement =
            GpuBuffer::<PointLight>::new(&mut backend, "lights", 8, BufferUsage::STORAGE).unwrap();
        let wait = signaled(&mut backend);
        builder
            .compute_cluster_lights(&mut backend, 0, &globals, &replacement, wait)
            .unwrap();
        assert_eq!(backend.live_objects().bind_groups, bind_groups);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (mut backend, mut builder, camera) = setup();
        builder.compute_cluster_grids(&mut backend, &camera, true).unwrap();
        builder.destroy(&mut backend);
        let live = backend.live_objects();
        assert_eq!(
            (live.buffers, live.compute_pipelines, live.command_lists, live.fences),
            (0, 0, 0, 0)
        );
    }
}
