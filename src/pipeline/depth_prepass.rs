//! Depth prepass
//!
//! Renders every draw depth-only into the shared depth attachment. The
//! forward pass later tests against it with `LessEqual` and no writes, so
//! each visible fragment is shaded once.

use super::{shader_source, StageFrame, StageState};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::{GpuBuffer, PerFrame, RenderTarget, SharedAttachments};
use crate::scene::{DrawItem, GlobalUniforms};

const LABEL: &str = "depth prepass";

/// Per-draw push constant block shared by the prepass and the forward pass
pub(crate) const MODEL_PUSH_CONSTANT: PushConstantRange = PushConstantRange {
    stages: ShaderStageFlags::VERTEX,
    offset: 0,
    size: std::mem::size_of::<glam::Mat4>() as u32,
};

const DEPTH_PREPASS_SHADER: &str = r#"
struct DrawConstants {
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
var<push_constant> draw: DrawConstants;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return globals.projection * globals.view * draw.model * vec4<f32>(position, 1.0);
}
"#;

struct DepthFrame {
    stage: StageFrame,
    globals: Option<(BufferHandle, BindGroupHandle)>,
}

/// Depth-only pass over the scene's draws
pub struct DepthPrepassStage {
    target: RenderTarget,
    layout: BindGroupLayoutHandle,
    pipeline: RenderPipelineHandle,
    frames: PerFrame<DepthFrame>,
    state: StageState,
}

impl DepthPrepassStage {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        depth_format: TextureFormat,
        samples: u32,
        frames_in_flight: usize,
    ) -> BackendResult<Self> {
        let target = RenderTarget::new(backend, Self::pass_layout(depth_format, samples))?;
        let layout = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX,
            ty: BindingType::UniformBuffer,
        }])?;

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(LABEL.into()),
            shader: shader_source(DEPTH_PREPASS_SHADER),
            vertex_entry: "vs_main".into(),
            fragment_entry: None,
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: vec![layout],
            push_constant_ranges: vec![MODEL_PUSH_CONSTANT],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: depth_format,
                depth_write_enabled: true,
                depth_compare: CompareFunction::Less,
            }),
            color_targets: Vec::new(),
            sample_count: samples,
            render_pass: target.render_pass(),
        })?;

        let frames = PerFrame::try_new(frames_in_flight, |_| {
            Ok(DepthFrame {
                stage: StageFrame::create(backend, LABEL, QueueKind::Graphics)?,
                globals: None,
            })
        })?;

        log::debug!("Depth prepass created ({:?}, {} samples)", depth_format, samples);
        Ok(Self {
            target,
            layout,
            pipeline,
            frames,
            state: StageState::Uninitialized,
        })
    }

    fn pass_layout(depth_format: TextureFormat, samples: u32) -> RenderPassLayout {
        RenderPassLayout {
            label: Some(LABEL.into()),
            color: None,
            resolve: None,
            depth: Some(AttachmentDescription {
                format: depth_format,
                samples,
                load_op: AttachmentLoadOp::Clear,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::DepthStencilAttachment,
            }),
            // The previous frame's forward pass may still test against the buffer
            dependency: ExternalDependency {
                src_stage: PipelineStage::EARLY_FRAGMENT_TESTS
                    | PipelineStage::LATE_FRAGMENT_TESTS,
                dst_stage: PipelineStage::EARLY_FRAGMENT_TESTS
                    | PipelineStage::LATE_FRAGMENT_TESTS,
                src_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            },
        }
    }

    /// Recreate the render pass and framebuffer for new shared attachments
    pub fn rebuild<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        attachments: &SharedAttachments,
    ) -> BackendResult<()> {
        self.target
            .rebuild(backend, attachments.extent, &[vec![attachments.depth_view]])?;
        self.state = StageState::Ready;
        Ok(())
    }

    /// Record and submit depth rendering of `items` for frame slot `slot`,
    /// behind `wait`. Returns the semaphore signaled on completion.
    pub fn record<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        slot: usize,
        globals: &GpuBuffer<GlobalUniforms>,
        items: &[DrawItem],
        wait: SemaphoreWait,
    ) -> BackendResult<SemaphoreHandle> {
        if self.state == StageState::Uninitialized {
            return Err(BackendError::CommandRecordingFailed(
                "depth prepass recorded before its framebuffer exists".into(),
            ));
        }
        let frame = self.frames.get_mut(slot);
        let cmd = frame.stage.begin(backend)?;
        self.state = StageState::Recording;

        let bind_group = match frame.globals {
            Some((buffer, bind_group)) if buffer == globals.handle() => bind_group,
            _ => {
                if let Some((_, old)) = frame.globals.take() {
                    backend.destroy_bind_group(old);
                }
                let bind_group = backend.create_bind_group(self.layout, &[(0, globals.binding())])?;
                frame.globals = Some((globals.handle(), bind_group));
                bind_group
            }
        };

        let (width, height) = self.target.extent();
        let begin = self.target.begin_info(
            0,
            vec![ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }],
        )?;
        backend.cmd_begin_render_pass(cmd, &begin)?;
        backend.cmd_set_viewport(cmd, &Viewport::flipped(width, height))?;
        backend.cmd_set_scissor(cmd, &ScissorRect::full(width, height))?;
        backend.cmd_bind_render_pipeline(cmd, self.pipeline)?;
        let binding = PipelineBinding::Render(self.pipeline);
        backend.cmd_set_bind_group(cmd, binding, 0, bind_group)?;

        for item in items {
            backend.cmd_push_constants(
                cmd,
                binding,
                ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&item.model),
            )?;
            backend.cmd_set_vertex_buffer(cmd, 0, item.vertex_buffer, 0)?;
            backend.cmd_set_index_buffer(cmd, item.index_buffer, 0, IndexFormat::Uint32)?;
            backend.cmd_draw_indexed(cmd, 0..item.index_count, 0, 0..1)?;
        }
        backend.cmd_end_render_pass(cmd)?;

        let complete = frame.stage.submit(backend, &[wait])?;
        self.state = StageState::Submitted;
        log::trace!("Depth prepass submitted for slot {} ({} draws)", slot, items.len());
        Ok(complete)
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for frame in self.frames.drain() {
            if let Some((_, bind_group)) = frame.globals {
                backend.destroy_bind_group(bind_group);
            }
            frame.stage.destroy(backend);
        }
        backend.destroy_render_pipeline(self.pipeline);
        backend.destroy_bind_group_layout(self.layout);
        self.target.destroy(backend);
        self.state = StageState::Uninitialized;
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::headless::RecordedCommand;
    use crate::backend::HeadlessBackend;
    use crate::resources::{GpuMesh, Mesh};
    use glam::Mat4;

    fn acquired(backend: &mut HeadlessBackend) -> SemaphoreWait {
        let semaphore = backend.create_semaphore("image acquired").unwrap();
        backend.acquire_next_image(semaphore).unwrap();
        SemaphoreWait {
            semaphore,
            stage: PipelineStage::EARLY_FRAGMENT_TESTS,
        }
    }

    fn setup(backend: &mut HeadlessBackend) -> (DepthPrepassStage, SharedAttachments) {
        let format = backend.find_depth_format().unwrap();
        let mut stage = DepthPrepassStage::new(backend, format, 4, 2).unwrap();
        let (extent, color_format) = (backend.surface_size(), backend.swapchain_format());
        let attachments =
            SharedAttachments::create(backend, extent, format, color_format, 4).unwrap();
        stage.rebuild(backend, &attachments).unwrap();
        (stage, attachments)
    }

    #[test]
    fn test_shader_compiles_vertex_only() {
        let (module, _) =
            crate::backend::shader::parse_wgsl(&shader_source(DEPTH_PREPASS_SHADER)).unwrap();
        assert_eq!(module.entry_points.len(), 1);
        assert_eq!(module.entry_points[0].stage, naga::ShaderStage::Vertex);
    }

    #[test]
    fn test_record_before_rebuild_fails() {
        let mut backend = HeadlessBackend::new(320, 240);
        let mut stage =
            DepthPrepassStage::new(&mut backend, TextureFormat::Depth32Float, 1, 2).unwrap();
        let globals =
            GpuBuffer::<GlobalUniforms>::new(&mut backend, "globals", 1, BufferUsage::UNIFORM)
                .unwrap();
        let wait = acquired(&mut backend);
        assert!(stage.record(&mut backend, 0, &globals, &[], wait).is_err());
    }

    #[test]
    fn test_records_one_draw_per_item() {
        let mut backend = HeadlessBackend::new(320, 240);
        let (mut stage, _attachments) = setup(&mut backend);
        let globals =
            GpuBuffer::<GlobalUniforms>::new(&mut backend, "globals", 1, BufferUsage::UNIFORM)
                .unwrap();
        let mesh = GpuMesh::upload(&mut backend, &Mesh::cube()).unwrap();
        let items: Vec<DrawItem> = (0..3)
            .map(|i| DrawItem {
                vertex_buffer: mesh.vertex_buffer,
                index_buffer: mesh.index_buffer,
                index_count: mesh.index_count,
                model: Mat4::from_translation(glam::Vec3::X * i as f32),
                material: BindGroupHandle(0),
            })
            .collect();

        let wait = acquired(&mut backend);
        stage.record(&mut backend, 0, &globals, &items, wait).unwrap();
        assert_eq!(stage.state(), StageState::Submitted);

        let cmd = backend.command_lists_labeled(LABEL)[0];
        let commands = backend.recorded_commands(cmd).unwrap();
        let draws = commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexed { index_count: 36, .. }))
            .count();
        assert_eq!(draws, 3);
        assert!(commands.contains(&RecordedCommand::SetViewport(Viewport::flipped(320, 240))));
        assert_eq!(commands.last(), Some(&RecordedCommand::EndRenderPass));
    }

    #[test]
    fn test_rebuild_follows_new_extent() {
        let mut backend = HeadlessBackend::new(320, 240);
        let (mut stage, attachments) = setup(&mut backend);
        attachments.destroy(&mut backend);

        backend.resize_surface(640, 480);
        let extent = backend.recreate_swapchain(640, 480).unwrap();
        let color_format = backend.swapchain_format();
        let resized = SharedAttachments::create(
            &mut backend,
            extent,
            TextureFormat::Depth32Float,
            color_format,
            4,
        )
        .unwrap();
        stage.rebuild(&mut backend, &resized).unwrap();

        let framebuffer = stage.target().framebuffer(0).unwrap();
        assert_eq!(backend.framebuffer_extent(framebuffer), Some((640, 480)));
        assert_eq!(backend.live_objects().framebuffers, 1);

        stage.destroy(&mut backend);
        resized.destroy(&mut backend);
        let live = backend.live_objects();
        assert_eq!((live.framebuffers, live.render_passes, live.render_pipelines), (0, 0, 0));
    }
}
