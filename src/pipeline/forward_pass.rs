//! Forward lighting pass
//!
//! Shades every draw against the directional light and the point lights of
//! the cluster each fragment falls in. Depth comes from the prepass
//! (`LessEqual`, no writes) and the light grid from the culling pass of the
//! same frame slot.
//!
//! With MSAA the pass renders into a transient multisampled color buffer and
//! resolves into the swapchain image; otherwise it renders into the
//! swapchain image directly. One framebuffer exists per swapchain image.

use super::cluster::ClusterBuilder;
use super::depth_prepass::MODEL_PUSH_CONSTANT;
use super::{shader_source, StageFrame, StageState};
use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::{
    material_layout_entries, GpuBuffer, PerFrame, RenderTarget, SharedAttachments,
};
use crate::scene::{DirectionalLight, DrawItem, GlobalUniforms, PointLight};

const LABEL: &str = "forward lighting";

const FORWARD_SHADER: &str = r#"
struct DirectionalLight {
    direction: vec4<f32>,
    color_intensity: vec4<f32>,
}

struct MaterialAux {
    normal_map_mode: u32,
    roughness_glossy_mode: u32,
    _pad0: u32,
    _pad1: u32,
}

struct DrawConstants {
    model: mat4x4<f32>,
}

@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<uniform> sun: DirectionalLight;
@group(0) @binding(2) var<storage, read> point_lights: array<PointLight>;
@group(0) @binding(3) var<uniform> cluster_gen: ClusterGenData;
@group(0) @binding(4) var<storage, read> light_indices: array<u32>;
@group(0) @binding(5) var<storage, read> light_grid: array<LightGridEntry>;

@group(1) @binding(0) var<uniform> material_aux: MaterialAux;
@group(1) @binding(1) var albedo_map: texture_2d<f32>;
@group(1) @binding(2) var albedo_sampler: sampler;
@group(1) @binding(3) var metallic_map: texture_2d<f32>;
@group(1) @binding(4) var metallic_sampler: sampler;
@group(1) @binding(5) var roughness_map: texture_2d<f32>;
@group(1) @binding(6) var roughness_sampler: sampler;
@group(1) @binding(7) var ambient_map: texture_2d<f32>;
@group(1) @binding(8) var ambient_sampler: sampler;
@group(1) @binding(9) var normal_map: texture_2d<f32>;
@group(1) @binding(10) var normal_sampler: sampler;

var<push_constant> draw: DrawConstants;

const PI: f32 = 3.14159265;

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) view_depth: f32,
    @location(2) normal: vec3<f32>,
    @location(3) uv: vec2<f32>,
    @location(4) tangent: vec3<f32>,
}

@vertex
fn vs_main(
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) tangent: vec3<f32>,
) -> VertexOutput {
    let world = draw.model * vec4<f32>(position, 1.0);
    let view_position = globals.view * world;
    let normal_matrix = mat3x3<f32>(draw.model[0].xyz, draw.model[1].xyz, draw.model[2].xyz);

    var out: VertexOutput;
    out.clip_position = globals.projection * view_position;
    out.world_position = world.xyz;
    out.view_depth = -view_position.z;
    out.normal = normalize(normal_matrix * normal);
    out.uv = uv;
    out.tangent = normal_matrix * tangent;
    return out;
}

// Rows are counted from the bottom to match the flipped viewport
fn cluster_index(frag_coord: vec4<f32>, view_depth: f32) -> u32 {
    let dims = cluster_gen.grid_size;
    let from_bottom = max(f32(cluster_gen.screen_height) - frag_coord.y, 0.0);
    let tile_x = min(u32(max(frag_coord.x, 0.0)) / cluster_gen.tile_size_px.x, dims.x - 1u);
    let tile_y = min(u32(from_bottom) / cluster_gen.tile_size_px.y, dims.y - 1u);
    let slice_f = floor(
        log2(view_depth) * cluster_gen.slice_scaling_factor + cluster_gen.slice_bias_factor
    );
    let slice = min(u32(max(slice_f, 0.0)), dims.z - 1u);
    return tile_x + tile_y * dims.x + slice * dims.x * dims.y;
}

fn surface_normal(
    frag: VertexOutput,
    normal_texel: vec3<f32>,
    height_slope: vec2<f32>,
) -> vec3<f32> {
    let n = normalize(frag.normal);
    let t = normalize(frag.tangent - n * dot(frag.tangent, n));
    let b = cross(n, t);
    let mapped = normalize(mat3x3<f32>(t, b, n) * (normal_texel * 2.0 - 1.0));
    let bumped = normalize(n - (t * height_slope.x + b * height_slope.y) * 8.0);
    let mode = material_aux.normal_map_mode;
    return select(select(n, mapped, mode == 1u), bumped, mode == 2u);
}

fn shade(
    n: vec3<f32>,
    v: vec3<f32>,
    l: vec3<f32>,
    radiance: vec3<f32>,
    albedo: vec3<f32>,
    metallic: f32,
    roughness: f32,
) -> vec3<f32> {
    let n_dot_l = max(dot(n, l), 0.0);
    let h = normalize(v + l);
    let shininess = mix(256.0, 4.0, roughness);
    let highlight = pow(max(dot(n, h), 0.0), shininess) * (1.0 - roughness);
    let f0 = mix(vec3<f32>(0.04), albedo, metallic);
    let diffuse = albedo * (1.0 - metallic) / PI;
    return (diffuse + f0 * highlight) * radiance * n_dot_l;
}

fn falloff(dist: f32, radius: f32) -> f32 {
    let edge = clamp(1.0 - pow(dist / radius, 4.0), 0.0, 1.0);
    return edge * edge / (dist * dist + 1.0);
}

@fragment
fn fs_main(frag: VertexOutput) -> @location(0) vec4<f32> {
    // Sampled up front: implicit derivatives need uniform control flow
    let albedo = textureSample(albedo_map, albedo_sampler, frag.uv).rgb;
    let metallic = textureSample(metallic_map, metallic_sampler, frag.uv).r;
    let roughness_texel = textureSample(roughness_map, roughness_sampler, frag.uv).r;
    let ambient_occlusion = textureSample(ambient_map, ambient_sampler, frag.uv).r;
    let normal_texel = textureSample(normal_map, normal_sampler, frag.uv).rgb;
    let height_slope = vec2<f32>(dpdx(normal_texel.r), dpdy(normal_texel.r));

    let glossy = material_aux.roughness_glossy_mode == 1u;
    let roughness = clamp(select(roughness_texel, 1.0 - roughness_texel, glossy), 0.04, 1.0);
    let n = surface_normal(frag, normal_texel, height_slope);
    let v = normalize(globals.camera_position.xyz - frag.world_position);

    var color = shade(
        n, v, -sun.direction.xyz,
        sun.color_intensity.rgb * sun.color_intensity.w,
        albedo, metallic, roughness,
    );

    let entry = light_grid[cluster_index(frag.clip_position, frag.view_depth)];
    for (var i = 0u; i < entry.count; i = i + 1u) {
        let light = point_lights[light_indices[entry.offset + i]];
        let to_light = light.position_radius.xyz - frag.world_position;
        let dist = length(to_light);
        if dist < light.position_radius.w {
            let radiance = light.color_intensity.rgb * light.color_intensity.w
                * falloff(dist, light.position_radius.w);
            let l = to_light / max(dist, 1e-4);
            color = color + shade(n, v, l, radiance, albedo, metallic, roughness);
        }
    }

    color = color + albedo * 0.03 * ambient_occlusion;
    return vec4<f32>(color, 1.0);
}
"#;

/// Buffers the global bind group of a slot was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BindingKey {
    grid_generation: u64,
    globals: BufferHandle,
    directional: BufferHandle,
    lights: BufferHandle,
}

struct ForwardFrame {
    stage: StageFrame,
    bind_group: Option<(BindingKey, BindGroupHandle)>,
}

/// Scene-wide inputs of the forward pass for one frame
pub struct ForwardInputs<'a> {
    pub globals: &'a GpuBuffer<GlobalUniforms>,
    pub directional_light: &'a GpuBuffer<DirectionalLight>,
    pub point_lights: &'a GpuBuffer<PointLight>,
    pub clusters: &'a ClusterBuilder,
}

/// Clustered forward shading into the swapchain
pub struct ForwardLightingStage {
    target: RenderTarget,
    global_layout: BindGroupLayoutHandle,
    material_layout: BindGroupLayoutHandle,
    pipeline: RenderPipelineHandle,
    frames: PerFrame<ForwardFrame>,
    clear_color: [f32; 4],
    state: StageState,
}

impl ForwardLightingStage {
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        color_format: TextureFormat,
        depth_format: TextureFormat,
        samples: u32,
        frames_in_flight: usize,
        clear_color: [f32; 4],
    ) -> BackendResult<Self> {
        let target = RenderTarget::new(
            backend,
            Self::pass_layout(color_format, depth_format, samples),
        )?;
        let global_layout = backend.create_bind_group_layout(&Self::global_layout_entries())?;
        let material_layout = backend.create_bind_group_layout(&material_layout_entries())?;

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(LABEL.into()),
            shader: shader_source(FORWARD_SHADER),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: vec![global_layout, material_layout],
            push_constant_ranges: vec![MODEL_PUSH_CONSTANT],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState {
                format: depth_format,
                depth_write_enabled: false,
                depth_compare: CompareFunction::LessEqual,
            }),
            color_targets: vec![ColorTargetState {
                format: color_format,
                blend: None,
                write_mask: ColorWrites::ALL,
            }],
            sample_count: samples,
            render_pass: target.render_pass(),
        })?;

        let frames = PerFrame::try_new(frames_in_flight, |_| {
            Ok(ForwardFrame {
                stage: StageFrame::create(backend, LABEL, QueueKind::Graphics)?,
                bind_group: None,
            })
        })?;

        log::debug!(
            "Forward pass created ({:?} / {:?}, {} samples)",
            color_format,
            depth_format,
            samples
        );
        Ok(Self {
            target,
            global_layout,
            material_layout,
            pipeline,
            frames,
            clear_color,
            state: StageState::Uninitialized,
        })
    }

    fn global_layout_entries() -> Vec<BindGroupLayoutEntry> {
        let fragment = |binding, ty| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStageFlags::FRAGMENT,
            ty,
        };
        vec![
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty: BindingType::UniformBuffer,
            },
            fragment(1, BindingType::UniformBuffer),
            fragment(2, BindingType::StorageBuffer { read_only: true }),
            fragment(3, BindingType::UniformBuffer),
            fragment(4, BindingType::StorageBuffer { read_only: true }),
            fragment(5, BindingType::StorageBuffer { read_only: true }),
        ]
    }

    fn pass_layout(
        color_format: TextureFormat,
        depth_format: TextureFormat,
        samples: u32,
    ) -> RenderPassLayout {
        let presented = |samples, load_op, store_op, final_layout| AttachmentDescription {
            format: color_format,
            samples,
            load_op,
            store_op,
            initial_layout: ImageLayout::Undefined,
            final_layout,
        };
        let (color, resolve) = if samples > 1 {
            (
                presented(
                    samples,
                    AttachmentLoadOp::Clear,
                    StoreOp::Discard,
                    ImageLayout::ColorAttachment,
                ),
                Some(presented(
                    1,
                    AttachmentLoadOp::DontCare,
                    StoreOp::Store,
                    ImageLayout::PresentSrc,
                )),
            )
        } else {
            (
                presented(1, AttachmentLoadOp::Clear, StoreOp::Store, ImageLayout::PresentSrc),
                None,
            )
        };

        RenderPassLayout {
            label: Some(LABEL.into()),
            color: Some(color),
            resolve,
            depth: Some(AttachmentDescription {
                format: depth_format,
                samples,
                load_op: AttachmentLoadOp::Load,
                store_op: StoreOp::Store,
                initial_layout: ImageLayout::DepthStencilAttachment,
                final_layout: ImageLayout::DepthStencilAttachment,
            }),
            dependency: ExternalDependency {
                src_stage: PipelineStage::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStage::LATE_FRAGMENT_TESTS,
                dst_stage: PipelineStage::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStage::EARLY_FRAGMENT_TESTS,
                src_access: AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                dst_access: AccessFlags::COLOR_ATTACHMENT_WRITE
                    | AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            },
        }
    }

    /// Layout materials must be bound against at set 1
    pub fn material_layout(&self) -> BindGroupLayoutHandle {
        self.material_layout
    }

    /// Recreate the render pass and one framebuffer per swapchain image
    pub fn rebuild<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        attachments: &SharedAttachments,
    ) -> BackendResult<()> {
        let framebuffers = (0..backend.swapchain_image_count())
            .map(|index| -> BackendResult<Vec<TextureViewHandle>> {
                let swapchain = backend.swapchain_view(index)?;
                let mut views = Vec::with_capacity(3);
                if let Some((_, msaa)) = attachments.msaa_color {
                    views.push(msaa);
                }
                views.push(swapchain);
                views.push(attachments.depth_view);
                Ok(views)
            })
            .collect::<BackendResult<Vec<_>>>()?;
        self.target.rebuild(backend, attachments.extent, &framebuffers)?;
        self.state = StageState::Ready;
        Ok(())
    }

    /// Record and submit shading of `items` into swapchain image
    /// `image_index` for frame slot `slot`, behind `wait`. Returns the
    /// semaphore signaled on completion, which presentation waits on.
    pub fn record<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        slot: usize,
        image_index: u32,
        inputs: &ForwardInputs<'_>,
        items: &[DrawItem],
        wait: SemaphoreWait,
    ) -> BackendResult<SemaphoreHandle> {
        if self.state == StageState::Uninitialized {
            return Err(BackendError::CommandRecordingFailed(
                "forward pass recorded before its framebuffers exist".into(),
            ));
        }
        let Some(gen_buffer) = inputs.clusters.gen_buffer() else {
            return Err(BackendError::CommandRecordingFailed(
                "forward pass recorded before cluster bounds were computed".into(),
            ));
        };
        let key = BindingKey {
            grid_generation: inputs.clusters.generation(),
            globals: inputs.globals.handle(),
            directional: inputs.directional_light.handle(),
            lights: inputs.point_lights.handle(),
        };

        let frame = self.frames.get_mut(slot);
        let cmd = frame.stage.begin(backend)?;
        self.state = StageState::Recording;

        let global_group = match frame.bind_group {
            Some((bound, bind_group)) if bound == key => bind_group,
            _ => {
                if let Some((_, old)) = frame.bind_group.take() {
                    backend.destroy_bind_group(old);
                }
                let bind_group = backend.create_bind_group(
                    self.global_layout,
                    &[
                        (0, inputs.globals.binding()),
                        (1, inputs.directional_light.binding()),
                        (2, inputs.point_lights.binding()),
                        (3, gen_buffer.binding()),
                        (4, inputs.clusters.light_indices(slot).binding()),
                        (5, inputs.clusters.light_grid(slot).binding()),
                    ],
                )?;
                log::trace!("Forward bind group rebuilt for slot {}", slot);
                frame.bind_group = Some((key, bind_group));
                bind_group
            }
        };

        let color = ClearValue::Color(self.clear_color);
        let clear_values = self
            .target
            .layout()
            .attachments()
            .iter()
            .map(|attachment| {
                if attachment.format.is_depth() {
                    ClearValue::DepthStencil {
                        depth: 1.0,
                        stencil: 0,
                    }
                } else {
                    color
                }
            })
            .collect();
        let (width, height) = self.target.extent();
        let begin = self.target.begin_info(image_index as usize, clear_values)?;

        backend.cmd_begin_render_pass(cmd, &begin)?;
        backend.cmd_set_viewport(cmd, &Viewport::flipped(width, height))?;
        backend.cmd_set_scissor(cmd, &ScissorRect::full(width, height))?;
        backend.cmd_bind_render_pipeline(cmd, self.pipeline)?;
        let binding = PipelineBinding::Render(self.pipeline);
        backend.cmd_set_bind_group(cmd, binding, 0, global_group)?;

        for item in items {
            backend.cmd_set_bind_group(cmd, binding, 1, item.material)?;
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
        log::trace!(
            "Forward pass submitted for slot {} into image {} ({} draws)",
            slot,
            image_index,
            items.len()
        );
        Ok(complete)
    }

    /// Fence guarding slot `slot`; signaled once its whole frame has rendered
    pub fn frame_fence(&self, slot: usize) -> FenceHandle {
        self.frames.get(slot).stage.fence
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn target(&self) -> &RenderTarget {
        &self.target
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for frame in self.frames.drain() {
            if let Some((_, bind_group)) = frame.bind_group {
                backend.destroy_bind_group(bind_group);
            }
            frame.stage.destroy(backend);
        }
        backend.destroy_render_pipeline(self.pipeline);
        backend.destroy_bind_group_layout(self.material_layout);
        backend.destroy_bind_group_layout(self.global_layout);
        self.target.destroy(backend);
        self.state = StageState::Uninitialized;
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::shader::parse_wgsl;
    use crate::backend::HeadlessBackend;
    use rstest::rstest;

    #[test]
    fn test_shader_bindings() {
        let (module, _) = parse_wgsl(&shader_source(FORWARD_SHADER)).unwrap();
        let mut set0 = Vec::new();
        let mut set1 = Vec::new();
        for (_, var) in module.global_variables.iter() {
            match var.binding.as_ref() {
                Some(b) if b.group == 0 => set0.push(b.binding),
                Some(b) if b.group == 1 => set1.push(b.binding),
                _ => {}
            }
        }
        set0.sort_unstable();
        set1.sort_unstable();
        assert_eq!(set0, (0..6).collect::<Vec<_>>());
        assert_eq!(set1, (0..11).collect::<Vec<_>>());
    }

    #[rstest]
    #[case(1, 2)]
    #[case(4, 3)]
    fn test_framebuffer_per_swapchain_image(#[case] samples: u32, #[case] attachments: usize) {
        let mut backend = HeadlessBackend::new(800, 600);
        let color_format = backend.swapchain_format();
        let mut stage = ForwardLightingStage::new(
            &mut backend,
            color_format,
            TextureFormat::Depth32Float,
            samples,
            2,
            [0.0, 0.0, 0.0, 1.0],
        )
        .unwrap();
        assert_eq!(stage.target().layout().attachments().len(), attachments);

        let shared = SharedAttachments::create(
            &mut backend,
            (800, 600),
            TextureFormat::Depth32Float,
            color_format,
            samples,
        )
        .unwrap();
        stage.rebuild(&mut backend, &shared).unwrap();
        assert_eq!(
            stage.target().framebuffer_count(),
            backend.swapchain_image_count() as usize
        );
        assert_eq!(stage.state(), StageState::Ready);

        stage.destroy(&mut backend);
        shared.destroy(&mut backend);
        let live = backend.live_objects();
        assert_eq!(
            (live.framebuffers, live.render_passes, live.bind_groups, live.fences),
            (0, 0, 0, 0)
        );
    }

    #[test]
    fn test_msaa_resolves_into_presentable_image() {
        let layout = ForwardLightingStage::pass_layout(
            TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Depth32Float,
            4,
        );
        let resolve = layout.resolve.unwrap();
        assert_eq!(resolve.final_layout, ImageLayout::PresentSrc);
        assert_eq!(resolve.samples, 1);
        assert_eq!(layout.color.unwrap().store_op, StoreOp::Discard);
        let depth = layout.depth.unwrap();
        assert_eq!(depth.load_op, AttachmentLoadOp::Load);
        assert_eq!(depth.initial_layout, ImageLayout::DepthStencilAttachment);
    }
}
