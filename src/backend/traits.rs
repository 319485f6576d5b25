//! Core backend abstraction traits
//!
//! These traits define the narrow interface the renderer consumes from a GPU
//! backend: resources, command lists, synchronization primitives and
//! presentation. Both the Vulkan and the headless backends implement it.

use crate::backend::types::*;
use bitflags::bitflags;
use thiserror::Error;

/// Backend error type
///
/// Every variant is fatal to the caller. Presentation surface staleness is
/// not an error: it is reported through [`AcquireOutcome`] and
/// [`PresentOutcome`] instead.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Failed to allocate descriptors: {0}")]
    DescriptorAllocationFailed(String),
    #[error("Failed to create synchronization object: {0}")]
    SyncCreationFailed(String),
    #[error("Failed to wait on fence: {0}")]
    WaitFailed(String),
    #[error("Command recording failed: {0}")]
    CommandRecordingFailed(String),
    #[error("Queue submission failed: {0}")]
    SubmitFailed(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

impl BackendError {
    /// Whether the error indicates a configuration or programming mistake
    /// rather than a driver or device failure.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BackendError::Unsupported(_)
                | BackendError::InvalidConfig(_)
                | BackendError::InvalidHandle(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a texture view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a render pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

/// Handle to a compute pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

/// Handle to a bind group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

/// Handle to a bind group layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListHandle(pub(crate) u64);

/// Handle to a GPU-GPU semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

/// Handle to a GPU-CPU fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Bind group entry for creating bind groups
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
    Sampler(SamplerHandle),
}

/// Bind group layout entry
#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL = Self::VERTEX_FRAGMENT.bits() | Self::COMPUTE.bits();
    }
}

/// Binding type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    /// Sampled 2D float texture
    Texture,
    Sampler,
}

/// Push constant block visible to a set of shader stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Render pipeline descriptor
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    /// WGSL module source containing both entry points
    pub shader: String,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
    pub sample_count: u32,
    pub render_pass: RenderPassHandle,
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = 0xF;
    }
}

/// Compute pipeline descriptor
#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

/// Pipeline that a bind group or push constant block is bound against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineBinding {
    Render(RenderPipelineHandle),
    Compute(ComputePipelineHandle),
}

/// Begin info for a render pass instance
#[derive(Debug, Clone)]
pub struct RenderPassBeginInfo {
    pub render_pass: RenderPassHandle,
    pub framebuffer: FramebufferHandle,
    pub width: u32,
    pub height: u32,
    /// One clear value per attachment, in attachment order
    pub clear_values: Vec<ClearValue>,
}

/// Main graphics backend trait
pub trait GraphicsBackend {
    // Surface and presentation

    /// Current swapchain extent
    fn surface_size(&self) -> (u32, u32);

    /// Swapchain image format
    fn swapchain_format(&self) -> TextureFormat;

    /// Number of presentable images
    fn swapchain_image_count(&self) -> u32;

    /// View of the presentable image at `index`
    fn swapchain_view(&self, index: u32) -> BackendResult<TextureViewHandle>;

    /// Recreate the swapchain; `width`/`height` is a hint that the surface's
    /// own extent overrides. Returns the resulting extent. Swapchain views
    /// handed out earlier are invalidated.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<(u32, u32)>;

    /// Acquire the next presentable image, signaling `signal` when it is ready.
    /// `signal` is left untouched when the surface is out of date.
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquireOutcome>;

    /// Queue the image for presentation once `wait` is signaled
    fn present(&mut self, image_index: u32, wait: SemaphoreHandle)
        -> BackendResult<PresentOutcome>;

    /// First supported depth format, `BackendError::Unsupported` if none
    fn find_depth_format(&self) -> BackendResult<TextureFormat>;

    /// Highest sample count usable for both color and depth attachments
    fn max_msaa_samples(&self) -> u32;

    /// Block until the device has finished all submitted work
    fn wait_idle(&mut self) -> BackendResult<()>;

    // Synchronization

    fn create_semaphore(&mut self, label: &str) -> BackendResult<SemaphoreHandle>;

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    /// Create a fence, optionally already signaled
    fn create_fence(&mut self, label: &str, signaled: bool) -> BackendResult<FenceHandle>;

    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Block until the fence is signaled (no timeout)
    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    fn fence_status(&self, fence: FenceHandle) -> BackendResult<FenceStatus>;

    // Command lists

    fn create_command_list(&mut self, label: &str, queue: QueueKind)
        -> BackendResult<CommandListHandle>;

    fn destroy_command_list(&mut self, cmd: CommandListHandle);

    /// Reset and begin recording. Fails if the list's previous submission
    /// has not been observed complete through its fence.
    fn begin_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()>;

    fn end_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()>;

    /// Submit recorded command lists to the queue of their kind
    fn submit(&mut self, submission: &Submission) -> BackendResult<()>;

    // Resource creation

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Create a buffer with initial data
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8])
        -> BackendResult<BufferHandle>;

    /// Write data to a host-visible buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Read back a host-visible buffer
    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>>;

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Create a texture view
    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle>;

    /// Upload texel data and leave the texture ready for sampling
    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32)
        -> BackendResult<()>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Pipeline creation

    /// Create a bind group layout
    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Create a bind group
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    /// Create a render pass with a single subpass
    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle>;

    /// Create a framebuffer compatible with `desc.render_pass`
    fn create_framebuffer(&mut self, desc: &FramebufferDescriptor)
        -> BackendResult<FramebufferHandle>;

    /// Create a render pipeline
    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    /// Create a compute pipeline
    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    // Command recording

    fn cmd_begin_render_pass(&mut self, cmd: CommandListHandle, info: &RenderPassBeginInfo)
        -> BackendResult<()>;

    fn cmd_end_render_pass(&mut self, cmd: CommandListHandle) -> BackendResult<()>;

    fn cmd_set_viewport(&mut self, cmd: CommandListHandle, viewport: &Viewport)
        -> BackendResult<()>;

    fn cmd_set_scissor(&mut self, cmd: CommandListHandle, scissor: &ScissorRect)
        -> BackendResult<()>;

    fn cmd_bind_render_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: RenderPipelineHandle,
    ) -> BackendResult<()>;

    fn cmd_bind_compute_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: ComputePipelineHandle,
    ) -> BackendResult<()>;

    fn cmd_set_bind_group(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        index: u32,
        bind_group: BindGroupHandle,
    ) -> BackendResult<()>;

    fn cmd_push_constants(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> BackendResult<()>;

    fn cmd_set_vertex_buffer(
        &mut self,
        cmd: CommandListHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    ) -> BackendResult<()>;

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandListHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) -> BackendResult<()>;

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandListHandle,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) -> BackendResult<()>;

    /// Fill `size` bytes with a repeated u32. The fill is made visible to
    /// later compute and fragment shader accesses in the same list.
    fn cmd_fill_buffer(
        &mut self,
        cmd: CommandListHandle,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    ) -> BackendResult<()>;

    fn cmd_dispatch(&mut self, cmd: CommandListHandle, x: u32, y: u32, z: u32)
        -> BackendResult<()>;

    // Resource cleanup

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn destroy_texture_view(&mut self, view: TextureViewHandle);

    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle);

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle);

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}
