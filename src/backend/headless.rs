//! Headless GPU backend for testing without hardware.
//!
//! The backend doesn't execute shaders, but it models the parts of a real
//! device the frame pipeline depends on: command list life cycles, binary
//! semaphores, fences and a presentation surface that can go stale. Misuse
//! that a real driver would turn into undefined behaviour is reported as a
//! [`BackendError`] so tests can catch it.
//!
//! Submitted work stays pending until a fence covering it is waited on (or
//! [`GraphicsBackend::wait_idle`] is called). That makes frame lag
//! observable: [`HeadlessBackend::max_pending`] reports the largest number of
//! submitted-but-unfenced command lists seen per label.

use crate::backend::shader::{self, ShaderStage};
use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{HashMap, VecDeque};

/// State of a recorded command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// Command captured while recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        width: u32,
        height: u32,
    },
    EndRenderPass,
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindRenderPipeline(RenderPipelineHandle),
    BindComputePipeline(ComputePipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    SetVertexBuffer(BufferHandle),
    SetIndexBuffer(BufferHandle),
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    Dispatch(u32, u32, u32),
}

struct CommandList {
    label: String,
    queue: QueueKind,
    state: CommandListState,
    commands: Vec<RecordedCommand>,
    in_render_pass: bool,
    bound_render_pipeline: Option<RenderPipelineHandle>,
    bound_compute_pipeline: Option<ComputePipelineHandle>,
}

struct Fence {
    label: String,
    signaled: bool,
    pending: Vec<u64>,
}

struct Semaphore {
    label: String,
    signaled: bool,
}

struct Buffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

struct Texture {
    desc: TextureDescriptor,
    uploads: u32,
}

enum ViewSource {
    Texture(TextureHandle),
    Swapchain,
}

/// Submission as seen by the queue, with resolved labels
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub queue: QueueKind,
    pub command_lists: Vec<String>,
    pub waits: Vec<(String, PipelineStage)>,
    pub signals: Vec<String>,
    pub fence: Option<String>,
}

/// Number of live objects per kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub buffers: usize,
    pub textures: usize,
    pub texture_views: usize,
    pub samplers: usize,
    pub bind_groups: usize,
    pub render_passes: usize,
    pub framebuffers: usize,
    pub render_pipelines: usize,
    pub compute_pipelines: usize,
    pub command_lists: usize,
    pub semaphores: usize,
    pub fences: usize,
}

/// Headless GPU backend.
pub struct HeadlessBackend {
    surface_extent: (u32, u32),
    swapchain_extent: (u32, u32),
    swapchain_format: TextureFormat,
    swapchain_views: Vec<TextureViewHandle>,
    image_count: u32,
    next_image: u32,
    swapchain_generation: u32,
    depth_formats: Vec<TextureFormat>,
    max_samples: u32,

    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,

    buffers: HashMap<u64, Buffer>,
    textures: HashMap<u64, Texture>,
    texture_views: HashMap<u64, ViewSource>,
    samplers: HashMap<u64, SamplerDescriptor>,
    bind_group_layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashMap<u64, BindGroupLayoutHandle>,
    render_passes: HashMap<u64, RenderPassLayout>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    render_pipelines: HashMap<u64, RenderPipelineDescriptor>,
    compute_pipelines: HashMap<u64, ComputePipelineDescriptor>,
    command_lists: HashMap<u64, CommandList>,
    semaphores: HashMap<u64, Semaphore>,
    fences: HashMap<u64, Fence>,

    submissions: Vec<SubmissionRecord>,
    max_pending: HashMap<String, usize>,
    presented: u64,
    next_id: u64,
}

impl HeadlessBackend {
    /// Create a headless backend with a surface of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let mut backend = Self {
            surface_extent: (width, height),
            swapchain_extent: (0, 0),
            swapchain_format: TextureFormat::Bgra8UnormSrgb,
            swapchain_views: Vec::new(),
            image_count: 3,
            next_image: 0,
            swapchain_generation: 0,
            depth_formats: vec![
                TextureFormat::Depth32Float,
                TextureFormat::Depth32FloatStencil8,
                TextureFormat::Depth24PlusStencil8,
            ],
            max_samples: 8,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            command_lists: HashMap::new(),
            semaphores: HashMap::new(),
            fences: HashMap::new(),
            submissions: Vec::new(),
            max_pending: HashMap::new(),
            presented: 0,
            next_id: 1,
        };
        backend.build_swapchain(width, height);
        backend
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        "Headless Backend"
    }

    /// Simulate the window system resizing the surface. The swapchain keeps
    /// its old extent until recreated, so the next acquire or present
    /// reports the surface as out of date.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        log::trace!("HeadlessBackend: surface resized to {}x{}", width, height);
        self.surface_extent = (width, height);
    }

    /// Queue an outcome for a future acquire, ahead of the simulated one.
    pub fn script_acquire(&mut self, outcome: AcquireOutcome) {
        self.acquire_script.push_back(outcome);
    }

    /// Queue an outcome for a future present, ahead of the simulated one.
    pub fn script_present(&mut self, outcome: PresentOutcome) {
        self.present_script.push_back(outcome);
    }

    /// Restrict the depth formats the simulated device supports.
    pub fn set_supported_depth_formats(&mut self, formats: Vec<TextureFormat>) {
        self.depth_formats = formats;
    }

    pub fn set_max_msaa_samples(&mut self, samples: u32) {
        self.max_samples = samples;
    }

    /// All submissions in queue order
    pub fn submissions(&self) -> &[SubmissionRecord] {
        &self.submissions
    }

    pub fn clear_submissions(&mut self) {
        self.submissions.clear();
    }

    /// Highest number of simultaneously pending command lists with `label`
    pub fn max_pending(&self, label: &str) -> usize {
        self.max_pending.get(label).copied().unwrap_or(0)
    }

    /// Number of command lists currently submitted and not fenced complete
    pub fn pending_command_lists(&self) -> usize {
        self.command_lists
            .values()
            .filter(|c| c.state == CommandListState::Pending)
            .count()
    }

    pub fn command_list_state(&self, cmd: CommandListHandle) -> Option<CommandListState> {
        self.command_lists.get(&cmd.0).map(|c| c.state)
    }

    /// Commands recorded into a list since its last begin
    pub fn recorded_commands(&self, cmd: CommandListHandle) -> Option<&[RecordedCommand]> {
        self.command_lists.get(&cmd.0).map(|c| c.commands.as_slice())
    }

    /// Command list handles with the given label
    pub fn command_lists_labeled(&self, label: &str) -> Vec<CommandListHandle> {
        let mut handles: Vec<_> = self
            .command_lists
            .iter()
            .filter(|(_, c)| c.label == label)
            .map(|(&id, _)| CommandListHandle(id))
            .collect();
        handles.sort_by_key(|h| h.0);
        handles
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    pub fn swapchain_generation(&self) -> u32 {
        self.swapchain_generation
    }

    pub fn framebuffer_extent(&self, framebuffer: FramebufferHandle) -> Option<(u32, u32)> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|f| (f.width, f.height))
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    /// Number of uploads made to a texture
    pub fn texture_uploads(&self, texture: TextureHandle) -> u32 {
        self.textures.get(&texture.0).map_or(0, |t| t.uploads)
    }

    pub fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            texture_views: self.texture_views.len(),
            samplers: self.samplers.len(),
            bind_groups: self.bind_groups.len(),
            render_passes: self.render_passes.len(),
            framebuffers: self.framebuffers.len(),
            render_pipelines: self.render_pipelines.len(),
            compute_pipelines: self.compute_pipelines.len(),
            command_lists: self.command_lists.len(),
            semaphores: self.semaphores.len(),
            fences: self.fences.len(),
        }
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn build_swapchain(&mut self, width: u32, height: u32) {
        for view in std::mem::take(&mut self.swapchain_views) {
            self.texture_views.remove(&view.0);
        }
        self.swapchain_extent = (width, height);
        self.swapchain_generation += 1;
        self.next_image = 0;
        for _ in 0..self.image_count {
            let id = self.allocate_id();
            self.texture_views.insert(id, ViewSource::Swapchain);
            self.swapchain_views.push(TextureViewHandle(id));
        }
    }

    fn surface_is_stale(&self) -> bool {
        self.surface_extent != self.swapchain_extent
    }

    fn recording_list(&mut self, cmd: CommandListHandle) -> BackendResult<&mut CommandList> {
        let list = self
            .command_lists
            .get_mut(&cmd.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("command list {:?}", cmd)))?;
        if list.state != CommandListState::Recording {
            return Err(BackendError::CommandRecordingFailed(format!(
                "'{}' is not recording ({:?})",
                list.label, list.state
            )));
        }
        Ok(list)
    }

    fn record(&mut self, cmd: CommandListHandle, command: RecordedCommand) -> BackendResult<()> {
        self.recording_list(cmd)?.commands.push(command);
        Ok(())
    }

    fn complete(&mut self, list_ids: &[u64]) {
        for id in list_ids {
            if let Some(list) = self.command_lists.get_mut(id) {
                if list.state == CommandListState::Pending {
                    list.state = CommandListState::Executable;
                }
            }
        }
    }

    fn execute(&mut self, list_id: u64) {
        let commands = match self.command_lists.get(&list_id) {
            Some(list) => list.commands.clone(),
            None => return,
        };
        for command in commands {
            if let RecordedCommand::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } = command
            {
                if let Some(buffer) = self.buffers.get_mut(&buffer.0) {
                    let start = offset as usize;
                    let end = (start + size as usize).min(buffer.data.len());
                    for chunk in buffer.data[start..end].chunks_mut(4) {
                        let bytes = value.to_ne_bytes();
                        chunk.copy_from_slice(&bytes[..chunk.len()]);
                    }
                }
            }
        }
    }

    fn label_of_semaphore(&self, semaphore: SemaphoreHandle) -> String {
        self.semaphores
            .get(&semaphore.0)
            .map(|s| s.label.clone())
            .unwrap_or_default()
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn surface_size(&self) -> (u32, u32) {
        self.swapchain_extent
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.swapchain_format
    }

    fn swapchain_image_count(&self) -> u32 {
        self.image_count
    }

    fn swapchain_view(&self, index: u32) -> BackendResult<TextureViewHandle> {
        self.swapchain_views
            .get(index as usize)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("swapchain image {}", index)))
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<(u32, u32)> {
        if self.pending_command_lists() > 0 {
            return Err(BackendError::SwapchainCreationFailed(
                "swapchain recreated while work is pending".into(),
            ));
        }
        let (width, height) = if self.surface_extent.0 > 0 && self.surface_extent.1 > 0 {
            self.surface_extent
        } else {
            (width, height)
        };
        log::debug!("HeadlessBackend: recreating swapchain {}x{}", width, height);
        self.surface_extent = (width, height);
        self.build_swapchain(width, height);
        Ok((width, height))
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquireOutcome> {
        let outcome = match self.acquire_script.pop_front() {
            Some(outcome) => outcome,
            None if self.surface_is_stale() => AcquireOutcome::OutOfDate,
            None => {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            }
        };

        if let AcquireOutcome::Acquired { .. } = outcome {
            let semaphore = self
                .semaphores
                .get_mut(&signal.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("semaphore {:?}", signal)))?;
            if semaphore.signaled {
                return Err(BackendError::AcquireImageFailed(format!(
                    "semaphore '{}' already has a pending signal",
                    semaphore.label
                )));
            }
            semaphore.signaled = true;
        }
        log::trace!("HeadlessBackend: acquire -> {:?}", outcome);
        Ok(outcome)
    }

    fn present(
        &mut self,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        if image_index >= self.image_count {
            return Err(BackendError::PresentFailed(format!(
                "image index {} out of range",
                image_index
            )));
        }
        let semaphore = self
            .semaphores
            .get_mut(&wait.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("semaphore {:?}", wait)))?;
        if !semaphore.signaled {
            return Err(BackendError::PresentFailed(format!(
                "present waits on '{}' which nothing signals",
                semaphore.label
            )));
        }
        semaphore.signaled = false;
        self.presented += 1;

        let outcome = match self.present_script.pop_front() {
            Some(outcome) => outcome,
            None if self.surface_is_stale() => PresentOutcome::OutOfDate,
            None => PresentOutcome::Presented,
        };
        log::trace!("HeadlessBackend: present image {} -> {:?}", image_index, outcome);
        Ok(outcome)
    }

    fn find_depth_format(&self) -> BackendResult<TextureFormat> {
        self.depth_formats
            .first()
            .copied()
            .ok_or_else(|| BackendError::Unsupported("no supported depth format".into()))
    }

    fn max_msaa_samples(&self) -> u32 {
        self.max_samples
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        let pending: Vec<u64> = self
            .command_lists
            .iter()
            .filter(|(_, c)| c.state == CommandListState::Pending)
            .map(|(&id, _)| id)
            .collect();
        self.complete(&pending);
        for fence in self.fences.values_mut() {
            if !fence.pending.is_empty() {
                fence.pending.clear();
                fence.signaled = true;
            }
        }
        Ok(())
    }

    fn create_semaphore(&mut self, label: &str) -> BackendResult<SemaphoreHandle> {
        let id = self.allocate_id();
        self.semaphores.insert(
            id,
            Semaphore {
                label: label.to_string(),
                signaled: false,
            },
        );
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        self.semaphores.remove(&semaphore.0);
    }

    fn create_fence(&mut self, label: &str, signaled: bool) -> BackendResult<FenceHandle> {
        let id = self.allocate_id();
        self.fences.insert(
            id,
            Fence {
                label: label.to_string(),
                signaled,
                pending: Vec::new(),
            },
        );
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(&fence.0);
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let state = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("fence {:?}", fence)))?;
        if state.signaled {
            return Ok(());
        }
        if state.pending.is_empty() {
            return Err(BackendError::WaitFailed(format!(
                "fence '{}' is unsignaled with no work pending and would never signal",
                state.label
            )));
        }
        let done = std::mem::take(&mut state.pending);
        state.signaled = true;
        self.complete(&done);
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let state = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("fence {:?}", fence)))?;
        if !state.pending.is_empty() {
            return Err(BackendError::SubmitFailed(format!(
                "fence '{}' reset while its work is pending",
                state.label
            )));
        }
        state.signaled = false;
        Ok(())
    }

    fn fence_status(&self, fence: FenceHandle) -> BackendResult<FenceStatus> {
        let state = self
            .fences
            .get(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("fence {:?}", fence)))?;
        Ok(if state.signaled {
            FenceStatus::Signaled
        } else {
            FenceStatus::Unsignaled
        })
    }

    fn create_command_list(
        &mut self,
        label: &str,
        queue: QueueKind,
    ) -> BackendResult<CommandListHandle> {
        log::trace!("HeadlessBackend: creating command list {:?} ({:?})", label, queue);
        let id = self.allocate_id();
        self.command_lists.insert(
            id,
            CommandList {
                label: label.to_string(),
                queue,
                state: CommandListState::Initial,
                commands: Vec::new(),
                in_render_pass: false,
                bound_render_pipeline: None,
                bound_compute_pipeline: None,
            },
        );
        Ok(CommandListHandle(id))
    }

    fn destroy_command_list(&mut self, cmd: CommandListHandle) {
        self.command_lists.remove(&cmd.0);
    }

    fn begin_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let list = self
            .command_lists
            .get_mut(&cmd.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("command list {:?}", cmd)))?;
        match list.state {
            CommandListState::Pending => Err(BackendError::CommandRecordingFailed(format!(
                "'{}' reset while its previous submission is still pending",
                list.label
            ))),
            CommandListState::Recording => Err(BackendError::CommandRecordingFailed(format!(
                "'{}' is already recording",
                list.label
            ))),
            CommandListState::Initial | CommandListState::Executable => {
                list.state = CommandListState::Recording;
                list.commands.clear();
                list.in_render_pass = false;
                list.bound_render_pipeline = None;
                list.bound_compute_pipeline = None;
                Ok(())
            }
        }
    }

    fn end_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let list = self.recording_list(cmd)?;
        if list.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(format!(
                "'{}' ended inside a render pass",
                list.label
            )));
        }
        list.state = CommandListState::Executable;
        Ok(())
    }

    fn submit(&mut self, submission: &Submission) -> BackendResult<()> {
        let mut queue = None;
        let mut labels = Vec::with_capacity(submission.command_lists.len());
        for cmd in &submission.command_lists {
            let list = self
                .command_lists
                .get(&cmd.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("command list {:?}", cmd)))?;
            if list.state != CommandListState::Executable {
                return Err(BackendError::SubmitFailed(format!(
                    "'{}' submitted in state {:?}",
                    list.label, list.state
                )));
            }
            if *queue.get_or_insert(list.queue) != list.queue {
                return Err(BackendError::SubmitFailed(
                    "command lists for different queues in one submission".into(),
                ));
            }
            labels.push(list.label.clone());
        }

        for wait in &submission.waits {
            let semaphore = self
                .semaphores
                .get(&wait.semaphore.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("semaphore {:?}", wait)))?;
            if !semaphore.signaled {
                return Err(BackendError::SubmitFailed(format!(
                    "wait on '{}' which nothing signals",
                    semaphore.label
                )));
            }
        }
        for signal in &submission.signals {
            let semaphore = self
                .semaphores
                .get(&signal.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("semaphore {:?}", signal)))?;
            if semaphore.signaled {
                return Err(BackendError::SubmitFailed(format!(
                    "signal of '{}' which already has a pending signal",
                    semaphore.label
                )));
            }
        }
        if let Some(fence) = submission.fence {
            let state = self
                .fences
                .get(&fence.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("fence {:?}", fence)))?;
            if state.signaled || !state.pending.is_empty() {
                return Err(BackendError::SubmitFailed(format!(
                    "fence '{}' submitted without being reset",
                    state.label
                )));
            }
        }

        for wait in &submission.waits {
            if let Some(semaphore) = self.semaphores.get_mut(&wait.semaphore.0) {
                semaphore.signaled = false;
            }
        }
        for signal in &submission.signals {
            if let Some(semaphore) = self.semaphores.get_mut(&signal.0) {
                semaphore.signaled = true;
            }
        }

        let ids: Vec<u64> = submission.command_lists.iter().map(|c| c.0).collect();
        for &id in &ids {
            self.execute(id);
            if let Some(list) = self.command_lists.get_mut(&id) {
                list.state = CommandListState::Pending;
            }
        }
        if let Some(fence) = submission.fence {
            if let Some(state) = self.fences.get_mut(&fence.0) {
                state.pending.extend(&ids);
            }
        }

        for label in &labels {
            let pending = self
                .command_lists
                .values()
                .filter(|c| c.state == CommandListState::Pending && &c.label == label)
                .count();
            let max = self.max_pending.entry(label.clone()).or_insert(0);
            *max = (*max).max(pending);
        }

        let record = SubmissionRecord {
            queue: queue.unwrap_or(QueueKind::Graphics),
            command_lists: labels,
            waits: submission
                .waits
                .iter()
                .map(|w| (self.label_of_semaphore(w.semaphore), w.stage))
                .collect(),
            signals: submission
                .signals
                .iter()
                .map(|&s| self.label_of_semaphore(s))
                .collect(),
            fence: submission
                .fence
                .and_then(|f| self.fences.get(&f.0).map(|s| s.label.clone())),
        };
        log::trace!("HeadlessBackend: submit {:?}", record.command_lists);
        self.submissions.push(record);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "HeadlessBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        if desc.size == 0 {
            return Err(BackendError::BufferCreationFailed(format!(
                "{:?} has zero size",
                desc.label
            )));
        }
        let id = self.allocate_id();
        self.buffers.insert(
            id,
            Buffer {
                usage: desc.usage,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data)?;
        Ok(handle)
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(BackendError::InvalidHandle(format!(
                "write of {} bytes at {} overruns buffer of {} bytes",
                data.len(),
                offset,
                target.data.len()
            )));
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let source = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let start = offset as usize;
        let end = start + size as usize;
        source
            .data
            .get(start..end)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| BackendError::InvalidHandle("read out of range".into()))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{}x{}, {} samples)",
            desc.label,
            desc.width,
            desc.height,
            desc.depth,
            desc.sample_count
        );
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has zero extent",
                desc.label
            )));
        }
        if desc.sample_count > self.max_samples {
            return Err(BackendError::Unsupported(format!(
                "{} samples exceeds device limit {}",
                desc.sample_count, self.max_samples
            )));
        }
        let id = self.allocate_id();
        self.textures.insert(
            id,
            Texture {
                desc: desc.clone(),
                uploads: 0,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::InvalidHandle(format!("texture {:?}", texture)));
        }
        let id = self.allocate_id();
        self.texture_views.insert(id, ViewSource::Texture(texture));
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let target = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?;
        let expected = (width * height * target.desc.format.bytes_per_pixel()) as usize;
        if data.len() != expected || width != target.desc.width || height != target.desc.height {
            return Err(BackendError::TextureCreationFailed(format!(
                "upload of {} bytes does not match {:?} ({} bytes expected)",
                data.len(),
                target.desc.label,
                expected
            )));
        }
        target.uploads += 1;
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let id = self.allocate_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.allocate_id();
        self.bind_group_layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let layout_entries = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("layout {:?}", layout)))?;

        for layout_entry in layout_entries {
            let (_, entry) = entries
                .iter()
                .find(|(binding, _)| *binding == layout_entry.binding)
                .ok_or_else(|| {
                    BackendError::DescriptorAllocationFailed(format!(
                        "binding {} left empty",
                        layout_entry.binding
                    ))
                })?;
            let matches = match (entry, &layout_entry.ty) {
                (BindGroupEntry::Buffer { buffer, .. }, BindingType::UniformBuffer) => self
                    .buffers
                    .get(&buffer.0)
                    .is_some_and(|b| b.usage.contains(BufferUsage::UNIFORM)),
                (BindGroupEntry::Buffer { buffer, .. }, BindingType::StorageBuffer { .. }) => self
                    .buffers
                    .get(&buffer.0)
                    .is_some_and(|b| b.usage.contains(BufferUsage::STORAGE)),
                (BindGroupEntry::Texture(view), BindingType::Texture) => {
                    self.texture_views.contains_key(&view.0)
                }
                (BindGroupEntry::Sampler(sampler), BindingType::Sampler) => {
                    self.samplers.contains_key(&sampler.0)
                }
                _ => false,
            };
            if !matches {
                return Err(BackendError::DescriptorAllocationFailed(format!(
                    "binding {} does not match {:?}",
                    layout_entry.binding, layout_entry.ty
                )));
            }
        }

        let id = self.allocate_id();
        self.bind_groups.insert(id, layout);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle> {
        if let (Some(color), Some(resolve)) = (&layout.color, &layout.resolve) {
            if color.samples == 1 || resolve.samples != 1 {
                return Err(BackendError::PipelineCreationFailed(
                    "resolve requires a multisampled color attachment".into(),
                ));
            }
        }
        log::trace!("HeadlessBackend: creating render pass {:?}", layout.label);
        let id = self.allocate_id();
        self.render_passes.insert(id, layout.clone());
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let layout = self
            .render_passes
            .get(&desc.render_pass.0)
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("render pass {:?}", desc.render_pass))
            })?;
        if layout.attachments().len() != desc.attachments.len() {
            return Err(BackendError::InvalidHandle(format!(
                "framebuffer {:?} has {} attachments, render pass expects {}",
                desc.label,
                desc.attachments.len(),
                layout.attachments().len()
            )));
        }
        for view in &desc.attachments {
            match self.texture_views.get(&view.0) {
                Some(ViewSource::Texture(texture)) => {
                    let tex = self.textures.get(&texture.0).ok_or_else(|| {
                        BackendError::InvalidHandle(format!("texture {:?}", texture))
                    })?;
                    if tex.desc.width != desc.width || tex.desc.height != desc.height {
                        return Err(BackendError::InvalidHandle(format!(
                            "attachment {:?} is {}x{}, framebuffer {}x{}",
                            tex.desc.label, tex.desc.width, tex.desc.height, desc.width, desc.height
                        )));
                    }
                }
                Some(ViewSource::Swapchain) => {
                    if self.swapchain_extent != (desc.width, desc.height) {
                        return Err(BackendError::InvalidHandle(
                            "swapchain attachment extent mismatch".into(),
                        ));
                    }
                }
                None => {
                    return Err(BackendError::InvalidHandle(format!("texture view {:?}", view)))
                }
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !self.render_passes.contains_key(&desc.render_pass.0) {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?} references a missing render pass",
                desc.label
            )));
        }
        shader::compile_wgsl(&desc.shader, ShaderStage::Vertex, &desc.vertex_entry)?;
        if let Some(entry) = &desc.fragment_entry {
            shader::compile_wgsl(&desc.shader, ShaderStage::Fragment, entry)?;
        }
        let id = self.allocate_id();
        self.render_pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        shader::compile_wgsl(&desc.shader, ShaderStage::Compute, &desc.entry_point)?;
        let id = self.allocate_id();
        self.compute_pipelines.insert(id, desc.clone());
        Ok(ComputePipelineHandle(id))
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandListHandle,
        info: &RenderPassBeginInfo,
    ) -> BackendResult<()> {
        let framebuffer = self
            .framebuffers
            .get(&info.framebuffer.0)
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("framebuffer {:?}", info.framebuffer))
            })?;
        let layout = self
            .render_passes
            .get(&info.render_pass.0)
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("render pass {:?}", info.render_pass))
            })?;
        if framebuffer.render_pass != info.render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "framebuffer belongs to another render pass".into(),
            ));
        }
        let clears_needed = layout
            .attachments()
            .iter()
            .filter(|a| a.load_op == AttachmentLoadOp::Clear)
            .count();
        if info.clear_values.len() < clears_needed {
            return Err(BackendError::CommandRecordingFailed(format!(
                "{} clear values for {} cleared attachments",
                info.clear_values.len(),
                clears_needed
            )));
        }
        let list = self.recording_list(cmd)?;
        if list.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "nested render pass".into(),
            ));
        }
        list.in_render_pass = true;
        list.commands.push(RecordedCommand::BeginRenderPass {
            render_pass: info.render_pass,
            framebuffer: info.framebuffer,
            width: info.width,
            height: info.height,
        });
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let list = self.recording_list(cmd)?;
        if !list.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "end without begin render pass".into(),
            ));
        }
        list.in_render_pass = false;
        list.commands.push(RecordedCommand::EndRenderPass);
        Ok(())
    }

    fn cmd_set_viewport(
        &mut self,
        cmd: CommandListHandle,
        viewport: &Viewport,
    ) -> BackendResult<()> {
        self.record(cmd, RecordedCommand::SetViewport(*viewport))
    }

    fn cmd_set_scissor(
        &mut self,
        cmd: CommandListHandle,
        scissor: &ScissorRect,
    ) -> BackendResult<()> {
        self.record(cmd, RecordedCommand::SetScissor(*scissor))
    }

    fn cmd_bind_render_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: RenderPipelineHandle,
    ) -> BackendResult<()> {
        if !self.render_pipelines.contains_key(&pipeline.0) {
            return Err(BackendError::InvalidHandle(format!("pipeline {:?}", pipeline)));
        }
        let list = self.recording_list(cmd)?;
        list.bound_render_pipeline = Some(pipeline);
        list.commands.push(RecordedCommand::BindRenderPipeline(pipeline));
        Ok(())
    }

    fn cmd_bind_compute_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: ComputePipelineHandle,
    ) -> BackendResult<()> {
        if !self.compute_pipelines.contains_key(&pipeline.0) {
            return Err(BackendError::InvalidHandle(format!("pipeline {:?}", pipeline)));
        }
        let list = self.recording_list(cmd)?;
        list.bound_compute_pipeline = Some(pipeline);
        list.commands.push(RecordedCommand::BindComputePipeline(pipeline));
        Ok(())
    }

    fn cmd_set_bind_group(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        index: u32,
        bind_group: BindGroupHandle,
    ) -> BackendResult<()> {
        let layout = *self
            .bind_groups
            .get(&bind_group.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("bind group {:?}", bind_group)))?;
        let expected = match pipeline {
            PipelineBinding::Render(p) => self
                .render_pipelines
                .get(&p.0)
                .and_then(|d| d.bind_group_layouts.get(index as usize).copied()),
            PipelineBinding::Compute(p) => self
                .compute_pipelines
                .get(&p.0)
                .and_then(|d| d.bind_group_layouts.get(index as usize).copied()),
        };
        if expected != Some(layout) {
            return Err(BackendError::CommandRecordingFailed(format!(
                "bind group at set {} does not match the pipeline layout",
                index
            )));
        }
        self.record(cmd, RecordedCommand::SetBindGroup { index, bind_group })
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> BackendResult<()> {
        let ranges = match pipeline {
            PipelineBinding::Render(p) => self.render_pipelines.get(&p.0).map(|d| {
                &d.push_constant_ranges
            }),
            PipelineBinding::Compute(p) => self.compute_pipelines.get(&p.0).map(|d| {
                &d.push_constant_ranges
            }),
        }
        .ok_or_else(|| BackendError::InvalidHandle(format!("pipeline {:?}", pipeline)))?;
        let end = offset + data.len() as u32;
        if !ranges
            .iter()
            .any(|r| r.stages.contains(stages) && r.offset <= offset && end <= r.offset + r.size)
        {
            return Err(BackendError::CommandRecordingFailed(
                "push constants outside declared ranges".into(),
            ));
        }
        self.record(
            cmd,
            RecordedCommand::PushConstants {
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn cmd_set_vertex_buffer(
        &mut self,
        cmd: CommandListHandle,
        _slot: u32,
        buffer: BufferHandle,
        _offset: u64,
    ) -> BackendResult<()> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::InvalidHandle(format!("buffer {:?}", buffer)));
        }
        self.record(cmd, RecordedCommand::SetVertexBuffer(buffer))
    }

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandListHandle,
        buffer: BufferHandle,
        _offset: u64,
        _format: IndexFormat,
    ) -> BackendResult<()> {
        if !self.buffers.contains_key(&buffer.0) {
            return Err(BackendError::InvalidHandle(format!("buffer {:?}", buffer)));
        }
        self.record(cmd, RecordedCommand::SetIndexBuffer(buffer))
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandListHandle,
        indices: std::ops::Range<u32>,
        _base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) -> BackendResult<()> {
        let list = self.recording_list(cmd)?;
        if !list.in_render_pass || list.bound_render_pipeline.is_none() {
            return Err(BackendError::CommandRecordingFailed(format!(
                "draw in '{}' outside a render pass or without a pipeline",
                list.label
            )));
        }
        list.commands.push(RecordedCommand::DrawIndexed {
            index_count: indices.end - indices.start,
            instance_count: instances.end - instances.start,
        });
        Ok(())
    }

    fn cmd_fill_buffer(
        &mut self,
        cmd: CommandListHandle,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    ) -> BackendResult<()> {
        if offset % 4 != 0 || size % 4 != 0 {
            return Err(BackendError::CommandRecordingFailed(
                "fill offset and size must be multiples of 4".into(),
            ));
        }
        let target = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        if !target.usage.contains(BufferUsage::COPY_DST) {
            return Err(BackendError::CommandRecordingFailed(
                "fill target lacks COPY_DST usage".into(),
            ));
        }
        if self.recording_list(cmd)?.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "fill inside a render pass".into(),
            ));
        }
        self.record(
            cmd,
            RecordedCommand::FillBuffer {
                buffer,
                offset,
                size,
                value,
            },
        )
    }

    fn cmd_dispatch(
        &mut self,
        cmd: CommandListHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> BackendResult<()> {
        let list = self.recording_list(cmd)?;
        if list.in_render_pass || list.bound_compute_pipeline.is_none() {
            return Err(BackendError::CommandRecordingFailed(format!(
                "dispatch in '{}' inside a render pass or without a pipeline",
                list.label
            )));
        }
        list.commands.push(RecordedCommand::Dispatch(x, y, z));
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        if let Some(ViewSource::Texture(_)) = self.texture_views.get(&view.0) {
            self.texture_views.remove(&view.0);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.bind_group_layouts.remove(&layout.0);
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(&render_pass.0);
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.render_pipelines.remove(&pipeline.0);
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.compute_pipelines.remove(&pipeline.0);
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_one(
        backend: &mut HeadlessBackend,
        cmd: CommandListHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        backend.begin_command_list(cmd)?;
        backend.end_command_list(cmd)?;
        backend.reset_fence(fence)?;
        backend.submit(&Submission {
            command_lists: vec![cmd],
            fence: Some(fence),
            ..Default::default()
        })
    }

    #[test]
    fn test_pending_list_cannot_be_rerecorded() {
        let mut backend = HeadlessBackend::default();
        let cmd = backend.create_command_list("work", QueueKind::Graphics).unwrap();
        let fence = backend.create_fence("work", true).unwrap();
        submit_one(&mut backend, cmd, fence).unwrap();

        assert!(backend.begin_command_list(cmd).is_err());
        backend.wait_fence(fence).unwrap();
        assert!(backend.begin_command_list(cmd).is_ok());
    }

    #[test]
    fn test_wait_on_unsubmitted_reset_fence_fails() {
        let mut backend = HeadlessBackend::default();
        let fence = backend.create_fence("orphan", true).unwrap();
        backend.reset_fence(fence).unwrap();
        assert!(matches!(
            backend.wait_fence(fence),
            Err(BackendError::WaitFailed(_))
        ));
    }

    #[test]
    fn test_semaphore_wait_requires_signal() {
        let mut backend = HeadlessBackend::default();
        let semaphore = backend.create_semaphore("never").unwrap();
        let cmd = backend.create_command_list("work", QueueKind::Graphics).unwrap();
        backend.begin_command_list(cmd).unwrap();
        backend.end_command_list(cmd).unwrap();

        let result = backend.submit(&Submission {
            command_lists: vec![cmd],
            waits: vec![SemaphoreWait {
                semaphore,
                stage: PipelineStage::TOP_OF_PIPE,
            }],
            ..Default::default()
        });
        assert!(matches!(result, Err(BackendError::SubmitFailed(_))));
    }

    #[test]
    fn test_resized_surface_goes_out_of_date() {
        let mut backend = HeadlessBackend::new(800, 600);
        let acquired = backend.create_semaphore("acquired").unwrap();
        backend.resize_surface(1024, 768);

        assert_eq!(
            backend.acquire_next_image(acquired).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(backend.recreate_swapchain(1, 1).unwrap(), (1024, 768));
        assert!(matches!(
            backend.acquire_next_image(acquired).unwrap(),
            AcquireOutcome::Acquired { image_index: 0, .. }
        ));
    }

    #[test]
    fn test_fill_buffer_executes_on_submit() {
        let mut backend = HeadlessBackend::default();
        let buffer = backend
            .create_buffer_init(
                &BufferDescriptor {
                    label: Some("counter".into()),
                    size: 4,
                    usage: BufferUsage::STORAGE | BufferUsage::COPY_DST,
                    mapped_at_creation: false,
                },
                &7u32.to_ne_bytes(),
            )
            .unwrap();
        let cmd = backend.create_command_list("fill", QueueKind::Compute).unwrap();
        backend.begin_command_list(cmd).unwrap();
        backend.cmd_fill_buffer(cmd, buffer, 0, 4, 0).unwrap();
        backend.end_command_list(cmd).unwrap();
        backend
            .submit(&Submission {
                command_lists: vec![cmd],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(backend.read_buffer(buffer, 0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_max_pending_tracks_lag() {
        let mut backend = HeadlessBackend::default();
        let lists: Vec<_> = (0..2)
            .map(|_| backend.create_command_list("stage", QueueKind::Graphics).unwrap())
            .collect();
        let fences: Vec<_> = (0..2)
            .map(|_| backend.create_fence("stage", true).unwrap())
            .collect();

        for frame in 0..6 {
            let slot = frame % 2;
            backend.wait_fence(fences[slot]).unwrap();
            submit_one(&mut backend, lists[slot], fences[slot]).unwrap();
        }

        assert_eq!(backend.max_pending("stage"), 2);
    }
}
