//! Vulkan backend implementation using ash
//!
//! One queue family serves graphics, compute and presentation, so
//! [`QueueKind::Compute`] lists are submitted to the graphics queue and the
//! semaphore chain orders them. Buffers are host-visible and persistently
//! mapped; textures live in device-local memory and are uploaded through a
//! staging buffer.

mod conversion;
mod device;
mod swapchain;

use std::collections::HashMap;
use std::ffi::CString;

use ash::khr::{surface, swapchain as khr_swapchain};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::shader::{compile_wgsl, ShaderStage};
use crate::backend::traits::*;
use crate::backend::types::*;
use conversion::*;
use swapchain::Swapchain;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: khr_swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    allocator: Option<Allocator>,
    vsync: bool,

    swapchain: Swapchain,
    swapchain_view_ids: Vec<u64>,

    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,

    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkTextureView>,
    samplers: HashMap<u64, vk::Sampler>,
    bind_group_layouts: HashMap<u64, VkBindGroupLayout>,
    bind_groups: HashMap<u64, vk::DescriptorSet>,
    render_passes: HashMap<u64, vk::RenderPass>,
    framebuffers: HashMap<u64, vk::Framebuffer>,
    render_pipelines: HashMap<u64, VkPipeline>,
    compute_pipelines: HashMap<u64, VkPipeline>,
    command_lists: HashMap<u64, vk::CommandBuffer>,
    semaphores: HashMap<u64, vk::Semaphore>,
    fences: HashMap<u64, vk::Fence>,

    next_id: u64,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    format: TextureFormat,
    width: u32,
    height: u32,
    mip_levels: u32,
}

struct VkTextureView {
    view: vk::ImageView,
    /// Swapchain views are owned by the swapchain
    swapchain: bool,
}

struct VkBindGroupLayout {
    layout: vk::DescriptorSetLayout,
    entries: Vec<BindGroupLayoutEntry>,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// Descriptor payload collected before the writes that point into it
enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
}

fn device_error(e: vk::Result, wrap: fn(String) -> BackendError, what: &str) -> BackendError {
    match e {
        vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
        vk::Result::ERROR_SURFACE_LOST_KHR => BackendError::SurfaceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
            BackendError::OutOfMemory
        }
        _ => wrap(format!("Failed to {}: {:?}", what, e)),
    }
}

impl VulkanBackend {
    /// Create the backend for `window` and build the initial swapchain at
    /// the window's inner size.
    pub fn new(window: &winit::window::Window, vsync: bool) -> BackendResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let display = window
            .display_handle()
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?
            .as_raw();

        let instance = device::create_instance(&entry, display, cfg!(debug_assertions))?;
        let surface_fn = surface::Instance::new(&entry, &instance);
        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
                .map_err(|e| {
                    BackendError::SurfaceCreationFailed(format!(
                        "Failed to create surface: {:?}",
                        e
                    ))
                })?;

        let (physical_device, queue_family) =
            device::select_physical_device(&instance, &surface_fn, surface)?;
        let device = device::create_logical_device(&instance, physical_device, queue_family)?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };
        let allocator = device::create_allocator(&instance, physical_device, &device)?;
        let swapchain_fn = khr_swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
            BackendError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
        })?;

        let pool_sizes = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::SAMPLER,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: 1000,
        });
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1000)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = unsafe { device.create_descriptor_pool(&descriptor_pool_info, None) }
            .map_err(|e| {
                BackendError::InitializationFailed(format!(
                    "Failed to create descriptor pool: {:?}",
                    e
                ))
            })?;

        let size = window.inner_size();
        let swapchain = Swapchain::new(
            &device,
            physical_device,
            &surface_fn,
            &swapchain_fn,
            surface,
            vk::SwapchainKHR::null(),
            size.width,
            size.height,
            vsync,
        )?;

        let mut backend = Self {
            _entry: entry,
            instance,
            surface_fn,
            swapchain_fn,
            surface,
            physical_device,
            device,
            queue,
            allocator: Some(allocator),
            vsync,
            swapchain,
            swapchain_view_ids: Vec::new(),
            command_pool,
            descriptor_pool,
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
            next_id: 1,
        };
        backend.register_swapchain_views();

        log::info!("Vulkan backend initialized (queue family {})", queue_family);
        Ok(backend)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Replace the handles of the previous swapchain generation's views
    fn register_swapchain_views(&mut self) {
        for id in std::mem::take(&mut self.swapchain_view_ids) {
            self.texture_views.remove(&id);
        }
        for index in 0..self.swapchain.views.len() {
            let id = self.allocate_id();
            self.texture_views.insert(
                id,
                VkTextureView {
                    view: self.swapchain.views[index],
                    swapchain: true,
                },
            );
            self.swapchain_view_ids.push(id);
        }
    }

    fn command_buffer(&self, cmd: CommandListHandle) -> BackendResult<vk::CommandBuffer> {
        self.command_lists
            .get(&cmd.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("command list {:?}", cmd)))
    }

    fn semaphore(&self, semaphore: SemaphoreHandle) -> BackendResult<vk::Semaphore> {
        self.semaphores
            .get(&semaphore.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("semaphore {:?}", semaphore)))
    }

    fn fence(&self, fence: FenceHandle) -> BackendResult<vk::Fence> {
        self.fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("fence {:?}", fence)))
    }

    fn vk_buffer(&self, buffer: BufferHandle) -> BackendResult<&VkBuffer> {
        self.buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))
    }

    fn image_view(&self, view: TextureViewHandle) -> BackendResult<vk::ImageView> {
        self.texture_views
            .get(&view.0)
            .map(|v| v.view)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture view {:?}", view)))
    }

    fn bound_layout(
        &self,
        binding: PipelineBinding,
    ) -> BackendResult<(vk::PipelineBindPoint, vk::PipelineLayout)> {
        match binding {
            PipelineBinding::Render(handle) => self
                .render_pipelines
                .get(&handle.0)
                .map(|p| (vk::PipelineBindPoint::GRAPHICS, p.layout)),
            PipelineBinding::Compute(handle) => self
                .compute_pipelines
                .get(&handle.0)
                .map(|p| (vk::PipelineBindPoint::COMPUTE, p.layout)),
        }
        .ok_or_else(|| BackendError::InvalidHandle(format!("pipeline {:?}", binding)))
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> BackendResult<Allocation> {
        let allocator = self
            .allocator
            .as_mut()
            .ok_or_else(|| BackendError::InitializationFailed("Allocator dropped".to_string()))?;
        allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => BackendError::OutOfMemory,
                e => {
                    BackendError::BufferCreationFailed(format!("Failed to allocate memory: {}", e))
                }
            })
    }

    fn free(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Failed to free allocation: {}", e);
            }
        }
    }

    fn create_shader_module(&self, spirv: &[u32]) -> BackendResult<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| {
            BackendError::ShaderCreationFailed(format!("Failed to create shader module: {:?}", e))
        })
    }

    fn create_pipeline_layout(
        &self,
        bind_group_layouts: &[BindGroupLayoutHandle],
        push_constant_ranges: &[PushConstantRange],
    ) -> BackendResult<vk::PipelineLayout> {
        let set_layouts = bind_group_layouts
            .iter()
            .map(|handle| {
                self.bind_group_layouts
                    .get(&handle.0)
                    .map(|l| l.layout)
                    .ok_or_else(|| {
                        BackendError::InvalidHandle(format!("bind group layout {:?}", handle))
                    })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let ranges: Vec<vk::PushConstantRange> = push_constant_ranges
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: convert_shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();

        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        unsafe { self.device.create_pipeline_layout(&info, None) }.map_err(|e| {
            BackendError::PipelineCreationFailed(format!(
                "Failed to create pipeline layout: {:?}",
                e
            ))
        })
    }

    /// Record, submit and wait for a one-off command buffer
    fn run_one_time(&self, record: impl FnOnce(vk::CommandBuffer)) -> BackendResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                device_error(e, BackendError::CommandRecordingFailed, "allocate upload commands")
            })?[0];

        let result = unsafe {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| {
                    device_error(e, BackendError::CommandRecordingFailed, "begin upload commands")
                })
                .and_then(|_| {
                    record(cmd);
                    self.device
                        .end_command_buffer(cmd)
                        .map_err(|e| {
                            device_error(
                                e,
                                BackendError::CommandRecordingFailed,
                                "end upload commands",
                            )
                        })
                })
                .and_then(|_| {
                    let submit =
                        vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
                    self.device
                        .queue_submit(self.queue, &[submit], vk::Fence::null())
                        .map_err(|e| device_error(e, BackendError::SubmitFailed, "submit upload"))
                })
                .and_then(|_| {
                    self.device
                        .queue_wait_idle(self.queue)
                        .map_err(|e| device_error(e, BackendError::WaitFailed, "wait for upload"))
                })
        };

        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }
}

impl GraphicsBackend for VulkanBackend {
    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    fn swapchain_format(&self) -> TextureFormat {
        texture_format_from_vk(self.swapchain.format).unwrap_or(TextureFormat::Bgra8UnormSrgb)
    }

    fn swapchain_image_count(&self) -> u32 {
        self.swapchain.images.len() as u32
    }

    fn swapchain_view(&self, index: u32) -> BackendResult<TextureViewHandle> {
        self.swapchain_view_ids
            .get(index as usize)
            .map(|&id| TextureViewHandle(id))
            .ok_or_else(|| BackendError::InvalidHandle(format!("swapchain image {}", index)))
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<(u32, u32)> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| device_error(e, BackendError::WaitFailed, "wait for device idle"))?;

        let replacement = Swapchain::new(
            &self.device,
            self.physical_device,
            &self.surface_fn,
            &self.swapchain_fn,
            self.surface,
            self.swapchain.handle,
            width,
            height,
            self.vsync,
        )?;
        let mut old = std::mem::replace(&mut self.swapchain, replacement);
        old.destroy(&self.device, &self.swapchain_fn);
        self.register_swapchain_views();

        Ok(self.surface_size())
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<AcquireOutcome> {
        let semaphore = self.semaphore(signal)?;
        let result = unsafe {
            self.swapchain_fn.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(device_error(e, BackendError::AcquireImageFailed, "acquire next image")),
        }
    }

    fn present(
        &mut self,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<PresentOutcome> {
        let semaphore = self.semaphore(wait)?;
        let swapchains = [self.swapchain.handle];
        let indices = [image_index];
        let waits = [semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { self.swapchain_fn.queue_present(self.queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(device_error(e, BackendError::PresentFailed, "present")),
        }
    }

    fn find_depth_format(&self) -> BackendResult<TextureFormat> {
        [
            TextureFormat::Depth32Float,
            TextureFormat::Depth32FloatStencil8,
            TextureFormat::Depth24PlusStencil8,
        ]
        .into_iter()
        .find(|&format| {
            let properties = unsafe {
                self.instance.get_physical_device_format_properties(
                    self.physical_device,
                    convert_texture_format(format),
                )
            };
            properties
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| BackendError::Unsupported("No supported depth format".to_string()))
    }

    fn max_msaa_samples(&self) -> u32 {
        let properties = unsafe {
            self.instance
                .get_physical_device_properties(self.physical_device)
        };
        max_sample_count(
            properties.limits.framebuffer_color_sample_counts
                & properties.limits.framebuffer_depth_sample_counts,
        )
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| device_error(e, BackendError::WaitFailed, "wait for device idle"))
    }

    fn create_semaphore(&mut self, label: &str) -> BackendResult<SemaphoreHandle> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
        .map_err(|e| device_error(e, BackendError::SyncCreationFailed, "create semaphore"))?;
        let id = self.allocate_id();
        self.semaphores.insert(id, semaphore);
        log::trace!("Created semaphore '{}' ({})", label, id);
        Ok(SemaphoreHandle(id))
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_fence(&mut self, label: &str, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
        .map_err(|e| device_error(e, BackendError::SyncCreationFailed, "create fence"))?;
        let id = self.allocate_id();
        self.fences.insert(id, fence);
        log::trace!("Created fence '{}' ({})", label, id);
        Ok(FenceHandle(id))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if let Some(fence) = self.fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = self.fence(fence)?;
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .map_err(|e| device_error(e, BackendError::WaitFailed, "wait for fence"))
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let fence = self.fence(fence)?;
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| device_error(e, BackendError::WaitFailed, "reset fence"))
    }

    fn fence_status(&self, fence: FenceHandle) -> BackendResult<FenceStatus> {
        let fence = self.fence(fence)?;
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(true) => Ok(FenceStatus::Signaled),
            Ok(false) => Ok(FenceStatus::Unsignaled),
            Err(e) => Err(device_error(e, BackendError::WaitFailed, "query fence")),
        }
    }

    fn create_command_list(
        &mut self,
        label: &str,
        queue: QueueKind,
    ) -> BackendResult<CommandListHandle> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| {
                device_error(e, BackendError::CommandRecordingFailed, "allocate command buffer")
            })?[0];
        let id = self.allocate_id();
        self.command_lists.insert(id, cmd);
        log::trace!("Created {:?} command list '{}' ({})", queue, label, id);
        Ok(CommandListHandle(id))
    }

    fn destroy_command_list(&mut self, cmd: CommandListHandle) {
        if let Some(cmd) = self.command_lists.remove(&cmd.0) {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        }
    }

    fn begin_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let cmd = self.command_buffer(cmd)?;
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| {
                    device_error(e, BackendError::CommandRecordingFailed, "reset command buffer")
                })?;
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| {
                    device_error(e, BackendError::CommandRecordingFailed, "begin command buffer")
                })
        }
    }

    fn end_command_list(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let cmd = self.command_buffer(cmd)?;
        unsafe { self.device.end_command_buffer(cmd) }
            .map_err(|e| {
                device_error(e, BackendError::CommandRecordingFailed, "end command buffer")
            })
    }

    fn submit(&mut self, submission: &Submission) -> BackendResult<()> {
        let command_buffers = submission
            .command_lists
            .iter()
            .map(|&cmd| self.command_buffer(cmd))
            .collect::<BackendResult<Vec<_>>>()?;
        let wait_semaphores = submission
            .waits
            .iter()
            .map(|wait| self.semaphore(wait.semaphore))
            .collect::<BackendResult<Vec<_>>>()?;
        let wait_stages: Vec<vk::PipelineStageFlags> = submission
            .waits
            .iter()
            .map(|wait| convert_pipeline_stage(wait.stage))
            .collect();
        let signal_semaphores = submission
            .signals
            .iter()
            .map(|&semaphore| self.semaphore(semaphore))
            .collect::<BackendResult<Vec<_>>>()?;
        let fence = match submission.fence {
            Some(fence) => self.fence(fence)?,
            None => vk::Fence::null(),
        };

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe { self.device.queue_submit(self.queue, &[submit_info], fence) }
            .map_err(|e| device_error(e, BackendError::SubmitFailed, "submit to queue"))
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        // Zero-sized buffers are not valid in Vulkan
        let vk_size = desc.size.max(4);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(vk_size)
            .usage(convert_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| device_error(e, BackendError::BufferCreationFailed, "create buffer"))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let name = desc.label.as_deref().unwrap_or("buffer");
        let allocation = match self.allocate(name, requirements, MemoryLocation::CpuToGpu, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(device_error(e, BackendError::BufferCreationFailed, "bind buffer memory"));
        }

        let id = self.allocate_id();
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
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
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {:?}", buffer)))?;
        let end = offset + data.len() as u64;
        if end > vk_buffer.size {
            return Err(BackendError::InvalidHandle(format!(
                "write of {} bytes at {} overruns buffer {:?} of {} bytes",
                data.len(),
                offset,
                buffer,
                vk_buffer.size
            )));
        }
        let mapped = vk_buffer.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::Unsupported(format!("buffer {:?} is not host-visible", buffer))
        })?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        let vk_buffer = self.vk_buffer(buffer)?;
        let end = offset + size;
        if end > vk_buffer.size {
            return Err(BackendError::InvalidHandle(format!(
                "read of {} bytes at {} overruns buffer {:?} of {} bytes",
                size, offset, buffer, vk_buffer.size
            )));
        }
        let mapped = vk_buffer.allocation.mapped_slice().ok_or_else(|| {
            BackendError::Unsupported(format!("buffer {:?} is not host-visible", buffer))
        })?;
        Ok(mapped[offset as usize..end as usize].to_vec())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(1)
            .samples(convert_sample_count(desc.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert_texture_usage(desc.usage, desc.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| device_error(e, BackendError::TextureCreationFailed, "create image"))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let name = desc.label.as_deref().unwrap_or("texture");
        let allocation = match self.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
            return Err(device_error(e, BackendError::TextureCreationFailed, "bind image memory"));
        }

        let id = self.allocate_id();
        self.textures.insert(
            id,
            VkTexture {
                image,
                allocation,
                format: desc.format,
                width: desc.width,
                height: desc.height,
                mip_levels: desc.mip_levels,
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?;
        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert_texture_format(tex.format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect_mask(tex.format),
                base_mip_level: 0,
                level_count: tex.mip_levels,
                base_array_layer: 0,
                layer_count: 1,
            });
        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| {
                device_error(e, BackendError::TextureCreationFailed, "create image view")
            })?;

        let id = self.allocate_id();
        self.texture_views.insert(
            id,
            VkTextureView {
                view,
                swapchain: false,
            },
        );
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
    ) -> BackendResult<()> {
        let (image, format, mip_levels) = {
            let tex = self
                .textures
                .get(&texture.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("texture {:?}", texture)))?;
            if width > tex.width || height > tex.height {
                return Err(BackendError::InvalidHandle(format!(
                    "upload of {}x{} into texture {:?} of {}x{}",
                    width, height, texture, tex.width, tex.height
                )));
            }
            (tex.image, tex.format, tex.mip_levels)
        };
        let expected = width as usize * height as usize * format.bytes_per_pixel() as usize;
        if data.len() != expected {
            return Err(BackendError::InvalidHandle(format!(
                "texture upload has {} bytes, {}x{} {:?} needs {}",
                data.len(),
                width,
                height,
                format,
                expected
            )));
        }

        let staging = self.create_buffer_init(
            &BufferDescriptor {
                label: Some("texture staging".to_string()),
                size: data.len() as u64,
                usage: BufferUsage::COPY_SRC,
                mapped_at_creation: true,
            },
            data,
        )?;
        let staging_buffer = self.vk_buffer(staging)?.buffer;

        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect_mask(format),
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        };
        let device = &self.device;
        let result = self.run_one_time(|cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy::default()
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: range.aspect_mask,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });

        self.destroy_buffer(staging);
        result
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let mut sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert_filter(desc.mag_filter))
            .min_filter(convert_filter(desc.min_filter))
            .mipmap_mode(convert_mipmap_mode(desc.mipmap_filter))
            .address_mode_u(convert_address_mode(desc.address_mode_u))
            .address_mode_v(convert_address_mode(desc.address_mode_v))
            .address_mode_w(convert_address_mode(desc.address_mode_w))
            .max_lod(vk::LOD_CLAMP_NONE);
        if let Some(compare) = desc.compare {
            sampler_info = sampler_info
                .compare_enable(true)
                .compare_op(convert_compare_function(compare));
        }

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(|e| device_error(e, BackendError::TextureCreationFailed, "create sampler"))?;
        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(convert_binding_type(&entry.ty))
                    .descriptor_count(1)
                    .stage_flags(convert_shader_stages(entry.visibility))
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| {
                device_error(
                    e,
                    BackendError::DescriptorAllocationFailed,
                    "create descriptor set layout",
                )
            })?;

        let id = self.allocate_id();
        self.bind_group_layouts.insert(
            id,
            VkBindGroupLayout {
                layout,
                entries: entries.to_vec(),
            },
        );
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let bind_group_layout = self
            .bind_group_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("bind group layout {:?}", layout)))?;

        let mut infos = Vec::with_capacity(entries.len());
        for (binding, entry) in entries {
            let ty = bind_group_layout
                .entries
                .iter()
                .find(|e| e.binding == *binding)
                .map(|e| convert_binding_type(&e.ty))
                .ok_or_else(|| {
                    BackendError::InvalidHandle(format!(
                        "binding {} not in layout {:?}",
                        binding, layout
                    ))
                })?;
            let info = match entry {
                BindGroupEntry::Buffer {
                    buffer,
                    offset,
                    size,
                } => DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                    buffer: self.vk_buffer(*buffer)?.buffer,
                    offset: *offset,
                    range: size.unwrap_or(vk::WHOLE_SIZE),
                }),
                BindGroupEntry::Texture(view) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: self.image_view(*view)?,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }),
                BindGroupEntry::Sampler(sampler) => DescriptorInfo::Image(vk::DescriptorImageInfo {
                    sampler: self
                        .samplers
                        .get(&sampler.0)
                        .copied()
                        .ok_or_else(|| {
                            BackendError::InvalidHandle(format!("sampler {:?}", sampler))
                        })?,
                    image_view: vk::ImageView::null(),
                    image_layout: vk::ImageLayout::UNDEFINED,
                }),
            };
            infos.push((*binding, ty, info));
        }

        let set_layouts = [bind_group_layout.layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);
        let set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| {
                device_error(e, BackendError::DescriptorAllocationFailed, "allocate descriptor set")
            })?[0];

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    DescriptorInfo::Buffer(buffer) => {
                        write.buffer_info(std::slice::from_ref(buffer))
                    }
                    DescriptorInfo::Image(image) => write.image_info(std::slice::from_ref(image)),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let id = self.allocate_id();
        self.bind_groups.insert(id, set);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pass(&mut self, layout: &RenderPassLayout) -> BackendResult<RenderPassHandle> {
        let attachments: Vec<vk::AttachmentDescription> = layout
            .attachments()
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .format(convert_texture_format(a.format))
                    .samples(convert_sample_count(a.samples))
                    .load_op(convert_load_op(a.load_op))
                    .store_op(convert_store_op(a.store_op))
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(convert_image_layout(a.initial_layout))
                    .final_layout(convert_image_layout(a.final_layout))
            })
            .collect();

        let mut next = 0u32;
        let mut reference = |layout: vk::ImageLayout| {
            let attachment = next;
            next += 1;
            vk::AttachmentReference { attachment, layout }
        };
        let color_ref = layout
            .color
            .map(|_| reference(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        let resolve_ref = layout
            .resolve
            .map(|_| reference(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
        let depth_ref = layout
            .depth
            .map(|_| reference(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL));

        let mut subpass =
            vk::SubpassDescription::default().pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS);
        if let Some(color) = color_ref.as_ref() {
            subpass = subpass.color_attachments(std::slice::from_ref(color));
        }
        if let Some(resolve) = resolve_ref.as_ref() {
            subpass = subpass.resolve_attachments(std::slice::from_ref(resolve));
        }
        if let Some(depth) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth);
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(convert_pipeline_stage(layout.dependency.src_stage))
            .dst_stage_mask(convert_pipeline_stage(layout.dependency.dst_stage))
            .src_access_mask(convert_access(layout.dependency.src_access))
            .dst_access_mask(convert_access(layout.dependency.dst_access));

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));
        let render_pass = unsafe { self.device.create_render_pass(&render_pass_info, None) }
            .map_err(|e| {
                device_error(e, BackendError::PipelineCreationFailed, "create render pass")
            })?;

        let id = self.allocate_id();
        self.render_passes.insert(id, render_pass);
        log::debug!("Created render pass {:?} ({})", layout.label, id);
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let render_pass = self
            .render_passes
            .get(&desc.render_pass.0)
            .copied()
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("render pass {:?}", desc.render_pass))
            })?;
        let views = desc
            .attachments
            .iter()
            .map(|&view| self.image_view(view))
            .collect::<BackendResult<Vec<_>>>()?;

        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(1);
        let framebuffer = unsafe { self.device.create_framebuffer(&framebuffer_info, None) }
            .map_err(|e| {
                device_error(e, BackendError::TextureCreationFailed, "create framebuffer")
            })?;

        let id = self.allocate_id();
        self.framebuffers.insert(id, framebuffer);
        Ok(FramebufferHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let render_pass = self
            .render_passes
            .get(&desc.render_pass.0)
            .copied()
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("render pass {:?}", desc.render_pass))
            })?;

        let entry_name = |name: &str| {
            CString::new(name).map_err(|e| {
                BackendError::ShaderCreationFailed(format!("Invalid entry point '{}': {}", name, e))
            })
        };
        let vertex_entry = entry_name(&desc.vertex_entry)?;
        let fragment_entry = desc.fragment_entry.as_deref().map(entry_name).transpose()?;

        let vertex_spirv = compile_wgsl(&desc.shader, ShaderStage::Vertex, &desc.vertex_entry)?;
        let fragment_spirv = desc
            .fragment_entry
            .as_deref()
            .map(|entry| compile_wgsl(&desc.shader, ShaderStage::Fragment, entry))
            .transpose()?;

        let pipeline_layout =
            self.create_pipeline_layout(&desc.bind_group_layouts, &desc.push_constant_ranges)?;

        let mut modules = Vec::with_capacity(2);
        let result = (|| {
            let vertex_module = self.create_shader_module(&vertex_spirv)?;
            modules.push(vertex_module);
            let mut stages = vec![vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex_module)
                .name(&vertex_entry)];
            if let (Some(spirv), Some(entry)) = (fragment_spirv.as_ref(), fragment_entry.as_ref()) {
                let fragment_module = self.create_shader_module(spirv)?;
                modules.push(fragment_module);
                stages.push(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(vk::ShaderStageFlags::FRAGMENT)
                        .module(fragment_module)
                        .name(entry),
                );
            }

            let bindings: Vec<vk::VertexInputBindingDescription> = desc
                .vertex_layouts
                .iter()
                .enumerate()
                .map(|(slot, layout)| vk::VertexInputBindingDescription {
                    binding: slot as u32,
                    stride: layout.array_stride as u32,
                    input_rate: match layout.step_mode {
                        VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                        VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                    },
                })
                .collect();
            let attributes: Vec<vk::VertexInputAttributeDescription> = desc
                .vertex_layouts
                .iter()
                .enumerate()
                .flat_map(|(slot, layout)| {
                    layout
                        .attributes
                        .iter()
                        .map(move |attr| vk::VertexInputAttributeDescription {
                            location: attr.location,
                            binding: slot as u32,
                            format: convert_vertex_format(attr.format),
                            offset: attr.offset as u32,
                        })
                })
                .collect();
            let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes);

            let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
                .topology(convert_topology(desc.primitive_topology));
            let viewport_state = vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1);
            let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
                .polygon_mode(vk::PolygonMode::FILL)
                .cull_mode(convert_cull_mode(desc.cull_mode))
                .front_face(convert_front_face(desc.front_face))
                .line_width(1.0);
            let multisample = vk::PipelineMultisampleStateCreateInfo::default()
                .rasterization_samples(convert_sample_count(desc.sample_count));

            let depth_stencil = match &desc.depth_stencil {
                Some(state) => vk::PipelineDepthStencilStateCreateInfo::default()
                    .depth_test_enable(true)
                    .depth_write_enable(state.depth_write_enabled)
                    .depth_compare_op(convert_compare_function(state.depth_compare)),
                None => vk::PipelineDepthStencilStateCreateInfo::default(),
            };

            let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> =
                desc.color_targets.iter().map(convert_color_target).collect();
            let color_blend =
                vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

            let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
            let dynamic_state =
                vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

            let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
                .stages(&stages)
                .vertex_input_state(&vertex_input)
                .input_assembly_state(&input_assembly)
                .viewport_state(&viewport_state)
                .rasterization_state(&rasterization)
                .multisample_state(&multisample)
                .depth_stencil_state(&depth_stencil)
                .color_blend_state(&color_blend)
                .dynamic_state(&dynamic_state)
                .layout(pipeline_layout)
                .render_pass(render_pass)
                .subpass(0);

            unsafe {
                self.device
                    .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            }
            .map(|pipelines| pipelines[0])
            .map_err(|(_, e)| {
                device_error(e, BackendError::PipelineCreationFailed, "create render pipeline")
            })
        })();

        unsafe {
            for module in modules {
                self.device.destroy_shader_module(module, None);
            }
        }

        let pipeline = match result {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe { self.device.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(e);
            }
        };

        let id = self.allocate_id();
        self.render_pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                layout: pipeline_layout,
            },
        );
        log::debug!("Created render pipeline {:?} ({})", desc.label, id);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let entry = CString::new(desc.entry_point.as_str()).map_err(|e| {
            BackendError::ShaderCreationFailed(format!(
                "Invalid entry point '{}': {}",
                desc.entry_point, e
            ))
        })?;
        let spirv = compile_wgsl(&desc.shader, ShaderStage::Compute, &desc.entry_point)?;
        let module = self.create_shader_module(&spirv)?;

        let layout_result =
            self.create_pipeline_layout(&desc.bind_group_layouts, &desc.push_constant_ranges);
        let pipeline_layout = match layout_result {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { self.device.destroy_shader_module(module, None) };
                return Err(e);
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        let pipeline = match result {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(pipeline_layout, None) };
                return Err(device_error(
                    e,
                    BackendError::PipelineCreationFailed,
                    "create compute pipeline",
                ));
            }
        };

        let id = self.allocate_id();
        self.compute_pipelines.insert(
            id,
            VkPipeline {
                pipeline,
                layout: pipeline_layout,
            },
        );
        log::debug!("Created compute pipeline {:?} ({})", desc.label, id);
        Ok(ComputePipelineHandle(id))
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandListHandle,
        info: &RenderPassBeginInfo,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let render_pass = self
            .render_passes
            .get(&info.render_pass.0)
            .copied()
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("render pass {:?}", info.render_pass))
            })?;
        let framebuffer = self
            .framebuffers
            .get(&info.framebuffer.0)
            .copied()
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("framebuffer {:?}", info.framebuffer))
            })?;
        let clear_values: Vec<vk::ClearValue> =
            info.clear_values.iter().copied().map(convert_clear_value).collect();

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: info.width,
                    height: info.height,
                },
            })
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cb, &begin_info, vk::SubpassContents::INLINE)
        };
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandListHandle) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        unsafe { self.device.cmd_end_render_pass(cb) };
        Ok(())
    }

    fn cmd_set_viewport(
        &mut self,
        cmd: CommandListHandle,
        viewport: &Viewport,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let vk_viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.device.cmd_set_viewport(cb, 0, &[vk_viewport]) };
        Ok(())
    }

    fn cmd_set_scissor(
        &mut self,
        cmd: CommandListHandle,
        scissor: &ScissorRect,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let rect = vk::Rect2D {
            offset: vk::Offset2D {
                x: scissor.x,
                y: scissor.y,
            },
            extent: vk::Extent2D {
                width: scissor.width,
                height: scissor.height,
            },
        };
        unsafe { self.device.cmd_set_scissor(cb, 0, &[rect]) };
        Ok(())
    }

    fn cmd_bind_render_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: RenderPipelineHandle,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let vk_pipeline = self
            .render_pipelines
            .get(&pipeline.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("render pipeline {:?}", pipeline)))?;
        unsafe {
            self.device
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, vk_pipeline.pipeline)
        };
        Ok(())
    }

    fn cmd_bind_compute_pipeline(
        &mut self,
        cmd: CommandListHandle,
        pipeline: ComputePipelineHandle,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let vk_pipeline = self
            .compute_pipelines
            .get(&pipeline.0)
            .ok_or_else(|| {
                BackendError::InvalidHandle(format!("compute pipeline {:?}", pipeline))
            })?;
        unsafe {
            self.device
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::COMPUTE, vk_pipeline.pipeline)
        };
        Ok(())
    }

    fn cmd_set_bind_group(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        index: u32,
        bind_group: BindGroupHandle,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let (bind_point, layout) = self.bound_layout(pipeline)?;
        let set = self
            .bind_groups
            .get(&bind_group.0)
            .copied()
            .ok_or_else(|| BackendError::InvalidHandle(format!("bind group {:?}", bind_group)))?;
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(cb, bind_point, layout, index, &[set], &[])
        };
        Ok(())
    }

    fn cmd_push_constants(
        &mut self,
        cmd: CommandListHandle,
        pipeline: PipelineBinding,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let (_, layout) = self.bound_layout(pipeline)?;
        unsafe {
            self.device
                .cmd_push_constants(cb, layout, convert_shader_stages(stages), offset, data)
        };
        Ok(())
    }

    fn cmd_set_vertex_buffer(
        &mut self,
        cmd: CommandListHandle,
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let vk_buffer = self.vk_buffer(buffer)?.buffer;
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(cb, slot, &[vk_buffer], &[offset])
        };
        Ok(())
    }

    fn cmd_set_index_buffer(
        &mut self,
        cmd: CommandListHandle,
        buffer: BufferHandle,
        offset: u64,
        format: IndexFormat,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        let vk_buffer = self.vk_buffer(buffer)?.buffer;
        unsafe {
            self.device
                .cmd_bind_index_buffer(cb, vk_buffer, offset, convert_index_format(format))
        };
        Ok(())
    }

    fn cmd_draw_indexed(
        &mut self,
        cmd: CommandListHandle,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        unsafe {
            self.device.cmd_draw_indexed(
                cb,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                base_vertex,
                instances.start,
            )
        };
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
        let cb = self.command_buffer(cmd)?;
        let vk_buffer = self.vk_buffer(buffer)?.buffer;
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(vk_buffer)
            .offset(offset)
            .size(size);
        unsafe {
            self.device.cmd_fill_buffer(cb, vk_buffer, offset, size, value);
            self.device.cmd_pipeline_barrier(
                cb,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        Ok(())
    }

    fn cmd_dispatch(
        &mut self,
        cmd: CommandListHandle,
        x: u32,
        y: u32,
        z: u32,
    ) -> BackendResult<()> {
        let cb = self.command_buffer(cmd)?;
        unsafe { self.device.cmd_dispatch(cb, x, y, z) };
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            self.free(vk_buffer.allocation);
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture.0) {
            unsafe { self.device.destroy_image(tex.image, None) };
            self.free(tex.allocation);
        }
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        if self.texture_views.get(&view.0).is_some_and(|v| !v.swapchain) {
            if let Some(v) = self.texture_views.remove(&view.0) {
                unsafe { self.device.destroy_image_view(v.view, None) };
            }
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(sampler) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        if let Some(set) = self.bind_groups.remove(&bind_group.0) {
            let freed = unsafe { self.device.free_descriptor_sets(self.descriptor_pool, &[set]) };
            if let Err(e) = freed {
                log::warn!("Failed to free descriptor set: {:?}", e);
            }
        }
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        if let Some(layout) = self.bind_group_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(layout.layout, None) };
        }
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(render_pass) = self.render_passes.remove(&render_pass.0) {
            unsafe { self.device.destroy_render_pass(render_pass, None) };
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(framebuffer) = self.framebuffers.remove(&framebuffer.0) {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pipeline) = self.render_pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
        }
    }

    fn destroy_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        if let Some(pipeline) = self.compute_pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, framebuffer) in self.framebuffers.drain() {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            for (_, pipeline) in self
                .render_pipelines
                .drain()
                .chain(self.compute_pipelines.drain())
            {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            for (_, render_pass) in self.render_passes.drain() {
                self.device.destroy_render_pass(render_pass, None);
            }
            // Sets go with the pool
            self.bind_groups.clear();
            for (_, layout) in self.bind_group_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout.layout, None);
            }
            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, view) in self.texture_views.drain() {
                if !view.swapchain {
                    self.device.destroy_image_view(view.view, None);
                }
            }

            if let Some(mut allocator) = self.allocator.take() {
                for (_, buffer) in self.buffers.drain() {
                    self.device.destroy_buffer(buffer.buffer, None);
                    let _ = allocator.free(buffer.allocation);
                }
                for (_, texture) in self.textures.drain() {
                    self.device.destroy_image(texture.image, None);
                    let _ = allocator.free(texture.allocation);
                }
                // The allocator must go before the device
                drop(allocator);
            }

            for (_, semaphore) in self.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, fence) in self.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            self.command_lists.clear();
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);

            self.swapchain.destroy(&self.device, &self.swapchain_fn);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
