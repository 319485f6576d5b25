//! Instance, physical device and logical device setup.

use std::ffi::{c_char, CStr};

use ash::khr::surface;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use raw_window_handle::RawDisplayHandle;

use crate::backend::traits::{BackendError, BackendResult};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create an instance with the surface extensions the display needs.
///
/// Validation is enabled only when requested and the layer is installed.
pub fn create_instance(
    entry: &ash::Entry,
    display: RawDisplayHandle,
    validation: bool,
) -> BackendResult<ash::Instance> {
    let validation_available = validation && has_validation_layer(entry);
    if validation && !validation_available {
        log::warn!("Validation layer requested but not available");
    }

    let app_info = vk::ApplicationInfo::default()
        .application_name(c"Clustered Renderer")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"clustered-renderer")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)
        .map_err(|e| {
            BackendError::InitializationFailed(format!(
                "Failed to query surface extensions: {:?}",
                e
            ))
        })?
        .to_vec();

    #[allow(unused_mut)]
    let mut flags = vk::InstanceCreateFlags::empty();

    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layers: Vec<*const c_char> = if validation_available {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create Vulkan instance: {:?}", e))
    })
}

fn has_validation_layer(entry: &ash::Entry) -> bool {
    let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };
    layers.iter().any(|layer| {
        layer
            .layer_name_as_c_str()
            .map_or(false, |name| name == VALIDATION_LAYER_NAME)
    })
}

/// Find a queue family that supports graphics, compute and presentation to
/// `surface`. Compute lists share this queue.
pub fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let presents = unsafe {
            surface_fn
                .get_physical_device_surface_support(physical_device, index, surface)
                .unwrap_or(false)
        };
        (family.queue_flags.contains(flags) && presents).then_some(index)
    })
}

/// Pick the highest-scoring device that can render to and present on `surface`.
///
/// Discrete GPUs score above integrated ones.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> BackendResult<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        BackendError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    if devices.is_empty() {
        return Err(BackendError::InitializationFailed(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(vk::PhysicalDevice, u32, u32)> = None;

    for device in devices {
        let Some(family) = find_queue_family(instance, device, surface_fn, surface) else {
            continue;
        };
        let properties = unsafe { instance.get_physical_device_properties(device) };

        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 0,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        let name = properties
            .device_name_as_c_str()
            .unwrap_or(c"<unknown>");
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            name,
            properties.device_type,
            score
        );

        if best.map_or(true, |(_, _, best_score)| score > best_score) {
            best = Some((device, family, score));
        }
    }

    best.map(|(device, family, _)| (device, family))
        .ok_or_else(|| BackendError::InitializationFailed("No suitable GPU found".to_string()))
}

pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> BackendResult<ash::Device> {
    let priorities = [1.0f32];
    let queue_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)];

    #[allow(unused_mut)]
    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_subset::NAME.as_ptr());

    let features = vk::PhysicalDeviceFeatures::default();

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        BackendError::DeviceCreationFailed(format!("Failed to create logical device: {:?}", e))
    })
}

pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> BackendResult<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        BackendError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}
