//! Swapchain creation and teardown.

use ash::khr::{surface, swapchain};
use ash::vk;

use crate::backend::traits::{BackendError, BackendResult};

/// Presentable images of one swapchain generation
pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    /// Build a swapchain for `surface`, retiring `old` if given.
    ///
    /// The surface's current extent wins over `width`/`height` when the
    /// platform reports one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        swapchain_fn: &swapchain::Device,
        surface: vk::SurfaceKHR,
        old: vk::SwapchainKHR,
        width: u32,
        height: u32,
        vsync: bool,
    ) -> BackendResult<Self> {
        let capabilities = unsafe {
            surface_fn.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to get surface capabilities: {:?}",
                e
            ))
        })?;

        let formats = unsafe {
            surface_fn.get_physical_device_surface_formats(physical_device, surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to get surface formats: {:?}",
                e
            ))
        })?;

        let present_modes = unsafe {
            surface_fn.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to get present modes: {:?}",
                e
            ))
        })?;

        let surface_format = choose_surface_format(&formats).ok_or_else(|| {
            BackendError::SwapchainCreationFailed("Surface reports no formats".to_string())
        })?;
        let present_mode = choose_present_mode(&present_modes, vsync);
        let extent = choose_extent(&capabilities, width, height);

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let handle = unsafe { swapchain_fn.create_swapchain(&create_info, None) }.map_err(|e| {
            BackendError::SwapchainCreationFailed(format!("Failed to create swapchain: {:?}", e))
        })?;

        let images = unsafe { swapchain_fn.get_swapchain_images(handle) }.map_err(|e| {
            BackendError::SwapchainCreationFailed(format!(
                "Failed to get swapchain images: {:?}",
                e
            ))
        })?;

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    unsafe {
                        for view in views {
                            device.destroy_image_view(view, None);
                        }
                        swapchain_fn.destroy_swapchain(handle, None);
                    }
                    return Err(BackendError::SwapchainCreationFailed(format!(
                        "Failed to create swapchain image view: {:?}",
                        e
                    )));
                }
            }
        }

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(Self {
            handle,
            images,
            views,
            format: surface_format.format,
            extent,
        })
    }

    /// Destroy views and the swapchain. The device must be idle.
    pub fn destroy(&mut self, device: &ash::Device, swapchain_fn: &swapchain::Device) {
        unsafe {
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                swapchain_fn.destroy_swapchain(self.handle, None);
            }
        }
        self.handle = vk::SwapchainKHR::null();
        self.images.clear();
    }
}

/// Prefer sRGB BGRA, fall back to whatever comes first
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    // FIFO is always supported
    modes
        .iter()
        .copied()
        .find(|&m| m == vk::PresentModeKHR::MAILBOX)
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_srgb_bgra() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_clamped_when_surface_is_flexible() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = choose_extent(&capabilities, 2000, 600);
        assert_eq!((extent.width, extent.height), (1024, 600));

        let fixed = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 450,
            },
            ..capabilities
        };
        let extent = choose_extent(&fixed, 2000, 600);
        assert_eq!((extent.width, extent.height), (800, 450));
    }
}
