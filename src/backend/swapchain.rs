// Swapchain - Window presentation
//
// Negotiation is a pure function over the surface's reported support so it
// can be checked without a GPU. Creation registers the swapchain and then
// its image views with the deletion queue, so views are destroyed first.
// Resize is not handled: an out-of-date swapchain is fatal.

use ash::extensions::khr;
use ash::vk;

use super::selector::QueueFamilies;
use super::VulkanDevice;
use crate::engine::deletion::DeletionQueue;
use crate::error::{EngineError, Result, VkResultExt};

/// What the surface supports on the selected GPU.
#[derive(Debug, Clone)]
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupport {
    pub fn query(
        surface_loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .calling("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .calling("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .calling("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            })
        }
    }
}

/// Negotiated swapchain parameters.
#[derive(Debug, Clone)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// `min + 1`, capped at `max` when the surface reports one (0 means unbounded).
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// The surface's current extent, or the desired one clamped to its bounds
/// when the window system lets the swapchain decide.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        height: desired
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    }
}

impl SwapchainPlan {
    pub fn negotiate(
        support: &SwapchainSupport,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        desired_extent: vk::Extent2D,
        families: QueueFamilies,
    ) -> Result<Self> {
        let format_supported = support
            .formats
            .iter()
            .any(|f| f.format == surface_format.format && f.color_space == surface_format.color_space);
        if !format_supported {
            return Err(EngineError::Unsupported(format!(
                "surface format {:?} / {:?}",
                surface_format.format, surface_format.color_space
            )));
        }
        if !support.present_modes.contains(&present_mode) {
            return Err(EngineError::Unsupported(format!("present mode {:?}", present_mode)));
        }

        let (sharing_mode, queue_family_indices) = if families.is_shared() {
            (vk::SharingMode::EXCLUSIVE, Vec::new())
        } else {
            (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
        };

        Ok(Self {
            surface_format,
            present_mode,
            extent: choose_extent(&support.capabilities, desired_extent),
            image_count: image_count(&support.capabilities),
            sharing_mode,
            queue_family_indices,
            pre_transform: support.capabilities.current_transform,
        })
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl Swapchain {
    pub fn new(
        device: &VulkanDevice,
        surface: vk::SurfaceKHR,
        plan: &SwapchainPlan,
        deletion: &mut DeletionQueue,
    ) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{} ({:?}, {:?})",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(plan.sharing_mode)
            .queue_family_indices(&plan.queue_family_indices)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .creating("swapchain")?;
        deletion.track(swapchain);

        let images = unsafe { device.swapchain_loader.get_swapchain_images(swapchain) }
            .calling("vkGetSwapchainImagesKHR")?;
        log::info!("Created swapchain with {} images", images.len());

        let image_views = images
            .iter()
            .map(|&image| {
                let view = device.create_image_view(image, plan.surface_format.format, vk::ImageAspectFlags::COLOR)?;
                Ok(deletion.track(view))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: plan.surface_format.format,
            extent: plan.extent,
        })
    }
}
