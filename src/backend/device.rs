// Vulkan device - logical device, queues and the memory allocator
//
// Responsibilities:
// - Logical device with one queue per distinct family
// - Device extensions, core features and the shaderDrawParameters chain
// - gpu-allocator allocator behind a mutex, plus the allocations it owns
// - Kind-dispatching destruction for deletion-queue records
//
// Drop order: allocator ─> device ─> (instance: surface ─> messenger ─> instance)

use ash::extensions::khr;
use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CStr;
use std::mem::ManuallyDrop;

use super::gpu::{Destroyer, ResourceAllocator};
use super::instance::VulkanInstance;
use super::selector::PhysicalDeviceInfo;
use crate::engine::deletion::{ResourceKind, Teardown};
use crate::error::{EngineError, Result, VkResultExt};

/// Allocator plus every allocation handed out through the facade.
pub(crate) struct GpuMemory {
    pub(crate) allocator: Allocator,
    pub(crate) buffers: HashMap<vk::Buffer, Allocation>,
    pub(crate) images: HashMap<vk::Image, Allocation>,
}

pub struct DeviceBuilder {
    physical: PhysicalDeviceInfo,
    extensions: Vec<&'static CStr>,
    features: vk::PhysicalDeviceFeatures,
    draw_parameters: bool,
}

impl DeviceBuilder {
    pub fn new(physical: PhysicalDeviceInfo) -> Self {
        Self {
            physical,
            extensions: vec![khr::Swapchain::name()],
            features: vk::PhysicalDeviceFeatures::default(),
            draw_parameters: false,
        }
    }

    pub fn extensions(mut self, names: impl IntoIterator<Item = &'static CStr>) -> Self {
        for name in names {
            if !self.extensions.contains(&name) {
                self.extensions.push(name);
            }
        }
        self
    }

    pub fn features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Chain `VkPhysicalDeviceShaderDrawParametersFeatures` into device creation.
    pub fn draw_parameters(mut self, enabled: bool) -> Self {
        self.draw_parameters = enabled;
        self
    }

    /// One create-info per distinct family, priority 1.0.
    fn queue_infos(&self, priorities: &[f32]) -> Vec<vk::DeviceQueueCreateInfo> {
        self.physical
            .queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect()
    }

    pub fn build(self, instance: VulkanInstance) -> Result<VulkanDevice> {
        let priorities = [1.0];
        let queue_infos = self.queue_infos(&priorities);
        let extension_ptrs: Vec<_> = self.extensions.iter().map(|name| name.as_ptr()).collect();

        let mut draw_parameters = vk::PhysicalDeviceShaderDrawParametersFeatures::builder()
            .shader_draw_parameters(true);
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&self.features);
        if self.draw_parameters {
            create_info = create_info.push_next(&mut draw_parameters);
        }

        let device = unsafe {
            instance
                .instance
                .create_device(self.physical.physical_device, &create_info, None)
        }
        .creating("logical device")?;

        let families = self.physical.queue_families;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };
        log::debug!(
            "Created logical device ({} queue families, {} extensions)",
            queue_infos.len(),
            self.extensions.len()
        );

        let allocator = match create_allocator(&instance.instance, self.physical.physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        let swapchain_loader = khr::Swapchain::new(&instance.instance, &device);

        Ok(VulkanDevice {
            memory: ManuallyDrop::new(Mutex::new(GpuMemory {
                allocator,
                buffers: HashMap::new(),
                images: HashMap::new(),
            })),
            device,
            physical: self.physical,
            graphics_queue,
            present_queue,
            swapchain_loader,
            instance,
        })
    }
}

fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> Result<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    })
    .map_err(|source| EngineError::Allocation {
        what: "device allocator".into(),
        source,
    })
}

/// Vulkan device wrapper with ordered cleanup
pub struct VulkanDevice {
    // Dropped by hand before the device
    pub(crate) memory: ManuallyDrop<Mutex<GpuMemory>>,
    pub device: ash::Device,
    pub physical: PhysicalDeviceInfo,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain_loader: khr::Swapchain,
    // Must stay the last field: it is dropped after the device
    pub instance: VulkanInstance,
}

impl VulkanDevice {
    pub fn graphics_family(&self) -> u32 {
        self.physical.queue_families.graphics
    }

    /// Surface loader and handle owned by the instance.
    pub fn surface(&self) -> Result<(&khr::Surface, vk::SurfaceKHR)> {
        self.instance
            .surface()
            .ok_or_else(|| EngineError::InvalidInput("no surface attached to the instance".into()))
    }
}

impl Destroyer for VulkanDevice {
    fn destroy(&self, teardown: Teardown) {
        let raw = teardown.handle;
        let device = &self.device;
        unsafe {
            match teardown.kind {
                ResourceKind::Buffer => self.destroy_buffer(vk::Buffer::from_raw(raw)),
                ResourceKind::Image => self.destroy_image(vk::Image::from_raw(raw)),
                ResourceKind::ImageView => device.destroy_image_view(vk::ImageView::from_raw(raw), None),
                ResourceKind::Sampler => device.destroy_sampler(vk::Sampler::from_raw(raw), None),
                ResourceKind::Framebuffer => device.destroy_framebuffer(vk::Framebuffer::from_raw(raw), None),
                ResourceKind::RenderPass => device.destroy_render_pass(vk::RenderPass::from_raw(raw), None),
                ResourceKind::Pipeline => device.destroy_pipeline(vk::Pipeline::from_raw(raw), None),
                ResourceKind::PipelineLayout => {
                    device.destroy_pipeline_layout(vk::PipelineLayout::from_raw(raw), None)
                }
                ResourceKind::DescriptorSetLayout => {
                    device.destroy_descriptor_set_layout(vk::DescriptorSetLayout::from_raw(raw), None)
                }
                ResourceKind::DescriptorPool => {
                    device.destroy_descriptor_pool(vk::DescriptorPool::from_raw(raw), None)
                }
                ResourceKind::CommandPool => device.destroy_command_pool(vk::CommandPool::from_raw(raw), None),
                ResourceKind::Fence => device.destroy_fence(vk::Fence::from_raw(raw), None),
                ResourceKind::Semaphore => device.destroy_semaphore(vk::Semaphore::from_raw(raw), None),
                ResourceKind::ShaderModule => device.destroy_shader_module(vk::ShaderModule::from_raw(raw), None),
                ResourceKind::Swapchain => self
                    .swapchain_loader
                    .destroy_swapchain(vk::SwapchainKHR::from_raw(raw), None),
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("vkDeviceWaitIdle failed during teardown: {}", e);
        }

        // Allocator first: its memory blocks are freed through the device
        let memory = unsafe { ManuallyDrop::take(&mut self.memory) }.into_inner();
        if !memory.buffers.is_empty() || !memory.images.is_empty() {
            log::warn!(
                "{} buffers and {} images still allocated at device teardown",
                memory.buffers.len(),
                memory.images.len()
            );
        }
        let GpuMemory {
            mut allocator,
            buffers,
            images,
        } = memory;
        for (buffer, allocation) in buffers {
            unsafe { self.device.destroy_buffer(buffer, None) };
            let _ = allocator.free(allocation);
        }
        for (image, allocation) in images {
            unsafe { self.device.destroy_image(image, None) };
            let _ = allocator.free(allocation);
        }
        drop(allocator);

        unsafe { self.device.destroy_device(None) };
        // `instance` drops next as a field
    }
}
