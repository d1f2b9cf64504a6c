// Allocator facade - buffers and images backed by gpu-allocator
//
// Allocations never leave the device: callers get plain handles and the
// facade looks the allocation up again on write or destroy.

use ash::vk::{self, Handle};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::gpu::{AllocatedBuffer, AllocatedImage, ImageDesc, ResourceAllocator};
use super::VulkanDevice;
use crate::engine::deletion::DeletionQueue;
use crate::error::{EngineError, Result, VkResultExt};

/// Depth attachment format used by the render pass.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

impl VulkanDevice {
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.memory
            .lock()
            .allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|source| EngineError::Allocation {
                what: name.to_owned(),
                source,
            })
    }

    fn release(&self, allocation: Allocation) {
        if let Err(e) = self.memory.lock().allocator.free(allocation) {
            log::error!("Failed to free allocation: {}", e);
        }
    }

    /// 2D color or depth view over the whole image.
    pub fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.create_image_view(&create_info, None) }.creating("image view")
    }

    /// Texture sampler. Anisotropy is only used when the feature was enabled.
    pub fn create_sampler(&self, filter: vk::Filter, anisotropy: bool) -> Result<vk::Sampler> {
        let max_anisotropy = self.physical.max_sampler_anisotropy();
        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy { max_anisotropy } else { 1.0 })
            .max_lod(0.0);

        unsafe { self.device.create_sampler(&create_info, None) }.creating("sampler")
    }

    /// Depth image + view matching the swapchain extent, both tracked.
    pub fn create_depth_target(
        &self,
        deletion: &mut DeletionQueue,
        extent: vk::Extent2D,
    ) -> Result<(AllocatedImage, vk::ImageView)> {
        let image = self.create_image(
            &ImageDesc {
                format: DEPTH_FORMAT,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            },
            "depth image",
        )?;
        deletion.track(image.image);

        let view = deletion.track(self.create_image_view(image.image, DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH)?);
        Ok((image, view))
    }
}

impl ResourceAllocator for VulkanDevice {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }.creating(name)?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.release(allocation);
            return Err(EngineError::ResourceCreation {
                what: format!("{} (bind memory)", name),
                source: e,
            });
        }

        self.memory.lock().buffers.insert(buffer, allocation);
        log::debug!("Created buffer {} ({} bytes, {:?})", name, size, location);
        Ok(AllocatedBuffer { buffer, size })
    }

    fn write_buffer(&self, buffer: &AllocatedBuffer, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let mut memory = self.memory.lock();
        let allocation = memory
            .buffers
            .get_mut(&buffer.buffer)
            .ok_or(EngineError::UnknownResource {
                kind: "buffer",
                index: buffer.buffer.as_raw() as usize,
            })?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| EngineError::InvalidInput("buffer is not host visible".into()))?;

        let start = offset as usize;
        let end = start + bytes.len();
        if end as vk::DeviceSize > buffer.size || end > mapped.len() {
            return Err(EngineError::InvalidInput(format!(
                "write of {} bytes at {} overflows buffer of {}",
                bytes.len(),
                offset,
                buffer.size
            )));
        }
        mapped[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.memory.lock().buffers.remove(&buffer);
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = allocation {
            self.release(allocation);
        }
    }

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<AllocatedImage> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(desc.extent)
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device.create_image(&image_info, None) }.creating(name)?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.release(allocation);
            return Err(EngineError::ResourceCreation {
                what: format!("{} (bind memory)", name),
                source: e,
            });
        }

        self.memory.lock().images.insert(image, allocation);
        log::debug!(
            "Created image {} ({}x{}, {:?})",
            name,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );
        Ok(AllocatedImage {
            image,
            format: desc.format,
            extent: desc.extent,
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        let allocation = self.memory.lock().images.remove(&image);
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = allocation {
            self.release(allocation);
        }
    }
}
