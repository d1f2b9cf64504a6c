// Synchronization primitives and command objects
//
// Fences for GPU-CPU sync, semaphores for GPU-GPU ordering, and the command
// pools the frame slots and the upload context record into. Everything made
// here is handed straight to the deletion queue by the caller.

use ash::vk;

use super::VulkanDevice;
use crate::error::{Result, VkResultExt};

impl VulkanDevice {
    /// Frame fences start signaled so the first wait on a fresh slot returns.
    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.create_fence(&fence_info, None) }.creating("fence")
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&semaphore_info, None) }.creating("semaphore")
    }

    pub fn create_command_pool(&self, family: u32, flags: vk::CommandPoolCreateFlags) -> Result<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(family)
            .flags(flags);
        unsafe { self.device.create_command_pool(&pool_info, None) }.creating("command pool")
    }

    /// One primary command buffer from `pool`.
    pub fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }.creating("command buffer")?;
        Ok(buffers[0])
    }
}
