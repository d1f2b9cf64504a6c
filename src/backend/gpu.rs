// GPU seams used by the engine core
//
// The frame scheduler, immediate submit context, uploads and the deletion
// queue only ever talk to the device through these traits. `VulkanDevice`
// implements them on top of ash; tests implement them with a recorder.

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::engine::deletion::Teardown;
use crate::error::Result;

/// A buffer whose memory is owned by the allocator facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
}

/// An image whose memory is owned by the allocator facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedImage {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

/// Parameters for a 2D, single-mip image.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
}

/// One queue submission: at most one wait and one signal semaphore.
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: vk::Fence,
}

impl SubmitDesc {
    pub fn new(command_buffer: vk::CommandBuffer, fence: vk::Fence) -> Self {
        Self {
            command_buffer,
            wait: None,
            signal: None,
            fence,
        }
    }

    pub fn wait_on(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.wait = Some((semaphore, stage));
        self
    }

    pub fn signal(mut self, semaphore: vk::Semaphore) -> Self {
        self.signal = Some(semaphore);
        self
    }
}

/// Begin-info for a render pass instance.
#[derive(Debug, Clone, Copy)]
pub struct RenderPassBegin {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

/// Creates and destroys GPU buffers and images on behalf of the core.
pub trait ResourceAllocator {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<AllocatedBuffer>;

    /// Copy `bytes` into a host-visible buffer at `offset`.
    fn write_buffer(&self, buffer: &AllocatedBuffer, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: vk::Buffer);

    fn create_image(&self, desc: &ImageDesc, name: &str) -> Result<AllocatedImage>;

    fn destroy_image(&self, image: vk::Image);
}

/// Command recording into a primary command buffer.
pub trait CommandEncoder {
    /// Reset `cmd` and begin it for one-time submission.
    fn begin_one_time(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn end(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize);
    fn copy_buffer_to_image(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, extent: vk::Extent3D);
    /// Color image layout transition with stage/access masks derived from the layouts.
    fn transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );

    fn begin_render_pass(&self, cmd: vk::CommandBuffer, begin: &RenderPassBegin);
    fn end_render_pass(&self, cmd: vk::CommandBuffer);
    fn bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, bytes: &[u8]);
    fn draw(&self, cmd: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
}

/// Queue submission, presentation and CPU-side synchronization.
pub trait Submission {
    /// Block until `fence` signals or `timeout_ns` elapses.
    ///
    /// An expired wait is reported as `EngineError::SynchronizationTimeout`.
    fn wait_for_fence(&self, fence: vk::Fence, what: &'static str, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()>;
    fn submit(&self, submit: &SubmitDesc) -> Result<()>;
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<u32>;
    fn present(&self, swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<()>;
    /// Drain every queue; used once at shutdown.
    fn wait_idle(&self) -> Result<()>;
}

/// Destroys one teardown record, dispatching on its resource kind.
pub trait Destroyer {
    fn destroy(&self, teardown: Teardown);
}

/// Everything the render loop needs from a device.
pub trait Gpu: ResourceAllocator + CommandEncoder + Submission + Destroyer {}

impl<T: ResourceAllocator + CommandEncoder + Submission + Destroyer> Gpu for T {}
