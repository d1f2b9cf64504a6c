// Recording GPU used by unit tests
//
// Hands out fake handles, tracks fence state the way a driver would
// (signaled / pending / unsignaled) and logs every call in order.

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};

use super::gpu::*;
use crate::engine::deletion::Teardown;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateBuffer { buffer: vk::Buffer, size: vk::DeviceSize, host_visible: bool },
    WriteBuffer { buffer: vk::Buffer, offset: vk::DeviceSize, len: usize },
    DestroyBuffer(vk::Buffer),
    CreateImage(vk::Image),
    DestroyImage(vk::Image),
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    CopyBuffer { src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize },
    CopyBufferToImage { src: vk::Buffer, dst: vk::Image },
    Transition { image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout },
    BeginRenderPass(vk::Framebuffer),
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindDescriptorSets { first_set: u32, sets: Vec<vk::DescriptorSet>, dynamic_offsets: Vec<u32> },
    BindVertexBuffer(vk::Buffer),
    PushConstants(usize),
    Draw { vertex_count: u32, first_instance: u32 },
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    ResetPool(vk::CommandPool),
    Submit { cmd: vk::CommandBuffer, fence: vk::Fence },
    Acquire { semaphore: vk::Semaphore, image_index: u32 },
    Present { image_index: u32, wait: vk::Semaphore },
    WaitIdle,
    Destroy(Teardown),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Pending,
    Unsignaled,
}

pub struct RecordingGpu {
    events: RefCell<Vec<Event>>,
    next_handle: Cell<u64>,
    fences: RefCell<HashMap<vk::Fence, FenceState>>,
    stuck_fences: RefCell<HashSet<vk::Fence>>,
    buffer_bytes: RefCell<HashMap<vk::Buffer, Vec<u8>>>,
    image_count: u32,
    next_image: Cell<u32>,
    acquire_fails: Cell<bool>,
}

impl RecordingGpu {
    pub fn new(image_count: u32) -> Self {
        Self {
            events: RefCell::new(Vec::new()),
            next_handle: Cell::new(1000),
            fences: RefCell::new(HashMap::new()),
            stuck_fences: RefCell::new(HashSet::new()),
            buffer_bytes: RefCell::new(HashMap::new()),
            image_count,
            next_image: Cell::new(0),
            acquire_fails: Cell::new(false),
        }
    }

    pub fn handle<H: Handle>(&self) -> H {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        H::from_raw(raw)
    }

    /// A fence created with the SIGNALED flag, like per-frame render fences.
    pub fn signaled_fence(&self) -> vk::Fence {
        let fence = self.handle();
        self.fences.borrow_mut().insert(fence, FenceState::Signaled);
        fence
    }

    pub fn unsignaled_fence(&self) -> vk::Fence {
        let fence = self.handle();
        self.fences.borrow_mut().insert(fence, FenceState::Unsignaled);
        fence
    }

    /// Make every wait on `fence` time out.
    pub fn stall(&self, fence: vk::Fence) {
        self.stuck_fences.borrow_mut().insert(fence);
    }

    /// Make the next acquire time out without signaling anything.
    pub fn fail_next_acquire(&self) {
        self.acquire_fails.set(true);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    pub fn bytes_of(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.buffer_bytes.borrow().get(&buffer).cloned().unwrap_or_default()
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl ResourceAllocator for RecordingGpu {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        _name: &str,
    ) -> Result<AllocatedBuffer> {
        let buffer: vk::Buffer = self.handle();
        let host_visible = !matches!(location, MemoryLocation::GpuOnly);
        self.buffer_bytes.borrow_mut().insert(buffer, vec![0; size as usize]);
        self.record(Event::CreateBuffer { buffer, size, host_visible });
        Ok(AllocatedBuffer { buffer, size })
    }

    fn write_buffer(&self, buffer: &AllocatedBuffer, offset: vk::DeviceSize, bytes: &[u8]) -> Result<()> {
        let end = offset as usize + bytes.len();
        if end as vk::DeviceSize > buffer.size {
            return Err(EngineError::InvalidInput(format!(
                "write of {} bytes at {} overflows buffer of {}",
                bytes.len(),
                offset,
                buffer.size
            )));
        }
        if let Some(storage) = self.buffer_bytes.borrow_mut().get_mut(&buffer.buffer) {
            storage[offset as usize..end].copy_from_slice(bytes);
        }
        self.record(Event::WriteBuffer { buffer: buffer.buffer, offset, len: bytes.len() });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.record(Event::DestroyBuffer(buffer));
    }

    fn create_image(&self, desc: &ImageDesc, _name: &str) -> Result<AllocatedImage> {
        let image: vk::Image = self.handle();
        self.record(Event::CreateImage(image));
        Ok(AllocatedImage {
            image,
            format: desc.format,
            extent: desc.extent,
        })
    }

    fn destroy_image(&self, image: vk::Image) {
        self.record(Event::DestroyImage(image));
    }
}

impl CommandEncoder for RecordingGpu {
    fn begin_one_time(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Event::Begin(cmd));
        Ok(())
    }

    fn end(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(Event::End(cmd));
        Ok(())
    }

    fn copy_buffer(&self, _cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        self.record(Event::CopyBuffer { src, dst, size });
    }

    fn copy_buffer_to_image(&self, _cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Image, _extent: vk::Extent3D) {
        self.record(Event::CopyBufferToImage { src, dst });
    }

    fn transition_image(
        &self,
        _cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record(Event::Transition { image, old: old_layout, new: new_layout });
    }

    fn begin_render_pass(&self, _cmd: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.record(Event::BeginRenderPass(begin.framebuffer));
    }

    fn end_render_pass(&self, _cmd: vk::CommandBuffer) {
        self.record(Event::EndRenderPass);
    }

    fn bind_pipeline(&self, _cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Event::BindPipeline(pipeline));
    }

    fn bind_descriptor_sets(
        &self,
        _cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.record(Event::BindDescriptorSets {
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn bind_vertex_buffer(&self, _cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.record(Event::BindVertexBuffer(buffer));
    }

    fn push_constants(&self, _cmd: vk::CommandBuffer, _layout: vk::PipelineLayout, bytes: &[u8]) {
        self.record(Event::PushConstants(bytes.len()));
    }

    fn draw(&self, _cmd: vk::CommandBuffer, vertex_count: u32, _instance_count: u32, _first_vertex: u32, first_instance: u32) {
        self.record(Event::Draw { vertex_count, first_instance });
    }
}

impl Submission for RecordingGpu {
    fn wait_for_fence(&self, fence: vk::Fence, what: &'static str, timeout_ns: u64) -> Result<()> {
        if self.stuck_fences.borrow().contains(&fence) {
            return Err(EngineError::SynchronizationTimeout { what, timeout_ns });
        }
        let mut fences = self.fences.borrow_mut();
        let state = fences.entry(fence).or_insert(FenceState::Unsignaled);
        match *state {
            // The simulated GPU finishes pending work as soon as someone waits.
            FenceState::Pending | FenceState::Signaled => *state = FenceState::Signaled,
            FenceState::Unsignaled => {
                return Err(EngineError::SynchronizationTimeout { what, timeout_ns });
            }
        }
        drop(fences);
        self.record(Event::WaitFence(fence));
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.fences.borrow_mut().insert(fence, FenceState::Unsignaled);
        self.record(Event::ResetFence(fence));
        Ok(())
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<()> {
        self.record(Event::ResetPool(pool));
        Ok(())
    }

    fn submit(&self, submit: &SubmitDesc) -> Result<()> {
        let mut fences = self.fences.borrow_mut();
        let state = fences.entry(submit.fence).or_insert(FenceState::Unsignaled);
        assert_eq!(
            *state,
            FenceState::Unsignaled,
            "submitted with a fence that was not reset"
        );
        *state = FenceState::Pending;
        drop(fences);
        self.record(Event::Submit {
            cmd: submit.command_buffer,
            fence: submit.fence,
        });
        Ok(())
    }

    fn acquire_next_image(
        &self,
        _swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<u32> {
        if self.acquire_fails.replace(false) {
            return Err(EngineError::SynchronizationTimeout { what: "swapchain image", timeout_ns });
        }
        let image_index = self.next_image.get();
        self.next_image.set((image_index + 1) % self.image_count.max(1));
        self.record(Event::Acquire { semaphore, image_index });
        Ok(image_index)
    }

    fn present(&self, _swapchain: vk::SwapchainKHR, image_index: u32, wait: vk::Semaphore) -> Result<()> {
        self.record(Event::Present { image_index, wait });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        for state in self.fences.borrow_mut().values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
        self.record(Event::WaitIdle);
        Ok(())
    }
}

impl Destroyer for RecordingGpu {
    fn destroy(&self, teardown: Teardown) {
        self.record(Event::Destroy(teardown));
    }
}
