// Frame scheduler - N frames in flight
//
// Each slot owns a command buffer, an image-acquired / render-complete
// semaphore pair, a render fence and its own mapped buffers. Slot f is reused
// every N ticks, and only after its fence proves the GPU finished the last use.
//
// FRAME TIMELINE (slot f = frame_number % N):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait fence(f) ─> acquire ─> record ─> reset fence(f) ─> submit      │
// │  Idle ─────────> Acquiring ─> Recording ─────────────────> Submitted │
// └──────────────────────────────────────────────────────────────────────┘

use ash::vk;

use crate::backend::gpu::{AllocatedBuffer, CommandEncoder, SubmitDesc, Submission};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
}

/// Per-frame resources, created once at init and destroyed at shutdown.
#[derive(Debug)]
pub struct FrameContext {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub image_acquired: vk::Semaphore,
    pub render_complete: vk::Semaphore,
    /// Created signaled so the first visit does not block
    pub render_fence: vk::Fence,
    /// Camera uniform buffer (host visible)
    pub camera_buffer: AllocatedBuffer,
    /// Per-object model matrices (host visible storage buffer)
    pub object_buffer: AllocatedBuffer,
    pub global_set: vk::DescriptorSet,
    pub object_set: vk::DescriptorSet,
    state: SlotState,
}

impl FrameContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        command_pool: vk::CommandPool,
        command_buffer: vk::CommandBuffer,
        image_acquired: vk::Semaphore,
        render_complete: vk::Semaphore,
        render_fence: vk::Fence,
        camera_buffer: AllocatedBuffer,
        object_buffer: AllocatedBuffer,
        global_set: vk::DescriptorSet,
        object_set: vk::DescriptorSet,
    ) -> Self {
        Self {
            command_pool,
            command_buffer,
            image_acquired,
            render_complete,
            render_fence,
            camera_buffer,
            object_buffer,
            global_set,
            object_set,
            state: SlotState::Idle,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

/// Proof that a slot is in the Recording state. Returned by `begin_frame` and
/// consumed by `end_frame`.
#[derive(Debug)]
#[must_use]
pub struct FrameTicket {
    pub slot: usize,
    pub image_index: u32,
    pub command_buffer: vk::CommandBuffer,
}

/// Slot index for a given frame number.
pub fn frame_slot(frame_number: u64, overlap: usize) -> usize {
    debug_assert!(overlap >= 1);
    (frame_number % overlap as u64) as usize
}

pub struct FrameScheduler {
    frames: Vec<FrameContext>,
    frame_number: u64,
    timeout_ns: u64,
}

impl FrameScheduler {
    pub fn new(frames: Vec<FrameContext>, timeout_ns: u64) -> Result<Self> {
        if frames.is_empty() {
            return Err(EngineError::InvalidInput(
                "frame scheduler needs at least one frame context".to_owned(),
            ));
        }
        Ok(Self {
            frames,
            frame_number: 0,
            timeout_ns,
        })
    }

    pub fn overlap(&self) -> usize {
        self.frames.len()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn current_slot(&self) -> usize {
        frame_slot(self.frame_number, self.frames.len())
    }

    pub fn frame(&self, slot: usize) -> &FrameContext {
        &self.frames[slot]
    }

    pub fn frames(&self) -> &[FrameContext] {
        &self.frames
    }

    /// Steps 1-3 of a tick: wait for the slot's fence, acquire a swapchain
    /// image and open the slot's command buffer.
    ///
    /// Once this returns the slot's mapped buffers may be written: the fence
    /// wait proved the GPU is done reading them. On error the slot is back to
    /// Idle with its fence still signaled, so the next tick can retry it.
    pub fn begin_frame<G>(&mut self, gpu: &G, swapchain: vk::SwapchainKHR) -> Result<FrameTicket>
    where
        G: Submission + CommandEncoder + ?Sized,
    {
        let slot = self.current_slot();
        let timeout_ns = self.timeout_ns;
        let frame = &mut self.frames[slot];
        debug_assert!(
            matches!(frame.state, SlotState::Idle | SlotState::Submitted),
            "frame slot {} re-entered while {:?}",
            slot,
            frame.state
        );

        gpu.wait_for_fence(frame.render_fence, "render fence", timeout_ns)?;
        frame.state = SlotState::Acquiring;

        let opened = gpu
            .acquire_next_image(swapchain, frame.image_acquired, timeout_ns)
            .and_then(|image_index| gpu.begin_one_time(frame.command_buffer).map(|()| image_index));
        let image_index = match opened {
            Ok(image_index) => image_index,
            Err(e) => {
                frame.state = SlotState::Idle;
                return Err(e);
            }
        };
        frame.state = SlotState::Recording;

        Ok(FrameTicket {
            slot,
            image_index,
            command_buffer: frame.command_buffer,
        })
    }

    /// Give up on a frame that failed while recording. Nothing was submitted
    /// and the fence was never reset, so the slot simply returns to Idle.
    pub fn abandon_frame(&mut self, ticket: FrameTicket) {
        let frame = &mut self.frames[ticket.slot];
        debug_assert_eq!(frame.state, SlotState::Recording);
        log::warn!("Abandoning frame {} on slot {}", self.frame_number, ticket.slot);
        frame.state = SlotState::Idle;
    }

    /// Steps 4-5: close the command buffer, submit and present, then advance
    /// to the next slot.
    ///
    /// The fence is reset only here, right before the submit that signals it.
    pub fn end_frame<G>(&mut self, gpu: &G, swapchain: vk::SwapchainKHR, ticket: FrameTicket) -> Result<()>
    where
        G: Submission + CommandEncoder + ?Sized,
    {
        let frame = &mut self.frames[ticket.slot];
        debug_assert_eq!(frame.state, SlotState::Recording);

        if let Err(e) = gpu.end(ticket.command_buffer) {
            frame.state = SlotState::Idle;
            return Err(e);
        }

        gpu.reset_fence(frame.render_fence)?;
        let submit = SubmitDesc::new(ticket.command_buffer, frame.render_fence)
            .wait_on(frame.image_acquired, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .signal(frame.render_complete);
        gpu.submit(&submit)?;
        frame.state = SlotState::Submitted;

        gpu.present(swapchain, ticket.image_index, frame.render_complete)?;

        self.frame_number += 1;
        Ok(())
    }
}
