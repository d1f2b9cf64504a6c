// Render loop - one tick of the frame protocol
//
// wait/acquire (scheduler) ─> write camera, scene, objects into the slot's
// mapped buffers ─> render pass + batched draws ─> submit/present (scheduler)

use ash::vk;

use super::draw::{batch_draws, encode, BatchStats, DrawOp, FrameBindings};
use super::frame::{FrameScheduler, FrameTicket};
use super::scene::{GpuCameraData, GpuObjectData, GpuSceneData, RenderObject, ResourceTable};
use crate::backend::gpu::{AllocatedBuffer, Gpu, RenderPassBegin};
use crate::error::{EngineError, Result};

/// Round `size` up to the device's minimum uniform-buffer offset alignment.
pub fn pad_uniform_buffer_size(size: vk::DeviceSize, min_alignment: vk::DeviceSize) -> vk::DeviceSize {
    if min_alignment > 0 {
        (size + min_alignment - 1) & !(min_alignment - 1)
    } else {
        size
    }
}

/// The scene uniform buffer shared by all slots; slot f lives at `f * stride`.
#[derive(Debug, Clone, Copy)]
pub struct SceneBuffer {
    pub buffer: AllocatedBuffer,
    pub stride: vk::DeviceSize,
}

impl SceneBuffer {
    pub fn size_for(frames: usize, min_alignment: vk::DeviceSize) -> (vk::DeviceSize, vk::DeviceSize) {
        let stride = pad_uniform_buffer_size(std::mem::size_of::<GpuSceneData>() as vk::DeviceSize, min_alignment);
        (stride, stride * frames as vk::DeviceSize)
    }

    pub fn offset(&self, slot: usize) -> vk::DeviceSize {
        self.stride * slot as vk::DeviceSize
    }
}

/// Render pass and one framebuffer per swapchain image.
#[derive(Debug, Clone)]
pub struct RenderTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Everything the scene provider hands over for one tick. Read-only.
pub struct FrameInput<'a> {
    pub camera: GpuCameraData,
    pub scene: GpuSceneData,
    pub objects: &'a [RenderObject],
    pub table: &'a ResourceTable,
}

pub struct FrameRenderer {
    targets: RenderTargets,
    scene_buffer: SceneBuffer,
    max_objects: usize,
    truncation_reported: bool,
}

impl FrameRenderer {
    pub fn new(targets: RenderTargets, scene_buffer: SceneBuffer, max_objects: usize) -> Self {
        Self {
            targets,
            scene_buffer,
            max_objects,
            truncation_reported: false,
        }
    }

    pub fn targets(&self) -> &RenderTargets {
        &self.targets
    }

    pub fn scene_buffer(&self) -> &SceneBuffer {
        &self.scene_buffer
    }

    /// Draw one frame on the scheduler's current slot.
    pub fn render<G: Gpu + ?Sized>(
        &mut self,
        gpu: &G,
        scheduler: &mut FrameScheduler,
        swapchain: vk::SwapchainKHR,
        input: &FrameInput,
    ) -> Result<BatchStats> {
        let objects = self.visible_objects(input.objects);
        let slot = scheduler.current_slot();
        let scene_offset = self.scene_buffer.offset(slot);
        let bindings = {
            let frame = scheduler.frame(slot);
            FrameBindings {
                global_set: frame.global_set,
                object_set: frame.object_set,
                scene_offset: scene_offset as u32,
            }
        };

        // Batch before touching the slot so a bad handle never leaves it half-recorded.
        let (ops, stats) = batch_draws(objects, input.table, &bindings, input.camera.view_proj)?;

        let ticket = scheduler.begin_frame(gpu, swapchain)?;
        if let Err(e) = self.record(gpu, scheduler, &ticket, input, objects, &ops) {
            scheduler.abandon_frame(ticket);
            return Err(e);
        }
        scheduler.end_frame(gpu, swapchain, ticket)?;

        log::trace!(
            "Frame {}: {} draws, {} material binds, {} mesh binds",
            scheduler.frame_number(),
            stats.draws,
            stats.material_binds,
            stats.mesh_binds
        );
        Ok(stats)
    }

    fn record<G: Gpu + ?Sized>(
        &self,
        gpu: &G,
        scheduler: &FrameScheduler,
        ticket: &FrameTicket,
        input: &FrameInput,
        objects: &[RenderObject],
        ops: &[DrawOp],
    ) -> Result<()> {
        let frame = scheduler.frame(ticket.slot);
        let scene_offset = self.scene_buffer.offset(ticket.slot);

        // The fence wait in begin_frame proved the GPU is done with these.
        gpu.write_buffer(&frame.camera_buffer, 0, bytemuck::bytes_of(&input.camera))?;
        gpu.write_buffer(&self.scene_buffer.buffer, scene_offset, bytemuck::bytes_of(&input.scene))?;
        if !objects.is_empty() {
            let object_data: Vec<GpuObjectData> = objects
                .iter()
                .map(|object| GpuObjectData { model: object.transform })
                .collect();
            gpu.write_buffer(&frame.object_buffer, 0, bytemuck::cast_slice(&object_data))?;
        }

        let framebuffer = self
            .targets
            .framebuffers
            .get(ticket.image_index as usize)
            .copied()
            .ok_or_else(|| {
                EngineError::InvalidInput(format!("no framebuffer for swapchain image {}", ticket.image_index))
            })?;

        let cmd = ticket.command_buffer;
        gpu.begin_render_pass(
            cmd,
            &RenderPassBegin {
                render_pass: self.targets.render_pass,
                framebuffer,
                extent: self.targets.extent,
                clear_color: self.targets.clear_color,
                clear_depth: 1.0,
            },
        );
        encode(gpu, cmd, ops);
        gpu.end_render_pass(cmd);
        Ok(())
    }

    fn visible_objects<'a>(&mut self, objects: &'a [RenderObject]) -> &'a [RenderObject] {
        if objects.len() <= self.max_objects {
            return objects;
        }
        if !self.truncation_reported {
            log::warn!(
                "Scene has {} objects but the object buffer holds {}; drawing the first {}",
                objects.len(),
                self.max_objects,
                self.max_objects
            );
            self.truncation_reported = true;
        }
        &objects[..self.max_objects]
    }
}
