// Engine - init sequence, scene API and the shutdown protocol
//
// INIT ORDER:
// ┌──────────────────────────────────────────────────────────────────────┐
// │  instance + surface ─> GPU selection ─> device + allocator           │
// │    └── swapchain ─> depth ─> render pass ─> framebuffers             │
// │          └── descriptor layouts + pool ─> scene buffer               │
// │                └── frame slots ─> upload context ─> sampler          │
// └──────────────────────────────────────────────────────────────────────┘
//
// Every object created after the device is registered with the deletion
// queue right after creation. Shutdown waits for the device to go idle,
// flushes the queue, then drops the device (allocator, device, surface,
// messenger, instance).

pub mod camera;
pub mod deletion;
pub mod draw;
pub mod frame;
pub mod immediate;
pub mod render;
pub mod scene;
pub mod upload;

use ash::vk;
use glam::Vec3;
use gpu_allocator::MemoryLocation;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::mem::size_of;

use crate::backend::descriptors::DescriptorLayouts;
use crate::backend::gpu::{AllocatedImage, ResourceAllocator};
use crate::backend::pipeline::PipelineBuilder;
use crate::backend::selector::{select_physical_device, SelectionRequirements};
use crate::backend::shader::ShaderLibrary;
use crate::backend::surface::required_extensions;
use crate::backend::swapchain::{SwapchainPlan, SwapchainSupport};
use crate::backend::{DeviceBuilder, InstanceBuilder, Swapchain, VulkanDevice};
use crate::config::Config;
use crate::error::{EngineError, Result};

use camera::Camera;
use deletion::{release_all, DeletionQueue};
use draw::BatchStats;
use frame::{FrameContext, FrameScheduler};
use immediate::UploadContext;
use render::{FrameInput, FrameRenderer, RenderTargets, SceneBuffer};
use scene::{GpuCameraData, GpuObjectData, GpuSceneData, MaterialHandle, MeshHandle, RenderObject, ResourceTable, Vertex};

/// A sampled texture: the image plus the view materials bind.
#[derive(Debug, Clone, Copy)]
pub struct Texture {
    pub image: AllocatedImage,
    pub view: vk::ImageView,
}

/// Everything built on top of the device. Handles only; the deletion queue
/// owns their destruction.
struct RenderState {
    swapchain: Swapchain,
    layouts: DescriptorLayouts,
    descriptor_pool: vk::DescriptorPool,
    pipeline_builder: PipelineBuilder,
    sampler: vk::Sampler,
    scheduler: FrameScheduler,
    renderer: FrameRenderer,
    upload: UploadContext,
}

pub struct Engine {
    state: RenderState,
    shaders: ShaderLibrary,
    table: ResourceTable,
    objects: Vec<RenderObject>,
    camera: Camera,
    scene: GpuSceneData,
    deletion: DeletionQueue,
    // None once shut down
    device: Option<VulkanDevice>,
}

impl Engine {
    /// Bring up the renderer for a window.
    ///
    /// # Safety
    /// The window behind the handles must outlive the engine.
    pub unsafe fn new(config: &Config, display: RawDisplayHandle, window: RawWindowHandle) -> Result<Self> {
        check_limits(config)?;
        log::info!("Initializing Vulkan...");

        let mut instance = InstanceBuilder::new(&config.window.title)
            .extensions(required_extensions(display)?)
            .validation(cfg!(debug_assertions) && config.debug.validation_layers)
            .debug_severity(InstanceBuilder::severity_for(config.log_level()))
            .build()?;
        log::info!("Validation layers: {}", if instance.validation_enabled() { "on" } else { "off" });
        instance.attach_surface(display, window)?;

        let mut requirements = SelectionRequirements::for_presentation(config.surface_format(), config.present_mode());
        requirements.preferred = config.preferred_device_type();
        if config.graphics.anisotropy {
            requirements.features.sampler_anisotropy = vk::TRUE;
        }

        let physical = {
            let (surface_loader, surface) = instance
                .surface()
                .ok_or_else(|| EngineError::InvalidInput("no surface attached to the instance".into()))?;
            select_physical_device(&instance.instance, surface_loader, surface, &requirements)?
        };

        let device = DeviceBuilder::new(physical)
            .extensions(requirements.extensions.iter().copied())
            .features(requirements.features)
            .draw_parameters(requirements.draw_parameters)
            .build(instance)?;

        let mut deletion = DeletionQueue::new();
        let state = match RenderState::create(&device, &mut deletion, config) {
            Ok(state) => state,
            Err(e) => {
                log::error!("Renderer setup failed, releasing {} resources", deletion.len());
                release_all(&device, &mut deletion);
                return Err(e);
            }
        };

        let extent = state.swapchain.extent;
        let shaders = ShaderLibrary::new(&config.shaders.directory);
        log::info!("Vulkan initialized successfully! Shaders load from {}", shaders.directory().display());

        Ok(Self {
            state,
            shaders,
            table: ResourceTable::new(),
            objects: Vec::new(),
            camera: Camera::new(Vec3::new(0.0, 6.0, 10.0), Vec3::ZERO, extent.width, extent.height),
            scene: GpuSceneData::default(),
            deletion,
            device: Some(device),
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.state.swapchain.extent
    }

    pub fn frame_number(&self) -> u64 {
        self.state.scheduler.frame_number()
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.table
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn scene_mut(&mut self) -> &mut GpuSceneData {
        &mut self.scene
    }

    /// Upload vertices into a device-local buffer and register the mesh.
    pub fn upload_mesh(&mut self, name: &str, vertices: &[Vertex]) -> Result<MeshHandle> {
        let device = live(&self.device)?;
        let mesh = upload::upload_mesh(device, &mut self.state.upload, &mut self.deletion, vertices, name)?;
        log::debug!("Uploaded mesh {} ({} vertices)", name, mesh.vertex_count);
        Ok(self.table.add_mesh(name, mesh))
    }

    /// Upload RGBA8 pixels and create a view for sampling.
    pub fn upload_texture(&mut self, name: &str, pixels: &[u8], width: u32, height: u32) -> Result<Texture> {
        let device = live(&self.device)?;
        let image = upload::upload_texture(device, &mut self.state.upload, &mut self.deletion, pixels, width, height, name)?;
        let view = device.create_image_view(image.image, image.format, vk::ImageAspectFlags::COLOR)?;
        Ok(Texture {
            image,
            view: self.deletion.track(view),
        })
    }

    /// Untextured material from a vertex/fragment shader pair.
    pub fn create_material(&mut self, name: &str, vertex_shader: &str, fragment_shader: &str) -> Result<MaterialHandle> {
        let device = live(&self.device)?;
        let material = device.create_material(
            &mut self.deletion,
            &self.shaders,
            &self.state.pipeline_builder,
            vertex_shader,
            fragment_shader,
            &self.state.layouts.for_material(false),
        )?;
        Ok(self.table.add_material(name, material))
    }

    /// Material sampling `texture` through set 2.
    pub fn create_textured_material(
        &mut self,
        name: &str,
        vertex_shader: &str,
        fragment_shader: &str,
        texture: &Texture,
    ) -> Result<MaterialHandle> {
        let device = live(&self.device)?;
        let mut material = device.create_material(
            &mut self.deletion,
            &self.shaders,
            &self.state.pipeline_builder,
            vertex_shader,
            fragment_shader,
            &self.state.layouts.for_material(true),
        )?;
        let set = device.allocate_set(self.state.descriptor_pool, self.state.layouts.texture)?;
        device.write_texture_set(set, texture.view, self.state.sampler);
        material.texture_set = Some(set);
        Ok(self.table.add_material(name, material))
    }

    /// Add an object; its handles must already be registered.
    pub fn add_object(&mut self, object: RenderObject) -> Result<()> {
        self.table.mesh(object.mesh)?;
        self.table.material(object.material)?;
        self.objects.push(object);
        Ok(())
    }

    pub fn objects_mut(&mut self) -> &mut [RenderObject] {
        &mut self.objects
    }

    /// Draw the current scene on the next frame slot.
    pub fn draw(&mut self) -> Result<BatchStats> {
        let device = live(&self.device)?;
        let input = FrameInput {
            camera: self.camera.gpu_data(),
            scene: self.scene,
            objects: &self.objects,
            table: &self.table,
        };
        let swapchain = self.state.swapchain.swapchain;
        self.state
            .renderer
            .render(device, &mut self.state.scheduler, swapchain, &input)
    }

    /// Idle the device, release everything in reverse creation order and
    /// drop the device. A second call does nothing.
    pub fn shutdown(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        log::info!("Shutting down after {} frames", self.state.scheduler.frame_number());
        release_all(&device, &mut self.deletion);
        drop(device);
        log::info!("Cleanup complete");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Limits that size GPU objects. `Config::from_toml` checks these too, but a
/// config built in code bypasses it.
fn check_limits(config: &Config) -> Result<()> {
    if config.graphics.frames_in_flight == 0 {
        return Err(EngineError::InvalidInput("graphics.frames_in_flight must be at least 1".into()));
    }
    if config.limits.max_objects == 0 {
        return Err(EngineError::InvalidInput("limits.max_objects must be at least 1".into()));
    }
    Ok(())
}

fn live(device: &Option<VulkanDevice>) -> Result<&VulkanDevice> {
    device
        .as_ref()
        .ok_or_else(|| EngineError::InvalidInput("engine has been shut down".into()))
}

impl RenderState {
    fn create(device: &VulkanDevice, deletion: &mut DeletionQueue, config: &Config) -> Result<Self> {
        let (surface_loader, surface) = device.surface()?;
        let support = SwapchainSupport::query(surface_loader, device.physical.physical_device, surface)?;
        let plan = SwapchainPlan::negotiate(
            &support,
            config.surface_format(),
            config.present_mode(),
            config.extent(),
            device.physical.queue_families,
        )?;
        let swapchain = Swapchain::new(device, surface, &plan, deletion)?;

        let (_depth_image, depth_view) = device.create_depth_target(deletion, swapchain.extent)?;
        let render_pass = device.create_render_pass(deletion, swapchain.format)?;
        let framebuffers =
            device.create_framebuffers(deletion, render_pass, &swapchain.image_views, depth_view, swapchain.extent)?;

        let layouts = device.create_descriptor_layouts(deletion)?;
        let descriptor_pool = device.create_descriptor_pool(
            deletion,
            config.limits.max_descriptor_sets,
            config.limits.descriptors_per_type,
        )?;

        let overlap = config.graphics.frames_in_flight;
        let (stride, total) = SceneBuffer::size_for(overlap, device.physical.min_uniform_buffer_offset_alignment());
        let scene_buffer = SceneBuffer {
            buffer: device.create_buffer(total, vk::BufferUsageFlags::UNIFORM_BUFFER, MemoryLocation::CpuToGpu, "scene buffer")?,
            stride,
        };
        deletion.track(scene_buffer.buffer.buffer);

        let frames = (0..overlap)
            .map(|slot| create_frame(device, deletion, &layouts, descriptor_pool, &scene_buffer, config, slot))
            .collect::<Result<Vec<_>>>()?;
        log::info!("Created {} frame slots ({} objects each)", frames.len(), config.limits.max_objects);

        let upload = {
            let pool = deletion.track(
                device.create_command_pool(device.graphics_family(), vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?,
            );
            let cmd = device.allocate_command_buffer(pool)?;
            let fence = deletion.track(device.create_fence(false)?);
            UploadContext::new(pool, cmd, fence, config.fence_timeout_ns())
        };

        let filter = if config.graphics.anisotropy {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };
        let sampler = deletion.track(device.create_sampler(filter, config.graphics.anisotropy)?);

        let renderer = FrameRenderer::new(
            RenderTargets {
                render_pass,
                framebuffers,
                extent: swapchain.extent,
                clear_color: config.graphics.clear_color,
            },
            scene_buffer,
            config.limits.max_objects,
        );

        Ok(Self {
            pipeline_builder: PipelineBuilder::new(render_pass, swapchain.extent),
            swapchain,
            layouts,
            descriptor_pool,
            sampler,
            scheduler: FrameScheduler::new(frames, config.fence_timeout_ns())?,
            renderer,
            upload,
        })
    }
}

fn create_frame(
    device: &VulkanDevice,
    deletion: &mut DeletionQueue,
    layouts: &DescriptorLayouts,
    pool: vk::DescriptorPool,
    scene_buffer: &SceneBuffer,
    config: &Config,
    slot: usize,
) -> Result<FrameContext> {
    let command_pool = deletion.track(
        device.create_command_pool(device.graphics_family(), vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?,
    );
    let command_buffer = device.allocate_command_buffer(command_pool)?;
    let image_acquired = deletion.track(device.create_semaphore()?);
    let render_complete = deletion.track(device.create_semaphore()?);
    let render_fence = deletion.track(device.create_fence(true)?);

    let camera_buffer = device.create_buffer(
        size_of::<GpuCameraData>() as vk::DeviceSize,
        vk::BufferUsageFlags::UNIFORM_BUFFER,
        MemoryLocation::CpuToGpu,
        &format!("camera buffer {}", slot),
    )?;
    deletion.track(camera_buffer.buffer);
    let object_buffer = device.create_buffer(
        (size_of::<GpuObjectData>() * config.limits.max_objects) as vk::DeviceSize,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        MemoryLocation::CpuToGpu,
        &format!("object buffer {}", slot),
    )?;
    deletion.track(object_buffer.buffer);

    let global_set = device.allocate_set(pool, layouts.global)?;
    device.write_global_set(
        global_set,
        &camera_buffer,
        &scene_buffer.buffer,
        size_of::<GpuSceneData>() as vk::DeviceSize,
    );
    let object_set = device.allocate_set(pool, layouts.object)?;
    device.write_object_set(object_set, &object_buffer);

    Ok(FrameContext::new(
        command_pool,
        command_buffer,
        image_acquired,
        render_complete,
        render_fence,
        camera_buffer,
        object_buffer,
        global_set,
        object_set,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_limits_are_rejected_before_touching_vulkan() {
        assert!(check_limits(&Config::default()).is_ok());

        let mut config = Config::default();
        config.graphics.frames_in_flight = 0;
        assert!(matches!(check_limits(&config), Err(EngineError::InvalidInput(_))));

        let mut config = Config::default();
        config.limits.max_objects = 0;
        assert!(matches!(check_limits(&config), Err(EngineError::InvalidInput(_))));
    }
}
