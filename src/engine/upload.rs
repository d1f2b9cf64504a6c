// Resource upload - staging buffer to device-local memory
//
// host-visible staging ──copy (immediate submit)──> device-local destination
//
// The staging resource lives only for the duration of the call: the submit
// blocks until the copy has executed, so it is destroyed before returning.
// The destination is registered with the deletion queue.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::deletion::DeletionQueue;
use super::immediate::UploadContext;
use super::scene::{Mesh, Vertex};
use crate::backend::gpu::{AllocatedBuffer, AllocatedImage, Gpu, ImageDesc};
use crate::error::{EngineError, Result};

/// Format used for every uploaded texture.
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Copy `bytes` into a new device-local buffer with `usage`.
pub fn upload_buffer<G: Gpu + ?Sized>(
    gpu: &G,
    upload: &mut UploadContext,
    deletion: &mut DeletionQueue,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<AllocatedBuffer> {
    if bytes.is_empty() {
        return Err(EngineError::InvalidInput(format!("upload of '{}' has no data", name)));
    }
    let size = bytes.len() as vk::DeviceSize;

    let staging = stage(gpu, bytes, name)?;
    let destination = match gpu.create_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
        name,
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            gpu.destroy_buffer(staging.buffer);
            return Err(e);
        }
    };

    let copied = upload.immediate_submit(gpu, |g, cmd| {
        g.copy_buffer(cmd, staging.buffer, destination.buffer, size);
        Ok(())
    });
    if let Err(e) = copied {
        release_after_failure(&e, || {
            gpu.destroy_buffer(staging.buffer);
            gpu.destroy_buffer(destination.buffer);
        });
        return Err(e);
    }

    gpu.destroy_buffer(staging.buffer);
    deletion.track(destination.buffer);
    log::debug!("Uploaded {} ({} bytes)", name, size);
    Ok(destination)
}

/// Upload a vertex array and wrap it as a drawable mesh.
pub fn upload_mesh<G: Gpu + ?Sized>(
    gpu: &G,
    upload: &mut UploadContext,
    deletion: &mut DeletionQueue,
    vertices: &[Vertex],
    name: &str,
) -> Result<Mesh> {
    let vertex_buffer = upload_buffer(
        gpu,
        upload,
        deletion,
        bytemuck::cast_slice(vertices),
        vk::BufferUsageFlags::VERTEX_BUFFER,
        name,
    )?;
    Ok(Mesh {
        vertex_count: vertices.len() as u32,
        vertex_buffer,
    })
}

/// Upload tightly packed RGBA8 pixels into a sampled image left in
/// SHADER_READ_ONLY_OPTIMAL.
pub fn upload_texture<G: Gpu + ?Sized>(
    gpu: &G,
    upload: &mut UploadContext,
    deletion: &mut DeletionQueue,
    pixels: &[u8],
    width: u32,
    height: u32,
    name: &str,
) -> Result<AllocatedImage> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || pixels.len() != expected {
        return Err(EngineError::InvalidInput(format!(
            "texture '{}' is {}x{} but has {} bytes (expected {})",
            name,
            width,
            height,
            pixels.len(),
            expected
        )));
    }

    let staging = stage(gpu, pixels, name)?;
    let desc = ImageDesc {
        format: TEXTURE_FORMAT,
        extent: vk::Extent3D { width, height, depth: 1 },
        usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
    };
    let image = match gpu.create_image(&desc, name) {
        Ok(image) => image,
        Err(e) => {
            gpu.destroy_buffer(staging.buffer);
            return Err(e);
        }
    };

    let copied = upload.immediate_submit(gpu, |g, cmd| {
        g.transition_image(
            cmd,
            image.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        g.copy_buffer_to_image(cmd, staging.buffer, image.image, image.extent);
        g.transition_image(
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        Ok(())
    });
    if let Err(e) = copied {
        release_after_failure(&e, || {
            gpu.destroy_buffer(staging.buffer);
            gpu.destroy_image(image.image);
        });
        return Err(e);
    }

    gpu.destroy_buffer(staging.buffer);
    deletion.track(image.image);
    log::debug!("Uploaded texture {} ({}x{})", name, width, height);
    Ok(image)
}

fn stage<G: Gpu + ?Sized>(gpu: &G, bytes: &[u8], name: &str) -> Result<AllocatedBuffer> {
    let staging = gpu.create_buffer(
        bytes.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryLocation::CpuToGpu,
        &format!("{} staging", name),
    )?;
    if let Err(e) = gpu.write_buffer(&staging, 0, bytes) {
        gpu.destroy_buffer(staging.buffer);
        return Err(e);
    }
    Ok(staging)
}

// After a timeout the copy may still be executing, so the pair is leaked
// rather than freed under the GPU.
fn release_after_failure(error: &EngineError, release: impl FnOnce()) {
    if error.is_timeout() {
        log::warn!("Upload timed out; leaking its staging and destination resources");
    } else {
        release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{Event, RecordingGpu};
    use crate::engine::deletion::Teardown;
    use std::mem::size_of;

    fn triangle() -> [Vertex; 3] {
        [
            Vertex::new([1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [1.0, 1.0]),
            Vertex::new([-1.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.0, 1.0]),
            Vertex::new([0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 1.0], [0.5, 0.0]),
        ]
    }

    fn setup(gpu: &RecordingGpu) -> (UploadContext, DeletionQueue) {
        let upload = UploadContext::new(gpu.handle(), gpu.handle(), gpu.unsignaled_fence(), 1_000_000_000);
        (upload, DeletionQueue::new())
    }

    #[test]
    fn three_vertex_mesh_lands_in_device_local_buffer() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);

        let mesh = upload_mesh(&gpu, &mut upload, &mut deletion, &triangle(), "triangle").unwrap();

        let stride = size_of::<Vertex>() as vk::DeviceSize;
        assert_eq!(mesh.vertex_count, 3);
        assert_eq!(mesh.vertex_buffer.size, 3 * stride);

        let events = gpu.events();
        let created: Vec<(vk::Buffer, bool)> = events
            .iter()
            .filter_map(|e| match e {
                Event::CreateBuffer { buffer, host_visible, .. } => Some((*buffer, *host_visible)),
                _ => None,
            })
            .collect();
        let (staging, staging_host_visible) = created[0];
        let (destination, destination_host_visible) = created[1];
        assert!(staging_host_visible);
        assert!(!destination_host_visible);
        assert_eq!(destination, mesh.vertex_buffer.buffer);

        // staging is destroyed after the fence wait and before returning
        let waited = events.iter().position(|e| matches!(e, Event::WaitFence(_))).unwrap();
        let destroyed = events.iter().position(|e| *e == Event::DestroyBuffer(staging)).unwrap();
        assert!(waited < destroyed);
        assert!(!events.contains(&Event::DestroyBuffer(destination)));

        assert_eq!(gpu.bytes_of(staging), bytemuck::cast_slice::<Vertex, u8>(&triangle()).to_vec());
        assert_eq!(deletion.len(), 1);
    }

    #[test]
    fn destination_is_destroyed_by_the_deletion_queue() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);
        let mesh = upload_mesh(&gpu, &mut upload, &mut deletion, &triangle(), "triangle").unwrap();

        gpu.clear_events();
        deletion.flush(&gpu);
        assert_eq!(gpu.events(), vec![Event::Destroy(Teardown::of(mesh.vertex_buffer.buffer))]);
    }

    #[test]
    fn empty_upload_is_rejected_before_touching_the_gpu() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);
        let err = upload_mesh(&gpu, &mut upload, &mut deletion, &[], "empty").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(gpu.events().is_empty());
    }

    #[test]
    fn texture_upload_transitions_around_the_copy() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);
        let pixels = vec![255u8; 4 * 4 * 4];

        let image = upload_texture(&gpu, &mut upload, &mut deletion, &pixels, 4, 4, "checker").unwrap();
        assert_eq!(image.format, TEXTURE_FORMAT);

        let recorded: Vec<Event> = gpu
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Transition { .. } | Event::CopyBufferToImage { .. }))
            .collect();
        assert_eq!(recorded.len(), 3);
        assert_eq!(
            recorded[0],
            Event::Transition {
                image: image.image,
                old: vk::ImageLayout::UNDEFINED,
                new: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            }
        );
        assert!(matches!(recorded[1], Event::CopyBufferToImage { dst, .. } if dst == image.image));
        assert_eq!(
            recorded[2],
            Event::Transition {
                image: image.image,
                old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }
        );
        assert_eq!(deletion.len(), 1);
    }

    #[test]
    fn texture_byte_count_must_match_extent() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);
        let err = upload_texture(&gpu, &mut upload, &mut deletion, &[0u8; 15], 2, 2, "short").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(gpu.events().is_empty());
    }

    #[test]
    fn timed_out_upload_keeps_its_resources_alive() {
        let gpu = RecordingGpu::new(2);
        let (mut upload, mut deletion) = setup(&gpu);
        gpu.stall(upload.fence);

        let err = upload_mesh(&gpu, &mut upload, &mut deletion, &triangle(), "triangle").unwrap_err();
        assert!(err.is_timeout());
        assert!(!gpu.events().iter().any(|e| matches!(e, Event::DestroyBuffer(_))));
        assert!(deletion.is_empty());
    }
}
