// Descriptor protocol
//
// Set 0 (global):  binding 0 camera UBO, binding 1 scene UBO (dynamic offset)
// Set 1 (objects): binding 0 storage buffer of per-object model matrices
// Set 2 (texture): binding 0 combined image sampler, only for textured materials

use ash::vk;

use super::gpu::AllocatedBuffer;
use super::VulkanDevice;
use crate::engine::deletion::DeletionQueue;
use crate::error::{Result, VkResultExt};

/// The three set layouts every pipeline layout is built from.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorLayouts {
    pub global: vk::DescriptorSetLayout,
    pub object: vk::DescriptorSetLayout,
    pub texture: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    /// Set layouts for a material pipeline, in set order.
    pub fn for_material(&self, textured: bool) -> Vec<vk::DescriptorSetLayout> {
        if textured {
            vec![self.global, self.object, self.texture]
        } else {
            vec![self.global, self.object]
        }
    }
}

fn binding(index: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> vk::DescriptorSetLayoutBinding {
    vk::DescriptorSetLayoutBinding::builder()
        .binding(index)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)
        .build()
}

pub fn global_bindings() -> [vk::DescriptorSetLayoutBinding; 2] {
    [
        binding(0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX),
        binding(
            1,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        ),
    ]
}

pub fn object_bindings() -> [vk::DescriptorSetLayoutBinding; 1] {
    [binding(0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX)]
}

pub fn texture_bindings() -> [vk::DescriptorSetLayoutBinding; 1] {
    [binding(
        0,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::ShaderStageFlags::FRAGMENT,
    )]
}

/// Pool sizes for every descriptor type the protocol uses.
pub fn pool_sizes(per_type: u32) -> [vk::DescriptorPoolSize; 4] {
    [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    ]
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: per_type,
    })
}

impl VulkanDevice {
    fn create_set_layout(&self, bindings: &[vk::DescriptorSetLayoutBinding], what: &str) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }.creating(what)
    }

    pub fn create_descriptor_layouts(&self, deletion: &mut DeletionQueue) -> Result<DescriptorLayouts> {
        let global = deletion.track(self.create_set_layout(&global_bindings(), "global set layout")?);
        let object = deletion.track(self.create_set_layout(&object_bindings(), "object set layout")?);
        let texture = deletion.track(self.create_set_layout(&texture_bindings(), "texture set layout")?);
        Ok(DescriptorLayouts { global, object, texture })
    }

    pub fn create_descriptor_pool(
        &self,
        deletion: &mut DeletionQueue,
        max_sets: u32,
        per_type: u32,
    ) -> Result<vk::DescriptorPool> {
        let sizes = pool_sizes(per_type);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }.creating("descriptor pool")?;
        log::debug!("Created descriptor pool ({} sets, {} per type)", max_sets, per_type);
        Ok(deletion.track(pool))
    }

    /// Sets are freed with their pool.
    pub fn allocate_set(&self, pool: vk::DescriptorPool, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.creating("descriptor set")?;
        Ok(sets[0])
    }

    /// Point set 0 at this frame's camera buffer and the shared scene buffer.
    /// The scene binding covers one padded element; the dynamic offset picks the slot.
    pub fn write_global_set(
        &self,
        set: vk::DescriptorSet,
        camera: &AllocatedBuffer,
        scene: &AllocatedBuffer,
        scene_range: vk::DeviceSize,
    ) {
        let camera_info = [vk::DescriptorBufferInfo {
            buffer: camera.buffer,
            offset: 0,
            range: camera.size,
        }];
        let scene_info = [vk::DescriptorBufferInfo {
            buffer: scene.buffer,
            offset: 0,
            range: scene_range,
        }];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&camera_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&scene_info)
                .build(),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    pub fn write_object_set(&self, set: vk::DescriptorSet, objects: &AllocatedBuffer) {
        let object_info = [vk::DescriptorBufferInfo {
            buffer: objects.buffer,
            offset: 0,
            range: objects.size,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&object_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    pub fn write_texture_set(&self, set: vk::DescriptorSet, view: vk::ImageView, sampler: vk::Sampler) {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}
