// Scene types - vertices, meshes, materials and the resource table
//
// Render objects refer to meshes and materials through indices into a
// `ResourceTable` owned by the engine. Names only matter while building the
// scene; the per-frame path works purely with handles.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::collections::HashMap;
use std::mem::{offset_of, size_of};

use crate::backend::gpu::AllocatedBuffer;
use crate::error::{EngineError, Result};

// =============================================================================
// VERTEX LAYOUT
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const fn new(position: [f32; 3], normal: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            color,
            uv,
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    /// position (0), normal (1), color (2), uv (3)
    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        let attribute = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
                .build()
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
        ]
    }
}

// =============================================================================
// GPU-SIDE DATA
// =============================================================================

/// Set 0, binding 0. One per frame slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuCameraData {
    pub view: Mat4,
    pub proj: Mat4,
    pub view_proj: Mat4,
}

/// Set 0, binding 1. All slots share one buffer, addressed by dynamic offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuSceneData {
    pub fog_color: Vec4,
    /// x = start, y = end
    pub fog_distances: Vec4,
    pub ambient_color: Vec4,
    /// w = intensity
    pub sunlight_direction: Vec4,
    pub sunlight_color: Vec4,
}

impl Default for GpuSceneData {
    fn default() -> Self {
        Self {
            fog_color: Vec4::ZERO,
            fog_distances: Vec4::ZERO,
            ambient_color: Vec4::new(0.1, 0.1, 0.1, 1.0),
            sunlight_direction: Vec4::new(0.3, -1.0, 0.2, 1.0),
            sunlight_color: Vec4::ONE,
        }
    }
}

/// Set 1, binding 0: one entry per render object, indexed by `gl_BaseInstance`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GpuObjectData {
    pub model: Mat4,
}

/// Per-draw push constants (vertex stage, 80 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub data: Vec4,
    pub render_matrix: Mat4,
}

// =============================================================================
// MESHES, MATERIALS, OBJECTS
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Mesh {
    pub vertex_count: u32,
    pub vertex_buffer: AllocatedBuffer,
}

/// Pipeline state shared by every object that uses it.
#[derive(Debug, Clone, Copy)]
pub struct Material {
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    /// Bound at set 2 when present
    pub texture_set: Option<vk::DescriptorSet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub usize);

#[derive(Debug, Clone, Copy)]
pub struct RenderObject {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub transform: Mat4,
}

impl RenderObject {
    pub fn new(mesh: MeshHandle, material: MaterialHandle, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
        }
    }
}

/// Meshes and materials, owned by the render loop.
#[derive(Debug, Default)]
pub struct ResourceTable {
    meshes: Vec<Mesh>,
    materials: Vec<Material>,
    mesh_names: HashMap<String, MeshHandle>,
    material_names: HashMap<String, MaterialHandle>,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, name: impl Into<String>, mesh: Mesh) -> MeshHandle {
        let handle = MeshHandle(self.meshes.len());
        self.meshes.push(mesh);
        self.mesh_names.insert(name.into(), handle);
        handle
    }

    pub fn add_material(&mut self, name: impl Into<String>, material: Material) -> MaterialHandle {
        let handle = MaterialHandle(self.materials.len());
        self.materials.push(material);
        self.material_names.insert(name.into(), handle);
        handle
    }

    pub fn mesh(&self, handle: MeshHandle) -> Result<&Mesh> {
        self.meshes.get(handle.0).ok_or(EngineError::UnknownResource {
            kind: "mesh",
            index: handle.0,
        })
    }

    pub fn material(&self, handle: MaterialHandle) -> Result<&Material> {
        self.materials.get(handle.0).ok_or(EngineError::UnknownResource {
            kind: "material",
            index: handle.0,
        })
    }

    pub fn mesh_by_name(&self, name: &str) -> Option<MeshHandle> {
        self.mesh_names.get(name).copied()
    }

    pub fn material_by_name(&self, name: &str) -> Option<MaterialHandle> {
        self.material_names.get(name).copied()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn material_count(&self) -> usize {
        self.materials.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn gpu_structs_have_shader_layout_sizes() {
        assert_eq!(size_of::<Vertex>(), 44);
        assert_eq!(size_of::<GpuCameraData>(), 192);
        assert_eq!(size_of::<GpuSceneData>(), 80);
        assert_eq!(size_of::<GpuObjectData>(), 64);
        assert_eq!(size_of::<MeshPushConstants>(), 80);
    }

    #[test]
    fn vertex_attributes_follow_field_offsets() {
        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36]);
        assert_eq!(Vertex::binding_description().stride, 44);
    }

    #[test]
    fn handles_resolve_and_unknown_handles_fail() {
        let mut table = ResourceTable::new();
        let mesh = table.add_mesh(
            "triangle",
            Mesh {
                vertex_count: 3,
                vertex_buffer: AllocatedBuffer { buffer: vk::Buffer::from_raw(1), size: 132 },
            },
        );
        let material = table.add_material(
            "flat",
            Material {
                pipeline: vk::Pipeline::from_raw(2),
                pipeline_layout: vk::PipelineLayout::from_raw(3),
                texture_set: None,
            },
        );

        assert_eq!(table.mesh_by_name("triangle"), Some(mesh));
        assert_eq!(table.material_by_name("flat"), Some(material));
        assert_eq!(table.mesh(mesh).unwrap().vertex_count, 3);
        assert!(table.mesh_by_name("cube").is_none());

        let err = table.material(MaterialHandle(9)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownResource { kind: "material", index: 9 }));
    }
}
