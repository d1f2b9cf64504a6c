// Draw batching
//
// Turns the object list into a flat command list. Pipeline and descriptor sets
// are rebound only when the material changes from the previous object, the
// vertex buffer only when the mesh changes. Objects are drawn in list order;
// sorting by material is left to whoever builds the list.

use ash::vk;
use glam::{Mat4, Vec4};

use super::scene::{MaterialHandle, MeshHandle, MeshPushConstants, RenderObject, ResourceTable};
use crate::backend::gpu::CommandEncoder;
use crate::error::Result;

/// Per-slot descriptor state shared by every material.
#[derive(Debug, Clone, Copy)]
pub struct FrameBindings {
    pub global_set: vk::DescriptorSet,
    pub object_set: vk::DescriptorSet,
    /// Dynamic offset of this slot's scene uniform inside the shared buffer
    pub scene_offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    BindPipeline(vk::Pipeline),
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    BindVertexBuffer(vk::Buffer),
    PushConstants {
        layout: vk::PipelineLayout,
        constants: MeshPushConstants,
    },
    Draw {
        vertex_count: u32,
        first_instance: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub draws: usize,
    pub material_binds: usize,
    pub mesh_binds: usize,
}

/// Build the command list for `objects`. The i-th object is drawn with
/// `first_instance = i`, which the vertex shader uses to index the object buffer.
pub fn batch_draws(
    objects: &[RenderObject],
    table: &ResourceTable,
    bindings: &FrameBindings,
    view_proj: Mat4,
) -> Result<(Vec<DrawOp>, BatchStats)> {
    let mut ops = Vec::with_capacity(objects.len() * 3);
    let mut stats = BatchStats::default();
    let mut last_material: Option<MaterialHandle> = None;
    let mut last_mesh: Option<MeshHandle> = None;

    for (index, object) in objects.iter().enumerate() {
        let mesh = table.mesh(object.mesh)?;
        let material = table.material(object.material)?;

        if last_material != Some(object.material) {
            ops.push(DrawOp::BindPipeline(material.pipeline));
            ops.push(DrawOp::BindDescriptorSets {
                layout: material.pipeline_layout,
                first_set: 0,
                sets: vec![bindings.global_set],
                dynamic_offsets: vec![bindings.scene_offset],
            });
            ops.push(DrawOp::BindDescriptorSets {
                layout: material.pipeline_layout,
                first_set: 1,
                sets: vec![bindings.object_set],
                dynamic_offsets: Vec::new(),
            });
            if let Some(texture_set) = material.texture_set {
                ops.push(DrawOp::BindDescriptorSets {
                    layout: material.pipeline_layout,
                    first_set: 2,
                    sets: vec![texture_set],
                    dynamic_offsets: Vec::new(),
                });
            }
            last_material = Some(object.material);
            stats.material_binds += 1;
        }

        if last_mesh != Some(object.mesh) {
            ops.push(DrawOp::BindVertexBuffer(mesh.vertex_buffer.buffer));
            last_mesh = Some(object.mesh);
            stats.mesh_binds += 1;
        }

        ops.push(DrawOp::PushConstants {
            layout: material.pipeline_layout,
            constants: MeshPushConstants {
                data: Vec4::ZERO,
                render_matrix: view_proj * object.transform,
            },
        });
        ops.push(DrawOp::Draw {
            vertex_count: mesh.vertex_count,
            first_instance: index as u32,
        });
        stats.draws += 1;
    }

    Ok((ops, stats))
}

/// Replay a command list into `cmd`.
pub fn encode<E: CommandEncoder + ?Sized>(encoder: &E, cmd: vk::CommandBuffer, ops: &[DrawOp]) {
    for op in ops {
        match op {
            DrawOp::BindPipeline(pipeline) => encoder.bind_pipeline(cmd, *pipeline),
            DrawOp::BindDescriptorSets {
                layout,
                first_set,
                sets,
                dynamic_offsets,
            } => encoder.bind_descriptor_sets(cmd, *layout, *first_set, sets, dynamic_offsets),
            DrawOp::BindVertexBuffer(buffer) => encoder.bind_vertex_buffer(cmd, *buffer),
            DrawOp::PushConstants { layout, constants } => {
                encoder.push_constants(cmd, *layout, bytemuck::bytes_of(constants))
            }
            DrawOp::Draw {
                vertex_count,
                first_instance,
            } => encoder.draw(cmd, *vertex_count, 1, 0, *first_instance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::gpu::AllocatedBuffer;
    use crate::backend::testing::{Event, RecordingGpu};
    use crate::engine::scene::{Material, Mesh};
    use ash::vk::Handle;

    struct Fixture {
        table: ResourceTable,
        triangle: MeshHandle,
        cube: MeshHandle,
        flat: MaterialHandle,
        textured: MaterialHandle,
        bindings: FrameBindings,
    }

    fn fixture() -> Fixture {
        let mut table = ResourceTable::new();
        let mesh = |raw, count| Mesh {
            vertex_count: count,
            vertex_buffer: AllocatedBuffer { buffer: vk::Buffer::from_raw(raw), size: 44 * count as u64 },
        };
        let triangle = table.add_mesh("triangle", mesh(10, 3));
        let cube = table.add_mesh("cube", mesh(11, 36));
        let flat = table.add_material(
            "flat",
            Material {
                pipeline: vk::Pipeline::from_raw(20),
                pipeline_layout: vk::PipelineLayout::from_raw(21),
                texture_set: None,
            },
        );
        let textured = table.add_material(
            "textured",
            Material {
                pipeline: vk::Pipeline::from_raw(30),
                pipeline_layout: vk::PipelineLayout::from_raw(31),
                texture_set: Some(vk::DescriptorSet::from_raw(32)),
            },
        );
        Fixture {
            table,
            triangle,
            cube,
            flat,
            textured,
            bindings: FrameBindings {
                global_set: vk::DescriptorSet::from_raw(40),
                object_set: vk::DescriptorSet::from_raw(41),
                scene_offset: 256,
            },
        }
    }

    fn count<F: Fn(&DrawOp) -> bool>(ops: &[DrawOp], f: F) -> usize {
        ops.iter().filter(|op| f(op)).count()
    }

    #[test]
    fn shared_material_and_mesh_bind_once() {
        let f = fixture();
        let objects: Vec<RenderObject> = (0..5)
            .map(|i| RenderObject::new(f.cube, f.flat, Mat4::from_translation(glam::Vec3::X * i as f32)))
            .collect();

        let (ops, stats) = batch_draws(&objects, &f.table, &f.bindings, Mat4::IDENTITY).unwrap();

        assert_eq!(stats, BatchStats { draws: 5, material_binds: 1, mesh_binds: 1 });
        assert_eq!(count(&ops, |op| matches!(op, DrawOp::BindPipeline(_))), 1);
        assert_eq!(count(&ops, |op| matches!(op, DrawOp::BindVertexBuffer(_))), 1);
        let instances: Vec<u32> = ops
            .iter()
            .filter_map(|op| match op {
                DrawOp::Draw { first_instance, .. } => Some(*first_instance),
                _ => None,
            })
            .collect();
        assert_eq!(instances, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn alternating_objects_rebind_on_every_change() {
        let f = fixture();
        let objects = [
            RenderObject::new(f.triangle, f.flat, Mat4::IDENTITY),
            RenderObject::new(f.cube, f.flat, Mat4::IDENTITY),
            RenderObject::new(f.cube, f.textured, Mat4::IDENTITY),
            RenderObject::new(f.cube, f.flat, Mat4::IDENTITY),
        ];

        let (ops, stats) = batch_draws(&objects, &f.table, &f.bindings, Mat4::IDENTITY).unwrap();
        assert_eq!(stats, BatchStats { draws: 4, material_binds: 3, mesh_binds: 2 });

        // the textured material additionally binds set 2
        assert!(ops.contains(&DrawOp::BindDescriptorSets {
            layout: vk::PipelineLayout::from_raw(31),
            first_set: 2,
            sets: vec![vk::DescriptorSet::from_raw(32)],
            dynamic_offsets: Vec::new(),
        }));
        assert_eq!(count(&ops, |op| matches!(op, DrawOp::BindDescriptorSets { first_set: 2, .. })), 1);
    }

    #[test]
    fn global_set_carries_the_scene_offset() {
        let f = fixture();
        let objects = [RenderObject::new(f.triangle, f.flat, Mat4::IDENTITY)];
        let (ops, _) = batch_draws(&objects, &f.table, &f.bindings, Mat4::IDENTITY).unwrap();
        assert_eq!(
            ops[1],
            DrawOp::BindDescriptorSets {
                layout: vk::PipelineLayout::from_raw(21),
                first_set: 0,
                sets: vec![f.bindings.global_set],
                dynamic_offsets: vec![256],
            }
        );
    }

    #[test]
    fn push_constants_carry_view_proj_times_model() {
        let f = fixture();
        let model = Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0));
        let view_proj = Mat4::from_scale(glam::Vec3::splat(2.0));
        let objects = [RenderObject::new(f.triangle, f.flat, model)];

        let (ops, _) = batch_draws(&objects, &f.table, &f.bindings, view_proj).unwrap();
        let constants = ops
            .iter()
            .find_map(|op| match op {
                DrawOp::PushConstants { constants, .. } => Some(*constants),
                _ => None,
            })
            .unwrap();
        assert_eq!(constants.render_matrix, view_proj * model);
    }

    #[test]
    fn unknown_handles_fail_the_whole_batch() {
        let f = fixture();
        let objects = [RenderObject::new(MeshHandle(7), f.flat, Mat4::IDENTITY)];
        assert!(batch_draws(&objects, &f.table, &f.bindings, Mat4::IDENTITY).is_err());
    }

    #[test]
    fn encode_replays_ops_in_order() {
        let f = fixture();
        let gpu = RecordingGpu::new(2);
        let objects = [RenderObject::new(f.triangle, f.flat, Mat4::IDENTITY)];
        let (ops, _) = batch_draws(&objects, &f.table, &f.bindings, Mat4::IDENTITY).unwrap();

        encode(&gpu, gpu.handle(), &ops);
        assert_eq!(
            gpu.events(),
            vec![
                Event::BindPipeline(vk::Pipeline::from_raw(20)),
                Event::BindDescriptorSets {
                    first_set: 0,
                    sets: vec![f.bindings.global_set],
                    dynamic_offsets: vec![256],
                },
                Event::BindDescriptorSets {
                    first_set: 1,
                    sets: vec![f.bindings.object_set],
                    dynamic_offsets: vec![],
                },
                Event::BindVertexBuffer(vk::Buffer::from_raw(10)),
                Event::PushConstants(80),
                Event::Draw { vertex_count: 3, first_instance: 0 },
            ]
        );
    }
}
