// Demo scene - generated geometry and a checkerboard texture
//
// A grid of cubes on the ground, a row of triangles behind it and a
// textured quad floating above the middle.

use glam::{Mat4, Quat, Vec3, Vec4};
use vk_frames::engine::scene::{RenderObject, Vertex};
use vk_frames::{Engine, Result};

const GRID: i32 = 8;

pub fn triangle() -> Vec<Vertex> {
    let normal = [0.0, 0.0, 1.0];
    vec![
        Vertex::new([1.0, 1.0, 0.0], normal, [1.0, 0.0, 0.0], [1.0, 1.0]),
        Vertex::new([-1.0, 1.0, 0.0], normal, [0.0, 1.0, 0.0], [0.0, 1.0]),
        Vertex::new([0.0, -1.0, 0.0], normal, [0.0, 0.0, 1.0], [0.5, 0.0]),
    ]
}

/// Unit cube, two triangles per face, colored by face normal.
pub fn cube() -> Vec<Vertex> {
    // (normal, u axis, v axis) per face
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
    ];
    let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

    let mut vertices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let n = Vec3::from(normal);
        let (u, v) = (Vec3::from(u), Vec3::from(v));
        let color = (n.abs() * 0.8 + Vec3::splat(0.2)).to_array();
        for (cu, cv) in corners {
            let position = (n + u * cu + v * cv) * 0.5;
            vertices.push(Vertex::new(
                position.to_array(),
                normal,
                color,
                [(cu + 1.0) * 0.5, (cv + 1.0) * 0.5],
            ));
        }
    }
    vertices
}

/// Quad in the XY plane with UVs over the full texture.
pub fn quad() -> Vec<Vertex> {
    let normal = [0.0, 0.0, 1.0];
    let white = [1.0, 1.0, 1.0];
    let corner = |x: f32, y: f32| Vertex::new([x, y, 0.0], normal, white, [(x + 1.0) * 0.5, (1.0 - y) * 0.5]);
    vec![
        corner(-1.0, -1.0),
        corner(1.0, -1.0),
        corner(1.0, 1.0),
        corner(-1.0, -1.0),
        corner(1.0, 1.0),
        corner(-1.0, 1.0),
    ]
}

/// RGBA8 checkerboard, `size` x `size` pixels with `cell`-pixel squares.
pub fn checkerboard(size: u32, cell: u32) -> Vec<u8> {
    let cell = cell.max(1);
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / cell) + (y / cell)) % 2 == 0;
            let value = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    pixels
}

pub fn load(engine: &mut Engine) -> Result<()> {
    let triangle = engine.upload_mesh("triangle", &triangle())?;
    let cube = engine.upload_mesh("cube", &cube())?;
    let quad = engine.upload_mesh("quad", &quad())?;

    let default_material = engine.create_material("defaultmesh", "mesh.vert", "mesh.frag")?;
    let texture = engine.upload_texture("checkerboard", &checkerboard(64, 8), 64, 64)?;
    let textured_material = engine.create_textured_material("texturedmesh", "mesh.vert", "textured.frag", &texture)?;

    for x in -GRID..=GRID {
        for z in -GRID..=GRID {
            let transform = Mat4::from_translation(Vec3::new(x as f32, 0.0, z as f32)) * Mat4::from_scale(Vec3::splat(0.4));
            engine.add_object(RenderObject::new(cube, default_material, transform))?;
        }
    }
    for x in -GRID..=GRID {
        let transform =
            Mat4::from_translation(Vec3::new(x as f32 * 2.0, 1.0, -GRID as f32 - 2.0)) * Mat4::from_scale(Vec3::splat(0.5));
        engine.add_object(RenderObject::new(triangle, default_material, transform))?;
    }
    // Added last; `animate` spins it
    engine.add_object(RenderObject::new(quad, textured_material, quad_transform(0.0)))?;
    engine.scene_mut().ambient_color = Vec4::new(0.15, 0.15, 0.2, 1.0);

    log::info!(
        "Demo scene: {} meshes, {} materials",
        engine.resources().mesh_count(),
        engine.resources().material_count()
    );
    Ok(())
}

/// Spin the textured quad and sweep the sun around the grid.
pub fn animate(engine: &mut Engine, seconds: f32) {
    if let Some(quad) = engine.objects_mut().last_mut() {
        quad.transform = quad_transform(seconds);
    }
    engine.scene_mut().sunlight_direction = sunlight_direction(seconds);
}

fn quad_transform(seconds: f32) -> Mat4 {
    Mat4::from_scale_rotation_translation(
        Vec3::splat(2.0),
        Quat::from_rotation_y(seconds * 0.8),
        Vec3::new(0.0, 3.0, 0.0),
    )
}

/// w stays 1.0 (intensity)
fn sunlight_direction(seconds: f32) -> Vec4 {
    let angle = seconds * 0.3;
    Vec4::new(angle.cos() * 0.5, -1.0, angle.sin() * 0.5, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meshes_are_whole_triangle_lists() {
        assert_eq!(triangle().len(), 3);
        assert_eq!(cube().len(), 36);
        assert_eq!(quad().len() % 3, 0);
    }

    #[test]
    fn cube_fits_in_unit_box() {
        for vertex in cube() {
            assert!(vertex.position.iter().all(|c| c.abs() <= 0.5 + f32::EPSILON));
        }
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let pixels = checkerboard(4, 2);
        assert_eq!(pixels.len(), 4 * 4 * 4);
        // (0,0) light, (2,0) dark
        assert_eq!(pixels[0], 230);
        assert_eq!(pixels[2 * 4], 40);
    }

    #[test]
    fn quad_spins_in_place() {
        let start = quad_transform(0.0);
        let later = quad_transform(1.0);
        assert_eq!(start.w_axis, later.w_axis);
        assert_ne!(start.x_axis, later.x_axis);
        assert_eq!(sunlight_direction(2.0).w, 1.0);
    }
}
