// Camera - view/projection for the global uniform

use glam::{Mat4, Vec3};

use super::scene::GpuCameraData;

#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3, width: u32, height: u32) -> Self {
        Self {
            position,
            target,
            fov_y: 70f32.to_radians(),
            aspect: width as f32 / height.max(1) as f32,
            near: 0.1,
            far: 200.0,
        }
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, Vec3::Y)
    }

    /// Right-handed perspective with Y flipped for Vulkan clip space.
    pub fn projection(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov_y, self.aspect, self.near, self.far);
        proj.y_axis.y *= -1.0;
        proj
    }

    pub fn gpu_data(&self) -> GpuCameraData {
        let view = self.view();
        let proj = self.projection();
        GpuCameraData {
            view,
            proj,
            view_proj: proj * view,
        }
    }
}
