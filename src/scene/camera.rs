//! Camera system

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Direction of a keyboard-driven camera move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraMovement {
    Forward,
    Backward,
    Right,
    Left,
}

/// Parameters the cluster grid depends on. Camera position and orientation
/// are deliberately absent: the grid lives in view space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionKey {
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
    pub width: u32,
    pub height: u32,
}

/// Free-flying yaw/pitch camera
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub world_up: Vec3,
    /// Degrees; -90 looks down -Z
    pub yaw: f32,
    /// Degrees, positive looks up
    pub pitch: f32,
    /// World units per second
    pub speed: f32,
    /// Degrees per unit of pan input
    pub sensitivity: f32,
    /// Vertical field of view in degrees
    pub fov: f32,
    pub near_plane: f32,
    pub far_plane: f32,
    front: Vec3,
    up: Vec3,
    right: Vec3,
    width: u32,
    height: u32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::Y, -90.0, 0.0)
    }
}

impl Camera {
    pub fn new(position: Vec3, world_up: Vec3, yaw: f32, pitch: f32) -> Self {
        let mut camera = Self {
            position,
            world_up,
            yaw,
            pitch,
            speed: 2.5,
            sensitivity: 0.1,
            fov: 50.0,
            near_plane: 0.1,
            far_plane: 100.0,
            front: -Vec3::Z,
            up: Vec3::Y,
            right: Vec3::X,
            width: 800,
            height: 600,
        };
        camera.update_vectors();
        camera
    }

    pub fn with_projection(mut self, fov_degrees: f32, near: f32, far: f32) -> Self {
        self.fov = fov_degrees;
        self.near_plane = near;
        self.far_plane = far;
        self
    }

    pub fn front(&self) -> Vec3 {
        self.front
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn right(&self) -> Vec3 {
        self.right
    }

    pub fn viewport_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    pub fn update_viewport_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    /// Move along the camera axes, scaled by speed and elapsed time.
    pub fn translate(&mut self, direction: CameraMovement, delta_time: f32) {
        let velocity = self.speed * delta_time;
        match direction {
            CameraMovement::Forward => self.position += self.front * velocity,
            CameraMovement::Backward => self.position -= self.front * velocity,
            CameraMovement::Right => self.position += self.right * velocity,
            CameraMovement::Left => self.position -= self.right * velocity,
        }
    }

    /// Rotate by a mouse delta. With `constrain_pitch` the camera cannot flip
    /// over the poles.
    pub fn pan(&mut self, x_offset: f32, y_offset: f32, constrain_pitch: bool) {
        self.yaw += x_offset * self.sensitivity;
        self.pitch += y_offset * self.sensitivity;
        if constrain_pitch {
            self.pitch = self.pitch.clamp(-89.0, 89.0);
        }
        self.update_vectors();
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front, self.up)
    }

    /// Right-handed perspective with 0..1 depth. Clip-space Y is not
    /// flipped; render passes use a flipped viewport instead.
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.fov.to_radians(),
            self.aspect(),
            self.near_plane,
            self.far_plane,
        )
    }

    pub fn projection_key(&self) -> ProjectionKey {
        ProjectionKey {
            fov_y_degrees: self.fov,
            near: self.near_plane,
            far: self.far_plane,
            width: self.width,
            height: self.height,
        }
    }

    /// Per-frame uniform block
    pub fn uniforms(&self, point_light_count: u32) -> GlobalUniforms {
        GlobalUniforms {
            view: self.view_matrix(),
            projection: self.projection_matrix(),
            camera_position: self.position.extend(1.0),
            near: self.near_plane,
            far: self.far_plane,
            point_light_count,
            _pad: 0,
        }
    }

    fn update_vectors(&mut self) {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        self.front = Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos())
            .normalize();
        self.right = self.front.cross(self.world_up).normalize();
        self.up = self.right.cross(self.front).normalize();
    }
}

/// Camera data shared by every pass, one copy per frame in flight
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GlobalUniforms {
    pub view: Mat4,
    pub projection: Mat4,
    pub camera_position: Vec4,
    pub near: f32,
    pub far: f32,
    pub point_light_count: u32,
    pub _pad: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_looks_down_negative_z() {
        let camera = Camera::default();
        assert!(camera.front().abs_diff_eq(-Vec3::Z, 1e-6));
        assert!(camera.right().abs_diff_eq(Vec3::X, 1e-6));
        assert!(camera.view_matrix().abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn test_pan_constrains_pitch() {
        let mut camera = Camera::default();
        camera.pan(0.0, 10_000.0, true);
        assert_eq!(camera.pitch, 89.0);
        camera.pan(0.0, -20_000.0, false);
        assert!(camera.pitch < -89.0);
    }

    #[test]
    fn test_translate_moves_along_front() {
        let mut camera = Camera::default();
        camera.speed = 2.0;
        camera.translate(CameraMovement::Forward, 0.5);
        assert!(camera.position.abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-6));
        camera.translate(CameraMovement::Right, 1.0);
        assert!(camera.position.abs_diff_eq(Vec3::new(2.0, 0.0, -1.0), 1e-6));
    }

    #[test]
    fn test_projection_maps_near_to_zero_depth() {
        let camera = Camera::default();
        let clip = camera.projection_matrix() * Vec4::new(0.0, 0.0, -camera.near_plane, 1.0);
        assert!((clip.z / clip.w).abs() < 1e-6);
        let clip = camera.projection_matrix() * Vec4::new(0.0, 0.0, -camera.far_plane, 1.0);
        assert!((clip.z / clip.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_projection_key_ignores_orientation() {
        let mut camera = Camera::default();
        let key = camera.projection_key();
        camera.pan(30.0, 10.0, true);
        camera.translate(CameraMovement::Left, 3.0);
        assert_eq!(camera.projection_key(), key);
        camera.update_viewport_size(1920, 1080);
        assert_ne!(camera.projection_key(), key);
    }

    #[test]
    fn test_global_uniform_size() {
        assert_eq!(std::mem::size_of::<GlobalUniforms>(), 160);
    }
}
