//! Object placement

use super::Aabb;
use glam::{Mat4, Quat, Vec3};

/// Placement of a scene object: scale, then rotation, then translation.
///
/// Shaders transform normals by the upper 3x3 of [`Transform::matrix`],
/// which is only correct for uniform scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    /// Identity placement at the world origin
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Self::default()
        }
    }

    pub fn from_position_scale(position: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            scale,
            ..Self::default()
        }
    }

    pub fn with_uniform_scale(mut self, scale: f32) -> Self {
        self.scale = Vec3::splat(scale);
        self
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// World-space box enclosing `local` once placed
    pub fn world_bounds(&self, local: &Aabb) -> Aabb {
        local.transform(&self.matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_applies_scale_then_translation() {
        let transform = Transform::from_position_scale(Vec3::new(1.0, 2.0, 3.0), Vec3::splat(2.0));
        let p = transform.matrix().transform_point3(Vec3::ONE);
        assert!(p.abs_diff_eq(Vec3::new(3.0, 4.0, 5.0), 1e-6));
    }

    #[test]
    fn test_world_bounds_follow_rotation() {
        let local = Aabb::new(Vec3::new(-1.0, -0.5, -0.5), Vec3::new(1.0, 0.5, 0.5));
        let transform = Transform::from_position_rotation(
            Vec3::new(0.0, 0.0, -4.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        )
        .with_uniform_scale(2.0);

        let world = transform.world_bounds(&local);
        assert!(world.min.abs_diff_eq(Vec3::new(-1.0, -1.0, -6.0), 1e-5));
        assert!(world.max.abs_diff_eq(Vec3::new(1.0, 1.0, -2.0), 1e-5));
    }
}
