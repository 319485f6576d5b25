//! Axis-aligned bounding boxes

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Axis-aligned bounding box. `min <= max` component-wise unless empty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Box that contains nothing; expanding it by a point yields that point.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Box spanning two arbitrary corners
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Smallest box containing all points
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        points.into_iter().fold(Self::EMPTY, |mut aabb, p| {
            aabb.expand_point(p);
            aabb
        })
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }

    pub fn expand_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn expand(&mut self, other: &Aabb) {
        if other.is_empty() {
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half the diagonal length
    pub fn radius(&self) -> f32 {
        (self.max - self.min).length() * 0.5
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// Squared distance from a point to the box, zero inside
    pub fn distance_squared(&self, point: Vec3) -> f32 {
        let closest = point.clamp(self.min, self.max);
        point.distance_squared(closest)
    }

    /// Whether a sphere touches the box
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.distance_squared(center) <= radius * radius
    }

    /// Bounds of this box after an affine transform (Arvo's method).
    pub fn transform(&self, matrix: &Mat4) -> Aabb {
        if self.is_empty() {
            return *self;
        }
        let translation = matrix.w_axis.truncate();
        let mut min = translation;
        let mut max = translation;
        let columns = [
            matrix.x_axis.truncate(),
            matrix.y_axis.truncate(),
            matrix.z_axis.truncate(),
        ];
        for (axis, column) in columns.iter().enumerate() {
            let a = *column * self.min[axis];
            let b = *column * self.max[axis];
            min += a.min(b);
            max += a.max(b);
        }
        Aabb { min, max }
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Bounding box in the 16-byte aligned layout shader storage buffers use
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuAabb {
    pub min: Vec4,
    pub max: Vec4,
}

impl From<Aabb> for GpuAabb {
    fn from(aabb: Aabb) -> Self {
        Self {
            min: aabb.min.extend(1.0),
            max: aabb.max.extend(1.0),
        }
    }
}

impl From<GpuAabb> for Aabb {
    fn from(aabb: GpuAabb) -> Self {
        Self {
            min: aabb.min.truncate(),
            max: aabb.max.truncate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_new_orders_corners() {
        let aabb = Aabb::new(Vec3::new(1.0, -2.0, 3.0), Vec3::new(-1.0, 2.0, -3.0));
        assert_eq!(aabb.min, Vec3::new(-1.0, -2.0, -3.0));
        assert_eq!(aabb.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_expand_empty() {
        let mut aabb = Aabb::EMPTY;
        assert!(aabb.is_empty());
        aabb.expand(&Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert_eq!(aabb, Aabb::new(Vec3::ZERO, Vec3::ONE));
        aabb.expand(&Aabb::EMPTY);
        assert_eq!(aabb, Aabb::new(Vec3::ZERO, Vec3::ONE));
    }

    #[test]
    fn test_center_and_radius() {
        let aabb = Aabb::new(Vec3::splat(-1.0), Vec3::splat(1.0));
        assert_eq!(aabb.center(), Vec3::ZERO);
        assert!((aabb.radius() - 3.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_transform_matches_corners() {
        let aabb = Aabb::new(Vec3::new(-1.0, 0.0, -2.0), Vec3::new(2.0, 1.0, 0.5));
        let matrix = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-0.3),
            Vec3::new(5.0, -1.0, 3.0),
        );

        let corners = (0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { aabb.min.x } else { aabb.max.x },
                if i & 2 == 0 { aabb.min.y } else { aabb.max.y },
                if i & 4 == 0 { aabb.min.z } else { aabb.max.z },
            );
            matrix.transform_point3(corner)
        });
        let expected = Aabb::from_points(corners);
        let actual = aabb.transform(&matrix);

        assert!(actual.min.abs_diff_eq(expected.min, 1e-5));
        assert!(actual.max.abs_diff_eq(expected.max, 1e-5));
    }

    #[test]
    fn test_sphere_intersection() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(aabb.intersects_sphere(Vec3::splat(0.5), 0.01));
        assert!(aabb.intersects_sphere(Vec3::new(2.0, 0.5, 0.5), 1.0));
        assert!(!aabb.intersects_sphere(Vec3::new(2.0, 0.5, 0.5), 0.99));
    }

    #[test]
    fn test_gpu_layout() {
        assert_eq!(std::mem::size_of::<GpuAabb>(), 32);
        let gpu = GpuAabb::from(Aabb::new(Vec3::ZERO, Vec3::ONE));
        assert_eq!(gpu.max, Vec4::new(1.0, 1.0, 1.0, 1.0));
    }
}
