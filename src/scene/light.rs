//! Light types for the scene

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// Point light, packed as two vec4s for std430 storage buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLight {
    /// xyz = world position, w = radius of influence
    pub position_radius: Vec4,
    /// xyz = linear color, w = intensity
    pub color_intensity: Vec4,
}

impl Default for PointLight {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE, 10.0, 1.0)
    }
}

impl PointLight {
    pub fn new(position: Vec3, color: Vec3, radius: f32, intensity: f32) -> Self {
        Self {
            position_radius: position.extend(radius),
            color_intensity: color.extend(intensity),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position_radius.truncate()
    }

    pub fn radius(&self) -> f32 {
        self.position_radius.w
    }

    pub fn color(&self) -> Vec3 {
        self.color_intensity.truncate()
    }

    pub fn intensity(&self) -> f32 {
        self.color_intensity.w
    }

    pub fn set_position(&mut self, position: Vec3) {
        self.position_radius = position.extend(self.position_radius.w);
    }

    pub fn set_color(&mut self, color: Vec3) {
        self.color_intensity = color.extend(self.color_intensity.w);
    }
}

/// Directional light uniform block
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DirectionalLight {
    /// xyz = normalized direction the light travels, w unused
    pub direction: Vec4,
    /// xyz = linear color, w = intensity
    pub color_intensity: Vec4,
}

impl Default for DirectionalLight {
    /// Straight down with zero intensity, so scenes without one stay unlit by it
    fn default() -> Self {
        Self::new(-Vec3::Y, Vec3::ONE, 0.0)
    }
}

impl DirectionalLight {
    pub fn new(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero().extend(0.0),
            color_intensity: color.extend(intensity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_light_packing() {
        let mut light =
            PointLight::new(Vec3::new(1.0, 2.0, 3.0), Vec3::new(0.5, 0.25, 1.0), 4.0, 2.0);
        assert_eq!(light.radius(), 4.0);
        assert_eq!(light.intensity(), 2.0);

        light.set_position(Vec3::ZERO);
        light.set_color(Vec3::ONE);
        assert_eq!(light.position_radius, Vec4::new(0.0, 0.0, 0.0, 4.0));
        assert_eq!(light.color_intensity, Vec4::new(1.0, 1.0, 1.0, 2.0));
        assert_eq!(std::mem::size_of::<PointLight>(), 32);
    }

    #[test]
    fn test_directional_light_normalizes() {
        let light = DirectionalLight::new(Vec3::new(0.0, -4.0, 0.0), Vec3::ONE, 1.0);
        assert_eq!(light.direction, Vec4::new(0.0, -1.0, 0.0, 0.0));
    }
}
