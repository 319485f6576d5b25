//! Startup configuration for the renderer

use crate::backend::{BackendError, BackendResult};

/// Cluster grid subdivisions of the view frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterGridConfig {
    /// Tiles across the screen
    pub x: u32,
    /// Tiles down the screen
    pub y: u32,
    /// Exponential depth slices between near and far
    pub z: u32,
}

impl ClusterGridConfig {
    pub fn cluster_count(&self) -> u32 {
        self.x * self.y * self.z
    }
}

impl Default for ClusterGridConfig {
    fn default() -> Self {
        Self { x: 16, y: 9, z: 24 }
    }
}

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Cluster grid dimensions; fixed for the renderer's lifetime
    pub cluster_grid: ClusterGridConfig,
    /// Light indices reserved per cluster
    pub max_lights_per_cluster: u32,
    /// Capacity of the point light storage buffer
    pub max_point_lights: u32,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: u32,
    /// MSAA sample count for the forward pass
    pub msaa_samples: u32,
    /// Initial vertical field of view in degrees
    pub camera_fov_degrees: f32,
    pub camera_near: f32,
    pub camera_far: f32,
    /// Clear color of the forward pass
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "Clustered Renderer".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            cluster_grid: ClusterGridConfig::default(),
            max_lights_per_cluster: 50,
            max_point_lights: 1024,
            frames_in_flight: 2,
            msaa_samples: 4,
            camera_fov_degrees: 50.0,
            camera_near: 0.1,
            camera_far: 100.0,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl RendererConfig {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_cluster_grid(mut self, x: u32, y: u32, z: u32) -> Self {
        self.cluster_grid = ClusterGridConfig { x, y, z };
        self
    }

    pub fn with_max_lights_per_cluster(mut self, count: u32) -> Self {
        self.max_lights_per_cluster = count;
        self
    }

    pub fn with_max_point_lights(mut self, count: u32) -> Self {
        self.max_point_lights = count;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_msaa_samples(mut self, samples: u32) -> Self {
        self.msaa_samples = samples;
        self
    }

    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.camera_near = near;
        self.camera_far = far;
        self
    }

    /// Reject configurations the renderer cannot run with.
    pub fn validate(&self) -> BackendResult<()> {
        let grid = self.cluster_grid;
        if grid.x == 0 || grid.y == 0 || grid.z == 0 {
            return Err(BackendError::InvalidConfig(format!(
                "cluster grid {}x{}x{} has an empty dimension",
                grid.x, grid.y, grid.z
            )));
        }
        if self.max_lights_per_cluster == 0 {
            return Err(BackendError::InvalidConfig(
                "max_lights_per_cluster must be at least 1".into(),
            ));
        }
        if self.max_point_lights == 0 {
            return Err(BackendError::InvalidConfig(
                "max_point_lights must be at least 1".into(),
            ));
        }
        if self.frames_in_flight == 0 {
            return Err(BackendError::InvalidConfig(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if !matches!(self.msaa_samples, 1 | 2 | 4 | 8) {
            return Err(BackendError::InvalidConfig(format!(
                "unsupported MSAA sample count {}",
                self.msaa_samples
            )));
        }
        if !(self.camera_near > 0.0 && self.camera_far > self.camera_near) {
            return Err(BackendError::InvalidConfig(format!(
                "clip planes near={} far={} must satisfy 0 < near < far",
                self.camera_near, self.camera_far
            )));
        }
        if !(self.camera_fov_degrees > 0.0 && self.camera_fov_degrees < 180.0) {
            return Err(BackendError::InvalidConfig(format!(
                "field of view {} out of range",
                self.camera_fov_degrees
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster_grid.cluster_count(), 16 * 9 * 24);
    }

    #[rstest]
    #[case::empty_grid(RendererConfig::default().with_cluster_grid(16, 0, 24))]
    #[case::no_lights_per_cluster(RendererConfig::default().with_max_lights_per_cluster(0))]
    #[case::no_frames(RendererConfig::default().with_frames_in_flight(0))]
    #[case::odd_samples(RendererConfig::default().with_msaa_samples(3))]
    #[case::near_zero(RendererConfig::default().with_clip_planes(0.0, 100.0))]
    #[case::far_before_near(RendererConfig::default().with_clip_planes(10.0, 1.0))]
    fn test_invalid_configs(#[case] config: RendererConfig) {
        assert!(matches!(
            config.validate(),
            Err(BackendError::InvalidConfig(_))
        ));
    }
}
