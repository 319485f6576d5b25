//! Cluster grid geometry
//!
//! The view frustum is cut into `x * y` screen tiles and `z` depth slices.
//! Slices are spaced exponentially, `z_i = -near * (far / near)^(i / z)`, so
//! each covers a similar share of perceived depth. Clusters are addressed by
//! the flat index `x + y * dim_x + z * dim_x * dim_y`.

use crate::config::ClusterGridConfig;
use crate::scene::{Aabb, Camera, GpuAabb};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec3, Vec3, Vec4};

/// Uniform block describing the grid to the culling and lighting shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClusterGenData {
    pub inverse_projection: Mat4,
    pub tile_size_px: [u32; 2],
    pub screen_width: u32,
    pub screen_height: u32,
    /// x, y, z slices and the light cap per cluster
    pub grid_size: [u32; 4],
    pub slice_scaling_factor: f32,
    pub slice_bias_factor: f32,
    pub z_near: f32,
    pub z_far: f32,
}

/// Scale and bias mapping `log2(-view_z)` to a slice index
pub fn slice_factors(slices: u32, near: f32, far: f32) -> (f32, f32) {
    let log_ratio = (far / near).log2();
    let scale = slices as f32 / log_ratio;
    let bias = -(slices as f32) * near.log2() / log_ratio;
    (scale, bias)
}

/// View-space depth (negative) of slice boundary `i`
pub fn slice_depth(i: u32, slices: u32, near: f32, far: f32) -> f32 {
    -near * (far / near).powf(i as f32 / slices as f32)
}

/// Tile size in pixels, rounded up so the tiles cover the screen
pub fn tile_size(grid: ClusterGridConfig, width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(grid.x).max(1), height.div_ceil(grid.y).max(1))
}

/// Dimensions and derived quantities of the cluster grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClusterGrid {
    dims: ClusterGridConfig,
    max_lights_per_cluster: u32,
}

impl ClusterGrid {
    pub fn new(dims: ClusterGridConfig, max_lights_per_cluster: u32) -> Self {
        Self {
            dims,
            max_lights_per_cluster,
        }
    }

    pub fn dims(&self) -> ClusterGridConfig {
        self.dims
    }

    pub fn max_lights_per_cluster(&self) -> u32 {
        self.max_lights_per_cluster
    }

    pub fn cluster_count(&self) -> u32 {
        self.dims.cluster_count()
    }

    /// Capacity of the flat light index list
    pub fn light_index_capacity(&self) -> u32 {
        self.cluster_count() * self.max_lights_per_cluster
    }

    pub fn flat_index(&self, x: u32, y: u32, z: u32) -> u32 {
        x + y * self.dims.x + z * self.dims.x * self.dims.y
    }

    pub fn coords(&self, index: u32) -> UVec3 {
        let per_slice = self.dims.x * self.dims.y;
        UVec3::new(
            index % self.dims.x,
            (index % per_slice) / self.dims.x,
            index / per_slice,
        )
    }

    pub fn gen_data(&self, camera: &Camera) -> ClusterGenData {
        let (width, height) = camera.viewport_size();
        let (tile_w, tile_h) = tile_size(self.dims, width, height);
        let (scale, bias) = slice_factors(self.dims.z, camera.near_plane, camera.far_plane);
        ClusterGenData {
            inverse_projection: camera.projection_matrix().inverse(),
            tile_size_px: [tile_w, tile_h],
            screen_width: width,
            screen_height: height,
            grid_size: [
                self.dims.x,
                self.dims.y,
                self.dims.z,
                self.max_lights_per_cluster,
            ],
            slice_scaling_factor: scale,
            slice_bias_factor: bias,
            z_near: camera.near_plane,
            z_far: camera.far_plane,
        }
    }

    /// Pixel rectangle of tile `(x, y)`, rows counted from the bottom of
    /// the screen. Tiles past the edge collapse to zero width.
    pub fn tile_rect(&self, x: u32, y: u32, gen: &ClusterGenData) -> ([u32; 2], [u32; 2]) {
        let [tile_w, tile_h] = gen.tile_size_px;
        let min = [
            (x * tile_w).min(gen.screen_width),
            (y * tile_h).min(gen.screen_height),
        ];
        let max = [
            ((x + 1) * tile_w).min(gen.screen_width),
            ((y + 1) * tile_h).min(gen.screen_height),
        ];
        (min, max)
    }

    /// View-space bounds of every cluster, in flat index order
    pub fn build_aabbs(&self, gen: &ClusterGenData) -> Vec<GpuAabb> {
        (0..self.cluster_count())
            .map(|index| {
                let c = self.coords(index);
                GpuAabb::from(self.cluster_aabb(c.x, c.y, c.z, gen))
            })
            .collect()
    }

    /// Bounds of one cluster: the tile's corner rays cut by the slice's
    /// near and far planes.
    pub fn cluster_aabb(&self, x: u32, y: u32, z: u32, gen: &ClusterGenData) -> Aabb {
        let (min_px, max_px) = self.tile_rect(x, y, gen);
        let corners = [
            [min_px[0], min_px[1]],
            [max_px[0], min_px[1]],
            [min_px[0], max_px[1]],
            [max_px[0], max_px[1]],
        ]
        .map(|[px, py]| screen_to_view(px as f32, py as f32, gen));

        let near_z = slice_depth(z, self.dims.z, gen.z_near, gen.z_far);
        let far_z = slice_depth(z + 1, self.dims.z, gen.z_near, gen.z_far);

        Aabb::from_points(corners.iter().flat_map(|&corner| {
            [
                line_intersect_z_plane(corner, near_z),
                line_intersect_z_plane(corner, far_z),
            ]
        }))
    }

    /// Cluster a fragment falls in. `frag_x`/`frag_y` are framebuffer
    /// coordinates (origin top-left), `view_depth` the positive distance
    /// along the view direction.
    pub fn cluster_index_for_fragment(
        &self,
        frag_x: f32,
        frag_y: f32,
        view_depth: f32,
        gen: &ClusterGenData,
    ) -> u32 {
        let [tile_w, tile_h] = gen.tile_size_px;
        let from_bottom = (gen.screen_height as f32 - frag_y).max(0.0);
        let tile_x = ((frag_x.max(0.0) as u32) / tile_w).min(self.dims.x - 1);
        let tile_y = ((from_bottom as u32) / tile_h).min(self.dims.y - 1);

        let slice = (view_depth.log2() * gen.slice_scaling_factor + gen.slice_bias_factor).floor();
        let slice = (slice.max(0.0) as u32).min(self.dims.z - 1);

        self.flat_index(tile_x, tile_y, slice)
    }
}

/// Unproject a pixel (rows from the bottom) onto the near plane in view space
pub fn screen_to_view(px: f32, py: f32, gen: &ClusterGenData) -> Vec3 {
    let ndc = Vec4::new(
        px / gen.screen_width as f32 * 2.0 - 1.0,
        py / gen.screen_height as f32 * 2.0 - 1.0,
        0.0,
        1.0,
    );
    let view = gen.inverse_projection * ndc;
    view.truncate() / view.w
}

/// Point where the ray from the eye through `point` meets the plane `z = z_plane`
pub fn line_intersect_z_plane(point: Vec3, z_plane: f32) -> Vec3 {
    point * (z_plane / point.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn camera(width: u32, height: u32) -> Camera {
        let mut camera = Camera::default();
        camera.update_viewport_size(width, height);
        camera
    }

    fn default_grid() -> ClusterGrid {
        ClusterGrid::new(ClusterGridConfig::default(), 50)
    }

    #[test]
    fn test_flat_index_round_trip() {
        let grid = default_grid();
        assert_eq!(grid.flat_index(3, 2, 1), 3 + 2 * 16 + 16 * 9);
        for index in [0, 17, 143, 144, grid.cluster_count() - 1] {
            let c = grid.coords(index);
            assert_eq!(grid.flat_index(c.x, c.y, c.z), index);
        }
    }

    #[rstest]
    #[case(0.1, 100.0, 24)]
    #[case(0.5, 1000.0, 16)]
    #[case(1.0, 2.0, 4)]
    fn test_slice_factors_map_planes_to_bounds(
        #[case] near: f32,
        #[case] far: f32,
        #[case] slices: u32,
    ) {
        let (scale, bias) = slice_factors(slices, near, far);
        let slice_of = |depth: f32| depth.log2() * scale + bias;
        assert!(slice_of(near).abs() < 1e-4);
        assert!((slice_of(far) - slices as f32).abs() < 1e-3);

        let mut previous = f32::INFINITY;
        for i in 0..=slices {
            let z = slice_depth(i, slices, near, far);
            assert!(z < previous + f32::EPSILON || i == 0);
            assert!((slice_of(-z) - i as f32).abs() < 1e-3);
            previous = z;
        }
        assert!((slice_depth(0, slices, near, far) + near).abs() < 1e-6);
        assert!((slice_depth(slices, slices, near, far) + far).abs() < 1e-3 * far);
    }

    #[test]
    fn test_screen_corners_unproject_to_near_plane() {
        let cam = camera(1280, 720);
        let gen = default_grid().gen_data(&cam);
        let corner = screen_to_view(1280.0, 720.0, &gen);
        assert!((corner.z + cam.near_plane).abs() < 1e-5);

        let half_height = cam.near_plane * (cam.fov.to_radians() * 0.5).tan();
        assert!((corner.y - half_height).abs() < 1e-5);
        assert!((corner.x - half_height * cam.aspect()).abs() < 1e-5);
    }

    #[test]
    fn test_cluster_depth_span_matches_slice() {
        let cam = camera(1280, 720);
        let grid = default_grid();
        let gen = grid.gen_data(&cam);
        let aabb = grid.cluster_aabb(5, 5, 7, &gen);
        assert!((aabb.max.z - slice_depth(7, 24, 0.1, 100.0)).abs() < 1e-4);
        assert!((aabb.min.z - slice_depth(8, 24, 0.1, 100.0)).abs() < 1e-4);
    }

    #[test]
    fn test_fragment_lookup_inverts_cluster_bounds() {
        let cam = camera(1280, 720);
        let grid = default_grid();
        let gen = grid.gen_data(&cam);

        // Pixel (100, 700) from the top lies in tile (1, 0) counted from the bottom
        let depth = -slice_depth(3, 24, 0.1, 100.0) * 1.01;
        let index = grid.cluster_index_for_fragment(100.0, 700.0, depth, &gen);
        assert_eq!(grid.coords(index), UVec3::new(1, 0, 3));

        // Beyond the far plane clamps to the last slice
        let index = grid.cluster_index_for_fragment(0.0, 0.0, 1.0e6, &gen);
        assert_eq!(grid.coords(index), UVec3::new(0, 8, 23));
    }

    #[test]
    fn test_tiles_past_the_edge_collapse() {
        let grid = default_grid();
        let gen = grid.gen_data(&camera(10, 720));
        assert_eq!(gen.tile_size_px[0], 1);
        let (min, max) = grid.tile_rect(12, 0, &gen);
        assert_eq!((min[0], max[0]), (10, 10));
    }

    #[test]
    fn test_gen_data_layout() {
        assert_eq!(std::mem::size_of::<ClusterGenData>(), 112);
        let gen = default_grid().gen_data(&camera(1280, 720));
        assert_eq!(gen.tile_size_px, [80, 80]);
        assert_eq!(gen.grid_size, [16, 9, 24, 50]);
    }
}
