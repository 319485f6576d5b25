//! Cluster grid and light assignment tests.
//!
//! Geometry is checked on the CPU; the GPU-facing parts run against the
//! headless backend, which stores buffer contents but does not execute
//! shaders.

mod common;

use rstest::rstest;

use clustered_renderer::backend::GraphicsBackend;
use clustered_renderer::pipeline::cluster::{
    assign_lights, line_intersect_z_plane, screen_to_view, slice_depth, tile_size, ClusterGrid,
};
use clustered_renderer::pipeline::ClusterBuilder;
use clustered_renderer::scene::{Aabb, GpuAabb, PointLight};
use clustered_renderer::{ClusterGridConfig, FrameStatus, HeadlessBackend, RendererConfig};
use common::{test_camera, Harness};
use glam::{Vec3, Vec4};

fn grid(x: u32, y: u32, z: u32) -> ClusterGrid {
    ClusterGrid::new(ClusterGridConfig { x, y, z }, 50)
}

/// View-space point under a framebuffer pixel (origin top-left) at a
/// positive view depth.
fn view_point(frag_x: f32, frag_y: f32, depth: f32, width: f32, height: f32) -> Vec3 {
    let camera = sized_camera(width as u32, height as u32);
    let ndc = Vec4::new(frag_x / width * 2.0 - 1.0, 1.0 - frag_y / height * 2.0, 0.0, 1.0);
    let near = camera.projection_matrix().inverse() * ndc;
    line_intersect_z_plane(near.truncate() / near.w, -depth)
}

fn sized_camera(width: u32, height: u32) -> clustered_renderer::Camera {
    let mut camera = test_camera();
    camera.update_viewport_size(width, height);
    camera
}

// ============================================================================
// Grid Geometry
// ============================================================================

#[rstest]
#[case::default_grid(24, 0.1, 100.0)]
#[case::few_slices(4, 0.5, 50.0)]
#[case::deep_frustum(32, 0.01, 1000.0)]
fn test_slice_depths_monotonic(#[case] slices: u32, #[case] near: f32, #[case] far: f32) {
    assert!((slice_depth(0, slices, near, far) + near).abs() < 1e-5);
    assert!((slice_depth(slices, slices, near, far) + far).abs() < far * 1e-4);

    for i in 0..slices {
        let current = slice_depth(i, slices, near, far);
        let next = slice_depth(i + 1, slices, near, far);
        assert!(next < current, "slice {} does not move away from the eye", i);
    }
}

#[rstest]
#[case::default_grid(16, 9, 24, 1280, 720)]
#[case::uneven(7, 5, 8, 1000, 333)]
#[case::tiny_viewport(16, 9, 4, 10, 6)]
fn test_tiles_cover_screen(
    #[case] x: u32,
    #[case] y: u32,
    #[case] z: u32,
    #[case] width: u32,
    #[case] height: u32,
) {
    let grid = grid(x, y, z);
    let gen = grid.gen_data(&sized_camera(width, height));
    let (tile_w, tile_h) = tile_size(grid.dims(), width, height);
    assert_eq!(gen.tile_size_px, [tile_w, tile_h]);
    assert!(tile_w * x >= width && tile_h * y >= height);

    for row in 0..y {
        let (first, _) = grid.tile_rect(0, row, &gen);
        let (_, last) = grid.tile_rect(x - 1, row, &gen);
        assert_eq!(first[0], 0);
        assert_eq!(last[0], width);
        for column in 0..x - 1 {
            let (_, left) = grid.tile_rect(column, row, &gen);
            let (right, _) = grid.tile_rect(column + 1, row, &gen);
            assert_eq!(left[0], right[0], "gap between tiles {} and {}", column, column + 1);
        }
    }
    let (_, top) = grid.tile_rect(0, y - 1, &gen);
    assert_eq!(top[1], height);
}

#[rstest]
#[case::default_grid(16, 9, 24)]
#[case::coarse(4, 4, 4)]
fn test_cluster_bounds_well_formed(#[case] x: u32, #[case] y: u32, #[case] z: u32) {
    let grid = grid(x, y, z);
    let gen = grid.gen_data(&sized_camera(1280, 720));
    let aabbs = grid.build_aabbs(&gen);
    assert_eq!(aabbs.len(), grid.cluster_count() as usize);

    for (index, aabb) in aabbs.iter().enumerate() {
        assert!(
            aabb.min.cmple(aabb.max).all(),
            "cluster {} has inverted bounds",
            index
        );
        // Everything sits in front of the eye
        assert!(aabb.max.z < 0.0);
    }

    // Deeper slices reach further
    let near = Aabb::from(aabbs[grid.flat_index(0, 0, 0) as usize]);
    let far = Aabb::from(aabbs[grid.flat_index(0, 0, z - 1) as usize]);
    assert!(far.min.z < near.min.z);
}

#[rstest]
#[case(640.0, 360.0, 5.0)]
#[case(10.5, 700.5, 0.3)]
#[case(1270.0, 3.0, 80.0)]
#[case(333.3, 123.4, 17.0)]
fn test_fragment_lands_in_its_cluster(
    #[case] frag_x: f32,
    #[case] frag_y: f32,
    #[case] depth: f32,
) {
    let grid = grid(16, 9, 24);
    let gen = grid.gen_data(&sized_camera(1280, 720));

    let index = grid.cluster_index_for_fragment(frag_x, frag_y, depth, &gen);
    let coords = grid.coords(index);
    let aabb = grid.cluster_aabb(coords.x, coords.y, coords.z, &gen);
    let point = view_point(frag_x, frag_y, depth, 1280.0, 720.0);
    assert!(
        aabb.distance_squared(point) < 1e-4,
        "{:?} outside cluster {} {:?}",
        point,
        index,
        aabb
    );
}

#[test]
fn test_screen_corners_unproject_to_near_plane() {
    let grid = grid(16, 9, 24);
    let gen = grid.gen_data(&sized_camera(1280, 720));

    let bottom_left = screen_to_view(0.0, 0.0, &gen);
    let top_right = screen_to_view(1280.0, 720.0, &gen);
    assert!((bottom_left.z + gen.z_near).abs() < 1e-4);
    assert!((top_right.z + gen.z_near).abs() < 1e-4);
    assert!(bottom_left.x < 0.0 && bottom_left.y < 0.0);
    assert!(top_right.x > 0.0 && top_right.y > 0.0);
}

// ============================================================================
// Cluster Builder
// ============================================================================

#[test]
fn test_recomputing_bounds_is_idempotent() {
    let mut backend = HeadlessBackend::new(1280, 720);
    let config = RendererConfig::default();
    let mut builder = ClusterBuilder::new(&mut backend, &config).unwrap();
    let camera = sized_camera(1280, 720);

    builder
        .compute_cluster_grids(&mut backend, &camera, false)
        .unwrap();
    let handle = builder.aabb_buffer().unwrap().handle();
    let first = builder.aabb_buffer().unwrap().read(&backend).unwrap();
    let first_gen = *builder.gen_data().unwrap();

    builder
        .compute_cluster_grids(&mut backend, &camera, false)
        .unwrap();
    let second = builder.aabb_buffer().unwrap().read(&backend).unwrap();
    assert_eq!(builder.aabb_buffer().unwrap().handle(), handle);
    assert_eq!(
        bytemuck::cast_slice::<GpuAabb, u8>(&first),
        bytemuck::cast_slice::<GpuAabb, u8>(&second)
    );

    builder
        .compute_cluster_grids(&mut backend, &camera, true)
        .unwrap();
    let rebuilt = builder.aabb_buffer().unwrap().read(&backend).unwrap();

    assert_eq!(first, rebuilt);
    assert_eq!(first_gen, *builder.gen_data().unwrap());
    assert_eq!(first, builder.grid().build_aabbs(&first_gen));
    assert_eq!(
        builder.gen_buffer().unwrap().read(&backend).unwrap(),
        vec![first_gen]
    );

    builder.destroy(&mut backend);
}

#[test]
fn test_projection_change_moves_bounds() {
    let mut backend = HeadlessBackend::new(1280, 720);
    let mut builder = ClusterBuilder::new(&mut backend, &RendererConfig::default()).unwrap();
    let mut camera = sized_camera(1280, 720);

    builder
        .compute_cluster_grids(&mut backend, &camera, false)
        .unwrap();
    let before = builder.aabb_buffer().unwrap().read(&backend).unwrap();

    camera.update_viewport_size(800, 800);
    builder
        .compute_cluster_grids(&mut backend, &camera, false)
        .unwrap();
    let after = builder.aabb_buffer().unwrap().read(&backend).unwrap();

    assert_eq!(before.len(), after.len());
    assert_ne!(before, after);
    assert_eq!(builder.gen_data().unwrap().screen_width, 800);

    builder.destroy(&mut backend);
}

// ============================================================================
// Light Assignment
// ============================================================================

#[test]
fn test_single_light_reaches_only_nearby_clusters() {
    let grid = grid(16, 9, 24);
    let camera = sized_camera(1280, 720);
    let gen = grid.gen_data(&camera);
    let aabbs = grid.build_aabbs(&gen);

    let light = PointLight::new(Vec3::new(0.0, 0.0, -10.0), Vec3::ONE, 1.0, 1.0);
    let assignment = assign_lights(&aabbs, &[light], &camera.view_matrix(), 50);

    let center = grid.cluster_index_for_fragment(640.0, 360.0, 10.0, &gen) as usize;
    assert_eq!(assignment.lights_for(center), &[0]);

    let occupied: Vec<_> = assignment.occupied().collect();
    assert!(!occupied.is_empty());
    assert!(occupied.len() < aabbs.len() / 10);
    assert!(!occupied.contains(&(grid.flat_index(0, 0, 0) as usize)));
    assert_eq!(assignment.indices.len(), occupied.len());
}

#[test]
fn test_small_light_fills_exactly_one_cluster() {
    let grid = grid(16, 9, 24);
    let camera = sized_camera(1280, 720);
    let gen = grid.gen_data(&camera);
    let aabbs = grid.build_aabbs(&gen);

    // Centre pixel of tile (8, 4), halfway through slice 12 in log depth
    let [tile_w, tile_h] = gen.tile_size_px;
    let frag_x = 8.0 * tile_w as f32 + tile_w as f32 * 0.5;
    let frag_y = 720.0 - (4.0 * tile_h as f32 + tile_h as f32 * 0.5);
    let depth = gen.z_near * (gen.z_far / gen.z_near).powf(12.5 / 24.0);
    let view = view_point(frag_x, frag_y, depth, 1280.0, 720.0);
    let world = camera.view_matrix().inverse().transform_point3(view);

    let light = PointLight::new(world, Vec3::ONE, 1e-3, 1.0);
    let assignment = assign_lights(&aabbs, &[light], &camera.view_matrix(), 50);

    let target = grid.flat_index(8, 4, 12) as usize;
    assert_eq!(assignment.occupied().collect::<Vec<_>>(), vec![target]);
    let entry = assignment.grid[target];
    assert_eq!(entry.count, 1);
    assert_eq!(assignment.indices[entry.offset as usize], 0);
    for (index, entry) in assignment.grid.iter().enumerate() {
        if index != target {
            assert_eq!(entry.count, 0, "cluster {} picked up the light", index);
        }
    }
}

#[test]
fn test_light_behind_camera_touches_nothing() {
    let grid = grid(16, 9, 24);
    let camera = sized_camera(1280, 720);
    let aabbs = grid.build_aabbs(&grid.gen_data(&camera));

    let behind = PointLight::new(Vec3::new(0.0, 0.0, 5.0), Vec3::ONE, 1.0, 1.0);
    let beyond_far = PointLight::new(Vec3::new(0.0, 0.0, -500.0), Vec3::ONE, 10.0, 1.0);
    let assignment = assign_lights(&aabbs, &[behind, beyond_far], &camera.view_matrix(), 50);

    assert_eq!(assignment.occupied().count(), 0);
    assert!(assignment.indices.is_empty());
}

#[test]
fn test_cluster_cap_keeps_first_lights() {
    let grid = grid(4, 4, 4);
    let camera = sized_camera(1280, 720);
    let gen = grid.gen_data(&camera);
    let aabbs = grid.build_aabbs(&gen);

    let lights: Vec<_> = (0..8)
        .map(|_| PointLight::new(Vec3::new(0.0, 0.0, -3.0), Vec3::ONE, 0.5, 1.0))
        .collect();
    let assignment = assign_lights(&aabbs, &lights, &camera.view_matrix(), 3);

    let cluster = grid.cluster_index_for_fragment(640.0, 360.0, 3.0, &gen) as usize;
    assert_eq!(assignment.lights_for(cluster), &[0, 1, 2]);
    assert!(assignment.grid.iter().all(|entry| entry.count <= 3));
}

#[test]
fn test_zero_lights_leave_counter_at_zero() {
    let mut harness = Harness::new(1280, 720, &RendererConfig::default(), 0);
    assert_eq!(harness.render(), FrameStatus::Presented);
    harness.backend.wait_idle().unwrap();

    let clusters = harness.orchestrator.clusters();
    assert_eq!(clusters.counter(0).read(&harness.backend).unwrap(), vec![0]);
    assert_eq!(harness.scene.point_light_count(), 0);
    harness.finish();
}
