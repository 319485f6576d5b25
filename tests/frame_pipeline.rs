//! Frame orchestration tests on the headless backend.
//!
//! The headless backend keeps submitted work pending until a fence covering
//! it is waited on, so frame lag, semaphore order and resource lifetimes
//! across surface rebuilds are all observable here.

mod common;

use rstest::rstest;

use clustered_renderer::backend::headless::{RecordedCommand, SubmissionRecord};
use clustered_renderer::backend::{GraphicsBackend, PipelineStage, PresentOutcome};
use clustered_renderer::resources::{Material, MaterialSlot, Mesh, TextureData};
use clustered_renderer::scene::Transform;
use clustered_renderer::{FrameStatus, RendererConfig};
use common::Harness;
use glam::Vec3;

const DEPTH: &str = "depth prepass";
const CULL: &str = "cluster culling";
const FORWARD: &str = "forward lighting";

fn stage_submissions<'a>(
    records: &'a [SubmissionRecord],
    label: &str,
) -> Vec<&'a SubmissionRecord> {
    records
        .iter()
        .filter(|record| record.command_lists.iter().any(|l| l == label))
        .collect()
}

// ============================================================================
// Frame Overlap
// ============================================================================

#[rstest]
#[case::single(1)]
#[case::double(2)]
#[case::triple(3)]
fn test_frame_lag_bounded_by_frames_in_flight(#[case] frames_in_flight: u32) {
    let config = RendererConfig::default().with_frames_in_flight(frames_in_flight);
    let mut harness = Harness::new(640, 480, &config, 4);

    for _ in 0..8 {
        assert_eq!(harness.render(), FrameStatus::Presented);
    }

    for label in [DEPTH, CULL, FORWARD] {
        assert_eq!(
            harness.backend.max_pending(label),
            frames_in_flight as usize,
            "{} lag",
            label
        );
    }
    assert_eq!(harness.orchestrator.frame_count(), 8);
    assert_eq!(harness.backend.presented_frames(), 8);
    harness.finish();
}

#[test]
fn test_slots_rotate() {
    let config = RendererConfig::default().with_frames_in_flight(3);
    let mut harness = Harness::new(640, 480, &config, 1);

    let slots: Vec<_> = (0..6)
        .map(|_| {
            harness.render();
            harness.orchestrator.current_slot()
        })
        .collect();
    assert_eq!(slots, vec![1, 2, 0, 1, 2, 0]);
    harness.finish();
}

// ============================================================================
// Scene Changes
// ============================================================================

#[test]
fn test_content_added_after_first_frame_is_drawn() {
    let config = RendererConfig::default().with_frames_in_flight(2);
    let mut harness = Harness::new(640, 480, &config, 2);
    harness.render();
    assert_eq!(harness.scene.draw_items().len(), 2);

    let sphere = harness.scene.add_mesh(Mesh::sphere(8, 4));
    let texture = harness
        .scene
        .add_texture(TextureData::checkerboard(4, [255; 4], [0, 0, 0, 255]));
    let material = harness
        .scene
        .add_material(Material::plastic(Vec3::X).with_texture(MaterialSlot::Albedo, texture))
        .unwrap();
    harness
        .scene
        .add_object(sphere, material, Transform::from_position(Vec3::new(1.0, 0.0, -3.0)))
        .unwrap();
    assert!(harness.scene.has_pending_uploads());

    assert_eq!(harness.render(), FrameStatus::Presented);
    assert!(!harness.scene.has_pending_uploads());
    assert_eq!(harness.scene.draw_items().len(), 3);

    // Second frame ran in slot 1
    let forward = harness.backend.command_lists_labeled(FORWARD)[1];
    let draws = harness
        .backend
        .recorded_commands(forward)
        .unwrap()
        .iter()
        .filter(|command| matches!(command, RecordedCommand::DrawIndexed { .. }))
        .count();
    assert_eq!(draws, 3);
    harness.finish();
}

// ============================================================================
// Synchronization
// ============================================================================

#[test]
fn test_stages_chained_by_semaphores() {
    let config = RendererConfig::default().with_frames_in_flight(2);
    let mut harness = Harness::new(640, 480, &config, 4);
    harness.render();
    harness.render();

    let records = harness.backend.submissions();
    let depth = stage_submissions(records, DEPTH);
    let cull = stage_submissions(records, CULL);
    let forward = stage_submissions(records, FORWARD);
    assert_eq!((depth.len(), cull.len(), forward.len()), (2, 2, 2));

    for (frame, slot) in [(0, 0), (1, 1)] {
        assert_eq!(
            depth[frame].waits,
            vec![(
                format!("image acquired {}", slot),
                PipelineStage::EARLY_FRAGMENT_TESTS
            )]
        );
        assert_eq!(depth[frame].signals, vec![format!("{} complete", DEPTH)]);

        assert_eq!(
            cull[frame].waits,
            vec![(format!("{} complete", DEPTH), PipelineStage::COMPUTE_SHADER)]
        );
        assert_eq!(cull[frame].signals, vec![format!("{} complete", CULL)]);

        assert_eq!(forward[frame].waits.len(), 1);
        assert_eq!(forward[frame].waits[0].0, format!("{} complete", CULL));
        assert!(forward[frame]
            .waits[0]
            .1
            .contains(PipelineStage::FRAGMENT_SHADER));
        assert_eq!(forward[frame].signals, vec![format!("{} complete", FORWARD)]);
    }

    // Queue order within a frame follows the chain
    let position = |label: &str| {
        records
            .iter()
            .position(|record| record.command_lists.iter().any(|l| l == label))
    };
    assert!(position(DEPTH) < position(CULL));
    assert!(position(CULL) < position(FORWARD));
    harness.finish();
}

#[test]
fn test_every_stage_submission_is_fenced() {
    let mut harness = Harness::new(640, 480, &RendererConfig::default(), 2);
    harness.render();

    for label in [DEPTH, CULL, FORWARD] {
        for record in stage_submissions(harness.backend.submissions(), label) {
            assert_eq!(record.fence.as_deref(), Some(label));
        }
    }
    harness.finish();
}

// ============================================================================
// Surface Changes
// ============================================================================

#[test]
fn test_out_of_date_surface_rebuilds_without_leaks() {
    let config = RendererConfig::default().with_frames_in_flight(2);
    let mut harness = Harness::new(640, 480, &config, 4);
    for _ in 0..3 {
        harness.render();
    }
    let steady = harness.backend.live_objects();
    let generation = harness.backend.swapchain_generation();

    harness.backend.resize_surface(800, 600);
    assert_eq!(harness.render(), FrameStatus::Skipped);
    assert_eq!(harness.orchestrator.frame_count(), 3);
    assert_eq!(harness.orchestrator.extent(), (800, 600));
    assert_eq!(harness.camera.viewport_size(), (800, 600));
    assert_eq!(harness.backend.swapchain_generation(), generation + 1);

    for _ in 0..3 {
        assert_eq!(harness.render(), FrameStatus::Presented);
    }
    assert_eq!(harness.backend.live_objects(), steady);
    assert_eq!(
        harness.orchestrator.clusters().gen_data().map(|gen| gen.screen_width),
        Some(800)
    );
    harness.finish();
}

#[test]
fn test_out_of_date_present_rebuilds_after_frame() {
    let mut harness = Harness::new(640, 480, &RendererConfig::default(), 2);
    harness.render();
    let generation = harness.backend.swapchain_generation();
    let cluster_generation = harness.orchestrator.clusters().generation();

    harness.backend.script_present(PresentOutcome::OutOfDate);
    assert_eq!(harness.render(), FrameStatus::Presented);
    assert_eq!(harness.backend.swapchain_generation(), generation + 1);
    assert_eq!(
        harness.orchestrator.clusters().generation(),
        cluster_generation + 1
    );
    assert_eq!(harness.backend.pending_command_lists(), 0);

    assert_eq!(harness.render(), FrameStatus::Presented);
    harness.finish();
}

#[test]
fn test_notified_resize_applies_at_next_frame() {
    let mut harness = Harness::new(640, 480, &RendererConfig::default(), 2);
    harness.render();

    harness.backend.resize_surface(1024, 768);
    harness.orchestrator.notify_resized(1024, 768);
    assert_eq!(harness.render(), FrameStatus::Skipped);
    assert_eq!(harness.render(), FrameStatus::Presented);
    assert_eq!(harness.orchestrator.extent(), (1024, 768));
    harness.finish();
}

#[test]
fn test_minimized_surface_skips_until_restored() {
    let mut harness = Harness::new(640, 480, &RendererConfig::default(), 2);
    harness.render();
    harness.backend.wait_idle().unwrap();
    harness.backend.clear_submissions();

    harness.backend.resize_surface(0, 0);
    harness.orchestrator.notify_resized(0, 0);
    for _ in 0..3 {
        assert_eq!(harness.render(), FrameStatus::Skipped);
    }
    assert!(harness.backend.submissions().is_empty());
    assert_eq!(harness.orchestrator.frame_count(), 1);

    harness.backend.resize_surface(640, 480);
    harness.orchestrator.notify_resized(640, 480);
    let statuses: Vec<_> = (0..2).map(|_| harness.render()).collect();
    assert!(statuses.contains(&FrameStatus::Presented));
    assert_eq!(harness.orchestrator.extent(), (640, 480));
    harness.finish();
}
