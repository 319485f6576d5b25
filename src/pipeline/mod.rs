//! Clustered forward rendering pipeline
//!
//! Three stages run each frame, chained on the GPU by semaphores:
//!
//! ```text
//! acquire ──► depth prepass ──► cluster light culling ──► forward lighting ──► present
//!             (depth buffer)    (light grid + indices)     (swapchain image)
//! ```
//!
//! Every stage keeps one [`StageFrame`] per frame-in-flight slot: a command
//! list, a fence guarding its reuse and the semaphore it signals on
//! completion.

pub mod cluster;
pub mod depth_prepass;
pub mod forward_pass;

pub use cluster::ClusterBuilder;
pub use depth_prepass::DepthPrepassStage;
pub use forward_pass::ForwardLightingStage;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Life cycle of a stage within a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Pipelines exist but framebuffers or input buffers do not
    Uninitialized,
    /// Ready to record
    Ready,
    Recording,
    /// Work submitted; the slot's fence guards the next reuse
    Submitted,
}

/// Per-slot submission resources of a stage
#[derive(Debug)]
pub struct StageFrame {
    pub command_list: CommandListHandle,
    pub fence: FenceHandle,
    pub complete: SemaphoreHandle,
}

impl StageFrame {
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        queue: QueueKind,
    ) -> BackendResult<Self> {
        Ok(Self {
            command_list: backend.create_command_list(label, queue)?,
            // Signaled so the first wait returns immediately
            fence: backend.create_fence(label, true)?,
            complete: backend.create_semaphore(&format!("{} complete", label))?,
        })
    }

    /// Wait for the slot's previous submission, then start recording
    pub fn begin<B: GraphicsBackend>(&self, backend: &mut B) -> BackendResult<CommandListHandle> {
        backend.wait_fence(self.fence)?;
        backend.begin_command_list(self.command_list)?;
        Ok(self.command_list)
    }

    /// Finish recording and submit, signaling the completion semaphore.
    pub fn submit<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        waits: &[SemaphoreWait],
    ) -> BackendResult<SemaphoreHandle> {
        backend.end_command_list(self.command_list)?;
        backend.reset_fence(self.fence)?;
        backend.submit(&Submission {
            command_lists: vec![self.command_list],
            waits: waits.to_vec(),
            signals: vec![self.complete],
            fence: Some(self.fence),
        })?;
        Ok(self.complete)
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        backend.destroy_semaphore(self.complete);
        backend.destroy_fence(self.fence);
        backend.destroy_command_list(self.command_list);
    }
}

/// WGSL declarations shared by every stage
pub(crate) const COMMON_WGSL: &str = r#"
struct Globals {
    view: mat4x4<f32>,
    projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    near: f32,
    far: f32,
    point_light_count: u32,
    _pad: u32,
}

struct PointLight {
    position_radius: vec4<f32>,
    color_intensity: vec4<f32>,
}

struct ClusterGenData {
    inverse_projection: mat4x4<f32>,
    tile_size_px: vec2<u32>,
    screen_width: u32,
    screen_height: u32,
    grid_size: vec4<u32>,
    slice_scaling_factor: f32,
    slice_bias_factor: f32,
    z_near: f32,
    z_far: f32,
}

struct LightGridEntry {
    count: u32,
    offset: u32,
}
"#;

/// Prefix `body` with the shared declarations
pub(crate) fn shader_source(body: &str) -> String {
    format!("{}{}", COMMON_WGSL, body)
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_stage_frame_round_trip() {
        let mut backend = HeadlessBackend::default();
        let frame = StageFrame::create(&mut backend, "stage", QueueKind::Graphics).unwrap();

        for _ in 0..3 {
            frame.begin(&mut backend).unwrap();
            let complete = frame.submit(&mut backend, &[]).unwrap();
            // Consume the signal like the next stage would
            let consumer = backend
                .create_command_list("consumer", QueueKind::Graphics)
                .unwrap();
            backend.begin_command_list(consumer).unwrap();
            backend.end_command_list(consumer).unwrap();
            backend
                .submit(&Submission {
                    command_lists: vec![consumer],
                    waits: vec![SemaphoreWait {
                        semaphore: complete,
                        stage: PipelineStage::TOP_OF_PIPE,
                    }],
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(backend.max_pending("stage"), 1);
        assert_eq!(backend.submissions().len(), 6);

        backend.wait_idle().unwrap();
        frame.destroy(&mut backend);
    }
}
