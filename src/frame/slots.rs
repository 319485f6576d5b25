//! Frame slot rotation and the per-slot objects the orchestrator owns

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::resources::GpuBuffer;
use crate::scene::GlobalUniforms;

/// Rotates through `frames_in_flight` slots.
///
/// Unlike the stages, the rotation itself holds no fences: each stage waits
/// on its own slot fence before reusing a command list, and the orchestrator
/// waits on the forward fence before touching slot-owned buffers.
///
/// # Example
///
/// ```
/// use clustered_renderer::frame::FrameSlots;
///
/// let mut slots = FrameSlots::new(2);
/// assert_eq!(slots.begin_frame(), 0);
/// slots.end_frame();
/// assert_eq!(slots.begin_frame(), 1);
/// slots.end_frame();
/// assert_eq!(slots.current_slot(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct FrameSlots {
    current_slot: usize,
    frames_in_flight: usize,
    frame_count: u64,
}

impl FrameSlots {
    /// # Panics
    ///
    /// Panics if `frames_in_flight` is 0.
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "frames_in_flight must be at least 1");
        Self {
            current_slot: 0,
            frames_in_flight,
            frame_count: 0,
        }
    }

    /// Start a frame in the current slot and return the slot index
    pub fn begin_frame(&mut self) -> usize {
        self.frame_count += 1;
        log::trace!(
            "Begin frame {} (slot {})",
            self.frame_count,
            self.current_slot
        );
        self.current_slot
    }

    /// Abandon the frame begun last without advancing, as when the surface
    /// turned out to be stale before anything was submitted.
    pub fn cancel_frame(&mut self) {
        log::trace!(
            "Frame {} skipped (slot {})",
            self.frame_count,
            self.current_slot
        );
        self.frame_count -= 1;
    }

    /// Advance to the next slot
    pub fn end_frame(&mut self) {
        log::trace!(
            "End frame {} (slot {})",
            self.frame_count,
            self.current_slot
        );
        self.current_slot = (self.current_slot + 1) % self.frames_in_flight;
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Frames begun and not cancelled
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

/// Synchronization and uniform data owned by one frame slot
#[derive(Debug)]
pub struct FrameSync {
    /// Signaled by acquire, waited on by the depth prepass
    pub image_acquired: SemaphoreHandle,
    pub globals: GpuBuffer<GlobalUniforms>,
}

impl FrameSync {
    pub fn create<B: GraphicsBackend>(backend: &mut B, slot: usize) -> BackendResult<Self> {
        Ok(Self {
            image_acquired: backend.create_semaphore(&format!("image acquired {}", slot))?,
            globals: GpuBuffer::new(
                backend,
                &format!("globals {}", slot),
                1,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            )?,
        })
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        self.globals.destroy(backend);
        backend.destroy_semaphore(self.image_acquired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(feature = "headless")]
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_new() {
        let slots = FrameSlots::new(2);
        assert_eq!(slots.frames_in_flight(), 2);
        assert_eq!(slots.current_slot(), 0);
        assert_eq!(slots.frame_count(), 0);
    }

    #[test]
    #[should_panic(expected = "frames_in_flight must be at least 1")]
    fn test_zero_frames_panics() {
        FrameSlots::new(0);
    }

    #[test]
    fn test_end_frame_wraps() {
        let mut slots = FrameSlots::new(3);
        for expected in [0, 1, 2, 0] {
            assert_eq!(slots.begin_frame(), expected);
            slots.end_frame();
        }
        assert_eq!(slots.frame_count(), 4);
    }

    #[test]
    fn test_cancel_keeps_slot() {
        let mut slots = FrameSlots::new(2);
        slots.begin_frame();
        slots.end_frame();
        assert_eq!(slots.begin_frame(), 1);
        slots.cancel_frame();
        assert_eq!(slots.frame_count(), 1);
        assert_eq!(slots.begin_frame(), 1);
    }

    #[test]
    #[cfg(feature = "headless")]
    fn test_sync_create_and_destroy() {
        let mut backend = HeadlessBackend::default();
        let before = backend.live_objects();
        let sync = FrameSync::create(&mut backend, 0).unwrap();
        assert_eq!(sync.globals.capacity(), 1);
        sync.destroy(&mut backend);
        assert_eq!(backend.live_objects(), before);
    }
}
