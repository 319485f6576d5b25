//! Window-facing renderer: Vulkan backend, scene, camera and frame orchestrator

use std::time::Instant;

use thiserror::Error;
use winit::event_loop::EventLoop;

use crate::backend::{BackendError, BackendResult, VulkanBackend};
use crate::config::RendererConfig;
use crate::frame::{FrameOrchestrator, FrameStatus};
use crate::scene::{Camera, Scene};
use crate::window::{self, Window, WindowError};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// The renderer bound to a window
///
/// Field order is teardown order: GPU objects owned by the orchestrator and
/// the scene are released explicitly before the backend drops.
pub struct Engine {
    orchestrator: Option<FrameOrchestrator>,
    scene: Scene,
    camera: Camera,
    backend: VulkanBackend,
    last_frame: Instant,
}

impl Engine {
    /// Create the backend for `window` and build every stage
    pub fn new(window: &Window, config: &RendererConfig, scene: Scene) -> BackendResult<Self> {
        config.validate()?;
        let mut backend = VulkanBackend::new(window.window(), config.vsync)?;
        let orchestrator = FrameOrchestrator::new(&mut backend, config)?;

        let camera = Camera::default().with_projection(
            config.camera_fov_degrees,
            config.camera_near,
            config.camera_far,
        );

        Ok(Self {
            orchestrator: Some(orchestrator),
            scene,
            camera,
            backend,
            last_frame: Instant::now(),
        })
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    /// Light edits made here are uploaded before the next frame
    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn orchestrator(&self) -> Option<&FrameOrchestrator> {
        self.orchestrator.as_ref()
    }

    /// Apply window input and resizes, then render one frame
    pub fn frame(&mut self, window: &mut Window) -> BackendResult<FrameStatus> {
        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        let orchestrator = self
            .orchestrator
            .as_mut()
            .ok_or_else(|| BackendError::InvalidHandle("engine already shut down".to_string()))?;

        if window.was_resized() {
            let (width, height) = window.dimensions();
            orchestrator.notify_resized(width, height);
            window.clear_resize_flag();
        }

        for movement in window.input().movements() {
            self.camera.translate(movement, delta_time);
        }
        let (dx, dy) = window.input_mut().take_mouse_delta();
        if dx != 0.0 || dy != 0.0 {
            self.camera.pan(dx, -dy, true);
        }

        orchestrator.render_frame(&mut self.backend, &mut self.scene, &mut self.camera)
    }

    /// Release every GPU object the renderer created. Idempotent.
    pub fn shutdown(&mut self) -> BackendResult<()> {
        if let Some(mut orchestrator) = self.orchestrator.take() {
            orchestrator.destroy(&mut self.backend)?;
            self.scene.destroy(&mut self.backend);
            log::info!("Renderer shut down after {} frames", orchestrator.frame_count());
        }
        Ok(())
    }

    /// Open a window, build the renderer around the scene `setup` returns
    /// and run until the window closes.
    pub fn run<F>(config: RendererConfig, setup: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Camera) -> BackendResult<Scene>,
    {
        let event_loop = EventLoop::new().map_err(WindowError::from)?;
        let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;

        let mut camera = Camera::default().with_projection(
            config.camera_fov_degrees,
            config.camera_near,
            config.camera_far,
        );
        let scene = setup(&mut camera)?;
        let mut engine = Engine::new(&window, &config, scene)?;
        engine.camera = camera;

        let mut failure = None;
        window::run(event_loop, &mut window, |window| match engine.frame(window) {
            Ok(FrameStatus::Presented) => true,
            Ok(FrameStatus::Skipped) => {
                log::trace!("Frame skipped");
                true
            }
            Err(e) => {
                log::error!("Frame failed: {}", e);
                failure = Some(e);
                false
            }
        })?;

        engine.shutdown()?;
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Failed to release renderer resources: {}", e);
        }
    }
}
