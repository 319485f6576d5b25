//! Window management using winit

use std::collections::HashSet;

use thiserror::Error;
use winit::{
    dpi::PhysicalSize,
    error::{EventLoopError, OsError},
    event::{DeviceEvent, ElementState, Event, KeyEvent, MouseButton, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::scene::CameraMovement;

#[derive(Error, Debug)]
pub enum WindowError {
    #[error("Failed to create window: {0}")]
    Creation(#[from] OsError),
    #[error("Event loop failed: {0}")]
    EventLoop(#[from] EventLoopError),
}

/// Keyboard and mouse state accumulated between frames
#[derive(Debug, Default)]
pub struct InputState {
    held: HashSet<KeyCode>,
    looking: bool,
    mouse_delta: (f32, f32),
}

impl InputState {
    /// Camera moves for the WASD keys currently held
    pub fn movements(&self) -> impl Iterator<Item = CameraMovement> + '_ {
        [
            (KeyCode::KeyW, CameraMovement::Forward),
            (KeyCode::KeyS, CameraMovement::Backward),
            (KeyCode::KeyA, CameraMovement::Left),
            (KeyCode::KeyD, CameraMovement::Right),
        ]
        .into_iter()
        .filter(|(key, _)| self.held.contains(key))
        .map(|(_, movement)| movement)
    }

    /// Mouse motion since the last call while the right button was held
    pub fn take_mouse_delta(&mut self) -> (f32, f32) {
        std::mem::take(&mut self.mouse_delta)
    }

    fn handle_key(&mut self, event: &KeyEvent) {
        if let PhysicalKey::Code(code) = event.physical_key {
            match event.state {
                ElementState::Pressed => {
                    self.held.insert(code);
                }
                ElementState::Released => {
                    self.held.remove(&code);
                }
            }
        }
    }

    fn handle_mouse_motion(&mut self, dx: f64, dy: f64) {
        if self.looking {
            self.mouse_delta.0 += dx as f32;
            self.mouse_delta.1 += dy as f32;
        }
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: WinitWindow,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
    input: InputState,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, WindowError> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)?;
        let size = window.inner_size();

        Ok(Self {
            window,
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
            input: InputState::default(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get current window dimensions; 0 while minimized on some platforms
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    pub fn input(&self) -> &InputState {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut InputState {
        &mut self.input
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput { event, .. } => {
                if event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    self.close_requested = true;
                }
                self.input.handle_key(event);
            }
            WindowEvent::MouseInput {
                state,
                button: MouseButton::Right,
                ..
            } => {
                self.input.looking = *state == ElementState::Pressed;
            }
            WindowEvent::Focused(false) => {
                self.input = InputState::default();
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Pump events into `window` and call `callback` once per loop iteration
/// until it returns `false` or the window is closed.
pub fn run<F>(
    event_loop: EventLoop<()>,
    window: &mut Window,
    mut callback: F,
) -> Result<(), WindowError>
where
    F: FnMut(&mut Window) -> bool,
{
    event_loop.run(move |event, elwt: &EventLoopWindowTarget<()>| {
        elwt.set_control_flow(ControlFlow::Poll);

        match event {
            Event::WindowEvent { event, .. } => {
                window.handle_event(&event);
                if window.should_close() {
                    elwt.exit();
                }
            }
            Event::DeviceEvent {
                event: DeviceEvent::MouseMotion { delta },
                ..
            } => {
                window.input.handle_mouse_motion(delta.0, delta.1);
            }
            Event::AboutToWait => {
                if !callback(window) {
                    elwt.exit();
                    return;
                }
                window.request_redraw();
            }
            _ => {}
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mouse_delta_only_while_looking() {
        let mut input = InputState::default();
        input.handle_mouse_motion(3.0, 4.0);
        assert_eq!(input.take_mouse_delta(), (0.0, 0.0));

        input.looking = true;
        input.handle_mouse_motion(3.0, 4.0);
        input.handle_mouse_motion(1.0, -1.0);
        assert_eq!(input.take_mouse_delta(), (4.0, 3.0));
        assert_eq!(input.take_mouse_delta(), (0.0, 0.0));
    }

    #[test]
    fn test_movements_follow_held_keys() {
        let mut input = InputState::default();
        input.held.insert(KeyCode::KeyW);
        input.held.insert(KeyCode::KeyD);
        let moves: Vec<_> = input.movements().collect();
        assert_eq!(moves, vec![CameraMovement::Forward, CameraMovement::Right]);
    }
}
