//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait together with a Vulkan
//! implementation for real devices and, behind the default `headless`
//! feature, a simulated one for tests.

#[cfg(feature = "headless")]
pub mod headless;
pub mod shader;
pub mod traits;
pub mod types;
pub mod vulkan;

#[cfg(feature = "headless")]
pub use headless::HeadlessBackend;
pub use traits::*;
pub use types::*;
pub use vulkan::VulkanBackend;
