//! Resource management
//!
//! GPU-facing resources: typed buffers, meshes, textures, materials, render
//! targets and per-frame slot storage.

mod buffer;
mod material;
mod mesh;
mod per_frame;
mod render_target;
mod texture;

pub use buffer::*;
pub use material::*;
pub use mesh::*;
pub use per_frame::*;
pub use render_target::*;
pub use texture::*;
