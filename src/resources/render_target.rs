//! Render targets and the size-dependent attachments they share

use crate::backend::traits::*;
use crate::backend::types::*;

/// Render pass plus the framebuffers built against it.
///
/// A target starts without framebuffers; [`RenderTarget::rebuild`] creates
/// them for a given extent and is called again on every resize.
#[derive(Debug)]
pub struct RenderTarget {
    layout: RenderPassLayout,
    render_pass: RenderPassHandle,
    framebuffers: Vec<FramebufferHandle>,
    extent: (u32, u32),
}

impl RenderTarget {
    /// Create the render pass. Pipelines may be built against it right away.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        layout: RenderPassLayout,
    ) -> BackendResult<Self> {
        let render_pass = backend.create_render_pass(&layout)?;
        log::debug!("Created render pass {:?}", layout.label);
        Ok(Self {
            layout,
            render_pass,
            framebuffers: Vec::new(),
            extent: (0, 0),
        })
    }

    /// Tear down the framebuffers and render pass and recreate both, one
    /// framebuffer per attachment list. Pipelines created against an earlier
    /// pass stay usable since the layout is unchanged.
    pub fn rebuild<B: GraphicsBackend>(
        &mut self,
        backend: &mut B,
        extent: (u32, u32),
        attachments: &[Vec<TextureViewHandle>],
    ) -> BackendResult<()> {
        self.destroy_framebuffers(backend);
        backend.destroy_render_pass(self.render_pass);
        self.render_pass = backend.create_render_pass(&self.layout)?;

        for (index, views) in attachments.iter().enumerate() {
            let framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
                label: self
                    .layout
                    .label
                    .as_ref()
                    .map(|label| format!("{} framebuffer {}", label, index)),
                render_pass: self.render_pass,
                attachments: views.clone(),
                width: extent.0,
                height: extent.1,
            })?;
            self.framebuffers.push(framebuffer);
        }
        self.extent = extent;
        log::debug!(
            "Rebuilt {:?} with {} framebuffers at {}x{}",
            self.layout.label,
            self.framebuffers.len(),
            extent.0,
            extent.1
        );
        Ok(())
    }

    pub fn layout(&self) -> &RenderPassLayout {
        &self.layout
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Whether framebuffers exist
    pub fn is_ready(&self) -> bool {
        !self.framebuffers.is_empty()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, index: usize) -> BackendResult<FramebufferHandle> {
        self.framebuffers.get(index).copied().ok_or_else(|| {
            BackendError::InvalidHandle(format!(
                "{:?} has no framebuffer {}",
                self.layout.label, index
            ))
        })
    }

    /// Begin info with one clear value per attachment
    pub fn begin_info(
        &self,
        framebuffer: usize,
        clear_values: Vec<ClearValue>,
    ) -> BackendResult<RenderPassBeginInfo> {
        Ok(RenderPassBeginInfo {
            render_pass: self.render_pass,
            framebuffer: self.framebuffer(framebuffer)?,
            width: self.extent.0,
            height: self.extent.1,
            clear_values,
        })
    }

    fn destroy_framebuffers<B: GraphicsBackend>(&mut self, backend: &mut B) {
        for framebuffer in self.framebuffers.drain(..) {
            backend.destroy_framebuffer(framebuffer);
        }
    }

    pub fn destroy<B: GraphicsBackend>(&mut self, backend: &mut B) {
        self.destroy_framebuffers(backend);
        backend.destroy_render_pass(self.render_pass);
    }
}

/// Size-dependent attachments shared between passes: the depth buffer the
/// prepass writes and the forward pass tests against, and the multisampled
/// color buffer the forward pass resolves into the swapchain.
#[derive(Debug)]
pub struct SharedAttachments {
    pub depth: TextureHandle,
    pub depth_view: TextureViewHandle,
    pub msaa_color: Option<(TextureHandle, TextureViewHandle)>,
    pub depth_format: TextureFormat,
    pub color_format: TextureFormat,
    pub samples: u32,
    pub extent: (u32, u32),
}

impl SharedAttachments {
    pub fn create<B: GraphicsBackend>(
        backend: &mut B,
        extent: (u32, u32),
        depth_format: TextureFormat,
        color_format: TextureFormat,
        samples: u32,
    ) -> BackendResult<Self> {
        let depth = backend.create_texture(&TextureDescriptor {
            label: Some("scene depth".into()),
            width: extent.0,
            height: extent.1,
            sample_count: samples,
            format: depth_format,
            usage: TextureUsage::RENDER_ATTACHMENT,
            ..Default::default()
        })?;
        let depth_view = backend.create_texture_view(depth)?;

        let msaa_color = if samples > 1 {
            let color = backend.create_texture(&TextureDescriptor {
                label: Some("msaa color".into()),
                width: extent.0,
                height: extent.1,
                sample_count: samples,
                format: color_format,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TRANSIENT,
                ..Default::default()
            })?;
            Some((color, backend.create_texture_view(color)?))
        } else {
            None
        };

        log::debug!(
            "Created shared attachments {}x{} ({:?}, {} samples)",
            extent.0,
            extent.1,
            depth_format,
            samples
        );
        Ok(Self {
            depth,
            depth_view,
            msaa_color,
            depth_format,
            color_format,
            samples,
            extent,
        })
    }

    pub fn destroy<B: GraphicsBackend>(&self, backend: &mut B) {
        if let Some((texture, view)) = self.msaa_color {
            backend.destroy_texture_view(view);
            backend.destroy_texture(texture);
        }
        backend.destroy_texture_view(self.depth_view);
        backend.destroy_texture(self.depth);
    }
}
