// Renderer selection
//
// Higher layers hold a `Box<dyn GraphicsBackend>` chosen once at startup.
// Vulkan is the only backend this crate ships.

use anyhow::Result;
use glam::Mat4;
use std::rc::Rc;

use crate::backend::caps::{Capabilities, PixelFormat, RendererInfo};
use crate::backend::state::{BlendState, Color, ColorChannelMask, RenderState, ScissorRect, Winding};
use crate::backend::{
    BackendSettings, BatchedDrawRequest, DrawCommand, DrawIndexedCommand, FrameStats, Gpu,
    Graphics, Shader, Texture, Vsync, VulkanGpu,
};
use crate::backend::vertex::{BufferBindings, VertexAttributes};
use crate::window::WindowHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererKind {
    Vulkan,
}

impl RendererKind {
    pub fn name(self) -> &'static str {
        match self {
            RendererKind::Vulkan => "Vulkan",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "vulkan" => Some(RendererKind::Vulkan),
            _ => None,
        }
    }
}

/// Graphics backend interface used by the drawing layer
pub trait GraphicsBackend {
    fn name(&self) -> &'static str;

    #[allow(clippy::too_many_arguments)]
    fn set_mode(
        &mut self,
        window: &dyn WindowHost,
        width: u32,
        height: u32,
        pixel_width: u32,
        pixel_height: u32,
        backbuffer_stencil: bool,
        msaa: u32,
    ) -> Result<()>;
    fn unset_mode(&mut self);
    fn is_created(&self) -> bool;
    fn set_active(&mut self, enable: bool) -> Result<()>;
    fn set_viewport_size(&mut self, width: u32, height: u32, pixel_width: u32, pixel_height: u32);
    fn set_vsync(&mut self, vsync: Vsync);
    fn present(&mut self) -> Result<()>;

    fn clear(&mut self, color: Option<Color>, stencil: Option<i32>, depth: Option<f64>) -> Result<()>;
    fn clear_targets(&mut self, colors: &[Option<Color>], stencil: Option<i32>, depth: Option<f64>) -> Result<()>;
    fn draw(&mut self, cmd: &DrawCommand) -> Result<()>;
    fn draw_indexed(&mut self, cmd: &DrawIndexedCommand) -> Result<()>;
    fn draw_quads(
        &mut self,
        start: u32,
        count: u32,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        texture: Option<&dyn Texture>,
    ) -> Result<()>;
    fn request_batched_draw(&mut self, request: BatchedDrawRequest) -> Result<()>;
    fn flush_batched_draws(&mut self) -> Result<()>;
    fn set_render_target(&mut self, target: Option<&dyn Texture>) -> Result<()>;

    fn state(&self) -> &RenderState;
    fn set_color(&mut self, color: Color);
    fn set_scissor(&mut self, rect: Option<ScissorRect>) -> Result<()>;
    fn set_blend_state(&mut self, blend: BlendState) -> Result<()>;
    fn set_wireframe(&mut self, enable: bool) -> Result<()>;
    fn set_color_mask(&mut self, mask: ColorChannelMask) -> Result<()>;
    fn set_front_face_winding(&mut self, winding: Winding) -> Result<()>;
    fn set_point_size(&mut self, size: f32) -> Result<()>;
    fn push_state(&mut self) -> Result<()>;
    fn pop_state(&mut self) -> Result<()>;

    fn set_shader(&mut self, shader: Rc<dyn Shader>);
    fn set_default_texture(&mut self, texture: Rc<dyn Texture>);
    fn set_transform(&mut self, transform: Mat4);

    fn capabilities(&self) -> Option<&Capabilities>;
    fn renderer_info(&self) -> Option<&RendererInfo>;
    fn sized_format(&self, format: PixelFormat) -> PixelFormat;
    fn is_pixel_format_supported(&self, format: PixelFormat) -> bool;
    fn stats(&self) -> FrameStats;
}

impl<G: Gpu> GraphicsBackend for Graphics<G> {
    fn name(&self) -> &'static str {
        Graphics::name(self)
    }

    fn set_mode(
        &mut self,
        window: &dyn WindowHost,
        width: u32,
        height: u32,
        pixel_width: u32,
        pixel_height: u32,
        backbuffer_stencil: bool,
        msaa: u32,
    ) -> Result<()> {
        Graphics::set_mode(self, window, width, height, pixel_width, pixel_height, backbuffer_stencil, msaa)
    }

    fn unset_mode(&mut self) {
        Graphics::unset_mode(self)
    }

    fn is_created(&self) -> bool {
        Graphics::is_created(self)
    }

    fn set_active(&mut self, enable: bool) -> Result<()> {
        Graphics::set_active(self, enable)
    }

    fn set_viewport_size(&mut self, width: u32, height: u32, pixel_width: u32, pixel_height: u32) {
        Graphics::set_viewport_size(self, width, height, pixel_width, pixel_height)
    }

    fn set_vsync(&mut self, vsync: Vsync) {
        Graphics::set_vsync(self, vsync)
    }

    fn present(&mut self) -> Result<()> {
        Graphics::present(self)
    }

    fn clear(&mut self, color: Option<Color>, stencil: Option<i32>, depth: Option<f64>) -> Result<()> {
        Graphics::clear(self, color, stencil, depth)
    }

    fn clear_targets(&mut self, colors: &[Option<Color>], stencil: Option<i32>, depth: Option<f64>) -> Result<()> {
        Graphics::clear_targets(self, colors, stencil, depth)
    }

    fn draw(&mut self, cmd: &DrawCommand) -> Result<()> {
        Graphics::draw(self, cmd)
    }

    fn draw_indexed(&mut self, cmd: &DrawIndexedCommand) -> Result<()> {
        Graphics::draw_indexed(self, cmd)
    }

    fn draw_quads(
        &mut self,
        start: u32,
        count: u32,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        texture: Option<&dyn Texture>,
    ) -> Result<()> {
        Graphics::draw_quads(self, start, count, attributes, buffers, texture)
    }

    fn request_batched_draw(&mut self, request: BatchedDrawRequest) -> Result<()> {
        Graphics::request_batched_draw(self, request)
    }

    fn flush_batched_draws(&mut self) -> Result<()> {
        Graphics::flush_batched_draws(self)
    }

    fn set_render_target(&mut self, target: Option<&dyn Texture>) -> Result<()> {
        Graphics::set_render_target(self, target)
    }

    fn state(&self) -> &RenderState {
        Graphics::state(self)
    }

    fn set_color(&mut self, color: Color) {
        Graphics::set_color(self, color)
    }

    fn set_scissor(&mut self, rect: Option<ScissorRect>) -> Result<()> {
        Graphics::set_scissor(self, rect)
    }

    fn set_blend_state(&mut self, blend: BlendState) -> Result<()> {
        Graphics::set_blend_state(self, blend)
    }

    fn set_wireframe(&mut self, enable: bool) -> Result<()> {
        Graphics::set_wireframe(self, enable)
    }

    fn set_color_mask(&mut self, mask: ColorChannelMask) -> Result<()> {
        Graphics::set_color_mask(self, mask)
    }

    fn set_front_face_winding(&mut self, winding: Winding) -> Result<()> {
        Graphics::set_front_face_winding(self, winding)
    }

    fn set_point_size(&mut self, size: f32) -> Result<()> {
        Graphics::set_point_size(self, size)
    }

    fn push_state(&mut self) -> Result<()> {
        Graphics::push_state(self)
    }

    fn pop_state(&mut self) -> Result<()> {
        Graphics::pop_state(self)
    }

    fn set_shader(&mut self, shader: Rc<dyn Shader>) {
        Graphics::set_shader(self, shader)
    }

    fn set_default_texture(&mut self, texture: Rc<dyn Texture>) {
        Graphics::set_default_texture(self, texture)
    }

    fn set_transform(&mut self, transform: Mat4) {
        Graphics::set_transform(self, transform)
    }

    fn capabilities(&self) -> Option<&Capabilities> {
        Graphics::capabilities(self)
    }

    fn renderer_info(&self) -> Option<&RendererInfo> {
        Graphics::renderer_info(self)
    }

    fn sized_format(&self, format: PixelFormat) -> PixelFormat {
        Graphics::sized_format(self, format)
    }

    fn is_pixel_format_supported(&self, format: PixelFormat) -> bool {
        Graphics::is_pixel_format_supported(self, format)
    }

    fn stats(&self) -> FrameStats {
        Graphics::stats(self)
    }
}

/// Construct a backend for `G`, checking first that its API can be loaded
fn build<G: Gpu>(settings: BackendSettings) -> Result<Box<dyn GraphicsBackend>> {
    G::probe()?;
    Ok(Box::new(Graphics::<G>::new(settings)))
}

/// Report a construction failure upward instead of aborting the host
fn guarded(
    kind: RendererKind,
    build: impl FnOnce() -> Result<Box<dyn GraphicsBackend>>,
) -> Option<Box<dyn GraphicsBackend>> {
    match build() {
        Ok(backend) => {
            log::info!("Created {} renderer", kind.name());
            Some(backend)
        }
        Err(err) => {
            log::error!("Cannot create {} renderer: {:#}", kind.name(), err);
            None
        }
    }
}

pub fn create_instance(kind: RendererKind, settings: BackendSettings) -> Option<Box<dyn GraphicsBackend>> {
    match kind {
        RendererKind::Vulkan => guarded(kind, || build::<VulkanGpu>(settings)),
    }
}

/// First renderer in `preference` that can be created
pub fn create_first(preference: &[RendererKind], settings: &BackendSettings) -> Option<Box<dyn GraphicsBackend>> {
    preference
        .iter()
        .find_map(|&kind| create_instance(kind, settings.clone()))
}
