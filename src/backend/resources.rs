// Texture and shader collaborators
//
// The backend only needs a narrow view of these objects: handles to bind,
// pipeline stages, and a way to push per-draw uniform and descriptor data.

use anyhow::Result;
use ash::vk;

use super::cache::ShaderId;
use super::caps::PixelFormat;
use super::uniforms::BuiltinUniformData;

pub trait Texture {
    fn image(&self) -> vk::Image;

    /// View used as a color attachment; `None` unless the texture is a
    /// render target
    fn render_target_view(&self) -> Option<vk::ImageView>;

    fn pixel_format(&self) -> PixelFormat;

    fn pixel_size(&self) -> (u32, u32);
}

pub trait Shader {
    fn id(&self) -> ShaderId;

    fn stages(&self) -> &[vk::PipelineShaderStageCreateInfo];

    fn pipeline_layout(&self) -> vk::PipelineLayout;

    fn set_uniform_data(&self, data: &BuiltinUniformData);

    fn set_main_texture(&self, texture: &dyn Texture);

    /// Record descriptor updates for `frame` into `cb`
    fn cmd_push_descriptor_sets(&self, cb: vk::CommandBuffer, frame: usize) -> Result<()>;
}
