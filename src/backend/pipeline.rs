// Render pass, framebuffer, graphics pipeline and sampler creation
//
// Builds the ash create-infos for every cached object from its key. Only
// single color attachment passes exist; there is no depth/stencil state.

use ash::prelude::VkResult;
use ash::vk;

use super::cache::{FramebufferKey, RenderPassKey, SamplerKey};
use super::gpu::PipelineDesc;

/// Create a render pass for one color attachment. Contents are loaded and
/// stored so a target can be resumed after switching away from it; the
/// attachment stays in COLOR_ATTACHMENT_OPTIMAL across the pass.
pub fn create_render_pass(device: &ash::Device, key: &RenderPassKey) -> VkResult<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(key.color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let color_attachments = &[color_attachment_ref];
    let subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(color_attachments)
        .build();

    let dependency = vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
        .build();

    let attachments = &[color_attachment];
    let subpasses = &[subpass];
    let dependencies = &[dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(attachments)
        .subpasses(subpasses)
        .dependencies(dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }
}

pub fn create_framebuffer(device: &ash::Device, key: &FramebufferKey) -> VkResult<vk::Framebuffer> {
    let attachments = &[key.image_view];
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(key.render_pass)
        .attachments(attachments)
        .width(key.width)
        .height(key.height)
        .layers(1);

    unsafe { device.create_framebuffer(&framebuffer_info, None) }
}

pub fn create_graphics_pipeline(device: &ash::Device, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
    let key = desc.key;

    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&desc.vertex_input.bindings)
        .vertex_attribute_descriptions(&desc.vertex_input.attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(key.primitive.to_vk())
        .primitive_restart_enable(false);

    let (viewport_width, viewport_height) = key.viewport;
    let viewport = vk::Viewport::builder()
        .x(0.0)
        .y(0.0)
        .width(viewport_width as f32)
        .height(viewport_height as f32)
        .min_depth(0.0)
        .max_depth(1.0)
        .build();

    let scissor = match key.scissor {
        Some(rect) => vk::Rect2D {
            offset: vk::Offset2D { x: rect.x, y: rect.y },
            extent: vk::Extent2D {
                width: rect.w.max(0) as u32,
                height: rect.h.max(0) as u32,
            },
        },
        None => vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: viewport_width,
                height: viewport_height,
            },
        },
    };

    let viewports = &[viewport];
    let scissors = &[scissor];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(viewports)
        .scissors(scissors);

    let polygon_mode = if key.wireframe {
        vk::PolygonMode::LINE
    } else {
        vk::PolygonMode::FILL
    };

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(polygon_mode)
        .line_width(1.0)
        .cull_mode(key.cull_mode.to_vk())
        .front_face(key.winding.to_vk())
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1)
        .min_sample_shading(1.0);

    let blend = key.blend;
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(key.color_mask.to_vk())
        .blend_enable(blend.enable)
        .src_color_blend_factor(blend.src_rgb.to_vk())
        .dst_color_blend_factor(blend.dst_rgb.to_vk())
        .color_blend_op(blend.op_rgb.to_vk())
        .src_alpha_blend_factor(blend.src_alpha.to_vk())
        .dst_alpha_blend_factor(blend.dst_alpha.to_vk())
        .alpha_blend_op(blend.op_alpha.to_vk())
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .logic_op(vk::LogicOp::COPY)
        .attachments(color_blend_attachments);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(desc.stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(desc.layout)
        .render_pass(key.render_pass)
        .subpass(0)
        .base_pipeline_index(-1)
        .build();

    let pipelines = unsafe {
        device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)?
    };

    Ok(pipelines[0])
}

/// Anisotropic filtering is only switched on above 1x
pub fn sampler_anisotropy(key: &SamplerKey) -> (bool, f32) {
    let max = key.max_anisotropy.max(1) as f32;
    (max > 1.0, max)
}

pub fn create_sampler(device: &ash::Device, key: &SamplerKey) -> VkResult<vk::Sampler> {
    let (anisotropy_enable, max_anisotropy) = sampler_anisotropy(key);
    let (compare_enable, compare_op) = match key.depth_compare {
        Some(mode) => (true, mode.to_vk()),
        None => (false, vk::CompareOp::ALWAYS),
    };

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(key.mag_filter.to_vk())
        .min_filter(key.min_filter.to_vk())
        .address_mode_u(key.wrap_u.to_vk())
        .address_mode_v(key.wrap_v.to_vk())
        .address_mode_w(key.wrap_w.to_vk())
        .anisotropy_enable(anisotropy_enable)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(compare_enable)
        .compare_op(compare_op)
        .mipmap_mode(key.mipmap_filter.to_vk())
        .mip_lod_bias(key.lod_bias)
        .min_lod(key.min_lod as f32)
        .max_lod(key.max_lod as f32);

    unsafe { device.create_sampler(&sampler_info, None) }
}

/// Access masks and stages for an image layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> LayoutTransition {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, src_stage) = match old {
        L::UNDEFINED => (A::empty(), S::TOP_OF_PIPE),
        L::COLOR_ATTACHMENT_OPTIMAL => (A::COLOR_ATTACHMENT_WRITE, S::COLOR_ATTACHMENT_OUTPUT),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::PRESENT_SRC_KHR => (A::empty(), S::COLOR_ATTACHMENT_OUTPUT),
        _ => (A::MEMORY_READ | A::MEMORY_WRITE, S::ALL_COMMANDS),
    };

    let (dst_access, dst_stage) = match new {
        L::COLOR_ATTACHMENT_OPTIMAL => (
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        L::SHADER_READ_ONLY_OPTIMAL => (A::SHADER_READ, S::FRAGMENT_SHADER),
        L::TRANSFER_DST_OPTIMAL => (A::TRANSFER_WRITE, S::TRANSFER),
        L::PRESENT_SRC_KHR => (A::empty(), S::BOTTOM_OF_PIPE),
        _ => (A::MEMORY_READ | A::MEMORY_WRITE, S::ALL_COMMANDS),
    };

    LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    }
}
