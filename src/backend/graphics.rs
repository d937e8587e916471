// Frame recorder and draw orchestration
//
// `Graphics` owns one rendering session between `set_mode` and
// `unset_mode`. Each session cycles through FRAMES_IN_FLIGHT frame slots:
//
//   start_recording: wait slot fence -> acquire image -> drain slot cleanup
//                    -> begin command buffers -> enter swap-chain pass
//   present:         flush batch -> end pass/buffers -> wait image fence
//                    -> reset fence, submit, present -> next slot
//
// All GPU work is recorded on the calling thread.

use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use glam::Mat4;
use std::rc::Rc;

use super::buffer::{quad_indices, GpuBuffer};
use super::cache::{FramebufferKey, HandleCache, PipelineKey, RenderPassKey, SamplerKey, ShaderId};
use super::caps::{sized_format, Capabilities, PixelFormat, RendererInfo};
use super::cleanup::DeferredCleanup;
use super::gpu::{BackendSettings, Gpu, PipelineDesc, SubmitDesc};
use super::resources::{Shader, Texture};
use super::state::{
    BlendState, Color, ColorChannelMask, CullMode, PrimitiveType, RenderState, ScissorRect,
    StateStack, Winding,
};
use super::swapchain::{Swapchain, Vsync};
use super::sync::{create_frame_slots, FrameSlot};
use super::uniforms::{ortho_projection, BuiltinUniformData, UniformInputs};
use super::vertex::{derive_vertex_input, BufferBindings, VertexAttributes, VertexFormat};
use crate::window::WindowHost;

/// Frames the CPU may record ahead of the GPU
pub const FRAMES_IN_FLIGHT: usize = 2;
/// Vertices reachable by one u16-indexed draw of the quad index buffer
pub const MAX_VERTICES_PER_DRAW: u32 = 16384;
pub const MAX_QUADS_PER_DRAW: u32 = MAX_VERTICES_PER_DRAW / 4;

const NO_SESSION: &str = "No graphics session is active (call set_mode first)";

/// Per-frame API counters, reset when recording starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub pipeline_binds: u32,
    /// Includes the first shader bound in the frame
    pub shader_switches: u32,
    pub batch_flushes: u32,
}

pub struct DrawCommand<'a> {
    pub primitive: PrimitiveType,
    pub attributes: &'a VertexAttributes,
    pub buffers: &'a BufferBindings,
    pub texture: Option<&'a dyn Texture>,
    pub cull_mode: CullMode,
    pub vertex_start: u32,
    pub vertex_count: u32,
    pub instance_count: u32,
}

pub struct DrawIndexedCommand<'a> {
    pub primitive: PrimitiveType,
    pub attributes: &'a VertexAttributes,
    pub buffers: &'a BufferBindings,
    pub texture: Option<&'a dyn Texture>,
    pub cull_mode: CullMode,
    pub index_buffer: vk::Buffer,
    pub index_buffer_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    pub index_count: u32,
    pub instance_count: u32,
}

/// How a batch's vertices are assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchIndexMode {
    /// Vertices are drawn in order
    Sequential,
    /// Every 4 vertices form a quad, drawn through the quad index buffer
    Quads,
}

pub struct BatchedDrawRequest<'a> {
    pub format: VertexFormat,
    pub primitive: PrimitiveType,
    pub index_mode: BatchIndexMode,
    pub texture: Option<Rc<dyn Texture>>,
    pub vertices: &'a [u8],
    pub vertex_count: u32,
}

struct BatchedDrawState {
    format: VertexFormat,
    primitive: PrimitiveType,
    index_mode: BatchIndexMode,
    texture: Option<Rc<dyn Texture>>,
    vertex_offset: vk::DeviceSize,
    vertex_count: u32,
}

impl BatchedDrawState {
    fn accepts(&self, request: &BatchedDrawRequest) -> bool {
        let same_texture = match (&self.texture, &request.texture) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.format == request.format
            && self.primitive == request.primitive
            && self.index_mode == request.index_mode
            && same_texture
    }
}

#[derive(Debug, Clone, Copy)]
enum PassTarget {
    Swapchain,
    Texture {
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    },
}

#[derive(Debug, Clone, Copy)]
struct ActivePass {
    render_pass: vk::RenderPass,
    target: PassTarget,
    extent: vk::Extent2D,
}

/// Everything that exists only while a mode is set
struct Session<G: Gpu> {
    gpu: G,
    swapchain: Swapchain<G>,
    slots: Vec<FrameSlot<G>>,
    /// Fence of the slot that last rendered to each swap-chain image
    images_in_flight: Vec<vk::Fence>,
    cleanup: DeferredCleanup,
    render_passes: HandleCache<RenderPassKey, vk::RenderPass>,
    framebuffers: HandleCache<FramebufferKey, vk::Framebuffer>,
    pipelines: HandleCache<PipelineKey, vk::Pipeline>,
    samplers: HandleCache<SamplerKey, vk::Sampler>,
    quad_index_buffer: GpuBuffer<G>,

    current_frame: usize,
    image_index: u32,
    recording: bool,
    pass: Option<ActivePass>,
    swapchain_layout: vk::ImageLayout,
    bound_pipeline: vk::Pipeline,
    bound_shader: Option<ShaderId>,

    drawable: (u32, u32),
    vsync: Vsync,
    resized: bool,
    stats: FrameStats,
}

impl<G: Gpu> Session<G> {
    fn create(gpu: G, drawable: (u32, u32), vsync: Vsync) -> Result<Self> {
        let swapchain = Swapchain::new(gpu.clone(), drawable, vsync)?;
        let slots = create_frame_slots(&gpu, FRAMES_IN_FLIGHT)?;

        let indices = quad_indices(MAX_QUADS_PER_DRAW as usize);
        let quad_index_buffer = GpuBuffer::with_data(
            &gpu,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&indices),
            "quad indices",
        )?;

        let images_in_flight = vec![vk::Fence::null(); swapchain.images.len()];

        Ok(Self {
            gpu,
            swapchain,
            slots,
            images_in_flight,
            cleanup: DeferredCleanup::new(FRAMES_IN_FLIGHT),
            render_passes: HandleCache::new(),
            framebuffers: HandleCache::new(),
            pipelines: HandleCache::new(),
            samplers: HandleCache::new(),
            quad_index_buffer,
            current_frame: 0,
            image_index: 0,
            recording: false,
            pass: None,
            swapchain_layout: vk::ImageLayout::UNDEFINED,
            bound_pipeline: vk::Pipeline::null(),
            bound_shader: None,
            drawable,
            vsync,
            resized: false,
            stats: FrameStats::default(),
        })
    }

    fn slot(&self) -> &FrameSlot<G> {
        &self.slots[self.current_frame]
    }

    fn draw_commands(&self) -> vk::CommandBuffer {
        self.slot().draw_commands
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        self.gpu
            .wait_idle()
            .context("failed to wait for device idle")?;

        let swapchain = &self.swapchain;
        let stale = self
            .framebuffers
            .remove_where(|key| swapchain.owns_view(key.image_view));
        for framebuffer in stale {
            self.gpu.destroy_framebuffer(framebuffer);
        }

        self.swapchain.recreate(self.drawable, self.vsync)?;
        self.images_in_flight = vec![vk::Fence::null(); self.swapchain.images.len()];

        log::info!(
            "Recreated swap chain at {}x{}",
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    fn start_recording(&mut self) -> Result<()> {
        self.slot().wait(&self.gpu)?;

        let image_available = self.slot().sync.image_available;
        loop {
            match self
                .gpu
                .acquire_next_image(self.swapchain.handle, image_available)
            {
                Ok((index, _suboptimal)) => {
                    self.image_index = index;
                    break;
                }
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => self.recreate_swapchain()?,
                Err(err) => {
                    return Err(anyhow!(err).context("failed to acquire swap chain image"))
                }
            }
        }

        // The slot fence has signaled: nothing in flight references these
        self.cleanup.drain(self.current_frame);
        self.slots[self.current_frame].batched.next_frame();

        let slot = self.slot();
        self.gpu
            .begin_command_buffer(slot.draw_commands)
            .context("failed to begin recording command buffer")?;
        self.gpu
            .begin_command_buffer(slot.transfer_commands)
            .context("failed to begin recording data transfer command buffer")?;

        self.recording = true;
        self.swapchain_layout = vk::ImageLayout::UNDEFINED;
        self.bound_shader = None;
        self.stats = FrameStats::default();

        self.begin_pass(PassTarget::Swapchain)
    }

    fn end_recording(&mut self) -> Result<()> {
        if !self.recording {
            bail!("Command recording has not started");
        }
        self.end_pass();

        let slot = self.slot();
        self.gpu
            .end_command_buffer(slot.draw_commands)
            .context("failed to record command buffer")?;
        self.gpu
            .end_command_buffer(slot.transfer_commands)
            .context("failed to record data transfer command buffer")?;

        self.recording = false;
        Ok(())
    }

    fn submit_and_present(&mut self) -> Result<()> {
        let slot = &self.slots[self.current_frame];
        let fence = slot.sync.in_flight_fence;
        let image = self.image_index as usize;

        // Another slot may still be rendering to this image
        let previous = self.images_in_flight[image];
        if previous != vk::Fence::null() {
            self.gpu
                .wait_for_fence(previous, u64::MAX)
                .context("failed to wait for image in flight")?;
        }
        self.images_in_flight[image] = fence;

        let command_buffers = [slot.transfer_commands, slot.draw_commands];
        let submit = SubmitDesc {
            wait_semaphore: slot.sync.image_available,
            wait_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            command_buffers: &command_buffers,
            signal_semaphore: slot.sync.render_finished,
            fence,
        };

        self.gpu
            .reset_fence(fence)
            .context("failed to reset in-flight fence")?;
        self.gpu
            .queue_submit(&submit)
            .context("failed to submit draw command buffer")?;

        let stale = match self.gpu.queue_present(
            self.swapchain.handle,
            self.image_index,
            slot.sync.render_finished,
        ) {
            Ok(suboptimal) => suboptimal,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => true,
            Err(err) => return Err(anyhow!(err).context("failed to present swap chain image")),
        };

        if stale || self.resized {
            self.resized = false;
            self.recreate_swapchain()?;
        }

        self.current_frame = (self.current_frame + 1) % FRAMES_IN_FLIGHT;
        Ok(())
    }

    fn begin_pass(&mut self, target: PassTarget) -> Result<()> {
        let cb = self.draw_commands();
        let image_index = self.image_index as usize;

        let (format, view, extent) = match target {
            PassTarget::Swapchain => {
                let view = *self
                    .swapchain
                    .image_views
                    .get(image_index)
                    .context("acquired image index out of range")?;
                (self.swapchain.format, view, self.swapchain.extent)
            }
            PassTarget::Texture { view, format, extent, .. } => (format, view, extent),
        };

        let gpu = &self.gpu;
        let render_pass = self
            .render_passes
            .get_or_create(&RenderPassKey { color_format: format }, |key| {
                log::debug!("Creating render pass for {:?}", key.color_format);
                gpu.create_render_pass(key)
                    .context("failed to create render pass")
            })?;

        let framebuffer_key = FramebufferKey {
            render_pass,
            image_view: view,
            width: extent.width,
            height: extent.height,
        };
        let framebuffer = self.framebuffers.get_or_create(&framebuffer_key, |key| {
            gpu.create_framebuffer(key)
                .context("failed to create framebuffer")
        })?;

        match target {
            PassTarget::Swapchain => {
                let image = self.swapchain.images[image_index];
                gpu.cmd_transition_image_layout(
                    cb,
                    image,
                    self.swapchain_layout,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                );
                self.swapchain_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
            }
            PassTarget::Texture { image, .. } => gpu.cmd_transition_image_layout(
                cb,
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ),
        }

        gpu.cmd_begin_render_pass(cb, render_pass, framebuffer, extent);

        self.pass = Some(ActivePass {
            render_pass,
            target,
            extent,
        });
        self.bound_pipeline = vk::Pipeline::null();
        Ok(())
    }

    fn end_pass(&mut self) {
        let Some(pass) = self.pass.take() else {
            return;
        };
        let cb = self.draw_commands();
        self.gpu.cmd_end_render_pass(cb);

        match pass.target {
            PassTarget::Swapchain => {
                let image = self.swapchain.images[self.image_index as usize];
                self.gpu.cmd_transition_image_layout(
                    cb,
                    image,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::PRESENT_SRC_KHR,
                );
                self.swapchain_layout = vk::ImageLayout::PRESENT_SRC_KHR;
            }
            PassTarget::Texture { image, .. } => self.gpu.cmd_transition_image_layout(
                cb,
                image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ),
        }
    }

    /// Bind pipeline, descriptors and vertex buffers for one draw
    #[allow(clippy::too_many_arguments)]
    fn prepare_draw(
        &mut self,
        state: &RenderState,
        shader: &dyn Shader,
        uniforms: &BuiltinUniformData,
        texture: &dyn Texture,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        primitive: PrimitiveType,
        cull_mode: CullMode,
    ) -> Result<vk::CommandBuffer> {
        let pass = self.pass.context("No render pass is active")?;
        let cb = self.draw_commands();

        let key = PipelineKey {
            render_pass: pass.render_pass,
            vertex_attributes: *attributes,
            shader: shader.id(),
            primitive,
            wireframe: state.wireframe,
            blend: state.blend,
            color_mask: state.color_mask,
            winding: state.winding,
            cull_mode,
            viewport: (pass.extent.width, pass.extent.height),
            scissor: state.scissor,
        };

        let vertex_input = derive_vertex_input(attributes)?;
        let constant_color = self.slot().batched.constant_color.handle;
        let (handles, offsets) = vertex_input.resolve_buffers(buffers, constant_color)?;

        shader.set_uniform_data(uniforms);
        shader.set_main_texture(texture);

        let gpu = &self.gpu;
        let pipeline = self.pipelines.get_or_create(&key, |key| {
            log::debug!("Creating graphics pipeline for shader {:?}", key.shader);
            gpu.create_graphics_pipeline(&PipelineDesc {
                key,
                stages: shader.stages(),
                layout: shader.pipeline_layout(),
                vertex_input: &vertex_input,
            })
            .context("failed to create graphics pipeline")
        })?;

        if pipeline != self.bound_pipeline {
            gpu.cmd_bind_pipeline(cb, pipeline);
            self.bound_pipeline = pipeline;
            self.stats.pipeline_binds += 1;
        }
        if self.bound_shader != Some(shader.id()) {
            self.bound_shader = Some(shader.id());
            self.stats.shader_switches += 1;
        }

        shader.cmd_push_descriptor_sets(cb, self.current_frame)?;
        gpu.cmd_bind_vertex_buffers(cb, &handles, &offsets);
        Ok(cb)
    }

    fn destroy(self) {
        let Session {
            gpu,
            swapchain,
            slots,
            mut cleanup,
            mut render_passes,
            mut framebuffers,
            mut pipelines,
            mut samplers,
            quad_index_buffer,
            ..
        } = self;

        if let Err(err) = gpu.wait_idle() {
            log::warn!("Device wait failed during teardown: {:?}", err);
        }

        drop(quad_index_buffer);

        for framebuffer in framebuffers.drain() {
            gpu.destroy_framebuffer(framebuffer);
        }
        drop(swapchain);

        cleanup.drain_all();

        let mut command_buffers = Vec::with_capacity(slots.len() * 2);
        for slot in slots {
            command_buffers.push(slot.draw_commands);
            command_buffers.push(slot.transfer_commands);
            slot.destroy(&gpu);
        }
        gpu.free_command_buffers(&command_buffers);

        for sampler in samplers.drain() {
            gpu.destroy_sampler(sampler);
        }
        for pipeline in pipelines.drain() {
            gpu.destroy_pipeline(pipeline);
        }
        for render_pass in render_passes.drain() {
            gpu.destroy_render_pass(render_pass);
        }
    }
}

/// Vulkan 2D graphics backend
pub struct Graphics<G: Gpu> {
    settings: BackendSettings,
    session: Option<Session<G>>,
    states: StateStack,
    shader: Option<Rc<dyn Shader>>,
    default_texture: Option<Rc<dyn Texture>>,
    batch: Option<BatchedDrawState>,

    transform: Mat4,
    projection: Mat4,
    width: u32,
    height: u32,
    pixel_width: u32,
    pixel_height: u32,
    active: bool,

    capabilities: Option<Capabilities>,
    renderer_info: Option<RendererInfo>,
}

impl<G: Gpu> Graphics<G> {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            session: None,
            states: StateStack::new(),
            shader: None,
            default_texture: None,
            batch: None,
            transform: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            width: 0,
            height: 0,
            pixel_width: 0,
            pixel_height: 0,
            active: true,
            capabilities: None,
            renderer_info: None,
        }
    }

    pub fn name(&self) -> &'static str {
        "Vulkan"
    }

    pub fn is_created(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Device handle of the running session
    pub fn gpu(&self) -> Option<&G> {
        self.session.as_ref().map(|s| &s.gpu)
    }

    fn session_mut(&mut self) -> Result<&mut Session<G>> {
        self.session.as_mut().context(NO_SESSION)
    }

    /// Bring up device, swap chain and frame slots, then start recording
    /// the first frame. Any existing session is torn down first.
    #[allow(clippy::too_many_arguments)]
    pub fn set_mode(
        &mut self,
        window: &dyn WindowHost,
        width: u32,
        height: u32,
        pixel_width: u32,
        pixel_height: u32,
        backbuffer_stencil: bool,
        msaa: u32,
    ) -> Result<()> {
        if self.session.is_some() {
            self.unset_mode();
        }

        log::info!(
            "Setting mode: {}x{} ({}x{} pixels), vsync {:?}",
            width,
            height,
            pixel_width,
            pixel_height,
            self.settings.vsync
        );
        if backbuffer_stencil || msaa > 1 {
            log::debug!(
                "Backbuffer stencil ({}) and MSAA ({}) are not used; passes have one color attachment",
                backbuffer_stencil,
                msaa
            );
        }

        let gpu = G::bootstrap(window, &self.settings)?;
        self.capabilities = Some(Capabilities::from_limits(gpu.limits()));
        self.renderer_info = Some(RendererInfo::from_limits(gpu.limits()));

        self.set_viewport_size(width, height, pixel_width, pixel_height);

        let mut session = Session::create(gpu, (pixel_width, pixel_height), self.settings.vsync)?;
        session.start_recording()?;

        self.session = Some(session);
        self.states.reset();
        self.batch = None;
        self.active = true;
        Ok(())
    }

    /// Wait for the GPU and destroy everything the session created
    pub fn unset_mode(&mut self) {
        self.batch = None;
        if let Some(session) = self.session.take() {
            log::info!("Tearing down graphics session");
            session.destroy();
        }
    }

    pub fn set_active(&mut self, enable: bool) -> Result<()> {
        if self.session.is_some() {
            self.flush_batched_draws()?;
        }
        self.active = enable;
        Ok(())
    }

    /// Record logical and pixel sizes and reset the projection. A pixel
    /// size change recreates the swap chain at the next present.
    pub fn set_viewport_size(&mut self, width: u32, height: u32, pixel_width: u32, pixel_height: u32) {
        self.width = width;
        self.height = height;
        self.pixel_width = pixel_width;
        self.pixel_height = pixel_height;
        self.projection = ortho_projection(width as f32, height as f32);

        if let Some(session) = self.session.as_mut() {
            if session.drawable != (pixel_width, pixel_height) {
                session.drawable = (pixel_width, pixel_height);
                session.resized = true;
            }
        }
    }

    pub fn dpi_scale(&self) -> f32 {
        if self.width == 0 {
            1.0
        } else {
            self.pixel_width as f32 / self.width as f32
        }
    }

    pub fn set_vsync(&mut self, vsync: Vsync) {
        if self.settings.vsync == vsync {
            return;
        }
        self.settings.vsync = vsync;
        if let Some(session) = self.session.as_mut() {
            session.vsync = vsync;
            session.resized = true;
        }
    }

    pub fn vsync(&self) -> Vsync {
        self.settings.vsync
    }

    /// Submit the current frame, present it and start the next one.
    /// Does nothing while inactive.
    pub fn present(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.flush_batched_draws()?;

        let session = self.session_mut()?;
        session.end_recording()?;
        session.submit_and_present()?;
        session.start_recording()
    }

    pub fn current_frame(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.current_frame)
    }

    pub fn frames_in_flight(&self) -> usize {
        FRAMES_IN_FLIGHT
    }

    /// In-flight fence of frame slot `slot`
    pub fn frame_fence(&self, slot: usize) -> Option<vk::Fence> {
        self.session
            .as_ref()
            .and_then(|s| s.slots.get(slot))
            .map(|slot| slot.sync.in_flight_fence)
    }

    pub fn stats(&self) -> FrameStats {
        self.session.as_ref().map(|s| s.stats).unwrap_or_default()
    }

    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn renderer_info(&self) -> Option<&RendererInfo> {
        self.renderer_info.as_ref()
    }

    pub fn min_uniform_buffer_offset_alignment(&self) -> Option<vk::DeviceSize> {
        self.gpu().map(|gpu| gpu.limits().min_uniform_buffer_offset_alignment)
    }

    pub fn sized_format(&self, format: PixelFormat) -> PixelFormat {
        sized_format(format, self.settings.gamma_correct)
    }

    /// Always true; formats are not probed individually
    pub fn is_pixel_format_supported(&self, _format: PixelFormat) -> bool {
        true
    }

    // ------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------

    pub fn set_shader(&mut self, shader: Rc<dyn Shader>) {
        self.shader = Some(shader);
    }

    /// Texture bound when a draw supplies none
    pub fn set_default_texture(&mut self, texture: Rc<dyn Texture>) {
        self.default_texture = Some(texture);
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn set_projection(&mut self, projection: Mat4) {
        self.projection = projection;
    }

    pub fn cached_sampler(&mut self, key: &SamplerKey) -> Result<vk::Sampler> {
        let session = self.session_mut()?;
        let gpu = &session.gpu;
        session.samplers.get_or_create(key, |key| {
            gpu.create_sampler(key).context("failed to create sampler")
        })
    }

    /// Command buffer whose uploads run before this frame's draws
    pub fn data_transfer_command_buffer(&self) -> Result<vk::CommandBuffer> {
        let session = self.session.as_ref().context(NO_SESSION)?;
        Ok(session.slot().transfer_commands)
    }

    /// Run `action` once the current frame slot's GPU work has completed
    pub fn queue_cleanup(&mut self, action: impl FnOnce() + 'static) -> Result<()> {
        let session = self.session_mut()?;
        let slot = session.current_frame;
        session.cleanup.schedule(slot, Box::new(action));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Render state
    // ------------------------------------------------------------------

    pub fn state(&self) -> &RenderState {
        self.states.top()
    }

    fn update_state(&mut self, change: impl FnOnce(&mut RenderState)) -> Result<()> {
        let mut next = *self.states.top();
        change(&mut next);
        if self.states.top().requires_flush(&next) {
            self.flush_batched_draws()?;
        }
        *self.states.top_mut() = next;
        Ok(())
    }

    /// Color travels in the uniform block, so it never flushes
    pub fn set_color(&mut self, color: Color) {
        self.states.top_mut().color = color.clamped();
    }

    pub fn set_scissor(&mut self, rect: Option<ScissorRect>) -> Result<()> {
        self.update_state(|s| s.scissor = rect)
    }

    pub fn set_blend_state(&mut self, blend: BlendState) -> Result<()> {
        self.update_state(|s| s.blend = blend)
    }

    pub fn set_wireframe(&mut self, enable: bool) -> Result<()> {
        self.update_state(|s| s.wireframe = enable)
    }

    pub fn set_color_mask(&mut self, mask: ColorChannelMask) -> Result<()> {
        self.update_state(|s| s.color_mask = mask)
    }

    pub fn set_front_face_winding(&mut self, winding: Winding) -> Result<()> {
        self.update_state(|s| s.winding = winding)
    }

    pub fn set_point_size(&mut self, size: f32) -> Result<()> {
        self.update_state(|s| s.point_size = size)
    }

    pub fn push_state(&mut self) -> Result<()> {
        self.states.push()
    }

    pub fn pop_state(&mut self) -> Result<()> {
        let next = *self
            .states
            .below_top()
            .context("Minimum stack depth reached (more pops than pushes?)")?;
        if self.states.top().requires_flush(&next) {
            self.flush_batched_draws()?;
        }
        self.states.pop()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Render targets and clears
    // ------------------------------------------------------------------

    /// Switch drawing to `target`, or back to the window when `None`
    pub fn set_render_target(&mut self, target: Option<&dyn Texture>) -> Result<()> {
        self.flush_batched_draws()?;

        let pass_target = match target {
            Some(texture) => {
                let view = texture
                    .render_target_view()
                    .context("Texture is not a render target")?;
                let (width, height) = texture.pixel_size();
                PassTarget::Texture {
                    image: texture.image(),
                    view,
                    format: self.sized_format(texture.pixel_format()).to_vk(),
                    extent: vk::Extent2D { width, height },
                }
            }
            None => PassTarget::Swapchain,
        };

        let session = self.session_mut()?;
        if !session.recording {
            bail!("Command recording has not started");
        }
        session.end_pass();
        session.begin_pass(pass_target)
    }

    pub fn clear(&mut self, color: Option<Color>, stencil: Option<i32>, depth: Option<f64>) -> Result<()> {
        self.clear_targets(&[color], stencil, depth)
    }

    /// Clear each render target attachment that has a color
    pub fn clear_targets(
        &mut self,
        colors: &[Option<Color>],
        stencil: Option<i32>,
        depth: Option<f64>,
    ) -> Result<()> {
        self.flush_batched_draws()?;

        if stencil.is_some() || depth.is_some() {
            log::trace!("Stencil and depth clears are not supported; ignoring");
        }

        let session = self.session_mut()?;
        let pass = session.pass.context("No render pass is active")?;

        let attachments: Vec<vk::ClearAttachment> = colors
            .iter()
            .enumerate()
            .filter_map(|(index, color)| {
                color.map(|c| vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: index as u32,
                    clear_value: vk::ClearValue {
                        color: vk::ClearColorValue { float32: c.to_array() },
                    },
                })
            })
            .collect();

        if attachments.is_empty() {
            return Ok(());
        }

        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: pass.extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        let cb = session.draw_commands();
        session.gpu.cmd_clear_attachments(cb, &attachments, rect);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Draws
    // ------------------------------------------------------------------

    fn builtin_uniforms(&self, session: &Session<G>) -> BuiltinUniformData {
        let state = self.states.top();
        let viewport = session
            .pass
            .map(|p| (p.extent.width as f32, p.extent.height as f32))
            .unwrap_or((0.0, 0.0));

        BuiltinUniformData::build(&UniformInputs {
            transform: self.transform,
            projection: self.projection,
            display_rotation: session.swapchain.display_rotation,
            dpi_scale: self.dpi_scale(),
            point_size: state.point_size,
            viewport,
            color: state.color,
            gamma_correct: self.settings.gamma_correct,
        })
    }

    fn prepare_draw(
        &mut self,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        texture: Option<&dyn Texture>,
        primitive: PrimitiveType,
        cull_mode: CullMode,
    ) -> Result<vk::CommandBuffer> {
        let shader = self.shader.clone().context("No shader is active")?;
        let default_texture = self.default_texture.clone();
        let texture = texture
            .or(default_texture.as_deref())
            .context("No texture given and no default texture set")?;

        let state = *self.states.top();
        let session = self.session.as_ref().context(NO_SESSION)?;
        let uniforms = self.builtin_uniforms(session);

        let session = self.session_mut()?;
        session.prepare_draw(
            &state,
            &*shader,
            &uniforms,
            texture,
            attributes,
            buffers,
            primitive,
            cull_mode,
        )
    }

    fn record_draw(&mut self, cmd: &DrawCommand) -> Result<()> {
        let cb = self.prepare_draw(cmd.attributes, cmd.buffers, cmd.texture, cmd.primitive, cmd.cull_mode)?;
        let session = self.session_mut()?;
        session
            .gpu
            .cmd_draw(cb, cmd.vertex_count, cmd.instance_count, cmd.vertex_start);
        session.stats.draw_calls += 1;
        Ok(())
    }

    fn record_quads(
        &mut self,
        start: u32,
        count: u32,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        texture: Option<&dyn Texture>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        // Chunk bases only grow, so checking the last quad covers every chunk
        quad_base_vertex(start, count - 1)?;

        let cb = self.prepare_draw(attributes, buffers, texture, PrimitiveType::Triangles, CullMode::Back)?;
        let session = self.session_mut()?;

        session.gpu.cmd_bind_index_buffer(
            cb,
            session.quad_index_buffer.handle,
            0,
            vk::IndexType::UINT16,
        );

        let mut quad = 0;
        while quad < count {
            let quads = MAX_QUADS_PER_DRAW.min(count - quad);
            let base_vertex = quad_base_vertex(start, quad)?;
            session.gpu.cmd_draw_indexed(cb, quads * 6, 1, 0, base_vertex);
            session.stats.draw_calls += 1;
            quad += quads;
        }
        Ok(())
    }

    pub fn draw(&mut self, cmd: &DrawCommand) -> Result<()> {
        self.flush_batched_draws()?;
        self.record_draw(cmd)
    }

    pub fn draw_indexed(&mut self, cmd: &DrawIndexedCommand) -> Result<()> {
        self.flush_batched_draws()?;

        let cb = self.prepare_draw(cmd.attributes, cmd.buffers, cmd.texture, cmd.primitive, cmd.cull_mode)?;
        let session = self.session_mut()?;
        session
            .gpu
            .cmd_bind_index_buffer(cb, cmd.index_buffer, cmd.index_buffer_offset, cmd.index_type);
        session
            .gpu
            .cmd_draw_indexed(cb, cmd.index_count, cmd.instance_count, 0, 0);
        session.stats.draw_calls += 1;
        Ok(())
    }

    /// Draw `count` quads starting at quad `start`, in chunks the u16 quad
    /// index buffer can address
    pub fn draw_quads(
        &mut self,
        start: u32,
        count: u32,
        attributes: &VertexAttributes,
        buffers: &BufferBindings,
        texture: Option<&dyn Texture>,
    ) -> Result<()> {
        self.flush_batched_draws()?;
        self.record_quads(start, count, attributes, buffers, texture)
    }

    /// Append vertices to the current batch, flushing first when the batch
    /// can't take them
    pub fn request_batched_draw(&mut self, request: BatchedDrawRequest) -> Result<()> {
        let stride = request.format.stride() as usize;
        if request.vertices.len() != request.vertex_count as usize * stride {
            bail!(
                "Batched draw of {} vertices needs {} bytes, got {}",
                request.vertex_count,
                request.vertex_count as usize * stride,
                request.vertices.len()
            );
        }
        if request.index_mode == BatchIndexMode::Quads && request.vertex_count % 4 != 0 {
            bail!("Quad batches need a multiple of 4 vertices");
        }
        if request.vertex_count == 0 {
            return Ok(());
        }

        let needed = request.vertices.len() as vk::DeviceSize;
        let fits = {
            let session = self.session.as_ref().context(NO_SESSION)?;
            session.slot().batched.vertices.remaining() >= needed
        };
        let compatible = self.batch.as_ref().map_or(false, |b| b.accepts(&request));
        if !fits || !compatible {
            self.flush_batched_draws()?;
        }

        let session = self.session_mut()?;
        let frame = session.current_frame;
        let stream = &mut session.slots[frame].batched.vertices;
        if let Some(old) = stream.reserve(needed)? {
            // Earlier draws this frame still read the old buffer
            session.cleanup.schedule(frame, Box::new(move || drop(old)));
        }
        let stream = &mut session.slots[frame].batched.vertices;
        let offset = stream.append(request.vertices)?;

        match self.batch.as_mut() {
            Some(batch) => batch.vertex_count += request.vertex_count,
            None => {
                self.batch = Some(BatchedDrawState {
                    format: request.format,
                    primitive: request.primitive,
                    index_mode: request.index_mode,
                    texture: request.texture,
                    vertex_offset: offset,
                    vertex_count: request.vertex_count,
                })
            }
        }
        Ok(())
    }

    /// Record the pending batch, if any
    pub fn flush_batched_draws(&mut self) -> Result<()> {
        let Some(batch) = self.batch.take() else {
            return Ok(());
        };

        let stream = {
            let session = self.session.as_ref().context(NO_SESSION)?;
            session.slot().batched.vertices.handle()
        };

        let attributes = batch.format.attributes(0)?;
        let mut buffers = BufferBindings::default();
        buffers.set(0, stream, batch.vertex_offset)?;
        let texture = batch.texture.as_deref();

        match batch.index_mode {
            BatchIndexMode::Quads => {
                self.record_quads(0, batch.vertex_count / 4, &attributes, &buffers, texture)?
            }
            BatchIndexMode::Sequential => self.record_draw(&DrawCommand {
                primitive: batch.primitive,
                attributes: &attributes,
                buffers: &buffers,
                texture,
                cull_mode: CullMode::None,
                vertex_start: 0,
                vertex_count: batch.vertex_count,
                instance_count: 1,
            })?,
        }

        self.session_mut()?.stats.batch_flushes += 1;
        Ok(())
    }
}

/// Vertex offset of quad `start + quad`, as the signed value draw calls take
fn quad_base_vertex(start: u32, quad: u32) -> Result<i32> {
    let vertex = start
        .checked_add(quad)
        .and_then(|q| q.checked_mul(4))
        .with_context(|| format!("quad {} + {} overflows the vertex range", start, quad))?;
    i32::try_from(vertex).with_context(|| format!("base vertex {} exceeds i32::MAX", vertex))
}

impl<G: Gpu> Drop for Graphics<G> {
    fn drop(&mut self) {
        self.unset_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::buffer::INITIAL_VERTEX_STREAM_SIZE;
    use crate::backend::vertex::{ATTRIB_POS, MAX_BUFFERS};
    use crate::backend::mock::{Call, MockGpu, MockShader, MockTexture, MockWindow};
    use ash::vk::Handle;
    use std::cell::Cell;

    fn start_session() -> (Graphics<MockGpu>, MockGpu, Rc<MockShader>) {
        let mut graphics = Graphics::<MockGpu>::new(BackendSettings::default());
        graphics
            .set_mode(&MockWindow { size: (800, 600) }, 800, 600, 800, 600, false, 0)
            .unwrap();
        let shader = Rc::new(MockShader::new(1));
        graphics.set_shader(shader.clone());
        graphics.set_default_texture(Rc::new(MockTexture::plain(0x9000)));
        let gpu = graphics.gpu().unwrap().clone();
        (graphics, gpu, shader)
    }

    fn vertex_input() -> (VertexAttributes, BufferBindings) {
        let attributes = VertexFormat::XyfStf.attributes(0).unwrap();
        let mut buffers = BufferBindings::default();
        buffers.set(0, vk::Buffer::from_raw(0x7777), 0).unwrap();
        (attributes, buffers)
    }

    fn triangles<'a>(attributes: &'a VertexAttributes, buffers: &'a BufferBindings) -> DrawCommand<'a> {
        DrawCommand {
            primitive: PrimitiveType::Triangles,
            attributes,
            buffers,
            texture: None,
            cull_mode: CullMode::None,
            vertex_start: 0,
            vertex_count: 3,
            instance_count: 1,
        }
    }

    fn quad_batch(vertex_count: u32) -> (Vec<u8>, u32) {
        let stride = VertexFormat::XyfStf.stride() as usize;
        (vec![0u8; vertex_count as usize * stride], vertex_count)
    }

    fn draw_indexed_calls(gpu: &MockGpu) -> Vec<(u32, i32)> {
        gpu.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DrawIndexed { index_count, vertex_offset, .. } => Some((index_count, vertex_offset)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn set_mode_then_present_advances_to_second_slot() {
        let (mut graphics, gpu, _) = start_session();
        assert_eq!(graphics.current_frame(), Some(0));

        graphics.present().unwrap();

        assert_eq!(graphics.current_frame(), Some(1));
        let fence = graphics.frame_fence(0).unwrap();
        assert!(gpu.fence_signaled(fence).unwrap());
    }

    #[test]
    fn submission_orders_uploads_before_draws() {
        let (mut graphics, gpu, _) = start_session();
        let transfer = graphics.data_transfer_command_buffer().unwrap();
        graphics.present().unwrap();

        let submit = gpu
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::Submit { command_buffers, wait_stage, .. } => Some((command_buffers, wait_stage)),
                _ => None,
            })
            .unwrap();
        assert_eq!(submit.0.len(), 2);
        assert_eq!(submit.0[0], transfer);
        assert_eq!(submit.1, vk::PipelineStageFlags::TOP_OF_PIPE);
    }

    #[test]
    fn slot_index_follows_present_count() {
        let (mut graphics, _gpu, _) = start_session();
        for m in 1..=7 {
            graphics.present().unwrap();
            assert_eq!(graphics.current_frame(), Some(m % FRAMES_IN_FLIGHT));
        }
    }

    #[test]
    fn frame_starts_by_preparing_swapchain_image() {
        let (_graphics, gpu, _) = start_session();
        let calls = gpu.calls();
        let transition = calls.iter().find_map(|c| match c {
            Call::Transition { old, new, .. } => Some((*old, *new)),
            _ => None,
        });
        assert_eq!(
            transition,
            Some((vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL))
        );
        assert!(calls.iter().any(|c| matches!(
            c,
            Call::BeginRenderPass { extent, .. } if *extent == vk::Extent2D { width: 800, height: 600 }
        )));
    }

    #[test]
    fn quads_are_drawn_in_chunks_with_rising_base_vertex() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();

        graphics.draw_quads(2, 10_000, &attributes, &buffers, None).unwrap();

        let draws = draw_indexed_calls(&gpu);
        assert_eq!(draws.len(), 3); // ceil(10000 / 4096)
        assert_eq!(draws[0], (4096 * 6, 8));
        assert_eq!(draws[1], (4096 * 6, 8 + 4096 * 4));
        assert_eq!(draws[2], ((10_000 - 8192) * 6, 8 + 8192 * 4));
        assert!(gpu.calls().iter().any(|c| matches!(
            c,
            Call::BindIndexBuffer { index_type, .. } if *index_type == vk::IndexType::UINT16
        )));
    }

    #[test]
    fn exact_chunk_multiple_issues_no_empty_draw() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();
        graphics.draw_quads(0, 2 * MAX_QUADS_PER_DRAW, &attributes, &buffers, None).unwrap();
        assert_eq!(draw_indexed_calls(&gpu).len(), 2);
    }

    #[test]
    fn quad_range_past_signed_vertex_offset_is_rejected() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();

        let past_i32 = (i32::MAX as u32) / 4 + 1;
        assert!(graphics.draw_quads(past_i32, 1, &attributes, &buffers, None).is_err());
        assert!(graphics.draw_quads(u32::MAX, 1, &attributes, &buffers, None).is_err());
        assert!(graphics.draw_quads(1, u32::MAX, &attributes, &buffers, None).is_err());
        assert!(draw_indexed_calls(&gpu).is_empty());
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::BindPipeline(_))), 0);

        // The last quad that still fits
        graphics.draw_quads(past_i32 - 1, 1, &attributes, &buffers, None).unwrap();
        assert_eq!(draw_indexed_calls(&gpu), vec![(6, i32::MAX - 3)]);
    }

    #[test]
    fn out_of_range_vertex_slot_fails_the_draw() {
        let (mut graphics, gpu, _) = start_session();
        let (mut attributes, buffers) = vertex_input();
        attributes.attribs[ATTRIB_POS].buffer_index = MAX_BUFFERS as u8;

        assert!(graphics.draw(&triangles(&attributes, &buffers)).is_err());
        assert!(graphics.draw_quads(0, 1, &attributes, &buffers, None).is_err());
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreatePipeline)), 0);
        assert_eq!(graphics.stats().draw_calls, 0);
    }

    #[test]
    fn direct_draw_after_scissor_change_flushes_once_and_gets_new_pipeline() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();
        let (bytes, count) = quad_batch(4);

        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        graphics
            .request_batched_draw(BatchedDrawRequest {
                format: VertexFormat::XyfStf,
                primitive: PrimitiveType::Triangles,
                index_mode: BatchIndexMode::Quads,
                texture: None,
                vertices: &bytes,
                vertex_count: count,
            })
            .unwrap();

        graphics.set_scissor(Some(ScissorRect::new(0, 0, 100, 100))).unwrap();
        assert_eq!(graphics.stats().batch_flushes, 1);
        assert_eq!(draw_indexed_calls(&gpu).len(), 1);
        let pipelines_before = gpu.count_calls(|c| matches!(c, Call::CreatePipeline));

        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        assert_eq!(graphics.stats().batch_flushes, 1);
        assert_eq!(
            gpu.count_calls(|c| matches!(c, Call::CreatePipeline)),
            pipelines_before + 1
        );

        // The batched quads were recorded before the scissored draw
        let calls = gpu.calls();
        let quads_at = calls.iter().position(|c| matches!(c, Call::DrawIndexed { .. })).unwrap();
        let last_draw_at = calls.iter().rposition(|c| matches!(c, Call::Draw { .. })).unwrap();
        assert!(quads_at < last_draw_at);

        graphics.set_scissor(Some(ScissorRect::new(10, 10, 50, 50))).unwrap();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        assert_eq!(
            gpu.count_calls(|c| matches!(c, Call::CreatePipeline)),
            pipelines_before + 2
        );
        assert_eq!(graphics.stats().batch_flushes, 1);
    }

    #[test]
    fn direct_draw_after_blend_change_uses_distinct_pipeline() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();

        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        let first = gpu.calls().into_iter().find_map(|c| match c {
            Call::BindPipeline(p) => Some(p),
            _ => None,
        });

        graphics.set_blend_state(BlendState::additive()).unwrap();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        let second = gpu.calls().into_iter().rev().find_map(|c| match c {
            Call::BindPipeline(p) => Some(p),
            _ => None,
        });

        assert!(first.is_some());
        assert_ne!(first, second);
        assert_eq!(graphics.stats().pipeline_binds, 2);
        assert_eq!(graphics.stats().batch_flushes, 0);
    }

    #[test]
    fn identical_batches_coalesce_until_state_changes() {
        let (mut graphics, gpu, _) = start_session();
        let (bytes, count) = quad_batch(4);

        for _ in 0..2 {
            graphics
                .request_batched_draw(BatchedDrawRequest {
                    format: VertexFormat::XyfStf,
                    primitive: PrimitiveType::Triangles,
                    index_mode: BatchIndexMode::Quads,
                    texture: None,
                    vertices: &bytes,
                    vertex_count: count,
                })
                .unwrap();
        }
        assert_eq!(graphics.stats().batch_flushes, 0);
        assert!(draw_indexed_calls(&gpu).is_empty());

        graphics.set_wireframe(true).unwrap();
        assert_eq!(graphics.stats().batch_flushes, 1);
        assert_eq!(draw_indexed_calls(&gpu), vec![(12, 0)]);

        graphics
            .request_batched_draw(BatchedDrawRequest {
                format: VertexFormat::XyfStf,
                primitive: PrimitiveType::Triangles,
                index_mode: BatchIndexMode::Quads,
                texture: None,
                vertices: &bytes,
                vertex_count: count,
            })
            .unwrap();
        // Same value again: nothing to flush
        graphics.set_wireframe(true).unwrap();
        assert_eq!(graphics.stats().batch_flushes, 1);
    }

    #[test]
    fn batch_breaks_on_format_change() {
        let (mut graphics, _gpu, _) = start_session();
        let (bytes, count) = quad_batch(4);
        graphics
            .request_batched_draw(BatchedDrawRequest {
                format: VertexFormat::XyfStf,
                primitive: PrimitiveType::Triangles,
                index_mode: BatchIndexMode::Quads,
                texture: None,
                vertices: &bytes,
                vertex_count: count,
            })
            .unwrap();

        let xy = vec![0u8; 3 * VertexFormat::Xyf.stride() as usize];
        graphics
            .request_batched_draw(BatchedDrawRequest {
                format: VertexFormat::Xyf,
                primitive: PrimitiveType::Triangles,
                index_mode: BatchIndexMode::Sequential,
                texture: None,
                vertices: &xy,
                vertex_count: 3,
            })
            .unwrap();
        assert_eq!(graphics.stats().batch_flushes, 1);

        graphics.present().unwrap();
        assert_eq!(graphics.stats(), FrameStats::default());
    }

    #[test]
    fn malformed_batch_is_rejected() {
        let (mut graphics, _gpu, _) = start_session();
        let result = graphics.request_batched_draw(BatchedDrawRequest {
            format: VertexFormat::XyfStf,
            primitive: PrimitiveType::Triangles,
            index_mode: BatchIndexMode::Quads,
            texture: None,
            vertices: &[0u8; 10],
            vertex_count: 3,
        });
        assert!(result.is_err());
    }

    #[test]
    fn growing_batch_buffer_defers_old_buffer_to_slot_reuse() {
        let (mut graphics, gpu, _) = start_session();
        let live = gpu.live_buffers();

        let stride = VertexFormat::XyfStf.stride() as usize;
        let count = (INITIAL_VERTEX_STREAM_SIZE as usize / stride + 1) as u32;
        let bytes = vec![0u8; count as usize * stride];
        graphics
            .request_batched_draw(BatchedDrawRequest {
                format: VertexFormat::XyfStf,
                primitive: PrimitiveType::Triangles,
                index_mode: BatchIndexMode::Sequential,
                texture: None,
                vertices: &bytes,
                vertex_count: count,
            })
            .unwrap();
        assert_eq!(gpu.live_buffers(), live + 1);

        graphics.present().unwrap();
        assert_eq!(gpu.live_buffers(), live + 1);
        graphics.present().unwrap();
        assert_eq!(gpu.live_buffers(), live);
    }

    #[test]
    fn pipelines_are_cached_per_state() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();

        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreatePipeline)), 1);
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::BindPipeline(_))), 1);
        assert_eq!(graphics.stats().draw_calls, 2);
        assert_eq!(graphics.stats().shader_switches, 1);

        graphics.set_blend_state(BlendState::additive()).unwrap();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreatePipeline)), 2);

        // Back to the first state: cached pipeline, new bind
        graphics.set_blend_state(BlendState::alpha()).unwrap();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreatePipeline)), 2);
        assert_eq!(graphics.stats().pipeline_binds, 3);
    }

    #[test]
    fn constant_color_buffer_is_bound_without_color_attribute() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();

        let bound = gpu
            .calls()
            .into_iter()
            .find_map(|c| match c {
                Call::BindVertexBuffers { buffers, .. } => Some(buffers),
                _ => None,
            })
            .unwrap();
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0], vk::Buffer::from_raw(0x7777));
    }

    #[test]
    fn draw_uploads_uniforms_and_default_texture() {
        let (mut graphics, _gpu, shader) = start_session();
        let (attributes, buffers) = vertex_input();
        graphics.set_color(Color::new(2.0, 0.5, -1.0, 1.0));
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();

        let uniforms = shader.uniforms.borrow().unwrap();
        assert_eq!(uniforms.screen_size_params, [800.0, 600.0, 1.0, 0.0]);
        assert_eq!(uniforms.constant_color, [1.0, 0.5, 0.0, 1.0]);
        assert_eq!(uniforms.normal_matrix[0][3], 1.0);
        assert_eq!(shader.main_texture.get(), vk::Image::from_raw(0x9000));
        assert_eq!(shader.descriptor_pushes.get(), 1);
    }

    #[test]
    fn drawing_needs_a_shader_and_a_session() {
        let mut graphics = Graphics::<MockGpu>::new(BackendSettings::default());
        let (attributes, buffers) = vertex_input();
        assert!(graphics.draw(&triangles(&attributes, &buffers)).is_err());

        graphics
            .set_mode(&MockWindow { size: (800, 600) }, 800, 600, 800, 600, false, 0)
            .unwrap();
        graphics.set_default_texture(Rc::new(MockTexture::plain(1)));
        assert!(graphics.draw(&triangles(&attributes, &buffers)).is_err());
    }

    #[test]
    fn out_of_date_acquire_recreates_and_retries() {
        let (mut graphics, gpu, _) = start_session();
        gpu.push_acquire_result(Err(vk::Result::ERROR_OUT_OF_DATE_KHR));

        graphics.present().unwrap();

        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreateSwapchain { .. })), 2);
        assert_eq!(gpu.live_swapchains(), 1);
        assert_eq!(graphics.current_frame(), Some(1));
    }

    #[test]
    fn suboptimal_present_recreates_and_drops_window_framebuffers() {
        let (mut graphics, gpu, _) = start_session();
        gpu.push_present_result(Ok(true));

        graphics.present().unwrap();

        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreateSwapchain { .. })), 2);
        assert!(gpu.count_calls(|c| matches!(c, Call::WaitIdle)) >= 1);
        // Only the framebuffer for the newly acquired image remains
        assert_eq!(gpu.live_framebuffers(), 1);
    }

    #[test]
    fn resize_recreates_at_next_present() {
        let (mut graphics, gpu, _) = start_session();
        gpu.set_surface_extent(1024, 768);
        graphics.set_viewport_size(1024, 768, 1024, 768);
        graphics.present().unwrap();

        let last_extent = gpu
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateSwapchain { extent, .. } => Some(extent),
                _ => None,
            })
            .last();
        assert_eq!(last_extent, Some(vk::Extent2D { width: 1024, height: 768 }));
    }

    #[test]
    fn vsync_change_recreates_with_new_mode() {
        let (mut graphics, gpu, _) = start_session();
        graphics.set_vsync(Vsync::Fast);
        graphics.present().unwrap();

        let modes: Vec<vk::PresentModeKHR> = gpu
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateSwapchain { present_mode, .. } => Some(present_mode),
                _ => None,
            })
            .collect();
        assert_eq!(modes, vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]);
    }

    #[test]
    fn unexpected_present_error_is_fatal() {
        let (mut graphics, gpu, _) = start_session();
        gpu.push_present_result(Err(vk::Result::ERROR_DEVICE_LOST));
        assert!(graphics.present().is_err());
    }

    #[test]
    fn cleanup_runs_when_slot_comes_back() {
        let (mut graphics, _gpu, _) = start_session();
        let runs = Rc::new(Cell::new(0));

        let r = runs.clone();
        graphics.queue_cleanup(move || r.set(r.get() + 1)).unwrap();

        graphics.present().unwrap();
        assert_eq!(runs.get(), 0);
        graphics.present().unwrap();
        assert_eq!(runs.get(), 1);
        graphics.present().unwrap();
        graphics.present().unwrap();
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn render_target_switch_transitions_both_images() {
        let (mut graphics, gpu, _) = start_session();
        let canvas = MockTexture::render_target(0x5000, 256, 128);
        gpu.clear_calls();

        graphics.set_render_target(Some(&canvas)).unwrap();
        graphics.set_render_target(None).unwrap();

        let transitions: Vec<(vk::Image, vk::ImageLayout, vk::ImageLayout)> = gpu
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Transition { image, old, new } => Some((image, old, new)),
                _ => None,
            })
            .collect();

        use vk::ImageLayout as L;
        assert_eq!(transitions.len(), 4);
        assert_eq!((transitions[0].1, transitions[0].2), (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR));
        assert_eq!(transitions[1], (canvas.image, L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL));
        assert_eq!(transitions[2], (canvas.image, L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL));
        assert_eq!((transitions[3].1, transitions[3].2), (L::PRESENT_SRC_KHR, L::COLOR_ATTACHMENT_OPTIMAL));

        assert!(gpu.calls().iter().any(|c| matches!(
            c,
            Call::BeginRenderPass { extent, .. } if *extent == vk::Extent2D { width: 256, height: 128 }
        )));
        graphics.present().unwrap();
    }

    #[test]
    fn plain_texture_cannot_be_a_render_target() {
        let (mut graphics, _gpu, _) = start_session();
        assert!(graphics.set_render_target(Some(&MockTexture::plain(3))).is_err());
    }

    #[test]
    fn clear_uses_current_target_extent() {
        let (mut graphics, gpu, _) = start_session();
        graphics.clear(Some(Color::new(0.1, 0.2, 0.3, 1.0)), Some(0), Some(1.0)).unwrap();
        graphics.clear(None, None, None).unwrap();

        let clears: Vec<Call> = gpu
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::ClearAttachments { .. }))
            .collect();
        assert_eq!(
            clears,
            vec![Call::ClearAttachments {
                colors: vec![[0.1, 0.2, 0.3, 1.0]],
                extent: vk::Extent2D { width: 800, height: 600 },
            }]
        );
    }

    #[test]
    fn samplers_are_cached() {
        let (mut graphics, gpu, _) = start_session();
        let key = SamplerKey::default();
        let a = graphics.cached_sampler(&key).unwrap();
        let b = graphics.cached_sampler(&key).unwrap();
        assert_eq!(a, b);
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::CreateSampler)), 1);
    }

    #[test]
    fn pop_restores_previous_state() {
        let (mut graphics, _gpu, _) = start_session();
        graphics.push_state().unwrap();
        graphics.set_wireframe(true).unwrap();
        graphics.set_point_size(3.0).unwrap();
        graphics.pop_state().unwrap();

        assert!(!graphics.state().wireframe);
        assert_eq!(graphics.state().point_size, 1.0);
        assert!(graphics.pop_state().is_err());
    }

    #[test]
    fn inactive_session_does_not_present() {
        let (mut graphics, gpu, _) = start_session();
        graphics.set_active(false).unwrap();
        graphics.present().unwrap();

        assert_eq!(graphics.current_frame(), Some(0));
        assert_eq!(gpu.count_calls(|c| matches!(c, Call::Submit { .. })), 0);
    }

    #[test]
    fn unset_mode_releases_every_object() {
        let (mut graphics, gpu, _) = start_session();
        let (attributes, buffers) = vertex_input();
        graphics.draw(&triangles(&attributes, &buffers)).unwrap();
        graphics.cached_sampler(&SamplerKey::default()).unwrap();
        graphics.present().unwrap();

        graphics.unset_mode();

        assert!(!graphics.is_created());
        assert_eq!(gpu.live_fences(), 0);
        assert_eq!(gpu.live_semaphores(), 0);
        assert_eq!(gpu.live_swapchains(), 0);
        assert_eq!(gpu.live_image_views(), 0);
        assert_eq!(gpu.live_framebuffers(), 0);
        assert_eq!(gpu.live_render_passes(), 0);
        assert_eq!(gpu.live_pipelines(), 0);
        assert_eq!(gpu.live_samplers(), 0);
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_command_buffers(), 0);
    }

    #[test]
    fn capabilities_and_renderer_info_follow_device() {
        let (graphics, _gpu, _) = start_session();
        let info = graphics.renderer_info().unwrap();
        assert_eq!(info.name, "Vulkan");
        assert_eq!(info.device, "Mock Device");
        assert_eq!(graphics.min_uniform_buffer_offset_alignment(), Some(256));
        assert_eq!(graphics.sized_format(PixelFormat::Normal), PixelFormat::Rgba8Unorm);
    }
}
