// Recording GPU double for tests
//
// Fabricates handles, tracks live objects, records every command and
// completes submitted work instantly (submission signals the fence).

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::cache::{FramebufferKey, RenderPassKey, SamplerKey, ShaderId};
use super::caps::PixelFormat;
use super::gpu::{
    BackendSettings, DeviceLimits, Gpu, PipelineDesc, QueueFamilies, SubmitDesc, SurfaceSupport,
    SwapchainDesc,
};
use super::resources::{Shader, Texture};
use super::uniforms::BuiltinUniformData;
use crate::window::WindowHost;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    WaitIdle,
    CreateSwapchain { extent: vk::Extent2D, present_mode: vk::PresentModeKHR },
    DestroySwapchain(vk::SwapchainKHR),
    Acquire { semaphore: vk::Semaphore },
    Present { image_index: u32, wait: vk::Semaphore },
    Submit {
        wait: vk::Semaphore,
        wait_stage: vk::PipelineStageFlags,
        command_buffers: Vec<vk::CommandBuffer>,
        signal: vk::Semaphore,
        fence: vk::Fence,
    },
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    BeginCommandBuffer(vk::CommandBuffer),
    EndCommandBuffer(vk::CommandBuffer),
    Transition { image: vk::Image, old: vk::ImageLayout, new: vk::ImageLayout },
    BeginRenderPass { render_pass: vk::RenderPass, framebuffer: vk::Framebuffer, extent: vk::Extent2D },
    EndRenderPass,
    BindPipeline(vk::Pipeline),
    BindVertexBuffers { buffers: Vec<vk::Buffer>, offsets: Vec<vk::DeviceSize> },
    BindIndexBuffer { buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32 },
    DrawIndexed { index_count: u32, instance_count: u32, first_index: u32, vertex_offset: i32 },
    ClearAttachments { colors: Vec<[f32; 4]>, extent: vk::Extent2D },
    CreateRenderPass(vk::Format),
    CreateFramebuffer(vk::ImageView),
    CreatePipeline,
    CreateSampler,
}

struct MockState {
    next_handle: u64,
    calls: Vec<Call>,
    support: SurfaceSupport,
    fences: HashMap<vk::Fence, bool>,
    semaphores: HashSet<vk::Semaphore>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    image_views: HashSet<vk::ImageView>,
    render_passes: HashSet<vk::RenderPass>,
    framebuffers: HashSet<vk::Framebuffer>,
    pipelines: HashSet<vk::Pipeline>,
    samplers: HashSet<vk::Sampler>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    command_buffers: HashSet<vk::CommandBuffer>,
    acquire_results: VecDeque<VkResult<(u32, bool)>>,
    present_results: VecDeque<VkResult<bool>>,
    next_image: u32,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct MockAllocation {
    buffer: vk::Buffer,
}

#[derive(Clone)]
pub struct MockGpu {
    state: Arc<Mutex<MockState>>,
    limits: Arc<DeviceLimits>,
}

impl Default for MockGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGpu {
    pub fn new() -> Self {
        Self::with_extent(800, 600)
    }

    pub fn with_extent(width: u32, height: u32) -> Self {
        let support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 0,
                current_extent: vk::Extent2D { width, height },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 16384, height: 16384 },
                max_image_array_layers: 1,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            },
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        let state = MockState {
            next_handle: 0x1000,
            calls: Vec::new(),
            support,
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            swapchains: HashMap::new(),
            image_views: HashSet::new(),
            render_passes: HashSet::new(),
            framebuffers: HashSet::new(),
            pipelines: HashSet::new(),
            samplers: HashSet::new(),
            buffers: HashMap::new(),
            command_buffers: HashSet::new(),
            acquire_results: VecDeque::new(),
            present_results: VecDeque::new(),
            next_image: 0,
        };

        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            point_size_max: 64.0,
            max_image_dimension_2d: 16384,
            max_image_dimension_3d: 2048,
            max_image_dimension_cube: 16384,
            max_image_array_layers: 2048,
            max_texel_buffer_elements: 1 << 27,
            max_storage_buffer_range: 1 << 30,
            max_sampler_anisotropy: 16.0,
            device_name: "Mock Device".to_string(),
            vendor_id: 0x10DE,
            api_version: vk::make_api_version(0, 1, 3, 0),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            limits: Arc::new(limits),
        }
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn count_calls<P: Fn(&Call) -> bool>(&self, pred: P) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.lock().support.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn set_surface_transform(&self, transform: vk::SurfaceTransformFlagsKHR) {
        self.state.lock().support.capabilities.current_transform = transform;
    }

    pub fn push_acquire_result(&self, result: VkResult<(u32, bool)>) {
        self.state.lock().acquire_results.push_back(result);
    }

    pub fn push_present_result(&self, result: VkResult<bool>) {
        self.state.lock().present_results.push_back(result);
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.lock().buffers.get(&buffer).cloned().unwrap_or_default()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_swapchains(&self) -> usize {
        self.state.lock().swapchains.len()
    }

    pub fn live_image_views(&self) -> usize {
        self.state.lock().image_views.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_render_passes(&self) -> usize {
        self.state.lock().render_passes.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.state.lock().samplers.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }
}

impl Gpu for MockGpu {
    type Allocation = MockAllocation;

    fn probe() -> Result<()> {
        Ok(())
    }

    fn bootstrap(window: &dyn WindowHost, _settings: &BackendSettings) -> Result<Self> {
        let (width, height) = window.drawable_size();
        Ok(Self::with_extent(width, height))
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn queue_families(&self) -> QueueFamilies {
        QueueFamilies { graphics: 0, present: 0 }
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        Ok(self.state.lock().support.clone())
    }

    fn wait_idle(&self) -> VkResult<()> {
        self.record(Call::WaitIdle);
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let handle = vk::SwapchainKHR::from_raw(state.handle());
        let images = (0..desc.image_count)
            .map(|_| vk::Image::from_raw(state.handle()))
            .collect();
        state.swapchains.insert(handle, images);
        state.next_image = 0;
        state.calls.push(Call::CreateSwapchain {
            extent: desc.extent,
            present_mode: desc.present_mode,
        });
        Ok(handle)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain);
        state.calls.push(Call::DestroySwapchain(swapchain));
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.lock();
        state.calls.push(Call::Acquire { semaphore });
        if let Some(result) = state.acquire_results.pop_front() {
            return result;
        }
        let count = state
            .swapchains
            .get(&swapchain)
            .map(|images| images.len() as u32)
            .ok_or(vk::Result::ERROR_OUT_OF_DATE_KHR)?;
        let index = state.next_image % count;
        state.next_image = (index + 1) % count;
        Ok((index, false))
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::Present {
            image_index,
            wait: wait_semaphore,
        });
        state.present_results.pop_front().unwrap_or(Ok(false))
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> VkResult<vk::ImageView> {
        let mut state = self.state.lock();
        let view = vk::ImageView::from_raw(state.handle());
        state.image_views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().image_views.remove(&view);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().semaphores.remove(&semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let fence = vk::Fence::from_raw(state.handle());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitFence(fence));
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            // Nothing will ever signal it
            Some(false) => Err(vk::Result::TIMEOUT),
            None => Err(vk::Result::ERROR_DEVICE_LOST),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::ResetFence(fence));
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }

    fn queue_submit(&self, submit: &SubmitDesc) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Submit {
            wait: submit.wait_semaphore,
            wait_stage: submit.wait_stage,
            command_buffers: submit.command_buffers.to_vec(),
            signal: submit.signal_semaphore,
            fence: submit.fence,
        });
        let signaled = state
            .fences
            .get_mut(&submit.fence)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        *signaled = true;
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let buffers: Vec<vk::CommandBuffer> = (0..count)
            .map(|_| vk::CommandBuffer::from_raw(state.handle()))
            .collect();
        state.command_buffers.extend(buffers.iter().copied());
        Ok(buffers)
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cb in command_buffers {
            state.command_buffers.remove(cb);
        }
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::BeginCommandBuffer(cb));
        Ok(())
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        self.record(Call::EndCommandBuffer(cb));
        Ok(())
    }

    fn cmd_transition_image_layout(
        &self,
        _cb: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        self.record(Call::Transition {
            image,
            old: old_layout,
            new: new_layout,
        });
    }

    fn cmd_begin_render_pass(
        &self,
        _cb: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        self.record(Call::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
        });
    }

    fn cmd_end_render_pass(&self, _cb: vk::CommandBuffer) {
        self.record(Call::EndRenderPass);
    }

    fn cmd_bind_pipeline(&self, _cb: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.record(Call::BindPipeline(pipeline));
    }

    fn cmd_bind_vertex_buffers(
        &self,
        _cb: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.record(Call::BindVertexBuffers {
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    fn cmd_bind_index_buffer(
        &self,
        _cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(Call::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    fn cmd_draw(&self, _cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        self.record(Call::Draw {
            vertex_count,
            instance_count,
            first_vertex,
        });
    }

    fn cmd_draw_indexed(
        &self,
        _cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        self.record(Call::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
        });
    }

    fn cmd_clear_attachments(
        &self,
        _cb: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rect: vk::ClearRect,
    ) {
        let colors = attachments
            .iter()
            .map(|a| unsafe { a.clear_value.color.float32 })
            .collect();
        self.record(Call::ClearAttachments {
            colors,
            extent: rect.rect.extent,
        });
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> VkResult<vk::RenderPass> {
        let mut state = self.state.lock();
        let pass = vk::RenderPass::from_raw(state.handle());
        state.render_passes.insert(pass);
        state.calls.push(Call::CreateRenderPass(key.color_format));
        Ok(pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().render_passes.remove(&render_pass);
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> VkResult<vk::Framebuffer> {
        let mut state = self.state.lock();
        let framebuffer = vk::Framebuffer::from_raw(state.handle());
        state.framebuffers.insert(framebuffer);
        state.calls.push(Call::CreateFramebuffer(key.image_view));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().framebuffers.remove(&framebuffer);
    }

    fn create_graphics_pipeline(&self, _desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        let mut state = self.state.lock();
        let pipeline = vk::Pipeline::from_raw(state.handle());
        state.pipelines.insert(pipeline);
        state.calls.push(Call::CreatePipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_sampler(&self, _key: &SamplerKey) -> VkResult<vk::Sampler> {
        let mut state = self.state.lock();
        let sampler = vk::Sampler::from_raw(state.handle());
        state.samplers.insert(sampler);
        state.calls.push(Call::CreateSampler);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _name: &str,
    ) -> Result<(vk::Buffer, MockAllocation)> {
        let mut state = self.state.lock();
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(buffer, vec![0u8; size as usize]);
        Ok((buffer, MockAllocation { buffer }))
    }

    fn write_buffer(
        &self,
        allocation: &mut MockAllocation,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&allocation.buffer)
            .context("write to destroyed buffer")?;
        let start = offset as usize;
        contents
            .get_mut(start..start + data.len())
            .context("write out of bounds")?
            .copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _allocation: MockAllocation) {
        self.state.lock().buffers.remove(&buffer);
    }
}

/// Shader double that remembers the last uniform block and texture
pub struct MockShader {
    id: ShaderId,
    pub uniforms: RefCell<Option<BuiltinUniformData>>,
    pub main_texture: Cell<vk::Image>,
    pub descriptor_pushes: Cell<usize>,
}

impl MockShader {
    pub fn new(id: u64) -> Self {
        Self {
            id: ShaderId(id),
            uniforms: RefCell::new(None),
            main_texture: Cell::new(vk::Image::null()),
            descriptor_pushes: Cell::new(0),
        }
    }
}

impl Shader for MockShader {
    fn id(&self) -> ShaderId {
        self.id
    }

    fn stages(&self) -> &[vk::PipelineShaderStageCreateInfo] {
        &[]
    }

    fn pipeline_layout(&self) -> vk::PipelineLayout {
        vk::PipelineLayout::from_raw(0xABCD)
    }

    fn set_uniform_data(&self, data: &BuiltinUniformData) {
        *self.uniforms.borrow_mut() = Some(*data);
    }

    fn set_main_texture(&self, texture: &dyn Texture) {
        self.main_texture.set(texture.image());
    }

    fn cmd_push_descriptor_sets(&self, _cb: vk::CommandBuffer, _frame: usize) -> Result<()> {
        self.descriptor_pushes.set(self.descriptor_pushes.get() + 1);
        Ok(())
    }
}

pub struct MockTexture {
    pub image: vk::Image,
    pub view: Option<vk::ImageView>,
    pub format: PixelFormat,
    pub size: (u32, u32),
}

impl MockTexture {
    pub fn plain(raw: u64) -> Self {
        Self {
            image: vk::Image::from_raw(raw),
            view: None,
            format: PixelFormat::Rgba8Unorm,
            size: (1, 1),
        }
    }

    pub fn render_target(raw: u64, width: u32, height: u32) -> Self {
        Self {
            image: vk::Image::from_raw(raw),
            view: Some(vk::ImageView::from_raw(raw + 1)),
            format: PixelFormat::Rgba8Unorm,
            size: (width, height),
        }
    }
}

impl Texture for MockTexture {
    fn image(&self) -> vk::Image {
        self.image
    }

    fn render_target_view(&self) -> Option<vk::ImageView> {
        self.view
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn pixel_size(&self) -> (u32, u32) {
        self.size
    }
}

/// Window double with a fixed drawable size
pub struct MockWindow {
    pub size: (u32, u32),
}

impl WindowHost for MockWindow {
    fn native_window_handle(&self) -> Result<raw_window_handle::RawWindowHandle> {
        Ok(raw_window_handle::RawWindowHandle::Web(
            raw_window_handle::WebWindowHandle::new(1),
        ))
    }

    fn native_display_handle(&self) -> Result<raw_window_handle::RawDisplayHandle> {
        Ok(raw_window_handle::RawDisplayHandle::Web(
            raw_window_handle::WebDisplayHandle::new(),
        ))
    }

    fn drawable_size(&self) -> (u32, u32) {
        self.size
    }
}
