// GPU device interface
//
// Every component that talks to the device goes through `Gpu`. The ash
// implementation lives in `vulkan.rs`; tests use a recording mock. Raw calls
// return `VkResult` so callers can tell swap-chain staleness apart from
// real failures.

use anyhow::Result;
use ash::prelude::VkResult;
use ash::vk;

use super::cache::{FramebufferKey, PipelineKey, RenderPassKey, SamplerKey};
use super::swapchain::Vsync;
use super::vertex::VertexInputLayout;
use crate::window::WindowHost;

/// Backend options fixed at mode-set time
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub app_name: String,
    pub validation: bool,
    pub vsync: Vsync,
    pub gamma_correct: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            app_name: "vk2d".to_string(),
            validation: false,
            vsync: Vsync::On,
            gamma_correct: false,
        }
    }
}

/// Device properties recorded once at bootstrap
#[derive(Debug, Clone, Default)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: vk::DeviceSize,
    pub point_size_max: f32,
    pub max_image_dimension_2d: u32,
    pub max_image_dimension_3d: u32,
    pub max_image_dimension_cube: u32,
    pub max_image_array_layers: u32,
    pub max_texel_buffer_elements: u32,
    pub max_storage_buffer_range: u32,
    pub max_sampler_anisotropy: f32,
    pub device_name: String,
    pub vendor_id: u32,
    pub api_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    /// Distinct family indices, graphics first
    pub fn unique(&self) -> Vec<u32> {
        if self.graphics == self.present {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.present]
        }
    }
}

/// What the surface supports on the chosen adapter
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
}

/// One queue submission: uploads and draws wait on acquisition and
/// signal both the render-finished semaphore and the slot fence.
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc<'a> {
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub command_buffers: &'a [vk::CommandBuffer],
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub struct PipelineDesc<'a> {
    pub key: &'a PipelineKey,
    pub stages: &'a [vk::PipelineShaderStageCreateInfo],
    pub layout: vk::PipelineLayout,
    pub vertex_input: &'a VertexInputLayout,
}

pub trait Gpu: Clone + 'static {
    /// Memory backing a buffer created by `create_buffer`
    type Allocation: 'static;

    /// Check that the API can be loaded at all
    fn probe() -> Result<()>;

    /// Create instance, surface, device and queues for `window`
    fn bootstrap(window: &dyn WindowHost, settings: &BackendSettings) -> Result<Self>;

    fn limits(&self) -> &DeviceLimits;
    fn queue_families(&self) -> QueueFamilies;
    fn surface_support(&self) -> VkResult<SurfaceSupport>;
    fn wait_idle(&self) -> VkResult<()>;

    // Swap chain
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;
    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // Synchronization
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;
    fn queue_submit(&self, submit: &SubmitDesc) -> VkResult<()>;

    // Command buffers
    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);
    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()>;

    // Recording
    fn cmd_transition_image_layout(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_begin_render_pass(
        &self,
        cb: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    );
    fn cmd_end_render_pass(&self, cb: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32);
    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    );
    fn cmd_clear_attachments(
        &self,
        cb: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rect: vk::ClearRect,
    );

    // Cached objects
    fn create_render_pass(&self, key: &RenderPassKey) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, key: &FramebufferKey) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
    fn create_sampler(&self, key: &SamplerKey) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Host-visible buffers
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<(vk::Buffer, Self::Allocation)>;
    fn write_buffer(
        &self,
        allocation: &mut Self::Allocation,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()>;
    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Self::Allocation);
}
