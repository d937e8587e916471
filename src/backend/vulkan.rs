// Vulkan implementation of the GPU interface
//
// Thin wrappers over ash. Object creation for cached handles is delegated
// to `pipeline.rs`; buffers are host-visible gpu-allocator allocations.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::prelude::VkResult;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::cache::{FramebufferKey, RenderPassKey, SamplerKey};
use super::device::VulkanDevice;
use super::gpu::{
    BackendSettings, DeviceLimits, Gpu, PipelineDesc, QueueFamilies, SubmitDesc, SurfaceSupport,
    SwapchainDesc,
};
use super::pipeline;
use crate::window::WindowHost;

#[derive(Clone)]
pub struct VulkanGpu {
    device: Arc<VulkanDevice>,
    swapchain_loader: Arc<khr::Swapchain>,
    push_descriptor: Arc<khr::PushDescriptor>,
}

impl VulkanGpu {
    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Loader for `vkCmdPushDescriptorSetKHR`, used by shader objects
    pub fn push_descriptor(&self) -> &khr::PushDescriptor {
        &self.push_descriptor
    }

    fn raw(&self) -> &ash::Device {
        &self.device.device
    }
}

impl Gpu for VulkanGpu {
    type Allocation = Allocation;

    fn probe() -> Result<()> {
        VulkanDevice::load_entry().map(|_| ())
    }

    fn bootstrap(window: &dyn WindowHost, settings: &BackendSettings) -> Result<Self> {
        let device = Arc::new(VulkanDevice::new(window, settings)?);
        let swapchain_loader = Arc::new(khr::Swapchain::new(&device.instance, &device.device));
        let push_descriptor = Arc::new(khr::PushDescriptor::new(&device.instance, &device.device));

        Ok(Self {
            device,
            swapchain_loader,
            push_descriptor,
        })
    }

    fn limits(&self) -> &DeviceLimits {
        &self.device.limits
    }

    fn queue_families(&self) -> QueueFamilies {
        self.device.queue_families
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        let loader = &self.device.surface_loader;
        let physical = self.device.physical_device;
        let surface = self.device.surface;
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader.get_physical_device_surface_capabilities(physical, surface)?,
                formats: loader.get_physical_device_surface_formats(physical, surface)?,
                present_modes: loader.get_physical_device_surface_present_modes(physical, surface)?,
            })
        }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.raw().device_wait_idle() }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR> {
        let families = self.device.queue_families;
        let family_indices = [families.graphics, families.present];

        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.device.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        info = if families.graphics != families.present {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        unsafe { self.swapchain_loader.create_swapchain(&info, None) }
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue, &info)
        }
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> VkResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.raw().create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.raw().destroy_image_view(view, None) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.raw().create_semaphore(&info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.raw().create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.raw().destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.raw().wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.raw().reset_fences(&[fence]) }
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.raw().get_fence_status(fence) }
    }

    fn queue_submit(&self, submit: &SubmitDesc) -> VkResult<()> {
        let wait_semaphores = [submit.wait_semaphore];
        let wait_stages = [submit.wait_stage];
        let signal_semaphores = [submit.signal_semaphore];

        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(submit.command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            self.raw()
                .queue_submit(self.device.graphics_queue, &[info], submit.fence)
        }
    }

    fn allocate_command_buffers(&self, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.device.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.raw().allocate_command_buffers(&info) }
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        unsafe {
            self.raw()
                .free_command_buffers(self.device.command_pool, command_buffers)
        }
    }

    fn begin_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        // Implicit reset: the pool allows per-buffer resets
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.raw().begin_command_buffer(cb, &info) }
    }

    fn end_command_buffer(&self, cb: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.raw().end_command_buffer(cb) }
    }

    fn cmd_transition_image_layout(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let transition = pipeline::layout_transition(old_layout, new_layout);
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            })
            .src_access_mask(transition.src_access)
            .dst_access_mask(transition.dst_access)
            .build();

        unsafe {
            self.raw().cmd_pipeline_barrier(
                cb,
                transition.src_stage,
                transition.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    fn cmd_begin_render_pass(
        &self,
        cb: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });

        unsafe {
            self.raw()
                .cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE)
        }
    }

    fn cmd_end_render_pass(&self, cb: vk::CommandBuffer) {
        unsafe { self.raw().cmd_end_render_pass(cb) }
    }

    fn cmd_bind_pipeline(&self, cb: vk::CommandBuffer, pipeline: vk::Pipeline) {
        unsafe {
            self.raw()
                .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline)
        }
    }

    fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe { self.raw().cmd_bind_vertex_buffers(cb, 0, buffers, offsets) }
    }

    fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.raw()
                .cmd_bind_index_buffer(cb, buffer, offset, index_type)
        }
    }

    fn cmd_draw(&self, cb: vk::CommandBuffer, vertex_count: u32, instance_count: u32, first_vertex: u32) {
        unsafe {
            self.raw()
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, 0)
        }
    }

    fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    ) {
        unsafe {
            self.raw().cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                0,
            )
        }
    }

    fn cmd_clear_attachments(
        &self,
        cb: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rect: vk::ClearRect,
    ) {
        unsafe { self.raw().cmd_clear_attachments(cb, attachments, &[rect]) }
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> VkResult<vk::RenderPass> {
        pipeline::create_render_pass(self.raw(), key)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.raw().destroy_render_pass(render_pass, None) }
    }

    fn create_framebuffer(&self, key: &FramebufferKey) -> VkResult<vk::Framebuffer> {
        pipeline::create_framebuffer(self.raw(), key)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.raw().destroy_framebuffer(framebuffer, None) }
    }

    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        pipeline::create_graphics_pipeline(self.raw(), desc)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.raw().destroy_pipeline(pipeline, None) }
    }

    fn create_sampler(&self, key: &SamplerKey) -> VkResult<vk::Sampler> {
        pipeline::create_sampler(self.raw(), key)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.raw().destroy_sampler(sampler, None) }
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.raw().create_buffer(&info, None) }
            .context("Failed to create buffer")?;
        let requirements = unsafe { self.raw().get_buffer_memory_requirements(buffer) };

        let allocation = {
            let mut guard = self.device.allocator.lock();
            let allocator = guard.as_mut().context("Memory allocator already destroyed")?;
            allocator.allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };

        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.raw().destroy_buffer(buffer, None) };
                return Err(err).context("Failed to allocate buffer memory");
            }
        };

        let bound = unsafe {
            self.raw()
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            self.destroy_buffer(buffer, allocation);
            return Err(err).context("Failed to bind buffer memory");
        }

        Ok((buffer, allocation))
    }

    fn write_buffer(
        &self,
        allocation: &mut Allocation,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let mapped = allocation
            .mapped_slice_mut()
            .context("Buffer memory is not host visible")?;
        let start = offset as usize;
        mapped
            .get_mut(start..start + data.len())
            .context("Buffer write out of bounds")?
            .copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        if let Some(allocator) = self.device.allocator.lock().as_mut() {
            if let Err(err) = allocator.free(allocation) {
                log::warn!("Failed to free buffer memory: {}", err);
            }
        }
        unsafe { self.raw().destroy_buffer(buffer, None) }
    }
}
