// Synchronization primitives
//
// Fences and semaphores for one frame in flight, plus the frame slot that
// bundles them with the slot's command buffers and batched draw buffers.

use anyhow::{Context, Result};
use ash::vk;

use super::buffer::BatchedDrawBuffers;
use super::gpu::Gpu;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new<G: Gpu>(gpu: &G) -> Result<Self> {
        let image_available = gpu
            .create_semaphore()
            .context("failed to create synchronization objects for a frame")?;
        let render_finished = gpu
            .create_semaphore()
            .context("failed to create synchronization objects for a frame")?;
        // Start signaled so the first wait returns immediately
        let in_flight_fence = gpu
            .create_fence(true)
            .context("failed to create synchronization objects for a frame")?;

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }

    pub fn destroy<G: Gpu>(&self, gpu: &G) {
        gpu.destroy_semaphore(self.image_available);
        gpu.destroy_semaphore(self.render_finished);
        gpu.destroy_fence(self.in_flight_fence);
    }
}

/// Everything owned by one frame in flight
pub struct FrameSlot<G: Gpu> {
    pub draw_commands: vk::CommandBuffer,
    /// Uploads recorded here run before `draw_commands` in the same submit
    pub transfer_commands: vk::CommandBuffer,
    pub sync: FrameSync,
    pub batched: BatchedDrawBuffers<G>,
}

impl<G: Gpu> FrameSlot<G> {
    pub fn new(
        gpu: &G,
        draw_commands: vk::CommandBuffer,
        transfer_commands: vk::CommandBuffer,
    ) -> Result<Self> {
        Ok(Self {
            draw_commands,
            transfer_commands,
            sync: FrameSync::new(gpu)?,
            batched: BatchedDrawBuffers::new(gpu)?,
        })
    }

    /// Block until the slot's previous submission has completed
    pub fn wait(&self, gpu: &G) -> Result<()> {
        gpu.wait_for_fence(self.sync.in_flight_fence, u64::MAX)
            .context("failed to wait for in-flight fence")
    }

    /// Release sync objects; buffers go with the slot itself
    pub fn destroy(self, gpu: &G) {
        self.sync.destroy(gpu);
    }
}

/// Build one slot per frame in flight from freshly allocated command buffers
pub fn create_frame_slots<G: Gpu>(gpu: &G, count: usize) -> Result<Vec<FrameSlot<G>>> {
    let draw = gpu
        .allocate_command_buffers(count as u32)
        .context("failed to allocate command buffers")?;
    let transfer = gpu
        .allocate_command_buffers(count as u32)
        .context("failed to allocate data transfer command buffers")?;

    draw.into_iter()
        .zip(transfer)
        .map(|(d, t)| FrameSlot::new(gpu, d, t))
        .collect()
}
