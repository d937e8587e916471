// Backend module - Vulkan 2D graphics backend
//
// Layering, bottom up:
//   gpu (device-call seam) <- vulkan (ash) | mock (tests)
//   swapchain, sync, buffer, cache, cleanup  - per-concern building blocks
//   graphics                                 - frame recorder and session

pub mod buffer;
pub mod cache;
pub mod caps;
pub mod cleanup;
pub mod device;
pub mod gpu;
pub mod graphics;
pub mod pipeline;
pub mod resources;
pub mod state;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod uniforms;
pub mod vertex;
pub mod vulkan;

#[cfg(test)]
pub mod mock;

pub use gpu::{BackendSettings, Gpu};
pub use graphics::{
    BatchIndexMode, BatchedDrawRequest, DrawCommand, DrawIndexedCommand, FrameStats, Graphics,
    FRAMES_IN_FLIGHT,
};
pub use resources::{Shader, Texture};
pub use swapchain::Vsync;
pub use vulkan::VulkanGpu;
