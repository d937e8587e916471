// vk2d - Vulkan backend for a 2D game framework
//
// FRAME FLOW (two frames in flight):
// 1. Wait for the slot's fence, acquire a swap-chain image
// 2. Run cleanup deferred against the slot, begin command buffers
// 3. Record clears and draws; pipelines/render passes come from caches
// 4. Submit uploads then draws, present, rotate to the next slot

pub mod backend;
pub mod config;
pub mod renderer;
pub mod window;

pub use backend::{BackendSettings, Graphics, Vsync};
pub use renderer::{create_instance, GraphicsBackend, RendererKind};
pub use window::WindowHost;
