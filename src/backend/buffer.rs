// Buffer utilities for vertex, index and constant data
//
// All buffers here are host-visible and written through a persistent
// mapping. Stream buffers are filled front to back within a frame and
// rewound when their frame slot is reused.

use anyhow::{bail, Context, Result};
use ash::vk;

use super::gpu::Gpu;
use super::state::Color;

/// Initial size of each slot's batched vertex stream
pub const INITIAL_VERTEX_STREAM_SIZE: vk::DeviceSize = 1024 * 1024;

/// GPU buffer that frees itself on drop
pub struct GpuBuffer<G: Gpu> {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<G::Allocation>,
    gpu: G,
}

impl<G: Gpu> GpuBuffer<G> {
    pub fn new(gpu: &G, size: vk::DeviceSize, usage: vk::BufferUsageFlags, name: &str) -> Result<Self> {
        let (handle, allocation) = gpu
            .create_buffer(size, usage, name)
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        Ok(Self {
            handle,
            size,
            allocation: Some(allocation),
            gpu: gpu.clone(),
        })
    }

    /// Create a buffer and fill it with data
    pub fn with_data(gpu: &G, usage: vk::BufferUsageFlags, data: &[u8], name: &str) -> Result<Self> {
        let mut buffer = Self::new(gpu, data.len() as vk::DeviceSize, usage, name)?;
        buffer.write(0, data)?;
        Ok(buffer)
    }

    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        if offset + data.len() as vk::DeviceSize > self.size {
            bail!(
                "write of {} bytes at offset {} overflows buffer of {} bytes",
                data.len(),
                offset,
                self.size
            );
        }
        let allocation = self
            .allocation
            .as_mut()
            .context("buffer already destroyed")?;
        self.gpu.write_buffer(allocation, offset, data)
    }
}

impl<G: Gpu> Drop for GpuBuffer<G> {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.gpu.destroy_buffer(self.handle, allocation);
        }
    }
}

/// Append-only per-frame buffer
pub struct StreamBuffer<G: Gpu> {
    buffer: GpuBuffer<G>,
    usage: vk::BufferUsageFlags,
    name: &'static str,
    used: vk::DeviceSize,
}

impl<G: Gpu> StreamBuffer<G> {
    pub fn new(gpu: &G, usage: vk::BufferUsageFlags, size: vk::DeviceSize, name: &'static str) -> Result<Self> {
        Ok(Self {
            buffer: GpuBuffer::new(gpu, size, usage, name)?,
            usage,
            name,
            used: 0,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle
    }

    pub fn capacity(&self) -> vk::DeviceSize {
        self.buffer.size
    }

    pub fn used(&self) -> vk::DeviceSize {
        self.used
    }

    pub fn remaining(&self) -> vk::DeviceSize {
        self.capacity() - self.used
    }

    /// Append `data`, returning the offset it was written at
    pub fn append(&mut self, data: &[u8]) -> Result<vk::DeviceSize> {
        let offset = self.used;
        self.buffer.write(offset, data)?;
        self.used += data.len() as vk::DeviceSize;
        Ok(offset)
    }

    /// Rewind to the start; only valid once the owning slot's fence signaled
    pub fn next_frame(&mut self) {
        self.used = 0;
    }

    /// Make room for `needed` more bytes. When the buffer has to grow, the
    /// replaced buffer is returned so the caller can defer its destruction
    /// until in-flight work that references it has finished.
    pub fn reserve(&mut self, needed: vk::DeviceSize) -> Result<Option<GpuBuffer<G>>> {
        if needed <= self.remaining() {
            return Ok(None);
        }

        let new_size = grown_capacity(self.capacity(), needed);
        log::debug!(
            "Growing {} stream buffer: {} -> {} bytes",
            self.name,
            self.capacity(),
            new_size
        );

        let gpu = self.buffer.gpu.clone();
        let replacement = GpuBuffer::new(&gpu, new_size, self.usage, self.name)?;
        let old = std::mem::replace(&mut self.buffer, replacement);
        self.used = 0;
        Ok(Some(old))
    }
}

/// Smallest power of two holding `needed` bytes, at least double `current`
pub fn grown_capacity(current: vk::DeviceSize, needed: vk::DeviceSize) -> vk::DeviceSize {
    needed.next_power_of_two().max(current.saturating_mul(2))
}

/// Per-slot buffers backing batched draws
pub struct BatchedDrawBuffers<G: Gpu> {
    pub vertices: StreamBuffer<G>,
    /// Single white RGBA32F color read with stride 0
    pub constant_color: GpuBuffer<G>,
}

impl<G: Gpu> BatchedDrawBuffers<G> {
    pub fn new(gpu: &G) -> Result<Self> {
        let vertices = StreamBuffer::new(
            gpu,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            INITIAL_VERTEX_STREAM_SIZE,
            "batched vertices",
        )?;
        let constant_color = GpuBuffer::with_data(
            gpu,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::bytes_of(&Color::WHITE.to_array()),
            "constant color",
        )?;

        Ok(Self {
            vertices,
            constant_color,
        })
    }

    pub fn next_frame(&mut self) {
        self.vertices.next_frame();
    }
}

/// Index data for `quads` quads drawn as two triangles each
pub fn quad_indices(quads: usize) -> Vec<u16> {
    let mut indices = Vec::with_capacity(quads * 6);
    for q in 0..quads {
        let base = (q * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 1, base + 3]);
    }
    indices
}
