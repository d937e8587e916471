// Vertex layout description and Vulkan vertex-input derivation
//
// Callers describe their vertex streams as a set of enabled attribute
// slots, each reading from one of a small number of buffer slots. Pipelines
// need the Vulkan binding/attribute tables for that set, and every pipeline
// must expose a color input, so a constant-color binding is appended when
// the caller supplies no per-vertex color.

use anyhow::{bail, Context, Result};
use ash::vk;

pub const MAX_ATTRIBUTES: usize = 16;
pub const MAX_BUFFERS: usize = 8;

/// Standard attribute locations
pub const ATTRIB_POS: usize = 0;
pub const ATTRIB_TEXCOORD: usize = 1;
pub const ATTRIB_COLOR: usize = 2;

/// Format read for the synthetic constant color input
pub const CONSTANT_COLOR_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub buffer_index: u8,
    pub offset: u16,
    pub format: vk::Format,
}

impl Default for VertexAttribute {
    fn default() -> Self {
        Self {
            buffer_index: 0,
            offset: 0,
            format: vk::Format::UNDEFINED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferLayout {
    pub stride: u16,
}

/// Enabled attribute set plus per-buffer layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VertexAttributes {
    pub enable_bits: u32,
    /// Buffer slots advanced per instance instead of per vertex
    pub instance_bits: u32,
    pub attribs: [VertexAttribute; MAX_ATTRIBUTES],
    pub buffer_layouts: [BufferLayout; MAX_BUFFERS],
}

impl VertexAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(
        &mut self,
        location: usize,
        buffer_index: u8,
        offset: u16,
        format: vk::Format,
    ) -> Result<()> {
        check_location(location)?;
        check_buffer_slot(buffer_index)?;
        self.enable_bits |= 1 << location;
        self.attribs[location] = VertexAttribute {
            buffer_index,
            offset,
            format,
        };
        Ok(())
    }

    pub fn set_buffer_layout(&mut self, buffer_index: u8, stride: u16) -> Result<()> {
        check_buffer_slot(buffer_index)?;
        self.buffer_layouts[buffer_index as usize] = BufferLayout { stride };
        Ok(())
    }

    pub fn is_enabled(&self, location: usize) -> bool {
        location < MAX_ATTRIBUTES && self.enable_bits & (1 << location) != 0
    }

    pub fn uses_vertex_color(&self) -> bool {
        self.is_enabled(ATTRIB_COLOR)
    }
}

/// Buffer bound to one buffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferBindings {
    pub info: [Option<BufferBinding>; MAX_BUFFERS],
}

impl BufferBindings {
    pub fn set(&mut self, slot: u8, buffer: vk::Buffer, offset: vk::DeviceSize) -> Result<()> {
        check_buffer_slot(slot)?;
        self.info[slot as usize] = Some(BufferBinding { buffer, offset });
        Ok(())
    }
}

fn check_location(location: usize) -> Result<()> {
    if location >= MAX_ATTRIBUTES {
        bail!(
            "vertex attribute location {} out of range (max {})",
            location,
            MAX_ATTRIBUTES - 1
        );
    }
    Ok(())
}

fn check_buffer_slot(slot: u8) -> Result<()> {
    if slot as usize >= MAX_BUFFERS {
        bail!("vertex buffer slot {} out of range (max {})", slot, MAX_BUFFERS - 1);
    }
    Ok(())
}

/// Vulkan vertex-input tables derived from a `VertexAttributes`
#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    /// Caller buffer slot backing each binding, in binding order
    pub buffer_slots: Vec<u8>,
    /// Binding index of the synthetic constant color stream, if appended
    pub constant_color_binding: Option<u32>,
}

impl VertexInputLayout {
    /// Vertex buffers to bind (starting at binding 0) for this layout
    pub fn resolve_buffers(
        &self,
        buffers: &BufferBindings,
        constant_color: vk::Buffer,
    ) -> Result<(Vec<vk::Buffer>, Vec<vk::DeviceSize>)> {
        let mut handles = Vec::with_capacity(self.bindings.len());
        let mut offsets = Vec::with_capacity(self.bindings.len());

        for &slot in &self.buffer_slots {
            let binding = buffers
                .info
                .get(slot as usize)
                .copied()
                .flatten()
                .with_context(|| format!("no vertex buffer bound to slot {}", slot))?;
            handles.push(binding.buffer);
            offsets.push(binding.offset);
        }

        if self.constant_color_binding.is_some() {
            handles.push(constant_color);
            offsets.push(0);
        }

        Ok((handles, offsets))
    }
}

/// Derive binding and attribute descriptions for the enabled attributes.
///
/// Bindings are numbered by first use among enabled attributes, one per
/// distinct buffer slot. When no color attribute is enabled a zero-stride
/// binding is appended at the next index and feeds location `ATTRIB_COLOR`.
/// Fails when an enabled attribute names a buffer slot past `MAX_BUFFERS`.
pub fn derive_vertex_input(attributes: &VertexAttributes) -> Result<VertexInputLayout> {
    let mut layout = VertexInputLayout::default();

    for location in 0..MAX_ATTRIBUTES {
        if !attributes.is_enabled(location) {
            continue;
        }

        let attrib = attributes.attribs[location];
        let slot = attrib.buffer_index;
        check_buffer_slot(slot)
            .with_context(|| format!("attribute at location {}", location))?;

        let binding = match layout.buffer_slots.iter().position(|&s| s == slot) {
            Some(index) => index as u32,
            None => {
                let index = layout.buffer_slots.len() as u32;
                let input_rate = if attributes.instance_bits & (1 << slot) != 0 {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                };
                layout.buffer_slots.push(slot);
                layout.bindings.push(
                    vk::VertexInputBindingDescription::builder()
                        .binding(index)
                        .stride(attributes.buffer_layouts[slot as usize].stride as u32)
                        .input_rate(input_rate)
                        .build(),
                );
                index
            }
        };

        layout.attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .location(location as u32)
                .binding(binding)
                .format(attrib.format)
                .offset(attrib.offset as u32)
                .build(),
        );
    }

    if !attributes.uses_vertex_color() {
        let binding = layout.buffer_slots.len() as u32;
        // Zero stride: every vertex reads the same color
        layout.bindings.push(
            vk::VertexInputBindingDescription::builder()
                .binding(binding)
                .stride(0)
                .input_rate(vk::VertexInputRate::VERTEX)
                .build(),
        );
        layout.attributes.push(
            vk::VertexInputAttributeDescription::builder()
                .location(ATTRIB_COLOR as u32)
                .binding(binding)
                .format(CONSTANT_COLOR_FORMAT)
                .offset(0)
                .build(),
        );
        layout.constant_color_binding = Some(binding);
    }

    Ok(layout)
}

/// Vertex formats used by batched draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// position: 2 x f32
    Xyf,
    /// position: 2 x f32, texcoord: 2 x f32
    XyfStf,
    /// position: 2 x f32, texcoord: 2 x f32, color: 4 x u8 normalized
    XyfStfRgbaub,
    /// position: 2 x f32, color: 4 x u8 normalized
    XyfRgbaub,
}

impl VertexFormat {
    pub fn stride(self) -> u16 {
        match self {
            VertexFormat::Xyf => 8,
            VertexFormat::XyfStf => 16,
            VertexFormat::XyfStfRgbaub => 20,
            VertexFormat::XyfRgbaub => 12,
        }
    }

    /// Attribute set reading this format from `buffer_index`
    pub fn attributes(self, buffer_index: u8) -> Result<VertexAttributes> {
        let mut attrs = VertexAttributes::new();
        attrs.set(ATTRIB_POS, buffer_index, 0, vk::Format::R32G32_SFLOAT)?;
        match self {
            VertexFormat::Xyf => {}
            VertexFormat::XyfStf => {
                attrs.set(ATTRIB_TEXCOORD, buffer_index, 8, vk::Format::R32G32_SFLOAT)?;
            }
            VertexFormat::XyfStfRgbaub => {
                attrs.set(ATTRIB_TEXCOORD, buffer_index, 8, vk::Format::R32G32_SFLOAT)?;
                attrs.set(ATTRIB_COLOR, buffer_index, 16, vk::Format::R8G8B8A8_UNORM)?;
            }
            VertexFormat::XyfRgbaub => {
                attrs.set(ATTRIB_COLOR, buffer_index, 8, vk::Format::R8G8B8A8_UNORM)?;
            }
        }
        attrs.set_buffer_layout(buffer_index, self.stride())?;
        Ok(attrs)
    }
}
