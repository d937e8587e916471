// Render state
//
// Snapshot of everything that governs how draw commands are turned into
// pipelines: blend, winding, scissor, color mask, point size, wireframe.
// Snapshots live on a stack; the top entry is the active one.

use anyhow::{bail, Result};
use ash::vk;

/// Maximum number of user pushes on the state stack
pub const MAX_USER_STACK_DEPTH: usize = 128;

/// Linear RGBA color, components in 0..=1
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const WHITE: Color = Color::new(1.0, 1.0, 1.0, 1.0);
    pub const BLACK: Color = Color::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn from_array(c: [f32; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }

    pub fn clamped(self) -> Self {
        Self {
            r: self.r.clamp(0.0, 1.0),
            g: self.g.clamp(0.0, 1.0),
            b: self.b.clamp(0.0, 1.0),
            a: self.a.clamp(0.0, 1.0),
        }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Winding {
    Cw,
    #[default]
    Ccw,
}

impl Winding {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            Winding::Cw => vk::FrontFace::CLOCKWISE,
            Winding::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Back,
    Front,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::Front => vk::CullModeFlags::FRONT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveType {
    #[default]
    Triangles,
    TriangleStrip,
    TriangleFan,
    Points,
}

impl PrimitiveType {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveType::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveType::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
            PrimitiveType::Points => vk::PrimitiveTopology::POINT_LIST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturated,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendFactor::SrcAlphaSaturated => vk::BlendFactor::SRC_ALPHA_SATURATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOp::Add => vk::BlendOp::ADD,
            BlendOp::Subtract => vk::BlendOp::SUBTRACT,
            BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOp::Min => vk::BlendOp::MIN,
            BlendOp::Max => vk::BlendOp::MAX,
        }
    }
}

/// Fixed-function blend configuration for the single color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enable: bool,
    pub op_rgb: BlendOp,
    pub op_alpha: BlendOp,
    pub src_rgb: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendState {
    /// Standard "alpha" blending with non-premultiplied sources
    pub const fn alpha() -> Self {
        Self {
            enable: true,
            op_rgb: BlendOp::Add,
            op_alpha: BlendOp::Add,
            src_rgb: BlendFactor::SrcAlpha,
            src_alpha: BlendFactor::One,
            dst_rgb: BlendFactor::OneMinusSrcAlpha,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
        }
    }

    pub const fn additive() -> Self {
        Self {
            enable: true,
            op_rgb: BlendOp::Add,
            op_alpha: BlendOp::Add,
            src_rgb: BlendFactor::SrcAlpha,
            src_alpha: BlendFactor::SrcAlpha,
            dst_rgb: BlendFactor::One,
            dst_alpha: BlendFactor::One,
        }
    }

    pub const fn replace() -> Self {
        Self {
            enable: false,
            op_rgb: BlendOp::Add,
            op_alpha: BlendOp::Add,
            src_rgb: BlendFactor::One,
            src_alpha: BlendFactor::One,
            dst_rgb: BlendFactor::Zero,
            dst_alpha: BlendFactor::Zero,
        }
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::alpha()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorChannelMask {
    pub r: bool,
    pub g: bool,
    pub b: bool,
    pub a: bool,
}

impl ColorChannelMask {
    pub const ALL: ColorChannelMask = ColorChannelMask { r: true, g: true, b: true, a: true };

    pub fn to_vk(self) -> vk::ColorComponentFlags {
        let mut flags = vk::ColorComponentFlags::empty();
        if self.r {
            flags |= vk::ColorComponentFlags::R;
        }
        if self.g {
            flags |= vk::ColorComponentFlags::G;
        }
        if self.b {
            flags |= vk::ColorComponentFlags::B;
        }
        if self.a {
            flags |= vk::ColorComponentFlags::A;
        }
        flags
    }
}

impl Default for ColorChannelMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Scissor rectangle in pixels, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl ScissorRect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// One entry of the render state stack
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderState {
    pub color: Color,
    pub blend: BlendState,
    pub winding: Winding,
    pub scissor: Option<ScissorRect>,
    pub color_mask: ColorChannelMask,
    pub point_size: f32,
    pub wireframe: bool,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            color: Color::WHITE,
            blend: BlendState::default(),
            winding: Winding::default(),
            scissor: None,
            color_mask: ColorChannelMask::ALL,
            point_size: 1.0,
            wireframe: false,
        }
    }
}

impl RenderState {
    /// True when switching from `self` to `other` changes pipeline-affecting
    /// state, meaning draws buffered under `self` must be flushed first.
    ///
    /// Color is not part of this: it travels in the uniform block.
    pub fn requires_flush(&self, other: &RenderState) -> bool {
        self.blend != other.blend
            || self.winding != other.winding
            || self.scissor != other.scissor
            || self.color_mask != other.color_mask
            || self.point_size != other.point_size
            || self.wireframe != other.wireframe
    }
}

/// Stack of render state snapshots. Never empty.
#[derive(Debug, Clone)]
pub struct StateStack {
    states: Vec<RenderState>,
}

impl Default for StateStack {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStack {
    pub fn new() -> Self {
        Self {
            states: vec![RenderState::default()],
        }
    }

    pub fn top(&self) -> &RenderState {
        // The base entry is never popped.
        &self.states[self.states.len() - 1]
    }

    pub fn top_mut(&mut self) -> &mut RenderState {
        let last = self.states.len() - 1;
        &mut self.states[last]
    }

    /// Entry that becomes active after the next pop, if a pop is allowed
    pub fn below_top(&self) -> Option<&RenderState> {
        if self.states.len() < 2 {
            return None;
        }
        self.states.get(self.states.len() - 2)
    }

    /// Number of user pushes currently on the stack
    pub fn depth(&self) -> usize {
        self.states.len() - 1
    }

    /// Duplicate the active snapshot
    pub fn push(&mut self) -> Result<()> {
        if self.depth() >= MAX_USER_STACK_DEPTH {
            bail!("Maximum stack depth reached (more pushes than pops?)");
        }
        let top = *self.top();
        self.states.push(top);
        Ok(())
    }

    /// Discard the active snapshot, returning it
    pub fn pop(&mut self) -> Result<RenderState> {
        if self.depth() == 0 {
            bail!("Minimum stack depth reached (more pops than pushes?)");
        }
        self.states
            .pop()
            .ok_or_else(|| anyhow::anyhow!("render state stack is empty"))
    }

    /// Drop all user pushes and reset the base entry
    pub fn reset(&mut self) {
        self.states.clear();
        self.states.push(RenderState::default());
    }
}
